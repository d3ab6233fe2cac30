use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;
use rand::seq::SliceRandom;
use serde::{Serialize, Deserialize};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::Statistics;
use crate::search::result::{CancelToken, ResultSink, ResultStream, SearchEvent, result_channel};
use crate::search::scheduler::{Scheduler, SearchRequest};

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// A service instance as the directory advertises it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceNode {
    pub node: String,
    pub address: String,
    pub port: u16,              // 0 for the default port
    pub tags: Vec<String>,
}

/// Source of partition rules, busyness metrics and peer nodes
pub trait ServiceDirectory: Send + Sync {
    /// All `(key, value)` pairs under `prefix`
    fn list_kv(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    fn services(&self, name: &str) -> Result<Vec<ServiceNode>>;
}

/// Directory loaded from the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticDirectory {
    pub kv: BTreeMap<String, String>,
    pub services: BTreeMap<String, Vec<ServiceNode>>,
}

impl ServiceDirectory for StaticDirectory {
    fn list_kv(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn services(&self, name: &str) -> Result<Vec<ServiceNode>> {
        Ok(self.services.get(name).cloned().unwrap_or_default())
    }
}

/// File masks of one tenant and the node tags serving them.
///
/// Masks are compiled once per directory pull and reused for the
/// whole file list.
pub struct PartitionMap {
    rules: Vec<(glob::Pattern, Vec<String>)>,
}

impl PartitionMap {
    pub fn load(directory: &dyn ServiceDirectory, tenant: &str) -> Result<Self> {
        let prefix = if tenant.is_empty() {
            "partitions/".to_string()
        } else {
            format!("partitions/{}/", tenant)
        };

        let mut rules = Vec::new();
        for (key, value) in directory.list_kv(&prefix)? {
            let mask = &key[prefix.len()..];
            let tags: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if mask.is_empty() || tags.is_empty() {
                continue;
            }

            let pattern = glob::Pattern::new(mask)
                .map_err(|e| Error::option(format!("bad partition mask {:?}: {}", mask, e)))?;
            rules.push((pattern, tags));
        }
        debug!("partition map for {:?}: {} rules", tenant, rules.len());
        Ok(PartitionMap { rules })
    }

    /// Tags needed to cover `files`, with the number of files per tag.
    ///
    /// A file takes the tags of every rule it matches, each tag counted
    /// once per file. Empty when any file matches no rule: every node
    /// has to search.
    pub fn tags(&self, files: &[String]) -> BTreeMap<String, usize> {
        let mut found = BTreeMap::new();
        for file in files {
            // masks never start with '/'
            let file = Path::new(file).strip_prefix("/").unwrap_or(Path::new(file));
            let tags: BTreeSet<&String> = self
                .rules
                .iter()
                .filter(|(pattern, _)| pattern.matches_path(file))
                .flat_map(|(_, tags)| tags)
                .collect();
            if tags.is_empty() {
                debug!("no partition for {}, searching all nodes", file.display());
                return BTreeMap::new();
            }
            for tag in tags {
                *found.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        found
    }
}

/// Busyness of every node from the `busyness/<node>` keys, an
/// unreadable value counts as idle.
pub fn load_metrics(directory: &dyn ServiceDirectory) -> Result<BTreeMap<String, i64>> {
    let prefix = "busyness/";
    let mut metrics = BTreeMap::new();
    for (key, value) in directory.list_kv(prefix)? {
        let metric = value.trim().parse::<i64>().unwrap_or_else(|e| {
            debug!("bad busyness metric {:?} for {}: {}", value, key, e);
            0
        });
        metrics.insert(key[prefix.len()..].to_string(), metric);
    }
    Ok(metrics)
}

/// Order nodes from idle to busy.
///
/// Metrics are grouped by `tolerance + 1`, nodes of one group count as
/// equally busy. Within a group the local node goes first and the
/// remote ones are shuffled to spread the load.
pub fn rearrange<F>(services: Vec<ServiceNode>, metrics: &BTreeMap<String, i64>, tolerance: i32, is_local: F) -> Vec<ServiceNode>
where
    F: Fn(&ServiceNode) -> bool,
{
    let size = tolerance.max(0) as i64 + 1;
    let mut groups: BTreeMap<i64, (Vec<ServiceNode>, Vec<ServiceNode>)> = BTreeMap::new();
    for service in services {
        let metric = metrics.get(&service.node).copied().unwrap_or(0);
        let group = groups.entry(metric / size).or_default();
        if is_local(&service) {
            group.0.push(service);
        } else {
            group.1.push(service);
        }
    }

    let mut rng = rand::thread_rng();
    groups
        .into_values()
        .flat_map(|(mut local, mut remote)| {
            remote.shuffle(&mut rng);
            local.append(&mut remote);
            local
        })
        .collect()
}

/// Where one part of a federated search runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    Local { node: String },
    Remote { node: String, url: String },
}

/// Fans a search out to the nodes holding the requested files and
/// multiplexes their records into one stream.
pub struct Coordinator {
    config: Arc<Config>,
    directory: Arc<dyn ServiceDirectory>,
    local: Arc<Scheduler>,
    client: reqwest::Client,
    runtime: Runtime,
    active: AtomicI64,          // searches running through this node
}

impl Coordinator {
    pub fn new(config: Arc<Config>, directory: Arc<dyn ServiceDirectory>, local: Arc<Scheduler>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        Ok(Coordinator {
            config,
            directory,
            local,
            client: reqwest::Client::new(),
            runtime,
            active: AtomicI64::new(0),
        })
    }

    fn is_local(&self, node: &ServiceNode) -> bool {
        node.address == self.config.local_host && self.port(node) == self.config.listen_port
    }

    fn port(&self, node: &ServiceNode) -> u16 {
        if node.port == 0 { self.config.federation.default_port } else { node.port }
    }

    /// Choose the nodes for `files`.
    ///
    /// Nodes are tried from idle to busy. Without partition rules every
    /// advertised node searches; with rules a node is used only while
    /// it still covers a missing tag.
    pub fn plan(&self, files: &[String]) -> Result<Vec<Branch>> {
        let fed = &self.config.federation;
        let mut metrics = load_metrics(self.directory.as_ref())?;
        let services: Vec<ServiceNode> = self.directory.services(&fed.service_name)?;
        // our own load is known first hand
        let active = self.active.load(Ordering::SeqCst);
        for service in services.iter().filter(|s| self.is_local(s)) {
            metrics.insert(service.node.clone(), active);
        }
        let services = rearrange(services, &metrics, fed.busyness_tolerance, |s| self.is_local(s));
        let tags = if files.is_empty() {
            BTreeMap::new()
        } else {
            PartitionMap::load(self.directory.as_ref(), &fed.tenant)?.tags(files)
        };

        let all_nodes = tags.is_empty();
        let mut required: BTreeSet<String> = tags.into_keys().collect();
        let mut branches = Vec::new();
        for service in &services {
            if !all_nodes && required.is_empty() {
                break;
            }
            if !all_nodes {
                let before = required.len();
                required.retain(|t| !service.tags.contains(t));
                if required.len() == before {
                    continue;
                }
            }

            if self.is_local(service) {
                branches.push(Branch::Local { node: service.node.clone() });
            } else {
                let url = format!("http://{}:{}", service.address, self.port(service));
                branches.push(Branch::Remote { node: service.node.clone(), url });
            }
        }

        if !all_nodes && !required.is_empty() {
            return Err(Error::new(
                ErrorKind::Backend,
                format!("no services found for tags: {:?}", required),
            ));
        }
        if branches.is_empty() {
            debug!("no services found, searching locally");
            branches.push(Branch::Local { node: String::new() });
        }
        Ok(branches)
    }

    /// Run the search on every planned node.
    ///
    /// A failed node is reported as an error record and the others go
    /// on. The returned statistic sums matches over all nodes.
    pub fn run(&self, req: &SearchRequest, sink: &ResultSink, cancel: &CancelToken) -> Result<Statistics> {
        let branches = self.plan(&req.files)?;
        let _active = ActiveGuard::enter(&self.active);
        info!("federated search on {} nodes: {:?}", branches.len(), branches);

        let results: Vec<(String, Result<Statistics>)> = thread::scope(|s| {
            let handles: Vec<_> = branches
                .iter()
                .map(|branch| {
                    s.spawn(move || match branch {
                        Branch::Local { node } => {
                            let host = if node.is_empty() { self.local.host() } else { node.as_str() };
                            (host.to_string(), crate::search::execute(&self.local, req, sink, cancel))
                        }
                        Branch::Remote { url, .. } => {
                            let res = self.runtime.block_on(remote_search(&self.client, url, req, sink, cancel));
                            (url.clone(), res)
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        (String::new(), Err(Error::new(ErrorKind::Internal, "branch panicked".to_string())))
                    })
                })
                .collect()
        });

        // a single node reports its own failure
        if let [(host, res)] = results.as_slice() {
            return res.clone().map(|mut stat| {
                if stat.host.is_empty() {
                    stat.host = host.clone();
                }
                stat
            });
        }

        let mut total = Statistics::default();
        for (host, res) in results {
            match res {
                Ok(mut stat) => {
                    if stat.host.is_empty() {
                        stat.host = host;
                    }
                    total.combine(&stat);
                }
                Err(e) if e.kind == ErrorKind::Cancelled => {}
                Err(e) => {
                    warn!("search on {} failed: {}", host, e);
                    sink.error(&e, &host);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        Ok(total)
    }

    /// Start a federated search in the background
    pub fn search(self: &Arc<Self>, req: SearchRequest) -> ResultStream {
        let cancel = CancelToken::new();
        let (sink, stream) = result_channel(cancel.clone());
        let this = Arc::clone(self);
        thread::spawn(move || {
            match this.run(&req, &sink, &cancel) {
                Ok(stat) => sink.stat(stat),
                Err(e) => sink.error(&e, ""),
            };
        });
        stream
    }
}

struct ActiveGuard<'a>(&'a AtomicI64);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicI64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn query_params(req: &SearchRequest) -> Vec<(&'static str, String)> {
    let opts = &req.options;
    let mut params = vec![("query", req.query.clone())];
    for file in &req.files {
        params.push(("file", file.clone()));
    }
    if let Some(mode) = opts.mode {
        params.push(("mode", mode.as_str().to_string()));
    }
    params.push(("cs", opts.case.to_string()));
    params.push((
        "surrounding",
        if opts.width < 0 { "line".to_string() } else { opts.width.to_string() },
    ));
    params.push(("fuzziness", opts.dist.to_string()));
    if req.limit > 0 {
        params.push(("limit", req.limit.to_string()));
    }
    for rule in &req.transforms {
        params.push(("transform", rule.clone()));
    }
    if !req.aggregations.is_null() {
        params.push(("aggs", req.aggregations.to_string()));
    }
    for (key, value) in [("local", "true"), ("stats", "true"), ("stream", "true"), ("format", "raw")] {
        params.push((key, value.to_string()));
    }
    params
}

/// Run `req` on a peer and forward its events.
///
/// The peer answers with one JSON event per line.
async fn remote_search(
    client: &reqwest::Client,
    url: &str,
    req: &SearchRequest,
    sink: &ResultSink,
    cancel: &CancelToken,
) -> Result<Statistics> {
    debug!("remote search on {}", url);
    let mut resp = client
        .get(format!("{}/search", url))
        .query(&query_params(req))
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.bytes().await.unwrap_or_default();
        return Err(Error::new(
            ErrorKind::Backend,
            format!("{} answered {}: {}", url, status, String::from_utf8_lossy(&body).trim()),
        ));
    }

    let mut stat: Option<Statistics> = None;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let chunk = match tokio::time::timeout(CANCEL_POLL, resp.chunk()).await {
            Ok(chunk) => chunk?,
            Err(_) => continue,
        };
        let Some(chunk) = chunk else { break };

        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            forward(&line, url, sink, &mut stat)?;
        }
    }
    forward(&buf, url, sink, &mut stat)?;

    let mut stat = stat.unwrap_or_default();
    stat.host = url.to_string();
    Ok(stat)
}

fn forward(line: &[u8], host: &str, sink: &ResultSink, stat: &mut Option<Statistics>) -> Result<()> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }

    let event: SearchEvent = serde_json::from_slice(line)
        .map_err(|e| Error::format(format!("bad event from {}: {}", host, e)))?;
    let delivered = match event {
        SearchEvent::Record(mut rec) => {
            rec.index.update_host(host);
            sink.record(rec)
        }
        SearchEvent::Error(mut err) => {
            if err.host.is_empty() {
                err.host = host.to_string();
            }
            sink.send(SearchEvent::Error(err))
        }
        SearchEvent::Stat(s) => {
            match stat.as_mut() {
                Some(total) => total.combine(&s),
                None => *stat = Some(s),
            }
            true
        }
    };
    if delivered { Ok(()) } else { Err(Error::cancelled()) }
}
