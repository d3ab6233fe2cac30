use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::Statistics;
use crate::query::ast::{Operator, Query, SimpleQuery};
use crate::query::options::Options;
use crate::search::aggs::Aggregations;
use crate::search::backend::{Backend, BackendCall};
use crate::search::reader::{RecordOptions, TailConfig, TailPaths, TailReaders};
use crate::search::result::{CancelToken, ResultSink};
use crate::search::store::{DrainOptions, ResultStore};
use crate::search::transform::{Transform, parse_chain};
use crate::storage::layout::{ScratchLayout, detect_extension};

/// Separates records of intermediate DATA files
pub const INTERMEDIATE_DELIMITER: &str = "\n\x0c\n";

/// One search as the caller describes it
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub files: Vec<String>,         // relative to the home directory
    pub options: Options,           // base options of every predicate
    pub delimiter: String,          // between records of the result DATA
    pub limit: u64,                 // 0 for no limit
    pub backend_tool: String,
    pub backend_mode: String,
    pub keep_data_as: String,
    pub keep_index_as: String,
    pub keep_view_as: String,
    pub transforms: Vec<String>,    // post-processing rules, in order
    pub aggregations: Value,        // null for none
}

/// DATA/INDEX pair produced by a backend call
#[derive(Debug, Clone)]
struct Output {
    data: PathBuf,
    index: PathBuf,
    delimiter: String,
    width: i32,
}

/// Runs optimized query trees against a backend
pub struct Scheduler {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    layout: ScratchLayout,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, backend: Arc<dyn Backend>) -> Result<Self> {
        let layout = ScratchLayout::new(config.instance_dir())?;
        Ok(Scheduler { config, backend, layout })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> &str {
        self.backend.host()
    }

    /// Execute an optimized tree, records go to `sink`.
    ///
    /// Transformations and aggregations need every record to pass the
    /// final drain, so a single predicate with either of them runs the
    /// same way a boolean tree does.
    pub fn run(&self, query: &Query, req: &SearchRequest, sink: &ResultSink, cancel: &CancelToken) -> Result<Statistics> {
        let ext = detect_extension(&req.files, &req.keep_data_as)?;
        let transforms = parse_chain(&req.transforms, &self.config.post_proc_scripts)?;
        let aggs = Aggregations::parse(&req.aggregations)?;
        let files: Vec<String> = req.files.iter().map(|f| self.resolve(f)).collect();
        let mut task = Task {
            sched: self,
            req,
            sink,
            cancel,
            id: format!("dec-{:08x}", Uuid::new_v4().as_u128() as u32),
            ext,
            step: 0,
            store: ResultStore::new(),
            scratch: Scratch {
                files: Vec::new(),
                keep: self.config.backend.keep_files,
            },
            transforms,
            aggs,
        };

        let query = strip_groups(query);
        info!("[{}]: running {} ({} backend calls)", task.id, query, query.leaf_count());
        let post = !task.transforms.is_empty() || task.aggs.is_some();
        let mut stat = match &query.simple {
            Some(simple) if !post => task.search(simple, &files)?,
            _ => task.compound(query, &files)?,
        };
        if let Some(aggs) = &task.aggs {
            stat.aggregations = aggs.states();
        }
        stat.host = self.host().to_string();
        info!("[{}]: done with {} matches", task.id, stat.matches);
        Ok(stat)
    }

    fn resolve(&self, path: &str) -> String {
        let home = &self.config.home_dir;
        if home.is_empty() || Path::new(path).is_absolute() {
            return path.to_string();
        }
        Path::new(home).join(path).to_string_lossy().into_owned()
    }

    fn resolve_opt(&self, path: &str) -> Option<PathBuf> {
        (!path.is_empty()).then(|| PathBuf::from(self.resolve(path)))
    }
}

// single-child (...) groups carry nothing
fn strip_groups(q: &Query) -> &Query {
    let mut q = q;
    while q.operator == Some(Operator::P) && q.simple.is_none() && q.arguments.len() == 1 {
        q = &q.arguments[0];
    }
    q
}

fn compile_filter(filter: &str) -> Result<Option<Regex>> {
    if filter.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(filter)?))
}

/// Scratch files of one request, removed on drop
struct Scratch {
    files: Vec<PathBuf>,
    keep: bool,
}

impl Scratch {
    fn track(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if self.keep {
            debug!("keeping {} scratch files", self.files.len());
            return;
        }
        for path in &self.files {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

struct Task<'a> {
    sched: &'a Scheduler,
    req: &'a SearchRequest,
    sink: &'a ResultSink,
    cancel: &'a CancelToken,
    id: String,
    ext: String,
    step: usize,
    store: ResultStore,
    scratch: Scratch,
    transforms: Vec<Transform>,
    aggs: Option<Aggregations>,
}

impl Task<'_> {
    fn call(&self, simple: &SimpleQuery, files: &[String], delimiter: &str) -> BackendCall {
        let cfg = &self.sched.config.backend;
        let mut call = BackendCall::from_leaf(simple, cfg.legacy_expressions);
        call.files = files.to_vec();
        call.nodes = cfg.nodes;
        call.delimiter = delimiter.to_string();
        call.backend_tool = if self.req.backend_tool.is_empty() {
            cfg.tool.clone()
        } else {
            self.req.backend_tool.clone()
        };
        call.backend_mode = self.req.backend_mode.clone();
        call
    }

    /// A single predicate: tail the backend output straight to the sink
    fn search(&mut self, simple: &SimpleQuery, files: &[String]) -> Result<Statistics> {
        self.step += 1;
        let sched = self.sched;
        let mut call = self.call(simple, files, &self.req.delimiter);

        call.data_path = match sched.resolve_opt(&self.req.keep_data_as) {
            Some(path) => path,
            None => sched.layout.data_path(&self.id, self.step, &self.ext),
        };
        call.index_path = match sched.resolve_opt(&self.req.keep_index_as) {
            Some(path) => path,
            None => sched.layout.index_path(&self.id, self.step),
        };
        if self.req.keep_data_as.is_empty() {
            self.scratch.track(&call.data_path);
        }
        if self.req.keep_index_as.is_empty() {
            self.scratch.track(&call.index_path);
        }

        let filter = if simple.options.file_filter.is_empty() {
            &self.req.options.file_filter
        } else {
            &simple.options.file_filter
        };
        let opts = RecordOptions {
            home: sched.config.home_dir.clone(),
            host: sched.host().to_string(),
            file_filter: compile_filter(filter)?,
            limit: self.req.limit,
        };
        let paths = TailPaths {
            index: call.index_path.clone(),
            data: call.data_path.clone(),
            view: sched.resolve_opt(&self.req.keep_view_as),
        };

        debug!("[{}/{}]: search {:?} in {:?}", self.id, self.step, call.query, call.files);
        let readers = TailReaders::start(
            paths,
            &call.delimiter,
            TailConfig::from_backend(&sched.config.backend),
            opts,
            self.sink.clone(),
            self.cancel,
        );

        match sched.backend.run(&call, self.cancel) {
            Ok(stat) => {
                let summary = readers.finish()?;
                debug!("[{}/{}]: {} indexes, {} records", self.id, self.step, summary.indexes, summary.records);
                Ok(stat)
            }
            Err(e) => {
                readers.cancel();
                if let Err(re) = readers.finish() {
                    debug!("[{}/{}]: readers stopped: {}", self.id, self.step, re);
                }
                Err(e)
            }
        }
    }

    /// A boolean tree: run every leaf in count mode, then unwind the
    /// final outputs through the store.
    fn compound(&mut self, q: &Query, files: &[String]) -> Result<Statistics> {
        let delimiter = self.req.delimiter.clone();
        let (mut stat, outputs) = self.walk(q, files, &delimiter, false)?;

        for out in &outputs {
            self.store.add(&out.data, &out.index, &out.delimiter, out.width, true)?;
        }

        let sched = self.sched;
        let opts = DrainOptions {
            home: sched.config.home_dir.clone(),
            host: sched.host().to_string(),
            file_filter: compile_filter(&self.req.options.file_filter)?,
            limit: self.req.limit,
            delimiter,
            keep_data_as: sched.resolve_opt(&self.req.keep_data_as),
            keep_index_as: sched.resolve_opt(&self.req.keep_index_as),
            keep_view_as: sched.resolve_opt(&self.req.keep_view_as),
            transforms: self.transforms.clone(),
        };
        stat.matches = self.store.drain_final(&opts, self.aggs.as_mut(), self.sink, self.cancel)?;
        Ok(stat)
    }

    fn walk(&mut self, q: &Query, files: &[String], delimiter: &str, intermediate: bool) -> Result<(Statistics, Vec<Output>)> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        if let Some(simple) = &q.simple {
            return self.leaf(simple, files, delimiter, intermediate);
        }

        match q.operator {
            Some(Operator::And) => self.and(&q.arguments, files, delimiter, intermediate),
            Some(Operator::Or) => self.or(&q.arguments, files, delimiter, intermediate),
            Some(Operator::Xor) => Err(Error::new(
                ErrorKind::NotImplemented,
                "XOR is not implemented yet".to_string(),
            )),
            Some(Operator::P | Operator::B | Operator::S) if q.arguments.len() == 1 => {
                self.walk(&q.arguments[0], files, delimiter, intermediate)
            }
            op => Err(Error::new(
                ErrorKind::Internal,
                format!("unexpected {:?} node with {} arguments", op, q.arguments.len()),
            )),
        }
    }

    fn leaf(&mut self, simple: &SimpleQuery, files: &[String], delimiter: &str, intermediate: bool) -> Result<(Statistics, Vec<Output>)> {
        self.step += 1;
        let mut call = self.call(simple, files, delimiter);
        call.data_path = self.sched.layout.data_path(&self.id, self.step, &self.ext);
        call.index_path = self.sched.layout.index_path(&self.id, self.step);
        call.count_only = true;
        if intermediate && simple.structured {
            // keep record boundaries for the next stage
            call.width = 0;
        }
        self.scratch.track(&call.data_path);
        self.scratch.track(&call.index_path);

        debug!("[{}/{}]: count {:?} in {:?}", self.id, self.step, call.query, call.files);
        let stat = self.sched.backend.run(&call, self.cancel)?;
        let out = Output {
            data: call.data_path,
            index: call.index_path,
            delimiter: call.delimiter,
            width: call.width,
        };
        Ok((stat, vec![out]))
    }

    // each stage searches the DATA of the previous one
    fn and(&mut self, args: &[Query], files: &[String], delimiter: &str, intermediate: bool) -> Result<(Statistics, Vec<Output>)> {
        let mut total = Statistics::default();
        let mut files = files.to_vec();

        for (i, arg) in args.iter().enumerate() {
            let last = i + 1 == args.len();
            let (stat, outputs) = if last {
                self.walk(arg, &files, delimiter, intermediate)?
            } else {
                self.walk(arg, &files, INTERMEDIATE_DELIMITER, true)?
            };
            total.chain(&stat);
            if last {
                return Ok((total, outputs));
            }

            for out in &outputs {
                self.store.add(&out.data, &out.index, &out.delimiter, out.width, false)?;
            }
            if stat.matches == 0 {
                debug!("[{}]: AND stage {} found nothing", self.id, i);
                return Ok((total, Vec::new()));
            }
            files = outputs
                .iter()
                .map(|out| out.data.to_string_lossy().into_owned())
                .collect();
        }
        Ok((total, Vec::new()))
    }

    fn or(&mut self, args: &[Query], files: &[String], delimiter: &str, intermediate: bool) -> Result<(Statistics, Vec<Output>)> {
        let mut total = Statistics::default();
        let mut outputs = Vec::new();

        for arg in args {
            match self.walk(arg, files, delimiter, intermediate) {
                Ok((stat, out)) => {
                    total.combine(&stat);
                    outputs.extend(out);
                }
                Err(e) if matches!(e.kind, ErrorKind::Io | ErrorKind::Backend | ErrorKind::Format) => {
                    warn!("[{}]: OR branch failed: {}", self.id, e);
                    self.sink.error(&e, self.sched.host());
                }
                Err(e) => return Err(e),
            }
        }
        Ok((total, outputs))
    }
}
