#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use parking_lot::Mutex;
use regex::Regex;
use ryftgate::core::config::Config;
use ryftgate::core::error::Result;
use ryftgate::core::stats::Statistics;
use ryftgate::core::types::Index;
use ryftgate::search::backend::{Backend, BackendCall};
use ryftgate::search::result::CancelToken;
use ryftgate::search::scheduler::Scheduler;

pub const BODY: &str = "\n11111-hello-11111\n22222-hello-22222\n33333-hello-33333\n44444-hello-44444\n55555-hello-55555\n";

static PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"EXACT\("([^"]*)""#).unwrap());

/// Plain substring search writing real INDEX/DATA files.
///
/// Every `EXACT("..")` of the expression is searched, so fused OR
/// expressions return the union of their parts. RECORD expressions
/// treat each line as a record and report it whole; a fused AND needs
/// every part in the same record. Field names are ignored.
pub struct SubstringBackend {
    pub calls: Mutex<Vec<BackendCall>>,
    pub host: String,
}

impl SubstringBackend {
    pub fn new(host: &str) -> Arc<Self> {
        Arc::new(SubstringBackend {
            calls: Mutex::new(Vec::new()),
            host: host.to_string(),
        })
    }
}

fn window(text: &[u8], pos: usize, len: usize, width: i32) -> (usize, usize) {
    if width < 0 {
        let beg = text[..pos].iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
        let end = text[pos..].iter().position(|&b| b == b'\n').map_or(text.len(), |p| pos + p);
        return (beg, end);
    }
    let w = width as usize;
    (pos.saturating_sub(w), (pos + len + w).min(text.len()))
}

fn text_hits(text: &[u8], patterns: &[String], width: i32) -> Vec<(usize, usize)> {
    let hay = String::from_utf8_lossy(text);
    let mut found = Vec::new();
    for (n, pat) in patterns.iter().enumerate() {
        for (pos, _) in hay.match_indices(pat.as_str()) {
            found.push((pos, n, pat.len()));
        }
    }
    found.sort();
    found
        .into_iter()
        .map(|(pos, _, len)| window(text, pos, len, width))
        .collect()
}

fn record_hits(text: &[u8], patterns: &[String], all: bool) -> Vec<(usize, usize)> {
    let mut hits = Vec::new();
    let mut beg = 0;
    for line in text.split(|&b| b == b'\n') {
        let rec = String::from_utf8_lossy(line);
        let hit = if all {
            patterns.iter().all(|p| rec.contains(p.as_str()))
        } else {
            patterns.iter().any(|p| rec.contains(p.as_str()))
        };
        if hit {
            hits.push((beg, beg + line.len()));
        }
        beg += line.len() + 1;
    }
    hits
}

impl Backend for SubstringBackend {
    fn run(&self, call: &BackendCall, _cancel: &CancelToken) -> Result<Statistics> {
        self.calls.lock().push(call.clone());
        let patterns: Vec<String> = PATTERN
            .captures_iter(&call.query)
            .map(|c| c[1].to_string())
            .collect();
        let structured = call.query.contains("RECORD");
        let all = call.query.contains(") AND (");

        let mut data = File::create(&call.data_path)?;
        let mut index = File::create(&call.index_path)?;
        let mut matches = 0;
        let mut total = 0;
        for file in &call.files {
            let text = fs::read(file)?;
            total += text.len() as u64;

            let hits = if structured {
                record_hits(&text, &patterns, all)
            } else {
                text_hits(&text, &patterns, call.width)
            };
            for (beg, end) in hits {
                data.write_all(&text[beg..end])?;
                data.write_all(call.delimiter.as_bytes())?;
                data.flush()?;
                index.write_all(Index::new(file.as_str(), beg as u64, (end - beg) as u64, 0).to_line().as_bytes())?;
                index.flush()?;
                matches += 1;
            }
        }

        let mut stat = Statistics::new(matches, total, 1, 1);
        stat.host = self.host.clone();
        Ok(stat)
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Scratch home with `1.txt` holding the five hello lines
pub fn setup(dir: &Path, combine_limit: i32) -> (Arc<Config>, Arc<SubstringBackend>, Arc<Scheduler>) {
    fs::write(dir.join("1.txt"), BODY).unwrap();
    let mut config = Config {
        instance_home: dir.join("instance"),
        home_dir: dir.to_string_lossy().into_owned(),
        ..Config::default()
    };
    config.optimizer.combine_limit = combine_limit;
    config.backend.open_poll_ms = 5;
    config.backend.read_poll_ms = 5;

    let config = Arc::new(config);
    let backend = SubstringBackend::new("node-1");
    let scheduler = Arc::new(Scheduler::new(config.clone(), backend.clone()).unwrap());
    (config, backend, scheduler)
}
