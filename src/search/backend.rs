use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::Statistics;
use crate::query::ast::SimpleQuery;
use crate::query::options::Mode;
use crate::search::result::CancelToken;
use crate::search::tweaks::Tweaks;

const EXIT_POLL: Duration = Duration::from_millis(50);

/// One backend invocation for a leaf predicate
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub mode: Mode,
    pub query: String,
    pub files: Vec<String>,
    pub data_path: PathBuf,
    pub index_path: PathBuf,
    pub width: i32,                 // negative for whole line
    pub dist: u32,
    pub case: bool,
    pub reduce: bool,
    pub nodes: u32,
    pub delimiter: String,
    pub backend_tool: String,       // empty to auto-select
    pub backend_mode: String,       // tweaks key prefix
    /// Nobody tails the output while the call runs. The command line
    /// is the same: outputs still feed the result store.
    pub count_only: bool,
}

impl BackendCall {
    pub fn from_leaf(simple: &SimpleQuery, legacy: bool) -> Self {
        let opts = &simple.options;
        BackendCall {
            mode: opts.mode.unwrap_or(Mode::Es),
            query: if legacy { simple.expr_old.clone() } else { simple.expr_new.clone() },
            files: Vec::new(),
            data_path: PathBuf::new(),
            index_path: PathBuf::new(),
            width: opts.width,
            dist: opts.dist,
            case: opts.case,
            reduce: opts.reduce,
            nodes: 0,
            delimiter: String::new(),
            backend_tool: String::new(),
            backend_mode: String::new(),
            count_only: false,
        }
    }
}

/// Something that runs a primitive search and writes INDEX/DATA files.
///
/// `run` blocks until the output files are complete or `cancel` fires.
pub trait Backend: Send + Sync {
    fn run(&self, call: &BackendCall, cancel: &CancelToken) -> Result<Statistics>;

    /// Node name reported in records and statistics
    fn host(&self) -> &str {
        ""
    }
}

/// Runs the `ryftprim` family of command line tools
pub struct RyftprimBackend {
    pub tweaks: Tweaks,
    pub host: String,
}

impl RyftprimBackend {
    pub fn new(tweaks: Tweaks, host: impl Into<String>) -> Self {
        RyftprimBackend { tweaks, host: host.into() }
    }

    /// Command line for `call`: the program followed by its arguments
    pub fn command_line(&self, call: &BackendCall) -> Result<Vec<String>> {
        let tool = self.tweaks.select_tool(&call.backend_tool, call.mode, call.dist)?;
        let mut argv = self.tweaks.exec_argv(&tool);

        argv.extend(["-p".to_string(), call.mode.to_string()]);
        argv.extend(["-q".to_string(), call.query.clone()]);
        for file in &call.files {
            argv.extend(["-f".to_string(), file.clone()]);
        }
        argv.extend(["-od".to_string(), call.data_path.to_string_lossy().into_owned()]);
        argv.extend(["-oi".to_string(), call.index_path.to_string_lossy().into_owned()]);

        if call.width < 0 {
            argv.push("--line".to_string());
        } else if call.width > 0 {
            argv.extend(["-w".to_string(), call.width.to_string()]);
        }
        if call.nodes > 0 {
            argv.extend(["-n".to_string(), call.nodes.to_string()]);
        }
        if !call.case {
            argv.push("-i".to_string());
        }
        if call.dist > 0 {
            argv.extend(["-d".to_string(), call.dist.to_string()]);
        }
        if call.reduce && call.mode == Mode::Feds {
            argv.push("-r".to_string());
        }
        argv.extend(["-e".to_string(), call.delimiter.clone()]);
        argv.push("-v".to_string());

        if let Some(extra) = self.tweaks.get_options(&call.backend_mode, &tool, call.mode.as_str()) {
            argv.extend(extra.iter().cloned());
        }
        Ok(argv)
    }
}

impl Backend for RyftprimBackend {
    fn run(&self, call: &BackendCall, cancel: &CancelToken) -> Result<Statistics> {
        let argv = self.command_line(call)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::option("empty backend command line"))?;

        remove_stale(&call.index_path)?;
        remove_stale(&call.data_path)?;

        info!(
            "starting {} ({}): {:?}",
            program,
            if call.count_only { "count" } else { "search" },
            args
        );
        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::new(ErrorKind::Io, format!("failed to start {}: {}", program, e)))?;

        let stdout = collect(child.stdout.take());
        let stderr = collect(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.wait(EXIT_POLL) {
                kill(&mut child, program);
                return Err(Error::cancelled());
            }
        };

        let mut output = join_output(stdout);
        output.push_str(&join_output(stderr));
        debug!("{} finished in {:?} with {}", program, start.elapsed(), status);

        if !status.success() {
            return Err(Error::new(
                ErrorKind::Backend,
                format!("{} failed with {}: {}", program, status, output.trim()),
            ));
        }

        let mut stat = parse_stats(&output)?;
        stat.host = self.host.clone();
        Ok(stat)
    }

    fn host(&self) -> &str {
        &self.host
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::new(
            ErrorKind::Io,
            format!("failed to remove old {}: {}", path.display(), e),
        )),
    }
}

fn collect<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!("failed to read tool output: {}", e);
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn kill(child: &mut Child, program: &str) {
    warn!("cancelling {} (pid {})", program, child.id());
    if let Err(e) = child.kill() {
        warn!("failed to kill {}: {}", program, e);
    }
    if let Err(e) = child.wait() {
        debug!("failed to reap {}: {}", program, e);
    }
}

/// Statistics from the verbose tool output.
///
/// Only `Duration`, `Total Bytes`, `Matches` and `Fabric Data Rate`
/// lines are used, everything else is ignored.
pub fn parse_stats(output: &str) -> Result<Statistics> {
    let number = |name: &str| -> Result<u64> {
        stat_field(output, name)
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| Error::new(ErrorKind::Backend, format!("failed to parse {:?} stat", name)))
    };

    let duration = number("Duration")?;
    let total_bytes = number("Total Bytes")?;
    let matches = number("Matches")?;
    let rate = stat_field(output, "Fabric Data Rate")
        .ok_or_else(|| Error::new(ErrorKind::Backend, "failed to parse \"Fabric Data Rate\" stat".to_string()))?;

    let mut stat = Statistics::new(matches, total_bytes, duration, 0);
    stat.fabric_data_rate = parse_data_rate(rate)?;
    Ok(stat)
}

fn stat_field<'a>(output: &'a str, name: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == name).then(|| value.trim())
    })
}

/// Data rate in MB/sec; `inf` and `nan` mean zero duration and read as 0.
pub fn parse_data_rate(s: &str) -> Result<f64> {
    let mut s = s.trim();
    let mut scale = 1.0;
    if let Some(t) = s.strip_suffix("KB/sec") {
        scale /= 1024.0;
        s = t;
    } else if let Some(t) = s.strip_suffix("MB/sec") {
        s = t;
    } else if let Some(t) = s.strip_suffix("GB/sec") {
        scale *= 1024.0;
        s = t;
    }

    let rate: f64 = s
        .trim()
        .parse()
        .map_err(|_| Error::new(ErrorKind::Backend, format!("failed to parse data rate from {:?}", s)))?;
    if rate.is_finite() {
        Ok(rate * scale)
    } else {
        Ok(0.0)
    }
}
