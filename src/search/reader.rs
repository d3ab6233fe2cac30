use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use regex::Regex;
use tracing::{debug, warn};
use crate::core::config::BackendConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Index, Record};
use crate::search::result::{CancelToken, ResultSink};
use crate::storage::view::{ViewItem, ViewWriter};

const READ_CHUNK: usize = 64 * 1024;

/// Polling parameters of the tail readers
#[derive(Debug, Clone)]
pub struct TailConfig {
    pub open_poll: Duration,
    pub open_limit: Duration,
    pub read_poll: Duration,
    pub read_attempts: u32,
    pub queue_capacity: usize,
}

impl TailConfig {
    pub fn from_backend(cfg: &BackendConfig) -> Self {
        TailConfig {
            open_poll: Duration::from_millis(cfg.open_poll_ms),
            open_limit: Duration::from_millis(cfg.open_poll_limit_ms),
            read_poll: Duration::from_millis(cfg.read_poll_ms),
            read_attempts: cfg.read_attempts,
            queue_capacity: cfg.index_queue_capacity.max(1),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        TailConfig::from_backend(&BackendConfig::default())
    }
}

/// Files written by one backend call
#[derive(Debug, Clone)]
pub struct TailPaths {
    pub index: PathBuf,
    pub data: PathBuf,
    pub view: Option<PathBuf>,      // written on the fly when set
}

/// What happens to records on their way out
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    pub home: String,               // reported paths are relative to it
    pub host: String,
    pub file_filter: Option<Regex>,
    pub limit: u64,                 // 0 for no limit
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailSummary {
    pub indexes: u64,
    pub records: u64,
    pub data_len: u64,              // DATA bytes announced by the INDEX
}

/// Shared stop state of a reader pair.
///
/// `soft` means the backend is done and readers should exit once they
/// reach the end of what was written. `cancel` stops both at once.
#[derive(Clone)]
struct Control {
    soft: Arc<AtomicBool>,
    cancel: CancelToken,
}

impl Control {
    fn stopping(&self) -> bool {
        self.soft.load(Ordering::SeqCst)
    }
}

/// Paired INDEX and DATA readers tailing files a backend is writing.
pub struct TailReaders {
    control: Control,
    index: JoinHandle<Result<(u64, u64)>>,
    data: JoinHandle<Result<u64>>,
}

impl TailReaders {
    pub fn start(
        paths: TailPaths,
        delimiter: &str,
        cfg: TailConfig,
        opts: RecordOptions,
        sink: ResultSink,
        cancel: &CancelToken,
    ) -> Self {
        let control = Control {
            soft: Arc::new(AtomicBool::new(false)),
            cancel: cancel.child(),
        };
        let (tx, rx) = channel::bounded(cfg.queue_capacity);

        let index = IndexReader {
            path: paths.index,
            view: paths.view,
            delimiter: delimiter.to_string(),
            cfg: cfg.clone(),
            control: control.clone(),
            tx,
        };
        let data = DataReader {
            path: paths.data,
            delimiter: delimiter.as_bytes().to_vec(),
            cfg,
            opts,
            control: control.clone(),
            rx,
            sink,
        };

        TailReaders {
            control,
            index: thread::spawn(move || index.run()),
            data: thread::spawn(move || data.run()),
        }
    }

    /// Hard cancel, both readers stop as soon as possible
    pub fn cancel(&self) {
        self.control.cancel.cancel();
    }

    /// Soft stop: read what the backend wrote, then report.
    pub fn finish(self) -> Result<TailSummary> {
        self.control.soft.store(true, Ordering::SeqCst);

        let index = join(self.index, "INDEX reader");
        let data = join(self.data, "DATA reader");
        let (indexes, data_len) = index?;
        let records = data?;
        Ok(TailSummary { indexes, records, data_len })
    }
}

fn join<T>(handle: JoinHandle<Result<T>>, what: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::new(ErrorKind::Internal, format!("{} panicked", what)))?
}

/// Wait for a file the backend has not created yet.
///
/// Returns `None` on cancel, or on soft stop when the file never
/// appeared.
fn open_tail(path: &Path, cfg: &TailConfig, control: &Control) -> Result<Option<File>> {
    let start = Instant::now();
    loop {
        let last_chance = control.stopping();
        if fs::metadata(path).is_ok() {
            match File::open(path) {
                Ok(file) => return Ok(Some(file)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if last_chance {
            debug!("{} was never created", path.display());
            return Ok(None);
        }
        if start.elapsed() >= cfg.open_limit {
            return Err(Error::new(
                ErrorKind::Io,
                format!("failed to open {}: not created after {:?}", path.display(), cfg.open_limit),
            ));
        }
        if control.cancel.wait(cfg.open_poll) {
            return Ok(None);
        }
    }
}

struct IndexReader {
    path: PathBuf,
    view: Option<PathBuf>,
    delimiter: String,
    cfg: TailConfig,
    control: Control,
    tx: Sender<Index>,
}

impl IndexReader {
    fn run(self) -> Result<(u64, u64)> {
        let control = self.control.clone();
        let res = self.process();
        if let Err(e) = &res {
            warn!("INDEX reader failed: {}", e);
            control.cancel.cancel();
        }
        res
    }

    // the sender is dropped on return, which tells the DATA reader
    // there is nothing more to come
    fn process(self) -> Result<(u64, u64)> {
        let file = match open_tail(&self.path, &self.cfg, &self.control)? {
            Some(file) => file,
            None => return Ok((0, 0)),
        };
        debug!("INDEX reader: {} opened", self.path.display());

        let mut view = match &self.view {
            Some(path) => Some(ViewWriter::create(path)?),
            None => None,
        };

        let mut rd = BufReader::new(file);
        let delim_len = self.delimiter.len() as u64;
        let mut line = Vec::new();
        let mut count = 0u64;
        let mut index_pos = 0u64;
        let mut data_pos = 0u64;

        loop {
            if self.control.cancel.is_cancelled() {
                break;
            }

            // a read that starts after the soft stop sees everything
            let stopping = self.control.stopping();
            rd.read_until(b'\n', &mut line)?;
            if line.last() == Some(&b'\n') {
                let text = String::from_utf8_lossy(&line);
                let mut index = Index::parse(&text).map_err(|e| e.wrap("failed to parse index"))?;
                index.data_pos = data_pos;
                let next_pos = data_pos
                    .checked_add(index.length)
                    .and_then(|p| p.checked_add(delim_len))
                    .filter(|&p| p <= i64::MAX as u64)
                    .ok_or_else(|| Error::format(format!("bad index length {} at {}", index.length, data_pos)))?;

                if let Some(w) = view.as_mut() {
                    let line_len = line.len() as u64;
                    w.put(ViewItem::new(
                        index_pos as i64,
                        (index_pos + line_len) as i64,
                        data_pos as i64,
                        (data_pos + index.length) as i64,
                    ))?;
                    index_pos += line_len;
                }
                data_pos = next_pos;
                count += 1;
                line.clear();

                if !self.send(index) {
                    break;
                }
                continue;
            }

            // end of file for now
            if let Some(w) = view.as_mut() {
                w.update(index_pos as i64, data_pos as i64)?;
            }
            if stopping {
                if !line.is_empty() {
                    warn!("INDEX reader: incomplete last line {:?} ignored", String::from_utf8_lossy(&line));
                }
                break;
            }
            if self.control.cancel.wait(self.cfg.read_poll) {
                break;
            }
        }

        if let Some(mut w) = view {
            w.update(index_pos as i64, data_pos as i64)?;
            w.close()?;
        }
        debug!("INDEX reader: {} indexes, {} bytes of DATA expected", count, data_pos);
        Ok((count, data_pos))
    }

    // false when the DATA reader is gone or the request is cancelled
    fn send(&self, index: Index) -> bool {
        let mut item = index;
        loop {
            match self.tx.send_timeout(item, self.cfg.read_poll) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.control.cancel.is_cancelled() {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

struct DataReader {
    path: PathBuf,
    delimiter: Vec<u8>,
    cfg: TailConfig,
    opts: RecordOptions,
    control: Control,
    rx: Receiver<Index>,
    sink: ResultSink,
}

impl DataReader {
    fn run(self) -> Result<u64> {
        let res = self.process();
        match &res {
            Err(e) if e.kind != ErrorKind::Cancelled => {
                warn!("DATA reader failed: {}", e);
                self.control.cancel.cancel();
            }
            _ => {}
        }
        // unblock the INDEX reader
        while self.rx.try_recv().is_ok() {}
        res
    }

    fn process(&self) -> Result<u64> {
        let file = match open_tail(&self.path, &self.cfg, &self.control)? {
            Some(file) => file,
            None => return Ok(0),
        };
        debug!("DATA reader: {} opened", self.path.display());

        let mut rd = BufReader::new(file);
        let mut count = 0u64;
        loop {
            let mut index = match self.rx.recv_timeout(self.cfg.read_poll) {
                Ok(index) => index,
                Err(RecvTimeoutError::Timeout) => {
                    if self.control.cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let data = self.read_tail(&mut rd, index.length)?;
            if !self.delimiter.is_empty() {
                let delim = self.read_tail(&mut rd, self.delimiter.len() as u64)?;
                if delim != self.delimiter {
                    return Err(Error::format(format!(
                        "{:?} unexpected delimiter found at {}",
                        String::from_utf8_lossy(&delim),
                        index.data_pos + index.length
                    )));
                }
            }

            index.relative_to(&self.opts.home);
            index.update_host(&self.opts.host);
            if let Some(filter) = &self.opts.file_filter {
                if !filter.is_match(&index.file) {
                    continue;
                }
            }

            if !self.sink.record(Record::new(index, data)) {
                self.control.cancel.cancel();
                break;
            }
            count += 1;

            if self.opts.limit > 0 && count >= self.opts.limit {
                debug!("DATA reader: limit of {} records reached", self.opts.limit);
                break;
            }
        }

        debug!("DATA reader: {} records reported", count);
        Ok(count)
    }

    /// Read exactly `len` bytes, waiting for the backend when needed.
    ///
    /// Attempts are only counted after the soft stop and are reset by
    /// any progress.
    /// The buffer grows with the data actually read, the INDEX length
    /// alone never decides the allocation.
    fn read_tail(&self, rd: &mut impl Read, len: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(READ_CHUNK as u64) as usize);
        let mut chunk = [0u8; READ_CHUNK];
        let mut filled = 0u64;
        let mut attempts = 0;

        while filled < len {
            let stopping = self.control.stopping();
            let want = (len - filled).min(READ_CHUNK as u64) as usize;
            let n = rd.read(&mut chunk[..want])?;
            if n > 0 {
                buf.extend_from_slice(&chunk[..n]);
                filled += n as u64;
                attempts = 0;
                continue;
            }

            if stopping {
                attempts += 1;
                if attempts > self.cfg.read_attempts {
                    return Err(Error::new(
                        ErrorKind::Io,
                        format!("cancelled by attempt limit: {} of {} bytes read", filled, len),
                    ));
                }
            }
            if self.control.cancel.wait(self.cfg.read_poll) {
                return Err(Error::cancelled());
            }
        }
        Ok(buf)
    }
}
