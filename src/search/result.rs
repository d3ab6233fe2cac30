use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use crossbeam::channel::{self, Receiver, Select, Sender};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind};
use crate::core::stats::Statistics;
use crate::core::types::Record;

/// Request-wide cancellation signal.
///
/// Cancelling closes an internal channel so that any number of
/// waiters wake up at once. A child token is cancelled together with
/// its parent but can also be cancelled on its own.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
    parent: Option<Box<CancelToken>>,
}

struct CancelInner {
    cancelled: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl CancelInner {
    fn new() -> Arc<Self> {
        let (tx, rx) = channel::bounded(0);
        Arc::new(CancelInner {
            cancelled: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx,
        })
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            inner: CancelInner::new(),
            parent: None,
        }
    }

    pub fn child(&self) -> CancelToken {
        CancelToken {
            inner: CancelInner::new(),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.tx.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Sleep up to `timeout`, returning early with `true` on cancel
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }

        let mut chain = Vec::new();
        let mut token = Some(self);
        while let Some(t) = token {
            chain.push(&t.inner.rx);
            token = t.parent.as_deref();
        }

        let mut sel = Select::new();
        for rx in &chain {
            sel.recv(rx);
        }
        match sel.ready_timeout(timeout) {
            Ok(_) => self.is_cancelled(),
            Err(_) => false,
        }
    }
}

/// Error reported inside the result stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

impl ErrorRecord {
    pub fn new(err: &Error, host: &str) -> Self {
        ErrorRecord {
            kind: err.kind,
            message: err.context.clone(),
            host: host.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

/// One item of the outbound stream, also the NDJSON wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SearchEvent {
    Record(Record),
    Error(ErrorRecord),
    Stat(Statistics),
}

/// Producer side of a result stream
#[derive(Clone)]
pub struct ResultSink {
    tx: Sender<SearchEvent>,
}

impl ResultSink {
    /// Returns false once the consumer is gone
    pub fn send(&self, event: SearchEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn record(&self, record: Record) -> bool {
        self.send(SearchEvent::Record(record))
    }

    pub fn error(&self, err: &Error, host: &str) -> bool {
        self.send(SearchEvent::Error(ErrorRecord::new(err, host)))
    }

    pub fn stat(&self, stat: Statistics) -> bool {
        self.send(SearchEvent::Stat(stat))
    }
}

/// Consumer side; dropping it cancels the request.
pub struct ResultStream {
    rx: Receiver<SearchEvent>,
    cancel: CancelToken,
}

/// Everything a finished stream produced
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub records: Vec<Record>,
    pub errors: Vec<ErrorRecord>,
    pub stat: Option<Statistics>,
}

pub fn result_channel(cancel: CancelToken) -> (ResultSink, ResultStream) {
    let (tx, rx) = channel::unbounded();
    (ResultSink { tx }, ResultStream { rx, cancel })
}

impl ResultStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Block until the producers finish
    pub fn finish(self) -> SearchOutcome {
        let mut out = SearchOutcome::default();
        for event in self.rx.iter() {
            match event {
                SearchEvent::Record(rec) => out.records.push(rec),
                SearchEvent::Error(err) => out.errors.push(err),
                SearchEvent::Stat(stat) => match out.stat.as_mut() {
                    Some(total) => total.combine(&stat),
                    None => out.stat = Some(stat),
                },
            }
        }
        out
    }
}

impl Iterator for ResultStream {
    type Item = SearchEvent;

    fn next(&mut self) -> Option<SearchEvent> {
        self.rx.recv().ok()
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
