pub mod result;
pub mod tweaks;
pub mod backend;
pub mod reader;
pub mod store;
pub mod scheduler;
pub mod federation;
pub mod transform;
pub mod aggs;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::Statistics;
use crate::query::optimizer::optimize;
use crate::query::parser::parse_query_opt;
use crate::search::result::{CancelToken, ResultSink, ResultStream, result_channel};
use crate::search::scheduler::{Scheduler, SearchRequest};

pub use result::{ErrorRecord, SearchEvent, SearchOutcome};

/// Parse, optimize and run one request on the local backend.
///
/// This is the request boundary: a panic anywhere below is reported
/// as an Internal error instead of tearing the caller down.
pub fn execute(scheduler: &Scheduler, req: &SearchRequest, sink: &ResultSink, cancel: &CancelToken) -> Result<Statistics> {
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        let cfg = &scheduler.config().optimizer;
        let query = parse_query_opt(&req.query, req.options.clone())?;
        let query = optimize(query, cfg.combine_limit, &cfg.except_modes);
        debug!("optimized query: {}", query);
        scheduler.run(&query, req, sink, cancel)
    }));

    match res {
        Ok(res) => res,
        Err(cause) => {
            let msg = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("search panicked: {}", msg);
            Err(Error::new(ErrorKind::Internal, msg))
        }
    }
}

/// Start a local search in the background.
///
/// The stream ends with a statistics event, or with a single error
/// event when the request fails. Dropping the stream cancels it.
pub fn search(scheduler: Arc<Scheduler>, req: SearchRequest) -> ResultStream {
    let cancel = CancelToken::new();
    let (sink, stream) = result_channel(cancel.clone());
    thread::spawn(move || {
        match execute(&scheduler, &req, &sink, &cancel) {
            Ok(stat) => sink.stat(stat),
            Err(e) => sink.error(&e, scheduler.host()),
        };
    });
    stream
}
