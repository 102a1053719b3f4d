//! Per-test log capture.
//!
//! Every test gets its own `tracing` dispatcher and its own tokio runtime whose worker threads all
//! use that dispatcher, so log events from spawned tasks and blocking workers end up with the
//! test that caused them instead of being interleaved with other tests running in parallel.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Default filter when `RUST_LOG` isn't set
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,rustls=info,aws=info,debug";

/// Buffers the formatted log events of a single test
#[derive(Clone, Default)]
struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Empty the buffer and return what was in it
    fn take(&self) -> String {
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

/// Run a test future with logging enabled, in place of `#[tokio::test]`.
///
/// The log output of the test is printed when it finishes, whether it passed, failed or
/// panicked.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    test_with_captured_logs(test).map(|_| ())
}

/// Like [`test_with_logging`], but on success also returns the formatted log output so the test
/// can make assertions about what was logged.
///
/// Log level filtering still follows `RUST_LOG`, so assertions should only look for events at
/// `info` or above.
pub fn test_with_captured_logs(test: impl Future<Output = Result<()>>) -> Result<String> {
    let logs = CapturedLogs::default();

    let dispatch = {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::{fmt, EnvFilter};

        let format = fmt::layer()
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(false)
            .with_ansi(false)
            .with_writer(logs.clone());

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

        Arc::new(tracing::Dispatch::new(
            tracing_subscriber::registry().with(filter).with(format),
        ))
    };

    let result = tracing::dispatcher::with_default(&dispatch, || -> Result<Result<()>> {
        std::thread_local! {
            static THREAD_DISPATCHER_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
        }

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();
        {
            let dispatch = dispatch.clone();
            builder.on_thread_start(move || {
                THREAD_DISPATCHER_GUARD.with(|cell| {
                    cell.replace(Some(tracing::dispatcher::set_default(&dispatch)));
                })
            });
        }
        builder.on_thread_stop(|| {
            THREAD_DISPATCHER_GUARD.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", logs_snapshot(&logs));

        match outcome {
            Ok(result) => Ok(result),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })?;

    result?;

    Ok(logs.take())
}

fn logs_snapshot(logs: &CapturedLogs) -> String {
    String::from_utf8_lossy(&logs.buffer.lock().unwrap()).into_owned()
}
