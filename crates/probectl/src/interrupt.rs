//! Ctrl-C handling for a running session.
//!
//! The first interrupt stops the remote run on a best-effort basis. A second
//! interrupt while the stop request is pending gives up on it.

use crate::client::RunBackend;
use crate::fatal::FatalError;
use crate::render::{OutputSink, Tone};
use crate::session::RunTracker;
use std::future::Future;
use tracing::{info, warn};

/// Stop the in-flight run, if any, and return the `Interrupted` outcome.
///
/// `second` resolves on the next interrupt signal.
pub async fn handle_interrupt<F>(
    backend: &dyn RunBackend,
    tracker: &RunTracker,
    sink: &dyn OutputSink,
    second: F,
) -> FatalError
where
    F: Future<Output = ()>,
{
    let Some(run_id) = tracker.in_flight() else {
        info!("interrupted with no test run in flight");
        return FatalError::interrupted("interrupted");
    };

    sink.notice(
        Tone::Warning,
        &format!("Interrupted, stopping test run {run_id}..."),
    );

    tokio::select! {
        biased;

        result = backend.stop_run(&run_id) => match result {
            Ok(()) => {
                info!(run_id = %run_id, "remote test run stopped");
                sink.notice(Tone::Info, &format!("Test run {run_id} stopped"));
                FatalError::interrupted(format!("interrupted, test run {run_id} stopped"))
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "failed to stop remote test run");
                sink.notice(
                    Tone::Warning,
                    &format!("Could not stop test run {run_id}: {err}"),
                );
                FatalError::interrupted(format!(
                    "interrupted, test run {run_id} may still be running"
                ))
            }
        },
        () = second => {
            warn!(run_id = %run_id, "second interrupt, not waiting for stop request");
            sink.notice(
                Tone::Warning,
                &format!("Interrupted again, exiting now\n  → test run {run_id} is not guaranteed to be terminated"),
            );
            FatalError::interrupted(format!(
                "interrupted, test run {run_id} may still be running"
            ))
        }
    }
}
