//! Incremental run result polling.
//!
//! One call to [`ResultPoller::fetch_status`] issues exactly one result
//! request, reports steps that settled since the previous call and tells the
//! session whether the run itself has settled.

use crate::client::{ClientError, RunBackend};
use crate::render::StepReporter;
use probe_core::types::{RunId, RunStatus};
use std::time::Duration;
use tracing::{debug, warn};

/// Delay between polls while a run is still executing.
///
/// The first few step slots poll faster so the first lines show up quickly.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub fast: Duration,
    pub slow: Duration,
    pub fast_slots: usize,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(250),
            slow: Duration::from_secs(1),
            fast_slots: 3,
        }
    }
}

#[derive(Debug)]
pub struct ResultPoller {
    /// Server-side index of the next step to report for the current attempt.
    cursor: usize,
    pacing: Pacing,
}

impl ResultPoller {
    pub fn new(pacing: Pacing) -> Self {
        Self { cursor: 0, pacing }
    }

    /// Start a new attempt. Steps of the new run are numbered from zero on
    /// the server, display numbering continues in the reporter.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn delay(&self) -> Duration {
        if self.cursor < self.pacing.fast_slots {
            self.pacing.fast
        } else {
            self.pacing.slow
        }
    }

    /// Fetch the run result once and report newly settled steps.
    ///
    /// Returns `Some(status)` once the run has settled, `None` while it is
    /// still pending. Unknown run statuses are treated as `system_error`.
    pub async fn fetch_status(
        &mut self,
        backend: &dyn RunBackend,
        run_id: &RunId,
        reporter: &mut StepReporter,
    ) -> Result<Option<RunStatus>, ClientError> {
        let Some(result) = backend.run_result(run_id).await? else {
            debug!(run_id = %run_id, "run result not available yet");
            tokio::time::sleep(self.delay()).await;
            return Ok(None);
        };

        let settled = match RunStatus::parse(&result.status) {
            Some(status) if status.is_settled() => Some(status),
            Some(_) => None,
            None => {
                warn!(
                    run_id = %run_id,
                    status = %result.status,
                    "unrecognized run status, treating as system_error"
                );
                Some(RunStatus::SystemError)
            }
        };

        // While the run executes, stop at the first pending step so order is
        // kept. Once it settled, nothing will change anymore: flush the rest.
        for step in result.steps.iter().skip(self.cursor) {
            if reporter.report(step).is_none() && settled.is_none() {
                break;
            }
            self.cursor += 1;
        }

        if settled.is_none() {
            tokio::time::sleep(self.delay()).await;
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::OutputSink;
    use crate::test_support::{result, step, MemorySink, MockBackend};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn reporter() -> (Arc<MemorySink>, StepReporter) {
        let sink = Arc::new(MemorySink::default());
        let reporter = StepReporter::new(Arc::clone(&sink) as Arc<dyn OutputSink>);
        (sink, reporter)
    }

    #[tokio::test(start_paused = true)]
    async fn absent_result_is_not_settled() {
        let backend = MockBackend::default();
        let (_, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        let status = poller
            .fetch_status(&backend, &RunId::new("abc"), &mut reporter)
            .await
            .unwrap();
        assert_eq!(status, None);
        assert_eq!(reporter.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_each_settled_step_once() {
        let backend = MockBackend::default().with_results(
            "abc",
            vec![
                result("pending", vec![step("success", "open page", 1.0)]),
                result(
                    "pending",
                    vec![
                        step("success", "open page", 1.0),
                        step("success", "type email", 0.3),
                        step("pending", "click login", 0.0),
                    ],
                ),
                result(
                    "failure",
                    vec![
                        step("success", "open page", 1.0),
                        step("success", "type email", 0.3),
                        step("failure", "click login", 2.0),
                    ],
                ),
            ],
        );
        let (sink, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());
        let id = RunId::new("abc");

        assert_eq!(
            poller.fetch_status(&backend, &id, &mut reporter).await.unwrap(),
            None
        );
        assert_eq!(
            poller.fetch_status(&backend, &id, &mut reporter).await.unwrap(),
            None
        );
        assert_eq!(poller.cursor(), 2);
        assert_eq!(
            poller.fetch_status(&backend, &id, &mut reporter).await.unwrap(),
            Some(RunStatus::Failure)
        );

        assert_eq!(
            sink.step_lines(),
            vec![
                "#1 [SUCCESS] open page (1.00s)".to_string(),
                "#2 [SUCCESS] type email (0.30s)".to_string(),
                "#3 [FAILURE] click login (2.00s)".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn walk_stops_at_first_unsettled_step() {
        let backend = MockBackend::default().with_results(
            "abc",
            vec![result(
                "pending",
                vec![
                    step("success", "a", 0.1),
                    step("pending", "b", 0.0),
                    step("success", "c", 0.1),
                ],
            )],
        );
        let (_, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        poller
            .fetch_status(&backend, &RunId::new("abc"), &mut reporter)
            .await
            .unwrap();
        assert_eq!(poller.cursor(), 1);
        assert_eq!(reporter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_steps_do_not_stop_the_walk() {
        let backend = MockBackend::default().with_results(
            "abc",
            vec![result(
                "success",
                vec![
                    step("success", "open page", 1.0),
                    step("fetch", "GET /api/items", 0.2),
                    step("success", "click buy", 0.5),
                ],
            )],
        );
        let (sink, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        let status = poller
            .fetch_status(&backend, &RunId::new("abc"), &mut reporter)
            .await
            .unwrap();

        assert_eq!(status, Some(RunStatus::Success));
        assert_eq!(poller.cursor(), 3);
        assert_eq!(
            sink.step_lines(),
            vec![
                "#1 [SUCCESS] open page (1.00s)".to_string(),
                "#2 [INFO] GET /api/items (0.20s)".to_string(),
                "#3 [SUCCESS] click buy (0.50s)".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_step_status_is_reported_and_walk_continues() {
        let backend = MockBackend::default().with_results(
            "abc",
            vec![result(
                "pending",
                vec![
                    step("success", "a", 0.1),
                    step("mystery", "b", 0.1),
                    step("success", "c", 0.1),
                ],
            )],
        );
        let (_, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        poller
            .fetch_status(&backend, &RunId::new("abc"), &mut reporter)
            .await
            .unwrap();

        assert_eq!(poller.cursor(), 3);
        assert_eq!(reporter.records()[1].status, RunStatus::SystemError);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_run_flushes_steps_after_a_pending_one() {
        let backend = MockBackend::default().with_results(
            "abc",
            vec![result(
                "terminated",
                vec![
                    step("success", "a", 0.1),
                    step("pending", "b", 0.0),
                    step("terminated", "c", 0.1),
                ],
            )],
        );
        let (sink, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        let status = poller
            .fetch_status(&backend, &RunId::new("abc"), &mut reporter)
            .await
            .unwrap();

        assert_eq!(status, Some(RunStatus::Terminated));
        assert_eq!(
            sink.step_lines(),
            vec![
                "#1 [SUCCESS] a (0.10s)".to_string(),
                "#2 [TERMINATED] c (0.10s)".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_run_status_is_treated_as_system_error() {
        let backend =
            MockBackend::default().with_results("abc", vec![result("exploded", Vec::new())]);
        let (_, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        let status = poller
            .fetch_status(&backend, &RunId::new("abc"), &mut reporter)
            .await
            .unwrap();
        assert_eq!(status, Some(RunStatus::SystemError));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_poll_paces_fast_then_slow() {
        let steps: Vec<_> = (0..4).map(|i| step("success", &format!("s{i}"), 0.1)).collect();
        let backend = MockBackend::default()
            .with_results("fast", vec![result("pending", Vec::new())])
            .with_results("late", vec![result("pending", steps)]);
        let (_, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        let start = Instant::now();
        poller
            .fetch_status(&backend, &RunId::new("fast"), &mut reporter)
            .await
            .unwrap();
        let fast = start.elapsed();
        assert!(fast >= Duration::from_millis(250) && fast < Duration::from_secs(1));

        let start = Instant::now();
        poller
            .fetch_status(&backend, &RunId::new("late"), &mut reporter)
            .await
            .unwrap();
        assert_eq!(poller.cursor(), 4);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restarts_cursor_but_not_numbering() {
        let backend = MockBackend::default()
            .with_results("run-1", vec![result("system_error", vec![step("success", "a", 0.1)])])
            .with_results("run-2", vec![result("success", vec![step("success", "a", 0.1)])]);
        let (sink, mut reporter) = reporter();
        let mut poller = ResultPoller::new(Pacing::default());

        poller
            .fetch_status(&backend, &RunId::new("run-1"), &mut reporter)
            .await
            .unwrap();
        poller.reset();
        poller
            .fetch_status(&backend, &RunId::new("run-2"), &mut reporter)
            .await
            .unwrap();

        assert_eq!(
            sink.step_lines(),
            vec![
                "#1 [SUCCESS] a (0.10s)".to_string(),
                "#2 [SUCCESS] a (0.10s)".to_string(),
            ]
        );
    }
}
