//! Test run session state machine.
//!
//! A session owns one `run` invocation: it launches the run, polls it until
//! it settles, relaunches after `system_error` and enforces the start
//! timeout, the per-run timeout and both retry ceilings.
//!
//! ```text
//! Idle -> Launching -> Polling -> Terminal
//!            ^            |
//!            +-Recovering-+   (system_error)
//! ```

use crate::client::RunBackend;
use crate::fatal::FatalError;
use crate::launcher::{LaunchPlan, RunLauncher};
use crate::poller::{Pacing, ResultPoller};
use crate::render::{OutputSink, StepReporter, Tone};
use probe_core::types::{RunId, RunStatus, StepRecord};
use probe_core::Config;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest timeout honored. Larger configured values are clamped to it.
const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Timeout configured in minutes.
pub fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60)).min(MAX_TIMEOUT)
}

/// Budgets and delays of a session.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Wall-clock budget for getting a first run launched.
    pub start_timeout: Duration,
    /// Wall-clock budget for polling one launched run.
    pub run_timeout: Duration,
    /// Ceiling on launch attempts for the whole session.
    pub max_starts: u32,
    /// Ceiling on runs that ended in `system_error`.
    pub max_system_error_starts: u32,
    pub disable_system_error_retry: bool,
    /// Backoff unit; the n-th unresolved attempt waits `min(n, cap) * step`.
    pub backoff_step: Duration,
    pub backoff_cap: u32,
    /// Upper bound of the random jitter added to each backoff.
    pub backoff_jitter: Duration,
    /// Wait before polling again after a failed result request.
    pub poll_retry_delay: Duration,
    pub pacing: Pacing,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(15 * 60),
            run_timeout: Duration::from_secs(65 * 60),
            max_starts: 130,
            max_system_error_starts: 5,
            disable_system_error_retry: false,
            backoff_step: Duration::from_secs(10),
            backoff_cap: 6,
            backoff_jitter: Duration::from_secs(1),
            poll_retry_delay: Duration::from_secs(5),
            pacing: Pacing::default(),
        }
    }
}

impl SessionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            start_timeout: minutes(config.start_timeout_min),
            run_timeout: minutes(config.run_timeout_min),
            max_starts: config.max_starts,
            max_system_error_starts: config.max_system_error_starts,
            disable_system_error_retry: config.disable_system_error_retry,
            ..Self::default()
        }
    }

    /// Backoff before the `attempt`-th retry (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt.min(self.backoff_cap)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    run_id: Option<RunId>,
    settled: bool,
}

/// In-flight run published for the interrupt handler.
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl RunTracker {
    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launched(&self, run_id: &RunId) {
        let mut state = self.lock();
        state.run_id = Some(run_id.clone());
        state.settled = false;
    }

    fn settled(&self) {
        self.lock().settled = true;
    }

    /// Run that was launched and has no final status yet.
    pub fn in_flight(&self) -> Option<RunId> {
        let state = self.lock();
        if state.settled {
            None
        } else {
            state.run_id.clone()
        }
    }
}

/// Everything the result formatter needs once the session settled.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub status: RunStatus,
    pub run_id: RunId,
    pub project_id: String,
    pub steps: Vec<StepRecord>,
    pub total_time: Duration,
    pub first_step_latency: Option<Duration>,
    pub launches: u32,
    pub system_errors: u32,
}

pub struct TestRunSession {
    backend: Arc<dyn RunBackend>,
    sink: Arc<dyn OutputSink>,
    launcher: RunLauncher,
    poller: ResultPoller,
    reporter: StepReporter,
    limits: SessionLimits,
    tracker: RunTracker,
    started: Instant,
    launch_attempts: u32,
    launches: u32,
    system_errors: u32,
    backoffs: u32,
    first_step_latency: Option<Duration>,
    outcome: Option<SessionOutcome>,
}

impl std::fmt::Debug for TestRunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestRunSession")
            .field("launcher", &self.launcher)
            .field("limits", &self.limits)
            .field("launch_attempts", &self.launch_attempts)
            .field("launches", &self.launches)
            .field("system_errors", &self.system_errors)
            .field("backoffs", &self.backoffs)
            .finish_non_exhaustive()
    }
}

impl TestRunSession {
    pub fn new(
        backend: Arc<dyn RunBackend>,
        sink: Arc<dyn OutputSink>,
        plan: LaunchPlan,
        limits: SessionLimits,
    ) -> Self {
        let launcher = RunLauncher::new(Arc::clone(&backend), Arc::clone(&sink), plan);
        Self {
            reporter: StepReporter::new(Arc::clone(&sink)),
            poller: ResultPoller::new(limits.pacing),
            backend,
            sink,
            launcher,
            limits,
            tracker: RunTracker::default(),
            started: Instant::now(),
            launch_attempts: 0,
            launches: 0,
            system_errors: 0,
            backoffs: 0,
            first_step_latency: None,
            outcome: None,
        }
    }

    /// Handle shared with the interrupt handler.
    pub fn tracker(&self) -> RunTracker {
        self.tracker.clone()
    }

    pub fn launch_attempts(&self) -> u32 {
        self.launch_attempts
    }

    pub fn launches(&self) -> u32 {
        self.launches
    }

    pub fn system_errors(&self) -> u32 {
        self.system_errors
    }

    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }

    pub fn steps(&self) -> &[StepRecord] {
        self.reporter.records()
    }

    /// Drive the session until the run settles or a fatal condition occurs.
    pub async fn run(&mut self) -> Result<SessionOutcome, FatalError> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        self.started = Instant::now();

        loop {
            if self.launch_attempts >= self.limits.max_starts {
                return Err(FatalError::too_many_starts(self.launch_attempts));
            }
            if self.launches == 0
                && self.launch_attempts > 0
                && self.started.elapsed() > self.limits.start_timeout
            {
                return Err(FatalError::start_timeout(
                    self.limits.start_timeout.as_secs() / 60,
                ));
            }

            self.launch_attempts += 1;
            let status = match self.launcher.attempt_launch().await? {
                Some(run_id) => {
                    self.launches += 1;
                    self.poller.reset();
                    self.tracker.launched(&run_id);
                    self.poll_run(&run_id)
                        .await
                        .map(|status| (run_id, status))
                }
                None => None,
            };

            match status {
                Some((run_id, RunStatus::SystemError)) => self.recover(&run_id)?,
                Some((run_id, status)) => return Ok(self.settle(run_id, status)),
                None => self.back_off().await,
            }
        }
    }

    /// Poll one run until it settles or its deadline passes.
    async fn poll_run(&mut self, run_id: &RunId) -> Option<RunStatus> {
        let deadline = Instant::now() + self.limits.run_timeout;

        loop {
            if Instant::now() >= deadline {
                warn!(
                    run_id = %run_id,
                    timeout_min = self.limits.run_timeout.as_secs() / 60,
                    "run did not settle before its deadline"
                );
                return None;
            }

            let polled = self
                .poller
                .fetch_status(self.backend.as_ref(), run_id, &mut self.reporter)
                .await;

            if self.first_step_latency.is_none() && self.reporter.count() > 0 {
                self.first_step_latency = Some(self.started.elapsed());
            }

            match polled {
                Ok(Some(status)) => {
                    debug!(
                        run_id = %run_id,
                        status = %status,
                        steps = self.poller.cursor(),
                        "run settled"
                    );
                    return Some(status);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "failed to fetch run result, retrying");
                    tokio::time::sleep(self.limits.poll_retry_delay).await;
                }
            }
        }
    }

    /// Account for a run that ended in `system_error` and decide whether to
    /// relaunch.
    fn recover(&mut self, run_id: &RunId) -> Result<(), FatalError> {
        self.tracker.settled();
        self.system_errors += 1;
        warn!(
            run_id = %run_id,
            system_errors = self.system_errors,
            "test run ended with system_error"
        );

        if self.limits.disable_system_error_retry {
            return Err(FatalError::system_error_no_retry());
        }
        if self.system_errors >= self.limits.max_system_error_starts {
            return Err(FatalError::too_many_system_errors(self.system_errors));
        }

        self.sink.notice(
            Tone::Warning,
            &format!(
                "System error in test run {run_id}\n  → the platform failed to execute the run, this is not a test failure\n  → relaunching ({}/{})",
                self.system_errors, self.limits.max_system_error_starts
            ),
        );
        self.launcher.rearm_notice();
        Ok(())
    }

    async fn back_off(&mut self) {
        self.backoffs += 1;
        let jitter_ms = u64::try_from(self.limits.backoff_jitter.as_millis()).unwrap_or(0);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        let delay = self.limits.backoff(self.backoffs) + jitter;
        info!(
            attempt = self.backoffs,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying launch after backoff"
        );
        tokio::time::sleep(delay).await;
    }

    fn settle(&mut self, run_id: RunId, status: RunStatus) -> SessionOutcome {
        self.tracker.settled();
        let outcome = SessionOutcome {
            status,
            run_id,
            project_id: self.launcher.plan().project_id.clone(),
            steps: self.reporter.records().to_vec(),
            total_time: self.started.elapsed(),
            first_step_latency: self.first_step_latency,
            launches: self.launches,
            system_errors: self.system_errors,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}
