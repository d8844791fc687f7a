//! Launch attempts for a test run.
//!
//! Expected failures (no free slot, transient API errors) come back as
//! `Ok(None)` so the session can back off and try again. Conditions no retry
//! can fix come back as a [`FatalError`].

use crate::bundle::SourceBundle;
use crate::client::{ClientError, RunBackend, StartRunRequest};
use crate::fatal::FatalError;
use crate::render::{OutputSink, Tone};
use probe_core::types::{is_fatal_launch_code, RunId};
use std::sync::Arc;
use tracing::{info, warn};

/// What to launch: the project, the start request and the optional bundle.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub project_id: String,
    pub request: StartRunRequest,
    pub bundle: Option<SourceBundle>,
}

impl LaunchPlan {
    pub fn script(&self) -> &str {
        &self.request.script
    }
}

pub struct RunLauncher {
    backend: Arc<dyn RunBackend>,
    sink: Arc<dyn OutputSink>,
    plan: LaunchPlan,
    /// Set once the "CLI will retry" notice was shown for the current wave.
    notice_shown: bool,
}

impl std::fmt::Debug for RunLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLauncher")
            .field("plan", &self.plan)
            .field("notice_shown", &self.notice_shown)
            .finish_non_exhaustive()
    }
}

impl RunLauncher {
    pub fn new(backend: Arc<dyn RunBackend>, sink: Arc<dyn OutputSink>, plan: LaunchPlan) -> Self {
        Self {
            backend,
            sink,
            plan,
            notice_shown: false,
        }
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    /// Allow the retry notice to show again, for the next wave of attempts.
    pub fn rearm_notice(&mut self) {
        self.notice_shown = false;
    }

    /// Try once to start the run.
    pub async fn attempt_launch(&mut self) -> Result<Option<RunId>, FatalError> {
        let project_id = self.plan.project_id.clone();
        let project_id = project_id.as_str();

        let slots = match self.backend.concurrency(project_id).await {
            Ok(slots) => slots,
            Err(err) => {
                self.retryable(&err);
                return Ok(None);
            }
        };
        if slots.has_no_capacity() {
            return Err(FatalError::no_concurrency(project_id));
        }

        // The script can be renamed or removed between attempts, check every time.
        match self.script_exists().await {
            Ok(true) => {}
            Ok(false) => {
                let location = match &self.plan.bundle {
                    Some(bundle) => bundle.root().display().to_string(),
                    None => format!("project {project_id}"),
                };
                return Err(FatalError::invalid_script_path(
                    self.plan.script(),
                    &location,
                ));
            }
            Err(err) => {
                self.retryable(&err);
                return Ok(None);
            }
        }

        if slots.is_exhausted() {
            info!(
                project_id,
                running = slots.running,
                total = slots.total,
                "no test slot available"
            );
            self.notice_once(&format!(
                "No test slots available ({}/{} running)\n  → CLI will retry until the start timeout",
                slots.running, slots.total
            ));
            return Ok(None);
        }

        let response = self
            .backend
            .start_run(project_id, &self.plan.request, self.plan.bundle.as_ref())
            .await;

        match response {
            Ok(body) => match body.test_run_ids.into_iter().next() {
                Some(id) => {
                    let run_id = RunId::new(id);
                    info!(project_id, run_id = %run_id, "test run started");
                    self.sink
                        .notice(Tone::Info, &format!("Test run {run_id} started"));
                    Ok(Some(run_id))
                }
                None => {
                    self.retryable(&ClientError::InvalidResponse(
                        "start response carried no test run id".to_string(),
                    ));
                    Ok(None)
                }
            },
            Err(ClientError::Api { code, message, .. }) if is_fatal_launch_code(&code) => {
                Err(FatalError::server_rejected(&code, &message))
            }
            Err(err) => {
                self.retryable(&err);
                Ok(None)
            }
        }
    }

    async fn script_exists(&self) -> Result<bool, ClientError> {
        let script = self.plan.script();
        if let Some(bundle) = &self.plan.bundle {
            return Ok(bundle.contains(script));
        }
        let files = self.backend.project_files(&self.plan.project_id).await?;
        Ok(files.iter().any(|f| f == script))
    }

    fn retryable(&mut self, err: &ClientError) {
        warn!(
            project_id = %self.plan.project_id,
            code = err.api_code().unwrap_or("-"),
            error = %err,
            "launch attempt failed"
        );
        self.notice_once(&format!(
            "Failed to start the test run: {err}\n  → CLI will retry until the start timeout"
        ));
    }

    fn notice_once(&mut self, text: &str) {
        if !self.notice_shown {
            self.sink.notice(Tone::Warning, text);
            self.notice_shown = true;
        }
    }
}
