//! In-memory doubles for session tests.

use crate::bundle::SourceBundle;
use crate::client::{ClientError, RunBackend, StartRunRequest};
use crate::render::{OutputSink, Tone};
use async_trait::async_trait;
use probe_core::types::{ConcurrencySnapshot, LaunchResponse, RunId, RunResult, Step};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Notice(Tone, String),
    Step(Tone, String),
    Row(Vec<String>),
    Json(serde_json::Value),
}

/// Sink that records everything it is given.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn step_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Step(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Notice(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn notices_containing(&self, needle: &str) -> usize {
        self.notices().iter().filter(|n| n.contains(needle)).count()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        self.events().into_iter().rev().find_map(|e| match e {
            SinkEvent::Json(value) => Some(value),
            _ => None,
        })
    }
}

impl OutputSink for MemorySink {
    fn notice(&self, tone: Tone, text: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Notice(tone, text.to_string()));
    }

    fn step_line(&self, tone: Tone, text: &str) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Step(tone, text.to_string()));
    }

    fn table_row(&self, columns: &[String]) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Row(columns.to_vec()));
    }

    fn emit_json(&self, value: &serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Json(value.clone()));
    }
}

pub fn step(status: &str, description: &str, time: f64) -> Step {
    Step {
        status: status.to_string(),
        description: description.to_string(),
        time,
        error: None,
        mode: None,
    }
}

pub fn result(status: &str, steps: Vec<Step>) -> Option<RunResult> {
    Some(RunResult {
        status: status.to_string(),
        steps,
    })
}

pub fn slots(running: i64, available: i64, total: i64) -> ConcurrencySnapshot {
    ConcurrencySnapshot {
        running,
        available,
        total,
    }
}

#[derive(Debug)]
struct BackendState {
    concurrency: VecDeque<Result<ConcurrencySnapshot, ClientError>>,
    concurrency_default: ConcurrencySnapshot,
    files: Vec<String>,
    launches: VecDeque<Result<LaunchResponse, ClientError>>,
    results: HashMap<String, VecDeque<Option<RunResult>>>,
    start_calls: Vec<(StartRunRequest, bool)>,
    concurrency_calls: u32,
    result_calls: u32,
    stop_calls: Vec<RunId>,
    stop_hangs: bool,
}

/// Scripted [`RunBackend`].
///
/// Launches without a scripted response succeed with ids `run-1`, `run-2`,
/// ... Result queues repeat their last entry once drained.
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(BackendState {
                concurrency: VecDeque::new(),
                concurrency_default: slots(0, 2, 2),
                files: vec!["tests/".to_string(), "tests/login.js".to_string()],
                launches: VecDeque::new(),
                results: HashMap::new(),
                start_calls: Vec::new(),
                concurrency_calls: 0,
                result_calls: 0,
                stop_calls: Vec::new(),
                stop_hangs: false,
            }),
        }
    }
}

impl MockBackend {
    pub fn with_concurrency(self, snapshot: ConcurrencySnapshot) -> Self {
        self.state.lock().unwrap().concurrency_default = snapshot;
        self
    }

    pub fn push_concurrency(self, result: Result<ConcurrencySnapshot, ClientError>) -> Self {
        self.state.lock().unwrap().concurrency.push_back(result);
        self
    }

    pub fn with_files(self, files: &[&str]) -> Self {
        self.state.lock().unwrap().files = files.iter().map(|f| (*f).to_string()).collect();
        self
    }

    pub fn push_launch(self, result: Result<LaunchResponse, ClientError>) -> Self {
        self.state.lock().unwrap().launches.push_back(result);
        self
    }

    pub fn with_results(self, run_id: &str, results: Vec<Option<RunResult>>) -> Self {
        self.state
            .lock()
            .unwrap()
            .results
            .insert(run_id.to_string(), results.into());
        self
    }

    pub fn hang_on_stop(self) -> Self {
        self.state.lock().unwrap().stop_hangs = true;
        self
    }

    pub fn start_calls(&self) -> Vec<(StartRunRequest, bool)> {
        self.state.lock().unwrap().start_calls.clone()
    }

    pub fn concurrency_calls(&self) -> u32 {
        self.state.lock().unwrap().concurrency_calls
    }

    pub fn result_calls(&self) -> u32 {
        self.state.lock().unwrap().result_calls
    }

    pub fn stop_calls(&self) -> Vec<RunId> {
        self.state.lock().unwrap().stop_calls.clone()
    }
}

pub fn launched(id: &str) -> Result<LaunchResponse, ClientError> {
    Ok(LaunchResponse {
        test_run_ids: vec![id.to_string()],
    })
}

pub fn api_error(code: &str) -> ClientError {
    ClientError::Api {
        status: 400,
        code: code.to_string(),
        message: format!("{code} from server"),
    }
}

#[async_trait]
impl RunBackend for MockBackend {
    async fn concurrency(&self, _project_id: &str) -> Result<ConcurrencySnapshot, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.concurrency_calls += 1;
        match state.concurrency.pop_front() {
            Some(result) => result,
            None => Ok(state.concurrency_default),
        }
    }

    async fn project_files(&self, _project_id: &str) -> Result<Vec<String>, ClientError> {
        Ok(self.state.lock().unwrap().files.clone())
    }

    async fn start_run(
        &self,
        _project_id: &str,
        req: &StartRunRequest,
        bundle: Option<&SourceBundle>,
    ) -> Result<LaunchResponse, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.start_calls.push((req.clone(), bundle.is_some()));
        let n = state.start_calls.len();
        match state.launches.pop_front() {
            Some(result) => result,
            None => launched(&format!("run-{n}")),
        }
    }

    async fn run_result(&self, run_id: &RunId) -> Result<Option<RunResult>, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.result_calls += 1;
        let Some(queue) = state.results.get_mut(run_id.as_ref()) else {
            return Ok(None);
        };
        if queue.len() > 1 {
            Ok(queue.pop_front().flatten())
        } else {
            Ok(queue.front().cloned().flatten())
        }
    }

    async fn stop_run(&self, run_id: &RunId) -> Result<(), ClientError> {
        let hangs = {
            let mut state = self.state.lock().unwrap();
            state.stop_calls.push(run_id.clone());
            state.stop_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
