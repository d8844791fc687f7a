//! Core types shared by the run client.
//!
//! Wire structs mirror the JSON the platform API returns; validation happens
//! here at the boundary so the session only ever sees typed values.

use serde::{Deserialize, Serialize};

/// Opaque run identifier assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Overall status of a remote test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Init,
    Created,
    Pending,
    Success,
    Error,
    Failure,
    Terminated,
    SystemError,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
            Self::Failure => "failure",
            Self::Terminated => "terminated",
            Self::SystemError => "system_error",
        }
    }

    /// Parse a wire status string. Unknown strings return `None` so the
    /// caller decides how to treat them.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "created" => Some(Self::Created),
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "failure" => Some(Self::Failure),
            "terminated" => Some(Self::Terminated),
            "system_error" => Some(Self::SystemError),
            _ => None,
        }
    }

    /// Still queued or executing on the server.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Init | Self::Created | Self::Pending)
    }

    /// Settled from the polling loop's point of view.
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step. Steps share the run status vocabulary.
pub type StepStatus = RunStatus;

/// Step display mode reported by the server.
pub const STEP_MODE_FETCH: &str = "fetch";

// --- Wire types ---

/// One step as returned by the run result endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Raw status string; see [`Step::status`].
    pub status: String,
    #[serde(default)]
    pub description: String,
    /// Elapsed seconds.
    #[serde(default)]
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl Step {
    /// Parsed status; `None` for strings the client does not know.
    pub fn status(&self) -> Option<StepStatus> {
        RunStatus::parse(&self.status)
    }

    /// Still queued or executing. Statuses the client does not know are not
    /// pending, so they get reported instead of holding up later steps.
    pub fn is_pending(&self) -> bool {
        self.status().is_some_and(|s| s.is_pending())
    }
}

/// Body of `GET /runs/{id}/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Normalized step entry written to the JSON result.
///
/// `index` is the 1-based number shown to the user and keeps counting
/// across relaunches within one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    pub status: StepStatus,
    pub description: String,
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl StepRecord {
    /// Steps in `fetch` mode are informational regardless of status.
    pub fn is_info(&self) -> bool {
        self.mode.as_deref() == Some(STEP_MODE_FETCH)
    }
}

/// Test slot counts for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySnapshot {
    pub running: i64,
    pub available: i64,
    pub total: i64,
}

impl ConcurrencySnapshot {
    /// The subscription has no test slots at all.
    pub fn has_no_capacity(&self) -> bool {
        self.total <= 0
    }

    /// All slots are currently taken.
    pub fn is_exhausted(&self) -> bool {
        self.available <= 0
    }
}

/// Body of `POST /projects/{id}/runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchResponse {
    #[serde(rename = "testRunIDs", default)]
    pub test_run_ids: Vec<String>,
}

/// A project visible to the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub space_id: String,
    #[serde(default)]
    pub space_name: String,
    #[serde(default)]
    pub user_role: String,
}

/// A named dataset attached to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub id: String,
    pub name: String,
}

/// Error body returned by the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Server error codes that can never succeed on retry.
pub const FATAL_LAUNCH_CODES: &[&str] = &[
    "ACCOUNT_SUSPENDED",
    "SPACE_NOT_FOUND",
    "PROJECT_NOT_FOUND",
    "BILLING_ACCOUNT_NOT_FOUND",
    "PLAN_NOT_FOUND",
    "FEATURE_DISABLED",
    "SPACE_DISABLED",
];

/// Whether a launch error code is unrecoverable.
pub fn is_fatal_launch_code(code: &str) -> bool {
    FATAL_LAUNCH_CODES.contains(&code)
}

/// Normalize a user-supplied script path to the project-relative form the
/// server uses: forward slashes, no leading `./` or `/`.
pub fn normalize_script_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    loop {
        if let Some(rest) = normalized.strip_prefix("./") {
            normalized = rest.to_string();
        } else if let Some(rest) = normalized.strip_prefix('/') {
            normalized = rest.to_string();
        } else {
            break;
        }
    }
    normalized
}
