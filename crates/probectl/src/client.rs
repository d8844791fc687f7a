//! HTTP client for the probe platform API.
//!
//! [`ApiContext`] carries everything that used to be process-wide auth state
//! (base URL, token, impersonated account). The session only sees the
//! [`RunBackend`] trait so it can be driven by an in-memory double in tests.

use crate::bundle::SourceBundle;
use async_trait::async_trait;
use probe_core::types::{
    ApiErrorBody, ConcurrencySnapshot, DatasetSummary, LaunchResponse, ProjectSummary, RunId,
    RunResult,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Header used by administrators to act on behalf of another account.
const ACCOUNT_HEADER: &str = "x-probe-account";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach the probe API at {addr}\n  → check your network or set PROBE_API_URL")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("API error {code} ({status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: check PROBE_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("no project matches '{0}'")]
    ProjectNotFound(String),

    #[error("'{hint}' matches several projects: {}", matches.join(", "))]
    AmbiguousProject { hint: String, matches: Vec<String> },

    #[error("no dataset named '{0}' in this project")]
    DatasetNotFound(String),
}

impl ClientError {
    /// Server-assigned error code, when the API returned one.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Connection and identity settings shared by every request.
#[derive(Debug, Clone)]
pub struct ApiContext {
    pub base_url: String,
    pub token: Option<String>,
    pub account: Option<String>,
}

impl ApiContext {
    pub fn new(base_url: &str, token: Option<&str>, account: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            account: account.map(String::from),
        }
    }
}

/// Parameters of a start-run request (`POST /projects/{id}/runs`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub script: String,
    pub browser: String,
    pub width: u32,
    pub height: u32,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_sha256: Option<String>,
}

/// Operations the run session needs from the platform.
#[async_trait]
pub trait RunBackend: Send + Sync {
    /// `GET /projects/{id}/concurrency`
    async fn concurrency(&self, project_id: &str) -> Result<ConcurrencySnapshot, ClientError>;

    /// `GET /projects/{id}/files`, sorted, folders end with `/`.
    async fn project_files(&self, project_id: &str) -> Result<Vec<String>, ClientError>;

    /// `POST /projects/{id}/runs`, multipart when a bundle is attached.
    async fn start_run(
        &self,
        project_id: &str,
        req: &StartRunRequest,
        bundle: Option<&SourceBundle>,
    ) -> Result<LaunchResponse, ClientError>;

    /// `GET /runs/{id}/result`; `None` while the server has nothing yet.
    async fn run_result(&self, run_id: &RunId) -> Result<Option<RunResult>, ClientError>;

    /// `POST /runs/{id}/stop`
    async fn stop_run(&self, run_id: &RunId) -> Result<(), ClientError>;
}

#[derive(Debug, Deserialize)]
struct ListProjectsResponse {
    projects: Vec<ProjectSummary>,
}

#[derive(Debug, Deserialize)]
struct ListFilesResponse {
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListDatasetsResponse {
    datasets: Vec<DatasetSummary>,
}

/// HTTP client for the platform API.
#[derive(Debug)]
pub struct Client {
    ctx: ApiContext,
    http: reqwest::Client,
}

impl Client {
    pub fn new(ctx: ApiContext) -> Self {
        Self {
            ctx,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.ctx.base_url, path)
    }

    /// Build headers with auth and impersonation.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("probectl/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = &self.ctx.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Some(account) = &self.ctx.account {
            if let Ok(value) = HeaderValue::from_str(account) {
                headers.insert(HeaderName::from_static(ACCOUNT_HEADER), value);
            }
        }
        headers
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
        let message = body
            .message
            .unwrap_or_else(|| "unknown error".to_string());

        match body.code {
            Some(code) => ClientError::Api {
                status,
                code,
                message,
            },
            None if status == 404 => ClientError::NotFound(message),
            None => ClientError::HttpError { status, message },
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self
            .http
            .get(self.url(path))
            .headers(self.headers())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Resolve a project by id or name.
    /// GET /projects
    pub async fn find_project(&self, hint: &str) -> Result<ProjectSummary, ClientError> {
        let body: ListProjectsResponse = self.get_json("/projects").await?;
        match_project(body.projects, hint)
    }

    /// Look up a dataset id by name.
    /// GET /projects/{id}/datasets?name=...
    pub async fn resolve_dataset_id(
        &self,
        project_id: &str,
        name: &str,
    ) -> Result<Option<String>, ClientError> {
        let path = format!(
            "/projects/{project_id}/datasets?name={}",
            urlencoding::encode(name)
        );
        let body: ListDatasetsResponse = self.get_json(&path).await?;
        Ok(body
            .datasets
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .map(|d| d.id))
    }
}

/// Pick the single project matching `hint`: exact id, then exact name
/// (case-insensitive), then a unique name substring.
pub fn match_project(
    projects: Vec<ProjectSummary>,
    hint: &str,
) -> Result<ProjectSummary, ClientError> {
    let needle = hint.trim().to_lowercase();

    if let Some(p) = projects.iter().find(|p| p.id == hint.trim()) {
        return Ok(p.clone());
    }

    let exact: Vec<&ProjectSummary> = projects
        .iter()
        .filter(|p| p.name.to_lowercase() == needle)
        .collect();
    let candidates = if exact.is_empty() {
        projects
            .iter()
            .filter(|p| p.name.to_lowercase().contains(&needle))
            .collect()
    } else {
        exact
    };

    match candidates.as_slice() {
        [] => Err(ClientError::ProjectNotFound(hint.to_string())),
        [single] => Ok((*single).clone()),
        many => Err(ClientError::AmbiguousProject {
            hint: hint.to_string(),
            matches: many
                .iter()
                .map(|p| format!("{} ({}/{})", p.name, p.space_name, p.id))
                .collect(),
        }),
    }
}

#[async_trait]
impl RunBackend for Client {
    async fn concurrency(&self, project_id: &str) -> Result<ConcurrencySnapshot, ClientError> {
        self.get_json(&format!("/projects/{project_id}/concurrency"))
            .await
    }

    async fn project_files(&self, project_id: &str) -> Result<Vec<String>, ClientError> {
        let body: ListFilesResponse = self
            .get_json(&format!("/projects/{project_id}/files"))
            .await?;
        let mut files = body.files;
        files.sort();
        Ok(files)
    }

    async fn start_run(
        &self,
        project_id: &str,
        req: &StartRunRequest,
        bundle: Option<&SourceBundle>,
    ) -> Result<LaunchResponse, ClientError> {
        let url = self.url(&format!("/projects/{project_id}/runs"));
        let request = self.http.post(&url).headers(self.headers());

        let request = match bundle {
            Some(bundle) => {
                let params = serde_json::to_string(req)
                    .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
                let part = reqwest::multipart::Part::bytes(bundle.bytes().to_vec())
                    .file_name("bundle.zip")
                    .mime_str("application/zip")?;
                debug!(
                    project_id,
                    bytes = bundle.len(),
                    sha256 = %bundle.sha256(),
                    "uploading source bundle"
                );
                let form = reqwest::multipart::Form::new()
                    .text("params", params)
                    .part("bundle", part);
                request.multipart(form)
            }
            None => request.json(req),
        };

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn run_result(&self, run_id: &RunId) -> Result<Option<RunResult>, ClientError> {
        let url = self.url(&format!("/runs/{run_id}/result"));
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        let status = response.status().as_u16();
        if status == 404 || status == 204 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let body: RunResult = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(Some(body))
    }

    async fn stop_run(&self, run_id: &RunId) -> Result<(), ClientError> {
        let url = self.url(&format!("/runs/{run_id}/stop"));
        let response = self.http.post(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        Ok(())
    }
}
