//! Web UI links for finished runs.
//!
//! The public cloud serves the web app and share pages from dedicated hosts.
//! On-premise installs serve the web app from the API origin and have no
//! share service.

use crate::types::RunId;
use url::Url;

/// API host of the public cloud deployment.
pub const CLOUD_API_HOST: &str = "api.probe.dev";
const CLOUD_APP_ORIGIN: &str = "https://app.probe.dev";
const CLOUD_SHARE_ORIGIN: &str = "https://share.probe.dev";

/// Links shown after a run settles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLinks {
    pub result_url: Option<String>,
    pub share_url: Option<String>,
}

fn points_at_cloud(api: &Url) -> bool {
    api.host_str()
        .is_some_and(|host| host.eq_ignore_ascii_case(CLOUD_API_HOST))
        && api.port().is_none()
}

/// Whether the API URL points at the public cloud.
pub fn is_cloud(api_url: &str) -> bool {
    Url::parse(api_url).is_ok_and(|api| points_at_cloud(&api))
}

/// Build the result and share links for a run.
///
/// On-premise links reuse only the scheme, host and port of the API URL, so
/// credentials and paths in it never reach the printed link. An API URL that
/// does not parse, or has no host, yields no links.
pub fn run_links(api_url: &str, project_id: &str, run_id: &RunId) -> RunLinks {
    let Ok(api) = Url::parse(api_url) else {
        return RunLinks::default();
    };
    if points_at_cloud(&api) {
        return RunLinks {
            result_url: Some(format!(
                "{CLOUD_APP_ORIGIN}/projects/{project_id}/runs/{run_id}"
            )),
            share_url: Some(format!("{CLOUD_SHARE_ORIGIN}/runs/{run_id}")),
        };
    }

    let origin = api.origin();
    if !origin.is_tuple() {
        return RunLinks::default();
    }
    RunLinks {
        result_url: Some(format!(
            "{}/projects/{project_id}/runs/{run_id}",
            origin.ascii_serialization()
        )),
        share_url: None,
    }
}
