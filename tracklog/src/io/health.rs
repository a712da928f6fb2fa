//! Tracking server preflight.

use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, instrument};

pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTHY_BODY: &str = "OK";

#[derive(Debug, thiserror::Error)]
pub enum HealthCheckError {
    #[error(
        "could not connect to tracking server at {uri}. The server may require authentication, \
         did you forget to turn it on in the config?"
    )]
    MissingToken { uri: String },
    #[error(
        "could not connect to tracking server at {uri}: the token was rejected or the server is \
         unhealthy (status {status})"
    )]
    Rejected { uri: String, status: u16 },
    #[error("could not reach tracking server at {uri}")]
    Unreachable {
        uri: String,
        #[source]
        source: reqwest::Error,
    },
}

/// `GET <tracking_uri>/health` must answer exactly `OK`.
///
/// `token` is sent as a bearer token when present.
#[instrument(skip(token), fields(has_token = token.is_some()))]
pub fn health_check(tracking_uri: &str, token: Option<&str>) -> Result<(), HealthCheckError> {
    let uri = tracking_uri.trim_end_matches('/').to_string();
    let unreachable = |source| HealthCheckError::Unreachable {
        uri: uri.clone(),
        source,
    };

    let client = Client::builder()
        .timeout(HEALTH_TIMEOUT)
        .build()
        .map_err(unreachable)?;
    let mut request = client.get(format!("{uri}/health"));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().map_err(unreachable)?;
    let status = response.status().as_u16();
    let body = response.text().map_err(unreachable)?;
    debug!(status, "health endpoint answered");

    if body == HEALTHY_BODY {
        return Ok(());
    }
    match token {
        None => Err(HealthCheckError::MissingToken { uri }),
        Some(_) => Err(HealthCheckError::Rejected { uri, status }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve_once;

    #[test]
    fn healthy_server_passes_and_receives_token() {
        let server = serve_once(200, "OK");
        health_check(&server.uri, Some("secret")).expect("healthy");
        let request = server.request();
        assert!(request.starts_with("GET /health "));
        assert!(
            request
                .to_ascii_lowercase()
                .contains("authorization: bearer secret")
        );
    }

    #[test]
    fn unhealthy_without_token_suggests_authentication() {
        let server = serve_once(401, "Unauthorized");
        let err = health_check(&server.uri, None).expect_err("unhealthy");
        assert!(matches!(err, HealthCheckError::MissingToken { .. }));
        assert!(err.to_string().contains("authentication"));
        assert!(!server.request().to_ascii_lowercase().contains("authorization"));
    }

    #[test]
    fn unhealthy_with_token_reports_rejection() {
        let server = serve_once(403, "Forbidden");
        let err = health_check(&server.uri, Some("stale")).expect_err("unhealthy");
        assert!(matches!(err, HealthCheckError::Rejected { status: 403, .. }));
    }

    #[test]
    fn unreachable_server_is_reported() {
        let err = health_check("http://127.0.0.1:9", None).expect_err("unreachable");
        assert!(matches!(err, HealthCheckError::Unreachable { .. }));
    }
}
