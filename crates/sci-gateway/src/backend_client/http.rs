//! reqwest plumbing shared by every backend client.

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::BackendError;

/// Client used for one backend. The per-call deadline is enforced by the
/// orchestrator, this timeout only guards against sockets that never close.
pub fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout + Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

pub fn map_transport_error(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        BackendError::Unavailable(err.to_string())
    } else if err.is_decode() || err.is_body() {
        BackendError::Protocol(err.to_string())
    } else {
        BackendError::Unavailable(err.to_string())
    }
}

/// Turn a non-success status into a [`BackendError`]. 429/502/503 mean the
/// backend is busy or down; everything else is a hard rejection.
pub async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!("Backend answered {}: {}", status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            Err(BackendError::Unavailable(format!("{}: {}", status, body)))
        }
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            Err(BackendError::Unavailable(format!("{}: upstream timed out", status)))
        }
        _ => Err(BackendError::Rejected {
            status: status.as_u16(),
            body,
        }),
    }
}

pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| BackendError::Protocol(format!("failed to read body: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| BackendError::Protocol(format!("unexpected response body: {}", e)))
}

pub async fn post_json<B, T>(
    http: &reqwest::Client,
    url: &str,
    body: &B,
    timeout: Duration,
) -> Result<T, BackendError>
where
    B: serde::Serialize + ?Sized,
    T: DeserializeOwned,
{
    let response = http
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| map_transport_error(e, timeout))?;
    read_json(check_status(response).await?).await
}

/// GET `url` and accept any 2xx as alive.
pub async fn probe_url(http: &reqwest::Client, url: &str, timeout: Duration) -> Result<(), BackendError> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| map_transport_error(e, timeout))?;
    check_status(response).await.map(|_| ())
}
