//! HTTP response classification for upstream producers.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use coalesce_core::error::{CoalesceError, Result, TerminalReason};

use crate::retry::AttemptError;

/// Maps a response status to an attempt failure, or `None` on success.
///
/// - 401, 403, 404 and any other 4xx are terminal
/// - 429 is rate limited
/// - 5xx and anything unexpected is an upstream failure
pub fn classify_status(status: StatusCode) -> Option<AttemptError> {
    if status.is_success() {
        return None;
    }

    let code = status.as_u16();
    let message = format!("HTTP {}", status);

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(AttemptError::RateLimited(message));
    }
    match TerminalReason::from_status(code) {
        Some(reason) => Some(AttemptError::terminal(reason, message)),
        None => Some(AttemptError::Upstream(message)),
    }
}

/// Maps a transport error (timeout, connect, body read) to an attempt failure.
pub fn classify_transport(err: &reqwest::Error) -> AttemptError {
    if let Some(status) = err.status() {
        if let Some(classified) = classify_status(status) {
            return classified;
        }
    }
    if err.is_decode() {
        return AttemptError::Malformed(err.to_string());
    }
    AttemptError::Upstream(err.to_string())
}

/// Builds an HTTP client with the given timeout.
pub fn build_client(timeout: std::time::Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CoalesceError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// GETs `url` and decodes a JSON body, classifying every failure.
///
/// A body that does not decode as `T` is [`AttemptError::Malformed`].
#[instrument(skip(client, url), fields(host = url.host_str().unwrap_or_default()))]
pub async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: reqwest::Url,
) -> std::result::Result<T, AttemptError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_transport(&e))?;

    let status = response.status();
    if let Some(failure) = classify_status(status) {
        debug!(%status, "Upstream responded with failure status");
        return Err(failure);
    }

    let body = response.bytes().await.map_err(|e| classify_transport(&e))?;
    serde_json::from_slice(&body).map_err(|e| AttemptError::Malformed(e.to_string()))
}
