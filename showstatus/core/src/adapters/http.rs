//! HTTP Adapters
//!
//! JSON-over-HTTP implementations of the feed traits.
//!
//! # Endpoints
//!
//! Each adapter is configured with a base URL:
//! - show-control: `GET {base}/status`, `POST {base}/request`
//! - playback controller: `GET {base}/status`
//! - speaker: `GET {base}/status`, `POST {base}/command`
//!
//! # Normalization
//!
//! - missing or malformed base URL → `CONFIG_ERROR`, no request made
//! - non-2xx status → `HTTP_ERROR`
//! - transport failure or unparseable body → `NETWORK_ERROR`
//! - a 2xx body shaped like an envelope (`{"success": ...}`) is passed through,
//!   with a domain default code when it failed without one
//! - any other 2xx body is parsed as the payload itself

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{PlaybackAdapter, ShowControlAdapter, SpeakerAdapter};
use crate::clock::SharedClock;
use crate::envelope::{ErrorCode, ResultEnvelope};
use crate::model::{
    ControllerData, RequestReceipt, ShowData, SongRequest, SpeakerCommand, SpeakerSession,
};

/// Shared JSON client for one upstream
#[derive(Clone)]
struct JsonClient {
    feed: &'static str,
    base_url: Option<String>,
    http_client: reqwest::Client,
    clock: SharedClock,
}

impl JsonClient {
    fn new(feed: &'static str, base_url: Option<String>, timeout: Duration, clock: SharedClock) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(feed = feed, error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            feed,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            http_client,
            clock,
        }
    }

    fn url<T>(&self, path: &str) -> Result<String, ResultEnvelope<T>> {
        match self.base_url.as_deref() {
            Some(base) if base.starts_with("http://") || base.starts_with("https://") => {
                Ok(format!("{base}{path}"))
            }
            Some(base) => Err(ResultEnvelope::err(
                ErrorCode::Config,
                format!("{} endpoint is not an http(s) URL: {base}", self.feed),
                self.clock.now_ms(),
            )),
            None => Err(ResultEnvelope::err(
                ErrorCode::Config,
                format!("{} endpoint is not configured", self.feed),
                self.clock.now_ms(),
            )),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, domain_code: ErrorCode) -> ResultEnvelope<T> {
        let url = match self.url(path) {
            Ok(url) => url,
            Err(env) => return env,
        };
        self.execute(self.http_client.get(url), domain_code).await
    }

    async fn post<B, T>(&self, path: &str, body: &B, domain_code: ErrorCode) -> ResultEnvelope<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = match self.url(path) {
            Ok(url) => url,
            Err(env) => return env,
        };
        self.execute(self.http_client.post(url).json(body), domain_code)
            .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        domain_code: ErrorCode,
    ) -> ResultEnvelope<T> {
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(feed = self.feed, error = %e, "Request failed");
                return ResultEnvelope::err(ErrorCode::Network, e.to_string(), self.clock.now_ms());
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(feed = self.feed, status = %status, "Upstream returned error status");
            return ResultEnvelope::err(
                ErrorCode::Http,
                format!("{} returned HTTP {}", self.feed, status.as_u16()),
                self.clock.now_ms(),
            );
        }

        match response.json::<Value>().await {
            Ok(body) => normalize(body, domain_code, self.clock.now_ms()),
            Err(e) => ResultEnvelope::err(ErrorCode::Network, e.to_string(), self.clock.now_ms()),
        }
    }
}

/// Turn a 2xx JSON body into an envelope
fn normalize<T: DeserializeOwned>(body: Value, domain_code: ErrorCode, now_ms: u64) -> ResultEnvelope<T> {
    let is_envelope = body
        .as_object()
        .is_some_and(|o| o.get("success").is_some_and(Value::is_boolean));
    if !is_envelope {
        return match serde_json::from_value::<T>(body) {
            Ok(data) => ResultEnvelope::ok(data, now_ms),
            Err(e) => ResultEnvelope::err(ErrorCode::Network, format!("invalid payload: {e}"), now_ms),
        };
    }

    let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);
    let error = body.get("error").and_then(Value::as_str).map(str::to_string);
    let error_code = body
        .get("errorCode")
        .and_then(Value::as_str)
        .map(ErrorCode::from);

    if !success {
        return ResultEnvelope {
            success: false,
            timestamp: now_ms,
            data: None,
            error: Some(error.unwrap_or_else(|| "upstream reported failure".to_string())),
            error_code: Some(error_code.unwrap_or(domain_code)),
        };
    }

    let data = body.get("data").cloned().unwrap_or(Value::Null);
    match serde_json::from_value::<T>(data) {
        Ok(data) => ResultEnvelope::ok(data, now_ms),
        Err(e) => ResultEnvelope::err(ErrorCode::Network, format!("invalid payload: {e}"), now_ms),
    }
}

// ============================================================================
// Feed adapters
// ============================================================================

/// Show-control service over HTTP
#[derive(Clone)]
pub struct HttpShowAdapter {
    client: JsonClient,
}

impl HttpShowAdapter {
    /// Create an adapter for `base_url`
    #[must_use]
    pub fn new(base_url: Option<String>, timeout: Duration, clock: SharedClock) -> Self {
        Self {
            client: JsonClient::new("show", base_url, timeout, clock),
        }
    }
}

#[async_trait]
impl ShowControlAdapter for HttpShowAdapter {
    fn name(&self) -> &str {
        "http-show"
    }

    async fn fetch_show(&self) -> ResultEnvelope<ShowData> {
        self.client.get("/status", ErrorCode::Unknown).await
    }

    async fn request_song(&self, request: &SongRequest) -> ResultEnvelope<RequestReceipt> {
        self.client
            .post("/request", request, ErrorCode::RequestRejected)
            .await
    }
}

/// Playback controller over HTTP
#[derive(Clone)]
pub struct HttpPlaybackAdapter {
    client: JsonClient,
}

impl HttpPlaybackAdapter {
    /// Create an adapter for `base_url`
    #[must_use]
    pub fn new(base_url: Option<String>, timeout: Duration, clock: SharedClock) -> Self {
        Self {
            client: JsonClient::new("controller", base_url, timeout, clock),
        }
    }
}

#[async_trait]
impl PlaybackAdapter for HttpPlaybackAdapter {
    fn name(&self) -> &str {
        "http-controller"
    }

    async fn fetch_playback(&self) -> ResultEnvelope<ControllerData> {
        self.client.get("/status", ErrorCode::Unknown).await
    }
}

/// Speaker hardware service over HTTP
#[derive(Clone)]
pub struct HttpSpeakerAdapter {
    client: JsonClient,
}

impl HttpSpeakerAdapter {
    /// Create an adapter for `base_url`
    #[must_use]
    pub fn new(base_url: Option<String>, timeout: Duration, clock: SharedClock) -> Self {
        Self {
            client: JsonClient::new("speaker", base_url, timeout, clock),
        }
    }
}

#[async_trait]
impl SpeakerAdapter for HttpSpeakerAdapter {
    fn name(&self) -> &str {
        "http-speaker"
    }

    async fn fetch_speaker(&self) -> ResultEnvelope<SpeakerSession> {
        self.client.get("/status", ErrorCode::SpeakerApiFailed).await
    }

    async fn send_command(&self, command: &SpeakerCommand) -> ResultEnvelope<SpeakerSession> {
        self.client
            .post("/command", command, ErrorCode::SpeakerApiFailed)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::ShowStatus;

    #[tokio::test]
    async fn test_missing_endpoint_is_config_error() {
        let clock = ManualClock::shared(1_000, 12);
        let adapter = HttpShowAdapter::new(None, Duration::from_secs(1), clock);
        let env = adapter.fetch_show().await;
        assert!(!env.success);
        assert_eq!(env.error_code, Some(ErrorCode::Config));
        assert_eq!(env.timestamp, 1_000);
    }

    #[tokio::test]
    async fn test_non_http_endpoint_is_config_error() {
        let clock = ManualClock::shared(1_000, 12);
        let adapter = HttpSpeakerAdapter::new(Some("ftp://speaker".into()), Duration::from_secs(1), clock);
        let env = adapter.send_command(&SpeakerCommand::viewer(false, true)).await;
        assert_eq!(env.error_code, Some(ErrorCode::Config));
    }

    #[test]
    fn test_normalize_raw_payload() {
        let body = serde_json::json!({"showStatus": "ended", "requestsEnabled": false});
        let env: ResultEnvelope<ShowData> = normalize(body, ErrorCode::Unknown, 5);
        assert!(env.success);
        assert_eq!(env.data().map(|d| d.show_status), Some(ShowStatus::Ended));
    }

    #[test]
    fn test_normalize_envelope_failure_keeps_upstream_code() {
        let body = serde_json::json!({
            "success": false,
            "error": "Move closer to the show",
            "errorCode": "PROXIMITY_REQUIRED"
        });
        let env: ResultEnvelope<SpeakerSession> = normalize(body, ErrorCode::SpeakerApiFailed, 5);
        assert_eq!(env.error_code, Some(ErrorCode::ProximityRequired));
        assert_eq!(env.error.as_deref(), Some("Move closer to the show"));
    }

    #[test]
    fn test_normalize_envelope_failure_without_code_uses_domain_code() {
        let body = serde_json::json!({"success": false});
        let env: ResultEnvelope<RequestReceipt> = normalize(body, ErrorCode::RequestRejected, 5);
        assert_eq!(env.error_code, Some(ErrorCode::RequestRejected));
    }

    #[test]
    fn test_normalize_envelope_success_unwraps_data() {
        let body = serde_json::json!({"success": true, "data": {"queuePosition": 4}});
        let env: ResultEnvelope<RequestReceipt> = normalize(body, ErrorCode::RequestRejected, 5);
        assert_eq!(env.data().and_then(|r| r.queue_position), Some(4));
    }

    #[test]
    fn test_normalize_bad_payload_is_network_error() {
        let body = serde_json::json!({"secondsElapsed": "soon"});
        let env: ResultEnvelope<ControllerData> = normalize(body, ErrorCode::Unknown, 5);
        assert_eq!(env.error_code, Some(ErrorCode::Network));
    }
}
