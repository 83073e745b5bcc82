use crate::config::{Config, Fallbacks};
use crate::errors::{FetchError, GateError};
use async_trait::async_trait;
use attribution::AttributionAggregator;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Body key carrying the install identifier.
pub const INSTALL_ID_FIELD: &str = "af_id";

/// Endpoints containing this marker are unfilled build-time placeholders.
const PLACEHOLDER_MARKER: &str = "<#";

/// Per-request facts about the device, captured when a fetch cycle starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceContext {
    pub bundle_id: Option<String>,
    pub platform: String,
    pub locale: String,
    pub store_id: Option<String>,
    pub push_token: Option<String>,
    pub project_id: Option<String>,
}

/// The routing decision returned by the config endpoint.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RemoteConfigResponse {
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Unix timestamp in seconds. Informational only.
    #[serde(default)]
    pub expires: Option<f64>,
}

impl RemoteConfigResponse {
    /// The web destination, if the server approved one and it parses as an
    /// absolute http(s) URL.
    pub fn destination(&self) -> Option<Url> {
        if !self.ok {
            return None;
        }
        let raw = self.url.as_deref()?.trim();
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
            Ok(url) => {
                tracing::warn!(scheme = url.scheme(), "Ignoring destination with unsupported scheme");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unparseable destination");
                None
            }
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let seconds = self.expires.filter(|s| s.is_finite())?;
        DateTime::from_timestamp_millis((seconds * 1000.0) as i64)
    }

    /// A non-2xx response: never ok, but keeps whatever the body carried.
    fn rejected(body: Option<ErrorBody>) -> Self {
        let body = body.unwrap_or_default();
        RemoteConfigResponse {
            ok: false,
            message: body.message,
            url: body.url,
            expires: body.expires,
        }
    }
}

/// Body of an error status. Every field is optional, `ok` included.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    expires: Option<f64>,
}

/// Where the gate gets its routing decision from.
#[async_trait]
pub trait RoutingSource: Send + Sync {
    async fn fetch_routing(
        &self,
        context: &DeviceContext,
    ) -> Result<RemoteConfigResponse, FetchError>;
}

/// Posts the attribution snapshot and device facts to the config endpoint.
pub struct ConfigClient {
    client: reqwest::Client,
    endpoint: String,
    fallbacks: Fallbacks,
    attribution: AttributionAggregator,
}

impl ConfigClient {
    pub fn new(config: &Config, attribution: AttributionAggregator) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(ConfigClient {
            client,
            endpoint: config.endpoint.clone(),
            fallbacks: config.fallbacks.clone(),
            attribution,
        })
    }

    fn endpoint(&self) -> Result<Url, FetchError> {
        let raw = self.endpoint.trim();
        if raw.is_empty() || raw.contains(PLACEHOLDER_MARKER) {
            return Err(FetchError::NotConfigured);
        }

        let url = Url::parse(raw).map_err(|e| FetchError::InvalidEndpoint(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidEndpoint(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// The request body: attribution snapshot first, then the fixed fields,
    /// which win over attribution keys of the same name.
    pub fn build_body(&self, context: &DeviceContext) -> Result<Vec<u8>, FetchError> {
        let mut payload = self.attribution.snapshot().to_json_map();

        payload.insert(
            INSTALL_ID_FIELD.to_string(),
            Value::String(self.attribution.ensure_install_id()),
        );
        if let Some(bundle_id) = &context.bundle_id {
            payload.insert("bundle_id".to_string(), Value::String(bundle_id.clone()));
        }
        payload.insert("os".to_string(), Value::String(context.platform.clone()));
        payload.insert("locale".to_string(), Value::String(context.locale.clone()));
        if let Some(store_id) = &context.store_id {
            payload.insert("store_id".to_string(), Value::String(store_id.clone()));
        }
        payload.insert(
            "push_token".to_string(),
            Value::String(or_fallback(&context.push_token, &self.fallbacks.push_token)),
        );
        payload.insert(
            "firebase_project_id".to_string(),
            Value::String(or_fallback(&context.project_id, &self.fallbacks.project_id)),
        );

        serde_json::to_vec(&payload).map_err(|e| FetchError::Encoding(e.to_string()))
    }
}

fn or_fallback(value: &Option<String>, fallback: &str) -> String {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[async_trait]
impl RoutingSource for ConfigClient {
    async fn fetch_routing(
        &self,
        context: &DeviceContext,
    ) -> Result<RemoteConfigResponse, FetchError> {
        let endpoint = self.endpoint()?;
        let body = self.build_body(context)?;

        tracing::debug!(endpoint = %endpoint, bytes = body.len(), "Requesting routing config");

        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(classify)?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()));
        }

        let body = serde_json::from_slice::<ErrorBody>(&bytes).ok();
        tracing::warn!(
            status = status.as_u16(),
            decoded = body.is_some(),
            "Config endpoint returned an error status"
        );
        Ok(RemoteConfigResponse::rejected(body))
    }
}

/// Maps transport failures onto fetch errors. Timeouts, refused connections
/// and dropped connections count as connectivity problems.
fn classify(error: reqwest::Error) -> FetchError {
    if error.is_timeout() || error.is_connect() || is_connection_lost(&error) {
        FetchError::Connectivity(error.to_string())
    } else if error.is_decode() {
        FetchError::Decode(error.to_string())
    } else {
        FetchError::Request(error.to_string())
    }
}

fn is_connection_lost(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            );
        }
        source = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PROJECT_ID_FALLBACK, DEFAULT_PUSH_TOKEN_FALLBACK};
    use crate::testutils::{CLOSED_PORT_URL, json_response, start_mock_server};
    use attribution::{FragmentSource, RawValue};
    use attribution::Payload;
    use hyper::Method;
    use parking_lot::Mutex;
    use serde_json::json;
    use shared::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn payload(entries: &[(&str, RawValue)]) -> Payload {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn context() -> DeviceContext {
        DeviceContext {
            bundle_id: Some("com.example.flock".into()),
            platform: "iOS".into(),
            locale: "en_US".into(),
            store_id: Some("id6754849548".into()),
            push_token: None,
            project_id: None,
        }
    }

    fn client_for(endpoint: &str) -> (ConfigClient, AttributionAggregator) {
        let aggregator = AttributionAggregator::new(Arc::new(MemoryStore::new()));
        let client = ConfigClient::new(&Config::new(endpoint), aggregator.clone()).unwrap();
        (client, aggregator)
    }

    #[test]
    fn test_build_body() {
        let (client, aggregator) = client_for("https://config.example/");
        aggregator.set_install_id(Some("1700000000000-1234567"));
        aggregator.update(
            FragmentSource::Conversion,
            &payload(&[
                ("media_source", RawValue::from("facebook")),
                ("os", RawValue::from("spoofed")),
                ("cost", RawValue::none()),
            ]),
        );

        let body: Value = serde_json::from_slice(&client.build_body(&context()).unwrap()).unwrap();
        assert_eq!(
            body,
            json!({
                "media_source": "facebook",
                "os": "iOS",
                "af_id": "1700000000000-1234567",
                "bundle_id": "com.example.flock",
                "locale": "en_US",
                "store_id": "id6754849548",
                "push_token": DEFAULT_PUSH_TOKEN_FALLBACK,
                "firebase_project_id": DEFAULT_PROJECT_ID_FALLBACK,
            })
        );
    }

    #[test]
    fn test_build_body_generates_install_id() {
        let (client, aggregator) = client_for("https://config.example/");
        let mut context = context();
        context.bundle_id = None;
        context.store_id = None;
        context.push_token = Some("fcm-token".into());
        context.project_id = Some("".into());

        let body: Value = serde_json::from_slice(&client.build_body(&context).unwrap()).unwrap();
        let install_id = aggregator.install_id().unwrap();
        assert_eq!(body["af_id"], json!(install_id));
        assert_eq!(body["push_token"], json!("fcm-token"));
        assert_eq!(body["firebase_project_id"], json!(DEFAULT_PROJECT_ID_FALLBACK));
        assert!(body.get("bundle_id").is_none());
        assert!(body.get("store_id").is_none());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let received = Arc::new(Mutex::new(None));
        let captured = received.clone();
        let port = start_mock_server(move |req| {
            let captured = captured.clone();
            async move {
                assert_eq!(req.method(), Method::POST);
                assert_eq!(req.headers()["content-type"], "application/json");
                *captured.lock() = Some(serde_json::from_slice::<Value>(req.body()).unwrap());
                json_response(
                    200,
                    r#"{"ok": true, "url": "https://dest.example/x", "expires": 1767225600}"#,
                )
            }
        })
        .await;

        let (client, _) = client_for(&format!("http://127.0.0.1:{port}/config.php"));
        let response = client.fetch_routing(&context()).await.unwrap();

        assert!(response.ok);
        assert_eq!(
            response.destination().unwrap().as_str(),
            "https://dest.example/x"
        );
        assert_eq!(
            response.expires_at().unwrap().to_rfc3339(),
            "2026-01-01T00:00:00+00:00"
        );
        let body = received.lock().take().unwrap();
        assert_eq!(body["os"], json!("iOS"));
        assert!(body["af_id"].is_string());
    }

    #[tokio::test]
    async fn test_error_status_is_rejected() {
        let port = start_mock_server(|_| async {
            json_response(500, r#"{"ok": true, "url": "https://dest.example/x", "message": "busy"}"#)
        })
        .await;

        let (client, _) = client_for(&format!("http://127.0.0.1:{port}/"));
        let response = client.fetch_routing(&context()).await.unwrap();

        assert!(!response.ok);
        assert_eq!(response.message.as_deref(), Some("busy"));
        assert_eq!(response.url.as_deref(), Some("https://dest.example/x"));
        assert_eq!(response.destination(), None);
    }

    #[tokio::test]
    async fn test_error_status_without_ok_field() {
        let port = start_mock_server(|_| async {
            json_response(503, r#"{"message": "maintenance", "url": "https://dest.example/x"}"#)
        })
        .await;

        let (client, _) = client_for(&format!("http://127.0.0.1:{port}/"));
        let response = client.fetch_routing(&context()).await.unwrap();

        assert!(!response.ok);
        assert_eq!(response.message.as_deref(), Some("maintenance"));
        assert_eq!(response.url.as_deref(), Some("https://dest.example/x"));
        assert_eq!(response.destination(), None);
    }

    #[tokio::test]
    async fn test_error_status_with_garbage_body() {
        let port = start_mock_server(|_| async { json_response(404, "<html>not found</html>") }).await;

        let (client, _) = client_for(&format!("http://127.0.0.1:{port}/"));
        let response = client.fetch_routing(&context()).await.unwrap();

        assert_eq!(response, RemoteConfigResponse::default());
    }

    #[tokio::test]
    async fn test_undecodable_success_body() {
        let port = start_mock_server(|_| async { json_response(200, r#"{"url": "https://x"}"#) }).await;

        let (client, _) = client_for(&format!("http://127.0.0.1:{port}/"));
        let result = client.fetch_routing(&context()).await;

        assert!(matches!(result, Err(FetchError::Decode(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connectivity() {
        let (client, _) = client_for(CLOSED_PORT_URL);
        let result = client.fetch_routing(&context()).await;

        assert!(matches!(result, Err(FetchError::Connectivity(_))), "{result:?}");
    }

    #[tokio::test]
    async fn test_timeout_is_connectivity() {
        let port = start_mock_server(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            json_response(200, r#"{"ok": false}"#)
        })
        .await;

        let aggregator = AttributionAggregator::new(Arc::new(MemoryStore::new()));
        let mut config = Config::new(format!("http://127.0.0.1:{port}/"));
        config.request_timeout_secs = 1;
        let client = ConfigClient::new(&config, aggregator).unwrap();

        let result = client.fetch_routing(&context()).await;
        assert!(matches!(result, Err(FetchError::Connectivity(_))), "{result:?}");
    }

    #[tokio::test]
    async fn test_unusable_endpoints() {
        for endpoint in ["", "<#CONFIG_URL#>", "https://<#host#>/config.php"] {
            let (client, _) = client_for(endpoint);
            assert_eq!(
                client.fetch_routing(&context()).await,
                Err(FetchError::NotConfigured)
            );
        }

        for endpoint in ["ftp://config.example/", "not a url"] {
            let (client, _) = client_for(endpoint);
            assert!(matches!(
                client.fetch_routing(&context()).await,
                Err(FetchError::InvalidEndpoint(_))
            ));
        }
    }

    #[test]
    fn test_destination() {
        let approved = |url: &str| RemoteConfigResponse {
            ok: true,
            url: Some(url.to_string()),
            ..Default::default()
        };

        assert!(approved("https://dest.example/path?q=1").destination().is_some());
        assert_eq!(approved("not a url").destination(), None);
        assert_eq!(approved("mailto:someone@example.com").destination(), None);
        assert_eq!(RemoteConfigResponse { ok: true, ..Default::default() }.destination(), None);

        let declined = RemoteConfigResponse {
            ok: false,
            url: Some("https://dest.example/".into()),
            ..Default::default()
        };
        assert_eq!(declined.destination(), None);
    }
}
