use super::traits::{
    ActionOutcome, BrowserAction, BrowserToolClient, ElementQuery, ElementRect, Screenshot,
    SessionInfo,
};
use crate::config::BrowserConfig;
use crate::coords::Coordinate;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Envelope the automation service wraps its payloads in.
#[derive(Debug, Deserialize)]
struct ServiceResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScreenshotPayload {
    #[serde(alias = "image_base64", alias = "screenshot")]
    image: String,
    width: u32,
    height: u32,
}

/// HTTP façade over the remote browser-automation service.
pub struct HttpBrowserClient {
    base: Url,
    api_key: Option<String>,
    client: Client,
}

impl HttpBrowserClient {
    pub fn new(config: &BrowserConfig) -> anyhow::Result<Self> {
        let base = Url::parse(config.endpoint.trim()).map_err(|_| {
            anyhow::anyhow!(
                "Invalid browser.endpoint: '{}'. Expected http(s) URL",
                config.endpoint
            )
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("browser.endpoint must use http:// or https://");
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            base,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    /// Endpoint URL below the base path. Each segment is percent-encoded,
    /// so a session id can never change the route.
    fn url(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("browser.endpoint cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request and return the unwrapped payload.
    ///
    /// `Ok(Err(msg))` means the service answered but refused the request.
    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> anyhow::Result<Result<Value, String>> {
        let url = self.url(segments)?;
        let path = url.path().to_string();
        let mut request = self.client.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        if let Some(token) = self.api_key.as_deref() {
            request = request.bearer_auth(token.trim());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call automation service: {method} {path}"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read automation service response body")?;

        if status.is_server_error() {
            anyhow::bail!(
                "Automation service error ({status}) on {path}: {}",
                text.trim()
            );
        }

        let value: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text.clone()))
        };

        if let Ok(parsed) = serde_json::from_value::<ServiceResponse>(value.clone()) {
            if status.is_success() && parsed.success.unwrap_or(true) {
                return Ok(Ok(parsed.data.unwrap_or(value)));
            }
            let error = parsed.error.unwrap_or_else(|| {
                if status.is_success() {
                    "automation service returned success=false".to_string()
                } else {
                    format!("automation service request failed with status {status}")
                }
            });
            return Ok(Err(error));
        }

        if status.is_success() {
            return Ok(Ok(value));
        }
        Ok(Err(format!(
            "automation service request failed with status {status}: {}",
            text.trim()
        )))
    }

    async fn call_ok(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> anyhow::Result<Value> {
        self.call(method, segments, body)
            .await?
            .map_err(|e| anyhow::anyhow!(e))
    }
}

fn coordinate_fields(at: Coordinate) -> Value {
    json!({
        "x": at.x,
        "y": at.y,
        "coordinate_origin": at.space,
    })
}

/// JSON body for an action.
fn action_body(action: &BrowserAction) -> Value {
    match action {
        BrowserAction::Navigate { url } => json!({ "url": url }),
        BrowserAction::Click { at } => coordinate_fields(*at),
        BrowserAction::Type { at, text } => {
            let mut body = coordinate_fields(*at);
            body["text"] = json!(text);
            body
        }
        BrowserAction::Scroll {
            at,
            direction,
            amount,
        } => {
            let mut body = coordinate_fields(*at);
            body["direction"] = json!(direction);
            body["amount"] = json!(amount);
            body
        }
        BrowserAction::Keypress { at, key } => {
            let mut body = at.map_or_else(|| json!({}), coordinate_fields);
            body["key"] = json!(key);
            body
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

#[async_trait]
impl BrowserToolClient for HttpBrowserClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn start_session(&self, start_url: Option<&str>) -> anyhow::Result<SessionInfo> {
        let data = self
            .call_ok(Method::POST, &["sessions"], Some(json!({ "start_url": start_url })))
            .await
            .context("Failed to start remote session")?;
        let session_id = string_field(&data, "session_id")
            .or_else(|| string_field(&data, "id"))
            .ok_or_else(|| anyhow::anyhow!("Session response has no session_id"))?;
        Ok(SessionInfo {
            session_id,
            url: string_field(&data, "url").or_else(|| start_url.map(String::from)),
        })
    }

    async fn stop_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.call_ok(Method::DELETE, &["sessions", session_id], None)
            .await
            .with_context(|| format!("Failed to stop session {session_id}"))?;
        Ok(())
    }

    async fn screenshot(&self, session_id: &str) -> anyhow::Result<Screenshot> {
        let data = self
            .call_ok(
                Method::POST,
                &["sessions", session_id, "screenshot"],
                Some(json!({})),
            )
            .await
            .context("Screenshot failed")?;
        let payload: ScreenshotPayload =
            serde_json::from_value(data).context("Malformed screenshot response")?;
        Ok(Screenshot {
            image_base64: payload.image,
            width: payload.width,
            height: payload.height,
        })
    }

    async fn element_rect(
        &self,
        session_id: &str,
        query: &ElementQuery,
    ) -> anyhow::Result<ElementRect> {
        let body = serde_json::to_value(query).context("Failed to encode element query")?;
        let data = self
            .call_ok(
                Method::POST,
                &["sessions", session_id, "element-rect"],
                Some(body),
            )
            .await
            .context("Element lookup failed")?;
        serde_json::from_value(data).context("Malformed element-rect response")
    }

    async fn perform(
        &self,
        session_id: &str,
        action: &BrowserAction,
    ) -> anyhow::Result<ActionOutcome> {
        tracing::debug!(action = action.name(), session_id, "Applying browser action");
        let segments = ["sessions", session_id, action.name()];

        match self.call(Method::POST, &segments, Some(action_body(action))).await? {
            Ok(data) => Ok(ActionOutcome {
                success: true,
                url: string_field(&data, "url"),
                error: None,
                data: (!data.is_null()).then_some(data),
            }),
            Err(error) => Ok(ActionOutcome::failed(error)),
        }
    }

    async fn health_check(&self) -> bool {
        match self.url(&["health"]) {
            Ok(url) => self
                .client
                .get(url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
                .is_ok_and(|r| r.status().is_success()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::traits::ScrollDirection;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpBrowserClient {
        HttpBrowserClient::new(&BrowserConfig {
            endpoint: format!("{}/v1", server.uri()),
            api_key: Some("token-1".into()),
            timeout_ms: 5_000,
        })
        .unwrap()
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let result = HttpBrowserClient::new(&BrowserConfig {
            endpoint: "file:///tmp/socket".into(),
            ..BrowserConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn action_body_carries_coordinate_origin() {
        let body = action_body(&BrowserAction::Scroll {
            at: Coordinate::viewport(10.0, 20.0),
            direction: ScrollDirection::Down,
            amount: 500,
        });
        assert_eq!(body["coordinate_origin"], "viewport");
        assert_eq!(body["direction"], "down");
        assert_eq!(body["amount"], 500);

        let body = action_body(&BrowserAction::Keypress {
            at: None,
            key: "Enter".into(),
        });
        assert_eq!(body, json!({"key": "Enter"}));
    }

    #[tokio::test]
    async fn start_session_reads_enveloped_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"session_id": "abc", "url": "https://example.com/"}
            })))
            .mount(&server)
            .await;

        let session = client_for(&server)
            .start_session(Some("https://example.com"))
            .await
            .unwrap();
        assert_eq!(session.session_id, "abc");
        assert_eq!(session.url.as_deref(), Some("https://example.com/"));
    }

    #[tokio::test]
    async fn screenshot_accepts_bare_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions/abc/screenshot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "image": "aGVsbG8=", "width": 1280, "height": 800
            })))
            .mount(&server)
            .await;

        let shot = client_for(&server).screenshot("abc").await.unwrap();
        assert_eq!(shot.width, 1280);
        assert_eq!(shot.height, 800);
        assert_eq!(shot.image_base64, "aGVsbG8=");
    }

    #[tokio::test]
    async fn session_id_is_a_single_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions/a%2F..%2Fadmin%3Fx=1/screenshot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "image": "aGVsbG8=", "width": 10, "height": 10
            })))
            .expect(1)
            .mount(&server)
            .await;

        let shot = client_for(&server)
            .screenshot("a/../admin?x=1")
            .await
            .unwrap();
        assert_eq!(shot.width, 10);
    }

    #[tokio::test]
    async fn health_check_follows_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(client_for(&server).health_check().await);

        let unreachable = HttpBrowserClient::new(&BrowserConfig {
            endpoint: format!("{}/other", server.uri()),
            ..BrowserConfig::default()
        })
        .unwrap();
        assert!(!unreachable.health_check().await);
    }

    #[tokio::test]
    async fn element_rect_posts_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions/abc/element-rect"))
            .and(body_partial_json(json!({"by": "text", "text": "Search"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "found": true, "visible": true, "x": 100.0, "y": 40.0, "width": 200.0, "height": 30.0
            })))
            .mount(&server)
            .await;

        let rect = client_for(&server)
            .element_rect("abc", &ElementQuery::text("Search"))
            .await
            .unwrap();
        assert!(rect.is_usable());
        assert_eq!(rect.bounding_box().center().x, 200.0);
    }

    #[tokio::test]
    async fn refused_action_is_not_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions/abc/click"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false, "error": "element detached"
            })))
            .mount(&server)
            .await;

        let outcome = client_for(&server)
            .perform(
                "abc",
                &BrowserAction::Click {
                    at: Coordinate::viewport(1.0, 2.0),
                },
            )
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("element detached"));
    }

    #[tokio::test]
    async fn server_error_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions/abc/navigate"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .perform(
                "abc",
                &BrowserAction::Navigate {
                    url: "https://example.com".into(),
                },
            )
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("503"));
    }

    #[tokio::test]
    async fn successful_action_reports_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sessions/abc/navigate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "data": {"url": "https://example.com/home"}
            })))
            .mount(&server)
            .await;

        let outcome = client_for(&server)
            .perform(
                "abc",
                &BrowserAction::Navigate {
                    url: "https://example.com".into(),
                },
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.url.as_deref(), Some("https://example.com/home"));
    }
}
