//! reqwest-backed transport
//!
//! Resolves descriptor paths against the API base URL, injects configured
//! static headers, attaches the bearer credential, and decodes the response
//! body. Any status code is returned as an `ApiResponse`; only failures to
//! obtain a response become `TransportError`.

use crate::{ApiResponse, RequestDescriptor, Result, Transport, TransportError};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Transport for the remote API over HTTP(S).
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    headers: Vec<HeaderInjection>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        headers: Vec<HeaderInjection>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            headers,
            timeout,
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Build the outbound header map: descriptor headers, then configured
    /// injections, then the bearer token.
    ///
    /// Injections never overwrite `Authorization`; the session credential
    /// owns that header.
    fn build_headers(&self, request: &RequestDescriptor, token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers() {
            let name = HeaderName::from_str(name)
                .map_err(|e| TransportError::InvalidRequest(format!("header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("header value: {e}")))?;
            headers.insert(name, value);
        }

        for injection in &self.headers {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == AUTHORIZATION {
                warn!(header = %injection.name, "refusing to inject authorization header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.insert(name, value);
        }

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::InvalidRequest(format!("invalid token value: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }
}

impl Transport for HttpTransport {
    fn id(&self) -> &str {
        "http"
    }

    fn send<'a>(
        &'a self,
        request: &'a RequestDescriptor,
        token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.url_for(request.path());
            let headers = self.build_headers(request, token)?;

            let mut builder = self
                .client
                .request(request.method().clone(), &url)
                .headers(headers)
                .timeout(self.timeout);
            if let Some(body) = request.body() {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(format!("{url}: {e}"))
                } else {
                    TransportError::Network(format!("{url}: {e}"))
                }
            })?;

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| TransportError::Network(format!("reading response body: {e}")))?;

            debug!(
                request_id = %request.id(),
                method = %request.method(),
                path = request.route(),
                status,
                "api response"
            );

            Ok(ApiResponse {
                status,
                headers,
                body: decode_body(&bytes),
            })
        })
    }
}

/// Decode a response body: JSON when possible, otherwise the raw text.
fn decode_body(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(base_url: &str, headers: Vec<HeaderInjection>) -> HttpTransport {
        HttpTransport::new(
            reqwest::Client::new(),
            base_url,
            headers,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn attaches_bearer_token_and_injected_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .and(header("authorization", "Bearer tok-1"))
            .and(header("x-client", "session-agent"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})),
            )
            .mount(&server)
            .await;

        let t = transport(
            &server.uri(),
            vec![HeaderInjection {
                name: "x-client".into(),
                value: "session-agent".into(),
            }],
        );
        let resp = t
            .send(&RequestDescriptor::get("/api/projects"), Some("tok-1"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["items"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn injection_cannot_override_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer real"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(418))
            .mount(&server)
            .await;

        let t = transport(
            &server.uri(),
            vec![HeaderInjection {
                name: "Authorization".into(),
                value: "Bearer INJECTED".into(),
            }],
        );
        let resp = t
            .send(&RequestDescriptor::get("/api/me"), Some("real"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/items"))
            .and(body_json(serde_json::json!({"name": "widget"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 7})))
            .mount(&server)
            .await;

        let t = transport(&server.uri(), vec![]);
        let resp = t
            .send(
                &RequestDescriptor::post("/api/items", serde_json::json!({"name": "widget"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body["id"], 7);
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({"needsRefresh": true})),
            )
            .mount(&server)
            .await;

        let t = transport(&server.uri(), vec![]);
        let resp = t
            .send(&RequestDescriptor::get("/api/projects"), Some("stale"))
            .await
            .unwrap();
        assert_eq!(resp.status, 401);
        assert_eq!(resp.body["needsRefresh"], true);
    }

    #[tokio::test]
    async fn non_json_body_kept_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let t = transport(&server.uri(), vec![]);
        let resp = t
            .send(&RequestDescriptor::get("/x"), None)
            .await
            .unwrap();
        assert_eq!(resp.body, serde_json::Value::String("bad gateway".into()));
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        // Port 9 (discard) on localhost is not listening in test environments
        let t = transport("http://127.0.0.1:9", vec![]);
        let err = t
            .send(&RequestDescriptor::get("/api/projects"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_) | TransportError::Timeout(_)));
    }

    #[test]
    fn url_join_handles_slashes() {
        let t = transport("https://api.example.com/", vec![]);
        assert_eq!(t.url_for("/api/x"), "https://api.example.com/api/x");
        assert_eq!(t.url_for("api/x"), "https://api.example.com/api/x");
        assert_eq!(
            t.url_for("https://other.example.com/y"),
            "https://other.example.com/y"
        );
    }

    #[test]
    fn invalid_descriptor_header_is_rejected() {
        let t = transport("https://api.example.com", vec![]);
        let req = RequestDescriptor::get("/x").with_header("bad header", "v");
        assert!(matches!(
            t.build_headers(&req, None),
            Err(TransportError::InvalidRequest(_))
        ));
    }

    #[test]
    fn decode_body_shapes() {
        assert_eq!(decode_body(b""), serde_json::Value::Null);
        assert_eq!(decode_body(br#"{"a":1}"#)["a"], 1);
        assert_eq!(decode_body(b"plain"), serde_json::Value::String("plain".into()));
    }
}
