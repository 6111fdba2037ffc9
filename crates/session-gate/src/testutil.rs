//! In-memory API used by unit tests

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use session_auth::{LOGIN_PATH, LOGOUT_PATH, ME_PATH, REFRESH_PATH};
use transport::{ApiResponse, RequestDescriptor, Transport, TransportError};

/// Password the mock login endpoint accepts.
pub const GOOD_PASSWORD: &str = "correct-horse";

/// Fake backend that accepts exactly one token.
pub struct MockApi {
    valid: String,
    refresh_issues: Option<String>,
    refresh_delay: Duration,
    refresh_hint: bool,
    rotate_to: Option<String>,
    restricted: Vec<String>,
    offline: AtomicBool,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl MockApi {
    pub fn accepting(token: &str) -> Self {
        Self {
            valid: token.to_string(),
            refresh_issues: None,
            refresh_delay: Duration::ZERO,
            refresh_hint: true,
            rotate_to: None,
            restricted: Vec::new(),
            offline: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn refresh_issues(mut self, token: &str) -> Self {
        self.refresh_issues = Some(token.to_string());
        self
    }

    pub fn refresh_fails(mut self) -> Self {
        self.refresh_issues = None;
        self
    }

    pub fn refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn without_refresh_hint(mut self) -> Self {
        self.refresh_hint = false;
        self
    }

    pub fn rotating_to(mut self, token: &str) -> Self {
        self.rotate_to = Some(token.to_string());
        self
    }

    pub fn restricting(mut self, route: &str) -> Self {
        self.restricted.push(route.to_string());
        self
    }

    /// While offline the refresh endpoint is unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Routes of every call made, in order.
    pub fn routes(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn refresh_calls(&self) -> usize {
        self.calls_to(REFRESH_PATH)
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(p, _)| p == path).count()
    }

    /// Tokens presented on each call to `path`, in order.
    pub fn tokens_for(&self, path: &str) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn respond(&self, request: &RequestDescriptor, token: Option<&str>) -> ApiResponse {
        let authorized = token == Some(self.valid.as_str());
        match request.route() {
            REFRESH_PATH => match &self.refresh_issues {
                Some(token) => {
                    ApiResponse::new(200).with_body(serde_json::json!({ "token": token }))
                }
                None => ApiResponse::new(401)
                    .with_body(serde_json::json!({"message": "refresh token expired"})),
            },
            LOGIN_PATH => {
                let password = request.body().and_then(|b| b["password"].as_str());
                if password == Some(GOOD_PASSWORD) {
                    ApiResponse::new(200).with_body(serde_json::json!({ "token": self.valid }))
                } else {
                    ApiResponse::new(401)
                        .with_body(serde_json::json!({"message": "invalid credentials"}))
                }
            }
            LOGOUT_PATH => ApiResponse::new(200),
            ME_PATH if authorized => ApiResponse::new(200).with_body(serde_json::json!({
                "user": {"id": "u-1", "email": "ana@example.com"}
            })),
            route if self.restricted.iter().any(|r| r == route) => {
                ApiResponse::new(403).with_body(serde_json::json!({
                    "message": "Project limit reached for your plan",
                    "limitInfo": {"resource": "projects", "max": 3},
                    "upgradeRequired": true
                }))
            }
            _ if !authorized => expired(self.refresh_hint),
            route if route.starts_with("/api/missing") => ApiResponse::new(404),
            route => {
                let mut body = serde_json::json!({ "path": route });
                if let Some(rotated) = &self.rotate_to {
                    body["token"] = serde_json::Value::String(rotated.clone());
                }
                ApiResponse::new(200).with_body(body)
            }
        }
    }
}

/// 401 as the API sends it for an expired session.
pub fn expired(needs_refresh: bool) -> ApiResponse {
    ApiResponse::new(401).with_body(serde_json::json!({
        "message": "token expired",
        "needsRefresh": needs_refresh
    }))
}

impl Transport for MockApi {
    fn id(&self) -> &str {
        "mock"
    }

    fn send<'a>(
        &'a self,
        request: &'a RequestDescriptor,
        token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = transport::Result<ApiResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((request.route().to_string(), token.map(str::to_string)));
            if request.route() == REFRESH_PATH {
                if self.offline.load(Ordering::SeqCst) {
                    return Err(TransportError::Network("connection refused".into()));
                }
                if !self.refresh_delay.is_zero() {
                    tokio::time::sleep(self.refresh_delay).await;
                }
            }
            Ok(self.respond(request, token))
        })
    }
}
