//! Auth endpoint calls and token extraction
//!
//! All calls go through the `Transport` trait so they share base URL,
//! header injection and timeouts with ordinary API traffic. None of them
//! pass through the refresh/queue path; a failure here is final for the
//! call that made it.

use common::Secret;
use serde::Deserialize;
use tracing::{debug, info, warn};
use transport::{ApiResponse, RequestDescriptor, Transport};

use crate::constants::{
    LOGIN_PATH, LOGOUT_PATH, ME_PATH, REFRESH_PATH, TOKEN_BODY_FIELDS, TOKEN_HEADERS,
};
use crate::error::{Error, Result};

/// Email/password pair submitted to the login endpoint.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: Secret<String>,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: Secret::new(password.into()),
        }
    }
}

/// Current user as reported by the who-am-I endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Deserialize)]
struct UserBody {
    id: serde_json::Value,
    #[serde(default)]
    email: Option<String>,
}

/// Find a credential carried by a response.
///
/// Headers are checked before the body. A `Bearer ` prefix on the
/// `Authorization` header is stripped.
pub fn extract_token(response: &ApiResponse) -> Option<String> {
    for name in TOKEN_HEADERS {
        if let Some(value) = response.header(name) {
            let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    TOKEN_BODY_FIELDS.iter().find_map(|field| {
        response
            .body
            .get(*field)
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string)
    })
}

/// Ask the server for a fresh session token.
///
/// Success is exactly HTTP 200. The renewed token may be absent when the
/// server rotates it through a cookie instead; callers then keep using the
/// current one.
pub async fn refresh(transport: &dyn Transport, current: Option<&str>) -> Result<Option<String>> {
    let request = RequestDescriptor::post(REFRESH_PATH, serde_json::json!({}));
    let response = transport
        .send(&request, current)
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    if response.status != 200 {
        warn!(status = response.status, "token refresh rejected");
        return Err(Error::RefreshRejected(format!(
            "refresh endpoint returned {}: {}",
            response.status,
            response.body_text()
        )));
    }

    let token = extract_token(&response);
    debug!(rotated = token.is_some(), "token refresh succeeded");
    Ok(token)
}

/// Exchange email/password for a session token.
pub async fn login(transport: &dyn Transport, credentials: &LoginRequest) -> Result<String> {
    let request = RequestDescriptor::post(
        LOGIN_PATH,
        serde_json::json!({
            "email": credentials.email,
            "password": credentials.password.expose(),
        }),
    );
    let response = transport
        .send(&request, None)
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    match response.status {
        200 | 201 => {
            let token = extract_token(&response)
                .ok_or_else(|| Error::MissingToken("login response".into()))?;
            info!(email = %credentials.email, "login succeeded");
            Ok(token)
        }
        400 | 401 | 403 => Err(Error::InvalidCredentials(
            response
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("login rejected with {}", response.status)),
        )),
        status => Err(Error::UnexpectedResponse(format!(
            "login returned {status}: {}",
            response.body_text()
        ))),
    }
}

/// Tell the server the session is over. Best effort: any status is accepted.
pub async fn logout(transport: &dyn Transport, token: Option<&str>) -> Result<()> {
    let request = RequestDescriptor::post(LOGOUT_PATH, serde_json::json!({}));
    let response = transport
        .send(&request, token)
        .await
        .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;
    debug!(status = response.status, "logout acknowledged");
    Ok(())
}

/// Resolve the user behind `token`.
///
/// Accepts both `{"id": ..}` and `{"user": {"id": ..}}` bodies; numeric ids
/// are rendered as strings.
pub async fn fetch_identity(transport: &dyn Transport, token: &str) -> Result<Identity> {
    let request = RequestDescriptor::get(ME_PATH);
    let response = transport
        .send(&request, Some(token))
        .await
        .map_err(|e| Error::Http(format!("identity request failed: {e}")))?;

    if response.status == 401 {
        return Err(Error::InvalidCredentials("session token not accepted".into()));
    }
    if !response.is_success() {
        return Err(Error::UnexpectedResponse(format!(
            "identity endpoint returned {}",
            response.status
        )));
    }
    parse_identity(&response.body)
}

fn parse_identity(body: &serde_json::Value) -> Result<Identity> {
    let user = body.get("user").unwrap_or(body);
    let parsed: UserBody = serde_json::from_value(user.clone())
        .map_err(|e| Error::UnexpectedResponse(format!("identity body: {e}")))?;
    let id = match parsed.id {
        serde_json::Value::String(s) if !s.is_empty() => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(Error::UnexpectedResponse(format!(
                "identity id has unexpected shape: {other}"
            )));
        }
    };
    Ok(Identity {
        id,
        email: parsed.email,
    })
}
