//! Failure classification for API responses
//!
//! Separates the two kinds of rejection the server produces: expired
//! credentials (401, recoverable by refresh or re-login) and plan or
//! feature limits (403 with upgrade details, never retried). Anything else
//! is a plain terminal failure for the caller.

use session_auth::is_auth_endpoint;
use transport::ApiResponse;

/// Body keys that mark a 403 as a plan restriction.
const PLAN_BODY_KEYS: &[&str] = &["limitInfo", "featureInfo", "upgradeRequired"];

/// Message fragments that mark a 403 as a plan restriction (lowercase).
const PLAN_MESSAGE_PATTERNS: &[&str] = &["plan", "característica"];

/// How the session layer should treat a non-success response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Credential expired or invalid; refresh, queue or escalate.
    RecoverableAuth,
    /// Resource or feature limit for the current plan.
    PlanRestricted,
    /// Anything else, returned to the caller unchanged.
    Terminal,
}

/// Whether a 403 body describes a plan/feature limit.
pub fn is_plan_restriction(response: &ApiResponse) -> bool {
    if PLAN_BODY_KEYS
        .iter()
        .any(|key| response.body.get(*key).is_some_and(|v| !v.is_null()))
    {
        return true;
    }
    response.message().is_some_and(|message| {
        let lower = message.to_lowercase();
        PLAN_MESSAGE_PATTERNS.iter().any(|p| lower.contains(p))
    })
}

/// Whether the server flagged a 401 as fixable by a silent refresh.
pub fn needs_refresh(response: &ApiResponse) -> bool {
    response
        .body
        .get("needsRefresh")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Classify a non-success response for the request at `path`.
///
/// 401s from auth endpoints are terminal so a failing login or refresh can
/// never feed back into the refresh path.
pub fn classify_response(response: &ApiResponse, path: &str) -> FailureKind {
    match response.status {
        401 if !is_auth_endpoint(path) => FailureKind::RecoverableAuth,
        403 if is_plan_restriction(response) => FailureKind::PlanRestricted,
        _ => FailureKind::Terminal,
    }
}
