//! Auth endpoint routes and token carrier names
//!
//! Auth endpoints are excluded from the refresh/queue path: a 401 from any
//! of them propagates unchanged, otherwise refresh failures would recurse.

pub const LOGIN_PATH: &str = "/api/auth/login";

pub const GOOGLE_LOGIN_PATH: &str = "/api/auth/google";

/// Silent refresh; success is exactly HTTP 200.
pub const REFRESH_PATH: &str = "/api/auth/refresh-token";

pub const LOGOUT_PATH: &str = "/api/auth/logout";

/// Who-am-I endpoint returning the current user.
pub const ME_PATH: &str = "/api/auth/me";

/// Route segments following `/auth/` that identify an auth endpoint.
pub const AUTH_ENDPOINTS: &[&str] = &[
    "login",
    "google",
    "google-login",
    "refresh-token",
    "logout",
    "me",
];

/// Response headers that may carry a renewed credential.
pub const TOKEN_HEADERS: &[&str] = &["authorization", "x-auth-token"];

/// Response body fields that may carry a renewed credential, in lookup order.
pub const TOKEN_BODY_FIELDS: &[&str] = &["token", "accessToken", "authToken"];

/// Whether `path` targets one of the auth endpoints.
///
/// Matches on the segment right after an `auth` segment so that unrelated
/// routes such as `/api/members` or `/api/login-history` are not excluded.
pub fn is_auth_endpoint(path: &str) -> bool {
    let route = path.split('?').next().unwrap_or(path);
    let mut segments = route.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "auth" {
            return segments
                .next()
                .is_some_and(|next| AUTH_ENDPOINTS.contains(&next));
        }
    }
    false
}
