//! Session credential handling
//!
//! Holds the current session token and implements the auth endpoint calls
//! the session layer needs: silent refresh, interactive login, logout and
//! who-am-I. Independent of the retry/queue policy in `session-gate`.
//!
//! Credential flow:
//! 1. `token::login()` exchanges email/password for a token
//! 2. Token stored via `CredentialStore::set()`, session becomes active
//! 3. Every outbound call reads `CredentialStore::token()`
//! 4. Responses carrying a renewed token go through `token::extract_token()`
//! 5. On expiry, `token::refresh()` asks the server for a new token
//! 6. `CredentialStore::clear()` on logout ends the session

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::CredentialStore;
pub use error::{Error, Result};
pub use token::{Identity, LoginRequest, extract_token, fetch_identity, login, logout, refresh};
