//! Session resilience layer for API calls
//!
//! Keeps outbound calls working across credential expiry. Every call goes
//! through the refresh coordinator; expired credentials are refreshed once
//! (single-flight) and the call retried, or the call is deferred until the
//! user logs in again and then replayed in order. Plan/feature limit
//! responses are routed to the restriction broadcaster instead.
//!
//! Request lifecycle:
//! 1. `Session::send()` hands the descriptor to `RefreshCoordinator`
//! 2. 2xx → response returned, rotated credential persisted
//! 3. 403 with plan details → `PlanRestrictionBroadcaster::raise()`, error returned
//! 4. 401 with `needsRefresh` → shared silent refresh, one replay
//! 5. 401 otherwise, or refresh failed → `RequestQueue`, `ReauthRequired` emitted
//! 6. `Session::login()` succeeds → queue replayed FIFO, callers resolved
//! 7. User declines or hits the login ceiling → queue rejected

pub mod classify;
pub mod coordinator;
pub mod error;
pub mod queue;
pub mod reauth;
pub mod restriction;
pub mod session;
pub mod signals;

#[cfg(test)]
mod testutil;

pub use classify::{FailureKind, classify_response, is_plan_restriction, needs_refresh};
pub use coordinator::{Attempt, RefreshCoordinator};
pub use error::{Error, Result};
pub use queue::{PendingRequest, RequestQueue};
pub use reauth::{ReauthOutcome, ReauthPrompt, reauthenticate, spawn_reauth_task};
pub use restriction::{
    DEFAULT_RESTRICTION_WINDOW, PlanRestriction, PlanRestrictionBroadcaster, SurfaceGuard,
};
pub use session::{DEFAULT_MAX_LOGIN_ATTEMPTS, Session, SessionOptions};
pub use signals::{DEFAULT_EVENT_CAPACITY, SessionEvent, SessionSignals};
