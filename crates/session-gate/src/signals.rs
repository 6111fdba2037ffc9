//! Typed event bus between the session layer and its observers
//!
//! Every notification the session layer raises (re-auth needed, session
//! ended, plan limit hit, surfaces to close) goes out as a `SessionEvent`
//! on one broadcast channel. Observers subscribe; nothing is global.
//!
//! Two flags live alongside the channel: logout-in-progress, which stops
//! 401s raised during logout from starting a refresh, and reauth-pending,
//! which makes escalation idempotent while a prompt is already up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::restriction::PlanRestriction;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Notifications raised by the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Credential could not be restored silently; the user must log in.
    ReauthRequired { pending: usize },
    /// Credential restored; `replayed` deferred requests were re-issued.
    ReauthCompleted { replayed: usize },
    /// User declined to log in again; deferred requests were dropped.
    ReauthAbandoned { dropped: usize },
    /// Session ended. `forced` when the re-auth ceiling was hit.
    LoggedOut { forced: bool },
    PlanRestricted(PlanRestriction),
    PlanRestrictionCleared,
    /// Surfaces tied to the restricted resource should close.
    ForceCloseSurfaces { surfaces: Vec<String> },
    ForceCloseCleared,
}

pub struct SessionSignals {
    events: broadcast::Sender<SessionEvent>,
    logout_in_progress: AtomicBool,
    reauth_pending: AtomicBool,
    reauth_round: AtomicU64,
}

impl SessionSignals {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            logout_in_progress: AtomicBool::new(false),
            reauth_pending: AtomicBool::new(false),
            reauth_round: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        debug!(?event, "session event");
        let _ = self.events.send(event);
    }

    /// Mark logout as running until the returned guard drops.
    pub fn begin_logout(&self) -> LogoutGuard<'_> {
        self.logout_in_progress.store(true, Ordering::SeqCst);
        LogoutGuard(self)
    }

    pub fn is_logout_in_progress(&self) -> bool {
        self.logout_in_progress.load(Ordering::SeqCst)
    }

    /// Raise the re-auth prompt unless one is already pending.
    ///
    /// Returns true if this call raised it.
    pub fn request_reauth(&self, pending: usize) -> bool {
        if self.reauth_pending.swap(true, Ordering::SeqCst) {
            debug!(pending, "re-authentication already pending");
            return false;
        }
        let round = self.reauth_round.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pending, round, "re-authentication required");
        self.emit(SessionEvent::ReauthRequired { pending });
        true
    }

    pub fn reauth_pending(&self) -> bool {
        self.reauth_pending.load(Ordering::SeqCst)
    }

    /// Counts how many times re-auth has been raised. A prompt answered
    /// after the round it was opened for has moved on is stale.
    pub fn reauth_round(&self) -> u64 {
        self.reauth_round.load(Ordering::SeqCst)
    }

    /// Clear the pending flag. Returns whether it was set.
    pub fn resolve_reauth(&self) -> bool {
        self.reauth_pending.swap(false, Ordering::SeqCst)
    }
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Holds the logout-in-progress flag for the duration of a logout.
#[must_use = "the logout flag clears as soon as the guard drops"]
pub struct LogoutGuard<'a>(&'a SessionSignals);

impl Drop for LogoutGuard<'_> {
    fn drop(&mut self) {
        self.0.logout_in_progress.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reauth_request_is_idempotent() {
        let signals = SessionSignals::default();
        let mut rx = signals.subscribe();

        assert!(signals.request_reauth(1));
        assert!(!signals.request_reauth(2));
        assert!(!signals.request_reauth(3));

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ReauthRequired { pending: 1 });
        assert!(rx.try_recv().is_err(), "only one prompt event");
    }

    #[test]
    fn resolve_allows_new_request() {
        let signals = SessionSignals::default();
        assert!(signals.request_reauth(1));
        assert!(signals.resolve_reauth());
        assert!(!signals.resolve_reauth());
        assert!(signals.request_reauth(1));
    }

    #[test]
    fn each_raise_starts_a_new_round() {
        let signals = SessionSignals::default();
        assert_eq!(signals.reauth_round(), 0);

        signals.request_reauth(1);
        signals.request_reauth(2);
        assert_eq!(signals.reauth_round(), 1, "repeat while pending is the same round");

        signals.resolve_reauth();
        signals.request_reauth(1);
        assert_eq!(signals.reauth_round(), 2);
    }

    #[test]
    fn logout_flag_follows_guard() {
        let signals = SessionSignals::default();
        assert!(!signals.is_logout_in_progress());
        {
            let _guard = signals.begin_logout();
            assert!(signals.is_logout_in_progress());
        }
        assert!(!signals.is_logout_in_progress());
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let signals = SessionSignals::default();
        signals.emit(SessionEvent::LoggedOut { forced: false });
    }

    #[test]
    fn every_subscriber_receives_events() {
        let signals = SessionSignals::default();
        let mut a = signals.subscribe();
        let mut b = signals.subscribe();
        signals.emit(SessionEvent::PlanRestrictionCleared);
        assert_eq!(a.try_recv().unwrap(), SessionEvent::PlanRestrictionCleared);
        assert_eq!(b.try_recv().unwrap(), SessionEvent::PlanRestrictionCleared);
    }
}
