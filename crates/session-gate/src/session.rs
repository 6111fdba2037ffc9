//! Session facade
//!
//! Wires the credential store, refresh coordinator, deferred queue, plan
//! restriction broadcaster and signal bus into one constructible service.
//! Nothing here is global; tests build as many isolated sessions as they
//! need.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use session_auth::{CredentialStore, Identity, LoginRequest};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use transport::{ApiResponse, RequestDescriptor, Transport};

use crate::coordinator::RefreshCoordinator;
use crate::error::{Error, Result};
use crate::queue::RequestQueue;
use crate::restriction::{DEFAULT_RESTRICTION_WINDOW, PlanRestrictionBroadcaster};
use crate::signals::{DEFAULT_EVENT_CAPACITY, SessionEvent, SessionSignals};

/// Consecutive failed logins before the session is forcibly ended.
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub plan_restriction_window: Duration,
    pub max_login_attempts: u32,
    pub event_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            plan_restriction_window: DEFAULT_RESTRICTION_WINDOW,
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    queue: Arc<RequestQueue>,
    signals: Arc<SessionSignals>,
    restrictions: PlanRestrictionBroadcaster,
    coordinator: RefreshCoordinator,
    login_failures: AtomicU32,
    max_login_attempts: u32,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        options: SessionOptions,
    ) -> Self {
        let queue = Arc::new(RequestQueue::new());
        let signals = Arc::new(SessionSignals::new(options.event_capacity));
        let restrictions =
            PlanRestrictionBroadcaster::new(signals.clone(), options.plan_restriction_window);
        let coordinator = RefreshCoordinator::new(
            transport.clone(),
            credentials.clone(),
            queue.clone(),
            signals.clone(),
            restrictions.clone(),
        );
        Self {
            transport,
            credentials,
            queue,
            signals,
            restrictions,
            coordinator,
            login_failures: AtomicU32::new(0),
            max_login_attempts: options.max_login_attempts.max(1),
        }
    }

    /// Send an API request with transparent credential recovery.
    pub async fn send(&self, request: RequestDescriptor) -> Result<ApiResponse> {
        self.coordinator.execute(request).await
    }

    /// Interactive login. On success the deferred queue is replayed and the
    /// number of replayed requests returned.
    ///
    /// Rejected credentials count toward the hard-auth ceiling; reaching it
    /// ends the session and returns `HardAuth`.
    pub async fn login(&self, request: &LoginRequest) -> Result<usize> {
        match session_auth::login(self.transport.as_ref(), request).await {
            Ok(token) => {
                self.login_failures.store(0, Ordering::SeqCst);
                self.credentials.set(token).await;
                Ok(self.restore().await)
            }
            Err(e @ session_auth::Error::InvalidCredentials(_)) => {
                let attempts = self.login_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(attempts, max = self.max_login_attempts, error = %e, "login rejected");
                if attempts >= self.max_login_attempts {
                    error!(attempts, "login attempts exhausted, ending session");
                    self.login_failures.store(0, Ordering::SeqCst);
                    self.end_session(true).await;
                    return Err(Error::HardAuth { attempts });
                }
                Err(Error::Auth(e))
            }
            Err(e) => Err(Error::Auth(e)),
        }
    }

    /// Try a silent refresh and, if it works, replay the deferred queue.
    ///
    /// Useful once connectivity returns while a re-auth prompt is pending.
    pub async fn retry_refresh(&self) -> Result<usize> {
        self.coordinator.refresh().await?;
        Ok(self.restore().await)
    }

    /// Adopt a token obtained outside `login` (e.g. an OAuth redirect) and
    /// replay the deferred queue.
    pub async fn complete_reauth(&self, token: impl Into<String>) -> usize {
        self.credentials.set(token).await;
        self.restore().await
    }

    /// User declined to re-authenticate: reject everything deferred.
    pub fn abandon_reauth(&self) -> usize {
        let dropped = self.queue.clear("re-authentication abandoned");
        self.signals.resolve_reauth();
        self.signals.emit(SessionEvent::ReauthAbandoned { dropped });
        dropped
    }

    /// End the session: drop deferred requests, forget the credential and
    /// tell the server. Server errors are logged, not returned.
    pub async fn logout(&self) {
        self.end_session(false).await;
    }

    /// Who the current credential belongs to.
    pub async fn whoami(&self) -> Result<Identity> {
        let token = self
            .credentials
            .token()
            .await
            .ok_or_else(|| session_auth::Error::InvalidCredentials("no active session".into()))?;
        Ok(session_auth::fetch_identity(self.transport.as_ref(), &token).await?)
    }

    async fn restore(&self) -> usize {
        self.coordinator.restore().await
    }

    async fn end_session(&self, forced: bool) {
        let _logout = self.signals.begin_logout();
        self.queue.clear("session logged out");
        self.signals.resolve_reauth();

        let token = self.credentials.token().await;
        self.credentials.clear().await;
        if let Err(e) = session_auth::logout(self.transport.as_ref(), token.as_deref()).await {
            warn!(error = %e, "logout call failed, local session cleared anyway");
        }
        self.restrictions.clear();

        info!(forced, "session ended");
        self.signals.emit(SessionEvent::LoggedOut { forced });
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn signals(&self) -> &SessionSignals {
        &self.signals
    }

    pub fn restrictions(&self) -> &PlanRestrictionBroadcaster {
        &self.restrictions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.signals.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.credentials.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{GOOD_PASSWORD, MockApi};
    use session_auth::{LOGOUT_PATH, REFRESH_PATH};

    fn session(api: MockApi) -> (Arc<MockApi>, Arc<Session>) {
        let api = Arc::new(api);
        let session = Session::new(
            api.clone(),
            Arc::new(CredentialStore::with_token("stale")),
            SessionOptions::default(),
        );
        (api, Arc::new(session))
    }

    async fn defer_one(
        session: &Arc<Session>,
        path: &str,
    ) -> tokio::task::JoinHandle<Result<ApiResponse>> {
        let s = session.clone();
        let path = path.to_string();
        let target = session.queue().len() + 1;
        let handle = tokio::spawn(async move { s.send(RequestDescriptor::get(path)).await });
        let mut len = session.queue().subscribe();
        len.wait_for(|n| *n >= target).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn login_replays_deferred_requests() {
        let (_api, session) = session(MockApi::accepting("fresh"));
        let mut events = session.subscribe();
        let a = defer_one(&session, "/api/a").await;
        let b = defer_one(&session, "/api/b").await;

        assert_eq!(events.recv().await.unwrap(), SessionEvent::ReauthRequired { pending: 1 });

        let replayed = session
            .login(&LoginRequest::new("ana@example.com", GOOD_PASSWORD))
            .await
            .unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(a.await.unwrap().unwrap().body["path"], "/api/a");
        assert_eq!(b.await.unwrap().unwrap().body["path"], "/api/b");
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ReauthCompleted { replayed: 2 });
        assert!(!session.signals().reauth_pending());
    }

    #[tokio::test]
    async fn wrong_password_keeps_queue_until_ceiling() {
        let (_api, session) = session(MockApi::accepting("fresh"));
        let mut events = session.subscribe();
        let pending = defer_one(&session, "/api/a").await;
        let _ = events.recv().await;

        let bad = LoginRequest::new("ana@example.com", "wrong");
        assert!(matches!(session.login(&bad).await, Err(Error::Auth(_))));
        assert!(matches!(session.login(&bad).await, Err(Error::Auth(_))));
        assert_eq!(session.queue().len(), 1, "queue survives failed attempts");

        match session.login(&bad).await {
            Err(Error::HardAuth { attempts }) => assert_eq!(attempts, DEFAULT_MAX_LOGIN_ATTEMPTS),
            other => panic!("expected HardAuth, got {other:?}"),
        }
        assert!(!session.is_active());
        assert!(matches!(pending.await.unwrap(), Err(Error::QueueCleared(_))));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut { forced: true });
    }

    #[tokio::test]
    async fn successful_login_resets_failure_count() {
        let (_api, session) = session(MockApi::accepting("fresh"));
        let bad = LoginRequest::new("ana@example.com", "wrong");
        let good = LoginRequest::new("ana@example.com", GOOD_PASSWORD);

        for _ in 0..DEFAULT_MAX_LOGIN_ATTEMPTS - 1 {
            assert!(session.login(&bad).await.is_err());
        }
        session.login(&good).await.unwrap();
        assert!(matches!(session.login(&bad).await, Err(Error::Auth(_))));
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn abandon_rejects_all_pending() {
        let (_api, session) = session(MockApi::accepting("fresh"));
        let a = defer_one(&session, "/api/a").await;
        let b = defer_one(&session, "/api/b").await;

        assert_eq!(session.abandon_reauth(), 2);
        for handle in [a, b] {
            assert!(matches!(handle.await.unwrap(), Err(Error::QueueCleared(_))));
        }
        assert!(!session.signals().reauth_pending());
    }

    #[tokio::test]
    async fn logout_clears_queue_credentials_and_calls_server() {
        let (api, session) = session(MockApi::accepting("fresh"));
        let pending = defer_one(&session, "/api/a").await;

        session.logout().await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::QueueCleared(r)) if r == "session logged out"
        ));
        assert!(!session.is_active());
        assert!(!session.signals().is_logout_in_progress());
        assert_eq!(api.tokens_for(LOGOUT_PATH), vec![Some("stale".to_string())]);
    }

    #[tokio::test]
    async fn retry_refresh_drains_queue_when_refresh_recovers() {
        let (api, session) = session(MockApi::accepting("fresh").refresh_issues("fresh"));
        // Seed the queue directly; the silent path already failed earlier
        let pending = session.queue().enqueue(RequestDescriptor::get("/api/a")).unwrap();
        session.signals().request_reauth(1);

        assert_eq!(session.retry_refresh().await.unwrap(), 1);
        assert_eq!(pending.await.unwrap().body["path"], "/api/a");
        assert_eq!(api.calls_to(REFRESH_PATH), 1);
        assert!(!session.signals().reauth_pending());
    }

    #[tokio::test]
    async fn retry_refresh_failure_keeps_queue() {
        let (_api, session) = session(MockApi::accepting("fresh").refresh_fails());
        let _pending = session.queue().enqueue(RequestDescriptor::get("/api/a")).unwrap();
        assert!(matches!(session.retry_refresh().await, Err(Error::Auth(_))));
        assert_eq!(session.queue().len(), 1);
    }

    #[tokio::test]
    async fn silent_refresh_on_later_call_drains_earlier_deferrals() {
        let (api, session) = session(MockApi::accepting("fresh").refresh_issues("fresh"));
        let mut events = session.subscribe();

        api.set_offline(true);
        let earlier = defer_one(&session, "/api/a").await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ReauthRequired { pending: 1 });

        api.set_offline(false);
        let resp = session.send(RequestDescriptor::get("/api/b")).await.unwrap();
        assert_eq!(resp.body["path"], "/api/b");

        assert_eq!(earlier.await.unwrap().unwrap().body["path"], "/api/a");
        assert!(session.queue().is_empty());
        assert!(!session.signals().reauth_pending());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ReauthCompleted { replayed: 1 });

        let data_calls: Vec<String> = api
            .routes()
            .into_iter()
            .filter(|r| r.starts_with("/api/") && !r.starts_with("/api/auth"))
            .collect();
        assert_eq!(data_calls, vec!["/api/a", "/api/b", "/api/a", "/api/b"]);
    }

    #[tokio::test]
    async fn complete_reauth_with_external_token() {
        let (_api, session) = session(MockApi::accepting("oauth-token"));
        let pending = defer_one(&session, "/api/a").await;
        assert_eq!(session.complete_reauth("oauth-token").await, 1);
        assert_eq!(pending.await.unwrap().unwrap().status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_failures_replay_in_order_after_reconnect() {
        let (api, session) = session(MockApi::accepting("fresh").refresh_issues("fresh"));
        api.set_offline(true);

        let mut handles = Vec::new();
        for (i, path) in ["/api/a", "/api/b", "/api/c"].into_iter().enumerate() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            handles.push(defer_one(&session, path).await);
            assert_eq!(session.queue().len(), i + 1);
        }
        assert!(session.signals().reauth_pending());

        api.set_offline(false);
        assert_eq!(session.retry_refresh().await.unwrap(), 3);

        let bodies: Vec<String> = {
            let mut out = Vec::new();
            for handle in handles {
                out.push(handle.await.unwrap().unwrap().body["path"].as_str().unwrap().to_string());
            }
            out
        };
        assert_eq!(bodies, vec!["/api/a", "/api/b", "/api/c"]);

        let replays: Vec<String> = api
            .routes()
            .into_iter()
            .filter(|r| r.starts_with("/api/") && !r.starts_with("/api/auth"))
            .skip(3)
            .collect();
        assert_eq!(replays, vec!["/api/a", "/api/b", "/api/c"]);
    }

    #[tokio::test]
    async fn whoami_uses_current_token() {
        let (_api, session) = session(MockApi::accepting("stale"));
        let me = session.whoami().await.unwrap();
        assert_eq!(me.id, "u-1");

        session.logout().await;
        assert!(matches!(session.whoami().await, Err(Error::Auth(_))));
    }
}
