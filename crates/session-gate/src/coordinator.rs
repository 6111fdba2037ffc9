//! Refresh coordinator
//!
//! Every outbound API call goes through `RefreshCoordinator::execute`. A
//! success returns the response (persisting any rotated credential it
//! carries). A plan-limit 403 raises the restriction broadcaster. A
//! recoverable 401 either retries once after a silent refresh, or parks the
//! call in the deferred queue and escalates to interactive re-login. A
//! refresh that succeeds while calls are parked replays them first.
//!
//! At most one refresh call is in flight. The first caller to need one
//! stores a shared future in the slot; later callers await that same
//! future. The slot is released when the refresh settles, never on a timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use session_auth::{CredentialStore, extract_token};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use transport::{ApiResponse, RequestDescriptor, Transport};

use crate::classify::{FailureKind, classify_response, needs_refresh};
use crate::error::{Error, Result};
use crate::queue::RequestQueue;
use crate::restriction::PlanRestrictionBroadcaster;
use crate::signals::{SessionEvent, SessionSignals};

/// Whether a request is on its first send or a replay after recovery.
///
/// A replay that fails on auth again is returned to the caller instead of
/// entering the refresh path a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Replay,
}

type RefreshOutcome = std::result::Result<(), session_auth::Error>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Outcome of one send that did not end in an error.
enum Sent {
    Done(ApiResponse),
    /// Recoverable auth failure on a first attempt.
    Recoverable(ApiResponse),
}

pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    queue: Arc<RequestQueue>,
    signals: Arc<SessionSignals>,
    restrictions: PlanRestrictionBroadcaster,
    in_flight: Mutex<Option<(u64, SharedRefresh)>>,
    refreshes: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        queue: Arc<RequestQueue>,
        signals: Arc<SessionSignals>,
        restrictions: PlanRestrictionBroadcaster,
    ) -> Self {
        Self {
            transport,
            credentials,
            queue,
            signals,
            restrictions,
            in_flight: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Send a request through the recovery pipeline.
    ///
    /// May not resolve until the user re-authenticates, if the call has to
    /// be deferred.
    pub async fn execute(&self, request: RequestDescriptor) -> Result<ApiResponse> {
        let response = match self.send(&request, Attempt::First).await? {
            Sent::Done(response) => return Ok(response),
            Sent::Recoverable(response) => response,
        };

        if self.signals.is_logout_in_progress() {
            debug!(path = request.route(), "auth failure during logout, not recovering");
            return Err(status_error(response));
        }
        if !needs_refresh(&response) {
            return self.defer(request).await;
        }

        match self.refresh().await {
            Ok(()) => {
                // Calls parked by an earlier failed refresh go first
                if self.queue.has_queued_requests() {
                    self.restore().await;
                }
                self.replay(request).await
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = request.route(),
                    "silent refresh failed, deferring request"
                );
                self.defer(request).await
            }
        }
    }

    /// Re-send a deferred request. Auth failures are returned, not retried.
    pub async fn replay(&self, request: RequestDescriptor) -> Result<ApiResponse> {
        match self.send(&request, Attempt::Replay).await? {
            Sent::Done(response) => Ok(response),
            Sent::Recoverable(response) => Err(status_error(response)),
        }
    }

    /// Clear the pending re-auth prompt and replay the deferred queue in
    /// order. Returns the number of replayed requests.
    ///
    /// Call once the credential is known to be good again.
    pub async fn restore(&self) -> usize {
        let was_pending = self.signals.resolve_reauth();
        let replayed = self.queue.process(|request| self.replay(request)).await;
        if was_pending || replayed > 0 {
            info!(replayed, "session restored");
            self.signals.emit(SessionEvent::ReauthCompleted { replayed });
        }
        replayed
    }

    /// Number of refresh calls started since construction.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    async fn send(&self, request: &RequestDescriptor, attempt: Attempt) -> Result<Sent> {
        let token = self.credentials.token().await;
        let response = self.transport.send(request, token.as_deref()).await?;

        if response.is_success() {
            if let Some(token) = extract_token(&response) {
                if self.credentials.set(token).await {
                    debug!(
                        request_id = %request.id(),
                        transport = self.transport.id(),
                        "credential rotated by response"
                    );
                }
            }
            return Ok(Sent::Done(response));
        }

        match classify_response(&response, request.path()) {
            FailureKind::Terminal => Err(status_error(response)),
            FailureKind::PlanRestricted => {
                let restriction = self.restrictions.raise(request.route(), &response);
                Err(Error::PlanRestricted(Box::new(restriction)))
            }
            FailureKind::RecoverableAuth if attempt == Attempt::Replay => {
                debug!(
                    request_id = %request.id(),
                    path = request.route(),
                    "replayed request rejected again"
                );
                Err(status_error(response))
            }
            FailureKind::RecoverableAuth => Ok(Sent::Recoverable(response)),
        }
    }

    async fn defer(&self, request: RequestDescriptor) -> Result<ApiResponse> {
        let pending = self.queue.enqueue(request)?;
        self.signals.request_reauth(self.queue.len());
        pending.await
    }

    /// Run a silent refresh, joining the one in flight if there is one.
    pub async fn refresh(&self) -> RefreshOutcome {
        let (generation, refresh) = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some((generation, refresh)) => {
                    debug!(
                        generation,
                        transport = self.transport.id(),
                        "joining in-flight refresh"
                    );
                    (*generation, refresh.clone())
                }
                None => {
                    let generation = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                    let refresh = self.start_refresh(generation);
                    *slot = Some((generation, refresh.clone()));
                    (generation, refresh)
                }
            }
        };

        let outcome = refresh.await;

        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|(g, _)| *g == generation) {
            *slot = None;
        }
        outcome
    }

    fn start_refresh(&self, generation: u64) -> SharedRefresh {
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();
        async move {
            debug!(generation, transport = transport.id(), "starting token refresh");
            let current = credentials.token().await;
            match session_auth::refresh(transport.as_ref(), current.as_deref()).await {
                Ok(rotated) => {
                    if let Some(token) = rotated {
                        credentials.set(token).await;
                    }
                    metrics::counter!("session_refresh_total", "outcome" => "success")
                        .increment(1);
                    info!(generation, "session refreshed");
                    Ok(())
                }
                Err(e) => {
                    metrics::counter!("session_refresh_total", "outcome" => "failure")
                        .increment(1);
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }
}

fn status_error(response: ApiResponse) -> Error {
    Error::Status {
        status: response.status,
        body: response.body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restriction::DEFAULT_RESTRICTION_WINDOW;
    use crate::testutil::MockApi;
    use session_auth::REFRESH_PATH;
    use std::time::Duration;

    struct Harness {
        api: Arc<MockApi>,
        credentials: Arc<CredentialStore>,
        queue: Arc<RequestQueue>,
        signals: Arc<SessionSignals>,
        restrictions: PlanRestrictionBroadcaster,
        coordinator: Arc<RefreshCoordinator>,
    }

    fn harness(api: MockApi) -> Harness {
        let api = Arc::new(api);
        let credentials = Arc::new(CredentialStore::with_token("stale"));
        let queue = Arc::new(RequestQueue::new());
        let signals = Arc::new(SessionSignals::default());
        let restrictions =
            PlanRestrictionBroadcaster::new(signals.clone(), DEFAULT_RESTRICTION_WINDOW);
        let coordinator = Arc::new(RefreshCoordinator::new(
            api.clone(),
            credentials.clone(),
            queue.clone(),
            signals.clone(),
            restrictions.clone(),
        ));
        Harness {
            api,
            credentials,
            queue,
            signals,
            restrictions,
            coordinator,
        }
    }

    #[tokio::test]
    async fn success_passes_through() {
        let h = harness(MockApi::accepting("stale"));
        let resp = h.coordinator.execute(RequestDescriptor::get("/api/projects")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(h.api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn token_in_success_response_is_persisted() {
        let h = harness(MockApi::accepting("stale").rotating_to("rotated"));
        h.coordinator.execute(RequestDescriptor::get("/api/projects")).await.unwrap();
        assert_eq!(h.credentials.token().await.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn needs_refresh_retries_once_with_new_token() {
        let h = harness(MockApi::accepting("fresh").refresh_issues("fresh"));
        let resp = h.coordinator.execute(RequestDescriptor::get("/api/projects")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(h.api.refresh_calls(), 1);
        assert_eq!(h.credentials.token().await.as_deref(), Some("fresh"));
        assert_eq!(
            h.api.tokens_for("/api/projects"),
            vec![Some("stale".to_string()), Some("fresh".to_string())]
        );
    }

    #[tokio::test]
    async fn replay_auth_failure_is_returned_not_refreshed_again() {
        // Refresh "succeeds" but the server still rejects the new token
        let h = harness(MockApi::accepting("never").refresh_issues("fresh"));
        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/api/projects"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(h.api.refresh_calls(), 1);
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_share_one_refresh() {
        let h = harness(
            MockApi::accepting("fresh")
                .refresh_issues("fresh")
                .refresh_delay(Duration::from_millis(200)),
        );

        let mut handles = Vec::new();
        for i in 0..5 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .execute(RequestDescriptor::get(format!("/api/item/{i}")))
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, 200);
        }
        assert_eq!(h.api.refresh_calls(), 1);
        assert_eq!(h.coordinator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn sequential_refreshes_are_not_merged() {
        let h = harness(MockApi::accepting("fresh").refresh_issues("fresh"));
        h.coordinator.refresh().await.unwrap();
        h.coordinator.refresh().await.unwrap();
        assert_eq!(h.api.refresh_calls(), 2, "slot is released once a refresh settles");
    }

    #[tokio::test]
    async fn failed_refresh_defers_and_escalates() {
        let h = harness(MockApi::accepting("fresh").refresh_fails());
        let mut events = h.signals.subscribe();

        let coordinator = h.coordinator.clone();
        let call = tokio::spawn(async move {
            coordinator.execute(RequestDescriptor::get("/api/projects")).await
        });

        assert_eq!(events.recv().await.unwrap(), SessionEvent::ReauthRequired { pending: 1 });
        assert!(h.signals.reauth_pending());
        assert_eq!(h.queue.len(), 1);

        // Restore the session and drain, as a login would
        h.credentials.set("fresh").await;
        let coordinator = h.coordinator.clone();
        h.queue.process(|req| coordinator.replay(req)).await;

        assert_eq!(call.await.unwrap().unwrap().status, 200);
    }

    #[tokio::test]
    async fn plain_401_defers_without_refresh() {
        let h = harness(MockApi::accepting("fresh").without_refresh_hint());
        let coordinator = h.coordinator.clone();
        let call = tokio::spawn(async move {
            coordinator.execute(RequestDescriptor::get("/api/projects")).await
        });

        let mut len = h.queue.subscribe();
        len.wait_for(|n| *n == 1).await.unwrap();
        assert_eq!(h.api.refresh_calls(), 0);

        h.queue.clear("abandoned");
        assert!(matches!(call.await.unwrap(), Err(Error::QueueCleared(_))));
    }

    #[tokio::test]
    async fn auth_endpoint_401_is_terminal() {
        let h = harness(MockApi::accepting("fresh"));
        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/api/auth/me"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(h.api.refresh_calls(), 0);
        assert!(h.queue.is_empty());
        assert!(!h.signals.reauth_pending());
    }

    #[tokio::test]
    async fn plan_restriction_never_refreshes() {
        let h = harness(MockApi::accepting("stale").restricting("/api/projects"));
        let err = h
            .coordinator
            .execute(RequestDescriptor::post("/api/projects", serde_json::json!({"name": "x"})))
            .await
            .unwrap_err();

        match err {
            Error::PlanRestricted(r) => assert_eq!(r.resource.as_deref(), Some("projects")),
            other => panic!("expected PlanRestricted, got {other:?}"),
        }
        assert!(h.restrictions.is_restricted());
        assert_eq!(h.api.refresh_calls(), 0);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn auth_failure_never_raises_restriction() {
        let h = harness(MockApi::accepting("fresh").refresh_issues("fresh"));
        h.coordinator.execute(RequestDescriptor::get("/api/projects")).await.unwrap();
        assert!(!h.restrictions.is_restricted());
    }

    #[tokio::test]
    async fn auth_failure_during_logout_is_returned() {
        let h = harness(MockApi::accepting("fresh").refresh_issues("fresh"));
        let _guard = h.signals.begin_logout();
        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/api/projects"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(h.api.refresh_calls(), 0);
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn other_failures_are_terminal() {
        let h = harness(MockApi::accepting("stale"));
        let err = h
            .coordinator
            .execute(RequestDescriptor::get("/api/missing"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn refresh_request_goes_to_refresh_endpoint() {
        let h = harness(MockApi::accepting("fresh").refresh_issues("fresh"));
        h.coordinator.refresh().await.unwrap();
        assert_eq!(h.api.tokens_for(REFRESH_PATH), vec![Some("stale".to_string())]);
    }
}
