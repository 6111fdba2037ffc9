//! Interactive re-authentication task
//!
//! Listens for `ReauthRequired` and drives the prompt/login loop until the
//! session is restored, the user gives up, or the login ceiling ends the
//! session. The prompt itself is a trait so the binary can read a terminal
//! and tests can script answers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use session_auth::LoginRequest;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::session::Session;
use crate::signals::SessionEvent;

/// Source of replacement credentials.
pub trait ReauthPrompt: Send + Sync {
    /// Ask for credentials. `None` means the user declined.
    fn prompt<'a>(
        &'a self,
        attempt: u32,
        pending: usize,
    ) -> Pin<Box<dyn Future<Output = Option<LoginRequest>> + Send + 'a>>;
}

/// How one re-authentication round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReauthOutcome {
    Restored { replayed: usize },
    Abandoned { dropped: usize },
    LoggedOut,
    /// Session was restored or ended by something else while prompting.
    Superseded,
}

/// Spawn the task that answers every `ReauthRequired` event.
pub fn spawn_reauth_task(
    session: Arc<Session>,
    prompt: Arc<dyn ReauthPrompt>,
) -> tokio::task::JoinHandle<()> {
    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ReauthRequired { pending }) => {
                    let outcome = reauthenticate(&session, prompt.as_ref(), pending).await;
                    info!(?outcome, "re-authentication round finished");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "re-auth task lagged behind session events");
                    // A prompt request may have been among the skipped events
                    if session.signals().reauth_pending() {
                        let pending = session.queue().len();
                        reauthenticate(&session, prompt.as_ref(), pending).await;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("re-auth task stopped");
    })
}

/// Prompt and log in until the session is restored or abandoned.
///
/// Bound to the re-auth round that is open when called. If that round is
/// closed while the prompt is up, the answer is discarded.
pub async fn reauthenticate(
    session: &Session,
    prompt: &dyn ReauthPrompt,
    pending: usize,
) -> ReauthOutcome {
    let round = session.signals().reauth_round();
    let mut attempt = 0;
    let mut pending = pending;
    loop {
        if !is_current(session, round) {
            return ReauthOutcome::Superseded;
        }
        attempt += 1;
        let answer = prompt.prompt(attempt, pending).await;
        if !is_current(session, round) {
            debug!(attempt, round, "re-authentication settled while prompting");
            return ReauthOutcome::Superseded;
        }
        let Some(credentials) = answer else {
            let dropped = session.abandon_reauth();
            return ReauthOutcome::Abandoned { dropped };
        };
        match session.login(&credentials).await {
            Ok(replayed) => return ReauthOutcome::Restored { replayed },
            Err(Error::HardAuth { .. }) => return ReauthOutcome::LoggedOut,
            Err(e) => {
                warn!(attempt, error = %e, "re-authentication attempt failed");
                pending = session.queue().len();
            }
        }
    }
}

fn is_current(session: &Session, round: u64) -> bool {
    let signals = session.signals();
    signals.reauth_pending() && signals.reauth_round() == round
}
