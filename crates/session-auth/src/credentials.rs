//! In-memory credential store
//!
//! Single mutable cell holding the session token. Read by every outbound
//! request; written only by login, refresh and token propagation; cleared
//! on logout. The store has no policy of its own.
//!
//! Session activity (token present or not) is published on a `watch`
//! channel so the realtime connection can follow the session lifecycle.

use common::Secret;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Thread-safe holder of the current session token.
pub struct CredentialStore {
    token: RwLock<Option<Secret<String>>>,
    active: watch::Sender<bool>,
}

impl CredentialStore {
    /// Empty store; the session is inactive until a token is set.
    pub fn new() -> Self {
        let (active, _) = watch::channel(false);
        Self {
            token: RwLock::new(None),
            active,
        }
    }

    /// Store seeded with an existing token (e.g. restored from config).
    pub fn with_token(token: impl Into<String>) -> Self {
        let token = Secret::new(token.into());
        let has_token = !token.is_blank();
        let (active, _) = watch::channel(has_token);
        Self {
            token: RwLock::new(has_token.then_some(token)),
            active,
        }
    }

    /// Clone of the current token, if any.
    pub async fn token(&self) -> Option<String> {
        self.token.read().await.as_ref().map(|t| t.expose().clone())
    }

    /// Replace the current token. Blank tokens are ignored.
    ///
    /// Returns true when the stored value changed.
    pub async fn set(&self, token: impl Into<String>) -> bool {
        let token = Secret::new(token.into());
        if token.is_blank() {
            warn!("ignoring blank session token");
            return false;
        }
        let mut slot = self.token.write().await;
        if slot.as_ref() == Some(&token) {
            return false;
        }
        let was_active = slot.is_some();
        *slot = Some(token);
        drop(slot);

        if was_active {
            debug!("session token replaced");
        } else {
            info!("session token stored, session active");
        }
        self.active.send_if_modified(|active| !std::mem::replace(active, true));
        true
    }

    /// Drop the current token. Returns true if there was one.
    pub async fn clear(&self) -> bool {
        let removed = self.token.write().await.take().is_some();
        if removed {
            info!("session token cleared, session inactive");
        }
        self.active.send_if_modified(|active| std::mem::replace(active, false));
        removed
    }

    /// Whether a token is currently held.
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Receiver that observes every session activation and deactivation.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_is_inactive() {
        let store = CredentialStore::new();
        assert!(store.token().await.is_none());
        assert!(!store.is_active());
    }

    #[tokio::test]
    async fn seeded_store_is_active() {
        let store = CredentialStore::with_token("tok-1");
        assert_eq!(store.token().await.as_deref(), Some("tok-1"));
        assert!(store.is_active());
    }

    #[tokio::test]
    async fn blank_seed_stays_inactive() {
        let store = CredentialStore::with_token("   ");
        assert!(store.token().await.is_none());
        assert!(!store.is_active());
    }

    #[tokio::test]
    async fn set_and_clear_roundtrip() {
        let store = CredentialStore::new();
        assert!(store.set("tok-1").await);
        assert_eq!(store.token().await.as_deref(), Some("tok-1"));

        assert!(store.set("tok-2").await);
        assert_eq!(store.token().await.as_deref(), Some("tok-2"));

        assert!(store.clear().await);
        assert!(store.token().await.is_none());
        assert!(!store.clear().await, "second clear has nothing to remove");
    }

    #[tokio::test]
    async fn setting_same_token_reports_no_change() {
        let store = CredentialStore::with_token("tok");
        assert!(!store.set("tok").await);
    }

    #[tokio::test]
    async fn blank_token_is_ignored() {
        let store = CredentialStore::with_token("tok");
        assert!(!store.set("").await);
        assert_eq!(store.token().await.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn subscribers_observe_activation_changes() {
        let store = CredentialStore::new();
        let mut rx = store.subscribe();
        assert!(!*rx.borrow_and_update());

        store.set("tok").await;
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        // Token rotation keeps the session active without a new notification
        store.set("tok-rotated").await;
        assert!(!rx.has_changed().unwrap());

        store.clear().await;
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_token() {
        let store = std::sync::Arc::new(CredentialStore::new());
        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set(format!("tok-{i}")).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let token = store.token().await.unwrap();
        assert!(token.starts_with("tok-"));
        assert!(store.is_active());
    }
}
