//! Plan-restriction flag, event and open-surface tracking
//!
//! A 403 carrying plan/feature limit details raises one process-wide flag
//! with a timestamp, broadcasts a `PlanRestricted` event with the offending
//! feature or resource and a snapshot of the surfaces open at that moment,
//! and clears itself after a fixed window.
//!
//! Surfaces (modal dialogs, panels, anything a UI wants closed when the
//! restriction hits) register through `open_surface` and deregister when
//! their guard drops. When a restriction lands while surfaces are open, a
//! force-close request is raised; it clears once every surface has closed
//! or the window expires, whichever comes first.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use transport::ApiResponse;

use crate::signals::{SessionEvent, SessionSignals};

/// How long a restriction stays raised unless cleared explicitly.
pub const DEFAULT_RESTRICTION_WINDOW: Duration = Duration::from_secs(5);

/// Details of a plan or feature limit hit by a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRestriction {
    /// Route of the request that was refused.
    pub path: String,
    pub feature: Option<String>,
    pub resource: Option<String>,
    pub message: Option<String>,
    pub upgrade_required: bool,
    pub limit_info: Option<serde_json::Value>,
    pub feature_info: Option<serde_json::Value>,
    /// Surfaces open when the restriction was raised.
    pub open_surfaces: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

impl PlanRestriction {
    /// Build from a 403 response body.
    pub fn from_response(path: &str, response: &ApiResponse, open_surfaces: Vec<String>) -> Self {
        let body = &response.body;
        let object = |key: &str| body.get(key).filter(|v| !v.is_null()).cloned();
        let limit_info = object("limitInfo");
        let feature_info = object("featureInfo");

        let text = |value: Option<&serde_json::Value>, keys: &[&str]| {
            value.and_then(|v| {
                keys.iter()
                    .find_map(|k| v.get(*k).and_then(|f| f.as_str()))
                    .map(str::to_string)
            })
        };
        let feature = text(feature_info.as_ref(), &["feature", "name"])
            .or_else(|| text(Some(body), &["feature"]));
        let resource = text(limit_info.as_ref(), &["resource", "type"])
            .or_else(|| text(Some(body), &["resource"]));

        Self {
            path: path.to_string(),
            feature,
            resource,
            message: response.message().map(str::to_string),
            upgrade_required: body
                .get("upgradeRequired")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            limit_info,
            feature_info,
            open_surfaces,
            raised_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for PlanRestriction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.message, &self.feature, &self.resource) {
            (Some(message), _, _) => write!(f, "{message}"),
            (None, Some(feature), _) => {
                write!(f, "feature '{feature}' is not included in the current plan")
            }
            (None, None, Some(resource)) => write!(f, "plan limit reached for '{resource}'"),
            (None, None, None) => write!(f, "plan limit reached for {}", self.path),
        }
    }
}

#[derive(Default)]
struct State {
    generation: u64,
    active: Option<PlanRestriction>,
    /// Generation of the restriction that requested force-close, if pending.
    force_close: Option<u64>,
    surfaces: Vec<(u64, String)>,
    next_surface: u64,
}

struct Inner {
    signals: Arc<SessionSignals>,
    window: Duration,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clear the restriction raised at `generation`, if it is still current.
    fn expire(&self, generation: u64) {
        let (cleared, force_cleared) = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            let cleared = state.active.take().is_some();
            let force_cleared = state.force_close.take().is_some();
            (cleared, force_cleared)
        };
        if cleared {
            debug!(generation, "plan restriction window elapsed");
            self.signals.emit(SessionEvent::PlanRestrictionCleared);
        }
        if force_cleared {
            self.signals.emit(SessionEvent::ForceCloseCleared);
        }
    }

    fn close_surface(&self, id: u64) {
        let force_cleared = {
            let mut state = self.lock();
            state.surfaces.retain(|(sid, _)| *sid != id);
            state.surfaces.is_empty() && state.force_close.take().is_some()
        };
        if force_cleared {
            debug!("all surfaces closed, force-close request satisfied");
            self.signals.emit(SessionEvent::ForceCloseCleared);
        }
    }
}

/// Raises, broadcasts and expires plan restrictions. Cheap to clone.
#[derive(Clone)]
pub struct PlanRestrictionBroadcaster {
    inner: Arc<Inner>,
}

impl PlanRestrictionBroadcaster {
    pub fn new(signals: Arc<SessionSignals>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                signals,
                window,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Register an open surface. It stays registered until the guard drops.
    pub fn open_surface(&self, name: impl Into<String>) -> SurfaceGuard {
        let name = name.into();
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_surface;
            state.next_surface += 1;
            state.surfaces.push((id, name.clone()));
            id
        };
        debug!(surface = %name, "surface opened");
        SurfaceGuard {
            id,
            name,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Names of currently open surfaces, in opening order.
    pub fn open_surfaces(&self) -> Vec<String> {
        self.inner
            .lock()
            .surfaces
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Raise a restriction for a refused request and start its expiry timer.
    ///
    /// A restriction raised while another is active replaces it and restarts
    /// the window. Must be called from within a tokio runtime.
    pub fn raise(&self, path: &str, response: &ApiResponse) -> PlanRestriction {
        let (restriction, generation, close) = {
            let mut state = self.inner.lock();
            let open: Vec<String> = state.surfaces.iter().map(|(_, n)| n.clone()).collect();
            let restriction = PlanRestriction::from_response(path, response, open);
            state.generation += 1;
            let generation = state.generation;
            state.active = Some(restriction.clone());
            let close = !state.surfaces.is_empty();
            if close {
                state.force_close = Some(generation);
            }
            (restriction, generation, close)
        };

        warn!(
            path,
            feature = restriction.feature.as_deref().unwrap_or(""),
            resource = restriction.resource.as_deref().unwrap_or(""),
            surfaces = restriction.open_surfaces.len(),
            "plan restriction raised"
        );
        metrics::counter!("session_plan_restrictions_total").increment(1);

        self.inner
            .signals
            .emit(SessionEvent::PlanRestricted(restriction.clone()));
        if close {
            self.inner.signals.emit(SessionEvent::ForceCloseSurfaces {
                surfaces: restriction.open_surfaces.clone(),
            });
        }

        let weak = Arc::downgrade(&self.inner);
        let window = self.inner.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(generation);
            }
        });

        restriction
    }

    /// The active restriction, if the window has not elapsed.
    pub fn current(&self) -> Option<PlanRestriction> {
        self.inner.lock().active.clone()
    }

    pub fn is_restricted(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// Whether open surfaces have been asked to close and some remain.
    pub fn force_close_requested(&self) -> bool {
        self.inner.lock().force_close.is_some()
    }

    /// Drop the active restriction and any force-close request now.
    pub fn clear(&self) {
        let generation = {
            let mut state = self.inner.lock();
            // Bump so a pending timer for the old restriction becomes a no-op
            state.generation += 1;
            state.generation
        };
        let had = self.is_restricted() || self.force_close_requested();
        if had {
            info!("plan restriction cleared");
        }
        self.inner.expire(generation);
    }
}

/// Registration of one open surface. Dropping it closes the surface.
#[must_use = "the surface deregisters as soon as the guard drops"]
pub struct SurfaceGuard {
    id: u64,
    name: String,
    inner: Weak<Inner>,
}

impl Drop for SurfaceGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            debug!(surface = %self.name, "surface closed");
            inner.close_surface(self.id);
        }
    }
}
