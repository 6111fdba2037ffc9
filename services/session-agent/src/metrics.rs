//! Prometheus metrics exposition
//!
//! The library crates record through the `metrics` facade:
//!
//! - `session_refresh_total` (counter): label `outcome`
//! - `session_queue_depth` (gauge)
//! - `session_plan_restrictions_total` (counter)
//! - `realtime_state_transitions_total` (counter): label `state`
//! - `realtime_frames_total` (counter): label `type`
//! - `realtime_frames_dropped_total` (counter)
//!
//! The agent adds its own:
//!
//! - `session_events_total` (counter): label `event`
//! - `session_active` (gauge)
//! - `realtime_connected` (gauge)

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use realtime::ConnectionState;
use session_gate::SessionEvent;

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Fails if another global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Label used for a session event in `session_events_total`.
pub fn event_label(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::ReauthRequired { .. } => "reauth_required",
        SessionEvent::ReauthCompleted { .. } => "reauth_completed",
        SessionEvent::ReauthAbandoned { .. } => "reauth_abandoned",
        SessionEvent::LoggedOut { forced: true } => "forced_logout",
        SessionEvent::LoggedOut { forced: false } => "logout",
        SessionEvent::PlanRestricted(_) => "plan_restricted",
        SessionEvent::PlanRestrictionCleared => "plan_restriction_cleared",
        SessionEvent::ForceCloseSurfaces { .. } => "force_close",
        SessionEvent::ForceCloseCleared => "force_close_cleared",
    }
}

pub fn record_session_event(event: &SessionEvent) {
    metrics::counter!("session_events_total", "event" => event_label(event)).increment(1);
}

pub fn set_session_active(active: bool) {
    metrics::gauge!("session_active").set(if active { 1.0 } else { 0.0 });
}

/// Authenticated counts as connected; a channel that is up but not yet
/// authenticated does not deliver anything.
pub fn set_realtime_state(state: ConnectionState) {
    let connected = state == ConnectionState::Authenticated;
    metrics::gauge!("realtime_connected").set(if connected { 1.0 } else { 0.0 });
}
