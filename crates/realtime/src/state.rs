//! Connection state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! `ConnectionManager` executes the channel I/O implied by each action.
//!
//! Happy path: Disconnected → Connecting → Connected → Authenticated.
//! A channel drop moves to Disconnected; each reconnect attempt to
//! Reconnecting; a successful reconnect back to Connected, where the
//! handshake runs again. Authentication is only reachable from Connected.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Authenticated => "AUTHENTICATED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        }
    }

    /// Whether the channel is up (handshake done or not).
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authenticated)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// `connect()` called
    ConnectRequested,
    /// Channel is up; `has_user` when a user id is known for the handshake
    TransportConnected { has_user: bool },
    /// Channel is retrying after a drop or a failed first attempt
    TransportReconnecting,
    /// Channel dropped
    TransportDisconnected,
    /// Bounded reconnect attempts used up
    ReconnectExhausted,
    /// Server replied `authenticated` with success
    Authenticated,
    /// Server replied `authentication_error` or an unsuccessful `authenticated`
    AuthenticationFailed,
    /// User id replaced via `update_user_id`
    UserChanged { has_user: bool },
    /// Unrecoverable channel failure (e.g. invalid URL)
    TransportFailed,
    /// `disconnect()` called
    DisconnectRequested,
}

/// Actions the manager should execute after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    OpenChannel,
    SendAuthenticate,
    CloseChannel,
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: ConnectionState,
    event: ConnectionEvent,
) -> (ConnectionState, ConnectionAction) {
    use ConnectionAction as A;
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        // --- Explicit requests win from any state ---
        (_, E::DisconnectRequested) => (S::Disconnected, A::CloseChannel),
        (_, E::ConnectRequested) => (S::Connecting, A::OpenChannel),
        (_, E::TransportFailed) => (S::Error, A::CloseChannel),

        // --- Channel up ---
        (S::Connecting | S::Reconnecting, E::TransportConnected { has_user: true }) => {
            (S::Connected, A::SendAuthenticate)
        }
        (S::Connecting | S::Reconnecting, E::TransportConnected { has_user: false }) => {
            (S::Connected, A::None)
        }

        // --- Handshake ---
        (S::Connected | S::Authenticated, E::Authenticated) => (S::Authenticated, A::None),
        (S::Connected | S::Authenticated, E::AuthenticationFailed) => (S::Error, A::CloseChannel),
        (S::Connected | S::Authenticated, E::UserChanged { has_user: true }) => {
            (state, A::SendAuthenticate)
        }

        // --- Drops and retries ---
        (S::Connected | S::Authenticated, E::TransportDisconnected) => (S::Disconnected, A::None),
        (
            S::Connecting | S::Connected | S::Authenticated | S::Disconnected | S::Reconnecting,
            E::TransportReconnecting,
        ) => (S::Reconnecting, A::None),
        (S::Connecting | S::Reconnecting | S::Disconnected, E::ReconnectExhausted) => {
            (S::Disconnected, A::CloseChannel)
        }

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, A::None),
    }
}
