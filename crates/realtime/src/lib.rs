//! Realtime delivery over a persistent channel
//!
//! `ConnectionManager` keeps one authenticated channel open while the
//! session is active, reconnecting with a bounded fixed-interval policy and
//! re-running the handshake after every reconnect. Inbound frames are
//! normalized to `RealtimeMessage` and routed by `MessageDispatcher` to
//! exact-type listeners, then wildcard listeners.
//!
//! Channel lifecycle:
//! 1. `connect(user_id)` → CONNECTING, channel opened via `ChannelFactory`
//! 2. Channel up → CONNECTED, `authenticate` frame sent
//! 3. `authenticated` → AUTHENTICATED; `authentication_error` → ERROR
//! 4. Drop → DISCONNECTED → RECONNECTING → CONNECTED (handshake again)
//! 5. Attempts exhausted → DISCONNECTED until `connect` is called again

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod manager;
pub mod state;

pub use channel::{Channel, ChannelEvent, ChannelFactory, ChannelOptions, WsChannelFactory};
pub use dispatcher::{MessageDispatcher, Subscription, SubscriptionGuard};
pub use error::{Error, Result};
pub use frame::{ClientFrame, NOTIFICATION, RealtimeMessage, ServerFrame, parse_server_frame};
pub use manager::ConnectionManager;
pub use state::{ConnectionAction, ConnectionEvent, ConnectionState, handle_event};
