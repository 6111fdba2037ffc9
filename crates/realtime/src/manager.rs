//! Connection manager
//!
//! Owns the realtime channel lifecycle. Every state change goes through
//! `state::handle_event` under one async mutex, so transitions are
//! serialized. Each opened channel gets a generation number; events from a
//! channel that has since been replaced or closed are ignored.
//!
//! Inbound application messages are handed to the `MessageDispatcher` from
//! the channel's single event task, in arrival order.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, ChannelFactory, ChannelOptions};
use crate::dispatcher::MessageDispatcher;
use crate::frame::{ClientFrame, RealtimeMessage, ServerFrame, parse_server_frame};
use crate::state::{ConnectionAction, ConnectionEvent, ConnectionState, handle_event};

struct Control {
    state: ConnectionState,
    generation: u64,
    user_id: Option<String>,
    channel: Option<Channel>,
    events_task: Option<JoinHandle<()>>,
}

struct Inner {
    factory: Arc<dyn ChannelFactory>,
    options: ChannelOptions,
    dispatcher: MessageDispatcher,
    state_tx: watch::Sender<ConnectionState>,
    control: Mutex<Control>,
}

/// Realtime connection service. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        options: ChannelOptions,
        dispatcher: MessageDispatcher,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                factory,
                options,
                dispatcher,
                state_tx,
                control: Mutex::new(Control {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    user_id: None,
                    channel: None,
                    events_task: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.inner.dispatcher
    }

    pub async fn user_id(&self) -> Option<String> {
        self.inner.control.lock().await.user_id.clone()
    }

    /// Open a fresh channel, closing any existing one first.
    ///
    /// The handshake runs once the channel reports it is up, using
    /// `user_id` (or the previously known id when `None`).
    pub async fn connect(&self, user_id: Option<String>) {
        let mut control = self.inner.control.lock().await;
        close_channel(&mut control);
        if user_id.is_some() {
            control.user_id = user_id;
        }
        control.generation += 1;
        let generation = control.generation;

        let action = self.inner.apply(&mut control, ConnectionEvent::ConnectRequested);
        if action != ConnectionAction::OpenChannel {
            return;
        }

        info!(url = %self.inner.options.url, generation, "opening realtime channel");
        let mut channel = self.inner.factory.open(&self.inner.options);
        let Some(mut events) = channel.take_events() else {
            warn!("channel factory returned a channel without events");
            return;
        };
        control.channel = Some(channel);

        let inner = self.inner.clone();
        control.events_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                inner.on_channel_event(generation, event).await;
            }
            debug!(generation, "channel event stream ended");
        }));
    }

    /// Close the channel and go to Disconnected. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut control = self.inner.control.lock().await;
        close_channel(&mut control);
        control.generation += 1;
        self.inner.apply(&mut control, ConnectionEvent::DisconnectRequested);
    }

    /// Switch the user the channel authenticates as. Re-runs the handshake
    /// immediately when connected.
    pub async fn update_user_id(&self, user_id: Option<String>) {
        let mut control = self.inner.control.lock().await;
        if control.user_id == user_id {
            return;
        }
        control.user_id = user_id;
        let has_user = control.user_id.is_some();
        self.inner.apply(&mut control, ConnectionEvent::UserChanged { has_user });
    }

    /// Connect whenever `active` turns true and disconnect when it turns
    /// false. Stops when the sender side is dropped.
    pub fn follow_session(&self, mut active: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let is_active = *active.borrow_and_update();
                if is_active {
                    if !manager.state().is_connected() {
                        manager.connect(None).await;
                    }
                } else if manager.state() != ConnectionState::Disconnected {
                    manager.disconnect().await;
                }
                if active.changed().await.is_err() {
                    break;
                }
            }
            debug!("session follower stopped");
        })
    }
}

fn close_channel(control: &mut Control) {
    if let Some(task) = control.events_task.take() {
        task.abort();
    }
    if control.channel.take().is_some() {
        debug!(generation = control.generation, "realtime channel closed");
    }
}

impl Inner {
    /// Run one transition and execute its action. Caller holds the lock.
    fn apply(&self, control: &mut Control, event: ConnectionEvent) -> ConnectionAction {
        let previous = control.state;
        let (next, action) = handle_event(previous, event);
        if next != previous {
            info!(from = %previous, to = %next, ?event, "realtime state changed");
            metrics::counter!("realtime_state_transitions_total", "state" => next.as_str())
                .increment(1);
            control.state = next;
            self.state_tx.send_replace(next);
        }

        match action {
            ConnectionAction::SendAuthenticate => self.send_authenticate(control),
            ConnectionAction::CloseChannel => {
                // Anything the closed channel still reports is stale
                control.generation += 1;
                if control.channel.take().is_some() {
                    debug!("realtime channel closed after {event:?}");
                }
            }
            ConnectionAction::OpenChannel | ConnectionAction::None => {}
        }
        action
    }

    fn send_authenticate(&self, control: &Control) {
        let (Some(user_id), Some(channel)) = (&control.user_id, &control.channel) else {
            return;
        };
        let frame = ClientFrame::Authenticate {
            user_id: user_id.clone(),
        };
        match channel.send(frame.to_json()) {
            Ok(()) => debug!(user_id = %user_id, "authenticate sent"),
            Err(e) => warn!(error = %e, "could not send authenticate"),
        }
    }

    async fn on_channel_event(&self, generation: u64, event: ChannelEvent) {
        let messages = {
            let mut control = self.control.lock().await;
            if control.generation != generation {
                debug!(
                    generation,
                    current = control.generation,
                    "ignoring event from stale channel"
                );
                return;
            }
            match event {
                ChannelEvent::Connected { reconnect } => {
                    let has_user = control.user_id.is_some();
                    debug!(reconnect, has_user, "channel up");
                    self.apply(&mut control, ConnectionEvent::TransportConnected { has_user });
                    return;
                }
                ChannelEvent::Reconnecting { attempt } => {
                    debug!(attempt, "channel reconnecting");
                    self.apply(&mut control, ConnectionEvent::TransportReconnecting);
                    return;
                }
                ChannelEvent::Disconnected { reason } => {
                    info!(reason = %reason, "realtime channel disconnected");
                    self.apply(&mut control, ConnectionEvent::TransportDisconnected);
                    return;
                }
                ChannelEvent::ReconnectFailed => {
                    self.apply(&mut control, ConnectionEvent::ReconnectExhausted);
                    return;
                }
                ChannelEvent::Failed(reason) => {
                    warn!(reason = %reason, "realtime channel failed");
                    self.apply(&mut control, ConnectionEvent::TransportFailed);
                    return;
                }
                ChannelEvent::Frame(text) => match parse_server_frame(&text) {
                    Ok(ServerFrame::Authenticated { success: true }) => {
                        self.apply(&mut control, ConnectionEvent::Authenticated);
                        return;
                    }
                    Ok(ServerFrame::Authenticated { success: false }) => {
                        warn!("realtime authentication rejected");
                        self.apply(&mut control, ConnectionEvent::AuthenticationFailed);
                        return;
                    }
                    Ok(ServerFrame::AuthenticationError(reason)) => {
                        warn!(reason = %reason, "realtime authentication error");
                        self.apply(&mut control, ConnectionEvent::AuthenticationFailed);
                        return;
                    }
                    Ok(ServerFrame::Unknown(name)) => {
                        debug!(event = %name, "ignoring unhandled realtime event");
                        return;
                    }
                    Ok(ServerFrame::Messages(messages)) => messages,
                    Err(e) => {
                        warn!(error = %e, "dropping realtime frame");
                        metrics::counter!("realtime_frames_dropped_total").increment(1);
                        return;
                    }
                },
            }
        };
        // Listeners run without the lock so they can query the manager
        self.deliver(&messages);
    }

    fn deliver(&self, messages: &[RealtimeMessage]) {
        for message in messages {
            metrics::counter!("realtime_frames_total", "type" => message.kind.clone()).increment(1);
            self.dispatcher.dispatch(message);
        }
    }
}
