//! Realtime channel transport
//!
//! A `Channel` is one open socket session with its own bounded auto-reconnect.
//! It reports lifecycle changes and inbound text frames as `ChannelEvent`s
//! and accepts outbound text frames. `ChannelFactory` is the seam the
//! connection manager opens channels through; `WsChannelFactory` is the
//! WebSocket implementation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Lifecycle and data events reported by a channel, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Socket is open. `reconnect` is false only for the first session.
    Connected { reconnect: bool },
    /// Waiting before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
    Disconnected { reason: String },
    /// Reconnect attempts used up; the channel has stopped.
    ReconnectFailed,
    /// Channel cannot work at all (e.g. bad URL); it has stopped.
    Failed(String),
    Frame(String),
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ChannelOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Handle on an open channel. Dropping it stops the channel.
pub struct Channel {
    outbound: mpsc::UnboundedSender<String>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    task: Option<JoinHandle<()>>,
}

impl Channel {
    /// Assemble a channel from its halves. `task` is aborted on drop.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            events: Some(events),
            task,
        }
    }

    /// Queue a text frame for sending.
    pub fn send(&self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| Error::Channel("channel task has stopped".into()))
    }

    /// Take the event stream. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens channels for the connection manager.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, options: &ChannelOptions) -> Channel;
}

/// WebSocket channels via tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsChannelFactory;

impl ChannelFactory for WsChannelFactory {
    fn open(&self, options: &ChannelOptions) -> Channel {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(Arc::new(options.clone()), outbound_rx, events_tx));
        Channel::new(outbound_tx, events_rx, Some(task))
    }
}

enum SessionEnd {
    Dropped(String),
    Stopped,
}

/// Connect, pump, and reconnect with a fixed delay until attempts run out.
async fn run_socket(
    options: Arc<ChannelOptions>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut attempt: u32 = 0;
    let mut sessions: u32 = 0;

    loop {
        // Frames queued for a previous socket are stale
        while outbound.try_recv().is_ok() {}

        match tokio_tungstenite::connect_async(options.url.as_str()).await {
            Ok((socket, _response)) => {
                attempt = 0;
                info!(url = %options.url, reconnect = sessions > 0, "realtime channel connected");
                if events.send(ChannelEvent::Connected { reconnect: sessions > 0 }).is_err() {
                    return;
                }
                sessions += 1;

                match pump(socket, &mut outbound, &events).await {
                    SessionEnd::Stopped => return,
                    SessionEnd::Dropped(reason) => {
                        warn!(reason = %reason, "realtime channel dropped");
                        if events.send(ChannelEvent::Disconnected { reason }).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e @ (tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_))) => {
                warn!(url = %options.url, error = %e, "realtime url rejected");
                let _ = events.send(ChannelEvent::Failed(format!("invalid realtime url: {e}")));
                return;
            }
            Err(e) => {
                warn!(url = %options.url, error = %e, attempt, "realtime connect failed");
            }
        }

        attempt += 1;
        if attempt > options.reconnect_attempts {
            warn!(attempts = options.reconnect_attempts, "realtime reconnect attempts exhausted");
            let _ = events.send(ChannelEvent::ReconnectFailed);
            return;
        }
        if events.send(ChannelEvent::Reconnecting { attempt }).is_err() {
            return;
        }
        tokio::time::sleep(options.reconnect_delay).await;
    }
}

async fn pump<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return SessionEnd::Dropped(format!("send failed: {e}"));
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return SessionEnd::Stopped;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if events.send(ChannelEvent::Frame(text.as_str().to_string())).is_err() {
                        return SessionEnd::Stopped;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".into());
                    return SessionEnd::Dropped(reason);
                }
                Some(Ok(other)) => {
                    debug!(kind = ?std::mem::discriminant(&other), "ignoring non-text frame");
                }
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                None => return SessionEnd::Dropped("stream ended".into()),
            },
        }
    }
}
