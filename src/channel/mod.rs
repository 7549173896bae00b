//! Event channel
//!
//! Persistent WebSocket stream running alongside the audio channel. The server pushes
//! transcript, display and agent-state events; the client only sends keep-alive pings.
//! Inbound events are delivered through a single ordered queue.

mod messages;

pub use messages::{parse_server_event, ClientMessage, ServerEvent};

use crate::api::join_path;
use crate::error::{ChannelError, ChannelParseError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close()` waits for the close frame to go out
const CLOSE_GRACE_MS: u64 = 500;

/// Something the reader observed on the channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(ServerEvent),
    /// The remote side closed the channel or the connection failed
    Closed { reason: String },
}

enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Connection settings for the event channel
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    /// None disables keep-alive pings
    pub ping_interval: Option<Duration>,
}

impl ChannelOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        let ping = config.channel.ping_interval_secs;
        Self {
            connect_timeout: config.channel_connect_timeout(),
            ping_interval: (ping > 0).then(|| Duration::from_secs(ping)),
        }
    }
}

/// Derive the session-scoped event channel address from the HTTP base URL
pub fn event_channel_url(base_url: &str, session_id: &str) -> Result<Url, ChannelError> {
    let mut base = Url::parse(base_url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    };
    base.set_scheme(scheme)
        .map_err(|_| ChannelError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;
    join_path(&base, &format!("/api/webrtc/ws/{}", session_id))
        .map_err(|e| ChannelError::InvalidUrl(e.to_string()))
}

/// Open event channel
pub struct EventChannel {
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    recv_task: Option<JoinHandle<()>>,
    send_task: Option<JoinHandle<()>>,
    closed: bool,
}

impl EventChannel {
    /// Connect to the event channel
    pub async fn open(url: &Url, options: ChannelOptions) -> Result<Self, ChannelError> {
        info!(url = %url, "Opening event channel");

        let ws_stream = match timeout(options.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!("Event channel connection failed: {}", e);
                return Err(ChannelError::Connect(e.to_string()));
            }
            Err(_) => {
                error!("Event channel connection timed out");
                return Err(ChannelError::ConnectTimeout(options.connect_timeout.as_secs()));
            }
        };

        info!("Event channel connected");

        let (ws_sink, ws_stream) = ws_stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let recv_task = tokio::spawn(run_receive(ws_stream, events_tx));
        let send_task = tokio::spawn(run_send(ws_sink, outbound_rx, options.ping_interval));

        Ok(Self {
            events_rx,
            outbound_tx,
            recv_task: Some(recv_task),
            send_task: Some(send_task),
            closed: false,
        })
    }

    /// Next inbound event, in the order the server sent them.
    /// Returns None once the channel has been closed locally.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        self.events_rx.recv().await
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.outbound_tx
            .send(Outbound::Message(msg))
            .map_err(|_| ChannelError::Closed)
    }

    /// Close the channel. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.outbound_tx.send(Outbound::Close);
        if let Some(send_task) = self.send_task.take() {
            if timeout(Duration::from_millis(CLOSE_GRACE_MS), send_task)
                .await
                .is_err()
            {
                debug!("Event channel close frame not flushed in time");
            }
        }
        if let Some(recv_task) = self.recv_task.take() {
            recv_task.abort();
        }
        self.events_rx.close();
        info!("Event channel closed");
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Some(task) = self.send_task.take() {
            task.abort();
        }
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

#[tracing::instrument(skip_all)]
async fn run_receive(
    mut ws_stream: SplitStream<WsStream>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
) {
    let reason = loop {
        match ws_stream.next().await {
            Some(Ok(Message::Text(text))) => {
                trace!("Event channel message: {}", text);
                match parse_server_event(&text) {
                    Ok(ServerEvent::Pong) => trace!("Event channel pong"),
                    Ok(event) => {
                        if events_tx.send(ChannelEvent::Message(event)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping event: {} - {}", e, text),
                }
            }
            Some(Ok(Message::Binary(data))) => {
                let e = ChannelParseError::UnsupportedFrame("binary");
                warn!("Dropping event: {} ({} bytes)", e, data.len());
            }
            Some(Ok(Message::Close(frame))) => {
                info!("Event channel closed by server");
                break frame
                    .map(|f| format!("closed by server ({}): {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Event channel receive error: {}", e);
                break e.to_string();
            }
            None => break "connection ended".to_string(),
        }
    };

    let _ = events_tx.send(ChannelEvent::Closed { reason });
}

#[tracing::instrument(skip_all)]
async fn run_send(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ping_interval: Option<Duration>,
) {
    let mut ping: Option<Interval> = ping_interval.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        let next_ping = async {
            match ping.as_mut() {
                Some(ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Message(msg)) => {
                    if let Err(e) = send_json(&mut ws_sink, &msg).await {
                        warn!("Failed to send event channel message: {}", e);
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_sink.close().await;
                    break;
                }
            },
            _ = next_ping => {
                if let Err(e) = send_json(&mut ws_sink, &ClientMessage::Ping).await {
                    warn!("Failed to send event channel keepalive ping: {}", e);
                    break;
                }
                trace!("Sent event channel keepalive ping");
            }
        }
    }
}

async fn send_json(
    ws_sink: &mut SplitSink<WsStream, Message>,
    msg: &ClientMessage,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    ws_sink
        .send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal WebSocket server for exercising the event channel
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    /// Accept one client, send `frames`, then forward whatever the client sends to the
    /// returned receiver. The connection is closed after the frames when `close_after`.
    pub(crate) async fn serve(
        frames: Vec<Message>,
        close_after: bool,
    ) -> (Url, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client_tx, client_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(frame).await.unwrap();
            }
            if close_after {
                let _ = ws.close(None).await;
            }
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = client_tx.send(text);
                }
            }
        });

        let url = Url::parse(&format!("ws://{}/api/webrtc/ws/test", addr)).unwrap();
        (url, client_rx)
    }

    /// Accept one client and run `on_close` when it sends a Close frame
    pub(crate) async fn serve_until_close(on_close: impl FnOnce() + Send + 'static) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    on_close();
                    break;
                }
            }
        });

        Url::parse(&format!("ws://{}/api/webrtc/ws/test", addr)).unwrap()
    }
}
