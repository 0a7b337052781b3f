//! Subscriber connection
//!
//! Each accepted connection runs two duties:
//! - the writer drains the outbound queue to the socket, pings the peer on a
//!   fixed period and sends a close frame when the queue closes or the
//!   server shuts down;
//! - the reader discards inbound frames and pushes its deadline forward on
//!   every pong. A missed deadline, a peer close or a read error ends it.
//!
//! When the reader ends the connection is unsubscribed before the socket is
//! released, which closes the queue and lets the writer finish.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, Receiver};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tungstenite::Error as WsError;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Message as WsMessage, WebSocketConfig};

use crate::broker::Hub;
use crate::client::{OUTBOUND_CAPACITY, Subscriber, SubscriberId, Username};
use crate::utils::error::HubError;

pub const WRITE_WAIT: Duration = Duration::from_secs(10);
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// 90% of `PONG_WAIT`, so a ping always lands before the read deadline.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const MAX_MESSAGE_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for a single frame write.
    pub write_wait: Duration,
    /// How long the reader waits for a pong before giving up on the peer.
    pub pong_wait: Duration,
    pub ping_period: Duration,
    /// Largest inbound message accepted; anything bigger ends the connection.
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Subscribe an upgraded socket to `username` and serve it until either
/// side goes away or `shutdown` fires.
pub async fn run_connection<S>(
    mut ws: WebSocketStream<S>,
    username: Username,
    hub: Arc<Hub>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let subscriber = Subscriber::new(username.clone(), tx);
    let id = subscriber.id.clone();

    if let Err(e) = hub.subscribe(subscriber) {
        warn!(username = %username, "subscribe error: {e}");
        reject(&mut ws, &e, config.write_wait).await;
        return;
    }

    let (sink, stream) = ws.split();
    let closing = CancellationToken::new();

    let writer = tokio::spawn(write_pump(
        sink,
        rx,
        config.clone(),
        shutdown,
        closing.clone(),
        id.clone(),
    ));

    read_pump(stream, &config, &closing, &username).await;
    hub.unsubscribe(&username, &id);

    if let Err(e) = writer.await {
        error!(subscriber = %id, "writer task failed: {e}");
    }
    debug!(username = %username, subscriber = %id, "connection closed");
}

/// Close an upgraded connection that arrived too late to be served.
pub(crate) async fn refuse_during_shutdown<S>(mut ws: WebSocketStream<S>, wait: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = with_deadline(wait, ws.close(Some(going_away()))).await {
        debug!("failed to send shutdown close frame: {e}");
    }
}

fn going_away() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Away,
        reason: "server shutting down".into(),
    }
}

/// Close a connection that could not be subscribed with "try again later".
async fn reject<S>(ws: &mut WebSocketStream<S>, err: &HubError, wait: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Again,
        reason: err.to_string().into(),
    };
    if let Err(e) = with_deadline(wait, ws.close(Some(frame))).await {
        debug!("failed to send rejection close frame: {e}");
        return;
    }
    // Give the peer a moment to finish the closing handshake.
    let _ = time::timeout(wait, async { while let Some(Ok(_)) = ws.next().await {} }).await;
}

async fn write_pump<S>(
    mut sink: WsSink<S>,
    mut rx: Receiver<WsMessage>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
    closing: CancellationToken,
    id: SubscriberId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = with_deadline(config.write_wait, sink.send(msg)).await {
                        debug!(subscriber = %id, "write failed: {e}");
                        break;
                    }
                }
                // Unsubscribed: say goodbye and stop.
                None => {
                    let _ = with_deadline(config.write_wait, sink.send(WsMessage::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = with_deadline(config.write_wait, sink.send(WsMessage::Ping(Default::default()))).await {
                    debug!(subscriber = %id, "ping failed: {e}");
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                let _ = with_deadline(config.write_wait, sink.send(WsMessage::Close(Some(going_away())))).await;
                break;
            }
        }
    }

    closing.cancel();
}

async fn read_pump<S>(
    mut stream: WsSource<S>,
    config: &ConnectionConfig,
    closing: &CancellationToken,
    username: &Username,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            _ = closing.cancelled() => break,
            _ = time::sleep_until(deadline) => {
                debug!(username = %username, "no pong within {:?}, dropping connection", config.pong_wait);
                break;
            }
            next = stream.next() => next,
        };

        match next {
            None => break,
            Some(Ok(WsMessage::Pong(_))) => deadline = Instant::now() + config.pong_wait,
            Some(Ok(WsMessage::Close(frame))) => {
                if let Some(frame) = frame.filter(|f| !is_expected_close(f.code)) {
                    warn!(
                        username = %username,
                        "WebSocket closed with {}: {}",
                        u16::from(frame.code),
                        frame.reason.as_str()
                    );
                }
                break;
            }
            // Server-to-client only; everything else is ignored.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                if is_unexpected_error(&e) {
                    warn!(username = %username, "WebSocket error: {e}");
                }
                break;
            }
        }
    }
}

fn is_expected_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Normal | CloseCode::Away)
}

fn is_unexpected_error(err: &WsError) -> bool {
    !matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake)
    )
}

async fn with_deadline<F>(wait: Duration, fut: F) -> Result<(), WsError>
where
    F: std::future::Future<Output = Result<(), WsError>>,
{
    match time::timeout(wait, fut).await {
        Ok(result) => result,
        Err(_) => Err(WsError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}
