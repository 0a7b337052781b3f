//! WebSocket transport
//!
//! Accepts TCP connections, validates and upgrades them on `/fm/{username}`
//! and hands each one to `connection::run_connection`. Responsibilities:
//! - reject bad paths, usernames and origins before the upgrade
//! - bound the handshake so idle sockets do not pile up
//! - abandon handshakes still in flight when shutdown starts; an upgrade
//!   that completes anyway is closed with 1001 and never subscribed
//! - on shutdown, stop accepting, let open connections close within the
//!   grace period and report when they did not

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::broker::Hub;
use crate::client::Username;
use crate::transport::connection::{ConnectionConfig, refuse_during_shutdown, run_connection};
use crate::transport::handshake::{OriginPolicy, check_request};
use crate::utils::error::ServerError;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub origins: OriginPolicy,
    pub connection: ConnectionConfig,
    pub handshake_timeout: Duration,
    /// Grace period for open connections once shutdown starts.
    pub shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            origins: OriginPolicy::allow_all(),
            connection: ConnectionConfig::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn start_websocket_server(
    addr: &str,
    hub: Arc<Hub>,
    options: ServerOptions,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    serve(listener, hub, options, shutdown).await
}

/// Run the accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    options: ServerOptions,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket server listening on ws://{addr}"),
        Err(_) => info!("WebSocket server listening"),
    }

    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&hub),
                        options.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!("accept error: {e}");
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    info!("Shutting down gracefully...");
    tracker.close();

    match time::timeout(options.shutdown_timeout, tracker.wait()).await {
        Ok(()) => {
            info!("Server stopped");
            Ok(())
        }
        Err(_) => Err(ServerError::ShutdownTimeout(options.shutdown_timeout)),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    options: ServerOptions,
    shutdown: CancellationToken,
) {
    let mut requested: Option<Username> = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match check_request(req, &options.origins) {
            Ok(username) => {
                requested = Some(username);
                Ok(response)
            }
            Err(rejection) => {
                debug!(%peer, path = req.uri().path(), status = %rejection.status(), "upgrade rejected");
                Err(rejection)
            }
        }
    };

    let config = options.connection.websocket_config();
    let handshake = time::timeout(
        options.handshake_timeout,
        accept_hdr_async_with_config(stream, callback, Some(config)),
    );
    let ws = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            debug!(%peer, "handshake abandoned on shutdown");
            return;
        }
        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                debug!(%peer, "WebSocket upgrade error: {e}");
                return;
            }
            Err(_) => {
                debug!(%peer, "WebSocket handshake timed out");
                return;
            }
        },
    };

    let Some(username) = requested else {
        return;
    };

    if shutdown.is_cancelled() {
        debug!(%peer, username = %username, "upgrade completed during shutdown, not subscribing");
        refuse_during_shutdown(ws, options.connection.write_wait).await;
        return;
    }

    run_connection(ws, username, hub, options.connection, shutdown).await;
}
