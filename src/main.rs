//! CLI for fmrelay
//!
//! Subcommands:
//! - `serve`: run the WebSocket relay
//! - `watch`: connect to a relay and print every track it sends (useful for
//!   smoke tests)

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fmrelay::broker::Hub;
use fmrelay::config::{Settings, load_config};
use fmrelay::source::LastFm;
use fmrelay::transport::{OriginPolicy, ServerOptions, start_websocket_server};
use fmrelay::utils::logging;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fmrelay")]
enum Command {
    /// Start the WebSocket relay
    Serve,
    /// Connect to a relay and print received tracks
    Watch {
        /// Username to watch
        username: String,
        /// Relay base URL
        #[arg(long, default_value = "ws://127.0.0.1:3621")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    match Command::parse() {
        Command::Serve => run_server().await,
        Command::Watch { username, url } => {
            logging::init("info");
            match run_watch(&url, &username).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Watch failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run_server() -> ExitCode {
    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log_level);

    match serve(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let source = LastFm::new(settings.lastfm.api_url.clone(), settings.lastfm.api_key.clone())?;
    let hub = Arc::new(Hub::new(Arc::new(source), settings.hub_config()));
    let options = ServerOptions {
        origins: OriginPolicy::new(settings.server.allowed_origins.clone()),
        shutdown_timeout: settings.shutdown_timeout(),
        ..ServerOptions::default()
    };
    info!(
        max_pollers = settings.broker.max_pollers,
        poll_interval_secs = settings.broker.poll_interval_secs,
        "starting relay"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    start_websocket_server(&settings.bind_addr(), hub, options, shutdown).await?;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_watch(url: &str, username: &str) -> Result<(), Box<dyn std::error::Error>> {
    let target = format!("{}/fm/{}", url.trim_end_matches('/'), username);
    let (mut ws_stream, _response) = connect_async(target.as_str()).await?;
    info!("Connected to {target}");

    while let Some(msg) = ws_stream.next().await {
        match msg? {
            WsMessage::Text(text) => println!("{}", text.as_str()),
            WsMessage::Close(frame) => {
                if let Some(frame) = frame {
                    println!("Closed: {} {}", u16::from(frame.code), frame.reason.as_str());
                }
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
