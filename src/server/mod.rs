//! WebSocket server front end.
//!
//! One task per connection. Inbound frames are processed in arrival order;
//! outbound events flow through a per-connection channel so pipeline stages
//! can narrate progress while they run. A background sweeper evicts idle
//! upload sessions and jobs.

pub mod frame;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::job::JobTracker;
use crate::provider::{AssemblyAiClient, OpenAiTranslator};
use crate::upload::UploadRegistry;
use router::{ConnectionScope, EventRouter, OutboundEvent};

/// Bind and serve until `shutdown` flips to `true`.
pub async fn run(
    listen: SocketAddr,
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let provider = Arc::new(AssemblyAiClient::new(
        config.transcription_api_key.clone(),
        config.transcription_base_url.clone(),
    ));
    let translator = Arc::new(OpenAiTranslator::new(
        config.translation_api_key.clone(),
        config.translation_base_url.clone(),
        config.translation_model.clone(),
    ));
    let uploads = Arc::new(UploadRegistry::new());
    let jobs = Arc::new(JobTracker::new());
    let router = Arc::new(EventRouter::new(
        uploads.clone(),
        jobs.clone(),
        provider,
        translator,
        config.language_code.clone(),
    ));

    tokio::spawn(sweep(uploads, jobs, config.clone(), shutdown.clone()));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!("Listening on {}", listen);
    serve(listener, router, config.max_message_bytes, shutdown).await
}

async fn serve(
    listener: TcpListener,
    router: Arc<EventRouter>,
    max_message_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Server shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                let router = router.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(router, stream, peer, max_message_bytes, shutdown).await
                    {
                        warn!("Connection {} ended with error: {}", peer, e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    router: Arc<EventRouter>,
    stream: TcpStream,
    peer: SocketAddr,
    max_message_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(max_message_bytes);
    ws_config.max_frame_size = Some(max_message_bytes);
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .context("websocket handshake failed")?;
    info!("Client connected: {}", peer);

    let (mut sink, mut inbound) = ws.split();
    let (tx, mut rx) = mpsc::channel::<OutboundEvent>(64);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to encode outbound event: {}", e),
            }
        }
        let _ = sink.close().await;
    });

    let scope = ConnectionScope::default();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            msg = inbound.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    router.dispatch_chunk(&scope, &data, &tx).await;
                }
                Some(Ok(Message::Text(text))) => {
                    router.dispatch_text(&scope, &text, &tx).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by the protocol layer.
                Some(Ok(other)) => debug!("Ignoring frame from {}: {:?}", peer, other),
                Some(Err(e)) => {
                    warn!("Read error from {}: {}", peer, e);
                    break;
                }
            }
        }
    }

    router.close_connection(&scope);
    drop(tx);
    let _ = writer.await;
    info!("Client disconnected: {}", peer);
    Ok(())
}

/// Periodically expire idle upload sessions and evict idle jobs.
async fn sweep(
    uploads: Arc<UploadRegistry>,
    jobs: Arc<JobTracker>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let expired = uploads.evict_idle(config.session_idle, config.tombstone_grace);
                let evicted = jobs.evict_idle(config.session_idle);
                if expired > 0 || evicted > 0 {
                    info!(
                        "Sweep: {} upload sessions expired, {} jobs evicted",
                        expired, evicted
                    );
                }
            }
        }
    }
}
