//! Server side of a connection: one DataStore session per stream.

use crate::config::Config;
use crate::context::DStoreContext;
use crate::dispatcher::scheduler::Scheduler;
use crate::dispatcher::CommandDispatcher;
use crate::error::{DStoreError, Result};
use crate::miners;
use crate::protocol::mux::DATASTORE_CHANNEL;
use crate::protocol::{serve_exec_requests, Envelope, Multiplexer, DATASTORE_VERSION};
use crate::store::{delta_channel, DataStore, ElementRemover};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Variables every proxied process starts from, before the client's own.
fn exec_base_env() -> BTreeMap<String, String> {
    ["PATH", "HOME", "LANG", "USER"]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

/// Accepts connections until `shutdown` fires. Every connection gets its
/// own store, miners and scheduler.
pub async fn serve(listener: TcpListener, config: Arc<Config>, shutdown: CancellationToken) -> Result<()> {
    let local = listener.local_addr().map_err(DStoreError::transport)?;
    info!(address = %local, "DataStore server listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Could not disable Nagle");
                }
                info!(peer = %peer, "Client connected");
                let config = config.clone();
                tokio::spawn(async move {
                    match serve_connection(stream, config).await {
                        Ok(()) => info!(peer = %peer, "Client disconnected"),
                        Err(e) => error!(peer = %peer, error = %e, "Connection ended with error"),
                    }
                });
            }
        }
    }
}

/// Runs one session over `stream`: handshake, initial sync, then command
/// traffic until the client exits or the stream drops.
#[instrument(skip_all)]
pub async fn serve_connection<S>(stream: S, config: Arc<Config>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let ctx = DStoreContext::new(config.clone());
    let store = DataStore::new(ctx.clone(), format!("srv-{}", ctx.connection_id()));
    let dispatcher = CommandDispatcher::new(store.clone());
    let tracker = miners::register_defaults(&dispatcher, &config)?;

    let remover = Arc::new(ElementRemover::new(store.clone()));
    dispatcher.retire_into(remover.clone());
    let mut scheduler = Scheduler::new(ctx.shutdown_token());
    dispatcher.attach(&mut scheduler);
    scheduler.register(remover);
    scheduler.register(Arc::new(tracker.clone()));

    let mux = Multiplexer::new(stream);
    let mut channel = mux.open(DATASTORE_CHANNEL)?;
    let hello = Envelope::Handshake {
        version: DATASTORE_VERSION.to_string(),
    };
    mux.send_to(DATASTORE_CHANNEL, &hello.to_bytes()?).await?;

    // Snapshot and mirror are taken before anything else can touch the store.
    let initial = store.snapshot_deltas(store.miner_root());
    let (mirror_tx, mut mirror_rx) = delta_channel();
    store.set_mirror(mirror_tx);
    debug!(elements = initial.len(), "Initial sync prepared");

    let writer = {
        let mux = mux.clone();
        tokio::spawn(async move {
            for delta in initial {
                if send_envelope(&mux, &Envelope::Delta(delta)).await.is_err() {
                    return;
                }
            }
            while let Some(delta) = mirror_rx.recv().await {
                if let Err(e) = send_envelope(&mux, &Envelope::Delta(delta)).await {
                    debug!(error = %e, "Delta writer stopped");
                    return;
                }
            }
        })
    };
    let exec = tokio::spawn(serve_exec_requests(mux.clone(), exec_base_env()));
    let scheduler = scheduler.spawn();

    let shutdown = ctx.shutdown_token();
    let outcome = loop {
        let raw = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            raw = channel.recv() => raw,
        };
        let Some(raw) = raw else {
            debug!("DataStore channel closed by peer");
            break Ok(());
        };
        match Envelope::from_bytes(&raw) {
            Ok(Envelope::Command(request)) => {
                if let Err(e) = dispatcher.submit(request) {
                    warn!(error = %e, "Could not accept command");
                }
            }
            Ok(Envelope::ActivateMiner { miner, status }) => {
                if let Err(e) = dispatcher.activate_remote(&miner, &status) {
                    warn!(miner = %miner, error = %e, "Could not accept miner activation");
                }
            }
            Ok(Envelope::Exit) => {
                info!("Client requested exit");
                break Ok(());
            }
            Ok(Envelope::Handshake { .. } | Envelope::Delta(_)) => {
                debug!("Ignoring client-originated store traffic");
            }
            Err(e) => {
                warn!(error = %e, "Malformed envelope, closing session");
                break Err(e);
            }
        }
    };

    ctx.teardown();
    tracker.shutdown().await;
    store.clear_mirror();
    store.set_connected(false);
    exec.abort();
    let _ = scheduler.await;
    // Deltas already queued still go out so the client sees final states.
    let _ = writer.await;
    info!(counters = ?ctx.counters().snapshot(), "Session closed");
    outcome
}

async fn send_envelope(mux: &Multiplexer, envelope: &Envelope) -> Result<()> {
    mux.send_to(DATASTORE_CHANNEL, &envelope.to_bytes()?).await
}
