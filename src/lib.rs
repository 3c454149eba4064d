pub mod batcher;
pub mod classifier;
pub mod compression;
pub mod engine;
pub mod event_id;
pub mod model;
pub mod roster;
pub mod sequencer;
pub mod settings;
pub mod spree;
pub mod store;
pub mod sync;
pub mod tailer;
pub mod timestamp;
pub mod transport;
pub mod validation;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use engine::Engine;
use settings::EngineSettings;
use store::{JsonFileStore, KeyValueStore};
use sync::SyncTransport;
use transport::{ClientMessage, Session};

/// Installs the global subscriber; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Runs the engine until Ctrl-C: restores state, follows the game log and,
/// when a server is configured, keeps the session and dispatchers running.
pub async fn run(settings: EngineSettings) -> Result<(), String> {
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(
        &settings.store_directory,
        &settings.store_id,
    )?);
    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<ClientMessage>();
    let engine = Engine::new(settings.clone(), store, outbound_sender);

    if let Err(error) = engine.restore().await {
        tracing::warn!(restore_error = %error, "Starting with an empty log set");
    }

    let log_watch = engine.start_log_watch().await;
    if log_watch.is_none() {
        tracing::warn!("No game log path configured, only peer events will be shown");
    }

    let mut views = engine.subscribe();
    let view_task = tokio::spawn(async move {
        while let Ok(view) = views.recv().await {
            tracing::debug!(events = view.len(), "Log view updated");
        }
    });

    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
    let connection = settings.transport_settings().map(Session::connect);
    let mut background = vec![view_task];

    let forwarder = match connection {
        Some((session, mut inbound)) => {
            let transport: Arc<dyn SyncTransport> = Arc::new(session.clone());
            let dispatch_engine = Arc::clone(&engine);
            background.push(tokio::spawn(async move {
                while let Some(message) = inbound.recv().await {
                    dispatch_engine
                        .handle_inbound(message, Arc::clone(&transport))
                        .await;
                }
            }));

            let mut status = session.subscribe_status();
            background.push(tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let current = *status.borrow_and_update();
                    tracing::info!(status = ?current, "Connection status changed");
                }
            }));

            tokio::spawn(forward_outbound(Some(session), outbound_receiver, shutdown_receiver))
        }
        None => {
            tracing::warn!("Server connection not configured, running offline");
            tokio::spawn(forward_outbound(None, outbound_receiver, shutdown_receiver))
        }
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| format!("Failed to listen for shutdown signal: {error}"))?;
    tracing::info!("Shutting down");

    engine.flush_outbound();
    if shutdown_sender.send(()).is_err() {
        tracing::debug!("Outbound forwarder already stopped");
    }
    if let Err(error) = forwarder.await {
        tracing::warn!(join_error = %error, "Outbound forwarder failed");
    }

    if let Some(log_watch) = log_watch {
        log_watch.abort();
    }
    for task in background {
        task.abort();
    }
    Ok(())
}

/// Pumps engine messages into the session. On shutdown drains what is left,
/// then closes the connection.
async fn forward_outbound(
    session: Option<Session>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => send_or_drop(session.as_ref(), &message).await,
                None => break,
            },
            _ = &mut shutdown => {
                while let Ok(message) = outbound.try_recv() {
                    send_or_drop(session.as_ref(), &message).await;
                }
                break;
            }
        }
    }

    if let Some(session) = session {
        session.close().await;
    }
}

async fn send_or_drop(session: Option<&Session>, message: &ClientMessage) {
    let Some(session) = session else {
        tracing::debug!(operation = message.label(), "Offline, dropping outbound message");
        return;
    };

    if let Err(error) = session.send(message).await {
        tracing::warn!(
            operation = message.label(),
            send_error = %error,
            retryable = error.is_retryable(),
            "Failed to send outbound message"
        );
    }
}
