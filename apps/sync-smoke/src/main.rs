mod config;
mod logging;

use std::{future, process::ExitCode};

use sync_core::{NotificationPermission, SyncError};
use sync_platform::{KeyringTokenStore, TracingSurface};
use sync_transport::{
    DashboardSnapshot, DashboardSync, HttpSupportApi, TranscriptConfig, TranscriptSnapshot,
    TranscriptSync, TransportClient, TransportConfig, WsConnector,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    info!(?config, "starting sync smoke run");

    if config.token.is_none() && config.token_account.is_none() {
        warn!("no token configured; channels stay idle and HTTP calls fail with auth errors");
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, category = ?err.category, code = %err.code, "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SmokeConfig) -> Result<(), SyncError> {
    let credentials = config.credentials(KeyringTokenStore::default())?;
    let api = HttpSupportApi::new(config.api_base.clone(), credentials.clone())?;

    let dashboard_transport = TransportClient::new(
        WsConnector,
        TransportConfig::dashboard(&config.ws_base)?.with_reconnect(config.reconnect),
        credentials.clone(),
    );
    let mut dashboard = DashboardSync::spawn(
        dashboard_transport,
        api.clone(),
        TracingSurface::new(NotificationPermission::Default, NotificationPermission::Granted),
        config.dashboard_config(),
    );

    let mut transcript = match &config.conversation_id {
        Some(conversation_id) => {
            let transport = TransportClient::new(
                WsConnector,
                TransportConfig::chat(&config.ws_base, conversation_id)?
                    .with_reconnect(config.reconnect),
                credentials.clone(),
            );
            Some(TranscriptSync::spawn(
                conversation_id.clone(),
                transport,
                api,
                TranscriptConfig::default(),
            ))
        }
        None => None,
    };

    if let (Some(transcript), Some(text)) = (&transcript, &config.send_text) {
        match transcript.send(text.clone()).await {
            Ok(entry) => info!(id = %entry.id, "smoke message queued"),
            Err(err) => warn!(error = %err, "smoke message rejected"),
        }
    }

    let mut dashboard_rx = dashboard.subscribe();
    let mut transcript_rx = transcript.as_ref().map(TranscriptSync::subscribe);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            changed = dashboard_rx.changed() => {
                if changed.is_err() {
                    warn!("dashboard synchronizer stopped");
                    break;
                }
                log_dashboard(&dashboard_rx.borrow_and_update());
            }
            changed = transcript_changed(transcript_rx.as_mut()) => {
                if changed.is_err() {
                    warn!("transcript synchronizer stopped");
                    transcript_rx = None;
                    continue;
                }
                if let Some(rx) = transcript_rx.as_mut() {
                    log_transcript(&rx.borrow_and_update());
                }
            }
        }
    }

    dashboard.close();
    if let Some(transcript) = transcript.as_mut() {
        transcript.close();
    }
    Ok(())
}

async fn transcript_changed(
    rx: Option<&mut watch::Receiver<TranscriptSnapshot>>,
) -> Result<(), watch::error::RecvError> {
    match rx {
        Some(rx) => rx.changed().await,
        None => future::pending().await,
    }
}

fn log_dashboard(snapshot: &DashboardSnapshot) {
    info!(
        conversations = snapshot.conversations.len(),
        needs_attention = snapshot.needs_attention,
        connected = snapshot.connected,
        polling = snapshot.polling,
        "dashboard updated"
    );
    if let Some(err) = &snapshot.last_error {
        warn!(error = %err, recoverable = err.is_recoverable(), "dashboard error");
    }
}

fn log_transcript(snapshot: &TranscriptSnapshot) {
    let pending = snapshot
        .messages
        .iter()
        .filter(|message| !message.confirmed)
        .count();
    info!(
        conversation = %snapshot.conversation_id,
        messages = snapshot.messages.len(),
        pending,
        typing = snapshot.typing,
        connected = snapshot.connected,
        can_send = snapshot.can_send,
        banner = snapshot.banner.as_deref().unwrap_or(""),
        "transcript updated"
    );
    if let Some(err) = &snapshot.last_error {
        warn!(error = %err, "transcript error");
    }
}
