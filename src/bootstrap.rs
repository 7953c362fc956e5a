// ABOUTME: Wires configuration into the transport, credential store, completion client, and supervisor
// ABOUTME: Runs supervision until a terminal condition or Ctrl-C and maps the result to an exit code

use crate::completion::ChatCompletionsClient;
use crate::relay::RelaySettings;
use crate::sidecar::SidecarTransport;
use crate::supervisor::{ConnectionSupervisor, RelayContext, SupervisorExit, SupervisorSettings};
use anyhow::Result;
use std::sync::Arc;
use warelay_core::config::Config;
use warelay_core::{FileCredentialStore, LoginMode, MessageStore, PairingError};

/// Printed when pairing cannot proceed
pub const USAGE: &str = "Usage: warelay [qr] [--number <phone number>]\n\
    \n\
    Without `qr`, a new session is linked with a pairing code and needs --number,\n\
    e.g. `warelay --number 081234567890` or `warelay --number 6281234567890`.";

/// Operator choices from the command line
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub login: LoginMode,
    pub phone_number: Option<String>,
}

/// Build the supervisor and everything it depends on
pub fn build(config: &Config, launch: LaunchOptions) -> Result<ConnectionSupervisor> {
    let message_store = Arc::new(MessageStore::new(config.transport.message_store_capacity));
    let transport = Arc::new(SidecarTransport::new(
        &config.transport,
        Arc::clone(&message_store),
    ));
    let credentials = Arc::new(FileCredentialStore::new(config.session.dir.clone()));
    let completion = Arc::new(ChatCompletionsClient::new(config.completion.clone())?);

    if config.completion.api_key.is_none() {
        tracing::warn!("No completion API key configured; the first relayed message will stop the process");
    }

    tracing::info!(
        session_dir = %config.session.dir,
        model = %config.completion.model,
        login = ?launch.login,
        direct_only = config.relay.direct_only,
        sidecar = %config.transport.command,
        "Relay configured"
    );

    let ctx = RelayContext {
        transport,
        credentials,
        completion,
        message_store,
    };
    let settings = SupervisorSettings::from_config(config, launch.login, launch.phone_number);
    Ok(ConnectionSupervisor::new(
        ctx,
        settings,
        RelaySettings::from_config(config),
    ))
}

/// Supervise until a terminal condition or Ctrl-C
pub async fn run(mut supervisor: ConnectionSupervisor) -> Result<SupervisorExit> {
    let result = tokio::select! {
        result = supervisor.supervise() => Some(result),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            None
        }
    };

    match result {
        Some(result) => result,
        None => {
            tracing::info!("Interrupted, shutting down");
            supervisor.shutdown().await;
            Ok(SupervisorExit::Shutdown)
        }
    }
}

/// Report how supervision ended and choose the process exit status
pub fn exit_code(result: &Result<SupervisorExit>) -> i32 {
    match result {
        Ok(exit) => {
            match exit {
                SupervisorExit::Shutdown => tracing::info!("Stopped"),
                SupervisorExit::Halted(_) => {
                    tracing::error!(%exit, "Stopped without reconnecting");
                }
                _ => tracing::error!(%exit, "Stopped"),
            }
            exit.exit_code()
        }
        Err(e) => {
            if let Some(pairing) = e.downcast_ref::<PairingError>() {
                tracing::error!(error = %pairing, "Cannot pair");
                eprintln!("{}\n\n{}", pairing, USAGE);
            } else {
                tracing::error!(error = %format!("{:#}", e), "Relay failed");
            }
            1
        }
    }
}
