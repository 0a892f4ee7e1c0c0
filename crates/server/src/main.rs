mod config;

use anyhow::Result;
use cadence_admin::SharedStateType;
use cadence_ledger::Ledger;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .init();

    // Parse command-line args for config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/cadence.yaml".to_string());

    info!(config_path = %config_path, "starting cadence");

    let server_config = ServerConfig::load(&config_path)?;
    let ledger = Ledger::new(&server_config.config.ledger)?;
    ledger.start_eviction();

    let state = cadence_admin::new_shared_state(ledger.clone());
    let admin_listen = server_config.config.admin.listen.clone();

    let (stop_tx, stop_rx) = watch::channel(false);

    let reload_task = tokio::spawn(reload_on_hangup(
        server_config,
        state.clone(),
        stop_rx.clone(),
    ));

    let mut admin_task = tokio::spawn(async move {
        cadence_admin::run_admin_server(state, &admin_listen, stopped(stop_rx)).await
    });

    info!("cadence started");

    let admin_result = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            None
        }
        joined = &mut admin_task => {
            warn!("admin API stopped, shutting down");
            Some(joined)
        }
    };

    stop_tx.send_replace(true);
    ledger.shutdown().await;
    let admin_result = match admin_result {
        Some(joined) => joined,
        None => admin_task.await,
    };
    if let Err(e) = reload_task.await {
        error!(error = %e, "reload task failed");
    }

    admin_exit(admin_result)
}

/// Turn the admin task's outcome into the process result, so a server that
/// failed to bind or crashed exits non-zero.
fn admin_exit(joined: Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => {
            info!("cadence stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "admin API server error");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "admin API task failed");
            Err(e.into())
        }
    }
}

/// Resolves once `stop` turns `true` or its sender is dropped.
async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Re-read the configuration file on every SIGHUP and push the ledger section
/// to the running buckets. Failed reloads are logged and ignored.
#[cfg(unix)]
async fn reload_on_hangup(
    mut server_config: ServerConfig,
    state: SharedStateType,
    stop: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler; reloads disabled");
            return;
        }
    };

    let stop = stopped(stop);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                match server_config.reload() {
                    Ok(config) => match state.reload(&config.ledger) {
                        Ok(()) => {
                            server_config.commit(config);
                            info!("configuration reloaded");
                        }
                        Err(e) => warn!(error = %e, "reloaded configuration rejected by ledger"),
                    },
                    Err(e) => warn!(error = %e, "failed to reload configuration"),
                }
            }
            _ = &mut stop => break,
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _server_config: ServerConfig,
    _state: SharedStateType,
    stop: watch::Receiver<bool>,
) {
    stopped(stop).await;
}
