use std::backtrace::Backtrace;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::context::RequestContext;
use crate::logging::{get_logger, LogValue};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl ShutdownSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminated",
        }
    }
}

/// Setup signal handlers for the server
///
/// Returns a broadcast sender for shutdown signals and a join handle for the signal task.
///
/// Handles:
/// - SIGTERM/SIGINT: graceful shutdown
/// - SIGUSR2: log a runtime diagnostics dump and keep running
pub fn setup_signal_handlers() -> (
    broadcast::Sender<ShutdownSignal>,
    tokio::task::JoinHandle<()>,
) {
    let (shutdown_tx, _) = broadcast::channel(16);
    let tx_clone = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                info!(signal = signal.name(), "Shutdown signal received");
                let _ = tx_clone.send(signal);
            }
            Err(e) => {
                error!("Failed to listen for shutdown signals: {}", e);
            }
        }
    });

    (shutdown_tx, handle)
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => return Ok(ShutdownSignal::Terminate),
            _ = sigint.recv() => return Ok(ShutdownSignal::Interrupt),
            _ = sigusr2.recv() => log_diagnostics(),
        }
    }
}

/// On Windows, only Ctrl+C is supported
#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

/// Runtime statistics and a backtrace of the calling task.
pub fn diagnostics() -> Vec<(&'static str, LogValue)> {
    let mut fields = Vec::new();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let metrics = handle.metrics();
        fields.push(("workers", LogValue::from(metrics.num_workers())));
        fields.push(("aliveTasks", LogValue::from(metrics.num_alive_tasks())));
    }
    fields.push(("dump", LogValue::from(Backtrace::force_capture().to_string())));
    fields
}

fn log_diagnostics() {
    let ctx = RequestContext::with_stan(crate::server::MAIN_STAN);
    get_logger("lake-gateway").infow(&ctx, "stack trace", &diagnostics());
}
