use anyhow::Result;
use tokio::signal;

/// Waits for Ctrl+C or SIGTERM.
///
/// # Errors
/// Returns an error if a signal handler cannot be installed.
pub async fn wait_for_shutdown() -> Result<()> {
    let name = tokio::select! {
        result = wait_ctrl_c() => result?,
        result = wait_sigterm() => result?,
    };
    tracing::info!(signal = name, "shutdown signal received, stopping deployed modules");
    Ok(())
}

async fn wait_ctrl_c() -> Result<&'static str> {
    signal::ctrl_c().await.inspect_err(|e| {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    })?;
    Ok("SIGINT")
}

#[cfg(unix)]
async fn wait_sigterm() -> Result<&'static str> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .inspect_err(|e| tracing::error!(error = %e, "failed to install SIGTERM handler"))?;
    terminate.recv().await;
    Ok("SIGTERM")
}

#[cfg(not(unix))]
async fn wait_sigterm() -> Result<&'static str> {
    std::future::pending::<Result<&'static str>>().await
}
