//! `serve`: disk sync loop plus a TCP listener for remote peers.

use modelyard_core::api::{AppConfig, CliError, LineTransport, RemoteHub, SyncStatus};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

use crate::commands::cli::ServeArgs;
use crate::commands::project::Project;

/// Handle `serve`
pub async fn handle_serve(args: ServeArgs, cfg: AppConfig) -> Result<(), CliError> {
    let listener = TcpListener::bind(&args.listen).await?;
    println!(
        "Serving {} on {} (Ctrl-C to stop)",
        args.project.display(),
        listener.local_addr()?
    );
    let status = serve_until(&args, cfg, listener, shutdown_signal()).await?;
    println!(
        "Stopped after {} ticks, {} conflicts resolved",
        status.ticks, status.conflicts
    );
    Ok(())
}

/// Run the sync loop and accept peers on `listener` until `shutdown`
/// resolves. State is flushed before returning.
pub async fn serve_until<F>(
    args: &ServeArgs,
    cfg: AppConfig,
    listener: TcpListener,
    shutdown: F,
) -> Result<SyncStatus, CliError>
where
    F: Future<Output = ()>,
{
    let project = Project::open(&args.project, cfg, None).await?;
    let (ctx, mut sync) = project.into_parts();

    let accept = tokio::spawn(accept_loop(listener, sync.hub().clone()));
    let status = sync.run(shutdown).await;
    accept.abort();

    ctx.shutdown().await;
    if let Some(error) = &status.last_io_error {
        tracing::error!(error = %error, "sync stopped with a persistent io error");
    }
    Ok(status)
}

async fn accept_loop(listener: TcpListener, hub: RemoteHub) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let peer = hub.attach(Box::new(LineTransport::tcp(stream)));
                tracing::info!(peer = %peer, addr = %addr, links = hub.len(), "peer connected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => tracing::info!("received Ctrl+C"),
        _ = wait_for_sigterm() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
