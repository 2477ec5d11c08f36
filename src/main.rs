use std::sync::Arc;

use cuti_queue::accounts::AccountsStore;
use cuti_queue::config::Config;
use cuti_queue::executor::ExecutorAdapter;
use cuti_queue::processor::Processor;
use cuti_queue::server::broadcast::Broadcaster;
use cuti_queue::server::{build_router, AppState};
use cuti_queue::store::StateStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("cuti-queued starting");

    let config = Arc::new(Config::load()?);
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let store = Arc::new(StateStore::new(config.storage_dir.clone()));
    let accounts = Arc::new(AccountsStore::new(config.accounts_root()));

    let initial_state = store.load_queue_state().await;
    let state = Arc::new(Mutex::new(initial_state));

    let executor = ExecutorAdapter {
        executable: config.executor_command.clone(),
        extra_args: config.executor_args.clone(),
        timeout: config.execution_timeout,
        output_capture_bytes: config.output_capture_bytes,
        execution_log_lines: config.execution_log_lines,
        rate_limit_signals: config.rate_limit_signals.clone(),
        rate_limit_backoff_seconds: config.rate_limit_backoff_seconds,
        cancel_grace: config.cancel_grace,
        accounts: accounts.clone(),
    };

    let broadcaster = Broadcaster::new(config.broadcast_capacity);

    let processor = Processor::new(
        state.clone(),
        store.clone(),
        executor,
        broadcaster.clone(),
        config.tick_interval,
    );
    let cancel_handle = processor.cancel_handle();

    let shutdown_token = CancellationToken::new();
    let processor_shutdown = shutdown_token.clone();
    let processor_task = tokio::spawn(async move {
        if let Err(e) = processor.run(processor_shutdown).await {
            tracing::error!(error = %e, "processor exited with error");
        }
    });

    let app_state = AppState {
        state,
        store,
        accounts,
        broadcaster,
        cancel_handle,
        config: config.clone(),
    };
    let router = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "control plane listening");

    let serve_shutdown = shutdown_token.clone();
    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await;

    if let Err(e) = serve_result {
        tracing::error!(error = %e, "control plane server error");
    }

    shutdown_token.cancel();
    match tokio::time::timeout(config.shutdown_grace, processor_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "processor task panicked"),
        Err(_) => tracing::warn!("processor did not shut down within the grace window"),
    }

    tracing::info!("cuti-queued shutting down");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
