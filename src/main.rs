use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use quizgen_worker::admin::admin_routes;
use quizgen_worker::ai::HttpGenerator;
use quizgen_worker::config::{AcquireMode, WorkerConfig};
use quizgen_worker::store::{Database, LibSqlBackend};
use quizgen_worker::worker::WorkerCoordinator;

/// Console logging, plus a daily-rolling file when `QUIZGEN_LOG_DIR` is set.
/// The returned guard flushes the file writer and must outlive `main`'s work.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("QUIZGEN_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "quizgen-worker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    eprintln!("📝 Quizgen worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Instance: {}", config.instance);
    eprintln!("   Cycle: every {}s", config.cycle_interval.as_secs());
    eprintln!(
        "   Concurrency: {} total ({})",
        config.limiter.max_total,
        match config.limiter.mode {
            AcquireMode::FailFast => "fail-fast".to_string(),
            AcquireMode::Blocking { wait } => format!("wait up to {}ms", wait.as_millis()),
        }
    );
    if config.start_paused {
        eprintln!("   Starting paused");
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path))?,
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Coordinator ──────────────────────────────────────────────────────
    let generator = Arc::new(
        HttpGenerator::new(config.call_timeout).context("failed to build HTTP client")?,
    );
    let admin_port = config.admin_port;
    let coordinator = WorkerCoordinator::new(config, Arc::clone(&db), generator).await?;
    let handle = coordinator.handle();

    // ── Admin API ────────────────────────────────────────────────────────
    if let Some(port) = admin_port {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
            .await
            .with_context(|| format!("failed to bind admin port {port}"))?;
        eprintln!("   Admin API: http://0.0.0.0:{}/api/worker/status", port);
        let app = admin_routes(handle.clone());
        tokio::spawn(async move {
            tracing::info!(port, "Admin API server started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Admin API server exited");
            }
        });
    } else {
        eprintln!("   Admin API: disabled");
    }
    eprintln!();

    let shutdown = CancellationToken::new();
    let mut worker = tokio::spawn(coordinator.run(shutdown.clone()));

    tokio::select! {
        finished = &mut worker => {
            finished.context("coordinator task panicked")??;
            tracing::warn!(instance = %handle.instance(), "Coordinator exited without a shutdown request");
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
        }
    }
    tracing::info!(instance = %handle.instance(), "Shutdown requested, finishing in-flight work");
    shutdown.cancel();

    worker.await.context("coordinator task panicked")??;
    eprintln!("   Worker stopped");
    Ok(())
}
