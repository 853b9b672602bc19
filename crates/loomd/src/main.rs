//! loomd — Loom training job daemon.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use loom_core::config::LoomConfig;
use loom_services::{
    Executor, FileRecordStore, JobControl, LocalQueue, ObservabilityBridge, OrchestratorSettings,
    ProcessLauncher, RecordStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = LoomConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = LoomConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LoomConfig::default()
    });
    tracing::info!(
        runtime = %config.runtime.program,
        work_dir = %config.runtime.work_dir.display(),
        port = config.api.port,
        "loomd starting"
    );

    std::fs::create_dir_all(&config.runtime.work_dir).with_context(|| {
        format!(
            "creating work dir {}",
            config.runtime.work_dir.display()
        )
    })?;

    // ── Job state ────────────────────────────────────────────────────────────

    let retain = config.jobs.retain_finished;
    let bridge = ObservabilityBridge::with_retention(retain);
    let store = Arc::new(FileRecordStore::new(config.jobs.records_dir.clone()));
    match store.list().await {
        Ok(records) => {
            // Oldest first; only the newest `retain` go back into memory.
            let skip = if retain == 0 {
                0
            } else {
                records.len().saturating_sub(retain)
            };
            let restored = records.len() - skip;
            for record in records.into_iter().skip(skip) {
                bridge.restore(record);
            }
            tracing::info!(restored, on_disk_only = skip, "finished jobs restored");
        }
        Err(e) => tracing::warn!(error = %e, "failed to read job records"),
    }

    let (queue, jobs_rx) = LocalQueue::new(config.jobs.queue_capacity);
    let control = JobControl::new(bridge.clone(), Arc::new(queue)).with_store(store.clone());
    let executor = Executor::new(
        bridge,
        Arc::new(ProcessLauncher),
        store,
        OrchestratorSettings::from_config(&config),
        config.jobs.max_concurrent_jobs,
    );
    let max_jobs = executor.max_jobs();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }
    {
        let shutdown = shutdown_tx.clone();
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;
        tokio::spawn(async move {
            term.recv().await;
            tracing::info!("SIGTERM received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let executor_stop = CancellationToken::new();
    let mut executor_task = tokio::spawn(executor.run(jobs_rx, executor_stop.clone()));

    let api_port = config.api.port;
    let api_task = {
        let state = loom_api::ApiState {
            control,
            started_at: Instant::now(),
            max_jobs,
            default_runtime: config.runtime.program.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = loom_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => tracing::error!("API task exited: {:?}", r),
        r = &mut executor_task => {
            tracing::error!("executor exited: {:?}", r);
            return Ok(());
        }
    }

    // Running and queued jobs are killed and their records persisted.
    executor_stop.cancel();
    executor_task.await.context("joining job executor")?;
    tracing::info!("loomd stopped");
    Ok(())
}
