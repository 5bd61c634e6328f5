use anyhow::Context;
use fastct::config::{self, validation::validate_resource_limits};
use fastct::worker::{self, Pipeline};
use fastct::{control, runtime, telemetry};
use fastct_core::{Conntrack, CtDpif};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    telemetry::init_logging(&config.global.logging, &config.global.telemetry.service_name)
        .with_context(|| "failed to initialize logging")?;

    let host: IpAddr = config
        .global
        .network
        .host
        .parse()
        .with_context(|| "invalid bind address")?;
    let pipelines = config
        .enabled_pipelines()
        .map(|(name, p)| Pipeline::from_config(name, p))
        .collect::<anyhow::Result<Vec<_>>>()?;

    // Runtime for the control server and telemetry; ingress runs on native threads
    let tokio_runtime = runtime::create_runtime(&config.global.runtime)
        .with_context(|| "failed to create tokio runtime")?;
    let runtime_handle = tokio_runtime.handle().clone();

    let conntrack = Conntrack::new(&config.conntrack)
        .with_context(|| "failed to initialize connection tracker")?;
    let table = Arc::clone(conntrack.table());

    let metrics_handle = tokio_runtime.block_on(async {
        telemetry::init_telemetry(&config.global, &runtime_handle, Arc::clone(&table))
            .await
            .with_context(|| "failed to initialize telemetry")
    })?;

    validate_resource_limits(&config);

    let control_handle = if config.global.control.enabled {
        let dpif: Arc<dyn CtDpif> = Arc::clone(&table) as Arc<dyn CtDpif>;
        Some(tokio_runtime.block_on(async {
            control::start(&config.global.control, dpif)
                .await
                .with_context(|| "failed to start control server")
        })?)
    } else {
        info!("Control server disabled");
        None
    };

    let ingress_handle = worker::spawn(
        host,
        pipelines,
        config.global.netio.clone(),
        Arc::clone(&table),
    )
    .with_context(|| "failed to spawn ingress workers")?;

    info!(
        workers = ingress_handle.worker_count(),
        pipelines = ingress_handle.local_addrs().len(),
        "Frame ingress started"
    );

    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_clone = Arc::clone(&shutdown_notify);

    tokio_runtime.spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        shutdown_notify_clone.notify_one();
    });

    tokio_runtime.block_on(async {
        shutdown_notify.notified().await;
    });

    info!("Initiating graceful shutdown");

    // Stop producers before the table goes away
    ingress_handle.shutdown();

    tokio_runtime.block_on(async {
        if let Some(handle) = control_handle {
            handle.shutdown().await;
        }
        metrics_handle.shutdown().await;
    });

    drop(table);
    conntrack.shutdown();

    info!("Shutting down tokio runtime");
    tokio_runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
    }
}
