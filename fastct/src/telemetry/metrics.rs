//! Event-driven metrics collection.
//!
//! Ingress workers and the control server record fire-and-forget events over
//! an unbounded channel. A dedicated tokio task aggregates them into
//! OpenTelemetry instruments exported over OTLP. Table-wide figures (live
//! connections, limit, expirations) are read from the table by observable
//! instruments at export time.

use anyhow::Result;
use crossbeam_channel::{self, Receiver, Sender};
use fastct_core::{BatchReport, ConnTable, Zone};
use once_cell::sync::OnceCell;
use opentelemetry::{
    metrics::{Counter, Meter, MeterProvider, ObservableCounter, ObservableGauge},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    runtime, Resource,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::config::TelemetryConfig;

/// Global metrics event sender
static METRICS_SENDER: OnceCell<Sender<MetricsEvent>> = OnceCell::new();

/// Metrics events for fire-and-forget recording.
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    /// One batch went through the tracker
    BatchProcessed {
        zone: Zone,
        bytes: usize,
        report: BatchReport,
    },

    /// Frame receive failed on an ingress socket
    ReceiveError,

    /// Ingress worker thread started
    WorkerStarted,

    /// Ingress worker thread stopped
    WorkerStopped,

    /// Control command served
    ControlRequest { command: &'static str, ok: bool },
}

/// Handle to the metrics task for graceful shutdown
pub struct MetricsHandle {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsHandle {
    /// Create a disabled handle (when metrics are disabled)
    pub fn disabled() -> Self {
        Self {
            task_handle: None,
            shutdown_tx: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.task_handle.is_some()
    }

    /// Shutdown the metrics task gracefully with timeout
    pub async fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(result) => {
                    if let Err(e) = result {
                        tracing::error!(error = ?e, "Metrics task panicked during shutdown");
                    }
                }
                Err(_) => {
                    tracing::error!("Metrics task shutdown timed out after 5 seconds");
                }
            }
        }
    }
}

/// Aggregates events into OpenTelemetry instruments
struct MetricsCollector {
    packets: Counter<u64>,
    bytes: Counter<u64>,
    verdicts: Counter<u64>,
    limit_refused: Counter<u64>,
    helper_unsupported: Counter<u64>,
    receive_errors: Counter<u64>,
    control_requests: Counter<u64>,

    active_workers: Arc<AtomicU64>,
    _active_workers_gauge: ObservableGauge<u64>,

    _connections_gauge: ObservableGauge<u64>,
    _limit_gauge: ObservableGauge<u64>,
    _expired_counter: ObservableCounter<u64>,
}

impl MetricsCollector {
    fn new(meter: &Meter, table: Arc<ConnTable>) -> Result<Self> {
        let packets = meter
            .u64_counter("conntrack.packets")
            .with_description("Packets run through the tracker")
            .build();

        let bytes = meter
            .u64_counter("conntrack.bytes")
            .with_description("Bytes run through the tracker")
            .build();

        let verdicts = meter
            .u64_counter("conntrack.verdicts")
            .with_description("Tracked packets by resulting connection state")
            .build();

        let limit_refused = meter
            .u64_counter("conntrack.limit_refused")
            .with_description("New connections refused by the connection limit")
            .build();

        let helper_unsupported = meter
            .u64_counter("conntrack.helper_unsupported")
            .with_description("Batches that requested an unsupported helper")
            .build();

        let receive_errors = meter
            .u64_counter("ingress.receive_errors")
            .with_description("Failed frame receives")
            .build();

        let control_requests = meter
            .u64_counter("control.requests")
            .with_description("Control commands served")
            .build();

        let active_workers = Arc::new(AtomicU64::new(0));
        let workers_clone = Arc::clone(&active_workers);
        let _active_workers_gauge = meter
            .u64_observable_gauge("ingress.workers.active")
            .with_description("Number of running ingress workers")
            .with_callback(move |observer| {
                observer.observe(workers_clone.load(Ordering::Relaxed), &[]);
            })
            .build();

        let conn_table = Arc::clone(&table);
        let _connections_gauge = meter
            .u64_observable_gauge("conntrack.connections")
            .with_description("Live tracked connections")
            .with_callback(move |observer| {
                observer.observe(u64::from(conn_table.n_conns()), &[]);
            })
            .build();

        let limit_table = Arc::clone(&table);
        let _limit_gauge = meter
            .u64_observable_gauge("conntrack.limit")
            .with_description("Connection admission limit")
            .with_callback(move |observer| {
                observer.observe(u64::from(limit_table.limit()), &[]);
            })
            .build();

        let _expired_counter = meter
            .u64_observable_counter("conntrack.expired")
            .with_description("Connections removed by expiration")
            .with_callback(move |observer| {
                observer.observe(table.stats().expired, &[]);
            })
            .build();

        Ok(Self {
            packets,
            bytes,
            verdicts,
            limit_refused,
            helper_unsupported,
            receive_errors,
            control_requests,
            active_workers,
            _active_workers_gauge,
            _connections_gauge,
            _limit_gauge,
            _expired_counter,
        })
    }

    fn process_event(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::BatchProcessed {
                zone,
                bytes,
                report,
            } => {
                let zone = KeyValue::new("zone", i64::from(zone));
                self.packets.add(report.packets as u64, &[zone.clone()]);
                self.bytes.add(bytes as u64, &[zone.clone()]);

                for (state, count) in [
                    ("new", report.new),
                    ("established", report.established),
                    ("related", report.related),
                    ("invalid", report.invalid),
                    ("untrackable", report.untrackable),
                ] {
                    if count > 0 {
                        self.verdicts.add(
                            count as u64,
                            &[zone.clone(), KeyValue::new("state", state)],
                        );
                    }
                }

                if report.limit_refused > 0 {
                    self.limit_refused
                        .add(report.limit_refused as u64, &[zone.clone()]);
                }
                if report.helper_unsupported {
                    self.helper_unsupported.add(1, &[zone]);
                }
            }
            MetricsEvent::ReceiveError => {
                self.receive_errors.add(1, &[]);
            }
            MetricsEvent::WorkerStarted => {
                self.active_workers.fetch_add(1, Ordering::Relaxed);
            }
            MetricsEvent::WorkerStopped => {
                self.active_workers.fetch_sub(1, Ordering::Relaxed);
            }
            MetricsEvent::ControlRequest { command, ok } => {
                self.control_requests.add(
                    1,
                    &[
                        KeyValue::new("command", command),
                        KeyValue::new("ok", ok),
                    ],
                );
            }
        }
    }
}

/// Record a metrics event (fire-and-forget).
///
/// A no-op until the metrics task is started. Never blocks.
#[inline]
pub fn record_metric(event: MetricsEvent) {
    if let Some(sender) = METRICS_SENDER.get() {
        let _ = sender.send(event);
    }
}

/// Start the metrics collection task.
///
/// The task drains the event channel into OpenTelemetry instruments; the
/// periodic reader exports them to the configured OTLP endpoint.
pub async fn start_metrics_task(
    config: &TelemetryConfig,
    runtime_handle: &tokio::runtime::Handle,
    table: Arc<ConnTable>,
) -> Result<MetricsHandle> {
    // crossbeam for a Sync receiver and a sender that never blocks
    let (tx, rx) = crossbeam_channel::unbounded::<MetricsEvent>();

    METRICS_SENDER
        .set(tx)
        .map_err(|_| anyhow::anyhow!("Metrics sender already initialized"))?;

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(Duration::from_secs(config.export_interval_secs))
        .with_timeout(Duration::from_secs(5))
        .build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]))
        .build();

    let meter = provider.meter("fastct");
    let collector = MetricsCollector::new(&meter, table)?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

    let task_handle = runtime_handle.spawn(async move {
        tracing::info!("Metrics collection task started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Metrics task shutting down");
                    break;
                }

                _ = async {
                    let processed = drain(&rx, &collector, 1000);
                    if processed == 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                } => {}
            }
        }

        drain(&rx, &collector, usize::MAX);

        if let Err(e) = provider.shutdown() {
            tracing::error!(error = ?e, "Failed to shutdown metrics provider");
        }

        tracing::info!("Metrics task stopped");
    });

    Ok(MetricsHandle {
        task_handle: Some(task_handle),
        shutdown_tx: Some(shutdown_tx),
    })
}

/// Feed up to `limit` queued events to the collector.
fn drain(rx: &Receiver<MetricsEvent>, collector: &MetricsCollector, limit: usize) -> usize {
    let mut processed = 0;
    while processed < limit {
        match rx.try_recv() {
            Ok(event) => {
                collector.process_event(event);
                processed += 1;
            }
            Err(_) => break,
        }
    }
    processed
}
