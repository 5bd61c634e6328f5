//! Frame ingress workers.
//!
//! Every enabled pipeline gets `netio.workers` native OS threads. Each
//! worker owns a UDP socket bound to the pipeline port (shared through
//! SO_REUSEPORT), gathers received frames into a batch, runs the batch
//! through the shared connection table and reports the outcome as a
//! metrics event.
//!
//! ```text
//! loop {
//!     recv (blocking, poll timeout)   -> first frame
//!     recv (non-blocking) until full  -> rest of the batch
//!     table.execute(batch)
//!     echo verdicts (optional)
//! }
//! ```
//!
//! Workers share nothing but the table and a shutdown flag.

pub mod verdict;

use crate::config::PipelineConfig;
use crate::netio::{create_udp_socket, NetIoConfig};
use crate::telemetry::{record_metric, MetricsEvent};
use anyhow::{Context, Result};
use bytes::Bytes;
use fastct_core::{ConnTable, ExecuteOptions, L3Type, Packet};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Resolved, ready-to-run form of a [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: Arc<str>,
    pub port: u16,
    pub l3: L3Type,
    pub opts: ExecuteOptions,
    pub echo_verdicts: bool,
}

impl Pipeline {
    pub fn from_config(name: &str, config: &PipelineConfig) -> Result<Self> {
        let l3 = config
            .l3_type()
            .map_err(|e| anyhow::anyhow!("pipeline '{}': {}", name, e))?;
        let opts = config
            .execute_options()
            .map_err(|e| anyhow::anyhow!("pipeline '{}': {}", name, e))?;
        Ok(Self {
            name: Arc::from(name),
            port: config.port,
            l3,
            opts,
            echo_verdicts: config.echo_verdicts,
        })
    }
}

/// One ingress worker: a socket plus the pipeline it feeds.
struct IngressWorker {
    worker_id: usize,
    cpu: Option<usize>,
    pipeline: Pipeline,
    socket: UdpSocket,
    table: Arc<ConnTable>,
    config: NetIoConfig,
    shutdown: Arc<AtomicBool>,
}

impl IngressWorker {
    fn run(self) -> Result<()> {
        if let Some(cpu) = self.cpu {
            match core_affinity::get_core_ids().and_then(|ids| ids.get(cpu).copied()) {
                Some(core) if core_affinity::set_for_current(core) => {
                    debug!(worker_id = self.worker_id, cpu, "Pinned worker to CPU");
                }
                _ => warn!(worker_id = self.worker_id, cpu, "Failed to pin worker to CPU"),
            }
        }

        info!(
            worker_id = self.worker_id,
            pipeline = %self.pipeline.name,
            zone = self.pipeline.opts.zone,
            l3 = %self.pipeline.l3,
            "Ingress worker started"
        );
        record_metric(MetricsEvent::WorkerStarted);

        let mut buf = vec![0u8; self.config.max_frame_size];
        let mut batch = Vec::with_capacity(self.config.batch_size);
        let mut peers = Vec::with_capacity(self.config.batch_size);

        while !self.shutdown.load(Ordering::Relaxed) {
            let bytes = match self.receive_batch(&mut buf, &mut batch, &mut peers) {
                Ok(bytes) => bytes,
                Err(e) => {
                    record_metric(MetricsEvent::ReceiveError);
                    warn!(worker_id = self.worker_id, error = %e, "Frame receive failed");
                    batch.clear();
                    peers.clear();
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            let report = self
                .table
                .execute(&mut batch, self.pipeline.l3, &self.pipeline.opts);
            trace!(
                worker_id = self.worker_id,
                packets = report.packets,
                new = report.new,
                invalid = report.invalid,
                "Batch tracked"
            );
            record_metric(MetricsEvent::BatchProcessed {
                zone: self.pipeline.opts.zone,
                bytes,
                report,
            });

            if self.pipeline.echo_verdicts {
                self.echo_verdicts(&batch, &peers);
            }

            batch.clear();
            peers.clear();
        }

        record_metric(MetricsEvent::WorkerStopped);
        info!(worker_id = self.worker_id, pipeline = %self.pipeline.name, "Ingress worker stopped");
        Ok(())
    }

    /// Fill `batch` with up to `batch_size` frames. Blocks for the first
    /// one at most the poll timeout, then takes only what is already queued.
    ///
    /// Returns the number of bytes received.
    fn receive_batch(
        &self,
        buf: &mut [u8],
        batch: &mut Vec<Packet>,
        peers: &mut Vec<SocketAddr>,
    ) -> io::Result<usize> {
        let mut bytes = match self.socket.recv_from(buf) {
            Ok((n, peer)) => {
                self.push_frame(&buf[..n], peer, batch, peers);
                n
            }
            Err(e) if is_timeout(&e) => return Ok(0),
            Err(e) => return Err(e),
        };

        if batch.len() >= self.config.batch_size {
            return Ok(bytes);
        }

        self.socket.set_nonblocking(true)?;
        let drained = loop {
            if batch.len() >= self.config.batch_size {
                break Ok(());
            }
            match self.socket.recv_from(buf) {
                Ok((n, peer)) => {
                    self.push_frame(&buf[..n], peer, batch, peers);
                    bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.socket.set_nonblocking(false)?;
        drained.map(|()| bytes)
    }

    fn push_frame(
        &self,
        frame: &[u8],
        peer: SocketAddr,
        batch: &mut Vec<Packet>,
        peers: &mut Vec<SocketAddr>,
    ) {
        batch.push(Packet::from_ethernet(Bytes::copy_from_slice(frame)));
        peers.push(peer);
    }

    fn echo_verdicts(&self, batch: &[Packet], peers: &[SocketAddr]) {
        for (pkt, peer) in batch.iter().zip(peers) {
            if let Err(e) = self.socket.send_to(&verdict::encode(&pkt.md), peer) {
                debug!(worker_id = self.worker_id, peer = %peer, error = %e, "Verdict echo failed");
            }
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Handle for managing ingress worker threads.
///
/// Dropping this handle signals workers to shut down without waiting.
pub struct IngressHandle {
    workers: Vec<(Arc<str>, usize, JoinHandle<Result<()>>)>,
    shutdown: Arc<AtomicBool>,
    local_addrs: Vec<(Arc<str>, SocketAddr)>,
}

impl IngressHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Bound address of each pipeline, in startup order.
    pub fn local_addrs(&self) -> &[(Arc<str>, SocketAddr)] {
        &self.local_addrs
    }

    /// Bound address of the named pipeline.
    pub fn local_addr(&self, pipeline: &str) -> Option<SocketAddr> {
        self.local_addrs
            .iter()
            .find(|(name, _)| &**name == pipeline)
            .map(|(_, addr)| *addr)
    }

    /// Signal all workers to shut down and wait for them to complete
    pub fn shutdown(mut self) {
        info!("Shutting down ingress workers");
        self.shutdown.store(true, Ordering::Relaxed);

        for (pipeline, worker_id, worker) in self.workers.drain(..) {
            match worker.join() {
                Ok(Ok(())) => {
                    debug!(pipeline = %pipeline, worker_id, "Worker thread exited cleanly");
                }
                Ok(Err(e)) => {
                    error!(pipeline = %pipeline, worker_id, error = ?e, "Worker thread returned error");
                }
                Err(e) => {
                    error!(pipeline = %pipeline, worker_id, error = ?e, "Worker thread panicked");
                }
            }
        }

        info!("Ingress shutdown complete");
    }
}

impl Drop for IngressHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Spawn the ingress workers of every pipeline.
///
/// Pipelines bind `host:port`; a port of 0 picks a free port once and every
/// worker of that pipeline shares it.
pub fn spawn(
    host: IpAddr,
    pipelines: Vec<Pipeline>,
    config: NetIoConfig,
    table: Arc<ConnTable>,
) -> Result<IngressHandle> {
    if config.workers == 0 {
        anyhow::bail!("netio workers must be at least 1");
    }

    info!(
        pipelines = pipelines.len(),
        workers_per_pipeline = config.workers,
        host = %host,
        pin_to_cpu = config.pin_to_cpu,
        reuse_port = config.reuse_port,
        "Initializing frame ingress"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handle = IngressHandle {
        workers: Vec::with_capacity(pipelines.len() * config.workers),
        shutdown: Arc::clone(&shutdown),
        local_addrs: Vec::with_capacity(pipelines.len()),
    };
    let cores = if config.pin_to_cpu {
        core_affinity::get_core_ids().map_or(0, |ids| ids.len())
    } else {
        0
    };

    let mut next_worker = 0;
    for pipeline in pipelines {
        let mut bind_addr = SocketAddr::new(host, pipeline.port);

        for _ in 0..config.workers {
            let worker_id = next_worker;
            next_worker += 1;

            let socket = create_udp_socket(bind_addr, &config)
                .with_context(|| format!("pipeline '{}'", pipeline.name))?;
            if bind_addr.port() == 0 {
                bind_addr = socket.local_addr()?;
            }

            let worker = IngressWorker {
                worker_id,
                cpu: (cores > 0).then(|| worker_id % cores),
                pipeline: pipeline.clone(),
                socket,
                table: Arc::clone(&table),
                config: config.clone(),
                shutdown: Arc::clone(&shutdown),
            };

            let thread = thread::Builder::new()
                .name(format!("ingress-{}", worker_id))
                .spawn(move || worker.run())
                .context("spawning ingress worker")?;
            handle
                .workers
                .push((Arc::clone(&pipeline.name), worker_id, thread));
        }

        info!(pipeline = %pipeline.name, addr = %bind_addr, zone = pipeline.opts.zone, "Pipeline listening");
        handle.local_addrs.push((pipeline.name, bind_addr));
    }

    Ok(handle)
}

#[cfg(test)]
mod tests;
