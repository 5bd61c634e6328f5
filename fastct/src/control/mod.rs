//! Control socket server.
//!
//! Serves the [`protocol`] over a Unix domain socket so management tools
//! can dump, flush and size the connection table while the daemon runs.
//! Commands run on the blocking pool since a dump walks the whole table.

pub mod protocol;

use crate::config::ControlConfig;
use crate::telemetry::{record_metric, MetricsEvent};
use anyhow::{Context, Result};
use fastct_core::CtDpif;
use protocol::{render_reply, Command, MAX_LINE_LEN};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to the running control server.
pub struct ControlHandle {
    path: PathBuf,
    task_handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

impl ControlHandle {
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting clients and remove the socket file.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task_handle.await {
            error!(error = ?e, "Control server task panicked");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Control socket already gone");
        }
        info!("Control server stopped");
    }
}

/// Bind the control socket and start serving on the current runtime.
///
/// A stale socket file at the configured path is replaced.
pub async fn start(config: &ControlConfig, dpif: Arc<dyn CtDpif>) -> Result<ControlHandle> {
    let path = config.socket_path.clone();
    if path.exists() {
        warn!(path = %path.display(), "Removing stale control socket");
        std::fs::remove_file(&path)
            .with_context(|| format!("removing stale control socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(&path)
        .with_context(|| format!("binding control socket {}", path.display()))?;
    info!(path = %path.display(), datapath = dpif.name(), "Control server listening");

    let clients = Arc::new(Semaphore::new(config.max_clients));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task_handle = tokio::spawn(accept_loop(listener, dpif, clients, shutdown_rx));

    Ok(ControlHandle {
        path,
        task_handle,
        shutdown_tx,
    })
}

async fn accept_loop(
    listener: UnixListener,
    dpif: Arc<dyn CtDpif>,
    clients: Arc<Semaphore>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,

            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Control accept failed");
                        continue;
                    }
                };

                let permit = match Arc::clone(&clients).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Too many control clients, rejecting");
                        reject(stream).await;
                        continue;
                    }
                };

                let dpif = Arc::clone(&dpif);
                tokio::spawn(async move {
                    if let Err(e) = serve_client(stream, dpif).await {
                        debug!(error = %e, "Control client ended with error");
                    }
                    drop(permit);
                });
            }
        }
    }
}

async fn reject(mut stream: UnixStream) {
    let reply = render_reply(&Err("too many clients".to_string()));
    let _ = stream.write_all(reply.as_bytes()).await;
}

/// Serve commands from one client until it disconnects.
pub async fn serve_client(stream: UnixStream, dpif: Arc<dyn CtDpif>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(MAX_LINE_LEN + 1);

    while let Some(request) = next_request(&mut reader, &mut buf).await? {
        let (name, result) = match request {
            Request::TooLong => ("invalid", Err("command line too long".to_string())),
            Request::Line(line) if line.trim().is_empty() => continue,
            Request::Line(line) => match line.parse::<Command>() {
                Ok(cmd) => (cmd.name(), run_command(cmd, Arc::clone(&dpif)).await),
                Err(e) => ("invalid", Err(e.to_string())),
            },
        };

        record_metric(MetricsEvent::ControlRequest {
            command: name,
            ok: result.is_ok(),
        });
        write_half
            .write_all(render_reply(&result).as_bytes())
            .await?;
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
enum Request {
    Line(String),
    TooLong,
}

/// Read one command line, buffering at most `MAX_LINE_LEN + 1` bytes.
///
/// The rest of an over-long line is discarded up to its newline.
async fn next_request<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_LEN {
        skip_line(reader).await?;
        return Ok(Some(Request::TooLong));
    }

    Ok(Some(Request::Line(String::from_utf8_lossy(buf).into_owned())))
}

async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

async fn run_command(cmd: Command, dpif: Arc<dyn CtDpif>) -> Result<Vec<String>, String> {
    debug!(command = %cmd, "Control command");
    match tokio::task::spawn_blocking(move || cmd.execute(&*dpif)).await {
        Ok(Ok(lines)) => Ok(lines),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => {
            error!(command = %cmd, error = ?e, "Control command panicked");
            Err("internal error".to_string())
        }
    }
}
