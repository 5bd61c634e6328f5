use serde::{Deserialize, Serialize};

/// Largest frame one datagram may carry: a jumbo Ethernet frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 9018;

/// Default number of frames tracked per batch.
pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetIoConfig {
    /// Number of ingress worker threads per pipeline.
    /// Each worker is a native OS thread with its own socket.
    pub workers: usize,

    /// Enable SO_REUSEPORT so the workers of a pipeline share its UDP port.
    /// The kernel spreads incoming datagrams across the workers.
    pub reuse_port: bool,

    /// Pin each worker thread to a CPU core.
    pub pin_to_cpu: bool,

    /// Optional kernel receive buffer size (SO_RCVBUF).
    pub socket_recv_buffer_size: Option<usize>,

    /// Optional kernel send buffer size (SO_SNDBUF).
    pub socket_send_buffer_size: Option<usize>,

    /// Maximum frames gathered into one tracking batch.
    pub batch_size: usize,

    /// Receive buffer size; longer datagrams are truncated.
    pub max_frame_size: usize,

    /// How long a worker blocks waiting for the first frame of a batch
    /// before rechecking for shutdown, in milliseconds.
    pub poll_timeout_ms: u64,
}

impl Default for NetIoConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            reuse_port: true,
            pin_to_cpu: false,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            poll_timeout_ms: 100,
        }
    }
}

impl NetIoConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers == 0 {
            errors.push("netio.workers must be at least 1".to_string());
        }

        if self.workers > 1 && !self.reuse_port {
            errors.push("netio.workers > 1 requires netio.reuse_port".to_string());
        }

        if self.batch_size == 0 || self.batch_size > 1024 {
            errors.push(format!(
                "netio.batch_size must be within 1..=1024, got {}",
                self.batch_size
            ));
        }

        if self.max_frame_size < 64 || self.max_frame_size > 65535 {
            errors.push(format!(
                "netio.max_frame_size must be within 64..=65535, got {}",
                self.max_frame_size
            ));
        }

        if self.poll_timeout_ms == 0 {
            errors.push("netio.poll_timeout_ms must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
