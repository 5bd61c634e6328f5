//! Network I/O utilities module.
//!
//! Socket creation and configuration for frame ingress. Each datagram
//! received on a pipeline port carries one Ethernet frame.
//!
//! For worker thread orchestration, see the `worker` module.

pub mod config;
pub(crate) mod socket;

pub use config::NetIoConfig;
pub(crate) use socket::create_udp_socket;
