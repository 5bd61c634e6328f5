//! fastct daemon library.
//!
//! Configuration, telemetry, frame ingress workers and the control socket
//! around a [`fastct_core::Conntrack`]. The daemon binary is in main.rs and
//! the management client in bin/fastctl.rs.

pub mod config;
pub mod control;
pub mod netio;
pub mod runtime;
pub mod telemetry;
pub mod worker;
