//! Power sequencing for the Quectel EC2x LTE module.
//!
//! [`ec2x::QuectelEc2x`] drives the power key and reset lines and runs the
//! `RDY` boot handshake over an [`at::CommandChannel`]. [`modem::ModemWorker`]
//! moves those blocking calls onto tokio's blocking pool for the HTTP API.

pub mod api;
pub mod at;
pub mod config;
pub mod ec2x;
pub mod error;
pub mod gpio;
pub mod metrics;
pub mod modem;
pub mod properties;
pub mod tty;

pub use config::{Ec2xConfig, FlowControlPins};
pub use ec2x::QuectelEc2x;
pub use error::{DeviceFault, ModemError};
