//! # Analog I/O Board Library
//!
//! Host-side driver for a microcontroller board with PWM outputs, analog
//! inputs and a 4-line analog switch network. One serial link carries two
//! protocols: a text line protocol (`comtest`, `vset`, `vread`, `verbose`)
//! answered with `OK:start` / `OK:ready` frames, and Firmata messages used for
//! analog reporting, synchronous sampling and digital switch control.
//!
//! [`DeviceController`] is the entry point. [`BoardSimulator`] emulates the
//! firmware so the whole stack can run without hardware.

pub mod command;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod firmata;
pub mod link;
pub mod logging;
pub mod pins;
pub mod response;
pub mod sampler;
pub mod sim;
pub mod switch;
pub mod transport;

pub use command::Command;
pub use config::{DeviceConfig, PollMode};
pub use connection::{ConnectionState, Disconnected};
pub use device::{DeviceController, WriteResult};
pub use error::{Error, Result};
pub use response::Response;
pub use sim::{BoardSimulator, SimConnector};
pub use switch::SwitchState;
pub use transport::{Connector, SerialConnector, Transport};
