//! Error type shared by every layer of the controller.

use std::time::Duration;

use crate::response::Response;

/// Everything that can go wrong between a caller and the board.
///
/// The first group is detected before a single byte is written and is always
/// recoverable by fixing the request. The rest come from the link itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The command name is not in the registry.
    #[error("Unexpected command: {0}")]
    UnknownCommand(String),
    /// The command got the wrong number of parameters.
    #[error("'{command}' expects {expected} params, got {got}")]
    ArityMismatch {
        command: &'static str,
        expected: usize,
        got: usize,
    },
    /// A parameter has the wrong shape (e.g. a scalar where a list is needed).
    #[error("'{command}': {reason}")]
    InvalidParam {
        command: &'static str,
        reason: String,
    },
    /// `vset` was given a different number of pins and values.
    #[error("Inconsistent command: {pins} pins but {values} values")]
    LengthMismatch { pins: usize, values: usize },
    /// A pin outside the set the command may address. `pin` is the value as
    /// given, whatever its type.
    #[error("'{command}': pin {pin} is not valid, valid pins are {valid:?}")]
    Pin {
        command: &'static str,
        pin: String,
        valid: &'static [u8],
    },
    /// A value outside its allowed range, or not convertible to an integer.
    #[error("{what} {value} is out of range {min}-{max}")]
    Range {
        what: &'static str,
        value: String,
        min: i64,
        max: i64,
    },
    /// A command was issued while the link is not connected.
    #[error("The serial object is disconnected")]
    NotConnected,
    /// The board never answered the handshake probe.
    #[error("No handshake reply from {port} within {timeout:?}")]
    ConnectTimeout { port: String, timeout: Duration },
    /// The port could not be opened or configured.
    #[error("Could not open {port}: {source}")]
    ConnectIo {
        port: String,
        #[source]
        source: serialport::Error,
    },
    /// Fewer replies than expected arrived before the per-message deadline.
    #[error("Timeout expired after {} of {expected} replies", received.len())]
    ReadTimeout {
        expected: usize,
        received: Vec<Response>,
        partial: Response,
    },
    /// The link failed while connected.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures detected before anything was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnknownCommand(_)
                | Error::ArityMismatch { .. }
                | Error::InvalidParam { .. }
                | Error::LengthMismatch { .. }
                | Error::Pin { .. }
                | Error::Range { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
