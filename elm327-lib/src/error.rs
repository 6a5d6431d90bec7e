use std::io;
use thiserror::Error;

/// The primary error type for the `elm327-lib` library.
#[derive(Error, Debug)]
pub enum Elm327Error {
    #[error("no usable adapter available (radio missing or not powered?)")]
    TransportUnavailable,

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("not a valid device address: {0}")]
    InvalidAddress(String),

    #[error("no connection is established")]
    NotConnected,

    #[error("adapter handshake did not converge after {attempts} probe frames")]
    InitializationFailed { attempts: u32 },

    #[error("command {command:?} is still awaiting its reply")]
    Busy { command: String },

    #[error("timed out waiting for a complete frame: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[cfg(feature = "bluetooth")]
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
}
