//! Protocol driver for ELM327 OBD-II adapters.
//!
//! Turns the adapter's noisy, half-duplex, line-oriented serial channel
//! into a reliable command/response API: one command in flight at a
//! time, replies framed by the `>` prompt, per-command timeouts, and
//! handling of the SEARCHING status the adapter emits while it
//! negotiates the vehicle protocol.
//!
//! ```no_run
//! use elm327_lib::Elm327;
//! use elm327_lib::transport::TcpTransport;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), elm327_lib::error::Elm327Error> {
//! let mut session = Elm327::new(TcpTransport::new());
//! session.connect("192.168.0.10:35000").await?;
//!
//! if let Some(celsius) = session.read_temperature().await? {
//!     println!("coolant: {celsius} °C");
//! }
//!
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod frame;
pub mod pid;
pub mod transport;

#[cfg(feature = "bluetooth")]
pub mod bluetooth;

#[cfg(test)]
mod tests;

// Re-export the session type for easy access
pub use device::Elm327;
