//! Stream transports the session runs on.
//!
//! A [`Transport`] knows nothing about the ELM327 protocol: it opens a
//! byte stream to a serial-profile device, writes raw bytes, and delivers
//! received chunks through a single subscription channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Elm327Error;

/// Capacity of the subscription channel between reader task and session.
pub(crate) const SUBSCRIPTION_CAPACITY: usize = 32;

const READ_CHUNK: usize = 256;

/// A paired/known serial device, as reported by device discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: String,
    pub name: Option<String>,
}

/// Bidirectional byte stream to an ELM327 adapter.
///
/// Implementations hold at most one physical connection; `connect` tears
/// down any prior one first. `subscribe` registers the single active
/// listener, replacing (and thereby closing) a previous subscription so
/// a reconnect can never double-deliver.
#[async_trait]
pub trait Transport: Send {
    /// Enumerates already-paired devices.
    ///
    /// Fails with [`Elm327Error::TransportUnavailable`] when no adapter
    /// or permission is present.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, Elm327Error>;

    /// Opens a stream to the device's serial profile.
    async fn connect(&mut self, address: &str) -> Result<(), Elm327Error>;

    /// Registers the single active data subscription.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Bytes>, Elm327Error>;

    /// Writes raw bytes; does not wait for any reply.
    async fn write(&mut self, data: &[u8]) -> Result<(), Elm327Error>;

    /// Closes the connection. Idempotent.
    async fn disconnect(&mut self);
}

type SubscriberSlot = Arc<Mutex<Option<mpsc::Sender<Bytes>>>>;

/// One live stream connection: the writer half plus a reader task that
/// forwards received chunks to the active subscriber.
pub(crate) struct Link<W> {
    writer: W,
    slot: SubscriberSlot,
    reader: JoinHandle<()>,
}

impl<W: AsyncWrite + Unpin> Link<W> {
    pub(crate) fn spawn<R>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let slot: SubscriberSlot = Arc::new(Mutex::new(None));
        let task_slot = Arc::clone(&slot);
        let reader = tokio::spawn(pump(reader, task_slot));

        Self {
            writer,
            slot,
            reader,
        }
    }

    pub(crate) async fn subscribe(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        // Replacing the sender closes the previous subscriber's channel.
        *self.slot.lock().await = Some(tx);
        rx
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<(), Elm327Error> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(mut self) {
        self.reader.abort();
        self.slot.lock().await.take();
        let _ = self.writer.shutdown().await;
    }
}

/// Forwards stream chunks to the current subscriber until the stream
/// ends. Dropping the sender on exit is how the session learns the
/// transport died.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, slot: SubscriberSlot) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("stream closed by peer");
                break;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let tx = slot.lock().await.clone();
                match tx {
                    Some(tx) => {
                        if tx.send(chunk).await.is_err() {
                            trace!("subscriber gone, chunk dropped");
                        }
                    }
                    None => trace!(bytes = n, "no subscriber, chunk dropped"),
                }
            }
            Err(e) => {
                warn!(error = %e, "stream read failed");
                break;
            }
        }
    }
    slot.lock().await.take();
}

/// Transport for WiFi ELM327 adapters, which expose the same byte
/// protocol over a TCP socket (conventionally port 35000).
#[derive(Default)]
pub struct TcpTransport {
    link: Option<Link<OwnedWriteHalf>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, Elm327Error> {
        // Network adapters are addressed directly; there is no discovery.
        Ok(Vec::new())
    }

    async fn connect(&mut self, address: &str) -> Result<(), Elm327Error> {
        self.disconnect().await;

        let stream =
            TcpStream::connect(address)
                .await
                .map_err(|e| Elm327Error::Connect {
                    address: address.to_owned(),
                    reason: e.to_string(),
                })?;
        // Command frames are a handful of bytes; don't batch them.
        stream.set_nodelay(true)?;
        debug!(address, "TCP stream established");

        let (reader, writer) = stream.into_split();
        self.link = Some(Link::spawn(reader, writer));
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Bytes>, Elm327Error> {
        match &self.link {
            Some(link) => Ok(link.subscribe().await),
            None => Err(Elm327Error::NotConnected),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Elm327Error> {
        match &mut self.link {
            Some(link) => link.write(data).await,
            None => Err(Elm327Error::NotConnected),
        }
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
    }
}
