//! Bluetooth RFCOMM (Serial Port Profile) transport via BlueZ.
//!
//! ELM327 dongles expose SPP on RFCOMM channel 1; pairing is handled by
//! the platform, this transport only connects to already-paired devices.

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, Address};
use bytes::Bytes;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Elm327Error;
use crate::transport::{DeviceInfo, Link, Transport};

/// RFCOMM channel conventionally used for the Serial Port Profile.
pub const SPP_CHANNEL: u8 = 1;

/// Transport for Bluetooth Classic ELM327 adapters.
pub struct BluetoothTransport {
    adapter: Adapter,
    link: Option<Link<WriteHalf<Stream>>>,
}

impl BluetoothTransport {
    /// Binds to the default Bluetooth adapter.
    pub async fn new() -> Result<Self, Elm327Error> {
        let session = bluer::Session::new()
            .await
            .map_err(|_| Elm327Error::TransportUnavailable)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| Elm327Error::TransportUnavailable)?;
        if !adapter.is_powered().await? {
            return Err(Elm327Error::TransportUnavailable);
        }
        Ok(Self {
            adapter,
            link: None,
        })
    }
}

#[async_trait]
impl Transport for BluetoothTransport {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, Elm327Error> {
        let mut devices = Vec::new();
        for addr in self.adapter.device_addresses().await? {
            let device = self.adapter.device(addr)?;
            if !device.is_paired().await? {
                continue;
            }
            devices.push(DeviceInfo {
                address: addr.to_string(),
                name: device.name().await?,
            });
        }
        Ok(devices)
    }

    async fn connect(&mut self, address: &str) -> Result<(), Elm327Error> {
        self.disconnect().await;

        let addr: Address = address
            .parse()
            .map_err(|_| Elm327Error::InvalidAddress(address.to_owned()))?;
        let stream = Stream::connect(SocketAddr::new(addr, SPP_CHANNEL))
            .await
            .map_err(|e| Elm327Error::Connect {
                address: address.to_owned(),
                reason: e.to_string(),
            })?;
        debug!(address, channel = SPP_CHANNEL, "RFCOMM stream established");

        let (reader, writer): (ReadHalf<Stream>, WriteHalf<Stream>) = tokio::io::split(stream);
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
