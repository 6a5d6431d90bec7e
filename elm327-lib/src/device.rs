use std::time::{Duration, Instant};

use bytes::Bytes;
use strum_macros::Display;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Elm327Error;
use crate::frame::{Frame, FrameBuffer, PidReply};
use crate::pid::{MODE_CURRENT_DATA, Pid, decode_temperature, reply_mode};
use crate::transport::{DeviceInfo, Transport};

/// Default deadline for a single command/response exchange.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Interim frames tolerated while the adapter negotiates the vehicle
/// protocol before initialization is declared failed.
const MAX_PROBE_FRAMES: u32 = 10;

const CMD_RESET: &str = "ATZ";
const CMD_PROTOCOL_AUTO: &str = "ATSP0";
const CMD_TERMINATOR: &str = "\r\n";

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Initializing,
    Ready,
    AwaitingReply,
    Closing,
}

/// Direction tag passed to the debug traffic sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TrafficDirection {
    #[strum(to_string = ">>")]
    Tx,
    #[strum(to_string = "<<")]
    Rx,
}

type DebugSink = Box<dyn Fn(TrafficDirection, &str) + Send>;

/// The single in-flight command awaiting its reply.
///
/// The protocol is strictly half-duplex: the adapter has no request IDs,
/// so replies correlate to requests only by ordering and at most one
/// request may be outstanding.
struct PendingRequest {
    command: String,
    sent_at: Instant,
}

/// Session driving an ELM327 adapter over a [`Transport`].
///
/// Owns the connection, the single pending-request slot and the inbound
/// frame buffer. State-mutating operations take `&mut self`; callers on
/// multiple tasks must serialize access themselves.
pub struct Elm327<T: Transport> {
    transport: T,
    state: ConnectionState,
    rx: Option<mpsc::Receiver<Bytes>>,
    buffer: FrameBuffer,
    pending: Option<PendingRequest>,
    command_timeout: Duration,
    debug_sink: Option<DebugSink>,
}

impl<T: Transport> Elm327<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            rx: None,
            buffer: FrameBuffer::new(),
            pending: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            debug_sink: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sets the per-command reply deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Installs a sink that receives every command and reply as
    /// `>>`/`<<` tagged text, for diagnostic displays.
    pub fn set_debug_sink(&mut self, sink: impl Fn(TrafficDirection, &str) + Send + 'static) {
        self.debug_sink = Some(Box::new(sink));
    }

    /// Enumerates paired devices via the underlying transport.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, Elm327Error> {
        self.transport.list_devices().await
    }

    /// Connects to the adapter at `address` and runs the initialization
    /// handshake. On any failure the session rolls back to
    /// [`ConnectionState::Disconnected`].
    pub async fn connect(&mut self, address: &str) -> Result<(), Elm327Error> {
        // At most one live connection per session.
        self.disconnect().await;

        self.state = ConnectionState::Connecting;
        if let Err(e) = self.transport.connect(address).await {
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }
        match self.transport.subscribe().await {
            Ok(rx) => self.rx = Some(rx),
            Err(e) => {
                self.transport.disconnect().await;
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        }
        self.state = ConnectionState::Connected;
        info!(address, "transport connected, starting handshake");

        self.state = ConnectionState::Initializing;
        if let Err(e) = self.initialize().await {
            warn!(error = %e, "handshake failed, rolling back");
            self.disconnect().await;
            return Err(e);
        }

        self.state = ConnectionState::Ready;
        info!("adapter initialized, session ready");
        Ok(())
    }

    /// Fixed initialization handshake: reset, auto protocol, then the
    /// PID-support probe.
    async fn initialize(&mut self) -> Result<(), Elm327Error> {
        // Reply to the reset is the adapter banner; discarded.
        self.exchange(CMD_RESET).await?;
        self.exchange(CMD_PROTOCOL_AUTO).await?;

        // The adapter may emit provisional SEARCHING status lines while
        // it negotiates the vehicle's OBD protocol; keep reading frames
        // from the same probe until real hex data shows up.
        let mut frame = self.exchange(&Pid::SupportedPids.command()).await?;
        let mut attempts = 0u32;
        while !frame.is_pid_data() {
            attempts += 1;
            if attempts >= MAX_PROBE_FRAMES {
                return Err(Elm327Error::InitializationFailed { attempts });
            }
            debug!(attempt = attempts, frame = frame.as_str().trim(), "discarding interim frame");
            frame = match self.await_reply().await {
                Ok(frame) => frame,
                Err(Elm327Error::Timeout(_)) => {
                    return Err(Elm327Error::InitializationFailed { attempts });
                }
                Err(e) => return Err(e),
            };
        }
        Ok(())
    }

    /// Sends an arbitrary command and returns the raw reply text, for
    /// diagnostic/manual use.
    pub async fn send_raw(&mut self, command: &str) -> Result<String, Elm327Error> {
        self.ensure_ready()?;
        let frame = self.exchange(command).await?;
        Ok(frame.as_str().trim().to_owned())
    }

    /// Reads the engine coolant temperature (PID `0105`).
    ///
    /// Returns `Ok(None)` when the reply is empty or malformed; polling
    /// callers are expected to try again next cycle rather than treat
    /// this as fatal.
    pub async fn read_temperature(&mut self) -> Result<Option<i16>, Elm327Error> {
        self.ensure_ready()?;
        let frame = self.exchange(&Pid::CoolantTemp.command()).await?;
        // Last token of the frame: echoed mode/PID prefix bytes may
        // precede the data byte.
        Ok(frame.last_data_byte().map(decode_temperature))
    }

    /// Issues a mode-01 request for `pid` and parses the reply.
    ///
    /// Returns `Ok(None)` when the adapter answered with something other
    /// than a matching PID reply (e.g. `NO DATA`).
    pub async fn query_pid(&mut self, pid: Pid) -> Result<Option<PidReply>, Elm327Error> {
        self.ensure_ready()?;
        let frame = self.exchange(&pid.command()).await?;
        Ok(frame
            .pid_reply()
            .filter(|r| r.mode == reply_mode(MODE_CURRENT_DATA) && r.pid == u8::from(pid)))
    }

    /// Cancels any pending request, drops the subscription and closes
    /// the transport. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Some(pending) = self.pending.take() {
            debug!(command = %pending.command, "cancelling in-flight request");
        }
        self.buffer.clear();
        self.rx = None;
        self.transport.disconnect().await;
        self.state = ConnectionState::Disconnected;
        info!("session disconnected");
    }

    fn ensure_ready(&self) -> Result<(), Elm327Error> {
        match self.state {
            // AwaitingReply is reachable here only when a previous caller
            // abandoned its request; `exchange` sorts that out.
            ConnectionState::Ready | ConnectionState::AwaitingReply => Ok(()),
            _ => Err(Elm327Error::NotConnected),
        }
    }

    /// One strictly serialized command/response exchange: write the
    /// framed command, then await a complete reply frame under the
    /// command deadline.
    async fn exchange(&mut self, command: &str) -> Result<Frame, Elm327Error> {
        if let Some(pending) = &self.pending {
            // A caller abandoned its request mid-flight. The slot stays
            // claimed until that command's deadline passes, then the
            // session reclaims it instead of wedging.
            if pending.sent_at.elapsed() < self.command_timeout {
                return Err(Elm327Error::Busy {
                    command: pending.command.clone(),
                });
            }
            debug!(command = %pending.command, "reclaiming expired request slot");
            self.pending = None;
        }
        if self.rx.is_none() {
            return Err(Elm327Error::NotConnected);
        }

        // A late reply to a timed-out or abandoned command may still sit
        // in the buffer or the subscription queue; replies correlate to
        // requests by ordering only, so it must not be attributed to
        // this command.
        self.discard_stale_input();

        self.emit(TrafficDirection::Tx, command);
        let line = format!("{command}{CMD_TERMINATOR}");
        if let Err(e) = self.transport.write(line.as_bytes()).await {
            warn!(error = %e, "write failed, dropping connection");
            self.disconnect().await;
            return Err(e);
        }

        self.pending = Some(PendingRequest {
            command: command.to_owned(),
            sent_at: Instant::now(),
        });
        if self.state == ConnectionState::Ready {
            self.state = ConnectionState::AwaitingReply;
        }

        let result = self.await_reply().await;
        self.pending = None;
        if self.state == ConnectionState::AwaitingReply {
            self.state = ConnectionState::Ready;
        }

        match result {
            Ok(frame) => {
                self.emit(TrafficDirection::Rx, frame.as_str().trim());
                Ok(frame)
            }
            Err(e @ Elm327Error::Timeout(_)) => {
                // Partial data from the timed-out exchange must not leak
                // into the next reply.
                self.discard_stale_input();
                Err(e)
            }
            Err(e) => {
                // Transport died mid-exchange; don't leave the state
                // machine wedged in AwaitingReply.
                warn!(error = %e, "exchange failed, dropping connection");
                self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Awaits the next complete frame under the command deadline.
    async fn await_reply(&mut self) -> Result<Frame, Elm327Error> {
        timeout(self.command_timeout, self.next_frame()).await?
    }

    /// Drains the subscription into the frame buffer until a complete
    /// frame is assembled.
    async fn next_frame(&mut self) -> Result<Frame, Elm327Error> {
        loop {
            if let Some(frame) = self.buffer.take_frame() {
                return Ok(frame);
            }
            let rx = self.rx.as_mut().ok_or(Elm327Error::NotConnected)?;
            match rx.recv().await {
                Some(chunk) => self.buffer.push(&chunk),
                // Channel closed. disconnect() takes `&mut self` like
                // every session call, so our own teardown can never race
                // this await; the transport's reader has died.
                None => {
                    return Err(Elm327Error::Io(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )));
                }
            }
        }
    }

    /// Drops buffered bytes and anything still queued in the
    /// subscription channel.
    fn discard_stale_input(&mut self) {
        self.buffer.clear();
        if let Some(rx) = self.rx.as_mut() {
            while rx.try_recv().is_ok() {}
        }
    }

    fn emit(&self, direction: TrafficDirection, text: &str) {
        debug!(%direction, %text, "adapter traffic");
        if let Some(sink) = &self.debug_sink {
            sink(direction, text);
        }
    }
}
