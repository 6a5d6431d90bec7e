//! Inbound buffering and the adapter's reply grammar.
//!
//! An ELM327 reply is a run of text lines terminated by the prompt byte
//! `>`. Within a frame, OBD data lines follow the grammar
//! `frame := token (SP token)* PROMPT` with `token := HEXBYTE`; anything
//! else (the reset banner, `OK`, `SEARCHING...`, `NO DATA`) is status
//! text.

use bytes::BytesMut;

/// Prompt byte the adapter sends once a reply is complete.
pub const PROMPT: u8 = b'>';

/// Interim status the adapter emits while negotiating the vehicle
/// protocol.
pub const SEARCHING: &str = "SEARCHING";

/// Accumulates raw transport chunks until a complete frame is assembled.
///
/// The buffer is cleared after every completed frame and on timeout, so
/// stale bytes from an earlier exchange never leak into the next reply.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Takes a complete frame off the buffer, if one has been assembled.
    ///
    /// A frame is everything up to the first prompt byte. The whole
    /// buffer is cleared afterwards, including any bytes that trailed the
    /// prompt.
    pub fn take_frame(&mut self) -> Option<Frame> {
        let end = self.buf.iter().position(|&b| b == PROMPT)?;
        let frame = Frame::from_bytes(&self.buf[..end]);
        self.buf.clear();
        Some(frame)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// One complete adapter reply, with the prompt terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    text: String,
}

impl Frame {
    pub fn from_bytes(raw: &[u8]) -> Self {
        // Adapters occasionally emit stray non-UTF-8 bytes during reset.
        Self {
            text: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Non-empty trimmed lines of the frame.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    /// Whether this is an interim "SEARCHING..." status frame.
    pub fn is_searching(&self) -> bool {
        self.lines().any(|line| line.contains(SEARCHING))
    }

    /// Whitespace-delimited tokens of the whole frame, echo included.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.text.split_whitespace()
    }

    /// Whether some line of the frame is a well-formed PID data line
    /// (three or more hex byte tokens).
    pub fn is_pid_data(&self) -> bool {
        self.lines().any(is_data_line)
    }

    /// Parses the first data line into mode echo, PID echo and data
    /// bytes.
    pub fn pid_reply(&self) -> Option<PidReply> {
        let line = self.lines().find(|line| is_data_line(line))?;
        let bytes: Vec<u8> = line
            .split_whitespace()
            .map(parse_hex_byte)
            .collect::<Option<_>>()?;

        Some(PidReply {
            mode: bytes[0],
            pid: bytes[1],
            data: bytes[2..].to_vec(),
        })
    }

    /// The last token of the frame, if it parses as a hex byte.
    ///
    /// Adapters with echo enabled prefix replies with the request bytes,
    /// so the data byte of a single-byte PID is always the final token.
    pub fn last_data_byte(&self) -> Option<u8> {
        parse_hex_byte(self.tokens().last()?)
    }
}

/// Parsed PID reply: mode echo, PID echo, one or more data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidReply {
    pub mode: u8,
    pub pid: u8,
    pub data: Vec<u8>,
}

fn is_hex_pair(token: &str) -> bool {
    token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_data_line(line: &str) -> bool {
    let mut tokens = 0;
    for token in line.split_whitespace() {
        if !is_hex_pair(token) {
            return false;
        }
        tokens += 1;
    }
    tokens >= 3
}

fn parse_hex_byte(token: &str) -> Option<u8> {
    if !is_hex_pair(token) {
        return None;
    }
    u8::from_str_radix(token, 16).ok()
}
