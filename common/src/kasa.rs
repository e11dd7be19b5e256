//! Smart-plug client for the porch switch.
//!
//! Frames are a 4-byte header (two zero bytes, then the payload length as a
//! big-endian u16) followed by the JSON command run through the plug's
//! autokey XOR obfuscation: every output byte is the key XOR the next plain
//! byte and becomes the key for the byte after. This hides nothing; it is
//! only what the plug expects on the wire.

use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, TcpStream},
    time::{Duration, Instant},
};

use log::debug;
use serde_json::Value;

use crate::{
    error::{FrameError, LinkError},
    network::SwitchLink,
    resolve::CachedAddr,
    types::{CommandOutcome, SwitchCommand},
};

pub const INITIAL_KEY: u8 = 0xAB;
pub const HEADER_LEN: usize = 4;
pub const DEFAULT_PORT: u16 = 9999;
const MAX_RESPONSE_LEN: usize = 4096;
const DEFAULT_LOOKUP_TIMEOUT_MS: u32 = 2_000;

pub const GET_SYSINFO: &str = r#"{"system":{"get_sysinfo":{}}}"#;
pub const RELAY_ON: &str = r#"{"system":{"set_relay_state":{"state":1}}}"#;
pub const RELAY_OFF: &str = r#"{"system":{"set_relay_state":{"state":0}}}"#;

pub fn command_body(command: SwitchCommand) -> &'static str {
    match command {
        SwitchCommand::On => RELAY_ON,
        SwitchCommand::Off => RELAY_OFF,
    }
}

pub fn obfuscate(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    plain
        .iter()
        .map(|byte| {
            key ^= byte;
            key
        })
        .collect()
}

pub fn deobfuscate(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIAL_KEY;
    cipher
        .iter()
        .map(|&byte| {
            let plain = key ^ byte;
            key = byte;
            plain
        })
        .collect()
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::TooLong(payload.len()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(obfuscate(payload));
    Ok(frame)
}

pub fn payload_len(header: [u8; HEADER_LEN]) -> usize {
    usize::from(u16::from_be_bytes([header[2], header[3]]))
}

pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header: [u8; HEADER_LEN] = frame
        .get(..HEADER_LEN)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(FrameError::Truncated)?;
    let declared = payload_len(header);
    let body = &frame[HEADER_LEN..];
    if body.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(deobfuscate(body))
}

/// Reads `relay_state` out of a `get_sysinfo` reply.
pub fn relay_state(reply: &[u8]) -> Result<bool, FrameError> {
    let value: Value =
        serde_json::from_slice(reply).map_err(|err| FrameError::Json(err.to_string()))?;
    value
        .pointer("/system/get_sysinfo/relay_state")
        .and_then(Value::as_u64)
        .map(|state| state != 0)
        .ok_or_else(|| FrameError::Json("missing system.get_sysinfo.relay_state".to_string()))
}

/// Checks the `err_code` of a `set_relay_state` reply.
pub fn relay_ack(reply: &[u8]) -> Result<(), FrameError> {
    let value: Value =
        serde_json::from_slice(reply).map_err(|err| FrameError::Json(err.to_string()))?;
    match value
        .pointer("/system/set_relay_state/err_code")
        .and_then(Value::as_i64)
    {
        Some(0) => Ok(()),
        Some(code) => Err(FrameError::Json(format!("set_relay_state err_code {code}"))),
        None => Err(FrameError::Json(
            "missing system.set_relay_state.err_code".to_string(),
        )),
    }
}

/// Opens one short-lived connection per command and closes it right after.
#[derive(Debug, Clone)]
pub struct KasaClient {
    addr: CachedAddr,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl KasaClient {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout_ms: u32, io_timeout_ms: u32) -> Self {
        Self {
            addr: CachedAddr::new(host, port, DEFAULT_LOOKUP_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(u64::from(connect_timeout_ms)),
            io_timeout: Duration::from_millis(u64::from(io_timeout_ms)),
        }
    }

    /// Bounds the host name lookup, which only runs when the plug is
    /// configured by name and again after a failed connect.
    pub fn with_lookup_timeout(mut self, timeout_ms: u32) -> Self {
        self.addr = CachedAddr::new(self.addr.host().to_string(), self.addr.port(), timeout_ms);
        self
    }

    fn connect(&mut self) -> Result<TcpStream, LinkError> {
        let addr = self.addr.get()?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout).map_err(|err| {
            // The plug may have moved to another address.
            self.addr.invalidate();
            if err.kind() == ErrorKind::TimedOut {
                LinkError::Timeout(self.connect_timeout.as_millis() as u32)
            } else {
                LinkError::Io(err)
            }
        })?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        Ok(stream)
    }

    fn exchange(&self, stream: &mut TcpStream, body: &str) -> Result<Vec<u8>, LinkError> {
        stream.write_all(&encode_frame(body.as_bytes())?)?;

        let deadline = Instant::now() + self.io_timeout;
        let mut header = [0_u8; HEADER_LEN];
        read_exact_by(stream, &mut header, deadline, self.io_timeout)?;

        let len = payload_len(header);
        if len > MAX_RESPONSE_LEN {
            return Err(LinkError::protocol(format!("reply of {len} bytes is too large")));
        }
        let mut payload = vec![0_u8; len];
        read_exact_by(stream, &mut payload, deadline, self.io_timeout)?;
        Ok(deobfuscate(&payload))
    }

    fn with_connection<T>(
        &mut self,
        op: impl FnOnce(&Self, &mut TcpStream) -> Result<T, LinkError>,
    ) -> Result<T, LinkError> {
        let mut stream = self.connect()?;
        let result = op(self, &mut stream);
        let _ = stream.shutdown(Shutdown::Both);
        result
    }
}

impl SwitchLink for KasaClient {
    fn query_relay(&mut self) -> Result<bool, LinkError> {
        self.with_connection(|client, stream| {
            let reply = client.exchange(stream, GET_SYSINFO)?;
            Ok(relay_state(&reply)?)
        })
    }

    fn execute(&mut self, command: SwitchCommand) -> Result<CommandOutcome, LinkError> {
        self.with_connection(|client, stream| {
            let relay_on = relay_state(&client.exchange(stream, GET_SYSINFO)?)?;
            if command == SwitchCommand::On && relay_on {
                debug!("porch relay already on; skipping command");
                return Ok(CommandOutcome::AlreadySet);
            }

            relay_ack(&client.exchange(stream, command_body(command))?)?;
            Ok(CommandOutcome::Sent)
        })
    }
}

fn read_exact_by(
    stream: &mut TcpStream,
    mut buf: &mut [u8],
    deadline: Instant,
    budget: Duration,
) -> Result<(), LinkError> {
    let timeout = || LinkError::Timeout(budget.as_millis() as u32);
    while !buf.is_empty() {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or_else(timeout)?;
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(buf) {
            Ok(0) => return Err(LinkError::protocol("connection closed mid-reply")),
            Ok(n) => buf = &mut buf[n..],
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(timeout());
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
