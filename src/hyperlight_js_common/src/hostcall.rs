/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The narrow channel the guest uses to reach the host. Each host call
//! is identified by a port number; the payload encodings live next to
//! the ports so host and guest cannot drift apart.

use serde::{Deserialize, Serialize};

/// Ports a guest may target with a host call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HostCallPort {
    /// Forward a guest log record to the host's logging facade.
    Log = 99,
    /// Request the host's current wall-clock time.
    CurrentTime = 100,
    /// Abort guest execution with a code and message.
    Abort = 102,
}

impl TryFrom<u16> for HostCallPort {
    type Error = u16;

    fn try_from(port: u16) -> Result<Self, u16> {
        match port {
            99 => Ok(HostCallPort::Log),
            100 => Ok(HostCallPort::CurrentTime),
            102 => Ok(HostCallPort::Abort),
            other => Err(other),
        }
    }
}

/// Abort codes carried in the first byte of an [`HostCallPort::Abort`]
/// payload.
pub mod abort_code {
    /// A handler threw an exception nothing caught.
    pub const UNHANDLED_EXCEPTION: u8 = 1;
    /// A host call failed while the guest was waiting on it.
    pub const HOST_CALL_FAILED: u8 = 2;
    /// The handler result did not fit the output buffer.
    pub const OUTPUT_TOO_LARGE: u8 = 3;
}

/// Size of a [`HostCallPort::CurrentTime`] reply: two little-endian
/// `u64` words.
pub const TIME_REPLY_SIZE: usize = 16;

/// Encode a current-time reply: seconds since the Unix epoch, then
/// sub-second nanoseconds.
pub fn encode_time_reply(secs: u64, nanos: u64) -> [u8; TIME_REPLY_SIZE] {
    let mut reply = [0u8; TIME_REPLY_SIZE];
    reply[..8].copy_from_slice(&secs.to_le_bytes());
    reply[8..].copy_from_slice(&nanos.to_le_bytes());
    reply
}

/// Decode a current-time reply. Returns `None` if the buffer is the
/// wrong size.
pub fn decode_time_reply(reply: &[u8]) -> Option<(u64, u64)> {
    if reply.len() != TIME_REPLY_SIZE {
        return None;
    }
    let secs = u64::from_le_bytes(reply[..8].try_into().ok()?);
    let nanos = u64::from_le_bytes(reply[8..].try_into().ok()?);
    Some((secs, nanos))
}

/// Encode an abort payload: one code byte followed by a UTF-8 message.
pub fn encode_abort(code: u8, message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + message.len());
    payload.push(code);
    payload.extend_from_slice(message.as_bytes());
    payload
}

/// Decode an abort payload. An empty payload decodes as code 0 with an
/// empty message; a malformed message is replaced rather than rejected,
/// since the guest is already on its way down.
pub fn decode_abort(payload: &[u8]) -> (u8, String) {
    match payload.split_first() {
        Some((code, message)) => (*code, String::from_utf8_lossy(message).into_owned()),
        None => (0, String::new()),
    }
}

/// Severity of a guest log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestLogLevel {
    /// log::Level::Error
    Error,
    /// log::Level::Warn
    Warn,
    /// log::Level::Info
    Info,
    /// log::Level::Debug
    Debug,
    /// log::Level::Trace
    Trace,
}

impl GuestLogLevel {
    /// The corresponding host-side level.
    pub fn as_log_level(self) -> log::Level {
        match self {
            GuestLogLevel::Error => log::Level::Error,
            GuestLogLevel::Warn => log::Level::Warn,
            GuestLogLevel::Info => log::Level::Info,
            GuestLogLevel::Debug => log::Level::Debug,
            GuestLogLevel::Trace => log::Level::Trace,
        }
    }
}

/// A log record forwarded from the guest over [`HostCallPort::Log`],
/// carried as a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestLogRecord {
    /// Severity the guest assigned.
    pub level: GuestLogLevel,
    /// The formatted message.
    pub message: String,
    /// Where in the guest the record originated.
    pub source: String,
}
