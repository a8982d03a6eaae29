//! Wire format for the AOO ("Audio Over OSC") protocol.
//!
//! All control and data traffic is carried as OSC 1.0 messages under the
//! `/aoo` address prefix; audio data frames and relay envelopes additionally
//! have a compact binary representation. This crate implements:
//! - a minimal OSC writer/reader ([`osc`])
//! - the `/aoo` address grammar ([`parse_pattern`])
//! - NTP style time tags ([`time::NtpTime`])
//! - the binary data message and relay envelope ([`binmsg`])
//! - length-prefixed TCP framing ([`framing`])

pub mod binmsg;
pub mod endpoint;
pub mod framing;
pub mod osc;
pub mod pattern;
pub mod time;

pub use endpoint::{Endpoint, IpHost};
pub use pattern::{parse_pattern, MsgType};
pub use time::NtpTime;

use thiserror::Error;

/// AOO identifier. Sources, sinks, streams, clients, groups and users are
/// all identified by a signed 32-bit integer.
pub type Id = i32;

/// Invalid/unset id.
pub const ID_INVALID: Id = -1;
/// Wildcard id addressing all instances.
pub const ID_ALL: Id = -2;

/// Absolute maximum size of a single UDP datagram or framed TCP message.
pub const MAX_PACKET_SIZE: usize = 65536;

/// Default maximum UDP payload. Safe across most networks, including the
/// open internet.
pub const DEFAULT_PACKET_SIZE: usize = 512;

/// Address prefix shared by every AOO message.
pub const MSG_DOMAIN: &str = "/aoo";

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// Message ended before all announced content was read.
    #[error("truncated message")]
    Truncated,
    /// Structurally invalid message.
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    /// An argument had a different OSC type tag than expected.
    #[error("wrong argument type: expected '{expected}', got '{got}'")]
    WrongType { expected: char, got: char },
    /// Fewer arguments than the message layout requires.
    #[error("missing argument")]
    MissingArgument,
}

/// Typed payload attached to streams, groups, users and custom requests.
///
/// The numeric kind mirrors the wire encoding; the content is opaque to the
/// protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub kind: i32,
    pub content: Vec<u8>,
}

impl Data {
    pub fn new(kind: i32, content: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}
