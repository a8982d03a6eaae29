//! The AOO streaming engine.
//!
//! A [`Source`] encodes, fragments and sequences audio blocks across a
//! lossy/reordering UDP channel; a [`Sink`] reassembles, conceals and mixes
//! them. Both are driven by three host threads:
//! - the *audio* thread calls `process()` (non-blocking, bounded latency)
//! - the *network send* thread calls `send()` with a send function
//! - the *network receive* thread feeds datagrams into `handle_message()`
//!
//! Cross-thread handoff goes through lock-free SPSC rings and MPSC
//! channels; the audio thread only ever `try_lock`s shared state and
//! degrades to silence plus an xrun event when it loses the race.

pub mod ack;
pub(crate) mod atomic;
pub mod buffer;
pub mod event;
pub mod resampler;
pub mod sink;
pub mod source;
pub mod time_dll;
pub mod timer;

pub use event::{SinkEvent, SourceEvent, StreamState};
pub use resampler::ResampleMethod;
pub use sink::Sink;
pub use source::Source;

pub use aoo_codec::{CodecCtl, Format};
pub use aoo_wire::{Data, Endpoint, Id, NtpTime, ID_ALL, ID_INVALID};

use thiserror::Error;

/// Default source-side buffering between audio and network thread.
pub const DEFAULT_SOURCE_BUFFER_SIZE: f64 = 0.025;
/// Default sink latency (jitter buffer depth).
pub const DEFAULT_SINK_BUFFER_SIZE: f64 = 0.050;
/// Default source→sink heartbeat interval.
pub const DEFAULT_PING_INTERVAL: f64 = 1.0;
/// Default history depth for retransmission.
pub const DEFAULT_RESEND_BUFFER_SIZE: f64 = 1.0;
/// Minimum gap between retransmit requests for the same block.
pub const DEFAULT_RESEND_INTERVAL: f64 = 0.010;
/// Retransmit attempts per missing block.
pub const DEFAULT_RESEND_LIMIT: i32 = 16;
/// Max. frames requested per incoming data message.
pub const DEFAULT_RESEND_MAX_FRAMES: i32 = 16;
/// Duplicate sends per frame.
pub const DEFAULT_REDUNDANCY: i32 = 1;
/// Time DLL filter bandwidth.
pub const DEFAULT_DLL_BANDWIDTH: f64 = 0.012;
/// Tolerated deviation from the nominal block period before counting an
/// xrun.
pub const XRUN_TOLERANCE: f64 = 0.25;
/// Seconds without traffic before a sink drops a source.
pub const DEFAULT_SOURCE_TIMEOUT: f64 = 10.0;
/// Interval between repeated invitations.
pub const DEFAULT_INVITE_INTERVAL: f64 = 0.050;
/// Seconds before an unanswered invitation times out.
pub const DEFAULT_INVITE_TIMEOUT: f64 = 1.0;

/// Errors surfaced by the in-process API. Asynchronous failures appear as
/// events instead.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid argument: {0}")]
    BadArgument(&'static str),
    #[error("codec '{0}' not known")]
    UnknownCodec(String),
    #[error(transparent)]
    BadFormat(#[from] aoo_codec::CodecError),
    #[error(transparent)]
    Wire(#[from] aoo_wire::WireError),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not set up")]
    NotSetup,
    #[error("no stream format")]
    NoFormat,
    #[error("stream is idle")]
    Idle,
    #[error("would block")]
    WouldBlock,
}

pub type StreamResult<T> = Result<T, StreamError>;

/// A timed out-of-band message interleaved into the audio stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Delivery time of the message.
    pub time: NtpTime,
    /// Logical channel, free for the application.
    pub channel: i32,
    /// Payload type, free for the application.
    pub kind: i32,
    pub data: Vec<u8>,
}
