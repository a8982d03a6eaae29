//! Audio codec support for AOO streams.
//!
//! Codecs are values registered in a process-global table keyed by name;
//! the streaming engine only ever talks to the [`Codec`] record and the
//! [`Encoder`]/[`Decoder`] traits, so external plugins can be added without
//! touching the core. Built-in codecs:
//! - `pcm`: uncompressed big-endian PCM (16/24-bit integer, 32-bit float)
//! - `null`: encodes to zero bytes and decodes to silence; always available

pub mod null;
pub mod pcm;

use std::collections::HashMap;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use thiserror::Error;

/// Maximum size of the serialized codec-specific options.
pub const MAX_OPTION_SIZE: usize = 256;

/// Common codec error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The format was rejected by the codec.
    #[error("bad format")]
    BadFormat,
    /// Control or feature not supported by this codec.
    #[error("not implemented")]
    NotImplemented,
    /// Input data could not be decoded.
    #[error("invalid input data")]
    InvalidInput,
    /// Output buffer too small for one block.
    #[error("output buffer too small")]
    BufferTooSmall,
}

/// A stream format: the common header plus the codec-specific options in
/// their serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub codec: String,
    pub num_channels: i32,
    pub sample_rate: i32,
    pub block_size: i32,
    /// Codec-specific options, opaque to the protocol layer.
    pub options: Vec<u8>,
}

impl Format {
    pub fn new(codec: impl Into<String>, num_channels: i32, sample_rate: i32, block_size: i32) -> Self {
        Self {
            codec: codec.into(),
            num_channels,
            sample_rate,
            block_size,
            options: Vec::new(),
        }
    }

    /// Samples per block over all channels.
    pub fn block_samples(&self) -> usize {
        (self.num_channels * self.block_size).max(0) as usize
    }
}

/// A codec control call.
///
/// `Reset` and `GetLatency` are understood by every codec; anything else
/// is plugin-specific and travels as an opaque control word plus argument
/// buffer, answered with [`CodecError::NotImplemented`] when the codec
/// does not recognize it.
#[derive(Debug)]
pub enum CodecCtl<'a> {
    /// Reset internal state (stream restart).
    Reset,
    /// Query the codec delay in samples.
    GetLatency(&'a mut i32),
    /// Plugin-specific control word with an opaque argument.
    Other(i32, &'a mut [u8]),
}

/// Block encoder. One instance per stream, owned by the source.
pub trait Encoder: Send {
    /// Encode one block of interleaved samples, appending to `out`.
    fn encode(&mut self, samples: &[f32], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Handle a control call. The default routes the common controls to
    /// [`Encoder::reset`]/[`Encoder::latency`] and rejects the rest.
    fn control(&mut self, ctl: CodecCtl) -> Result<(), CodecError> {
        match ctl {
            CodecCtl::Reset => {
                self.reset();
                Ok(())
            }
            CodecCtl::GetLatency(out) => {
                *out = self.latency();
                Ok(())
            }
            CodecCtl::Other(ctl, _) => {
                log::warn!("unsupported codec control {}", ctl);
                Err(CodecError::NotImplemented)
            }
        }
    }

    /// Reset internal state (stream restart).
    fn reset(&mut self) {}

    /// Codec delay in samples.
    fn latency(&self) -> i32 {
        0
    }
}

/// Block decoder. One instance per remote source, owned by the sink.
pub trait Decoder: Send {
    /// Decode one encoded block into `out` (interleaved). Returns the
    /// number of samples written; the caller zero-fills the remainder.
    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize, CodecError>;

    /// Handle a control call; see [`Encoder::control`].
    fn control(&mut self, ctl: CodecCtl) -> Result<(), CodecError> {
        match ctl {
            CodecCtl::Reset => {
                self.reset();
                Ok(())
            }
            CodecCtl::GetLatency(out) => {
                *out = 0;
                Ok(())
            }
            CodecCtl::Other(ctl, _) => {
                log::warn!("unsupported codec control {}", ctl);
                Err(CodecError::NotImplemented)
            }
        }
    }

    fn reset(&mut self) {}
}

/// A codec implementation, registered by value.
pub struct Codec {
    pub name: &'static str,
    /// Validate a format in place, clamping out-of-range fields.
    pub validate: fn(&mut Format) -> Result<(), CodecError>,
    pub make_encoder: fn(&Format) -> Result<Box<dyn Encoder>, CodecError>,
    pub make_decoder: fn(&Format) -> Result<Box<dyn Decoder>, CodecError>,
    /// Serialize the codec-specific options of a format.
    pub serialize: fn(&Format) -> Result<Vec<u8>, CodecError>,
    /// Reconstruct a full format from the wire header and options blob.
    pub deserialize: fn(&Format, &[u8]) -> Result<Format, CodecError>,
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<&'static str, &'static Codec>> = RwLock::new(HashMap::new());
}

/// Register a codec. Later registrations under the same name win, so hosts
/// can override the built-ins.
pub fn register_codec(codec: &'static Codec) {
    log::debug!("registered codec '{}'", codec.name);
    REGISTRY.write().insert(codec.name, codec);
}

pub fn find_codec(name: &str) -> Option<&'static Codec> {
    REGISTRY.read().get(name).copied()
}

/// Register the built-in codecs. Idempotent; call once before constructing
/// sources or sinks.
pub fn initialize() {
    register_codec(&pcm::CODEC);
    register_codec(&null::CODEC);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        initialize();
        assert!(find_codec("pcm").is_some());
        assert!(find_codec("null").is_some());
        assert!(find_codec("opus").is_none());
    }

    #[test]
    fn test_initialize_idempotent() {
        initialize();
        initialize();
        assert_eq!(find_codec("pcm").unwrap().name, "pcm");
    }
}
