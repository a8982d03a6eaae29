//! Uncompressed PCM codec.
//!
//! Samples travel in big-endian (network byte order); supported widths are
//! 16-bit and 24-bit signed integer and 32-bit float. The bit depth is the
//! only codec-specific option and is serialized as a single `i32`.

use crate::{Codec, CodecError, Decoder, Encoder, Format};

pub const NAME: &str = "pcm";

/// Sample width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitDepth {
    Int16,
    Int24,
    #[default]
    Float32,
}

impl BitDepth {
    pub fn bytes(&self) -> usize {
        match self {
            BitDepth::Int16 => 2,
            BitDepth::Int24 => 3,
            BitDepth::Float32 => 4,
        }
    }

    fn code(&self) -> i32 {
        match self {
            BitDepth::Int16 => 2,
            BitDepth::Int24 => 3,
            BitDepth::Float32 => 4,
        }
    }

    fn from_code(code: i32) -> Result<Self, CodecError> {
        match code {
            2 => Ok(BitDepth::Int16),
            3 => Ok(BitDepth::Int24),
            4 => Ok(BitDepth::Float32),
            _ => Err(CodecError::BadFormat),
        }
    }
}

/// Build a PCM format with the given bit depth.
pub fn format(num_channels: i32, sample_rate: i32, block_size: i32, depth: BitDepth) -> Format {
    let mut f = Format::new(NAME, num_channels, sample_rate, block_size);
    f.options = depth.code().to_be_bytes().to_vec();
    f
}

fn depth_of(f: &Format) -> Result<BitDepth, CodecError> {
    if f.options.len() != 4 {
        return Err(CodecError::BadFormat);
    }
    BitDepth::from_code(i32::from_be_bytes(f.options[..4].try_into().unwrap()))
}

fn validate(f: &mut Format) -> Result<(), CodecError> {
    if f.codec != NAME {
        return Err(CodecError::BadFormat);
    }
    if f.num_channels < 1 || f.num_channels > 255 {
        log::warn!("pcm: bad channel count {}", f.num_channels);
        return Err(CodecError::BadFormat);
    }
    if f.sample_rate <= 0 || f.block_size <= 0 {
        log::warn!(
            "pcm: bad samplerate {} / blocksize {}",
            f.sample_rate,
            f.block_size
        );
        return Err(CodecError::BadFormat);
    }
    if f.options.is_empty() {
        // default width
        f.options = BitDepth::default().code().to_be_bytes().to_vec();
    } else {
        depth_of(f)?;
    }
    Ok(())
}

struct PcmEncoder {
    depth: BitDepth,
}

impl Encoder for PcmEncoder {
    fn encode(&mut self, samples: &[f32], out: &mut Vec<u8>) -> Result<(), CodecError> {
        match self.depth {
            BitDepth::Int16 => {
                for &s in samples {
                    let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            BitDepth::Int24 => {
                for &s in samples {
                    let v = ((s.clamp(-1.0, 1.0) * 8388607.0) as i32).clamp(-8388608, 8388607);
                    out.push(((v >> 16) & 0xFF) as u8);
                    out.push(((v >> 8) & 0xFF) as u8);
                    out.push((v & 0xFF) as u8);
                }
            }
            BitDepth::Float32 => {
                for &s in samples {
                    out.extend_from_slice(&s.to_be_bytes());
                }
            }
        }
        Ok(())
    }
}

struct PcmDecoder {
    depth: BitDepth,
}

impl Decoder for PcmDecoder {
    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
        let width = self.depth.bytes();
        if data.len() % width != 0 {
            return Err(CodecError::InvalidInput);
        }
        let count = data.len() / width;
        if count > out.len() {
            return Err(CodecError::BufferTooSmall);
        }
        match self.depth {
            BitDepth::Int16 => {
                const SCALE: f32 = 1.0 / 32768.0;
                for i in 0..count {
                    let v = i16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
                    out[i] = v as f32 * SCALE;
                }
            }
            BitDepth::Int24 => {
                const SCALE: f32 = 1.0 / 8388608.0;
                for i in 0..count {
                    let mut v =
                        ((data[i * 3] as i32) << 16) | ((data[i * 3 + 1] as i32) << 8) | data[i * 3 + 2] as i32;
                    // sign extend from 24 bits
                    if v & 0x80_0000 != 0 {
                        v |= 0xFF00_0000u32 as i32;
                    }
                    out[i] = v as f32 * SCALE;
                }
            }
            BitDepth::Float32 => {
                for i in 0..count {
                    out[i] = f32::from_be_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
                }
            }
        }
        Ok(count)
    }
}

fn make_encoder(f: &Format) -> Result<Box<dyn Encoder>, CodecError> {
    Ok(Box::new(PcmEncoder { depth: depth_of(f)? }))
}

fn make_decoder(f: &Format) -> Result<Box<dyn Decoder>, CodecError> {
    Ok(Box::new(PcmDecoder { depth: depth_of(f)? }))
}

fn serialize(f: &Format) -> Result<Vec<u8>, CodecError> {
    depth_of(f)?;
    Ok(f.options.clone())
}

fn deserialize(header: &Format, options: &[u8]) -> Result<Format, CodecError> {
    let mut f = header.clone();
    f.options = options.to_vec();
    validate(&mut f)?;
    Ok(f)
}

pub static CODEC: Codec = Codec {
    name: NAME,
    validate,
    make_encoder,
    make_decoder,
    serialize,
    deserialize,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(depth: BitDepth, tolerance: f32) {
        let f = format(2, 48000, 4, depth);
        let mut enc = make_encoder(&f).unwrap();
        let mut dec = make_decoder(&f).unwrap();

        let input = [0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25, -0.25, 0.125];
        let mut encoded = Vec::new();
        enc.encode(&input, &mut encoded).unwrap();
        assert_eq!(encoded.len(), input.len() * depth.bytes());

        let mut decoded = [0.0f32; 8];
        let n = dec.decode(&encoded, &mut decoded).unwrap();
        assert_eq!(n, input.len());
        for i in 0..input.len() {
            assert!(
                (input[i] - decoded[i]).abs() <= tolerance,
                "sample {}: {} vs {}",
                i,
                input[i],
                decoded[i]
            );
        }
    }

    #[test]
    fn test_int16_roundtrip() {
        roundtrip(BitDepth::Int16, 1.0 / 32768.0);
    }

    #[test]
    fn test_int24_roundtrip() {
        roundtrip(BitDepth::Int24, 1.0 / 8388608.0);
    }

    #[test]
    fn test_float32_roundtrip_exact() {
        roundtrip(BitDepth::Float32, 0.0);
    }

    #[test]
    fn test_format_serialize_roundtrip() {
        let f = format(2, 44100, 256, BitDepth::Int24);
        let options = serialize(&f).unwrap();
        let header = Format::new(NAME, 2, 44100, 256);
        let restored = deserialize(&header, &options).unwrap();
        assert_eq!(restored, f);
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let mut f = Format::new(NAME, 0, 48000, 64);
        assert_eq!(validate(&mut f), Err(CodecError::BadFormat));

        let mut f = Format::new("weird", 2, 48000, 64);
        assert_eq!(validate(&mut f), Err(CodecError::BadFormat));

        // empty options fall back to the default width
        let mut f = Format::new(NAME, 2, 48000, 64);
        validate(&mut f).unwrap();
        assert_eq!(depth_of(&f).unwrap(), BitDepth::default());
    }

    #[test]
    fn test_decode_rejects_ragged_input() {
        let f = format(1, 48000, 4, BitDepth::Int24);
        let mut dec = make_decoder(&f).unwrap();
        let mut out = [0.0f32; 16];
        assert_eq!(dec.decode(&[0u8; 7], &mut out), Err(CodecError::InvalidInput));
    }

    #[test]
    fn test_control() {
        use crate::CodecCtl;

        let f = format(1, 48000, 64, BitDepth::Int16);
        let mut enc = make_encoder(&f).unwrap();
        assert!(enc.control(CodecCtl::Reset).is_ok());
        let mut latency = -1;
        enc.control(CodecCtl::GetLatency(&mut latency)).unwrap();
        assert_eq!(latency, 0);
        // unknown controls are rejected
        let mut arg = [0u8; 4];
        assert_eq!(
            enc.control(CodecCtl::Other(0x7000, &mut arg)),
            Err(CodecError::NotImplemented)
        );

        let mut dec = make_decoder(&f).unwrap();
        assert!(dec.control(CodecCtl::Reset).is_ok());
        assert_eq!(
            dec.control(CodecCtl::Other(0x7000, &mut arg)),
            Err(CodecError::NotImplemented)
        );
    }
}
