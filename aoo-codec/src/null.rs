//! The null codec: encodes to zero bytes and decodes to silence.
//!
//! Useful as a sentinel format and for signalling-only streams; it is
//! always registered.

use crate::{Codec, CodecError, Decoder, Encoder, Format};

pub const NAME: &str = "null";

fn validate(f: &mut Format) -> Result<(), CodecError> {
    if f.codec != NAME {
        return Err(CodecError::BadFormat);
    }
    if f.block_size <= 0 {
        log::warn!("null codec: bad blocksize {}, using 64", f.block_size);
        f.block_size = 64;
    }
    if f.sample_rate <= 0 {
        log::warn!("null codec: bad samplerate {}, using 44100", f.sample_rate);
        f.sample_rate = 44100;
    }
    if f.num_channels < 1 || f.num_channels > 255 {
        log::warn!("null codec: bad channel count {}, using 1", f.num_channels);
        f.num_channels = 1;
    }
    f.options.clear();
    Ok(())
}

struct NullEncoder;

impl Encoder for NullEncoder {
    fn encode(&mut self, _samples: &[f32], _out: &mut Vec<u8>) -> Result<(), CodecError> {
        Ok(())
    }
}

struct NullDecoder;

impl Decoder for NullDecoder {
    fn decode(&mut self, _data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
        out.fill(0.0);
        Ok(out.len())
    }
}

fn make_encoder(_f: &Format) -> Result<Box<dyn Encoder>, CodecError> {
    Ok(Box::new(NullEncoder))
}

fn make_decoder(_f: &Format) -> Result<Box<dyn Decoder>, CodecError> {
    Ok(Box::new(NullDecoder))
}

fn serialize(_f: &Format) -> Result<Vec<u8>, CodecError> {
    Ok(Vec::new())
}

fn deserialize(header: &Format, _options: &[u8]) -> Result<Format, CodecError> {
    let mut f = header.clone();
    f.options.clear();
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

    #[test]
    fn test_encodes_nothing_decodes_silence() {
        let f = Format::new(NAME, 1, 48000, 64);
        let mut enc = make_encoder(&f).unwrap();
        let mut dec = make_decoder(&f).unwrap();

        let mut out = Vec::new();
        enc.encode(&[0.7; 64], &mut out).unwrap();
        assert!(out.is_empty());

        let mut samples = [1.0f32; 64];
        let n = dec.decode(&out, &mut samples).unwrap();
        assert_eq!(n, 64);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_validate_clamps() {
        let mut f = Format::new(NAME, 0, -1, 0);
        validate(&mut f).unwrap();
        assert_eq!(f.num_channels, 1);
        assert_eq!(f.sample_rate, 44100);
        assert_eq!(f.block_size, 64);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut f = Format::new(NAME, 1, 48000, 64);
        validate(&mut f).unwrap();
        let options = serialize(&f).unwrap();
        assert!(options.is_empty());
        let restored = deserialize(&f, &options).unwrap();
        assert_eq!(restored, f);
    }

    #[test]
    fn test_control() {
        use crate::{CodecCtl, CodecError};

        let f = Format::new(NAME, 1, 48000, 64);
        let mut dec = make_decoder(&f).unwrap();
        assert!(dec.control(CodecCtl::Reset).is_ok());
        let mut latency = -1;
        dec.control(CodecCtl::GetLatency(&mut latency)).unwrap();
        assert_eq!(latency, 0);
        let mut arg = [0u8; 4];
        assert_eq!(
            dec.control(CodecCtl::Other(1, &mut arg)),
            Err(CodecError::NotImplemented)
        );
    }
}
