//! Compact binary message format.
//!
//! Audio data frames dominate the traffic of a stream; the textual OSC
//! encoding spends a large fraction of each datagram on the address
//! pattern and type tags. The binary format replaces it with a fixed
//! 4-byte header `[0xAA][type][cmd][flags]` followed by big-endian fields.
//! It is opt-in per endpoint and fully equivalent to the `/data` message.
//!
//! The relay envelope uses the same header with the destination address
//! `(family, addr bytes, port)` in front of the wrapped datagram.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{Id, MsgType, WireError};

/// First byte of every binary AOO message.
pub const BIN_MAGIC: u8 = 0xAA;

/// Header length of a binary message.
pub const BIN_HEADER_SIZE: usize = 4;

/// Worst-case size of a relay envelope header (IPv6 destination).
pub const RELAY_HEADER_SIZE: usize = BIN_HEADER_SIZE + 1 + 16 + 2;

const TYPE_SOURCE: u8 = 0;
const TYPE_SINK: u8 = 1;
const TYPE_RELAY: u8 = 5;

const CMD_DATA: u8 = 0;

const FAMILY_IPV4: u8 = 0;
const FAMILY_IPV6: u8 = 1;

/// True if the buffer starts with the binary magic byte.
pub fn is_binary(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == BIN_MAGIC
}

/// The addressee type of a binary message header.
pub fn message_type(data: &[u8]) -> Option<MsgType> {
    if !is_binary(data) || data.len() < BIN_HEADER_SIZE {
        return None;
    }
    match data[1] {
        TYPE_SOURCE => Some(MsgType::Source),
        TYPE_SINK => Some(MsgType::Sink),
        TYPE_RELAY => Some(MsgType::Relay),
        _ => None,
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

//--------------------------- data message ----------------------------//

/// One audio data frame in binary form.
///
/// Carries the same fields as the OSC `/data` message; parsing either
/// representation of the same frame yields identical values.
#[derive(Debug, Clone, PartialEq)]
pub struct BinDataMsg<'a> {
    pub src_id: Id,
    pub sink_id: Id,
    pub stream_id: Id,
    pub sequence: i32,
    pub sample_rate: f64,
    pub channel: i32,
    pub total_size: i32,
    pub nframes: i32,
    pub frame_index: i32,
    pub payload: &'a [u8],
}

impl<'a> BinDataMsg<'a> {
    pub fn write_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[BIN_MAGIC, TYPE_SINK, CMD_DATA, 0]);
        out.extend_from_slice(&self.src_id.to_be_bytes());
        out.extend_from_slice(&self.sink_id.to_be_bytes());
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.sample_rate.to_be_bytes());
        out.extend_from_slice(&self.channel.to_be_bytes());
        out.extend_from_slice(&self.total_size.to_be_bytes());
        out.extend_from_slice(&self.nframes.to_be_bytes());
        out.extend_from_slice(&self.frame_index.to_be_bytes());
        out.extend_from_slice(self.payload);
    }

    pub fn parse(data: &'a [u8]) -> Result<Self, WireError> {
        if !is_binary(data) || data.len() < BIN_HEADER_SIZE {
            return Err(WireError::Malformed("not a binary message"));
        }
        if data[1] != TYPE_SINK || data[2] != CMD_DATA {
            return Err(WireError::Malformed("not a binary data message"));
        }
        let mut c = Cursor {
            data,
            pos: BIN_HEADER_SIZE,
        };
        let msg = BinDataMsg {
            src_id: c.i32()?,
            sink_id: c.i32()?,
            stream_id: c.i32()?,
            sequence: c.i32()?,
            sample_rate: c.f64()?,
            channel: c.i32()?,
            total_size: c.i32()?,
            nframes: c.i32()?,
            frame_index: c.i32()?,
            payload: &data[c.pos..],
        };
        Ok(msg)
    }
}

//--------------------------- relay envelope --------------------------//

/// Write a relay envelope around `payload`, addressed to `dst`.
pub fn write_relay(out: &mut Vec<u8>, dst: SocketAddr, payload: &[u8]) {
    out.extend_from_slice(&[BIN_MAGIC, TYPE_RELAY, 0, 0]);
    match dst.ip() {
        IpAddr::V4(v4) => {
            out.push(FAMILY_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(FAMILY_IPV6);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&dst.port().to_be_bytes());
    out.extend_from_slice(payload);
}

/// Parse a relay envelope; returns the destination and the wrapped
/// datagram.
pub fn read_relay(data: &[u8]) -> Result<(SocketAddr, &[u8]), WireError> {
    if !is_binary(data) || data.len() < BIN_HEADER_SIZE + 1 {
        return Err(WireError::Malformed("not a binary message"));
    }
    if data[1] != TYPE_RELAY {
        return Err(WireError::Malformed("not a relay message"));
    }
    let mut c = Cursor {
        data,
        pos: BIN_HEADER_SIZE,
    };
    let family = c.take(1)?[0];
    let ip: IpAddr = match family {
        FAMILY_IPV4 => {
            let b: [u8; 4] = c.take(4)?.try_into().unwrap();
            Ipv4Addr::from(b).into()
        }
        FAMILY_IPV6 => {
            let b: [u8; 16] = c.take(16)?.try_into().unwrap();
            Ipv6Addr::from(b).into()
        }
        _ => return Err(WireError::Malformed("bad address family")),
    };
    let port = c.u16()?;
    Ok((SocketAddr::new(ip, port), &data[c.pos..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_roundtrip() {
        let payload = [7u8; 48];
        let msg = BinDataMsg {
            src_id: 3,
            sink_id: 9,
            stream_id: 1234,
            sequence: 5678,
            sample_rate: 47999.5,
            channel: 2,
            total_size: 96,
            nframes: 2,
            frame_index: 1,
            payload: &payload,
        };
        let mut buf = Vec::new();
        msg.write_into(&mut buf);
        assert!(is_binary(&buf));
        assert_eq!(message_type(&buf), Some(MsgType::Sink));

        let parsed = BinDataMsg::parse(&buf).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_relay_roundtrip_v4() {
        let dst: SocketAddr = "10.0.0.2:4321".parse().unwrap();
        let inner = b"inner datagram";
        let mut buf = Vec::new();
        write_relay(&mut buf, dst, inner);
        assert_eq!(message_type(&buf), Some(MsgType::Relay));

        let (addr, payload) = read_relay(&buf).unwrap();
        assert_eq!(addr, dst);
        assert_eq!(payload, inner);
    }

    #[test]
    fn test_relay_roundtrip_v6() {
        let dst: SocketAddr = "[2001:db8::7]:9000".parse().unwrap();
        let mut buf = Vec::new();
        write_relay(&mut buf, dst, &[1, 2, 3]);
        let (addr, payload) = read_relay(&buf).unwrap();
        assert_eq!(addr, dst);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_relay_header_fits_budget() {
        let dst: SocketAddr = "[2001:db8::7]:9000".parse().unwrap();
        let mut buf = Vec::new();
        write_relay(&mut buf, dst, &[]);
        assert!(buf.len() <= RELAY_HEADER_SIZE);
    }

    #[test]
    fn test_truncated_rejected() {
        let dst: SocketAddr = "10.0.0.2:4321".parse().unwrap();
        let mut buf = Vec::new();
        write_relay(&mut buf, dst, b"x");
        assert!(read_relay(&buf[..6]).is_err());
        assert!(BinDataMsg::parse(&buf).is_err());
    }
}
