//! TCP message framing.
//!
//! Every message on a TCP session is prefixed with its byte count as a
//! big-endian `i32`. [`MessageReceiver`] reassembles messages from the
//! arbitrary chunks a stream socket delivers.

use crate::{WireError, MAX_PACKET_SIZE};

/// Append `msg` to `out` with the length prefix.
pub fn write_frame(out: &mut Vec<u8>, msg: &[u8]) {
    out.extend_from_slice(&(msg.len() as i32).to_be_bytes());
    out.extend_from_slice(msg);
}

/// Incremental reassembler for length-prefixed messages.
#[derive(Default)]
pub struct MessageReceiver {
    buf: Vec<u8>,
}

impl MessageReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly received bytes and invoke `f` for every complete
    /// message. Leftover bytes are kept for the next call.
    pub fn handle<F>(&mut self, data: &[u8], mut f: F) -> Result<(), WireError>
    where
        F: FnMut(&[u8]) -> Result<(), WireError>,
    {
        self.buf.extend_from_slice(data);
        let mut pos = 0;
        while self.buf.len() - pos >= 4 {
            let size = i32::from_be_bytes(self.buf[pos..pos + 4].try_into().unwrap());
            if size <= 0 || size as usize > MAX_PACKET_SIZE {
                return Err(WireError::Malformed("bad message size"));
            }
            let size = size as usize;
            if self.buf.len() - pos - 4 < size {
                break; // wait for more data
            }
            f(&self.buf[pos + 4..pos + 4 + size])?;
            pos += 4 + size;
        }
        self.buf.drain(..pos);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembly_across_chunks() {
        let mut framed = Vec::new();
        write_frame(&mut framed, b"hello");
        write_frame(&mut framed, b"world!!");

        let mut rx = MessageReceiver::new();
        let mut seen: Vec<Vec<u8>> = Vec::new();
        // deliver byte by byte
        for b in &framed {
            rx.handle(std::slice::from_ref(b), |m| {
                seen.push(m.to_vec());
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(seen, vec![b"hello".to_vec(), b"world!!".to_vec()]);
    }

    #[test]
    fn test_bad_size_rejected() {
        let mut rx = MessageReceiver::new();
        let bogus = (-5i32).to_be_bytes();
        assert!(rx.handle(&bogus, |_| Ok(())).is_err());

        let mut rx = MessageReceiver::new();
        let huge = ((MAX_PACKET_SIZE as i32) + 1).to_be_bytes();
        assert!(rx.handle(&huge, |_| Ok(())).is_err());
    }

    #[test]
    fn test_multiple_messages_one_chunk() {
        let mut framed = Vec::new();
        for i in 0..10u8 {
            write_frame(&mut framed, &[i; 3]);
        }
        let mut rx = MessageReceiver::new();
        let mut count = 0;
        rx.handle(&framed, |m| {
            assert_eq!(m.len(), 3);
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 10);
    }
}
