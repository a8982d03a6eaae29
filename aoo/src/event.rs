//! Event surface of sources and sinks.
//!
//! Events are produced on the network (or audio) threads and polled by the
//! host through an unbounded MPSC channel, so no thread ever blocks on the
//! consumer.

use crossbeam_channel::{unbounded, Receiver, Sender};

use aoo_codec::Format;
use aoo_wire::{Data, Endpoint, Id, NtpTime};

use crate::StreamMessage;

/// Playback state of a remote source at the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No active stream.
    Inactive,
    /// Stream active but the latency buffer is still filling.
    Buffering,
    /// Audio is flowing.
    Playing,
}

/// Events emitted by a [`crate::Source`].
#[derive(Debug)]
pub enum SourceEvent {
    /// A sink answered our ping; carries the three way times.
    Ping {
        ep: Endpoint,
        t1: NtpTime,
        t2: NtpTime,
        t3: NtpTime,
    },
    /// A sink asks to join the stream.
    Invite {
        ep: Endpoint,
        token: Id,
        metadata: Option<Data>,
    },
    /// A sink asks to leave the stream.
    Uninvite { ep: Endpoint, token: Id },
    /// Frames were replayed from history on request.
    FrameResent { ep: Endpoint, count: i32 },
    /// The audio thread fell behind.
    XRun { count: i32 },
}

/// Events emitted by a [`crate::Sink`].
#[derive(Debug)]
pub enum SinkEvent {
    SourceAdd { ep: Endpoint },
    SourceRemove { ep: Endpoint },
    /// An invitation was declined by the source.
    InviteDecline { ep: Endpoint },
    /// An invitation went unanswered.
    InviteTimeout { ep: Endpoint },
    /// A new stream carries a different format.
    FormatChange { ep: Endpoint, format: Format },
    StreamStart {
        ep: Endpoint,
        metadata: Option<Data>,
    },
    StreamStop { ep: Endpoint },
    StreamState { ep: Endpoint, state: StreamState },
    StreamMessage { ep: Endpoint, message: StreamMessage },
    BlockLost { ep: Endpoint, count: i32 },
    BlockReordered { ep: Endpoint, count: i32 },
    BlockResent { ep: Endpoint, count: i32 },
    BlockDropped { ep: Endpoint, count: i32 },
    BlockXRun { ep: Endpoint, count: i32 },
    Ping {
        ep: Endpoint,
        t1: NtpTime,
        t2: NtpTime,
    },
}

/// Unbounded MPSC event queue with a polling consumer.
pub struct EventQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, event: T) {
        // cannot fail: we own both ends
        let _ = self.tx.send(event);
    }

    pub fn available(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn poll<F: FnMut(T)>(&self, mut f: F) {
        while let Ok(e) = self.rx.try_recv() {
            f(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_order() {
        let q = EventQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(q.available());
        let mut out = Vec::new();
        q.poll(|e| out.push(e));
        assert_eq!(out, vec![1, 2, 3]);
        assert!(!q.available());
    }
}
