//! The stream sink: reassembles, conceals and mixes incoming streams.
//!
//! Every remote source gets its own decoder, jitter buffer, ack list and
//! resampler; decoded blocks queue up to the configured latency and the
//! audio thread sums all sources into the output, starting at the channel
//! onset the stream carries.

use std::collections::{BinaryHeap, VecDeque};
use std::cmp::Reverse;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use aoo_codec::{find_codec, Decoder, Format};
use aoo_wire::pattern::{
    MSG_DATA, MSG_INVITE, MSG_MESSAGE, MSG_PING, MSG_PONG, MSG_START, MSG_STOP, MSG_UNINVITE,
};
use aoo_wire::{binmsg, osc::OscMessage, osc::OscWriter, parse_pattern, MsgType};
use aoo_wire::{Data, Endpoint, Id, NtpTime, ID_ALL, ID_INVALID};

use crate::ack::AckList;
use crate::atomic::AtomicF64;
use crate::buffer::{Block, JitterBuffer};
use crate::event::{EventQueue, SinkEvent, StreamState};
use crate::resampler::{ResampleMethod, Resampler};
use crate::time_dll::TimeDll;
use crate::timer::{Tick, Timer};
use crate::{StreamError, StreamMessage, StreamResult};

fn source_address(id: Id, what: &str) -> String {
    format!("/aoo/src/{}{}", id, what)
}

/// One decoded block waiting for the audio thread.
struct DecodedBlock {
    samples: Vec<f32>,
    sample_rate: f64,
    channel: i32,
    /// false for concealment silence
    playing: bool,
}

/// All fields of one incoming data frame, independent of its encoding.
struct DataView<'a> {
    stream_id: Id,
    sequence: i32,
    sample_rate: f64,
    channel: i32,
    total_size: i32,
    nframes: i32,
    frame_index: i32,
    payload: &'a [u8],
}

#[derive(Debug)]
struct Invitation {
    token: Id,
    metadata: Option<Data>,
    start: f64,
    last_sent: f64,
}

/// Message wrapper ordered by time tag for the delivery heap.
#[derive(PartialEq, Eq)]
struct TimedMsg(StreamMessage);

impl Ord for TimedMsg {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.time.cmp(&other.0.time)
    }
}

impl PartialOrd for TimedMsg {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct ResendOpts {
    interval: f64,
    max_frames: i32,
}

/// Per-source state held by the sink.
struct SourceDesc {
    ep: Endpoint,
    stream_id: Id,
    format_id: Id,
    format: Option<Format>,
    decoder: Option<Box<dyn Decoder>>,
    metadata: Option<Data>,
    jitter: JitterBuffer,
    acks: AckList,
    resampler: Resampler,
    queue: VecDeque<DecodedBlock>,
    queue_capacity: usize,
    /// next sequence expected by the playhead; -1 before the first block
    next: i32,
    /// newest sequence seen so far
    newest: i32,
    channel: i32,
    samplerate: f64,
    last_state: StreamState,
    active: bool,
    last_packet: f64,
    invite: Option<Invitation>,
    uninvite: Option<Invitation>,
    /// pending retransmit requests as `(sequence, frame_offset, bitset)`
    retransmit: Vec<(i32, i32, u32)>,
    stream_msgs: BinaryHeap<Reverse<TimedMsg>>,
    decode_buf: Vec<f32>,
    read_buf: Vec<f32>,
}

impl SourceDesc {
    fn new(ep: Endpoint, now: f64) -> Self {
        Self {
            ep,
            stream_id: ID_INVALID,
            format_id: ID_INVALID,
            format: None,
            decoder: None,
            metadata: None,
            jitter: JitterBuffer::new(),
            acks: AckList::new(),
            resampler: Resampler::new(),
            queue: VecDeque::new(),
            queue_capacity: 1,
            next: -1,
            newest: -1,
            channel: 0,
            samplerate: 0.0,
            last_state: StreamState::Inactive,
            active: false,
            last_packet: now,
            invite: None,
            uninvite: None,
            retransmit: Vec::new(),
            stream_msgs: BinaryHeap::new(),
            decode_buf: Vec::new(),
            read_buf: Vec::new(),
        }
    }

    fn block_samples(&self) -> usize {
        self.format.as_ref().map(|f| f.block_samples()).unwrap_or(0)
    }

    /// Reinitialize the pipeline for a new stream format.
    fn update(
        &mut self,
        host_channels: usize,
        host_samplerate: i32,
        host_blocksize: usize,
        buffer_size: f64,
        resend_limit: i32,
        method: ResampleMethod,
    ) {
        let fmt = self.format.as_ref().expect("format");
        let nsamples = fmt.block_samples();
        let blocks =
            ((buffer_size.max(0.0) * fmt.sample_rate as f64 / fmt.block_size as f64).ceil() as usize).max(1);
        self.queue_capacity = blocks;
        self.queue.clear();
        self.jitter.resize(blocks);
        self.acks.setup(resend_limit);
        self.resampler.setup(
            fmt.block_size as usize,
            host_blocksize,
            fmt.sample_rate,
            host_samplerate,
            fmt.num_channels as usize,
            method,
        );
        self.next = -1;
        self.newest = -1;
        self.channel = 0;
        self.samplerate = fmt.sample_rate as f64;
        self.last_state = StreamState::Inactive;
        self.decode_buf = vec![0.0; nsamples];
        self.read_buf = vec![0.0; host_blocksize * fmt.num_channels as usize];
        let _ = host_channels;
        // pre-fill with silence up to the latency target
        while self.queue.len() < self.queue_capacity {
            self.push_silence();
        }
    }

    fn push_silence(&mut self) {
        let nsamples = self.block_samples();
        if nsamples == 0 {
            return;
        }
        self.queue.push_back(DecodedBlock {
            samples: vec![0.0; nsamples],
            sample_rate: self.samplerate,
            channel: 0,
            playing: false,
        });
    }

    /// Decode consecutive complete blocks into the audio queue.
    fn deliver_blocks(&mut self, events: &EventQueue<SinkEvent>) {
        while self.queue.len() < self.queue_capacity {
            let ready = match self.jitter.front() {
                Some(b) => b.is_complete() && b.sequence == self.next,
                None => false,
            };
            if !ready {
                break;
            }
            let block = self.jitter.pop_front().unwrap();
            let decoder = match self.decoder.as_mut() {
                Some(d) => d,
                None => break,
            };
            let nsamples = self.decode_buf.len();
            let written = match decoder.decode(block.data(), &mut self.decode_buf) {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("sink: decode failed: {}", e);
                    events.push(SinkEvent::BlockLost {
                        ep: self.ep.clone(),
                        count: 1,
                    });
                    0
                }
            };
            self.decode_buf[written..nsamples].fill(0.0);
            self.queue.push_back(DecodedBlock {
                samples: self.decode_buf.clone(),
                sample_rate: block.sample_rate,
                channel: block.channel,
                playing: true,
            });
            self.acks.remove(block.sequence);
            self.next += 1;
        }
    }

    /// Walk the gap set and schedule retransmit requests.
    fn request_missing(&mut self, now: f64, opts: &ResendOpts) {
        if self.jitter.is_empty() {
            self.acks.clear();
            return;
        }
        let mut budget = opts.max_frames;

        // incomplete blocks, except the most recent one (frames may still
        // be in flight)
        let len = self.jitter.len();
        let mut requests: Vec<(i32, i32, u32)> = Vec::new();
        for (i, block) in self.jitter.iter().enumerate() {
            if i + 1 == len {
                break;
            }
            if block.is_complete() {
                continue;
            }
            let ack = self.acks.get_or_insert(block.sequence);
            if !ack.check(now, opts.interval) {
                continue;
            }
            let nframes = block.num_frames();
            let mut offset = 0;
            while offset < nframes && budget > 0 {
                let mut bitset = 0u32;
                for bit in 0..16 {
                    let frame = offset + bit;
                    if frame >= nframes {
                        break;
                    }
                    if !block.has_frame(frame) && budget > 0 {
                        bitset |= 1 << bit;
                        budget -= 1;
                    }
                }
                if bitset != 0 {
                    requests.push((block.sequence, offset, bitset));
                }
                offset += 16;
            }
            if budget <= 0 {
                break;
            }
        }

        // whole blocks missing before any held block
        let mut next = self.next;
        let mut whole: Vec<i32> = Vec::new();
        for block in self.jitter.iter() {
            for seq in next..block.sequence {
                whole.push(seq);
            }
            next = block.sequence + 1;
        }
        for seq in whole {
            if budget <= 0 {
                break;
            }
            let ack = self.acks.get_or_insert(seq);
            if ack.check(now, opts.interval) {
                requests.push((seq, -1, 0));
                // conservatively assume a block's worth of frames
                budget -= 1;
            }
        }

        self.retransmit.extend(requests);
        self.acks.remove_before(self.next);
    }
}

enum Request {
    Pong {
        addr: SocketAddr,
        id: Id,
        t1: NtpTime,
        t2: NtpTime,
    },
    /// Ask a source to (re)send its `/start` message.
    Start { addr: SocketAddr, id: Id },
}

struct SinkState {
    nchannels: usize,
    samplerate: i32,
    blocksize: usize,
    dll: TimeDll,
    timer: Timer,
    sources: Vec<SourceDesc>,
    mixbuf: Vec<f32>,
    epoch: Instant,
}

struct Options {
    buffer_size: AtomicF64,
    resend_interval: AtomicF64,
    resend_limit: AtomicI32,
    resend_max_frames: AtomicI32,
    source_timeout: AtomicF64,
    invite_interval: AtomicF64,
    invite_timeout: AtomicF64,
    dll_bandwidth: AtomicF64,
    dynamic_resampling: AtomicBool,
    resample_method: Mutex<ResampleMethod>,
}

/// An AOO stream sink.
pub struct Sink {
    id: Id,
    state: Mutex<SinkState>,
    requests: (Sender<Request>, Receiver<Request>),
    next_token: AtomicI32,
    events: EventQueue<SinkEvent>,
    opts: Options,
}

impl Sink {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            state: Mutex::new(SinkState {
                nchannels: 0,
                samplerate: 0,
                blocksize: 0,
                dll: TimeDll::new(),
                timer: Timer::new(),
                sources: Vec::new(),
                mixbuf: Vec::new(),
                epoch: Instant::now(),
            }),
            requests: unbounded(),
            next_token: AtomicI32::new(0),
            events: EventQueue::new(),
            opts: Options {
                buffer_size: AtomicF64::new(crate::DEFAULT_SINK_BUFFER_SIZE),
                resend_interval: AtomicF64::new(crate::DEFAULT_RESEND_INTERVAL),
                resend_limit: AtomicI32::new(crate::DEFAULT_RESEND_LIMIT),
                resend_max_frames: AtomicI32::new(crate::DEFAULT_RESEND_MAX_FRAMES),
                source_timeout: AtomicF64::new(crate::DEFAULT_SOURCE_TIMEOUT),
                invite_interval: AtomicF64::new(crate::DEFAULT_INVITE_INTERVAL),
                invite_timeout: AtomicF64::new(crate::DEFAULT_INVITE_TIMEOUT),
                dll_bandwidth: AtomicF64::new(crate::DEFAULT_DLL_BANDWIDTH),
                dynamic_resampling: AtomicBool::new(false),
                resample_method: Mutex::new(ResampleMethod::default()),
            },
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Configure the host-side audio format. Idempotent; resets all
    /// per-source pipelines.
    pub fn setup(&self, num_channels: usize, sample_rate: i32, block_size: usize) -> StreamResult<()> {
        if num_channels == 0 || sample_rate <= 0 || block_size == 0 {
            return Err(StreamError::BadArgument("bad audio setup"));
        }
        let mut state = self.state.lock();
        state.nchannels = num_channels;
        state.samplerate = sample_rate;
        state.blocksize = block_size;
        state.mixbuf = vec![0.0; num_channels * block_size];
        state
            .timer
            .setup(block_size as f64 / sample_rate as f64, crate::XRUN_TOLERANCE);
        let buffer_size = self.opts.buffer_size.load();
        let limit = self.opts.resend_limit.load(Ordering::Relaxed);
        let method = *self.opts.resample_method.lock();
        let (nch, sr, bs) = (num_channels, sample_rate, block_size);
        for desc in state.sources.iter_mut() {
            if desc.format.is_some() {
                desc.update(nch, sr, bs, buffer_size, limit, method);
            }
        }
        Ok(())
    }

    pub fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    //--------------------------- invitations -------------------------//

    /// Ask a source to stream to us; retried until answered, declined or
    /// timed out.
    pub fn invite_source(
        &self,
        addr: SocketAddr,
        id: Id,
        metadata: Option<Data>,
    ) -> StreamResult<()> {
        let mut state = self.state.lock();
        let now = state.epoch.elapsed().as_secs_f64();
        let desc = self.find_or_create(&mut state.sources, addr, id, now);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        desc.invite = Some(Invitation {
            token,
            metadata,
            start: now,
            last_sent: -1e9,
        });
        Ok(())
    }

    pub fn uninvite_source(&self, addr: SocketAddr, id: Id) -> StreamResult<()> {
        let mut state = self.state.lock();
        let now = state.epoch.elapsed().as_secs_f64();
        let desc = state
            .sources
            .iter_mut()
            .find(|s| s.ep.matches(&addr, id))
            .ok_or(StreamError::NotFound)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        desc.invite = None;
        desc.uninvite = Some(Invitation {
            token,
            metadata: None,
            start: now,
            last_sent: -1e9,
        });
        Ok(())
    }

    pub fn uninvite_all(&self) {
        let addrs: Vec<(SocketAddr, Id)> = {
            let state = self.state.lock();
            state
                .sources
                .iter()
                .filter(|s| s.active)
                .map(|s| (s.ep.addr, s.ep.id))
                .collect()
        };
        for (addr, id) in addrs {
            let _ = self.uninvite_source(addr, id);
        }
    }

    fn find_or_create<'a>(
        &self,
        sources: &'a mut Vec<SourceDesc>,
        addr: SocketAddr,
        id: Id,
        now: f64,
    ) -> &'a mut SourceDesc {
        let index = match sources.iter().position(|s| s.ep.matches(&addr, id)) {
            Some(i) => i,
            None => {
                let ep = Endpoint::new(addr, id);
                sources.push(SourceDesc::new(ep.clone(), now));
                self.events.push(SinkEvent::SourceAdd { ep });
                sources.len() - 1
            }
        };
        &mut sources[index]
    }

    //--------------------------- audio thread ------------------------//

    /// Mix all sources into one block of non-interleaved output. Must be
    /// called from the audio thread; never blocks. The output is zeroed
    /// first, so underruns produce exact silence.
    pub fn process(&self, output: &mut [&mut [f32]], t: NtpTime) -> StreamResult<()> {
        for channel in output.iter_mut() {
            channel.fill(0.0);
        }
        let mut state = match self.state.try_lock() {
            Some(s) => s,
            None => return Err(StreamError::WouldBlock),
        };
        let s = &mut *state;
        if s.blocksize == 0 {
            return Err(StreamError::NotSetup);
        }
        if output.len() != s.nchannels || output.iter().any(|c| c.len() != s.blocksize) {
            return Err(StreamError::BadArgument("output layout mismatch"));
        }

        match s.timer.update(t) {
            Tick::First => {
                s.dll.setup(
                    s.samplerate as f64,
                    s.blocksize as i32,
                    self.opts.dll_bandwidth.load(),
                    0.0,
                );
            }
            Tick::Ok(_) => s.dll.update(s.timer.elapsed()),
            Tick::XRun(blocks) => {
                let count = blocks.ceil() as i32;
                for desc in s.sources.iter() {
                    if desc.active {
                        self.events.push(SinkEvent::BlockXRun {
                            ep: desc.ep.clone(),
                            count,
                        });
                    }
                }
                s.dll.setup(
                    s.samplerate as f64,
                    s.blocksize as i32,
                    self.opts.dll_bandwidth.load(),
                    s.timer.elapsed(),
                );
            }
        }

        s.mixbuf.fill(0.0);
        let dynamic = self.opts.dynamic_resampling.load(Ordering::Relaxed);
        let real_rate = if dynamic {
            s.dll.sample_rate()
        } else {
            s.samplerate as f64
        };
        let host_channels = s.nchannels;
        let host_blocksize = s.blocksize;
        let SinkState {
            sources, mixbuf, ..
        } = s;

        for desc in sources.iter_mut() {
            let stream_channels = match desc.format.as_ref() {
                Some(f) => f.num_channels as usize,
                None => continue,
            };
            // move decoded blocks into the resampler
            loop {
                let fits = desc
                    .queue
                    .front()
                    .map(|b| desc.resampler.write_available() >= b.samples.len())
                    .unwrap_or(false);
                if !fits {
                    break;
                }
                let block = desc.queue.pop_front().unwrap();
                desc.channel = block.channel;
                desc.samplerate = block.sample_rate;
                desc.resampler.write(&block.samples);
                let new_state = if block.playing {
                    StreamState::Playing
                } else {
                    StreamState::Buffering
                };
                if new_state != desc.last_state {
                    desc.last_state = new_state;
                    self.events.push(SinkEvent::StreamState {
                        ep: desc.ep.clone(),
                        state: new_state,
                    });
                }
            }

            desc.resampler.update(desc.samplerate, real_rate);

            let readsamples = host_blocksize * stream_channels;
            if desc.read_buf.len() < readsamples {
                desc.read_buf.resize(readsamples, 0.0);
            }
            if desc.resampler.read_available() >= readsamples {
                let read_buf = &mut desc.read_buf[..readsamples];
                desc.resampler.read(read_buf);
                // sum into the mix, mapping stream channels onto sink
                // channels at the configured onset; out-of-range channels
                // are silently dropped
                for i in 0..stream_channels {
                    let chn = i + desc.channel.max(0) as usize;
                    if chn >= host_channels {
                        continue;
                    }
                    for j in 0..host_blocksize {
                        mixbuf[chn * host_blocksize + j] += read_buf[j * stream_channels + i];
                    }
                }
            } else if desc.active && desc.last_state == StreamState::Playing {
                desc.last_state = StreamState::Buffering;
                self.events.push(SinkEvent::StreamState {
                    ep: desc.ep.clone(),
                    state: StreamState::Buffering,
                });
            }

            // deliver due stream messages in time order
            while desc
                .stream_msgs
                .peek()
                .map(|Reverse(m)| m.0.time <= t)
                .unwrap_or(false)
            {
                let Reverse(TimedMsg(message)) = desc.stream_msgs.pop().unwrap();
                self.events.push(SinkEvent::StreamMessage {
                    ep: desc.ep.clone(),
                    message,
                });
            }
        }

        for (i, channel) in output.iter_mut().enumerate() {
            channel.copy_from_slice(&mixbuf[i * host_blocksize..(i + 1) * host_blocksize]);
        }
        Ok(())
    }

    //--------------------------- network send ------------------------//

    /// Flush pending replies, retransmit requests and invitations.
    pub fn send<F: FnMut(&[u8], SocketAddr)>(&self, mut send_fn: F) -> StreamResult<()> {
        while let Ok(r) = self.requests.1.try_recv() {
            match r {
                Request::Pong { addr, id, t1, t2 } => {
                    let mut w = OscWriter::new(source_address(id, MSG_PONG));
                    w.int32(self.id).time(t1).time(t2);
                    send_fn(&w.to_bytes(), addr);
                }
                Request::Start { addr, id } => {
                    let mut w = OscWriter::new(source_address(id, MSG_START));
                    w.int32(self.id);
                    send_fn(&w.to_bytes(), addr);
                }
            }
        }

        let mut state = self.state.lock();
        let s = &mut *state;
        let now = s.epoch.elapsed().as_secs_f64();
        let invite_interval = self.opts.invite_interval.load();
        let invite_timeout = self.opts.invite_timeout.load();
        let source_timeout = self.opts.source_timeout.load();

        for desc in s.sources.iter_mut() {
            // selective retransmission requests
            if desc.active && !desc.retransmit.is_empty() {
                let mut w = OscWriter::new(source_address(desc.ep.id, MSG_DATA));
                w.int32(self.id).int32(desc.stream_id);
                for &(seq, offset, bitset) in desc.retransmit.iter() {
                    w.int32(seq).int32(offset).int32(bitset as i32);
                }
                send_fn(&w.to_bytes(), desc.ep.addr);
                desc.retransmit.clear();
            }

            // invitation state machine
            let mut invite_expired = false;
            if let Some(invite) = desc.invite.as_mut() {
                if now - invite.start > invite_timeout {
                    invite_expired = true;
                } else if now - invite.last_sent >= invite_interval {
                    invite.last_sent = now;
                    let mut w = OscWriter::new(source_address(desc.ep.id, MSG_INVITE));
                    w.int32(self.id)
                        .int32(invite.token)
                        .metadata(invite.metadata.as_ref());
                    send_fn(&w.to_bytes(), desc.ep.addr);
                }
            }
            if invite_expired {
                desc.invite = None;
                self.events.push(SinkEvent::InviteTimeout {
                    ep: desc.ep.clone(),
                });
            }
            let mut uninvite_expired = false;
            if let Some(uninvite) = desc.uninvite.as_mut() {
                if now - uninvite.start > invite_timeout {
                    uninvite_expired = true;
                } else if now - uninvite.last_sent >= invite_interval {
                    uninvite.last_sent = now;
                    let mut w = OscWriter::new(source_address(desc.ep.id, MSG_UNINVITE));
                    w.int32(self.id).int32(uninvite.token);
                    send_fn(&w.to_bytes(), desc.ep.addr);
                }
            }
            if uninvite_expired {
                desc.uninvite = None;
            }
        }

        // drop sources that went silent
        let events = &self.events;
        s.sources.retain(|desc| {
            let alive = now - desc.last_packet < source_timeout;
            if !alive {
                log::debug!("sink: source {} timed out", desc.ep);
                events.push(SinkEvent::SourceRemove {
                    ep: desc.ep.clone(),
                });
            }
            alive
        });
        Ok(())
    }

    //--------------------------- network receive ---------------------//

    /// Parse one incoming datagram and dispatch it.
    pub fn handle_message(&self, data: &[u8], from: SocketAddr) -> StreamResult<()> {
        if binmsg::is_binary(data) {
            let msg = binmsg::BinDataMsg::parse(data)?;
            if msg.sink_id != self.id && msg.sink_id != ID_ALL {
                log::warn!("sink {}: binary message for wrong id {}", self.id, msg.sink_id);
                return Ok(());
            }
            let view = DataView {
                stream_id: msg.stream_id,
                sequence: msg.sequence,
                sample_rate: msg.sample_rate,
                channel: msg.channel,
                total_size: msg.total_size,
                nframes: msg.nframes,
                frame_index: msg.frame_index,
                payload: msg.payload,
            };
            return self.handle_data(msg.src_id, from, &view);
        }
        let msg = OscMessage::parse(data)?;
        let (msg_type, id, offset) = parse_pattern(msg.address())?;
        if msg_type != MsgType::Sink {
            return Err(StreamError::BadArgument("not a sink message"));
        }
        if id != self.id && id != ID_ALL {
            log::warn!("sink {}: message for wrong id {}", self.id, id);
            return Ok(());
        }
        let pattern = &msg.address()[offset..];
        match pattern {
            MSG_START => self.handle_start(&msg, from),
            MSG_STOP => self.handle_stop(&msg, from),
            MSG_DATA => self.handle_data_osc(&msg, from),
            MSG_PING => self.handle_ping(&msg, from),
            MSG_UNINVITE => self.handle_uninvite(&msg, from),
            MSG_MESSAGE => self.handle_stream_message(&msg, from),
            _ => {
                log::warn!("sink {}: unknown message '{}'", self.id, pattern);
                Ok(())
            }
        }
    }

    /// `/start` establishes (or refreshes) a stream and its format.
    fn handle_start(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let src_id = args.int32()?;
        let stream_id = args.int32()?;
        let format_id = args.int32()?;
        let _sample_offset = args.int32()?;
        let num_channels = args.int32()?;
        let sample_rate = args.int32()?;
        let block_size = args.int32()?;
        let codec_name = args.string()?.to_string();
        let options = args.blob()?.to_vec();
        let metadata = args.metadata()?;

        let codec = match find_codec(&codec_name) {
            Some(c) => c,
            None => {
                log::warn!("sink {}: unsupported codec '{}'", self.id, codec_name);
                return Ok(());
            }
        };
        let header = Format {
            codec: codec_name,
            num_channels,
            sample_rate,
            block_size,
            options: Vec::new(),
        };
        let format = (codec.deserialize)(&header, &options)?;

        let mut state = self.state.lock();
        let s = &mut *state;
        let now = s.epoch.elapsed().as_secs_f64();
        let (host_nch, host_sr, host_bs) = (s.nchannels, s.samplerate, s.blocksize);
        let desc = self.find_or_create(&mut s.sources, from, src_id, now);
        desc.last_packet = now;

        if desc.active && desc.stream_id == stream_id && desc.format_id == format_id {
            return Ok(()); // duplicate /start
        }

        let format_changed = desc.format.as_ref() != Some(&format);
        if format_changed {
            desc.decoder = Some((codec.make_decoder)(&format)?);
            desc.format = Some(format.clone());
            self.events.push(SinkEvent::FormatChange {
                ep: desc.ep.clone(),
                format,
            });
        }
        desc.stream_id = stream_id;
        desc.format_id = format_id;
        desc.metadata = metadata.clone();
        desc.active = true;
        desc.invite = None; // invitation accepted
        desc.update(
            host_nch,
            host_sr,
            host_bs,
            self.opts.buffer_size.load(),
            self.opts.resend_limit.load(Ordering::Relaxed),
            *self.opts.resample_method.lock(),
        );
        self.events.push(SinkEvent::StreamStart {
            ep: desc.ep.clone(),
            metadata,
        });
        log::debug!("sink {}: new stream {} from {}", self.id, stream_id, desc.ep);
        Ok(())
    }

    fn handle_stop(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let src_id = args.int32()?;
        let stream_id = args.int32()?;
        let mut state = self.state.lock();
        let s = &mut *state;
        let now = s.epoch.elapsed().as_secs_f64();
        let desc = match s.sources.iter_mut().find(|d| d.ep.matches(&from, src_id)) {
            Some(d) => d,
            None => return Ok(()),
        };
        desc.last_packet = now;
        if !desc.active || desc.stream_id != stream_id {
            return Ok(());
        }
        // deliver whatever is already complete, then drop the rest
        desc.deliver_blocks(&self.events);
        desc.jitter.clear();
        desc.acks.clear();
        desc.retransmit.clear();
        desc.active = false;
        desc.uninvite = None;
        self.events.push(SinkEvent::StreamStop {
            ep: desc.ep.clone(),
        });
        Ok(())
    }

    fn handle_data_osc(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let src_id = args.int32()?;
        let view = DataView {
            stream_id: args.int32()?,
            sequence: args.int32()?,
            sample_rate: args.double()?,
            channel: args.int32()?,
            total_size: args.int32()?,
            nframes: args.int32()?,
            frame_index: args.int32()?,
            payload: args.blob()?,
        };
        self.handle_data(src_id, from, &view)
    }

    /// The receive path of §"data": stream check, jitter insertion, frame
    /// fill, playhead advance, gap bookkeeping.
    fn handle_data(&self, src_id: Id, from: SocketAddr, d: &DataView) -> StreamResult<()> {
        if d.nframes <= 0
            || d.nframes as usize > crate::buffer::MAX_FRAMES_PER_BLOCK
            || d.frame_index < 0
            || d.frame_index >= d.nframes
            || d.total_size < 0
        {
            return Err(StreamError::BadArgument("bad data header"));
        }
        let mut state = self.state.lock();
        let s = &mut *state;
        let now = s.epoch.elapsed().as_secs_f64();
        let desc = self.find_or_create(&mut s.sources, from, src_id, now);
        desc.last_packet = now;

        if !desc.active || d.stream_id != desc.stream_id {
            // unknown or changed stream: ask for /start and drop the data
            let _ = self.requests.0.send(Request::Start {
                addr: from,
                id: src_id,
            });
            return Ok(());
        }
        if desc.decoder.is_none() {
            return Ok(());
        }

        if desc.next < 0 {
            desc.next = d.sequence;
        }
        if d.sequence < desc.next {
            log::debug!("sink {}: discard old block {}", self.id, d.sequence);
            return Ok(());
        }
        if desc.newest >= 0 && d.sequence < desc.newest {
            if desc.acks.requested(d.sequence) {
                self.events.push(SinkEvent::BlockResent {
                    ep: desc.ep.clone(),
                    count: 1,
                });
            } else {
                self.events.push(SinkEvent::BlockReordered {
                    ep: desc.ep.clone(),
                    count: 1,
                });
            }
        }

        // a gap larger than the buffer: flush and restart from here
        if desc.newest >= 0 && d.sequence - desc.newest > desc.jitter.capacity() as i32 {
            let skipped = d.sequence - desc.newest - 1;
            desc.jitter.clear();
            desc.acks.clear();
            desc.next = d.sequence;
            while desc.queue.len() < desc.queue_capacity {
                desc.push_silence();
            }
            self.events.push(SinkEvent::BlockLost {
                ep: desc.ep.clone(),
                count: skipped,
            });
        }

        let exists = desc.jitter.find(d.sequence).is_some();
        if !exists {
            if desc.jitter.is_full() {
                // evict the oldest block and conceal it with silence
                if let Some(old) = desc.jitter.pop_front() {
                    desc.acks.remove(old.sequence);
                    if desc.queue.len() < desc.queue_capacity {
                        desc.push_silence();
                    }
                    if desc.next <= old.sequence {
                        desc.next = old.sequence + 1;
                    }
                    self.events.push(SinkEvent::BlockDropped {
                        ep: desc.ep.clone(),
                        count: 1,
                    });
                }
            }
            desc.jitter.insert(Block::incomplete(
                d.sequence,
                d.sample_rate,
                d.channel,
                d.total_size as usize,
                d.nframes,
            ));
        }
        let block = desc.jitter.find(d.sequence).unwrap();
        if block.has_frame(d.frame_index) {
            log::debug!(
                "sink {}: duplicate frame {} of block {}",
                self.id,
                d.frame_index,
                d.sequence
            );
            return Ok(());
        }
        block.add_frame(d.frame_index, d.payload);

        if d.sequence > desc.newest {
            desc.newest = d.sequence;
        }

        desc.deliver_blocks(&self.events);

        // age out blocks that fell behind the window
        let mut lost = 0;
        while desc
            .jitter
            .front()
            .map(|b| desc.newest - b.sequence >= desc.jitter.capacity() as i32)
            .unwrap_or(false)
        {
            let old = desc.jitter.pop_front().unwrap();
            desc.acks.remove(old.sequence);
            if desc.next <= old.sequence {
                desc.next = old.sequence + 1;
            }
            lost += 1;
        }
        if lost > 0 {
            self.events.push(SinkEvent::BlockLost {
                ep: desc.ep.clone(),
                count: lost,
            });
        }

        let opts = ResendOpts {
            interval: self.opts.resend_interval.load(),
            max_frames: self.opts.resend_max_frames.load(Ordering::Relaxed).max(1),
        };
        desc.request_missing(now, &opts);
        Ok(())
    }

    fn handle_ping(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let src_id = args.int32()?;
        let t1 = args.time()?;
        let t2 = NtpTime::now();
        {
            let mut state = self.state.lock();
            let now = state.epoch.elapsed().as_secs_f64();
            if let Some(desc) = state.sources.iter_mut().find(|d| d.ep.matches(&from, src_id)) {
                desc.last_packet = now;
            }
        }
        self.events.push(SinkEvent::Ping {
            ep: Endpoint::new(from, src_id),
            t1,
            t2,
        });
        let _ = self.requests.0.send(Request::Pong {
            addr: from,
            id: src_id,
            t1,
            t2,
        });
        Ok(())
    }

    /// The source declined our invitation (or kicked us out).
    fn handle_uninvite(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let src_id = args.int32()?;
        let _token = args.int32()?;
        let mut state = self.state.lock();
        if let Some(desc) = state.sources.iter_mut().find(|d| d.ep.matches(&from, src_id)) {
            if desc.invite.take().is_some() {
                self.events.push(SinkEvent::InviteDecline {
                    ep: desc.ep.clone(),
                });
            }
        }
        Ok(())
    }

    fn handle_stream_message(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let src_id = args.int32()?;
        let stream_id = args.int32()?;
        let time = args.time()?;
        let channel = args.int32()?;
        let kind = args.int32()?;
        let data = args.blob()?.to_vec();
        let mut state = self.state.lock();
        let s = &mut *state;
        let now = s.epoch.elapsed().as_secs_f64();
        if let Some(desc) = s.sources.iter_mut().find(|d| d.ep.matches(&from, src_id)) {
            desc.last_packet = now;
            if desc.active && desc.stream_id == stream_id {
                desc.stream_msgs.push(Reverse(TimedMsg(StreamMessage {
                    time,
                    channel,
                    kind,
                    data,
                })));
            }
        }
        Ok(())
    }

    //--------------------------- events ------------------------------//

    pub fn events_available(&self) -> bool {
        self.events.available()
    }

    pub fn poll_events<F: FnMut(SinkEvent)>(&self, f: F) {
        self.events.poll(f)
    }

    //--------------------------- options -----------------------------//

    /// Sink latency: jitter buffer depth in seconds.
    pub fn set_buffer_size(&self, seconds: f64) {
        self.opts.buffer_size.store(seconds.max(0.0));
    }

    pub fn set_resend_interval(&self, seconds: f64) {
        self.opts.resend_interval.store(seconds.max(0.0));
    }

    pub fn set_resend_limit(&self, limit: i32) {
        self.opts.resend_limit.store(limit.max(0), Ordering::Relaxed);
    }

    pub fn set_resend_max_frames(&self, frames: i32) {
        self.opts.resend_max_frames.store(frames.max(1), Ordering::Relaxed);
    }

    pub fn set_source_timeout(&self, seconds: f64) {
        self.opts.source_timeout.store(seconds.max(0.0));
    }

    pub fn set_invite_interval(&self, seconds: f64) {
        self.opts.invite_interval.store(seconds.max(0.0));
    }

    pub fn set_invite_timeout(&self, seconds: f64) {
        self.opts.invite_timeout.store(seconds.max(0.0));
    }

    pub fn set_dll_bandwidth(&self, bandwidth: f64) {
        self.opts.dll_bandwidth.store(bandwidth.clamp(0.0, 1.0));
    }

    pub fn set_dynamic_resampling(&self, enabled: bool) {
        self.opts.dynamic_resampling.store(enabled, Ordering::Relaxed);
    }

    pub fn set_resample_method(&self, method: ResampleMethod) {
        *self.opts.resample_method.lock() = method;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use aoo_codec::pcm;

    const SR: i32 = 48000;
    const BS: usize = 64;
    const PERIOD: f64 = BS as f64 / SR as f64;
    const T0: f64 = 3_900_000_000.0;

    struct Pair {
        source: Source,
        sink: Sink,
        src_addr: SocketAddr,
        sink_addr: SocketAddr,
    }

    fn make_pair(depth: pcm::BitDepth, binary: bool) -> Pair {
        aoo_codec::initialize();
        let src_addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let sink_addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let source = Source::new(1);
        source.setup(2, SR, BS).unwrap();
        source.set_binary_format(binary);
        source.set_packet_size(1400);
        let mut fmt = pcm::format(2, SR, BS as i32, depth);
        source.set_format(&mut fmt).unwrap();
        source.add_sink(sink_addr, 7, true).unwrap();

        let sink = Sink::new(7);
        sink.setup(2, SR, BS).unwrap();
        // 3 blocks of latency
        sink.set_buffer_size(0.004);

        Pair {
            source,
            sink,
            src_addr,
            sink_addr,
        }
    }

    fn input_value(tick: usize) -> f32 {
        (tick + 1) as f32 * 0.001
    }

    fn is_data_message(data: &[u8]) -> bool {
        binmsg::is_binary(data)
            || OscMessage::parse(data)
                .map(|m| m.address().ends_with(MSG_DATA))
                .unwrap_or(false)
    }

    /// Drive one block through the whole pipeline and return the sink
    /// output. `drop_data` simulates datagram loss for data frames.
    fn tick(p: &Pair, k: usize, drop_data: bool) -> (Vec<f32>, Vec<f32>) {
        let t = NtpTime::from_seconds(T0 + k as f64 * PERIOD);
        let value = input_value(k);
        let ch0 = vec![value; BS];
        let ch1 = vec![-value; BS];
        p.source.process(&[ch0.as_slice(), ch1.as_slice()], t).unwrap();
        p.source
            .send(|data, addr| {
                assert_eq!(addr, p.sink_addr);
                if !(drop_data && is_data_message(data)) {
                    p.sink.handle_message(data, p.src_addr).unwrap();
                }
            })
            .unwrap();

        let mut out0 = vec![0.0f32; BS];
        let mut out1 = vec![0.0f32; BS];
        {
            let mut output: Vec<&mut [f32]> = vec![out0.as_mut_slice(), out1.as_mut_slice()];
            p.sink.process(&mut output, t).unwrap();
        }
        p.sink
            .send(|data, addr| {
                assert_eq!(addr, p.src_addr);
                p.source.handle_message(data, p.sink_addr).unwrap();
            })
            .unwrap();
        (out0, out1)
    }

    fn drain_sink_events(sink: &Sink) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        sink.poll_events(|e| events.push(e));
        events
    }

    fn count<F: Fn(&SinkEvent) -> bool>(events: &[SinkEvent], f: F) -> usize {
        events.iter().filter(|e| f(e)).count()
    }

    #[test]
    fn test_lossless_echo() {
        for binary in [true, false] {
            let p = make_pair(pcm::BitDepth::Float32, binary);
            p.source.start_stream(0, None).unwrap();

            let outs: Vec<_> = (0..50).map(|k| tick(&p, k, false)).collect();

            // the first blocks are the latency buffer
            for (k, (o0, _)) in outs.iter().take(3).enumerate() {
                assert!(o0.iter().all(|&v| v == 0.0), "block {} not silent", k);
            }
            // afterwards the output replays the input with fixed latency
            for (k, (o0, o1)) in outs.iter().enumerate().skip(3) {
                let expect = input_value(k - 3);
                assert!(o0.iter().all(|&v| v == expect), "block {} wrong", k);
                assert!(o1.iter().all(|&v| v == -expect), "block {} wrong", k);
            }

            let events = drain_sink_events(&p.sink);
            assert_eq!(count(&events, |e| matches!(e, SinkEvent::SourceAdd { .. })), 1);
            assert_eq!(count(&events, |e| matches!(e, SinkEvent::StreamStart { .. })), 1);
            assert_eq!(count(&events, |e| matches!(e, SinkEvent::FormatChange { .. })), 1);
            assert_eq!(count(&events, |e| matches!(e, SinkEvent::BlockLost { .. })), 0);
            assert_eq!(count(&events, |e| matches!(e, SinkEvent::BlockReordered { .. })), 0);
            // buffering first, then playing
            let states: Vec<_> = events
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::StreamState { state, .. } => Some(*state),
                    _ => None,
                })
                .collect();
            assert_eq!(states, vec![StreamState::Buffering, StreamState::Playing]);
        }
    }

    #[test]
    fn test_reorder_within_window() {
        let p = make_pair(pcm::BitDepth::Float32, false);
        // no resending, so a late block counts as reordered
        p.sink.set_resend_limit(0);
        p.source.start_stream(0, None).unwrap();

        // capture five blocks without delivering them
        let mut start_msgs: Vec<Vec<u8>> = Vec::new();
        let mut data_msgs: Vec<Vec<u8>> = Vec::new();
        for k in 0..5 {
            let t = NtpTime::from_seconds(T0 + k as f64 * PERIOD);
            let value = input_value(k);
            let ch0 = vec![value; BS];
            let ch1 = vec![-value; BS];
            p.source.process(&[ch0.as_slice(), ch1.as_slice()], t).unwrap();
            p.source
                .send(|data, _| {
                    if is_data_message(data) {
                        data_msgs.push(data.to_vec());
                    } else {
                        start_msgs.push(data.to_vec());
                    }
                })
                .unwrap();
        }
        assert_eq!(data_msgs.len(), 5);

        for msg in &start_msgs {
            p.sink.handle_message(msg, p.src_addr).unwrap();
        }
        // deliver sequences {0, 1, 3, 2, 4}
        let mut outputs: Vec<f32> = Vec::new();
        let mut process = |k: usize| {
            let mut out0 = vec![0.0f32; BS];
            let mut out1 = vec![0.0f32; BS];
            let mut output: Vec<&mut [f32]> = vec![out0.as_mut_slice(), out1.as_mut_slice()];
            p.sink
                .process(&mut output, NtpTime::from_seconds(T0 + k as f64 * PERIOD))
                .unwrap();
            if out0[0] != 0.0 {
                outputs.push(out0[0]);
            }
        };
        for (i, &index) in [0usize, 1, 3, 2, 4].iter().enumerate() {
            p.sink.handle_message(&data_msgs[index], p.src_addr).unwrap();
            process(i);
        }
        for i in 5..12 {
            process(i);
        }

        // decoded strictly in order
        let expected: Vec<f32> = (0..5).map(input_value).collect();
        assert_eq!(outputs, expected);

        let events = drain_sink_events(&p.sink);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::BlockReordered { .. })), 1);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::BlockResent { .. })), 0);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::BlockLost { .. })), 0);
    }

    #[test]
    fn test_retransmission_recovers_loss() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        p.source.start_stream(0, None).unwrap();

        let outs: Vec<_> = (0..30).map(|k| tick(&p, k, k == 2)).collect();

        // the lost block was requested and replayed before its deadline,
        // so the output is still gapless
        for (k, (o0, _)) in outs.iter().enumerate().skip(3) {
            let expect = input_value(k - 3);
            assert!(o0.iter().all(|&v| v == expect), "block {} wrong", k);
        }

        let events = drain_sink_events(&p.sink);
        assert!(count(&events, |e| matches!(e, SinkEvent::BlockResent { .. })) >= 1);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::BlockLost { .. })), 0);

        let mut resent_frames = 0;
        p.source.poll_events(|e| {
            if let crate::SourceEvent::FrameResent { count, .. } = e {
                resent_frames += count;
            }
        });
        assert!(resent_frames >= 1);
    }

    #[test]
    fn test_format_change_restarts_stream() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        p.source.start_stream(0, None).unwrap();
        for k in 0..10 {
            tick(&p, k, false);
        }

        let mut fmt = pcm::format(2, SR, BS as i32, pcm::BitDepth::Int16);
        p.source.set_format(&mut fmt).unwrap();

        let outs: Vec<_> = (10..30).map(|k| tick(&p, k, false)).collect();

        // the restart flushes the latency buffer: silence, then the new
        // stream with no samples of the old one crossing the boundary
        for (i, (o0, _)) in outs.iter().take(3).enumerate() {
            assert!(o0.iter().all(|&v| v == 0.0), "block {} not silent", i + 10);
        }
        for (i, (o0, _)) in outs.iter().enumerate().skip(3) {
            let k = i + 10;
            let expect = input_value(k - 3);
            // 16 bit quantization
            assert!(
                o0.iter().all(|&v| (v - expect).abs() < 1e-3),
                "block {} wrong: {} vs {}",
                k,
                o0[0],
                expect
            );
        }

        let events = drain_sink_events(&p.sink);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::StreamStart { .. })), 2);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::FormatChange { .. })), 2);
    }

    #[test]
    fn test_stop_stream() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        p.source.start_stream(0, None).unwrap();
        for k in 0..5 {
            tick(&p, k, false);
        }
        assert!(p.source.is_running());
        p.source.stop_stream(0).unwrap();
        for k in 5..10 {
            tick(&p, k, false);
        }
        assert!(!p.source.is_running());

        let events = drain_sink_events(&p.sink);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::StreamStop { .. })), 1);

        // stopping again is an error
        assert!(matches!(p.source.stop_stream(0), Err(StreamError::Idle)));
    }

    #[test]
    fn test_invite_accept() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        // fresh sink side relationship: drop the preconfigured one
        p.source.remove_all();

        p.sink.invite_source(p.src_addr, 1, None).unwrap();
        p.sink
            .send(|data, addr| {
                assert_eq!(addr, p.src_addr);
                p.source.handle_message(data, p.sink_addr).unwrap();
            })
            .unwrap();

        let mut invite = None;
        p.source.poll_events(|e| {
            if let crate::SourceEvent::Invite { ep, token, .. } = e {
                invite = Some((ep, token));
            }
        });
        let (ep, token) = invite.expect("invite event");
        p.source.handle_invite(ep.addr, ep.id, token, true).unwrap();

        p.source.start_stream(0, None).unwrap();
        for k in 0..10 {
            tick(&p, k, false);
        }
        let events = drain_sink_events(&p.sink);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::StreamStart { .. })), 1);
        // invitation answered, no timeout
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::InviteTimeout { .. })), 0);
    }

    #[test]
    fn test_invite_decline() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        p.source.remove_all();

        p.sink.invite_source(p.src_addr, 1, None).unwrap();
        p.sink
            .send(|data, _| {
                p.source.handle_message(data, p.sink_addr).unwrap();
            })
            .unwrap();

        let mut invite = None;
        p.source.poll_events(|e| {
            if let crate::SourceEvent::Invite { ep, token, .. } = e {
                invite = Some((ep, token));
            }
        });
        let (ep, token) = invite.expect("invite event");
        p.source.handle_invite(ep.addr, ep.id, token, false).unwrap();
        p.source
            .send(|data, _| {
                p.sink.handle_message(data, p.src_addr).unwrap();
            })
            .unwrap();

        let events = drain_sink_events(&p.sink);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::InviteDecline { .. })), 1);
    }

    #[test]
    fn test_invite_timeout() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        p.source.remove_all();
        p.sink.set_invite_timeout(0.0);
        p.sink.invite_source(p.src_addr, 1, None).unwrap();
        // nobody answers
        p.sink.send(|_, _| {}).unwrap();
        p.sink.send(|_, _| {}).unwrap();
        let events = drain_sink_events(&p.sink);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::InviteTimeout { .. })), 1);
    }

    #[test]
    fn test_stream_message_delivery() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        p.source.start_stream(0, None).unwrap();
        for k in 0..3 {
            tick(&p, k, false);
        }
        // two messages with inverted submission order arrive in time order
        let later = StreamMessage {
            time: NtpTime::from_seconds(T0 + 2.0 * PERIOD),
            channel: 1,
            kind: 42,
            data: b"later".to_vec(),
        };
        let earlier = StreamMessage {
            time: NtpTime::from_seconds(T0 + PERIOD),
            channel: 0,
            kind: 42,
            data: b"earlier".to_vec(),
        };
        p.source.add_stream_message(later).unwrap();
        p.source.add_stream_message(earlier).unwrap();
        for k in 3..6 {
            tick(&p, k, false);
        }
        let events = drain_sink_events(&p.sink);
        let messages: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::StreamMessage { message, .. } => Some(message.data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec![b"earlier".to_vec(), b"later".to_vec()]);
    }

    #[test]
    fn test_codec_control_forwarding() {
        use aoo_codec::{CodecCtl, CodecError};

        let p = make_pair(pcm::BitDepth::Float32, true);
        let mut latency = -1;
        p.source
            .codec_control(CodecCtl::GetLatency(&mut latency))
            .unwrap();
        assert_eq!(latency, 0);
        p.source.codec_control(CodecCtl::Reset).unwrap();
        let mut arg = [0u8; 4];
        assert!(matches!(
            p.source.codec_control(CodecCtl::Other(0x7000, &mut arg)),
            Err(StreamError::BadFormat(CodecError::NotImplemented))
        ));

        // without a format there is no codec instance to talk to
        let bare = Source::new(2);
        assert!(matches!(
            bare.codec_control(CodecCtl::Reset),
            Err(StreamError::NoFormat)
        ));
    }

    #[test]
    fn test_source_timeout_removal() {
        let p = make_pair(pcm::BitDepth::Float32, true);
        p.source.start_stream(0, None).unwrap();
        for k in 0..5 {
            tick(&p, k, false);
        }
        assert_eq!(p.sink.source_count(), 1);
        drain_sink_events(&p.sink);

        // silence from the source; everything older than "now" expires
        p.sink.set_source_timeout(0.0);
        p.sink.send(|_, _| {}).unwrap();
        assert_eq!(p.sink.source_count(), 0);
        let events = drain_sink_events(&p.sink);
        assert_eq!(count(&events, |e| matches!(e, SinkEvent::SourceRemove { .. })), 1);
    }
}
