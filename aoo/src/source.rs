//! The stream source: encodes, fragments, sequences and schedules audio
//! blocks for one or more sinks.
//!
//! Thread roles: the audio thread feeds [`Source::process`], the network
//! send thread drains [`Source::send`], the receive thread dispatches
//! incoming datagrams through [`Source::handle_message`]. Audio samples
//! travel through a lock-free SPSC ring (with a parallel ring for the
//! DLL-estimated sample rate per block); everything else goes through MPSC
//! channels.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

use aoo_codec::{find_codec, CodecCtl, Encoder, Format};
use aoo_wire::pattern::{
    MSG_DATA, MSG_INVITE, MSG_MESSAGE, MSG_PING, MSG_PONG, MSG_START, MSG_STOP, MSG_UNINVITE,
};
use aoo_wire::{binmsg, osc::OscMessage, osc::OscWriter, parse_pattern, MsgType};
use aoo_wire::{Data, Endpoint, Id, NtpTime, ID_ALL, ID_INVALID};

use crate::atomic::AtomicF64;
use crate::buffer::{Block, HistoryBuffer, MAX_FRAMES_PER_BLOCK};
use crate::event::{EventQueue, SourceEvent};
use crate::resampler::{ResampleMethod, Resampler};
use crate::time_dll::TimeDll;
use crate::timer::{Tick, Timer};
use crate::{StreamError, StreamMessage, StreamResult};

/// Space reserved for the data message header (address pattern, type tags
/// and non-payload arguments).
const DATA_HEADER_RESERVE: usize = 96;

const STATE_IDLE: u8 = 0;
const STATE_START: u8 = 1;
const STATE_RUN: u8 = 2;
const STATE_STOP: u8 = 3;

fn sink_address(id: Id, what: &str) -> String {
    format!("/aoo/sink/{}{}", id, what)
}

/// A single retransmission request: `frame_offset < 0` with an empty
/// bitset requests the whole block, otherwise bit `i` of `bitset` requests
/// frame `frame_offset + i`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataRequest {
    pub sequence: i32,
    pub frame_offset: i32,
    pub bitset: u32,
}

/// Per-sink bookkeeping held by the source.
struct SinkDesc {
    addr: SocketAddr,
    id: Id,
    /// stream this sink is subscribed to; `ID_INVALID` = inactive
    stream_id: AtomicI32,
    /// channel onset at the sink
    channel: AtomicI32,
    needs_start: AtomicBool,
    uninvite_token: AtomicI32,
    data_requests: (Sender<DataRequest>, Receiver<DataRequest>),
}

impl SinkDesc {
    fn new(addr: SocketAddr, id: Id, stream_id: Id) -> Self {
        Self {
            addr,
            id,
            stream_id: AtomicI32::new(stream_id),
            channel: AtomicI32::new(0),
            needs_start: AtomicBool::new(false),
            uninvite_token: AtomicI32::new(ID_INVALID),
            data_requests: unbounded(),
        }
    }

    fn is_active(&self) -> bool {
        self.stream_id.load(Ordering::Acquire) != ID_INVALID
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr, self.id)
    }
}

/// Replies generated while handling incoming messages; dispatched by the
/// next `send()` call so the receive path never writes to the socket.
enum Request {
    Pong {
        addr: SocketAddr,
        id: Id,
        t1: NtpTime,
        t2: NtpTime,
    },
    /// Tell a sink that a stream is over (stale data request, uninvite).
    StopStream {
        addr: SocketAddr,
        id: Id,
        stream_id: Id,
    },
    /// Decline an invitation.
    DeclineInvite {
        addr: SocketAddr,
        id: Id,
        token: Id,
    },
}

struct AudioState {
    nchannels: usize,
    samplerate: i32,
    blocksize: usize,
    codec_blocksize: usize,
    codec_samplerate: i32,
    need_resample: bool,
    dll: TimeDll,
    timer: Timer,
    dll_started: bool,
    resampler: Resampler,
    interleave: Vec<f32>,
    block_buf: Vec<f32>,
    audio_prod: Option<ringbuf::HeapProd<f32>>,
    rate_prod: Option<ringbuf::HeapProd<f64>>,
}

struct NetState {
    nchannels: usize,
    encoder: Option<Box<dyn Encoder>>,
    format: Option<Format>,
    format_id: Id,
    next_stream_id: Id,
    sequence: i32,
    audio_cons: Option<ringbuf::HeapCons<f32>>,
    rate_cons: Option<ringbuf::HeapCons<f64>>,
    history: HistoryBuffer,
    encbuf: Vec<f32>,
    bytebuf: Vec<u8>,
    sendbuf: Vec<u8>,
    epoch: std::time::Instant,
    last_ping: f64,
}

struct Options {
    buffer_size: AtomicF64,
    resend_buffer_size: AtomicF64,
    packet_size: AtomicUsize,
    redundancy: AtomicI32,
    ping_interval: AtomicF64,
    dll_bandwidth: AtomicF64,
    binary: AtomicBool,
    dynamic_resampling: AtomicBool,
    resample_method: Mutex<ResampleMethod>,
}

/// An AOO stream source.
pub struct Source {
    id: Id,
    state: AtomicU8,
    restart_pending: AtomicBool,
    stream_id: AtomicI32,
    start_offset: AtomicI32,
    stop_offset: AtomicI32,
    metadata: Mutex<Option<Data>>,
    audio: Mutex<AudioState>,
    net: Mutex<NetState>,
    sinks: Mutex<Vec<Arc<SinkDesc>>>,
    requests: (Sender<Request>, Receiver<Request>),
    stream_messages: (Sender<StreamMessage>, Receiver<StreamMessage>),
    /// last invite token seen per endpoint, for event dedup
    invite_tokens: Mutex<HashMap<(SocketAddr, Id), Id>>,
    events: EventQueue<SourceEvent>,
    opts: Options,
}

impl Source {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            state: AtomicU8::new(STATE_IDLE),
            restart_pending: AtomicBool::new(false),
            stream_id: AtomicI32::new(0),
            start_offset: AtomicI32::new(0),
            stop_offset: AtomicI32::new(0),
            metadata: Mutex::new(None),
            audio: Mutex::new(AudioState {
                nchannels: 0,
                samplerate: 0,
                blocksize: 0,
                codec_blocksize: 0,
                codec_samplerate: 0,
                need_resample: false,
                dll: TimeDll::new(),
                timer: Timer::new(),
                dll_started: false,
                resampler: Resampler::new(),
                interleave: Vec::new(),
                block_buf: Vec::new(),
                audio_prod: None,
                rate_prod: None,
            }),
            net: Mutex::new(NetState {
                nchannels: 0,
                encoder: None,
                format: None,
                format_id: ID_INVALID,
                next_stream_id: 1,
                sequence: 0,
                audio_cons: None,
                rate_cons: None,
                history: HistoryBuffer::new(),
                encbuf: Vec::new(),
                bytebuf: Vec::new(),
                sendbuf: Vec::new(),
                epoch: std::time::Instant::now(),
                last_ping: -1e9,
            }),
            sinks: Mutex::new(Vec::new()),
            requests: unbounded(),
            stream_messages: unbounded(),
            invite_tokens: Mutex::new(HashMap::new()),
            events: EventQueue::new(),
            opts: Options {
                buffer_size: AtomicF64::new(crate::DEFAULT_SOURCE_BUFFER_SIZE),
                resend_buffer_size: AtomicF64::new(crate::DEFAULT_RESEND_BUFFER_SIZE),
                packet_size: AtomicUsize::new(aoo_wire::DEFAULT_PACKET_SIZE),
                redundancy: AtomicI32::new(crate::DEFAULT_REDUNDANCY),
                ping_interval: AtomicF64::new(crate::DEFAULT_PING_INTERVAL),
                dll_bandwidth: AtomicF64::new(crate::DEFAULT_DLL_BANDWIDTH),
                binary: AtomicBool::new(true),
                dynamic_resampling: AtomicBool::new(false),
                resample_method: Mutex::new(ResampleMethod::default()),
            },
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    //--------------------------- lifecycle ---------------------------//

    /// Configure the host-side audio format. Idempotent; resets all
    /// pipelines.
    pub fn setup(&self, num_channels: usize, sample_rate: i32, block_size: usize) -> StreamResult<()> {
        if num_channels == 0 || sample_rate <= 0 || block_size == 0 {
            return Err(StreamError::BadArgument("bad audio setup"));
        }
        let mut audio = self.audio.lock();
        let mut net = self.net.lock();
        audio.nchannels = num_channels;
        audio.samplerate = sample_rate;
        audio.blocksize = block_size;
        audio.interleave = vec![0.0; num_channels * block_size];
        audio
            .timer
            .setup(block_size as f64 / sample_rate as f64, crate::XRUN_TOLERANCE);
        audio.dll_started = false;
        net.nchannels = num_channels;
        self.state.store(STATE_IDLE, Ordering::Release);
        if net.format.is_some() {
            self.update(&mut audio, &mut net);
        }
        Ok(())
    }

    /// Set the stream format. Validated by the codec; a new `format_id` is
    /// allocated and the next stream carries it. Changing the format
    /// mid-stream restarts the stream.
    pub fn set_format(&self, fmt: &mut Format) -> StreamResult<()> {
        let codec =
            find_codec(&fmt.codec).ok_or_else(|| StreamError::UnknownCodec(fmt.codec.clone()))?;
        (codec.validate)(fmt)?;
        let encoder = (codec.make_encoder)(fmt)?;

        let mut audio = self.audio.lock();
        let mut net = self.net.lock();
        net.encoder = Some(encoder);
        net.format = Some(fmt.clone());
        net.format_id = net.format_id.wrapping_add(1).max(0);
        if audio.blocksize > 0 {
            self.update(&mut audio, &mut net);
        }
        drop(net);
        drop(audio);

        // a running stream restarts so the sinks pick up the new format
        let _ = self
            .state
            .compare_exchange(STATE_RUN, STATE_START, Ordering::AcqRel, Ordering::Acquire);
        Ok(())
    }

    pub fn format(&self) -> Option<Format> {
        self.net.lock().format.clone()
    }

    /// Forward a control call to the current encoder instance.
    pub fn codec_control(&self, ctl: CodecCtl) -> StreamResult<()> {
        let mut net = self.net.lock();
        let encoder = net.encoder.as_mut().ok_or(StreamError::NoFormat)?;
        encoder.control(ctl)?;
        Ok(())
    }

    /// Rebuild queues, resampler and history after setup/format changes.
    /// Both locks are held.
    fn update(&self, audio: &mut AudioState, net: &mut NetState) {
        let fmt = net.format.as_ref().expect("format");
        audio.codec_blocksize = fmt.block_size as usize;
        audio.codec_samplerate = fmt.sample_rate;
        let nsamples = fmt.block_samples();

        let buffer_size = self.opts.buffer_size.load().max(0.0);
        let blocks_per_buffer =
            ((buffer_size * fmt.sample_rate as f64 / fmt.block_size as f64).ceil() as usize).max(1);

        let rb = HeapRb::<f32>::new(blocks_per_buffer * nsamples);
        let (prod, cons) = rb.split();
        audio.audio_prod = Some(prod);
        net.audio_cons = Some(cons);

        let rates = HeapRb::<f64>::new(blocks_per_buffer);
        let (rprod, rcons) = rates.split();
        audio.rate_prod = Some(rprod);
        net.rate_cons = Some(rcons);

        audio.need_resample =
            audio.blocksize != audio.codec_blocksize || audio.samplerate != audio.codec_samplerate;
        if audio.need_resample {
            let method = *self.opts.resample_method.lock();
            audio.resampler.setup(
                audio.blocksize,
                audio.codec_blocksize,
                audio.samplerate,
                audio.codec_samplerate,
                audio.nchannels,
                method,
            );
        }
        audio.block_buf = vec![0.0; nsamples];

        let resend = self.opts.resend_buffer_size.load().max(0.0);
        let history_blocks =
            (resend * fmt.sample_rate as f64 / fmt.block_size as f64).ceil() as usize;
        net.history.resize(history_blocks);

        net.encbuf = vec![0.0; nsamples];
    }

    //--------------------------- sink management ---------------------//

    pub fn add_sink(&self, addr: SocketAddr, id: Id, active: bool) -> StreamResult<()> {
        let mut sinks = self.sinks.lock();
        if sinks.iter().any(|s| s.addr == addr && s.id == id) {
            return Err(StreamError::AlreadyExists);
        }
        let stream_id = if active {
            self.stream_id.load(Ordering::Acquire)
        } else {
            ID_INVALID
        };
        let desc = Arc::new(SinkDesc::new(addr, id, stream_id));
        if active && self.state.load(Ordering::Acquire) == STATE_RUN {
            desc.needs_start.store(true, Ordering::Release);
        }
        sinks.push(desc);
        Ok(())
    }

    pub fn remove_sink(&self, addr: SocketAddr, id: Id) -> StreamResult<()> {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|s| !(s.addr == addr && s.id == id));
        if sinks.len() == before {
            Err(StreamError::NotFound)
        } else {
            Ok(())
        }
    }

    pub fn remove_all(&self) {
        self.sinks.lock().clear();
    }

    /// Channel onset for this sink; a 2-channel stream with onset 5 is
    /// summed into sink channels 5 and 6.
    pub fn set_sink_channel_onset(&self, addr: SocketAddr, id: Id, onset: i32) -> StreamResult<()> {
        if onset < 0 {
            return Err(StreamError::BadArgument("negative channel onset"));
        }
        let sinks = self.sinks.lock();
        let sink = sinks
            .iter()
            .find(|s| s.addr == addr && s.id == id)
            .ok_or(StreamError::NotFound)?;
        sink.channel.store(onset, Ordering::Relaxed);
        Ok(())
    }

    fn find_sink(&self, addr: SocketAddr, id: Id) -> Option<Arc<SinkDesc>> {
        self.sinks
            .lock()
            .iter()
            .find(|s| s.addr == addr && s.id == id)
            .cloned()
    }

    //--------------------------- stream control ----------------------//

    /// Schedule a transition to a fresh stream at the given sample offset.
    pub fn start_stream(&self, sample_offset: i32, metadata: Option<Data>) -> StreamResult<()> {
        if self.net.lock().format.is_none() {
            return Err(StreamError::NoFormat);
        }
        *self.metadata.lock() = metadata;
        self.start_offset.store(sample_offset, Ordering::Relaxed);
        self.state.store(STATE_START, Ordering::Release);
        Ok(())
    }

    /// Schedule the end of the current stream at the given sample offset.
    pub fn stop_stream(&self, sample_offset: i32) -> StreamResult<()> {
        self.stop_offset.store(sample_offset, Ordering::Relaxed);
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == STATE_IDLE || state == STATE_STOP {
                return Err(StreamError::Idle);
            }
            if self
                .state
                .compare_exchange(state, STATE_STOP, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Enqueue a timed message carried alongside the stream.
    pub fn add_stream_message(&self, message: StreamMessage) -> StreamResult<()> {
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_IDLE {
            return Err(StreamError::Idle);
        }
        let _ = self.stream_messages.0.send(message);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUN
    }

    //--------------------------- audio thread ------------------------//

    /// Feed one block of non-interleaved audio. Must be called from the
    /// audio thread; never blocks.
    pub fn process(&self, input: &[&[f32]], t: NtpTime) -> StreamResult<()> {
        let mut audio = match self.audio.try_lock() {
            Some(a) => a,
            None => {
                self.events.push(SourceEvent::XRun { count: 1 });
                return Err(StreamError::WouldBlock);
            }
        };
        let a = &mut *audio;
        if a.blocksize == 0 {
            return Err(StreamError::NotSetup);
        }
        if input.len() != a.nchannels || input.iter().any(|c| c.len() != a.blocksize) {
            return Err(StreamError::BadArgument("input layout mismatch"));
        }

        match a.timer.update(t) {
            Tick::First => {
                a.dll.setup(
                    a.samplerate as f64,
                    a.blocksize as i32,
                    self.opts.dll_bandwidth.load(),
                    0.0,
                );
                a.dll_started = true;
            }
            Tick::Ok(_) => a.dll.update(a.timer.elapsed()),
            Tick::XRun(blocks) => {
                let count = blocks.ceil() as i32;
                self.events.push(SourceEvent::XRun { count });
                // the clock jumped; restart the DLL at the current time
                a.dll.setup(
                    a.samplerate as f64,
                    a.blocksize as i32,
                    self.opts.dll_bandwidth.load(),
                    a.timer.elapsed(),
                );
            }
        }

        match self.state.load(Ordering::Acquire) {
            STATE_START => {
                if self
                    .state
                    .compare_exchange(STATE_START, STATE_RUN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    a.resampler.clear();
                    self.restart_pending.store(true, Ordering::Release);
                }
            }
            STATE_RUN => {}
            _ => return Ok(()), // idle or stopping: nothing to produce
        }
        if a.codec_blocksize == 0 {
            return Ok(());
        }

        // non-interleaved -> interleaved
        let nch = a.nchannels;
        for (i, channel) in input.iter().enumerate() {
            for (j, &s) in channel.iter().enumerate() {
                a.interleave[j * nch + i] = s;
            }
        }

        let real_rate = if self.opts.dynamic_resampling.load(Ordering::Relaxed) && a.dll_started {
            a.dll.sample_rate()
        } else {
            a.samplerate as f64
        };

        let insamples = a.blocksize * nch;
        let outsamples = a.codec_blocksize * nch;
        let prod = a.audio_prod.as_mut().expect("audio queue");
        let rates = a.rate_prod.as_mut().expect("rate queue");

        if a.need_resample {
            if a.resampler.write_available() >= insamples {
                a.resampler.write(&a.interleave);
            } else {
                self.events.push(SourceEvent::XRun { count: 1 });
                return Ok(());
            }
            let ratio = a.codec_samplerate as f64 / a.samplerate as f64;
            while a.resampler.read_available() >= outsamples
                && prod.vacant_len() >= outsamples
                && !rates.is_full()
            {
                a.resampler.read(&mut a.block_buf[..outsamples]);
                prod.push_slice(&a.block_buf[..outsamples]);
                let _ = rates.try_push(real_rate * ratio);
            }
        } else if prod.vacant_len() >= insamples && !rates.is_full() {
            prod.push_slice(&a.interleave);
            let _ = rates.try_push(real_rate);
        } else {
            self.events.push(SourceEvent::XRun { count: 1 });
        }
        Ok(())
    }

    //--------------------------- network send ------------------------//

    /// Drain the outbound scheduler. Called from the network send thread.
    pub fn send<F: FnMut(&[u8], SocketAddr)>(&self, mut send_fn: F) -> StreamResult<()> {
        let mut net = self.net.lock();
        let n = &mut *net;

        if self.restart_pending.swap(false, Ordering::AcqRel) {
            self.make_new_stream(n);
        }
        // force a restart before the sequence can overflow
        if n.sequence >= i32::MAX - 1 && self.state.load(Ordering::Acquire) == STATE_RUN {
            self.make_new_stream(n);
        }

        self.dispatch_requests(&mut send_fn);

        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_RUN => {
                self.send_start(n, &mut send_fn);
                self.send_data(n, &mut send_fn)?;
                self.send_stream_messages(n, &mut send_fn);
                self.send_ping(n, &mut send_fn);
            }
            STATE_STOP => {
                // flush queued blocks, then terminate the stream
                self.send_data(n, &mut send_fn)?;
                self.send_stop(n, &mut send_fn);
                let _ = self.state.compare_exchange(
                    STATE_STOP,
                    STATE_IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            _ => {}
        }

        self.send_requested_data(n, &mut send_fn);
        Ok(())
    }

    /// Begin a new stream: fresh id, sequence zero, empty history. Stale
    /// blocks of the previous stream are discarded.
    fn make_new_stream(&self, n: &mut NetState) {
        let id = n.next_stream_id;
        n.next_stream_id = n.next_stream_id.wrapping_add(1).max(0);
        self.stream_id.store(id, Ordering::Release);
        n.sequence = 0;
        n.history.clear();
        for sink in self.sinks.lock().iter() {
            if sink.is_active() {
                sink.stream_id.store(id, Ordering::Release);
                sink.needs_start.store(true, Ordering::Release);
            }
        }
        log::debug!("source {}: new stream {}", self.id, id);
    }

    fn dispatch_requests<F: FnMut(&[u8], SocketAddr)>(&self, send_fn: &mut F) {
        while let Ok(r) = self.requests.1.try_recv() {
            match r {
                Request::Pong { addr, id, t1, t2 } => {
                    let mut w = OscWriter::new(sink_address(id, MSG_PONG));
                    w.int32(self.id).time(t1).time(t2).time(NtpTime::now());
                    send_fn(&w.to_bytes(), addr);
                }
                Request::StopStream {
                    addr,
                    id,
                    stream_id,
                } => {
                    let mut w = OscWriter::new(sink_address(id, MSG_STOP));
                    w.int32(self.id).int32(stream_id).int32(0);
                    send_fn(&w.to_bytes(), addr);
                }
                Request::DeclineInvite { addr, id, token } => {
                    let mut w = OscWriter::new(sink_address(id, MSG_UNINVITE));
                    w.int32(self.id).int32(token);
                    send_fn(&w.to_bytes(), addr);
                }
            }
        }
    }

    fn send_start<F: FnMut(&[u8], SocketAddr)>(&self, n: &mut NetState, send_fn: &mut F) {
        let format = match n.format.as_ref() {
            Some(f) => f,
            None => return,
        };
        let codec = match find_codec(&format.codec) {
            Some(c) => c,
            None => return,
        };
        let options = match (codec.serialize)(format) {
            Ok(o) => o,
            Err(e) => {
                log::error!("source {}: cannot serialize format: {}", self.id, e);
                return;
            }
        };
        let metadata = self.metadata.lock().clone();
        let stream_id = self.stream_id.load(Ordering::Acquire);
        let offset = self.start_offset.load(Ordering::Relaxed);

        for sink in self.sinks.lock().iter() {
            if sink.is_active() && sink.needs_start.swap(false, Ordering::AcqRel) {
                let mut w = OscWriter::new(sink_address(sink.id, MSG_START));
                w.int32(self.id)
                    .int32(stream_id)
                    .int32(n.format_id)
                    .int32(offset)
                    .int32(format.num_channels)
                    .int32(format.sample_rate)
                    .int32(format.block_size)
                    .string(&format.codec)
                    .blob(&options)
                    .metadata(metadata.as_ref());
                send_fn(&w.to_bytes(), sink.addr);
            }
        }
    }

    fn send_stop<F: FnMut(&[u8], SocketAddr)>(&self, _n: &mut NetState, send_fn: &mut F) {
        let stream_id = self.stream_id.load(Ordering::Acquire);
        let offset = self.stop_offset.load(Ordering::Relaxed);
        for sink in self.sinks.lock().iter() {
            if sink.is_active() {
                let mut w = OscWriter::new(sink_address(sink.id, MSG_STOP));
                w.int32(self.id).int32(stream_id).int32(offset);
                send_fn(&w.to_bytes(), sink.addr);
            }
        }
        log::debug!("source {}: stopped stream {}", self.id, stream_id);
    }

    /// Encode all available blocks and fan each frame out to the active
    /// sinks.
    fn send_data<F: FnMut(&[u8], SocketAddr)>(
        &self,
        n: &mut NetState,
        send_fn: &mut F,
    ) -> StreamResult<()> {
        let NetState {
            encoder,
            audio_cons,
            rate_cons,
            history,
            encbuf,
            bytebuf,
            sendbuf,
            sequence,
            ..
        } = n;
        let (encoder, cons, rates) = match (encoder.as_mut(), audio_cons.as_mut(), rate_cons.as_mut())
        {
            (Some(e), Some(c), Some(r)) => (e, c, r),
            _ => return Ok(()),
        };
        let codec_samples = encbuf.len();
        if codec_samples == 0 {
            return Ok(());
        }
        let packet_size = self
            .opts
            .packet_size
            .load(Ordering::Relaxed)
            .clamp(DATA_HEADER_RESERVE + 16, aoo_wire::MAX_PACKET_SIZE);
        let max_frame_size = packet_size - DATA_HEADER_RESERVE;
        let redundancy = self.opts.redundancy.load(Ordering::Relaxed).max(1);
        let stream_id = self.stream_id.load(Ordering::Acquire);
        let binary = self.opts.binary.load(Ordering::Relaxed);

        while cons.occupied_len() >= codec_samples && !rates.is_empty() {
            cons.pop_slice(encbuf);
            let rate = rates.try_pop().unwrap_or(0.0);

            bytebuf.clear();
            if let Err(e) = encoder.encode(encbuf, bytebuf) {
                // the block is skipped but the sequence still advances
                log::error!("source {}: encode failed: {}", self.id, e);
                *sequence += 1;
                continue;
            }

            let total = bytebuf.len();
            // fragment; make sure the frame count fits the bitmap
            let mut frame_size = max_frame_size;
            let mut nframes = (total + frame_size - 1) / frame_size;
            if nframes == 0 {
                nframes = 1; // empty payload still takes one frame
            }
            if nframes > MAX_FRAMES_PER_BLOCK {
                frame_size = (total + MAX_FRAMES_PER_BLOCK - 1) / MAX_FRAMES_PER_BLOCK;
                nframes = (total + frame_size - 1) / frame_size;
            }

            history.push(Block::complete(
                *sequence,
                rate,
                0,
                bytebuf,
                nframes as i32,
                frame_size as i32,
            ));

            let sinks = self.sinks.lock().clone();
            for frame_index in 0..nframes {
                let onset = frame_index * frame_size;
                let end = (onset + frame_size).min(total);
                let payload = &bytebuf[onset..end];
                for sink in sinks.iter().filter(|s| s.is_active()) {
                    for _ in 0..redundancy {
                        Self::write_data_frame(
                            sendbuf,
                            self.id,
                            sink,
                            stream_id,
                            *sequence,
                            rate,
                            total as i32,
                            nframes as i32,
                            frame_index as i32,
                            payload,
                            binary,
                        );
                        send_fn(sendbuf, sink.addr);
                    }
                }
            }

            *sequence += 1;
            if *sequence >= i32::MAX - 1 {
                self.restart_pending.store(true, Ordering::Release);
                break;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_data_frame(
        buf: &mut Vec<u8>,
        src_id: Id,
        sink: &SinkDesc,
        stream_id: Id,
        sequence: i32,
        rate: f64,
        total_size: i32,
        nframes: i32,
        frame_index: i32,
        payload: &[u8],
        binary: bool,
    ) {
        buf.clear();
        let channel = sink.channel.load(Ordering::Relaxed);
        if binary {
            binmsg::BinDataMsg {
                src_id,
                sink_id: sink.id,
                stream_id,
                sequence,
                sample_rate: rate,
                channel,
                total_size,
                nframes,
                frame_index,
                payload,
            }
            .write_into(buf);
        } else {
            let mut w = OscWriter::new(sink_address(sink.id, MSG_DATA));
            w.int32(src_id)
                .int32(stream_id)
                .int32(sequence)
                .double(rate)
                .int32(channel)
                .int32(total_size)
                .int32(nframes)
                .int32(frame_index)
                .blob(payload);
            w.write_into(buf);
        }
    }

    fn send_stream_messages<F: FnMut(&[u8], SocketAddr)>(&self, n: &mut NetState, send_fn: &mut F) {
        let stream_id = self.stream_id.load(Ordering::Acquire);
        while let Ok(msg) = self.stream_messages.1.try_recv() {
            for sink in self.sinks.lock().iter().filter(|s| s.is_active()) {
                let mut w = OscWriter::new(sink_address(sink.id, MSG_MESSAGE));
                w.int32(self.id)
                    .int32(stream_id)
                    .time(msg.time)
                    .int32(msg.channel)
                    .int32(msg.kind)
                    .blob(&msg.data);
                n.sendbuf.clear();
                w.write_into(&mut n.sendbuf);
                send_fn(&n.sendbuf, sink.addr);
            }
        }
    }

    /// Replay requested frames from history.
    fn send_requested_data<F: FnMut(&[u8], SocketAddr)>(&self, n: &mut NetState, send_fn: &mut F) {
        let NetState {
            history, sendbuf, ..
        } = n;
        let stream_id = self.stream_id.load(Ordering::Acquire);
        let binary = self.opts.binary.load(Ordering::Relaxed);
        let sinks = self.sinks.lock().clone();
        for sink in sinks.iter() {
            let mut resent = 0;
            while let Ok(r) = sink.data_requests.1.try_recv() {
                let block = match history.find(r.sequence) {
                    Some(b) => b,
                    None => continue, // too old; the sink's ack list ages out
                };
                let mut send_frame = |frame_index: i32, sendbuf: &mut Vec<u8>| {
                    if let Some(payload) = block.get_frame(frame_index) {
                        Self::write_data_frame(
                            sendbuf,
                            self.id,
                            sink,
                            stream_id,
                            block.sequence,
                            block.sample_rate,
                            block.size() as i32,
                            block.num_frames(),
                            frame_index,
                            payload,
                            binary,
                        );
                        send_fn(sendbuf, sink.addr);
                        resent += 1;
                    }
                };
                if r.frame_offset < 0 && r.bitset == 0 {
                    for i in 0..block.num_frames() {
                        send_frame(i, sendbuf);
                    }
                } else {
                    for i in 0..16 {
                        if r.bitset & (1 << i) != 0 {
                            send_frame(r.frame_offset + i, sendbuf);
                        }
                    }
                }
            }
            if resent > 0 {
                self.events.push(SourceEvent::FrameResent {
                    ep: sink.endpoint(),
                    count: resent,
                });
            }
        }
    }

    fn send_ping<F: FnMut(&[u8], SocketAddr)>(&self, n: &mut NetState, send_fn: &mut F) {
        let now = n.epoch.elapsed().as_secs_f64();
        let interval = self.opts.ping_interval.load();
        if interval <= 0.0 || now - n.last_ping < interval {
            return;
        }
        n.last_ping = now;
        let t = NtpTime::now();
        for sink in self.sinks.lock().iter().filter(|s| s.is_active()) {
            let mut w = OscWriter::new(sink_address(sink.id, MSG_PING));
            w.int32(self.id).time(t);
            send_fn(&w.to_bytes(), sink.addr);
        }
    }

    //--------------------------- network receive ---------------------//

    /// Parse one incoming datagram and dispatch it.
    pub fn handle_message(&self, data: &[u8], from: SocketAddr) -> StreamResult<()> {
        if binmsg::is_binary(data) {
            log::warn!("source {}: unexpected binary message", self.id);
            return Ok(());
        }
        let msg = OscMessage::parse(data)?;
        let (msg_type, id, offset) = parse_pattern(msg.address())?;
        if msg_type != MsgType::Source {
            return Err(StreamError::BadArgument("not a source message"));
        }
        if id != self.id && id != ID_ALL {
            log::warn!("source {}: message for wrong id {}", self.id, id);
            return Ok(());
        }
        let pattern = &msg.address()[offset..];
        match pattern {
            MSG_START => self.handle_start_request(&msg, from),
            MSG_DATA => self.handle_data_request(&msg, from),
            MSG_PING => self.handle_ping(&msg, from),
            MSG_PONG => self.handle_pong(&msg, from),
            MSG_INVITE => self.handle_invite_msg(&msg, from),
            MSG_UNINVITE => self.handle_uninvite_msg(&msg, from),
            _ => {
                log::warn!("source {}: unknown message '{}'", self.id, pattern);
                Ok(())
            }
        }
    }

    /// The sink lost our `/start` (or joined late) and asks again.
    fn handle_start_request(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let sink_id = msg.args().int32()?;
        if let Some(sink) = self.find_sink(from, sink_id) {
            if sink.is_active() {
                sink.needs_start.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn handle_data_request(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let sink_id = args.int32()?;
        let stream_id = args.int32()?;
        let sink = match self.find_sink(from, sink_id) {
            Some(s) => s,
            None => return Ok(()),
        };
        let current = sink.stream_id.load(Ordering::Acquire);
        let idle = self.state.load(Ordering::Acquire) == STATE_IDLE;
        if stream_id != current || idle {
            // stale stream: tell the sink to stop chasing it
            let _ = self.requests.0.send(Request::StopStream {
                addr: from,
                id: sink_id,
                stream_id,
            });
            return Ok(());
        }
        while args.remaining() >= 3 {
            let sequence = args.int32()?;
            let frame_offset = args.int32()?;
            let bitset = args.int32()? as u32;
            let _ = sink.data_requests.0.send(DataRequest {
                sequence,
                frame_offset,
                bitset,
            });
        }
        Ok(())
    }

    fn handle_ping(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let sink_id = args.int32()?;
        let t1 = args.time()?;
        let _ = self.requests.0.send(Request::Pong {
            addr: from,
            id: sink_id,
            t1,
            t2: NtpTime::now(),
        });
        Ok(())
    }

    fn handle_pong(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let sink_id = args.int32()?;
        let t1 = args.time()?;
        let t2 = args.time()?;
        self.events.push(SourceEvent::Ping {
            ep: Endpoint::new(from, sink_id),
            t1,
            t2,
            t3: NtpTime::now(),
        });
        Ok(())
    }

    fn handle_invite_msg(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let sink_id = args.int32()?;
        let token = args.int32()?;
        let metadata = if args.remaining() >= 2 {
            args.metadata()?
        } else {
            None
        };
        // the sink retries invitations; only report each token once
        let mut tokens = self.invite_tokens.lock();
        if tokens.insert((from, sink_id), token) == Some(token) {
            return Ok(());
        }
        self.events.push(SourceEvent::Invite {
            ep: Endpoint::new(from, sink_id),
            token,
            metadata,
        });
        Ok(())
    }

    fn handle_uninvite_msg(&self, msg: &OscMessage, from: SocketAddr) -> StreamResult<()> {
        let mut args = msg.args();
        let sink_id = args.int32()?;
        let token = args.int32()?;
        if let Some(sink) = self.find_sink(from, sink_id) {
            if sink.uninvite_token.swap(token, Ordering::AcqRel) == token {
                return Ok(());
            }
        }
        self.events.push(SourceEvent::Uninvite {
            ep: Endpoint::new(from, sink_id),
            token,
        });
        Ok(())
    }

    /// Answer a pending invitation.
    pub fn handle_invite(&self, addr: SocketAddr, id: Id, token: Id, accept: bool) -> StreamResult<()> {
        if accept {
            match self.find_sink(addr, id) {
                Some(sink) => {
                    sink.stream_id
                        .store(self.stream_id.load(Ordering::Acquire), Ordering::Release);
                    if self.state.load(Ordering::Acquire) == STATE_RUN {
                        sink.needs_start.store(true, Ordering::Release);
                    }
                }
                None => {
                    self.add_sink(addr, id, true)?;
                    if let Some(sink) = self.find_sink(addr, id) {
                        if self.state.load(Ordering::Acquire) == STATE_RUN {
                            sink.needs_start.store(true, Ordering::Release);
                        }
                    }
                }
            }
        } else {
            let _ = self.requests.0.send(Request::DeclineInvite { addr, id, token });
        }
        Ok(())
    }

    /// Answer a pending uninvitation.
    pub fn handle_uninvite(&self, addr: SocketAddr, id: Id, token: Id, accept: bool) -> StreamResult<()> {
        if accept {
            let sink = self.find_sink(addr, id).ok_or(StreamError::NotFound)?;
            let stream_id = sink.stream_id.swap(ID_INVALID, Ordering::AcqRel);
            let _ = self.requests.0.send(Request::StopStream {
                addr,
                id,
                stream_id,
            });
            let _ = token;
        }
        Ok(())
    }

    //--------------------------- events ------------------------------//

    pub fn events_available(&self) -> bool {
        self.events.available()
    }

    pub fn poll_events<F: FnMut(SourceEvent)>(&self, f: F) {
        self.events.poll(f)
    }

    //--------------------------- options -----------------------------//

    pub fn set_buffer_size(&self, seconds: f64) {
        self.opts.buffer_size.store(seconds.max(0.0));
    }

    pub fn set_resend_buffer_size(&self, seconds: f64) {
        self.opts.resend_buffer_size.store(seconds.max(0.0));
    }

    pub fn set_packet_size(&self, bytes: usize) {
        self.opts
            .packet_size
            .store(bytes.clamp(DATA_HEADER_RESERVE + 16, aoo_wire::MAX_PACKET_SIZE), Ordering::Relaxed);
    }

    pub fn packet_size(&self) -> usize {
        self.opts.packet_size.load(Ordering::Relaxed)
    }

    pub fn set_redundancy(&self, count: i32) {
        self.opts.redundancy.store(count.max(1), Ordering::Relaxed);
    }

    pub fn set_ping_interval(&self, seconds: f64) {
        self.opts.ping_interval.store(seconds);
    }

    pub fn set_dll_bandwidth(&self, bandwidth: f64) {
        self.opts.dll_bandwidth.store(bandwidth.clamp(0.0, 1.0));
    }

    pub fn set_binary_format(&self, binary: bool) {
        self.opts.binary.store(binary, Ordering::Relaxed);
    }

    pub fn binary_format(&self) -> bool {
        self.opts.binary.load(Ordering::Relaxed)
    }

    pub fn set_dynamic_resampling(&self, enabled: bool) {
        self.opts.dynamic_resampling.store(enabled, Ordering::Relaxed);
    }

    pub fn set_resample_method(&self, method: ResampleMethod) {
        *self.opts.resample_method.lock() = method;
    }
}
