// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The A12 endpoint state machine.
//!
//! A [`Session`] is one end of a connection: it parses the inbound byte
//! stream into authenticated packets and dispatches them, and it packs
//! outbound events and video frames into a double-buffered output queue the
//! transport driver drains with [`Session::flush`]. All operations are
//! single-threaded and non-blocking; scheduling lives in the driver.

use blake2::Blake2bMac;
use blake2::digest::Mac;
use blake2::digest::consts::U16;
use log::debug;
use log::error;
use log::info;
use log::warn;
use zerocopy::FromBytes;

use crate::Error;
use crate::Result;
use crate::decode;
use crate::decode::VideoFrame;
use crate::encode;
use crate::encode::AccFrame;
use crate::encode::VframeMethod;
use crate::encode::VframeOpts;
use crate::encode::VideoBuffer;
use crate::event;
use crate::event::EventRecord;
use crate::message;
use crate::message::COMMIT_DISCARD;
use crate::message::CONTROL_PACKET_SIZE;
use crate::message::ControlCommand;
use crate::message::ControlHeader;
use crate::message::DECODE_BUFFER_SIZE;
use crate::message::MAC_BLOCK_SIZE;
use crate::message::PacketKind;
use crate::message::Postprocess;
use crate::message::SEQUENCE_NUMBER_SIZE;
use crate::message::SubstreamHeader;
use crate::message::VIDEO_SUB_HEADER_SIZE;
use crate::message::VideoFrameCmd;
use crate::surface::Surface;

/// Upper bound on the authentication key length.
pub const MAX_AUTH_KEY_SIZE: usize = 64;

const CHANNEL_COUNT: usize = 256;

// Overflow-tracking sentinel; every public operation rejects a session whose
// cookie no longer holds the alive value.
const COOKIE_ALIVE: u32 = 0xfeed_face;
const COOKIE_DEAD: u32 = 0xdead_beef;

// Smallest chunk budget that still fits a sub-header and one RGBA pixel.
const MIN_CHUNK_SIZE: usize = VIDEO_SUB_HEADER_SIZE + 4;

type PacketMac = Blake2bMac<U16>;

/// Framer readiness reported by [`Session::poll`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Mid-packet: more bytes are required before the next dispatch.
    Waiting,
    /// Between packets.
    Ready,
    /// Terminal; destroy the session.
    Broken,
}

/// One logical sub-stream multiplexed over the session.
#[derive(Default)]
pub(crate) struct Channel {
    pub active: bool,
    pub dest: Option<Box<dyn Surface>>,
    /// In-progress inbound video frame, at most one.
    pub vframe: Option<VideoFrame>,
    /// Delta-encoder copy of the previously sent frame.
    pub acc: Option<AccFrame>,
    pub xor_scratch: Vec<u8>,
    pub frames_since_key: u32,
}

/// One endpoint of an A12 connection.
pub struct Session {
    // Chained into the MAC of the next outbound / expected inbound packet.
    last_mac_out: [u8; MAC_BLOCK_SIZE],
    last_mac_in: [u8; MAC_BLOCK_SIZE],

    current_seqnr: u64,
    last_seen_seqnr: u64,

    // Double-buffered output queue.
    bufs: [Vec<u8>; 2],
    buf_ind: usize,
    buf_ofs: usize,

    channels: Vec<Channel>,
    /// Channel addressed by the substream packet being reassembled.
    in_channel: Option<u8>,

    // Inbound scratch buffer: `left` bytes missing before dispatch.
    decode: Box<[u8; DECODE_BUFFER_SIZE]>,
    decode_pos: usize,
    left: usize,
    state: PacketKind,

    cookie: u32,

    // Keyed init state, copied fresh for every packet in both directions.
    mac_init: PacketMac,
    mac_dec: PacketMac,

    /// Set once stream-cipher negotiation (EncNeg) completes.
    encstate: bool,
}

impl Session {
    fn setup(key: &[u8]) -> Result<Session> {
        if key.is_empty() || key.len() > MAX_AUTH_KEY_SIZE {
            return Err(Error::InvalidKeyLength(key.len()));
        }
        let mac_init = PacketMac::new_from_slice(key).map_err(|_| Error::MacInit)?;
        let mac_dec = mac_init.clone();

        let mut channels = Vec::with_capacity(CHANNEL_COUNT);
        channels.resize_with(CHANNEL_COUNT, Channel::default);

        Ok(Session {
            last_mac_out: [0; MAC_BLOCK_SIZE],
            last_mac_in: [0; MAC_BLOCK_SIZE],
            current_seqnr: 0,
            last_seen_seqnr: 0,
            bufs: [Vec::new(), Vec::new()],
            buf_ind: 0,
            buf_ofs: 0,
            channels,
            in_channel: None,
            decode: Box::new([0; DECODE_BUFFER_SIZE]),
            decode_pos: 0,
            left: 0,
            state: PacketKind::NoPacket,
            cookie: COOKIE_ALIVE,
            mac_init,
            mac_dec,
            encstate: false,
        })
    }

    /// Creates the active side of a connection. The initial Hello control
    /// packet is queued as part of construction.
    pub fn open(key: &[u8]) -> Result<Session> {
        let mut session = Session::setup(key)?;

        let mut outb = [0u8; CONTROL_PACKET_SIZE];
        outb[17] = ControlCommand::Hello as u8;
        session.step_sequence();
        debug!("channel open, appending hello control packet");
        session.append_out(PacketKind::Control, &[], &outb);

        Ok(session)
    }

    /// Creates the passive side of a connection.
    pub fn build(key: &[u8]) -> Result<Session> {
        Session::setup(key)
    }

    fn alive(&self) -> bool {
        self.cookie == COOKIE_ALIVE
    }

    /// Marks the session dead and releases the output buffers. All later
    /// operations are no-ops and `flush` returns an empty batch.
    pub fn close(&mut self) {
        if !self.alive() {
            return;
        }
        self.bufs = [Vec::new(), Vec::new()];
        self.buf_ofs = 0;
        self.cookie = COOKIE_DEAD;
    }

    /// Binds `surface` as the destination for inbound frames on `chid`.
    /// Until a channel is bound, its inbound payloads are drained.
    pub fn set_destination(&mut self, chid: u8, surface: Box<dyn Surface>) {
        if !self.alive() {
            return;
        }
        let channel = &mut self.channels[chid as usize];
        channel.dest = Some(surface);
        channel.active = true;
    }

    /// Releases the destination bound to `chid`, if any.
    pub fn take_destination(&mut self, chid: u8) -> Option<Box<dyn Surface>> {
        if !self.alive() {
            return None;
        }
        self.channels[chid as usize].dest.take()
    }

    pub fn destination(&self, chid: u8) -> Option<&dyn Surface> {
        self.channels[chid as usize].dest.as_deref()
    }

    pub fn destination_mut<'a>(&'a mut self, chid: u8) -> Option<&'a mut dyn Surface> {
        match self.channels[chid as usize].dest.as_mut() {
            Some(b) => Some(b.as_mut()),
            None => None,
        }
    }

    /// Whether `chid` was activated by a NewChannel command or a local
    /// destination binding.
    pub fn channel_active(&self, chid: u8) -> bool {
        self.channels[chid as usize].active
    }

    /// Whether stream-cipher negotiation has completed. Always false until
    /// EncNeg support lands.
    pub fn cipher_engaged(&self) -> bool {
        self.encstate
    }

    /// Framer readiness: `Ready` between packets, `Waiting` mid-packet,
    /// `Broken` when terminal.
    pub fn poll(&self) -> PollStatus {
        if !self.alive() || self.state == PacketKind::Broken {
            return PollStatus::Broken;
        }
        if self.left > 0 {
            PollStatus::Waiting
        } else {
            PollStatus::Ready
        }
    }

    /// Returns the queued outbound batch and swaps output buffers. The
    /// returned borrow must be fully drained before the session is used
    /// again; the next `flush` reuses the other buffer.
    pub fn flush(&mut self) -> &[u8] {
        if self.buf_ofs == 0 || self.state == PacketKind::Broken || !self.alive() {
            return &[];
        }
        let ofs = self.buf_ofs;
        let ind = self.buf_ind;
        self.buf_ofs = 0;
        self.buf_ind ^= 1;
        &self.bufs[ind][..ofs]
    }

    pub(crate) fn last_seen(&self) -> u64 {
        self.last_seen_seqnr
    }

    pub(crate) fn channel_mut(&mut self, chid: u8) -> &mut Channel {
        &mut self.channels[chid as usize]
    }

    fn step_sequence(&mut self) -> u64 {
        self.current_seqnr += 1;
        self.current_seqnr
    }

    /// Grows the current output buffer to the next power of two that fits
    /// `required` bytes. The queue never shrinks.
    fn grow_out_buffer(&mut self, required: usize) -> bool {
        let buf = &mut self.bufs[self.buf_ind];
        if buf.len() >= required {
            return true;
        }
        let new_sz = required.next_power_of_two();
        if buf.try_reserve_exact(new_sz - buf.len()).is_err() {
            return false;
        }
        buf.resize(new_sz, 0);
        true
    }

    /// MACs and queues one packet: chained MAC, kind byte, then
    /// `prepend` and `body`.
    pub(crate) fn append_out(&mut self, kind: PacketKind, prepend: &[u8], body: &[u8]) {
        if !self.alive() || self.state == PacketKind::Broken {
            return;
        }

        // Chain the new MAC on the previous outbound one.
        let mut mac = self.mac_init.clone();
        mac.update(&self.last_mac_out);
        mac.update(&[kind as u8]);
        mac.update(prepend);
        mac.update(body);
        self.last_mac_out = mac.finalize().into_bytes().into();

        // Once EncNeg lands, the body is enciphered in place here.

        let required = self.buf_ofs + MAC_BLOCK_SIZE + 1 + prepend.len() + body.len();
        if !self.grow_out_buffer(required) {
            error!("output queue growth to {required} bytes failed, session broken");
            self.state = PacketKind::Broken;
            return;
        }

        let buf = &mut self.bufs[self.buf_ind];
        buf[self.buf_ofs..self.buf_ofs + MAC_BLOCK_SIZE].copy_from_slice(&self.last_mac_out);
        self.buf_ofs += MAC_BLOCK_SIZE;
        buf[self.buf_ofs] = kind as u8;
        self.buf_ofs += 1;
        buf[self.buf_ofs..self.buf_ofs + prepend.len()].copy_from_slice(prepend);
        self.buf_ofs += prepend.len();
        buf[self.buf_ofs..self.buf_ofs + body.len()].copy_from_slice(body);
        self.buf_ofs += body.len();
    }

    /// Queues one event. Descriptor-carrying events cannot be tunneled and
    /// are dropped with a trace.
    pub fn enqueue_event(&mut self, ev: &EventRecord) {
        if !self.alive() || self.state == PacketKind::Broken {
            return;
        }
        if ev.carries_descriptor() {
            debug!("ignoring descriptor passing event: {ev}");
            return;
        }

        let mut outb = vec![0u8; message::header_size(PacketKind::Event)];
        let seq = self.step_sequence();
        outb[..SEQUENCE_NUMBER_SIZE].copy_from_slice(&seq.to_le_bytes());
        if event::pack(ev, &mut outb[SEQUENCE_NUMBER_SIZE..]).is_none() {
            warn!("event does not fit its packet, dropping");
            return;
        }

        debug!("enqueue event {ev}");
        self.append_out(PacketKind::Event, &[], &outb);
    }

    /// Encodes and queues one video frame on `chid`.
    pub fn enqueue_video(&mut self, chid: u8, vb: &VideoBuffer, opts: VframeOpts) {
        if !self.alive() || self.state == PacketKind::Broken {
            return;
        }
        let chunk_sz = opts.chunk_size.clamp(MIN_CHUNK_SIZE, u16::MAX as usize);
        self.step_sequence();
        match opts.method {
            VframeMethod::Rgba => encode::encode_raw(self, chid, vb, Postprocess::Rgba, chunk_sz),
            VframeMethod::Rgb => encode::encode_raw(self, chid, vb, Postprocess::Rgb, chunk_sz),
            VframeMethod::Rgb565 => {
                encode::encode_raw(self, chid, vb, Postprocess::Rgb565, chunk_sz)
            }
            VframeMethod::DeltaDeflate => encode::encode_deltaz(self, chid, vb, chunk_sz),
        }
    }

    /// Feeds inbound transport bytes into the framer. Any fragmentation is
    /// accepted; `on_event` fires once per decoded event, in arrival order.
    pub fn feed<F>(&mut self, mut buf: &[u8], mut on_event: F)
    where
        F: FnMut(u8, &EventRecord),
    {
        if !self.alive() {
            return;
        }
        while !buf.is_empty() {
            if self.state == PacketKind::Broken {
                return;
            }
            if self.left == 0 {
                self.reset_state();
            }

            let ntr = buf.len().min(self.left);
            self.decode[self.decode_pos..self.decode_pos + ntr].copy_from_slice(&buf[..ntr]);
            self.decode_pos += ntr;
            self.left -= ntr;
            buf = &buf[ntr..];

            if self.left > 0 {
                return;
            }

            match self.state {
                PacketKind::NoPacket => self.process_nopacket(),
                PacketKind::Control => self.process_control(),
                PacketKind::Event => self.process_event(&mut on_event),
                PacketKind::Video => self.process_video(),
                PacketKind::Audio | PacketKind::Blob => self.process_substream_stub(),
                PacketKind::Broken => return,
            }
        }
    }

    /// Arms the framer for the next outer header. Only called lazily from
    /// `feed` so that `left == 0` keeps meaning "between packets" while idle.
    fn reset_state(&mut self) {
        self.left = message::header_size(PacketKind::NoPacket);
        self.state = PacketKind::NoPacket;
        self.decode_pos = 0;
        self.in_channel = None;
    }

    /// Dispatch complete: drop back to the idle between-packets state that
    /// `poll` reports as ready.
    fn finish_packet(&mut self) {
        self.left = 0;
        self.state = PacketKind::NoPacket;
        self.decode_pos = 0;
        self.in_channel = None;
    }

    /// Outer header complete: start the inbound MAC chain for this packet
    /// and switch to the state named by the kind byte.
    fn process_nopacket(&mut self) {
        let mut mac = self.mac_init.clone();
        mac.update(&self.last_mac_in);
        self.last_mac_in
            .copy_from_slice(&self.decode[..MAC_BLOCK_SIZE]);
        mac.update(&self.decode[MAC_BLOCK_SIZE..MAC_BLOCK_SIZE + 1]);
        self.mac_dec = mac;

        let kind = self.decode[MAC_BLOCK_SIZE];
        match PacketKind::n(kind) {
            Some(k) if k != PacketKind::Broken => {
                self.state = k;
                self.left = message::header_size(k);
                self.decode_pos = 0;
            }
            _ => {
                error!("unknown packet kind {kind}, session broken");
                self.state = PacketKind::Broken;
            }
        }
    }

    fn mac_absorb(&mut self) {
        self.mac_dec.update(&self.decode[..self.decode_pos]);
    }

    /// Finalizes the inbound MAC chain against the wire MAC. A mismatch is
    /// session-fatal.
    fn verify_mac(&mut self) -> bool {
        let mac = std::mem::replace(&mut self.mac_dec, self.mac_init.clone());
        if cfg!(feature = "insecure-skip-mac") {
            return true;
        }
        let tag: [u8; MAC_BLOCK_SIZE] = mac.finalize().into_bytes().into();
        if tag != self.last_mac_in {
            error!("packet authentication mismatch, session broken");
            self.state = PacketKind::Broken;
            return false;
        }
        true
    }

    fn process_control(&mut self) {
        self.mac_absorb();
        if !self.verify_mac() {
            return;
        }

        let Some(hdr) = ControlHeader::read_from_prefix(&self.decode[..self.decode_pos]) else {
            self.state = PacketKind::Broken;
            return;
        };

        match ControlCommand::n(hdr.command) {
            Some(ControlCommand::Hello) => {
                debug!("hello from peer, last seen: {}", hdr.last_seen.get());
            }
            Some(ControlCommand::Shutdown) => {
                info!("peer requested shutdown");
                self.state = PacketKind::Broken;
                return;
            }
            Some(ControlCommand::EncNeg) | Some(ControlCommand::Rekey) => {
                debug!("cipher negotiation not yet supported, ignoring");
            }
            Some(ControlCommand::CancelStream) => {
                debug!("cancel stream on channel {}", hdr.channel);
                self.channels[hdr.channel as usize].vframe = None;
            }
            Some(ControlCommand::NewChannel) => {
                debug!("new channel {}", hdr.channel);
                self.channels[hdr.channel as usize].active = true;
            }
            Some(ControlCommand::Failure) => {
                warn!("peer flagged substream failure on channel {}", hdr.channel);
                self.channels[hdr.channel as usize].vframe = None;
            }
            Some(ControlCommand::VideoFrame) => self.begin_vframe(),
            Some(ControlCommand::AudioFrame) | Some(ControlCommand::BinaryStream) => {
                debug!("substream type {} not yet supported", hdr.command);
            }
            None => warn!("ignoring unknown control command {}", hdr.command),
        }

        self.finish_packet();
    }

    /// VideoFrame control packet: replace the channel's frame descriptor,
    /// negotiating geometry with the sink first.
    fn begin_vframe(&mut self) {
        let Some(cmd) = VideoFrameCmd::read_from_prefix(&self.decode[..self.decode_pos]) else {
            self.state = PacketKind::Broken;
            return;
        };

        let Some(pp) = Postprocess::n(cmd.postprocess) else {
            warn!(
                "unknown postprocess {} on channel {}, discarding frame",
                cmd.postprocess, cmd.channel
            );
            self.channels[cmd.channel as usize].vframe =
                Some(VideoFrame::drain_only(cmd.stream.get(), cmd.length.get()));
            return;
        };

        let mut frame = VideoFrame {
            stream: cmd.stream.get(),
            surface_w: cmd.surface_w.get(),
            surface_h: cmd.surface_h.get(),
            w: cmd.frame_w.get(),
            h: cmd.frame_h.get(),
            x: cmd.start_x.get(),
            y: cmd.start_y.get(),
            postprocess: pp,
            commit: cmd.commit,
            inbuf: Vec::new(),
            inbuf_left: cmd.length.get(),
            expanded_left: cmd.expanded_length.get(),
            row_left: 0,
            out_pos: 0,
            carry: [0; 4],
            carry_len: 0,
        };
        debug!(
            "video frame on channel {}: {:?}, {}x{} @ {},{}, {} bytes",
            cmd.channel, pp, frame.w, frame.h, frame.x, frame.y, frame.inbuf_left
        );

        let channel = &mut self.channels[cmd.channel as usize];
        match channel.dest.as_mut() {
            None => {
                debug!("frame on unmapped channel {}, draining", cmd.channel);
                frame.commit = COMMIT_DISCARD;
            }
            Some(dest) => {
                let (sw, sh) = (frame.surface_w as usize, frame.surface_h as usize);
                if (dest.width() != sw || dest.height() != sh) && !dest.resize(sw, sh) {
                    warn!("sink refused resize to {sw}x{sh}, discarding frame");
                    frame.commit = COMMIT_DISCARD;
                }
                if frame.w == 0 || frame.h == 0 {
                    frame.commit = COMMIT_DISCARD;
                }
                if frame.commit != COMMIT_DISCARD {
                    match pp.pixel_size() {
                        Some(_) => {
                            frame.row_left = frame.w as usize;
                            frame.out_pos =
                                frame.y as usize * dest.pitch() + frame.x as usize;
                        }
                        None => {
                            let len = frame.inbuf_left as usize;
                            if frame.inbuf.try_reserve_exact(len).is_err() {
                                warn!("no memory for a {len} byte frame, discarding");
                                frame.commit = COMMIT_DISCARD;
                            }
                        }
                    }
                }
            }
        }
        channel.vframe = Some(frame);
    }

    fn process_event<F>(&mut self, on_event: &mut F)
    where
        F: FnMut(u8, &EventRecord),
    {
        self.mac_absorb();
        if !self.verify_mac() {
            return;
        }

        let mut seq = [0u8; SEQUENCE_NUMBER_SIZE];
        seq.copy_from_slice(&self.decode[..SEQUENCE_NUMBER_SIZE]);
        self.last_seen_seqnr = u64::from_le_bytes(seq);

        match event::unpack(&self.decode[SEQUENCE_NUMBER_SIZE..self.decode_pos]) {
            Some(ev) => on_event(0, &ev),
            None => warn!("broken event packet received, dropping"),
        }

        self.finish_packet();
    }

    /// First pass over a substream packet: records the addressed channel and
    /// arms the framer for the payload. Returns true when the payload is
    /// empty and dispatch should continue immediately.
    fn begin_substream(&mut self) -> bool {
        self.mac_absorb();
        let Some(hdr) = SubstreamHeader::read_from_prefix(&self.decode[..self.decode_pos]) else {
            self.state = PacketKind::Broken;
            return false;
        };
        debug!(
            "substream header: channel {}, stream {}, {} bytes",
            hdr.channel,
            hdr.stream.get(),
            hdr.length.get()
        );
        self.in_channel = Some(hdr.channel);
        self.left = hdr.length.get() as usize;
        self.decode_pos = 0;
        self.left == 0
    }

    fn process_video(&mut self) {
        if self.in_channel.is_none() {
            if !self.begin_substream() {
                return;
            }
        }

        self.mac_absorb();
        if !self.verify_mac() {
            return;
        }
        let chid = self.in_channel.take().unwrap_or(0);
        self.deliver_video_payload(chid);
        self.finish_packet();
    }

    fn deliver_video_payload(&mut self, chid: u8) {
        let data = &self.decode[..self.decode_pos];
        let channel = &mut self.channels[chid as usize];
        let Some(frame) = channel.vframe.as_mut() else {
            debug!("video payload on channel {chid} with no pending frame, dropping");
            return;
        };

        let take = (frame.inbuf_left as usize).min(data.len());
        if take < data.len() {
            warn!("video payload overruns its declared length on channel {chid}");
        }
        let data = &data[..take];

        let dest = match channel.dest.as_mut() {
            Some(dest) if frame.commit != COMMIT_DISCARD => dest,
            _ => {
                frame.inbuf_left -= take as u32;
                return;
            }
        };

        match frame.postprocess.pixel_size() {
            Some(_) => decode::unpack_vbuffer(frame, dest.as_mut(), data),
            None => {
                frame.inbuf.extend_from_slice(data);
                frame.inbuf_left -= take as u32;
                if frame.inbuf_left == 0 {
                    decode::decode_vbuffer(frame, dest.as_mut());
                }
            }
        }
    }

    /// Audio and blob packets share the video framing; their payloads are
    /// drained until the decode pipelines exist.
    fn process_substream_stub(&mut self) {
        if self.in_channel.is_none() {
            if !self.begin_substream() {
                return;
            }
        }

        self.mac_absorb();
        if !self.verify_mac() {
            return;
        }
        debug!(
            "dropping {} byte {:?} payload",
            self.decode_pos, self.state
        );
        self.finish_packet();
    }
}
