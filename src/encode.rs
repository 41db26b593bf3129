// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video substream encoding.
//!
//! Every frame becomes one VideoFrame control packet followed by payload
//! packets of at most the configured chunk budget. The raw encodings pack
//! pixels straight out of the caller's buffer, row by row across packet
//! boundaries. The delta encoder keeps a tightly packed RGB copy of the
//! previously sent frame per channel, XORs the new frame against it and
//! deflates the result; a full keyframe goes out at least every six frames
//! and whenever the geometry changes.

use std::io::Write;
use std::mem::size_of;

use bitflags::bitflags;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use log::debug;
use log::warn;
use zerocopy::AsBytes;

use crate::message::COMMIT_FINAL;
use crate::message::CONTROL_PACKET_SIZE;
use crate::message::ControlCommand;
use crate::message::PacketKind;
use crate::message::Postprocess;
use crate::message::STATIC_STREAM_ID;
use crate::message::VIDEO_SUB_HEADER_SIZE;
use crate::message::VideoFrameCmd;
use crate::session::Channel;
use crate::session::Session;
use crate::surface::unpack_rgba;

/// Delta frames sent between forced keyframes.
const MAX_DELTA_RUN: u32 = 5;

bitflags! {
    /// Properties of an outbound video buffer.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u8 {
        /// Alpha carries no information; an alpha-less encoding may be used.
        const IGNORE_ALPHA = 1 << 0;
        /// Only the rectangle in `region` changed since the last frame.
        const SUBREGION = 1 << 1;
        /// Rows are stored bottom-up.
        const ORIGO_LL = 1 << 2;
        /// Samples are sRGB encoded.
        const SRGB = 1 << 3;
    }
}

/// A sub-rectangle of a video buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

/// An outbound frame of native 32-bit pixels. `pitch` is in pixels and may
/// exceed `w` when the backing store pads its rows.
pub struct VideoBuffer<'a> {
    pub buffer: &'a [u32],
    pub w: u16,
    pub h: u16,
    pub pitch: usize,
    pub flags: BufferFlags,
    pub region: Rect,
    /// Presentation timestamp hint, 0 when unused.
    pub vpts: u64,
}

impl<'a> VideoBuffer<'a> {
    /// A tightly packed full-frame buffer.
    pub fn full(buffer: &'a [u32], w: u16, h: u16) -> VideoBuffer<'a> {
        VideoBuffer {
            buffer,
            w,
            h,
            pitch: w as usize,
            flags: BufferFlags::empty(),
            region: Rect::default(),
            vpts: 0,
        }
    }

    /// The rectangle to encode: the declared sub-region when valid, the full
    /// frame otherwise.
    fn dirty_region(&self) -> Rect {
        if self.flags.contains(BufferFlags::SUBREGION)
            && self.region.w > 0
            && self.region.h > 0
            && self.region.x.saturating_add(self.region.w) <= self.w
            && self.region.y.saturating_add(self.region.h) <= self.h
        {
            self.region
        } else {
            Rect {
                x: 0,
                y: 0,
                w: self.w,
                h: self.h,
            }
        }
    }

    fn pixel(&self, x: usize, y: usize) -> u32 {
        self.buffer.get(y * self.pitch + x).copied().unwrap_or(0)
    }
}

/// Encoding selected for an outbound frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum VframeMethod {
    #[default]
    Rgba,
    Rgb,
    Rgb565,
    DeltaDeflate,
}

/// Per-frame encoder options.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VframeOpts {
    pub method: VframeMethod,
    /// Packet budget for payload slicing, capped to the u16 length field.
    pub chunk_size: usize,
}

impl Default for VframeOpts {
    fn default() -> VframeOpts {
        VframeOpts {
            method: VframeMethod::default(),
            chunk_size: crate::message::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl VframeOpts {
    pub fn with_method(method: VframeMethod) -> VframeOpts {
        VframeOpts {
            method,
            ..VframeOpts::default()
        }
    }
}

/// Encoder-side per-channel copy of the previously sent frame, tightly
/// packed RGB.
pub(crate) struct AccFrame {
    pub w: u16,
    pub h: u16,
    pub rgb: Vec<u8>,
}

fn vframehdr_build(
    last_seen: u64,
    chid: u8,
    pp: Postprocess,
    sw: u16,
    sh: u16,
    region: Rect,
    length: u32,
    expanded: u32,
    commit: u8,
) -> [u8; CONTROL_PACKET_SIZE] {
    debug!(
        "vframe header: ch: {}, type: {:?}, {}x{} region {}x{} @ {},{}, len: {} expand to {}",
        chid, pp, sw, sh, region.w, region.h, region.x, region.y, length, expanded
    );
    let cmd = VideoFrameCmd {
        last_seen: last_seen.into(),
        entropy: [0; 8],
        channel: chid,
        command: ControlCommand::VideoFrame as u8,
        stream: STATIC_STREAM_ID.into(),
        postprocess: pp as u8,
        surface_w: sw.into(),
        surface_h: sh.into(),
        start_x: region.x.into(),
        start_y: region.y.into(),
        frame_w: region.w.into(),
        frame_h: region.h.into(),
        dataflags: 0,
        length: length.into(),
        expanded_length: expanded.into(),
        commit,
    };
    let mut buf = [0u8; CONTROL_PACKET_SIZE];
    buf[..size_of::<VideoFrameCmd>()].copy_from_slice(cmd.as_bytes());
    buf
}

fn pack_pixel(pp: Postprocess, px: u32, dst: &mut [u8]) {
    let (r, g, b, a) = unpack_rgba(px);
    match pp {
        Postprocess::Rgba => dst[..4].copy_from_slice(&[r, g, b, a]),
        Postprocess::Rgb => dst[..3].copy_from_slice(&[r, g, b]),
        Postprocess::Rgb565 => {
            let px = ((b >> 3) & 0x1f) as u16
                | ((((g >> 2) & 0x3f) as u16) << 5)
                | ((((r >> 3) & 0x1f) as u16) << 11);
            dst[..2].copy_from_slice(&px.to_le_bytes());
        }
        Postprocess::DeltaMiniz | Postprocess::Miniz => {}
    }
}

/// Slices a frame into fixed-stride payload packets in one of the raw
/// encodings.
pub(crate) fn encode_raw(
    s: &mut Session,
    chid: u8,
    vb: &VideoBuffer,
    pp: Postprocess,
    chunk_sz: usize,
) {
    let Some(px_sz) = pp.pixel_size() else {
        return;
    };
    let region = vb.dirty_region();
    let (w, h) = (region.w as usize, region.h as usize);
    if w == 0 || h == 0 {
        return;
    }

    // Fit a whole number of pixels per packet.
    let ppb = (chunk_sz - VIDEO_SUB_HEADER_SIZE) / px_sz;
    if ppb == 0 {
        warn!("chunk budget {chunk_sz} below one pixel, dropping frame");
        return;
    }
    let bpb = ppb * px_sz;
    let blocks = w * h / ppb;
    let total = (w * h * px_sz) as u32;

    let mut outb = Vec::new();
    if outb.try_reserve_exact(VIDEO_SUB_HEADER_SIZE + bpb).is_err() {
        warn!("no memory for the packing buffer, dropping frame");
        return;
    }
    outb.resize(VIDEO_SUB_HEADER_SIZE + bpb, 0);

    let hdr = vframehdr_build(
        s.last_seen(),
        chid,
        pp,
        vb.w,
        vb.h,
        region,
        total,
        total,
        COMMIT_FINAL,
    );
    s.append_out(PacketKind::Control, &[], &hdr);

    outb[0] = chid;
    outb[1..5].copy_from_slice(&STATIC_STREAM_ID.to_le_bytes());
    outb[5..7].copy_from_slice(&(bpb as u16).to_le_bytes());

    let mut x = region.x as usize;
    let mut y = region.y as usize;
    let mut row_len = w;
    let mut fill = |outb: &mut [u8], nbytes: usize| {
        for j in (0..nbytes).step_by(px_sz) {
            pack_pixel(pp, vb.pixel(x, y), &mut outb[VIDEO_SUB_HEADER_SIZE + j..]);
            x += 1;
            row_len -= 1;
            if row_len == 0 {
                x = region.x as usize;
                y += 1;
                row_len = w;
            }
        }
    };

    for _ in 0..blocks {
        fill(&mut outb, bpb);
        s.append_out(PacketKind::Video, &[], &outb);
    }

    let left = (w * h - blocks * ppb) * px_sz;
    if left > 0 {
        debug!("small tail block of {left} bytes");
        outb[5..7].copy_from_slice(&(left as u16).to_le_bytes());
        fill(&mut outb, left);
        s.append_out(PacketKind::Video, &[], &outb[..VIDEO_SUB_HEADER_SIZE + left]);
    }
}

fn deflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).ok()?;
    enc.finish().ok()
}

/// Builds the deflate payload for one frame: either a full keyframe that
/// refreshes the accumulation buffer, or the XOR of the dirty region against
/// it. Returns the chosen postprocess, the encoded region and the payload.
fn compress_deltaz(
    channel: &mut Channel,
    vb: &VideoBuffer,
) -> Option<(Postprocess, Rect, Vec<u8>)> {
    let full = Rect {
        x: 0,
        y: 0,
        w: vb.w,
        h: vb.h,
    };
    if vb.w == 0 || vb.h == 0 {
        return None;
    }

    let need_key = match &channel.acc {
        None => true,
        Some(acc) => acc.w != vb.w || acc.h != vb.h || channel.frames_since_key >= MAX_DELTA_RUN,
    };

    if need_key {
        debug!("delta encoder: keyframe ({}x{})", vb.w, vb.h);
        let nb = vb.w as usize * vb.h as usize * 3;
        let mut rgb = Vec::new();
        if rgb.try_reserve_exact(nb).is_err() {
            warn!("no memory for a {nb} byte accumulation buffer, dropping frame");
            channel.acc = None;
            return None;
        }
        for y in 0..vb.h as usize {
            for x in 0..vb.w as usize {
                let (r, g, b, _) = unpack_rgba(vb.pixel(x, y));
                rgb.extend_from_slice(&[r, g, b]);
            }
        }
        let payload = deflate(&rgb)?;
        channel.acc = Some(AccFrame {
            w: vb.w,
            h: vb.h,
            rgb,
        });
        channel.frames_since_key = 0;
        return Some((Postprocess::Miniz, full, payload));
    }

    let region = vb.dirty_region();
    let mut xor = std::mem::take(&mut channel.xor_scratch);
    xor.clear();
    let nb = region.w as usize * region.h as usize * 3;
    if xor.try_reserve(nb).is_err() {
        warn!("no memory for a {nb} byte delta buffer, dropping frame");
        return None;
    }

    let Some(acc) = channel.acc.as_mut() else {
        return None;
    };
    debug!("delta encoder: delta frame ({}x{})", region.w, region.h);
    for cy in region.y..region.y + region.h {
        let mut rs = (cy as usize * acc.w as usize + region.x as usize) * 3;
        for cx in region.x..region.x + region.w {
            let (r, g, b, _) = unpack_rgba(vb.pixel(cx as usize, cy as usize));
            xor.push(acc.rgb[rs] ^ r);
            xor.push(acc.rgb[rs + 1] ^ g);
            xor.push(acc.rgb[rs + 2] ^ b);
            acc.rgb[rs] = r;
            acc.rgb[rs + 1] = g;
            acc.rgb[rs + 2] = b;
            rs += 3;
        }
    }
    channel.frames_since_key += 1;

    let payload = deflate(&xor)?;
    channel.xor_scratch = xor;
    Some((Postprocess::DeltaMiniz, region, payload))
}

/// Encodes one frame as a keyframe or delta against the channel's
/// accumulation buffer, then chunk-packs the deflate output.
pub(crate) fn encode_deltaz(s: &mut Session, chid: u8, vb: &VideoBuffer, chunk_sz: usize) {
    let compressed = compress_deltaz(s.channel_mut(chid), vb);
    let Some((pp, region, payload)) = compressed else {
        return;
    };

    let expanded = region.w as u32 * region.h as u32 * 3;
    debug!(
        "deltaz ({:?}), in: {}, out: {}",
        pp,
        expanded,
        payload.len()
    );

    let hdr = vframehdr_build(
        s.last_seen(),
        chid,
        pp,
        vb.w,
        vb.h,
        region,
        payload.len() as u32,
        expanded,
        COMMIT_FINAL,
    );
    s.append_out(PacketKind::Control, &[], &hdr);
    chunk_pack(s, PacketKind::Video, chid, &payload, chunk_sz);
}

/// Slices a headerless byte stream into substream packets of at most
/// `chunk_sz` payload bytes, prepending the sub-header to each.
fn chunk_pack(s: &mut Session, kind: PacketKind, chid: u8, buf: &[u8], chunk_sz: usize) {
    let mut outb = [0u8; VIDEO_SUB_HEADER_SIZE];
    outb[0] = chid;
    outb[1..5].copy_from_slice(&STATIC_STREAM_ID.to_le_bytes());
    outb[5..7].copy_from_slice(&(chunk_sz as u16).to_le_bytes());

    let n_chunks = buf.len() / chunk_sz;
    for i in 0..n_chunks {
        s.append_out(kind, &outb, &buf[i * chunk_sz..(i + 1) * chunk_sz]);
    }

    let left = buf.len() - n_chunks * chunk_sz;
    if left > 0 {
        outb[5..7].copy_from_slice(&(left as u16).to_le_bytes());
        s.append_out(kind, &outb, &buf[n_chunks * chunk_sz..]);
    }
}
