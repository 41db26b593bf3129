// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A12 wire format definitions.
//!
//! Every packet on the wire is a 16-byte chained MAC, one kind byte, and a
//! kind-specific body. Control bodies are a fixed 128 bytes; event bodies are
//! an 8-byte sequence number, a 16-bit checksum and the packed event record;
//! video, audio and blob bodies start with a 7-byte sub-header (channel,
//! stream id, payload length) followed by the payload.

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::byteorder::little_endian::U64;

use crate::event;

/// Size of the chained MAC prepended to every packet.
pub const MAC_BLOCK_SIZE: usize = 16;

/// Fixed size of a control packet body.
pub const CONTROL_PACKET_SIZE: usize = 128;

/// Size of the sequence number prefixing event packet bodies.
pub const SEQUENCE_NUMBER_SIZE: usize = 8;

/// Sub-header prefixing video, audio and blob bodies: channel id (1),
/// stream id (4), payload length (2).
pub const VIDEO_SUB_HEADER_SIZE: usize = 7;

/// Fixed size of the inbound scratch buffer. A substream payload length is a
/// u16 so a whole body always fits.
pub const DECODE_BUFFER_SIZE: usize = 65536;

/// Default packet budget used when slicing video buffers into substream
/// packets. Must never exceed the u16 payload length field.
pub const DEFAULT_CHUNK_SIZE: usize = 32768;

/// Stream id stamped on substream packets until dynamic stream allocation is
/// wired up.
pub const STATIC_STREAM_ID: u32 = 0xbaca_baca;

/// Commit byte of a VideoFrame control packet: more packets follow for this
/// frame, do not present yet.
pub const COMMIT_MORE: u8 = 0;

/// Commit byte: present the frame once the declared payload is consumed.
pub const COMMIT_FINAL: u8 = 1;

/// Commit byte: sticky discard, consume and ignore the declared payload.
pub const COMMIT_DISCARD: u8 = 255;

/// Packet kind byte, doubling as the receive-side decode state. Kind bytes at
/// or above `Broken` are invalid on the wire and poison the session.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    NoPacket = 0,
    Control = 1,
    Event = 2,
    Audio = 3,
    Video = 4,
    Blob = 5,
    Broken = 6,
}

/// Command byte of a control packet.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    Hello = 0,
    Shutdown = 1,
    EncNeg = 2,
    Rekey = 3,
    CancelStream = 4,
    NewChannel = 5,
    Failure = 6,
    VideoFrame = 7,
    AudioFrame = 8,
    BinaryStream = 9,
}

/// Pixel-level decode pipeline selected by a VideoFrame control packet.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Postprocess {
    /// 4 bytes per pixel, stored as-is.
    Rgba = 0,
    /// 3 bytes per pixel, alpha forced opaque.
    Rgb = 1,
    /// 2 bytes per pixel, 5/6/5 split expanded through fixed lookup tables.
    Rgb565 = 2,
    /// Deflated 3-byte pixels XORed onto the previous destination contents.
    DeltaMiniz = 3,
    /// Deflated 3-byte pixels replacing the destination contents.
    Miniz = 4,
}

impl Postprocess {
    /// Bytes per pixel on the wire for the raw encodings; `None` for the
    /// buffered (deflate) encodings.
    pub fn pixel_size(self) -> Option<usize> {
        match self {
            Postprocess::Rgba => Some(4),
            Postprocess::Rgb => Some(3),
            Postprocess::Rgb565 => Some(2),
            Postprocess::DeltaMiniz | Postprocess::Miniz => None,
        }
    }
}

/// Common prefix of every control packet body.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ControlHeader {
    /// Highest inbound sequence number the sender had observed.
    pub last_seen: U64,
    /// Reserved entropy block; receivers ignore it.
    pub entropy: [u8; 8],
    pub channel: u8,
    pub command: u8,
}

/// VideoFrame control packet body. Field offsets are part of the wire
/// contract: [16] channel, [17] command, [18..21] stream, [22] postprocess,
/// [23..26] surface w/h, [27..34] region x/y/w/h, [35] flags, [36..39]
/// payload length, [40..43] expanded length, [44] commit.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct VideoFrameCmd {
    pub last_seen: U64,
    pub entropy: [u8; 8],
    pub channel: u8,
    pub command: u8,
    pub stream: U32,
    pub postprocess: u8,
    pub surface_w: U16,
    pub surface_h: U16,
    pub start_x: U16,
    pub start_y: U16,
    pub frame_w: U16,
    pub frame_h: U16,
    pub dataflags: u8,
    /// Payload bytes that will follow in video packets.
    pub length: U32,
    /// Post-decompression size cap enforced by the decoder.
    pub expanded_length: U32,
    /// 0 = more coming, 1 = signal the sink on completion, 255 = discard.
    pub commit: u8,
}

/// Sub-header of video, audio and blob packet bodies.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct SubstreamHeader {
    pub channel: u8,
    pub stream: U32,
    pub length: U16,
}

/// Bytes the framer needs before it can dispatch a packet of the given kind.
/// For substream kinds this is the sub-header; the payload length is learned
/// from it. `NoPacket` covers the outer MAC plus the kind byte.
pub fn header_size(kind: PacketKind) -> usize {
    match kind {
        PacketKind::NoPacket => MAC_BLOCK_SIZE + 1,
        PacketKind::Control => CONTROL_PACKET_SIZE,
        PacketKind::Event => SEQUENCE_NUMBER_SIZE + event::packed_event_size(),
        PacketKind::Audio | PacketKind::Video | PacketKind::Blob => VIDEO_SUB_HEADER_SIZE,
        PacketKind::Broken => 0,
    }
}
