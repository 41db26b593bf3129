// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video substream postprocessing.
//!
//! The raw encodings (RGBA, RGB, RGB565) are unpacked straight out of the
//! receive scratch buffer as payload packets arrive. The deflate encodings
//! buffer the whole declared payload first, then stream it through an
//! inflater whose output lands on the destination surface in chunks of
//! arbitrary length; a small carry buffer bridges pixels split across
//! chunks. The declared expanded size is a hard cap on inflater output.

use std::io;
use std::io::Write;

use flate2::write::DeflateDecoder;
use log::debug;
use log::warn;

use crate::message::COMMIT_DISCARD;
use crate::message::COMMIT_FINAL;
use crate::message::Postprocess;
use crate::surface::Surface;
use crate::surface::pack_rgba;

/// In-progress inbound video frame on one channel. Lives from the arrival of
/// its VideoFrame control packet until the declared payload is consumed or a
/// new control packet for the channel supersedes it.
pub(crate) struct VideoFrame {
    pub stream: u32,
    pub surface_w: u16,
    pub surface_h: u16,
    pub w: u16,
    pub h: u16,
    pub x: u16,
    pub y: u16,
    pub postprocess: Postprocess,
    pub commit: u8,
    /// Compressed payload staging area, deflate encodings only.
    pub inbuf: Vec<u8>,
    /// Wire payload bytes still expected.
    pub inbuf_left: u32,
    /// Decompressed bytes the decoder may still emit before aborting.
    pub expanded_left: u32,
    /// Pixels left on the current sub-region row.
    pub row_left: usize,
    /// Next pixel slot in the destination surface.
    pub out_pos: usize,
    pub carry: [u8; 4],
    pub carry_len: u8,
}

impl VideoFrame {
    /// A descriptor that only drains its declared payload.
    pub fn drain_only(stream: u32, length: u32) -> VideoFrame {
        VideoFrame {
            stream,
            surface_w: 0,
            surface_h: 0,
            w: 0,
            h: 0,
            x: 0,
            y: 0,
            postprocess: Postprocess::Rgba,
            commit: COMMIT_DISCARD,
            inbuf: Vec::new(),
            inbuf_left: length,
            expanded_left: 0,
            row_left: 0,
            out_pos: 0,
            carry: [0; 4],
            carry_len: 0,
        }
    }
}

// 5- and 6-bit channel expansion used by the RGB565 unpack. The byte values
// are part of the wire contract; both endpoints must use these exact tables.
const RGB565_LUT5: [u8; 32] = [
    0, 8, 16, 25, 33, 41, 49, 58, 66, 74, 82, 90, 99, 107, 115, 123, 132, 140, 148, 156, 165, 173,
    181, 189, 197, 206, 214, 222, 230, 239, 247, 255,
];

const RGB565_LUT6: [u8; 64] = [
    0, 4, 8, 12, 16, 20, 24, 28, 32, 36, 40, 45, 49, 53, 57, 61, 65, 69, 73, 77, 81, 85, 89, 93,
    97, 101, 105, 109, 113, 117, 121, 125, 130, 134, 138, 142, 146, 150, 154, 158, 162, 166, 170,
    174, 178, 182, 186, 190, 194, 198, 202, 206, 210, 215, 219, 223, 227, 231, 235, 239, 243, 247,
    251, 255,
];

pub(crate) fn rgb565_expand(px: u16) -> (u8, u8, u8) {
    (
        RGB565_LUT5[((px >> 11) & 0x1f) as usize],
        RGB565_LUT6[((px >> 5) & 0x3f) as usize],
        RGB565_LUT5[(px & 0x1f) as usize],
    )
}

/// Unpacks one raw-encoded payload packet onto the destination. Signals the
/// sink when the last declared byte lands and the frame wants presentation.
pub(crate) fn unpack_vbuffer(frame: &mut VideoFrame, dest: &mut dyn Surface, data: &[u8]) {
    let pitch = dest.pitch();
    let ok = {
        let vidp = dest.pixels_mut();
        match frame.postprocess {
            Postprocess::Rgba => unpack_raw(frame, vidp, pitch, data, 4, |px| {
                pack_rgba(px[0], px[1], px[2], px[3])
            }),
            Postprocess::Rgb => unpack_raw(frame, vidp, pitch, data, 3, |px| {
                pack_rgba(px[0], px[1], px[2], 0xff)
            }),
            Postprocess::Rgb565 => unpack_raw(frame, vidp, pitch, data, 2, |px| {
                let (r, g, b) = rgb565_expand(u16::from_le_bytes([px[0], px[1]]));
                pack_rgba(r, g, b, 0xff)
            }),
            // Buffered encodings never take this path.
            Postprocess::DeltaMiniz | Postprocess::Miniz => true,
        }
    };

    if !ok {
        warn!("video frame output ran past the destination surface, discarding");
        frame.commit = COMMIT_DISCARD;
    }

    frame.inbuf_left = frame.inbuf_left.saturating_sub(data.len() as u32);
    if frame.inbuf_left == 0 {
        debug!(
            "video stream {} completed, commit: {}",
            frame.stream, frame.commit
        );
        if frame.commit == COMMIT_FINAL {
            dest.signal_video();
        }
    }
}

fn unpack_raw(
    frame: &mut VideoFrame,
    vidp: &mut [u32],
    pitch: usize,
    data: &[u8],
    px_sz: usize,
    to_px: impl Fn(&[u8]) -> u32,
) -> bool {
    if frame.w == 0 {
        return data.is_empty();
    }
    for group in data.chunks_exact(px_sz) {
        let Some(slot) = vidp.get_mut(frame.out_pos) else {
            return false;
        };
        *slot = to_px(group);
        frame.out_pos += 1;
        frame.row_left -= 1;
        if frame.row_left == 0 {
            frame.out_pos -= frame.w as usize;
            frame.out_pos += pitch;
            frame.row_left = frame.w as usize;
        }
    }
    true
}

/// Runs the buffered payload of a deflate-encoded frame through the inflater
/// and onto the destination. Any overrun of the declared expanded size or of
/// the destination aborts the frame, not the session.
pub(crate) fn decode_vbuffer(frame: &mut VideoFrame, dest: &mut dyn Surface) {
    let inbuf = std::mem::take(&mut frame.inbuf);
    let pitch = dest.pitch();
    let result = {
        let sink = PixelSink {
            delta: frame.postprocess == Postprocess::DeltaMiniz,
            vidp: dest.pixels_mut(),
            pitch,
            frame: &mut *frame,
        };
        let mut decoder = DeflateDecoder::new(sink);
        match decoder.write_all(&inbuf) {
            Ok(()) => decoder.finish().map(drop),
            Err(e) => Err(e),
        }
    };
    frame.carry_len = 0;

    if let Err(e) = result {
        warn!("video frame decompression aborted: {e}");
        frame.commit = COMMIT_DISCARD;
    }
    debug!(
        "video stream {} decoded, commit: {}",
        frame.stream, frame.commit
    );
    if frame.commit == COMMIT_FINAL {
        dest.signal_video();
    }
}

/// `io::Write` adapter the inflater drains into: converts 3-byte groups into
/// destination pixels, carrying 1..2 byte remainders across calls.
struct PixelSink<'a> {
    frame: &'a mut VideoFrame,
    vidp: &'a mut [u32],
    pitch: usize,
    delta: bool,
}

impl PixelSink<'_> {
    fn emit(&mut self, r: u8, g: u8, b: u8) -> io::Result<()> {
        let Some(slot) = self.vidp.get_mut(self.frame.out_pos) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "pixel output beyond destination surface",
            ));
        };
        if self.delta {
            // The XOR leaves alpha untouched; the keyframe set it opaque.
            *slot ^= pack_rgba(r, g, b, 0);
        } else {
            *slot = pack_rgba(r, g, b, 0xff);
        }
        self.frame.out_pos += 1;
        self.frame.row_left -= 1;
        if self.frame.row_left == 0 {
            self.frame.out_pos -= self.frame.w as usize;
            self.frame.out_pos += self.pitch;
            self.frame.row_left = self.frame.w as usize;
        }
        Ok(())
    }
}

impl Write for PixelSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len();
        if len as u64 > self.frame.expanded_left as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "decompressed output exceeds the declared expanded size",
            ));
        }
        if self.frame.w == 0 && len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "pixel output into an empty sub-region",
            ));
        }

        let mut inbuf = buf;

        // Finish a pixel split across the previous call.
        if self.frame.carry_len > 0 {
            while self.frame.carry_len < 3 {
                let Some((b, rest)) = inbuf.split_first() else {
                    self.frame.expanded_left -= len as u32;
                    return Ok(len);
                };
                self.frame.carry[self.frame.carry_len as usize] = *b;
                self.frame.carry_len += 1;
                inbuf = rest;
            }
            let [r, g, b, _] = self.frame.carry;
            self.emit(r, g, b)?;
            self.frame.carry_len = 0;
        }

        let npx = inbuf.len() / 3 * 3;
        for px in inbuf[..npx].chunks_exact(3) {
            self.emit(px[0], px[1], px[2])?;
        }

        // Stash the 1..2 byte remainder for the next call.
        for (i, b) in inbuf[npx..].iter().enumerate() {
            self.frame.carry[i] = *b;
        }
        self.frame.carry_len = (inbuf.len() - npx) as u8;

        self.frame.expanded_left -= len as u32;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use flate2::Compression;
    use flate2::write::DeflateEncoder;

    use super::*;
    use crate::surface::MemorySurface;
    use crate::surface::unpack_rgba;

    fn test_frame(pp: Postprocess, w: u16, h: u16, payload: u32, expanded: u32) -> VideoFrame {
        VideoFrame {
            stream: 1,
            surface_w: w,
            surface_h: h,
            w,
            h,
            x: 0,
            y: 0,
            postprocess: pp,
            commit: COMMIT_FINAL,
            inbuf: Vec::new(),
            inbuf_left: payload,
            expanded_left: expanded,
            row_left: w as usize,
            out_pos: 0,
            carry: [0; 4],
            carry_len: 0,
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn lut_endpoints() {
        assert_eq!(RGB565_LUT5[0], 0);
        assert_eq!(RGB565_LUT5[31], 255);
        assert_eq!(RGB565_LUT6[0], 0);
        assert_eq!(RGB565_LUT6[63], 255);
    }

    #[test]
    fn rgb565_white_is_opaque_white() {
        let mut dest = MemorySurface::new(1, 1);
        let mut frame = test_frame(Postprocess::Rgb565, 1, 1, 2, 2);
        unpack_vbuffer(&mut frame, &mut dest, &0xffffu16.to_le_bytes());
        assert_eq!(unpack_rgba(dest.pixels()[0]), (255, 255, 255, 255));
        assert_eq!(dest.signal_count(), 1);
    }

    #[test]
    fn rgba_row_advance_honors_pitch() {
        // 2x2 sub-region at (1, 0) of a 4-pixel wide surface.
        let mut dest = MemorySurface::new(4, 2);
        let mut frame = test_frame(Postprocess::Rgba, 2, 2, 16, 16);
        frame.x = 1;
        frame.out_pos = 1;
        let data: Vec<u8> = (0..4u8).flat_map(|i| [i, i, i, 0xff]).collect();
        unpack_vbuffer(&mut frame, &mut dest, &data);
        let px = dest.pixels();
        assert_eq!(px[0], 0);
        assert_eq!(px[1], pack_rgba(0, 0, 0, 0xff));
        assert_eq!(px[2], pack_rgba(1, 1, 1, 0xff));
        assert_eq!(px[3], 0);
        assert_eq!(px[5], pack_rgba(2, 2, 2, 0xff));
        assert_eq!(px[6], pack_rgba(3, 3, 3, 0xff));
    }

    #[test]
    fn carry_bridges_split_pixels() {
        let mut dest = MemorySurface::new(2, 1);
        let mut frame = test_frame(Postprocess::Miniz, 2, 1, 0, 6);
        {
            let mut sink = PixelSink {
                frame: &mut frame,
                vidp: dest.pixels_mut(),
                pitch: 2,
                delta: false,
            };
            // 6 bytes split so both pixels straddle a chunk boundary.
            assert_eq!(sink.write(&[10]).unwrap(), 1);
            assert_eq!(sink.write(&[20, 30, 40]).unwrap(), 3);
            assert_eq!(sink.write(&[50, 60]).unwrap(), 2);
        }
        assert_eq!(dest.pixels()[0], pack_rgba(10, 20, 30, 0xff));
        assert_eq!(dest.pixels()[1], pack_rgba(40, 50, 60, 0xff));
    }

    #[test]
    fn expanded_size_caps_decompression() {
        // Payload inflates to 6 bytes but the frame only declared 3.
        let mut dest = MemorySurface::new(2, 1);
        let mut frame = test_frame(Postprocess::Miniz, 2, 1, 0, 3);
        frame.inbuf = deflate(&[1, 2, 3, 4, 5, 6]);
        decode_vbuffer(&mut frame, &mut dest);
        assert_eq!(frame.commit, COMMIT_DISCARD);
        assert_eq!(dest.signal_count(), 0);
        assert_eq!(dest.pixels()[1], 0);
    }

    #[test]
    fn delta_xor_keeps_alpha_opaque() {
        let mut dest = MemorySurface::new(1, 1);
        dest.pixels_mut()[0] = pack_rgba(0x10, 0x20, 0x30, 0xff);
        let mut frame = test_frame(Postprocess::DeltaMiniz, 1, 1, 0, 3);
        frame.inbuf = deflate(&[0x01, 0x02, 0x03]);
        decode_vbuffer(&mut frame, &mut dest);
        assert_eq!(unpack_rgba(dest.pixels()[0]), (0x11, 0x22, 0x33, 0xff));
        assert_eq!(dest.signal_count(), 1);
    }

    #[test]
    fn surface_overrun_discards_frame() {
        // Frame claims more rows than the surface has.
        let mut dest = MemorySurface::new(2, 1);
        let mut frame = test_frame(Postprocess::Rgba, 2, 2, 16, 16);
        let data = [0xffu8; 16];
        unpack_vbuffer(&mut frame, &mut dest, &data);
        assert_eq!(frame.commit, COMMIT_DISCARD);
        assert_eq!(dest.signal_count(), 0);
    }
}
