// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end scenarios over an open/build session pair.

use std::fs;

use a12::PollStatus;
use a12::Session;
use a12::VframeMethod;
use a12::VframeOpts;
use a12::VideoBuffer;
use a12::event::EventRecord;
use a12::event::packed_event_size;
use a12::message::CONTROL_PACKET_SIZE;
use a12::message::ControlCommand;
use a12::message::MAC_BLOCK_SIZE;
use a12::message::PacketKind;
use a12::message::Postprocess;
use a12::message::SEQUENCE_NUMBER_SIZE;
use a12::surface::MemorySurface;
use a12::surface::pack_rgba;
use a12::surface::unpack_rgba;

/// Splits a flushed byte stream into (kind, body) packets.
fn walk_packets(bytes: &[u8]) -> Vec<(PacketKind, Vec<u8>)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let kind = PacketKind::n(bytes[i + MAC_BLOCK_SIZE]).expect("valid kind byte");
        i += MAC_BLOCK_SIZE + 1;
        let len = match kind {
            PacketKind::Control => CONTROL_PACKET_SIZE,
            PacketKind::Event => SEQUENCE_NUMBER_SIZE + packed_event_size(),
            PacketKind::Audio | PacketKind::Video | PacketKind::Blob => {
                let payload = u16::from_le_bytes([bytes[i + 5], bytes[i + 6]]) as usize;
                7 + payload
            }
            _ => panic!("unexpected packet kind {kind:?}"),
        };
        out.push((kind, bytes[i..i + len].to_vec()));
        i += len;
    }
    out
}

fn pair(key: &[u8]) -> (Session, Session) {
    let a = Session::open(key).unwrap();
    let mut b = Session::build(key).unwrap();
    b.set_destination(0, Box::new(MemorySurface::new(1, 1)));
    (a, b)
}

fn shuttle(from: &mut Session, to: &mut Session) -> Vec<(u8, EventRecord)> {
    let bytes = from.flush().to_vec();
    let mut events = Vec::new();
    to.feed(&bytes, |chid, ev| events.push((chid, *ev)));
    events
}

#[test]
fn s1_event_round_trip() {
    // Key sourced from a file, the way the pipe driver loads it.
    let dir = tempfile::tempdir().unwrap();
    let keyfile = dir.path().join("authk");
    fs::write(&keyfile, [0u8; 32]).unwrap();
    let key = fs::read(&keyfile).unwrap();

    let (mut a, mut b) = pair(&key);
    let ev = EventRecord::digital(0, 0, true);
    a.enqueue_event(&ev);

    let events = shuttle(&mut a, &mut b);
    assert_eq!(events, vec![(0, ev)]);
    assert_eq!(b.poll(), PollStatus::Ready);
}

#[test]
fn s2_small_rgba_frame_packetization() {
    let mut a = Session::build(&[1u8; 32]).unwrap();
    let pixels = [
        0xff0000ffu32, 0x00ff00ff, 0x0000ffff, 0xffffffff, 0x000000ff, 0x808080ff, 0x80000080,
        0x008000ff,
    ];
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 2), VframeOpts::default());

    let bytes = a.flush().to_vec();
    let packets = walk_packets(&bytes);
    assert_eq!(packets.len(), 2);

    let (kind, control) = &packets[0];
    assert_eq!(*kind, PacketKind::Control);
    assert_eq!(control[17], ControlCommand::VideoFrame as u8);
    assert_eq!(control[22], Postprocess::Rgba as u8);
    assert_eq!(u32::from_le_bytes(control[36..40].try_into().unwrap()), 32);
    assert_eq!(u32::from_le_bytes(control[40..44].try_into().unwrap()), 32);

    let (kind, data) = &packets[1];
    assert_eq!(*kind, PacketKind::Video);
    assert_eq!(data.len(), 7 + 32);
}

#[test]
fn s2_small_rgba_frame_round_trip() {
    let (mut a, mut b) = pair(&[0u8; 32]);
    shuttle(&mut a, &mut b);

    let pixels: Vec<u32> = (0..8u32)
        .map(|i| pack_rgba(i as u8 * 30, 10, 200 - i as u8, 0xff - i as u8))
        .collect();
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 2), VframeOpts::default());
    shuttle(&mut a, &mut b);

    let dest = b.destination(0).unwrap();
    assert_eq!((dest.width(), dest.height()), (4, 2));
    assert_eq!(dest.pixels(), pixels.as_slice());
}

#[test]
fn s3_rgb565_quantization() {
    let (mut a, mut b) = pair(&[0u8; 32]);
    shuttle(&mut a, &mut b);

    let pixels = [pack_rgba(255, 255, 255, 0x12)];
    a.enqueue_video(
        0,
        &VideoBuffer::full(&pixels, 1, 1),
        VframeOpts::with_method(VframeMethod::Rgb565),
    );

    let bytes = a.flush().to_vec();
    let packets = walk_packets(&bytes);
    // Encoded word for white is 0xffff.
    let (_, data) = &packets[1];
    assert_eq!(u16::from_le_bytes([data[7], data[8]]), 0xffff);

    b.feed(&bytes, |_, _| {});
    let dest = b.destination(0).unwrap();
    assert_eq!(unpack_rgba(dest.pixels()[0]), (255, 255, 255, 255));
}

#[test]
fn s3_rgb_forces_opaque_alpha() {
    let (mut a, mut b) = pair(&[0u8; 32]);
    shuttle(&mut a, &mut b);

    let pixels = [pack_rgba(1, 2, 3, 0x10), pack_rgba(200, 100, 50, 0x20)];
    a.enqueue_video(
        0,
        &VideoBuffer::full(&pixels, 2, 1),
        VframeOpts::with_method(VframeMethod::Rgb),
    );
    shuttle(&mut a, &mut b);

    let dest = b.destination(0).unwrap();
    assert_eq!(unpack_rgba(dest.pixels()[0]), (1, 2, 3, 255));
    assert_eq!(unpack_rgba(dest.pixels()[1]), (200, 100, 50, 255));
}

#[test]
fn s4_delta_keyframe_cadence() {
    let mut a = Session::build(&[2u8; 32]).unwrap();
    let pixels = vec![pack_rgba(9, 9, 9, 0xff); 16 * 16];

    let mut kinds = Vec::new();
    for _ in 0..8 {
        a.enqueue_video(
            0,
            &VideoBuffer::full(&pixels, 16, 16),
            VframeOpts::with_method(VframeMethod::DeltaDeflate),
        );
        let bytes = a.flush().to_vec();
        for (kind, body) in walk_packets(&bytes) {
            if kind == PacketKind::Control {
                kinds.push(Postprocess::n(body[22]).unwrap());
            }
        }
    }

    use Postprocess::{DeltaMiniz as D, Miniz as M};
    assert_eq!(kinds, [M, D, D, D, D, D, M, D]);
}

#[test]
fn s5_malformed_kind_breaks_session() {
    let mut b = Session::build(&[0u8; 32]).unwrap();
    let mut bytes = [0xa5u8; 17];
    bytes[16] = 6;
    b.feed(&bytes, |_, _| {});
    assert_eq!(b.poll(), PollStatus::Broken);
    assert!(b.flush().is_empty());
}

#[test]
fn s6_partial_feed_equivalence() {
    let key = [3u8; 32];
    let mut a = Session::open(&key).unwrap();
    a.enqueue_event(&EventRecord::digital(1, 2, true));
    let pixels: Vec<u32> = (0..8u32).map(|i| pack_rgba(i as u8, 0, 0, 0xff)).collect();
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 2), VframeOpts::default());
    a.enqueue_event(&EventRecord::analog(1, 0, -3, 4));
    let bytes = a.flush().to_vec();

    let mut one = Session::build(&key).unwrap();
    one.set_destination(0, Box::new(MemorySurface::new(1, 1)));
    let mut one_events = Vec::new();
    one.feed(&bytes, |chid, ev| one_events.push((chid, *ev)));

    let mut per = Session::build(&key).unwrap();
    per.set_destination(0, Box::new(MemorySurface::new(1, 1)));
    let mut per_events = Vec::new();
    for byte in &bytes {
        per.feed(std::slice::from_ref(byte), |chid, ev| {
            per_events.push((chid, *ev))
        });
    }

    assert_eq!(one_events.len(), 2);
    assert_eq!(one_events, per_events);
    assert_eq!(one.poll(), PollStatus::Ready);
    assert_eq!(per.poll(), PollStatus::Ready);
    assert_eq!(
        one.destination(0).unwrap().pixels(),
        per.destination(0).unwrap().pixels()
    );
    assert_eq!(per.destination(0).unwrap().pixels(), pixels.as_slice());
}

#[test]
fn delta_iframe_round_trip() {
    let (mut a, mut b) = pair(&[0u8; 32]);
    shuttle(&mut a, &mut b);

    let pixels: Vec<u32> = (0..64u32)
        .map(|i| pack_rgba(i as u8, (i * 3) as u8, (i * 5) as u8, 0xff))
        .collect();
    a.enqueue_video(
        0,
        &VideoBuffer::full(&pixels, 8, 8),
        VframeOpts::with_method(VframeMethod::DeltaDeflate),
    );
    shuttle(&mut a, &mut b);

    let dest = b.destination(0).unwrap();
    assert_eq!(dest.pixels(), pixels.as_slice());
}

#[test]
fn delta_frame_round_trip() {
    let (mut a, mut b) = pair(&[0u8; 32]);
    shuttle(&mut a, &mut b);

    let mut pixels: Vec<u32> = vec![pack_rgba(10, 20, 30, 0xff); 16];
    let opts = VframeOpts::with_method(VframeMethod::DeltaDeflate);
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 4), opts);
    shuttle(&mut a, &mut b);

    // Change two pixels; the delta frame must reproduce them on the peer.
    pixels[5] = pack_rgba(200, 20, 30, 0xff);
    pixels[10] = pack_rgba(10, 220, 30, 0xff);
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 4), opts);
    shuttle(&mut a, &mut b);

    let dest = b.destination(0).unwrap();
    assert_eq!(dest.pixels(), pixels.as_slice());
}

#[test]
fn sequence_numbers_monotonic_across_batches() {
    let mut a = Session::open(&[0u8; 32]).unwrap();
    a.flush();

    let mut seqs = Vec::new();
    for round in 0..3 {
        for i in 0..3 {
            a.enqueue_event(&EventRecord::digital(round, i, true));
        }
        let bytes = a.flush().to_vec();
        for (kind, body) in walk_packets(&bytes) {
            if kind == PacketKind::Event {
                seqs.push(u64::from_le_bytes(body[..8].try_into().unwrap()));
            }
        }
    }
    assert_eq!(seqs.len(), 9);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn video_without_destination_is_drained() {
    let key = [0u8; 32];
    let mut a = Session::open(&key).unwrap();
    let mut b = Session::build(&key).unwrap();

    let pixels = vec![pack_rgba(1, 2, 3, 4); 8];
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 2), VframeOpts::default());
    let events = shuttle(&mut a, &mut b);

    assert!(events.is_empty());
    assert_eq!(b.poll(), PollStatus::Ready);

    // Binding a destination afterwards makes the next frame land.
    b.set_destination(0, Box::new(MemorySurface::new(1, 1)));
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 2), VframeOpts::default());
    shuttle(&mut a, &mut b);
    assert_eq!(b.destination(0).unwrap().pixels(), pixels.as_slice());
}

#[test]
fn refused_resize_discards_frame_only() {
    struct FixedSurface {
        inner: MemorySurface,
    }
    impl a12::surface::Surface for FixedSurface {
        fn width(&self) -> usize {
            self.inner.width()
        }
        fn height(&self) -> usize {
            self.inner.height()
        }
        fn pitch(&self) -> usize {
            self.inner.pitch()
        }
        fn pixels(&self) -> &[u32] {
            self.inner.pixels()
        }
        fn pixels_mut(&mut self) -> &mut [u32] {
            self.inner.pixels_mut()
        }
        fn resize(&mut self, _w: usize, _h: usize) -> bool {
            false
        }
        fn signal_video(&mut self) {
            self.inner.signal_video()
        }
    }

    let key = [0u8; 32];
    let mut a = Session::open(&key).unwrap();
    let mut b = Session::build(&key).unwrap();
    b.set_destination(
        0,
        Box::new(FixedSurface {
            inner: MemorySurface::new(2, 2),
        }),
    );

    let pixels = vec![pack_rgba(1, 2, 3, 0xff); 8];
    a.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 2), VframeOpts::default());
    shuttle(&mut a, &mut b);

    // The frame was dropped but the session survives; the surface kept its
    // geometry and contents.
    assert_eq!(b.poll(), PollStatus::Ready);
    let dest = b.destination(0).unwrap();
    assert_eq!((dest.width(), dest.height()), (2, 2));
    assert_eq!(dest.pixels(), &[0u32; 4]);

    // Events still flow afterwards.
    let ev = EventRecord::digital(1, 1, false);
    a.enqueue_event(&ev);
    let events = shuttle(&mut a, &mut b);
    assert_eq!(events, vec![(0, ev)]);
}

#[test]
fn close_stops_outbound() {
    let mut a = Session::open(&[0u8; 32]).unwrap();
    a.close();
    a.enqueue_event(&EventRecord::digital(0, 0, true));
    a.enqueue_video(
        0,
        &VideoBuffer::full(&[0u32; 4], 2, 2),
        VframeOpts::default(),
    );
    assert!(a.flush().is_empty());
    assert_eq!(a.poll(), PollStatus::Broken);
}

#[test]
fn multi_frame_chunked_video() {
    // A frame larger than one chunk: payload split across several packets.
    let (mut a, mut b) = pair(&[0u8; 32]);
    shuttle(&mut a, &mut b);

    let (w, h) = (64u16, 32u16);
    let pixels: Vec<u32> = (0..(w as u32 * h as u32))
        .map(|i| pack_rgba(i as u8, (i >> 8) as u8, 0x5a, 0xff))
        .collect();
    let opts = VframeOpts {
        method: VframeMethod::Rgba,
        chunk_size: 1024,
    };
    a.enqueue_video(0, &VideoBuffer::full(&pixels, w, h), opts);

    let bytes = a.flush().to_vec();
    let packets = walk_packets(&bytes);
    let video_packets = packets
        .iter()
        .filter(|(kind, _)| *kind == PacketKind::Video)
        .count();
    // 8192 bytes of pixels at 254 pixels (1016 bytes) per packet.
    assert_eq!(video_packets, 9);

    b.feed(&bytes, |_, _| {});
    assert_eq!(b.destination(0).unwrap().pixels(), pixels.as_slice());
    assert_eq!(b.poll(), PollStatus::Ready);
}
