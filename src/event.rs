// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Event records and their packed wire form.
//!
//! An event travels as a 16-bit little-endian checksum followed by the raw
//! record bytes. The packed size is a constant for a given build, but it is
//! probed once at process start by packing a sentinel record so the framer
//! never hardcodes a struct size.

use std::fmt;
use std::sync::OnceLock;

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;
use zerocopy::byteorder::little_endian::I16;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::byteorder::little_endian::U32;

/// Bytes of checksum prefixing the packed record.
pub const EVENT_CHECKSUM_SIZE: usize = 2;

/// Capacity of the inline label carried by a record.
pub const EVENT_LABEL_SIZE: usize = 16;

/// Coarse event family.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCategory {
    /// Input devices: keyboards, mice, game devices.
    Io = 1,
    /// Session control: clocks, geometry hints, state requests.
    System = 2,
    /// Descriptor-backed transfers. Never crosses the wire; rejected at the
    /// encoder boundary.
    Transfer = 3,
}

/// Payload interpretation for `EventCategory::Io`.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IoDatatype {
    Digital = 0,
    Analog = 1,
    Translated = 2,
    Touch = 3,
}

/// Fixed-layout event record. All multi-byte fields are little-endian and
/// byte-aligned so the struct packs without padding; the packed form is the
/// raw bytes of this struct.
#[derive(Copy, Clone, Debug, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct EventRecord {
    pub category: u8,
    pub datatype: u8,
    pub devid: U16,
    pub subid: U16,
    /// Digital state: 0 released, 1 pressed.
    pub active: u8,
    pub modifiers: u8,
    /// Translated keysym, when `datatype` is `Translated`.
    pub keysym: U32,
    /// Analog / touch sample pair.
    pub axes: [I16; 2],
    /// NUL-padded UTF-8 label.
    pub label: [u8; EVENT_LABEL_SIZE],
}

impl EventRecord {
    /// A digital input event (button or key press edge).
    pub fn digital(devid: u16, subid: u16, active: bool) -> EventRecord {
        EventRecord {
            category: EventCategory::Io as u8,
            datatype: IoDatatype::Digital as u8,
            devid: devid.into(),
            subid: subid.into(),
            active: active as u8,
            ..EventRecord::new_zeroed()
        }
    }

    /// A translated keyboard event with modifiers.
    pub fn translated(devid: u16, keysym: u32, modifiers: u8, active: bool) -> EventRecord {
        EventRecord {
            category: EventCategory::Io as u8,
            datatype: IoDatatype::Translated as u8,
            devid: devid.into(),
            active: active as u8,
            modifiers,
            keysym: keysym.into(),
            ..EventRecord::new_zeroed()
        }
    }

    /// An analog two-axis sample.
    pub fn analog(devid: u16, subid: u16, x: i16, y: i16) -> EventRecord {
        EventRecord {
            category: EventCategory::Io as u8,
            datatype: IoDatatype::Analog as u8,
            devid: devid.into(),
            subid: subid.into(),
            axes: [x.into(), y.into()],
            ..EventRecord::new_zeroed()
        }
    }

    pub fn category(&self) -> Option<EventCategory> {
        EventCategory::n(self.category)
    }

    pub fn datatype(&self) -> Option<IoDatatype> {
        IoDatatype::n(self.datatype)
    }

    /// Whether delivering this event requires passing a descriptor. Such
    /// events cannot be tunneled and are dropped at the encoder boundary.
    pub fn carries_descriptor(&self) -> bool {
        self.category() == Some(EventCategory::Transfer)
    }

    fn label_str(&self) -> &str {
        let end = self
            .label
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(EVENT_LABEL_SIZE);
        std::str::from_utf8(&self.label[..end]).unwrap_or("")
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.category(), self.datatype()) {
            (Some(EventCategory::Io), Some(IoDatatype::Digital)) => write!(
                f,
                "IO:DIGITAL(dev: {}, sub: {}, active: {})",
                self.devid.get(),
                self.subid.get(),
                self.active
            ),
            (Some(EventCategory::Io), Some(IoDatatype::Translated)) => write!(
                f,
                "IO:TRANSLATED(dev: {}, sym: {}, mods: {:#x}, active: {})",
                self.devid.get(),
                self.keysym.get(),
                self.modifiers,
                self.active
            ),
            (Some(EventCategory::Io), Some(IoDatatype::Analog)) => write!(
                f,
                "IO:ANALOG(dev: {}, sub: {}, x: {}, y: {})",
                self.devid.get(),
                self.subid.get(),
                self.axes[0].get(),
                self.axes[1].get()
            ),
            (Some(EventCategory::Io), Some(IoDatatype::Touch)) => write!(
                f,
                "IO:TOUCH(dev: {}, x: {}, y: {})",
                self.devid.get(),
                self.axes[0].get(),
                self.axes[1].get()
            ),
            (Some(EventCategory::System), _) => {
                write!(f, "SYSTEM(kind: {}, label: {})", self.datatype, self.label_str())
            }
            (Some(EventCategory::Transfer), _) => write!(f, "TRANSFER(descriptor)"),
            _ => write!(f, "UNKNOWN(category: {})", self.category),
        }
    }
}

/// Fletcher-16 over the packed record.
fn checksum(data: &[u8]) -> u16 {
    let mut low: u16 = 0;
    let mut high: u16 = 0;
    for b in data {
        low = (low + *b as u16) % 255;
        high = (high + low) % 255;
    }
    (high << 8) | low
}

/// Packed size of one event: checksum prefix plus the raw record. Probed once
/// per process by packing a sentinel record; falls back to the record layout
/// size should the probe buffer ever come up short.
pub fn packed_event_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let mut probe = [0u8; 128];
        pack(&EventRecord::digital(0, 0, false), &mut probe)
            .unwrap_or(EVENT_CHECKSUM_SIZE + std::mem::size_of::<EventRecord>())
    })
}

/// Serializes `ev` into `dst` as checksum + record, returning the packed
/// size, or `None` if `dst` is too small.
pub fn pack(ev: &EventRecord, dst: &mut [u8]) -> Option<usize> {
    let record = ev.as_bytes();
    let total = EVENT_CHECKSUM_SIZE + record.len();
    if dst.len() < total {
        return None;
    }
    dst[..EVENT_CHECKSUM_SIZE].copy_from_slice(&checksum(record).to_le_bytes());
    dst[EVENT_CHECKSUM_SIZE..total].copy_from_slice(record);
    Some(total)
}

/// Deserializes one packed event, verifying the checksum. Returns `None` on a
/// short buffer or checksum mismatch.
pub fn unpack(src: &[u8]) -> Option<EventRecord> {
    if src.len() < packed_event_size() {
        return None;
    }
    let wire = u16::from_le_bytes([src[0], src[1]]);
    let record = &src[EVENT_CHECKSUM_SIZE..packed_event_size()];
    if wire != checksum(record) {
        return None;
    }
    EventRecord::read_from(record)
}
