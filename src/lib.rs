// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A12: a bidirectional framing and multiplexing protocol for tunneling
//! desktop compositor traffic (events, video frames, binary streams) over
//! any reliable, ordered byte transport.
//!
//! The crate is a pair of cooperating state machines around a [`Session`]:
//! [`Session::feed`] parses, authenticates and dispatches inbound bytes, and
//! [`Session::enqueue_event`] / [`Session::enqueue_video`] encode outbound
//! traffic into a double-buffered queue drained by [`Session::flush`]. Each
//! packet carries a keyed MAC chained on the previous packet's MAC, so
//! truncation and reordering of the stream are detected.
//!
//! Transport establishment, key exchange and presentation are the caller's
//! concern; see the `a12-netpipe` binary for a pipe-backed driver.

pub mod event;
pub mod message;
pub mod surface;

mod decode;
mod encode;
mod session;

use remain::sorted;
use thiserror::Error;

pub use encode::BufferFlags;
pub use encode::Rect;
pub use encode::VframeMethod;
pub use encode::VframeOpts;
pub use encode::VideoBuffer;
pub use session::PollStatus;
pub use session::Session;
pub use session::MAX_AUTH_KEY_SIZE;

/// Construction-time failures. Protocol-level failures never surface as
/// errors; they transition the session to the broken state instead.
#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// The authentication key length is outside 1..=64 bytes.
    #[error("authentication key must hold 1..=64 bytes, got {0}")]
    InvalidKeyLength(usize),
    /// The keyed MAC state could not be initialized.
    #[error("failed to initialize the packet MAC from the key")]
    MacInit,
}

pub type Result<T> = std::result::Result<T, Error>;
