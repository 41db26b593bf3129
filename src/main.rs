// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pipe-backed A12 transport driver.
//!
//! Standard input and output are the transport; the driver pumps inbound
//! bytes into the session and writes flushed batches back out. It assumes a
//! pre-established secure channel (ssh, socketpair, ...) and rejects TTYs on
//! either end.

use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use a12::MAX_AUTH_KEY_SIZE;
use a12::PollStatus;
use a12::Session;
use a12::VframeOpts;
use a12::VideoBuffer;
use a12::event::EventRecord;
use a12::surface::MemorySurface;
use anyhow::Context;
use anyhow::ensure;
use argh::FromArgs;
use log::debug;
use log::info;

/// Read granularity of the transport pump.
const IO_CHUNK: usize = 9000;

/// Initial geometry of the passive-side surface; inbound frames resize it.
const DEFAULT_SURFACE_W: usize = 640;
const DEFAULT_SURFACE_H: usize = 480;

#[derive(FromArgs)]
/// Tunnel compositor traffic between stdin/stdout and a local endpoint.
struct Options {
    /// run as the passive (connecting) end
    #[argh(switch, short = 'c')]
    connect: bool,

    /// run as the active (listening) end on the given connection point
    #[argh(option, short = 's')]
    source: Option<String>,

    /// run the in-process self test, active side driving
    #[argh(switch, short = 't')]
    test: bool,

    /// run the in-process self test, passive side driving
    #[argh(switch, short = 'T')]
    test_passive: bool,

    /// authentication key file holding 1..=64 bytes
    #[argh(option, short = 'k')]
    keyfile: Option<PathBuf>,
}

enum Mode {
    Connect,
    Source(String),
    Test { passive_first: bool },
}

impl Options {
    fn mode(&self) -> anyhow::Result<Mode> {
        let picked = self.connect as usize
            + self.source.is_some() as usize
            + self.test as usize
            + self.test_passive as usize;
        ensure!(
            picked == 1,
            "pick exactly one of -c, -s <cpoint>, -t or -T"
        );
        if self.connect {
            Ok(Mode::Connect)
        } else if let Some(cpoint) = &self.source {
            Ok(Mode::Source(cpoint.clone()))
        } else {
            Ok(Mode::Test {
                passive_first: self.test_passive,
            })
        }
    }
}

fn load_key(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        // The original proxy defaults to an all-zero key when none is given;
        // useful for loopback testing only.
        None => Ok(vec![0u8; MAX_AUTH_KEY_SIZE]),
        Some(path) => {
            let key = fs::read(path)
                .with_context(|| format!("keyfile {} couldn't be read", path.display()))?;
            ensure!(
                !key.is_empty() && key.len() <= MAX_AUTH_KEY_SIZE,
                "keyfile must hold 1..={} bytes, got {}",
                MAX_AUTH_KEY_SIZE,
                key.len()
            );
            Ok(key)
        }
    }
}

fn reject_tty_transport() -> anyhow::Result<()> {
    // SAFETY: isatty only inspects the descriptor.
    let tty = unsafe {
        libc::isatty(libc::STDIN_FILENO) == 1 || libc::isatty(libc::STDOUT_FILENO) == 1
    };
    ensure!(!tty, "stdin/stdout are the transport and must not be TTYs");
    Ok(())
}

/// Pumps the transport until EOF or the session turns terminal. The state
/// machine only produces output in response to input, so a plain
/// read/feed/flush cycle suffices.
fn run_pipe(mut session: Session) -> anyhow::Result<()> {
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    let mut inbuf = [0u8; IO_CHUNK];

    loop {
        loop {
            let out = session.flush();
            if out.is_empty() {
                break;
            }
            stdout.write_all(out).context("transport write failed")?;
        }
        stdout.flush().context("transport flush failed")?;

        if session.poll() == PollStatus::Broken {
            info!("session terminated, shutting down");
            return Ok(());
        }

        let nr = stdin.read(&mut inbuf).context("transport read failed")?;
        if nr == 0 {
            info!("transport closed, shutting down");
            return Ok(());
        }
        debug!("unpack {nr} bytes");
        session.feed(&inbuf[..nr], |chid, ev| {
            debug!("event on channel {chid}: {ev}");
        });
    }
}

/// Wires an open/build pair back to back in memory and runs an event and a
/// video round trip in both directions.
fn run_self_test(key: &[u8], passive_first: bool) -> anyhow::Result<()> {
    std::env::var("ARCAN_CONNPATH").context("test mode: no ARCAN_CONNPATH env")?;

    let mut active = Session::open(key).context("couldn't build active state machine")?;
    let mut passive = Session::build(key).context("couldn't build passive state machine")?;
    passive.set_destination(
        0,
        Box::new(MemorySurface::new(DEFAULT_SURFACE_W, DEFAULT_SURFACE_H)),
    );

    let (first, second) = if passive_first {
        (&mut passive, &mut active)
    } else {
        (&mut active, &mut passive)
    };

    // Event round trip, first -> second (the active side's hello rides along).
    let ev = EventRecord::digital(1, 2, true);
    first.enqueue_event(&ev);
    let bytes = first.flush().to_vec();
    let mut got = Vec::new();
    second.feed(&bytes, |chid, ev| got.push((chid, *ev)));
    ensure!(got == [(0, ev)], "event round trip failed: {got:?}");
    ensure!(second.poll() == PollStatus::Ready, "framer not ready after events");

    // And back.
    let ev = EventRecord::translated(0, 0x71, 0, true);
    second.enqueue_event(&ev);
    let bytes = second.flush().to_vec();
    let mut got = Vec::new();
    first.feed(&bytes, |chid, ev| got.push((chid, *ev)));
    ensure!(got == [(0, ev)], "reverse event round trip failed: {got:?}");

    // Video round trip onto the passive side's surface.
    let pixels: Vec<u32> = (0..8u32).map(|i| 0xff000000 | (i * 0x1f1f1f)).collect();
    active.enqueue_video(0, &VideoBuffer::full(&pixels, 4, 2), VframeOpts::default());
    let bytes = active.flush().to_vec();
    passive.feed(&bytes, |_, _| {});
    let dest = passive.destination(0).context("destination lost")?;
    ensure!(
        dest.pixels() == pixels.as_slice() && dest.width() == 4 && dest.height() == 2,
        "video round trip failed"
    );

    info!("self test passed");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts: Options = argh::from_env();
    let key = load_key(opts.keyfile.as_deref())?;

    match opts.mode()? {
        Mode::Test { passive_first } => run_self_test(&key, passive_first),
        Mode::Connect => {
            reject_tty_transport()?;
            let mut session =
                Session::build(&key).context("couldn't allocate client state machine")?;
            session.set_destination(
                0,
                Box::new(MemorySurface::new(DEFAULT_SURFACE_W, DEFAULT_SURFACE_H)),
            );
            run_pipe(session)
        }
        Mode::Source(cpoint) => {
            reject_tty_transport()?;
            info!("serving connection point {cpoint}");
            let session = Session::open(&key).context("couldn't allocate server state machine")?;
            run_pipe(session)
        }
    }
}
