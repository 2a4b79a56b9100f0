// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Blocking-with-timeout helpers layered over any `Read + Write` channel.
//!
//! Neither `QdlSerialConfig` nor `QdlUsbConfig` implement per-call
//! timeouts in their `Read` impl directly - timeouts are configured once on
//! the underlying `serial2::SerialPort`/`nusb` endpoint at setup time (see
//! `qdl::serial::setup_serial_device`, `qdl::usb::setup_usb_device`) and
//! surface as `io::ErrorKind::TimedOut`/`WouldBlock` on a read that didn't
//! complete in time. `ChannelExt` builds the deadline-aware primitives
//! spec.md §4.1 asks for on top of that contract, so it applies uniformly
//! to every backend (and to the `Cursor`-backed mock channel in tests).

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

fn is_retryable_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

pub trait ChannelExt: Read + Write {
    /// Write every byte in `bytes`. No framing is added.
    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }

    /// Read exactly `n` bytes, retrying short/timed-out reads until
    /// `deadline` elapses. Returns `None` (never a partial buffer) if the
    /// full count didn't arrive in time.
    fn read_exact_timeout(&mut self, n: usize, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; n];
        let mut filled = 0usize;

        while filled < n {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match self.read(&mut buf[filled..]) {
                Ok(0) => return Ok(None),
                Ok(k) => filled += k,
                Err(e) if is_retryable_timeout(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Some(buf))
    }

    /// Read up to `max` bytes: whatever is already buffered plus whatever
    /// arrives before the link goes quiet, but never block past `timeout`
    /// in total.
    fn read_available(&mut self, max: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut chunk = vec![0u8; max.min(64 * 1024).max(1)];

        loop {
            if out.len() >= max || Instant::now() >= deadline {
                break;
            }
            let want = (max - out.len()).min(chunk.len());
            match self.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(k) => {
                    out.extend_from_slice(&chunk[..k]);
                    // Quiescence: a short read (less than asked for) means
                    // the device has nothing more buffered right now.
                    if k < want {
                        break;
                    }
                }
                Err(e) if is_retryable_timeout(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Drain whatever is sitting in the inbound direction without blocking
    /// for long; used to resynchronise after a cancelled/aborted verb.
    fn discard_in(&mut self) -> io::Result<()> {
        let mut sink = [0u8; 4096];
        loop {
            match self.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if is_retryable_timeout(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Outbound buffers on this abstraction are never held past a single
    /// `write`/`flush`, so discarding them is just a flush - kept as a
    /// named operation so call sites read the same as spec.md §4.1.
    fn discard_out(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl<T: Read + Write + ?Sized> ChannelExt for T {}
