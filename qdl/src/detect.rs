// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Classify a freshly opened link as Sahara or Firehose without disturbing
//! it - spec.md §4.2.

use std::time::Duration;

use log::debug;

use crate::channel::ChannelExt;
use crate::error::QdlError;
use crate::types::QdlReadWrite;

const SAHARA_CMD_RESET_STATE_MACHINE: u32 = 0x13;
const PROBE_READ_TIMEOUT: Duration = Duration::from_millis(200);
const PROBE_TOTAL_TIMEOUT: Duration = Duration::from_secs(5);

/// What's listening at the other end of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedProtocol {
    /// `cmd == 0x01` (Sahara Hello); carries the bytes read so far so the
    /// Sahara client can consume them as its own first packet instead of
    /// re-reading them off the wire.
    Sahara(Vec<u8>),
    /// An XML prelude was seen (`<?xml`, `<response`, `<log` or `<data>`).
    Firehose(Vec<u8>),
    NoResponse,
}

fn build_reset_state_machine_packet() -> [u8; 8] {
    let mut pkt = [0u8; 8];
    pkt[0..4].copy_from_slice(&SAHARA_CMD_RESET_STATE_MACHINE.to_le_bytes());
    pkt[4..8].copy_from_slice(&8u32.to_le_bytes());
    pkt
}

fn looks_like_firehose_xml(buf: &[u8]) -> bool {
    if buf.first() != Some(&b'<') {
        return false;
    }
    const NEEDLES: &[&[u8]] = &[b"<?xml", b"<response", b"<log", b"<data>"];
    NEEDLES
        .iter()
        .any(|n| buf.len() >= n.len() && buf.windows(n.len()).any(|w| w == *n))
}

/// Probe the link. Never consumes data destructively: whatever bytes are
/// read are returned to the caller so the winning protocol client can
/// treat them as a prefix of its own stream.
pub fn detect_state<T: QdlReadWrite + ?Sized>(chan: &mut T) -> Result<DetectedProtocol, QdlError> {
    let started = std::time::Instant::now();

    // Step 1: nudge a possibly-idle Sahara bootloader into re-sending Hello.
    // Only meaningful the very first time around; a channel that already
    // has bytes queued up is left alone.
    let _ = chan.write_all_bytes(&build_reset_state_machine_packet());

    loop {
        match chan.read_exact_timeout(8, PROBE_READ_TIMEOUT)? {
            Some(head) => {
                let cmd = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
                if cmd == 0x01 {
                    debug!("state detector: saw Sahara Hello (cmd=0x01)");
                    return Ok(DetectedProtocol::Sahara(head));
                }
                if looks_like_firehose_xml(&head) {
                    debug!("state detector: saw Firehose XML prelude");
                    return Ok(DetectedProtocol::Firehose(head));
                }
                // Keep reading a little more in case the XML needle just
                // missed the 8-byte window (e.g. "<?xml vers" split oddly).
                if head.first() == Some(&b'<') {
                    if let Ok(Some(more)) = chan.read_exact_timeout(64, PROBE_READ_TIMEOUT) {
                        let mut combined = head.clone();
                        combined.extend_from_slice(&more);
                        if looks_like_firehose_xml(&combined) {
                            return Ok(DetectedProtocol::Firehose(combined));
                        }
                    }
                }
            }
            None => { /* nothing arrived within the probe window, keep retrying */ }
        }

        if started.elapsed() >= PROBE_TOTAL_TIMEOUT {
            return Ok(DetectedProtocol::NoResponse);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_sahara_hello() {
        let mut pkt = vec![];
        pkt.extend_from_slice(&1u32.to_le_bytes());
        pkt.extend_from_slice(&0x30u32.to_le_bytes());
        pkt.extend_from_slice(&[0u8; 0x30 - 8]);
        let mut chan = std::io::Cursor::new(pkt);
        match detect_state(&mut chan).unwrap() {
            DetectedProtocol::Sahara(_) => {}
            other => panic!("expected Sahara, got {other:?}"),
        }
    }

    #[test]
    fn recognises_firehose_xml() {
        let mut chan =
            std::io::Cursor::new(b"<?xml version=\"1.0\" ?><data><log value=\"hi\"/></data>".to_vec());
        match detect_state(&mut chan).unwrap() {
            DetectedProtocol::Firehose(_) => {}
            other => panic!("expected Firehose, got {other:?}"),
        }
    }
}
