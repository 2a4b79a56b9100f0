// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! The XML-over-stream Firehose protocol: request framing, response
//! parsing, raw-data framing for `read`/`program`, and the storage verbs
//! built on top. spec.md §4.4.

use std::io::{Read, Write};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::error::QdlError;
use crate::types::{FirehoseResetMode, QdlChan};

/// Result of a simple ACK/NAK exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseStatus {
    Ack,
    Nak,
}

const RESPONSE_READ_CHUNK_TIMEOUT: Duration = Duration::from_millis(500);
const RESPONSE_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
const SIMPLE_VERB_RETRY_BUDGET: u32 = 50;
const FIXGPT_RETRY_BUDGET: u32 = 600;
const RETRY_PERIOD: Duration = Duration::from_millis(100);

/// Build a single-verb Firehose request document:
/// `<?xml version="1.0" ?><data><verb attr="value" .../></data>`.
/// Attribute order is preserved exactly as given - the device's XML
/// matcher is case- and order-sensitive for some fields in practice, so
/// callers always pass attributes in the order spec.md lists them.
pub fn firehose_xml_setup(verb: &str, attrs: &[(&str, &str)]) -> Result<Vec<u8>, QdlError> {
    let mut out = String::with_capacity(128);
    out.push_str("<?xml version=\"1.0\" ?><data><");
    out.push_str(verb);
    for (k, v) in attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(v);
        out.push('"');
    }
    out.push_str(" /></data>");
    Ok(out.into_bytes())
}

fn send_verb<T: QdlChan>(dev: &mut T, verb: &str, attrs: &[(&str, &str)]) -> Result<(), QdlError> {
    let xml = firehose_xml_setup(verb, attrs)?;
    trace!("-> {}", String::from_utf8_lossy(&xml));
    dev.channel().write_all(&xml)?;
    Ok(())
}

/// Accumulate bytes until a complete `<data>...</data>` fragment has been
/// seen, per the teacher's observation that fragments may arrive split
/// across reads (spec.md's Design Notes §9).
fn accumulate_fragment<T: QdlChan>(dev: &mut T) -> Result<Vec<u8>, QdlError> {
    let deadline = std::time::Instant::now() + RESPONSE_TOTAL_TIMEOUT;
    let mut buf = Vec::new();
    loop {
        if std::time::Instant::now() >= deadline {
            return Err(QdlError::Timeout);
        }
        let chunk = crate::channel::ChannelExt::read_available(
            dev.channel(),
            4096,
            RESPONSE_READ_CHUNK_TIMEOUT,
        )?;
        if chunk.is_empty() {
            continue;
        }
        buf.extend_from_slice(&chunk);
        if let Some(idx) = find_subslice(&buf, b"</data>") {
            return Ok(buf[..idx + b"</data>".len()].to_vec());
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

/// Parse a `<data>...</data>` fragment into its `<log>` values (in order)
/// and the final `<response>`'s attribute map.
fn parse_fragment(bytes: &[u8]) -> Result<(Vec<String>, IndexMap<String, String>), QdlError> {
    let root = xmltree::Element::parse(bytes)?;
    let mut logs = Vec::new();
    let mut response_attrs = IndexMap::new();
    for node in root.children.iter() {
        if let xmltree::XMLNode::Element(e) = node {
            match e.name.as_str() {
                "log" => {
                    if let Some(v) = e.attributes.get("value") {
                        logs.push(v.clone());
                    }
                }
                "response" => {
                    response_attrs = e.attributes.clone();
                }
                _ => {}
            }
        }
    }
    Ok((logs, response_attrs))
}

fn emit_logs(logs: &[String]) {
    for l in logs {
        debug!("[device] {l}");
    }
}

/// Read the next Firehose response fragment and hand its `<response>`
/// attributes to `parser`. Every `<log>` fragment is surfaced to the log
/// sink before `parser` runs, per spec.md §4.4.
pub fn firehose_read<T: QdlChan>(
    dev: &mut T,
    parser: fn(&mut T, &IndexMap<String, String>) -> Result<FirehoseStatus, QdlError>,
) -> Result<FirehoseStatus, QdlError> {
    let fragment = accumulate_fragment(dev)?;
    let (logs, attrs) = parse_fragment(&fragment)?;
    emit_logs(&logs);
    parser(dev, &attrs)
}

/// Retry a simple XML verb up to `budget` times, `period` apart, until it
/// ACKs.
fn send_and_await_ack<T: QdlChan>(
    dev: &mut T,
    verb: &str,
    attrs: &[(&str, &str)],
    budget: u32,
    period: Duration,
) -> Result<(), QdlError> {
    let mut last_err = QdlError::Timeout;
    for attempt in 0..budget {
        send_verb(dev, verb, attrs)?;
        match firehose_read(dev, crate::parsers::firehose_parser_ack_nak) {
            Ok(FirehoseStatus::Ack) => return Ok(()),
            Ok(FirehoseStatus::Nak) => {
                last_err = QdlError::DeviceNak {
                    kind: crate::error::NakKind::Other,
                    raw_message: format!("{verb} NAKed"),
                };
            }
            Err(e) => last_err = e,
        }
        if attempt + 1 < budget {
            std::thread::sleep(period);
        }
    }
    Err(last_err)
}

/// Negotiate the host/device capabilities. Invariant (spec.md §3): the
/// stored `storage_sector_size`/`send_buffer_size` always come from the
/// device's ACK, never from what we requested - enforced in
/// `qdl::parsers::firehose_parser_configure_response`.
pub fn firehose_configure<T: QdlChan>(dev: &mut T, skip_storage_init: bool) -> Result<(), QdlError> {
    dev.mut_fh_config().clamp_payload_size();
    let cfg = dev.fh_config().clone();
    send_verb(
        dev,
        "configure",
        &[
            ("MemoryName", cfg.storage_type.as_xml_value()),
            ("Verbose", "0"),
            ("AlwaysValidate", "0"),
            ("ZLPAwareHost", "1"),
            (
                "MaxPayloadSizeToTargetInBytes",
                &cfg.send_buffer_size.to_string(),
            ),
            (
                "SkipStorageInit",
                if skip_storage_init { "1" } else { "0" },
            ),
        ],
    )
}

/// Simple no-op keepalive/probe.
pub fn firehose_nop<T: QdlChan>(dev: &mut T) -> Result<(), QdlError> {
    send_and_await_ack(dev, "nop", &[], SIMPLE_VERB_RETRY_BUDGET, RETRY_PERIOD)
}

/// Reset or power off the device.
pub fn firehose_reset<T: QdlChan>(
    dev: &mut T,
    mode: &FirehoseResetMode,
    delay_in_seconds: u32,
) -> Result<(), QdlError> {
    send_and_await_ack(
        dev,
        "power",
        &[
            ("value", mode.as_xml_value()),
            ("DelayInSeconds", &delay_in_seconds.to_string()),
        ],
        SIMPLE_VERB_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

pub fn firehose_set_bootable<T: QdlChan>(dev: &mut T, phys_part_idx: u8) -> Result<(), QdlError> {
    send_and_await_ack(
        dev,
        "setbootablestoragedrive",
        &[("value", &phys_part_idx.to_string())],
        SIMPLE_VERB_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

pub fn firehose_set_active_slot<T: QdlChan>(dev: &mut T, slot: &str) -> Result<(), QdlError> {
    send_and_await_ack(
        dev,
        "setactiveslot",
        &[("slot", slot)],
        SIMPLE_VERB_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

pub fn firehose_erase<T: QdlChan>(
    dev: &mut T,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: u64,
) -> Result<(), QdlError> {
    let sector_size = dev.fh_config().storage_sector_size;
    send_and_await_ack(
        dev,
        "erase",
        &[
            ("SECTOR_SIZE_IN_BYTES", &sector_size.to_string()),
            ("num_partition_sectors", &num_sectors.to_string()),
            ("physical_partition_number", &phys_part_idx.to_string()),
            ("start_sector", &start_sector.to_string()),
        ],
        SIMPLE_VERB_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

/// `<getstorageinfo>`: per-LUN storage metadata, reported entirely via
/// `<log>` lines rather than `<response>` attributes on real devices, so
/// this just drives the exchange and lets `firehose_read`'s log sink
/// surface the content.
pub fn firehose_get_storage_info<T: QdlChan>(dev: &mut T, phys_part_idx: u8) -> Result<(), QdlError> {
    send_verb(
        dev,
        "getstorageinfo",
        &[("physical_partition_number", &phys_part_idx.to_string())],
    )?;
    match firehose_read(dev, crate::parsers::firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(QdlError::DeviceNak {
            kind: crate::error::NakKind::Other,
            raw_message: "getstorageinfo NAKed".into(),
        }),
    }
}

pub fn firehose_fixgpt<T: QdlChan>(dev: &mut T, phys_part_idx: u8) -> Result<(), QdlError> {
    send_and_await_ack(
        dev,
        "fixgpt",
        &[("physical_partition_number", &phys_part_idx.to_string())],
        FIXGPT_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

pub fn firehose_patch<T: QdlChan>(
    dev: &mut T,
    byte_offset: u64,
    slot: u8,
    phys_part_idx: u8,
    size_in_bytes: u64,
    start_sector: &str,
    value: &str,
) -> Result<(), QdlError> {
    let _ = slot;
    send_and_await_ack(
        dev,
        "patch",
        &[
            ("byte_offset", &byte_offset.to_string()),
            ("physical_partition_number", &phys_part_idx.to_string()),
            ("size_in_bytes", &size_in_bytes.to_string()),
            ("start_sector", start_sector),
            ("value", value),
            ("filename", "DISK"),
        ],
        SIMPLE_VERB_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

/// Verify-only checksum of a storage range (the `<getsha256digest>` verb);
/// the digest itself arrives as a `<log>` line which is already surfaced
/// by `firehose_read`.
pub fn firehose_checksum_storage<T: QdlChan>(
    dev: &mut T,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: u32,
) -> Result<(), QdlError> {
    let sector_size = dev.fh_config().storage_sector_size;
    send_and_await_ack(
        dev,
        "getsha256digest",
        &[
            ("SECTOR_SIZE_IN_BYTES", &sector_size.to_string()),
            ("num_partition_sectors", &num_sectors.to_string()),
            ("physical_partition_number", &phys_part_idx.to_string()),
            ("start_sector", &start_sector.to_string()),
        ],
        SIMPLE_VERB_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

fn size_in_kb_string(num_sectors: usize, sector_size: usize) -> String {
    let bytes = num_sectors as u128 * sector_size as u128;
    let whole = bytes / 1024;
    let frac = (bytes % 1024) * 10 / 1024;
    format!("{whole}.{frac}")
}

/// One `(label, filename)` spoof candidate to attach to a `read` call, or
/// `None` for a bare read.
pub use crate::types::SpoofCandidate;

/// Owned scratch storage for a `read` request's attribute values, so the
/// `(&str, &str)` slice handed to `send_verb` can borrow from something
/// that outlives the call without leaking.
struct ReadAttrScratch {
    sector_size: String,
    num_sectors: String,
    phys_part_idx: String,
    size_in_kb: String,
    filename: Option<String>,
    label: Option<String>,
    start_byte_hex: String,
}

fn read_request_attrs<'a>(
    scratch: &'a ReadAttrScratch,
    start_sector_str: &'a str,
    is_gpt: bool,
) -> Vec<(&'a str, &'a str)> {
    let mut attrs: Vec<(&str, &str)> = vec![
        ("SECTOR_SIZE_IN_BYTES", scratch.sector_size.as_str()),
        ("num_partition_sectors", scratch.num_sectors.as_str()),
        ("physical_partition_number", scratch.phys_part_idx.as_str()),
        ("size_in_KB", scratch.size_in_kb.as_str()),
        ("start_sector", start_sector_str),
    ];
    if let (Some(filename), Some(label)) = (&scratch.filename, &scratch.label) {
        attrs.push(("filename", filename.as_str()));
        attrs.push(("label", label.as_str()));
        attrs.push(("sparse", "false"));
    }
    if is_gpt {
        attrs.push(("file_sector_offset", "0"));
        attrs.push(("partofsingleimage", "true"));
        attrs.push(("readbackverify", "false"));
        attrs.push(("start_byte_hex", scratch.start_byte_hex.as_str()));
    }
    attrs
}

/// Wait for the `<response rawmode="true".../></data>` prelude that
/// precedes a raw binary payload, or classify and return the NAK if the
/// device rejected the request outright. Returns the first chunk of the
/// binary payload that happened to already be in the buffer when
/// `</data>` closed (spec.md's Design Notes §9).
fn await_rawmode_prelude<T: QdlChan>(dev: &mut T) -> Result<Vec<u8>, QdlError> {
    let deadline = std::time::Instant::now() + RESPONSE_TOTAL_TIMEOUT;
    let mut buf = Vec::new();
    loop {
        if std::time::Instant::now() >= deadline {
            return Err(QdlError::Timeout);
        }
        let chunk = crate::channel::ChannelExt::read_available(
            dev.channel(),
            8192,
            RESPONSE_READ_CHUNK_TIMEOUT,
        )?;
        if chunk.is_empty() {
            continue;
        }
        buf.extend_from_slice(&chunk);

        let Some(end) = find_subslice(&buf, b"</data>") else {
            continue;
        };
        let xml_end = end + b"</data>".len();
        let xml_part = &buf[..xml_end];
        let has_rawmode = find_subslice(xml_part, b"rawmode=\"true\"").is_some();

        if !has_rawmode {
            let (logs, attrs) = parse_fragment(xml_part)?;
            emit_logs(&logs);
            let raw_message = attrs
                .get("value")
                .cloned()
                .unwrap_or_else(|| "NAK".to_string());
            return Err(QdlError::DeviceNak {
                kind: crate::error::NakKind::classify(&raw_message),
                raw_message,
            });
        }

        let (logs, _attrs) = parse_fragment(xml_part)?;
        emit_logs(&logs);

        let mut payload_start = xml_end;
        while buf.get(payload_start) == Some(&b'\r') || buf.get(payload_start) == Some(&b'\n') {
            payload_start += 1;
        }
        return Ok(buf[payload_start..].to_vec());
    }
}

/// Read `num_sectors` of `sector_size` bytes each, optionally spoofed, and
/// write the raw payload to `out`. This is the core raw-mode read of
/// spec.md §4.4.
pub fn firehose_read_storage_ex<T: QdlChan>(
    dev: &mut T,
    out: &mut impl Write,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: u32,
    spoof: Option<&SpoofCandidate>,
) -> Result<(), QdlError> {
    if dev.fh_config().storage_sector_size == 0 {
        return Err(QdlError::NotConfigured);
    }
    let sector_size = dev.fh_config().storage_sector_size;
    let is_gpt = start_sector <= 33;
    let start_sector_str = start_sector.to_string();
    let scratch = ReadAttrScratch {
        sector_size: sector_size.to_string(),
        num_sectors: num_sectors.to_string(),
        phys_part_idx: phys_part_idx.to_string(),
        size_in_kb: size_in_kb_string(num_sectors, sector_size),
        filename: spoof
            .filter(|s| !s.filename.is_empty())
            .map(|s| s.filename.clone()),
        label: spoof
            .filter(|s| !s.filename.is_empty())
            .map(|s| s.label.clone()),
        start_byte_hex: format!("0x{:x}", start_sector as u64 * sector_size as u64),
    };
    let attrs = read_request_attrs(&scratch, &start_sector_str, is_gpt);
    send_verb(dev, "read", &attrs)?;

    let mut remaining = num_sectors as u64 * sector_size as u64;
    let first_chunk = await_rawmode_prelude(dev)?;
    let take = (first_chunk.len() as u64).min(remaining) as usize;
    out.write_all(&first_chunk[..take])?;
    remaining -= take as u64;

    while remaining > 0 {
        let want = remaining.min(1024 * 1024) as usize;
        let Some(chunk) =
            crate::channel::ChannelExt::read_exact_timeout(dev.channel(), want, RESPONSE_TOTAL_TIMEOUT)?
        else {
            return Err(QdlError::Timeout);
        };
        out.write_all(&chunk)?;
        remaining -= chunk.len() as u64;
    }

    match firehose_read(dev, crate::parsers::firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(QdlError::DeviceNak {
            kind: crate::error::NakKind::Other,
            raw_message: "read: trailing NAK".into(),
        }),
    }
}

/// Convenience wrapper matching the positional signature the CLI/program-
/// file parser call sites use; never spoofs.
pub fn firehose_read_storage<T: QdlChan>(
    dev: &mut T,
    out: &mut impl Write,
    num_sectors: usize,
    _slot: u8,
    phys_part_idx: u8,
    start_sector: u32,
) -> Result<(), QdlError> {
    firehose_read_storage_ex(dev, out, num_sectors, phys_part_idx, start_sector, None)
}

/// Attempt the VIP spoof-strategy list in priority order against a single
/// read, returning the first strategy that yields a valid payload
/// (spec.md §4.4's spoof fallback loop - one strategy at a time, fully
/// consuming its NAK before trying the next).
pub fn firehose_read_storage_with_spoof<T: QdlChan>(
    dev: &mut T,
    out: &mut impl Write,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: u32,
    partition_name: Option<&str>,
) -> Result<(), QdlError> {
    let is_gpt = start_sector <= 33;
    let strategies =
        crate::spoof::build_spoof_strategy(phys_part_idx, start_sector as u64, partition_name, is_gpt);

    let mut last_err = QdlError::NotConfigured;
    for strat in &strategies {
        let candidate = if strat.filename.is_empty() {
            None
        } else {
            Some(strat)
        };
        let mut staging = Vec::new();
        match firehose_read_storage_ex(dev, &mut staging, num_sectors, phys_part_idx, start_sector, candidate) {
            Ok(()) => {
                out.write_all(&staging)?;
                return Ok(());
            }
            Err(QdlError::DeviceNak { kind, raw_message }) if !kind.is_fatal() => {
                debug!("spoof strategy '{}' NAKed ({raw_message}), trying next", strat.label);
                last_err = QdlError::DeviceNak { kind, raw_message };
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

/// Program (write) a file to storage. Symmetric to
/// `firehose_read_storage_ex`: the device answers the `<program>` XML with
/// `rawmode="true"`, then the host streams the file padded to a sector
/// boundary, then waits for the final ACK/NAK.
pub fn firehose_program_storage<T: QdlChan>(
    dev: &mut T,
    src: &mut impl Read,
    label: &str,
    num_sectors: usize,
    _slot: u8,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<(), QdlError> {
    if dev.fh_config().storage_sector_size == 0 {
        return Err(QdlError::NotConfigured);
    }
    let sector_size = dev.fh_config().storage_sector_size;
    let is_gpt = start_sector.parse::<u64>().map(|s| s <= 33).unwrap_or(false);

    let sector_size_str = sector_size.to_string();
    let num_sectors_str = num_sectors.to_string();
    let phys_part_idx_str = phys_part_idx.to_string();
    let start_byte_hex = format!(
        "0x{:x}",
        start_sector.parse::<u64>().unwrap_or(0) * sector_size as u64
    );
    let mut attrs: Vec<(&str, &str)> = vec![
        ("SECTOR_SIZE_IN_BYTES", sector_size_str.as_str()),
        ("num_partition_sectors", num_sectors_str.as_str()),
        ("physical_partition_number", phys_part_idx_str.as_str()),
        ("start_sector", start_sector),
        ("label", label),
    ];
    if is_gpt {
        attrs.push(("file_sector_offset", "0"));
        attrs.push(("partofsingleimage", "true"));
        attrs.push(("readbackverify", if dev.fh_config().read_back_verify { "true" } else { "false" }));
        attrs.push(("start_byte_hex", start_byte_hex.as_str()));
    }
    send_verb(dev, "program", &attrs)?;

    let _ = await_rawmode_prelude(dev)?;

    if dev.fh_config().bypass_storage {
        // Still have to consume the exact byte count the device expects,
        // but never actually touch storage - used for USB throughput
        // testing.
    }

    let total_bytes = num_sectors as u64 * sector_size as u64;
    let mut sent = 0u64;
    let mut buf = vec![0u8; dev.fh_config().send_buffer_size.max(sector_size)];
    while sent < total_bytes {
        let want = ((total_bytes - sent) as usize).min(buf.len());
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            // Zero-pad the remainder to a sector boundary.
            buf[..want].fill(0);
            dev.channel().write_all(&buf[..want])?;
            sent += want as u64;
            continue;
        }
        dev.channel().write_all(&buf[..n])?;
        sent += n as u64;
    }

    match firehose_read(dev, crate::parsers::firehose_parser_ack_nak)? {
        FirehoseStatus::Ack => Ok(()),
        FirehoseStatus::Nak => Err(QdlError::DeviceNak {
            kind: crate::error::NakKind::WriteFail,
            raw_message: "program: trailing NAK".into(),
        }),
    }
}

/// Peek at device memory (debug aid exposed by most Firehose programmers).
pub fn firehose_peek<T: QdlChan>(dev: &mut T, base: u64, len: u64) -> Result<(), QdlError> {
    send_and_await_ack(
        dev,
        "peek",
        &[
            ("address64", &format!("0x{base:x}")),
            ("size_in_bytes", &len.to_string()),
        ],
        SIMPLE_VERB_RETRY_BUDGET,
        RETRY_PERIOD,
    )
}

/// Default sector size for a storage type, used when the CLI wasn't given
/// an explicit `--sector-size` (the authoritative value still comes from
/// the device's `configure` ACK once available).
pub fn firehose_get_default_sector_size(storage_type: &str) -> Option<usize> {
    match storage_type.to_ascii_lowercase().as_str() {
        "emmc" => Some(512),
        "ufs" => Some(4096),
        _ => None,
    }
}

/// Send a raw (non-XML) binary blob directly over the channel - used by
/// the VIP Digest/Signature blob steps, which precede `<transfercfg>`/
/// `<verify>`/`<sha256init>` and are not XML-framed themselves.
pub fn firehose_send_raw_payload<T: QdlChan>(dev: &mut T, blob: &[u8]) -> Result<(), QdlError> {
    dev.channel().write_all(blob)?;
    Ok(())
}

/// Send a single VIP auth-extension verb and swallow a NAK (log only) -
/// spec.md §4.4: "Each step logs but does not abort on NAK."
pub fn firehose_xml_verb_fire_and_forget<T: QdlChan>(
    dev: &mut T,
    verb: &str,
    attrs: &[(&str, &str)],
) -> Result<(), QdlError> {
    send_verb(dev, verb, attrs)?;
    match firehose_read(dev, crate::parsers::firehose_parser_ack_nak) {
        Ok(_) => Ok(()),
        Err(QdlError::DeviceNak { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct MockChan {
        inbox: Cursor<Vec<u8>>,
        outbox: Vec<u8>,
    }
    impl Read for MockChan {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.inbox.read(buf)?;
            if n == 0 {
                Err(std::io::Error::from(std::io::ErrorKind::TimedOut))
            } else {
                Ok(n)
            }
        }
    }
    impl Write for MockChan {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbox.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    struct MockDev {
        chan: MockChan,
        cfg: crate::types::FirehoseConfiguration,
    }
    impl QdlChan for MockDev {
        fn channel(&mut self) -> &mut dyn crate::types::QdlReadWrite {
            &mut self.chan
        }
        fn fh_config(&self) -> &crate::types::FirehoseConfiguration {
            &self.cfg
        }
        fn mut_fh_config(&mut self) -> &mut crate::types::FirehoseConfiguration {
            &mut self.cfg
        }
    }

    /// Scenario S3: Firehose configure.
    #[test]
    fn configure_stores_device_echoed_values() {
        let resp = br#"<?xml version="1.0" ?><data><response value="ACK" SectorSizeInBytes="4096" MaxPayloadSizeToTargetInBytes="1048576" MaxPayloadSizeToTargetInBytesSupported="1048576" MaxXMLSizeInBytes="4096" Version="1" MinVersionSupported="1"/></data>"#.to_vec();
        let mut dev = MockDev {
            chan: MockChan {
                inbox: Cursor::new(resp),
                outbox: vec![],
            },
            cfg: Default::default(),
        };
        firehose_configure(&mut dev, false).unwrap();
        firehose_read(&mut dev, crate::parsers::firehose_parser_configure_response).unwrap();
        assert_eq!(dev.fh_config().send_buffer_size, 1_048_576);
        assert_eq!(dev.fh_config().storage_sector_size, 4096);
    }

    /// S4's rawmode prelude carries a `<log>` ahead of the `<response>`;
    /// `await_rawmode_prelude` must not swallow it on the success path.
    #[test]
    fn rawmode_prelude_surfaces_logs_before_binary() {
        let prelude =
            b"<?xml version=\"1.0\" ?><data><log value=\"hi\"/><response value=\"ACK\" rawmode=\"true\"/></data>";
        let (logs, attrs) = parse_fragment(prelude).unwrap();
        assert_eq!(logs, vec!["hi".to_string()]);
        assert_eq!(attrs.get("rawmode").map(String::as_str), Some("true"));
    }

    /// Scenario S4: Firehose read with rawmode.
    #[test]
    fn read_storage_switches_to_rawmode() {
        let pattern: Vec<u8> = (0..34 * 4096u32).map(|i| (i & 0xFF) as u8).collect();
        let mut resp = Vec::new();
        resp.extend_from_slice(
            b"<?xml version=\"1.0\" ?><data><log value=\"hi\"/><response value=\"ACK\" rawmode=\"true\"/></data>\n",
        );
        resp.extend_from_slice(&pattern);
        resp.extend_from_slice(b"<?xml version=\"1.0\" ?><data><response value=\"ACK\"/></data>");

        let mut dev = MockDev {
            chan: MockChan {
                inbox: Cursor::new(resp),
                outbox: vec![],
            },
            cfg: crate::types::FirehoseConfiguration {
                storage_sector_size: 4096,
                ..Default::default()
            },
        };

        let mut out = Vec::new();
        firehose_read_storage(&mut dev, &mut out, 34, 0, 0, 0).unwrap();
        assert_eq!(out, pattern);
    }
}
