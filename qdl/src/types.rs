// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{Result, bail};

/// Marker trait for anything that can stand in for the physical link to
/// the device: a real serial port, a USB bulk pipe, or (in tests) an
/// in-memory `Cursor`. Blanket-implemented wherever `Read + Write` holds,
/// so new backends never need to touch the rest of the crate.
pub trait QdlReadWrite: Read + Write {}

impl<T: Read + Write + ?Sized> QdlReadWrite for T {}

/// Which physical transport carries the Sahara/Firehose byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QdlBackend {
    #[default]
    Serial,
    Usb,
}

impl FromStr for QdlBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(QdlBackend::Serial),
            "usb" => Ok(QdlBackend::Usb),
            other => bail!("Unknown backend '{other}', expected serial/usb"),
        }
    }
}

/// The storage technology behind the `<configure memory="...">` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseStorageType {
    Emmc,
    Ufs,
    Nvme,
    Nand,
}

impl FirehoseStorageType {
    pub fn as_xml_value(self) -> &'static str {
        match self {
            FirehoseStorageType::Emmc => "emmc",
            FirehoseStorageType::Ufs => "ufs",
            FirehoseStorageType::Nvme => "nvme",
            FirehoseStorageType::Nand => "nand",
        }
    }
}

impl FromStr for FirehoseStorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "emmc" => Ok(FirehoseStorageType::Emmc),
            "ufs" => Ok(FirehoseStorageType::Ufs),
            "nvme" => Ok(FirehoseStorageType::Nvme),
            "nand" => Ok(FirehoseStorageType::Nand),
            other => bail!("Unknown storage type '{other}'"),
        }
    }
}

/// What the device should do once we let go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirehoseResetMode {
    #[default]
    System,
    Edl,
    Off,
}

impl FirehoseResetMode {
    pub fn as_xml_value(self) -> &'static str {
        match self {
            FirehoseResetMode::System => "reset",
            FirehoseResetMode::Edl => "edl",
            FirehoseResetMode::Off => "off",
        }
    }
}

impl FromStr for FirehoseResetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "system" | "reset" => Ok(FirehoseResetMode::System),
            "edl" => Ok(FirehoseResetMode::Edl),
            "off" => Ok(FirehoseResetMode::Off),
            other => bail!("Unknown reset mode '{other}', expected system/edl/off"),
        }
    }
}

impl ToString for FirehoseResetMode {
    fn to_string(&self) -> String {
        self.as_xml_value().to_owned()
    }
}

/// Host-side mirror of the negotiated `<configure>` parameters.
///
/// Invariant (spec.md §3): `storage_sector_size` and `send_buffer_size`
/// always reflect what the device's `<response>` to `configure` echoed
/// back, never the values we asked for - see
/// `qdl::parsers::firehose_parser_configure_response`.
#[derive(Debug, Clone)]
pub struct FirehoseConfiguration {
    pub storage_type: FirehoseStorageType,
    pub storage_sector_size: usize,
    pub storage_slot: u8,
    /// Max bytes we may write to the device per `<program>` chunk, clamped
    /// to `[64 KiB, 16 MiB]` once the device ACKs `configure`.
    pub send_buffer_size: usize,
    pub xml_buf_size: usize,
    pub ack_every_n_packets: u16,
    pub hash_packets: bool,
    pub read_back_verify: bool,
    pub bypass_storage: bool,
    pub backend: QdlBackend,
    pub skip_firehose_log: bool,
    pub verbose_firehose: bool,
}

pub const FH_MIN_PAYLOAD_SIZE: usize = 64 * 1024;
pub const FH_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
pub const FH_DEFAULT_REQUESTED_PAYLOAD: usize = 4 * 1024 * 1024;

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        FirehoseConfiguration {
            storage_type: FirehoseStorageType::Ufs,
            storage_sector_size: 4096,
            storage_slot: 0,
            send_buffer_size: FH_DEFAULT_REQUESTED_PAYLOAD,
            xml_buf_size: 4096,
            ack_every_n_packets: 0,
            hash_packets: false,
            read_back_verify: false,
            bypass_storage: false,
            backend: QdlBackend::default(),
            skip_firehose_log: true,
            verbose_firehose: false,
        }
    }
}

impl FirehoseConfiguration {
    /// Clamp `send_buffer_size` to the legal window from spec.md §3 /
    /// invariant §8.1.
    pub fn clamp_payload_size(&mut self) {
        self.send_buffer_size = self
            .send_buffer_size
            .clamp(FH_MIN_PAYLOAD_SIZE, FH_MAX_PAYLOAD_SIZE);
    }
}

/// Everything a Firehose/Sahara call site needs out of the active session:
/// the raw channel plus the negotiated configuration. Any type that wires
/// both up (the CLI's `QdlDevice`, the library's `Session`, or a test
/// harness) implements this once and every free function in the crate
/// becomes available to it.
pub trait QdlChan {
    fn channel(&mut self) -> &mut dyn QdlReadWrite;
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
}

/// Owns the transport and the live Firehose configuration - the
/// lowest-ceremony way to call the crate's free functions, used directly by
/// the `cli`/`qramdump` binaries.
pub struct QdlDevice<'a> {
    pub rw: &'a mut dyn QdlReadWrite,
    pub fh_cfg: FirehoseConfiguration,
    /// When set, `Drop` sends a Firehose `power reset` before releasing the
    /// channel, so a half-finished session never leaves the device
    /// hanging mid-Firehose. Mirrors the teacher's `reset_on_drop` field.
    pub reset_on_drop: bool,
}

impl QdlChan for QdlDevice<'_> {
    fn channel(&mut self) -> &mut dyn QdlReadWrite {
        self.rw
    }

    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }
}

impl Drop for QdlDevice<'_> {
    fn drop(&mut self) {
        if self.reset_on_drop {
            let _ = crate::firehose_reset(self, &FirehoseResetMode::Edl, 0);
        }
    }
}

/// Populated only when the Sahara command-mode detour succeeded; any field
/// may be absent if the device didn't answer that particular `Execute`.
#[derive(Debug, Clone, Default)]
pub struct ChipIdentity {
    pub serial: Option<u32>,
    /// `msm_id:u24 | oem_id:u16 | model_id:u16` packed as described in
    /// spec.md §3 (kept as three separate fields here - packing them into
    /// one u64 buys nothing and loses precision on the oem/model fallback
    /// rule in spec.md §4.3 step 4).
    pub msm_id: Option<u32>,
    pub oem_id: Option<u16>,
    pub model_id: Option<u16>,
    pub protocol_version: u32,
    pub pk_hash: Vec<u8>,
    pub vendor_guess: Option<&'static str>,
}

/// A single partition record parsed out of a GPT.
///
/// Invariant: `num_sectors >= 1` and, when the LUN size is known,
/// `start_sector + num_sectors` does not exceed it - enforced by
/// `qdl::gpt::GptParser`, never by a caller-side assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub lun: u8,
    pub name: String,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub sector_size: u32,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub attributes: u64,
}

impl PartitionEntry {
    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.num_sectors
    }
}

/// A dynamic-partition sub-partition resolved out of `super`'s LP metadata.
///
/// Invariant: `byte_offset_within_super` is a multiple of the LP sector
/// size (512) and `absolute_device_sector` is a whole device sector -
/// both guaranteed by construction in `qdl::lp::LpMetadataParser`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpSubPartition {
    pub name: String,
    pub byte_offset_within_super: u64,
    pub byte_size: u64,
    pub absolute_device_sector: u64,
}

/// One `(filename, label, priority)` candidate the Firehose spoof strategy
/// generator can attach to a `read` request. Ephemeral: built fresh for
/// every call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoofCandidate {
    pub filename: String,
    pub label: String,
    pub priority: u32,
}
