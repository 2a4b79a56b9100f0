// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Host-side driver for Qualcomm's EDL (Emergency Download) firmware
//! update protocols: the binary Sahara bootloader handshake and the
//! XML-over-serial Firehose storage protocol, plus the partition-table
//! (GPT/LP) and image-format (sparse) parsers needed to drive them.

pub mod channel;
pub mod detect;
pub mod error;
pub mod firehose;
pub mod gpt;
pub mod imagescan;
pub mod lp;
pub mod orchestrator;
pub mod parsers;
pub mod sahara;
pub mod spoof;
pub mod sparse;
pub mod types;

#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;
#[cfg(feature = "vip")]
pub mod vip;

// Flattened re-exports: the library grew up as a handful of free
// functions plus a config struct, and call sites across `cli`/`qramdump`
// still reach for them unqualified (`qdl::firehose_configure(...)`)
// rather than through their owning module.
pub use channel::ChannelExt;
pub use error::{FirehoseError, NakError, NakKind, QdlError, SaharaStatusCode};
pub use firehose::{
    FirehoseStatus, firehose_checksum_storage, firehose_configure, firehose_erase,
    firehose_fixgpt, firehose_get_default_sector_size, firehose_get_storage_info, firehose_nop,
    firehose_patch, firehose_peek, firehose_program_storage, firehose_read, firehose_read_storage,
    firehose_read_storage_ex, firehose_read_storage_with_spoof, firehose_reset,
    firehose_send_raw_payload, firehose_set_active_slot, firehose_set_bootable,
    firehose_xml_setup, firehose_xml_verb_fire_and_forget,
};
pub use sahara::{SaharaCmdModeCmd, SaharaMode, sahara_reset, sahara_run, sahara_send_hello_rsp};
pub use types::{
    ChipIdentity, FH_DEFAULT_REQUESTED_PAYLOAD, FH_MAX_PAYLOAD_SIZE, FH_MIN_PAYLOAD_SIZE,
    FirehoseConfiguration, FirehoseResetMode, FirehoseStorageType, LpSubPartition, PartitionEntry,
    QdlBackend, QdlChan, QdlDevice, QdlReadWrite, SpoofCandidate,
};

use std::path::Path;

use anyhow::{Result, bail};

/// Open the physical link named by `backend` and return it boxed behind
/// `QdlReadWrite`, ready to be wrapped in a `QdlDevice`/`orchestrator::
/// Session`.
pub fn setup_target_device(
    backend: QdlBackend,
    serial_no: Option<String>,
    dev_path: Option<String>,
) -> Result<Box<dyn QdlReadWrite>> {
    match backend {
        #[cfg(feature = "serial")]
        QdlBackend::Serial => Ok(Box::new(serial::setup_serial_device(dev_path)?)),
        #[cfg(not(feature = "serial"))]
        QdlBackend::Serial => bail!("built without the 'serial' feature"),

        #[cfg(feature = "usb")]
        QdlBackend::Usb => {
            let _ = dev_path;
            Ok(Box::new(usb::setup_usb_device(serial_no)?))
        }
        #[cfg(not(feature = "usb"))]
        QdlBackend::Usb => {
            let _ = serial_no;
            bail!("built without the 'usb' feature")
        }
    }
}

/// Load a `(digest_blob, signature_blob)` pair off disk for the VIP
/// authentication flow - both are opaque to the host, just forwarded
/// verbatim to `vip::authenticate`.
pub fn load_vip_blobs(digest_path: &Path, signature_path: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let digest = std::fs::read(digest_path)?;
    let signature = std::fs::read(signature_path)?;
    Ok((digest, signature))
}
