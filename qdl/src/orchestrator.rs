// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! The `Session` façade spec.md §6 describes: one object owning the
//! physical link, presenting `connect`/`read_gpt`/`read_partition`/
//! `write_partition`/`erase_partition`/`read_device_info`/`reboot`/
//! `disconnect`, each taking a `CancellationToken` and a progress sink.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use crate::channel::ChannelExt;
use crate::detect::{DetectedProtocol, detect_state};
use crate::error::QdlError;
use crate::types::{
    ChipIdentity, FirehoseConfiguration, FirehoseResetMode, FirehoseStorageType, PartitionEntry,
    QdlBackend, QdlChan, QdlReadWrite,
};

/// Cooperative cancellation handle, checked between chunk boundaries on
/// long transfers (spec.md §5) - never mid-chunk, since the device would
/// be left mid-frame.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the session thinks the device is, for the auto-recovery ladder
/// (spec.md §7: `Timeout` during ACK wait -> state becomes `NoResponse`,
/// orchestrator should purge -> nop -> await Hello).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Disconnected,
    SaharaActive,
    Configured,
    NoResponse,
}

/// Merged device-identity output of `read_device_info` - `ChipIdentity`
/// plus whatever `qdl::imagescan` found in the partitions scanned.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub chip_identity: ChipIdentity,
    pub fields: HashMap<String, String>,
}

struct Link {
    rw: Box<dyn QdlReadWrite>,
    fh_cfg: FirehoseConfiguration,
}

impl QdlChan for Link {
    fn channel(&mut self) -> &mut dyn QdlReadWrite {
        &mut *self.rw
    }
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }
}

pub struct Session {
    link: Option<Link>,
    state: DeviceState,
    chip_identity: Option<ChipIdentity>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session {
            link: None,
            state: DeviceState::Disconnected,
            chip_identity: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    fn link_mut(&mut self) -> Result<&mut Link, QdlError> {
        self.link.as_mut().ok_or(QdlError::NotConfigured)
    }

    /// Open the link, run Sahara if a bootloader answers, then negotiate
    /// Firehose `configure`.
    pub fn connect(
        &mut self,
        backend: QdlBackend,
        serial_no: Option<String>,
        dev_path: Option<String>,
        programmer: Option<&[u8]>,
        storage_type: FirehoseStorageType,
    ) -> Result<DeviceState, QdlError> {
        let rw = crate::setup_target_device(backend, serial_no, dev_path)
            .map_err(|e| QdlError::ProtocolViolation(e.to_string()))?;

        let fh_cfg = FirehoseConfiguration {
            storage_type,
            backend,
            ..Default::default()
        };

        let mut link = Link { rw, fh_cfg };

        match detect_state(link.channel())? {
            DetectedProtocol::Sahara(_prefix) => {
                self.state = DeviceState::SaharaActive;
                let identity = crate::sahara::sahara_run(&mut link, true, programmer, false)?;
                self.chip_identity = Some(identity);
            }
            DetectedProtocol::Firehose(_prefix) => {
                info!("device already answering Firehose XML, skipping Sahara");
            }
            DetectedProtocol::NoResponse => {
                self.state = DeviceState::NoResponse;
                return Err(QdlError::Timeout);
            }
        }

        crate::firehose::firehose_configure(&mut link, false)?;
        crate::firehose::firehose_read(&mut link, crate::parsers::firehose_parser_configure_response)?;

        self.state = DeviceState::Configured;
        self.link = Some(link);
        Ok(self.state)
    }

    fn require_configured(&self) -> Result<(), QdlError> {
        if self.state != DeviceState::Configured {
            return Err(QdlError::NotConfigured);
        }
        Ok(())
    }

    pub fn read_gpt(&mut self, lun: u8) -> Result<Vec<PartitionEntry>, QdlError> {
        self.require_configured()?;
        let sector_size = self.link_mut()?.fh_config().storage_sector_size as u32;
        let mut blob = Vec::new();
        crate::firehose::firehose_read_storage(
            self.link_mut()?,
            &mut blob,
            34,
            0,
            lun,
            0,
        )?;
        crate::gpt::GptParser::parse(&blob, sector_size, lun)
    }

    /// Read `entry` to `dest_path`, chunked so cancellation only ever
    /// lands on a chunk boundary. Guarantees no partial file is left on
    /// disk (law §8.7): writes go to a `.part` sibling, renamed into
    /// place only on full success.
    pub fn read_partition(
        &mut self,
        entry: &PartitionEntry,
        dest_path: &Path,
        cancel: &CancellationToken,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<(), QdlError> {
        self.require_configured()?;

        let sector_size = entry.sector_size as u64;
        let total_bytes = entry.num_sectors * sector_size;
        let max_chunk_sectors =
            (self.link_mut()?.fh_config().send_buffer_size as u64 / sector_size).max(1);

        let tmp_path = dest_path.with_extension("part");
        let mut out = File::create(&tmp_path)?;

        let mut done_sectors = 0u64;
        let result = (|| -> Result<(), QdlError> {
            while done_sectors < entry.num_sectors {
                if cancel.is_cancelled() {
                    return Err(QdlError::Cancelled);
                }
                let chunk = max_chunk_sectors.min(entry.num_sectors - done_sectors);
                crate::firehose::firehose_read_storage_with_spoof(
                    self.link_mut()?,
                    &mut out,
                    chunk as usize,
                    entry.lun,
                    (entry.start_sector + done_sectors) as u32,
                    Some(entry.name.as_str()),
                )?;
                done_sectors += chunk;
                progress(done_sectors * sector_size, total_bytes);
            }
            out.flush()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                drop(out);
                std::fs::rename(&tmp_path, dest_path)?;
                Ok(())
            }
            Err(e) => {
                drop(out);
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    pub fn write_partition(
        &mut self,
        entry: &PartitionEntry,
        src_path: &Path,
        use_oppo_spoof: bool,
        cancel: &CancellationToken,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<(), QdlError> {
        self.require_configured()?;

        let sector_size = entry.sector_size as u64;
        let mut src = File::open(src_path)?;
        let file_len = src.metadata()?.len();
        let total_sectors = file_len.div_ceil(sector_size);
        let max_chunk_sectors =
            (self.link_mut()?.fh_config().send_buffer_size as u64 / sector_size).max(1);

        let label = if use_oppo_spoof {
            crate::spoof::build_spoof_strategy(entry.lun, entry.start_sector, Some(entry.name.as_str()), false)
                .into_iter()
                .find(|c| !c.label.is_empty())
                .map(|c| c.label)
                .unwrap_or_else(|| entry.name.clone())
        } else {
            entry.name.clone()
        };

        let mut done_sectors = 0u64;
        while done_sectors < total_sectors {
            if cancel.is_cancelled() {
                return Err(QdlError::Cancelled);
            }
            let chunk = max_chunk_sectors.min(total_sectors - done_sectors);
            crate::firehose::firehose_program_storage(
                self.link_mut()?,
                &mut src,
                &label,
                chunk as usize,
                0,
                entry.lun,
                &(entry.start_sector + done_sectors).to_string(),
            )?;
            done_sectors += chunk;
            progress(
                (done_sectors * sector_size).min(file_len),
                file_len,
            );
        }
        Ok(())
    }

    pub fn erase_partition(&mut self, entry: &PartitionEntry) -> Result<(), QdlError> {
        self.require_configured()?;
        crate::firehose::firehose_erase(
            self.link_mut()?,
            entry.num_sectors as usize,
            entry.lun,
            entry.start_sector,
        )
    }

    /// Merge `ChipIdentity` with an `ImageScanner` pass over each of
    /// `scan_entries` (typically `boot`/`vbmeta`/`system`), "first
    /// non-empty wins" across partitions in the order given.
    pub fn read_device_info(
        &mut self,
        scan_entries: &[PartitionEntry],
        sparse_inflate_cap: usize,
    ) -> Result<DeviceInfo, QdlError> {
        self.require_configured()?;

        let mut info = DeviceInfo {
            chip_identity: self.chip_identity.clone().unwrap_or_default(),
            fields: HashMap::new(),
        };

        for entry in scan_entries {
            let mut blob = Vec::new();
            match crate::firehose::firehose_read_storage_with_spoof(
                self.link_mut()?,
                &mut blob,
                entry.num_sectors as usize,
                entry.lun,
                entry.start_sector as u32,
                Some(entry.name.as_str()),
            ) {
                Ok(()) => {}
                Err(e) => {
                    warn!("skipping {} while scanning for device info: {e}", entry.name);
                    continue;
                }
            }
            let scanned = crate::imagescan::scan_image(&blob, sparse_inflate_cap);
            for (k, v) in scanned {
                info.fields.entry(k).or_insert(v);
            }
        }

        Ok(info)
    }

    pub fn reboot(&mut self, mode: FirehoseResetMode) -> Result<(), QdlError> {
        crate::firehose::firehose_reset(self.link_mut()?, &mode, 0)
    }

    pub fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            if self.state == DeviceState::Configured {
                let _ = crate::firehose::firehose_reset(&mut link, &FirehoseResetMode::Edl, 0);
            }
            let _ = link.channel().discard_in();
        }
        self.state = DeviceState::Disconnected;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_starts_clear() {
        let t = CancellationToken::new();
        assert!(!t.is_cancelled());
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn fresh_session_is_disconnected_and_not_configured() {
        let mut s = Session::new();
        assert_eq!(s.state(), DeviceState::Disconnected);
        assert!(matches!(s.read_gpt(0), Err(QdlError::NotConfigured)));
    }

    #[test]
    fn cancelled_read_partition_leaves_no_file_behind() {
        use std::io::Cursor;

        let mut s = Session::new();
        s.link = Some(Link {
            rw: Box::new(Cursor::new(Vec::new())),
            fh_cfg: FirehoseConfiguration::default(),
        });
        s.state = DeviceState::Configured;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let dir = std::env::temp_dir().join(format!("qdl-orch-test-{:p}", &s));
        std::fs::create_dir_all(&dir).unwrap();
        let dest = dir.join("boot.img");
        let tmp = dest.with_extension("part");
        let _ = std::fs::remove_file(&dest);
        let _ = std::fs::remove_file(&tmp);

        let entry = PartitionEntry {
            lun: 0,
            name: "boot".into(),
            start_sector: 0,
            num_sectors: 1024,
            sector_size: 512,
            type_guid: [0; 16],
            unique_guid: [0; 16],
            attributes: 0,
        };

        let result = s.read_partition(&entry, &dest, &cancel, |_, _| {});
        assert!(matches!(result, Err(QdlError::Cancelled)));
        assert!(!dest.exists());
        assert!(!tmp.exists());
    }
}
