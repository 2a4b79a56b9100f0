// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Result, bail};
use owo_colors::OwoColorize;
use std::io::{Error, ErrorKind};

use qdl::gpt::GptParser;
use qdl::types::{PartitionEntry, QdlChan};
use qdl::{self, firehose_read_storage};

/// Read and parse the primary GPT off LUN `phys_part_idx`. Mirrors the
/// teacher's two-pass probe (header first, then the full entry array) but
/// hands the raw bytes to `GptParser` instead of a strict reader, since a
/// truncated or oddly-revisioned dump shouldn't abort the whole read.
pub fn read_gpt_from_storage<T: QdlChan>(
    channel: &mut T,
    phys_part_idx: u8,
) -> Result<Vec<PartitionEntry>> {
    let sector_size = channel.fh_config().storage_sector_size as u32;

    let mut buf = Vec::new();
    firehose_read_storage(channel, &mut buf, 34, 0, phys_part_idx, 0)?;

    GptParser::parse(&buf, sector_size, phys_part_idx).map_err(|e| e.into())
}

pub fn find_part<T: QdlChan>(
    channel: &mut T,
    name: &str,
    phys_part_idx: u8,
) -> Result<PartitionEntry> {
    read_gpt_from_storage(channel, phys_part_idx)?
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::from(ErrorKind::NotFound).into())
}

pub fn print_partition_table<T: QdlChan>(channel: &mut T, phys_part_idx: u8) -> Result<()> {
    let gpt = read_gpt_from_storage(channel, phys_part_idx)?;

    println!(
        "GPT on physical partition {} of {}:",
        phys_part_idx.bright_yellow(),
        channel.fh_config().storage_type.as_xml_value().bright_yellow()
    );
    for (idx, part) in gpt.iter().enumerate() {
        let bytes = part.num_sectors * part.sector_size as u64;
        println!(
            "{}] {}: start_sector = {}, {} bytes ({} kiB)",
            idx,
            part.name,
            part.start_sector,
            bytes,
            bytes / 1024,
        );
    }

    Ok(())
}

pub fn read_storage_logical_partition<T: QdlChan>(
    channel: &mut T,
    out: &mut impl std::io::Write,
    name: &str,
    phys_part_idx: u8,
) -> Result<()> {
    let gpt = read_gpt_from_storage(channel, phys_part_idx)?;

    let part = gpt
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::from(ErrorKind::NotFound))?;

    if part.num_sectors > u32::MAX as u64 {
        bail!("partition {name} is too large to read in one call");
    }

    firehose_read_storage(
        channel,
        out,
        part.num_sectors as usize,
        0,
        phys_part_idx,
        part.start_sector as u32,
    )
    .map_err(|e| e.into())
}
