// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Android LP (dynamic-partition) metadata parser for the `super`
//! container - spec.md §4.6.

use log::warn;

use crate::error::QdlError;
use crate::types::LpSubPartition;

const LP_GEOMETRY_MAGIC: u32 = 0x616C_4467;
const LP_HEADER_MAGIC: u32 = 0x414C_5030;
const LP_HEADER_OFFSET: usize = 0x1000;
const LP_BACKUP_GEOMETRY_OFFSET: usize = 4096;
const TARGET_TYPE_LINEAR: u32 = 0;

pub struct LpMetadataParser;

struct PartitionRecord {
    name: String,
    first_extent_index: u32,
    num_extents: u32,
}

struct ExtentRecord {
    num_sectors: u64,
    target_type: u32,
    target_data: u64,
}

impl LpMetadataParser {
    /// `blob` is the first 8 KiB of `super`; `super_start_sector` is its
    /// own absolute device sector (4096-byte sectors).
    pub fn parse(
        blob: &[u8],
        super_start_sector: u64,
    ) -> Result<Vec<LpSubPartition>, QdlError> {
        let geometry_off = if read_magic(blob, 0) == Some(LP_GEOMETRY_MAGIC) {
            0
        } else if read_magic(blob, LP_BACKUP_GEOMETRY_OFFSET) == Some(LP_GEOMETRY_MAGIC) {
            LP_BACKUP_GEOMETRY_OFFSET
        } else {
            return Err(QdlError::BadImage("LP geometry magic mismatch".into()));
        };
        let _logical_block_size = read_u32(blob, geometry_off + 48)
            .ok_or_else(|| QdlError::BadImage("LP geometry truncated".into()))?;

        if read_magic(blob, LP_HEADER_OFFSET) != Some(LP_HEADER_MAGIC) {
            return Err(QdlError::BadImage("LP header magic mismatch".into()));
        }
        let header = &blob[LP_HEADER_OFFSET..];
        if header.len() < 116 {
            return Err(QdlError::BadImage("LP header truncated".into()));
        }
        let header_size = read_u32(header, 8).unwrap() as usize;

        let partitions_offset = read_u32(header, 80).unwrap() as usize;
        let partitions_count = read_u32(header, 84).unwrap() as usize;
        let partitions_entry_size = read_u32(header, 88).unwrap() as usize;

        let extents_offset = read_u32(header, 92).unwrap() as usize;
        let extents_count = read_u32(header, 96).unwrap() as usize;
        let extents_entry_size = read_u32(header, 100).unwrap() as usize;

        let partitions_start = LP_HEADER_OFFSET + header_size + partitions_offset;
        let extents_start = LP_HEADER_OFFSET + header_size + extents_offset;

        let mut partitions = Vec::with_capacity(partitions_count);
        for i in 0..partitions_count {
            let off = partitions_start + i * partitions_entry_size;
            if off + 48 > blob.len() {
                warn!("LP partition table truncated after {i} of {partitions_count} entries");
                break;
            }
            let entry = &blob[off..];
            let name = decode_ascii_trimmed(&entry[0..36]);
            let first_extent_index = u32::from_le_bytes(entry[40..44].try_into().unwrap());
            let num_extents = u32::from_le_bytes(entry[44..48].try_into().unwrap());
            partitions.push(PartitionRecord {
                name,
                first_extent_index,
                num_extents,
            });
        }

        let mut extents = Vec::with_capacity(extents_count);
        for i in 0..extents_count {
            let off = extents_start + i * extents_entry_size;
            if off + 24 > blob.len() {
                warn!("LP extent table truncated after {i} of {extents_count} entries");
                break;
            }
            let entry = &blob[off..off + 24];
            extents.push(ExtentRecord {
                num_sectors: u64::from_le_bytes(entry[0..8].try_into().unwrap()),
                target_type: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
                target_data: u64::from_le_bytes(entry[12..20].try_into().unwrap()),
            });
        }

        let mut out = Vec::new();
        for p in &partitions {
            if p.name.is_empty() {
                continue;
            }
            let my_extents = &extents[(p.first_extent_index as usize)
                .min(extents.len())
                ..((p.first_extent_index + p.num_extents) as usize).min(extents.len())];

            let total_sectors: u64 = my_extents.iter().map(|e| e.num_sectors).sum();
            let Some(first_linear) = my_extents.iter().find(|e| e.target_type == TARGET_TYPE_LINEAR)
            else {
                continue;
            };

            let byte_offset_within_super = first_linear.target_data * 512;
            let absolute_device_sector =
                super_start_sector + (first_linear.target_data * 512) / 4096;

            out.push(LpSubPartition {
                name: p.name.clone(),
                byte_offset_within_super,
                byte_size: total_sectors * 512,
                absolute_device_sector,
            });
        }

        Ok(out)
    }
}

fn read_magic(blob: &[u8], off: usize) -> Option<u32> {
    read_u32(blob, off)
}

fn read_u32(blob: &[u8], off: usize) -> Option<u32> {
    blob.get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn decode_ascii_trimmed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_synthetic_super() -> Vec<u8> {
        let mut blob = vec![0u8; 8192];

        blob[0..4].copy_from_slice(&LP_GEOMETRY_MAGIC.to_le_bytes());
        blob[48..52].copy_from_slice(&4096u32.to_le_bytes());

        let header_size = 128usize;
        blob[LP_HEADER_OFFSET..LP_HEADER_OFFSET + 4].copy_from_slice(&LP_HEADER_MAGIC.to_le_bytes());
        blob[LP_HEADER_OFFSET + 8..LP_HEADER_OFFSET + 12].copy_from_slice(&(header_size as u32).to_le_bytes());

        // partitions: offset=0, count=2, entry_size=48
        blob[LP_HEADER_OFFSET + 80..LP_HEADER_OFFSET + 84].copy_from_slice(&0u32.to_le_bytes());
        blob[LP_HEADER_OFFSET + 84..LP_HEADER_OFFSET + 88].copy_from_slice(&2u32.to_le_bytes());
        blob[LP_HEADER_OFFSET + 88..LP_HEADER_OFFSET + 92].copy_from_slice(&48u32.to_le_bytes());

        // extents: offset=96 (after 2*48=96 bytes of partitions), count=2, entry_size=24
        let extents_offset = 96u32;
        blob[LP_HEADER_OFFSET + 92..LP_HEADER_OFFSET + 96].copy_from_slice(&extents_offset.to_le_bytes());
        blob[LP_HEADER_OFFSET + 96..LP_HEADER_OFFSET + 100].copy_from_slice(&2u32.to_le_bytes());
        blob[LP_HEADER_OFFSET + 100..LP_HEADER_OFFSET + 104].copy_from_slice(&24u32.to_le_bytes());

        let partitions_start = LP_HEADER_OFFSET + header_size;
        let write_partition = |blob: &mut Vec<u8>, idx: usize, name: &str, first_extent: u32| {
            let off = partitions_start + idx * 48;
            blob[off..off + name.len()].copy_from_slice(name.as_bytes());
            blob[off + 40..off + 44].copy_from_slice(&first_extent.to_le_bytes());
            blob[off + 44..off + 48].copy_from_slice(&1u32.to_le_bytes());
        };
        write_partition(&mut blob, 0, "system_a", 0);
        write_partition(&mut blob, 1, "vendor_a", 1);

        let extents_start = LP_HEADER_OFFSET + header_size + extents_offset as usize;
        let write_extent = |blob: &mut Vec<u8>, idx: usize, num_sectors: u64, target_data: u64| {
            let off = extents_start + idx * 24;
            blob[off..off + 8].copy_from_slice(&num_sectors.to_le_bytes());
            blob[off + 8..off + 12].copy_from_slice(&TARGET_TYPE_LINEAR.to_le_bytes());
            blob[off + 12..off + 20].copy_from_slice(&target_data.to_le_bytes());
        };
        write_extent(&mut blob, 0, 2048, 0);
        write_extent(&mut blob, 1, 4096, 2048);

        blob
    }

    /// Scenario S6: LP metadata.
    #[test]
    fn parses_synthesised_super_metadata() {
        let blob = build_synthetic_super();
        let parts = LpMetadataParser::parse(&blob, 1_000_000).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "system_a");
        assert_eq!(parts[0].byte_size, 2048 * 512);
        assert_eq!(parts[1].name, "vendor_a");
        assert_eq!(parts[1].byte_offset_within_super, 2048 * 512);
    }

    /// Law §8.4: sum(byte_size) over sub-partitions doesn't exceed a
    /// plausible super size, and no two partitions' extents overlap.
    #[test]
    fn sub_partitions_do_not_overlap() {
        let blob = build_synthetic_super();
        let parts = LpMetadataParser::parse(&blob, 0).unwrap();
        let mut spans: Vec<(u64, u64)> = parts
            .iter()
            .map(|p| (p.byte_offset_within_super, p.byte_offset_within_super + p.byte_size))
            .collect();
        spans.sort();
        for w in spans.windows(2) {
            assert!(w[0].1 <= w[1].0, "overlapping extents: {w:?}");
        }
    }

    #[test]
    fn bad_geometry_magic_is_rejected() {
        let blob = vec![0u8; 8192];
        assert!(matches!(
            LpMetadataParser::parse(&blob, 0),
            Err(QdlError::BadImage(_))
        ));
    }
}
