// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! VIP spoof-strategy generation for locked devices (OPPO/Realme/OnePlus) -
//! spec.md §4.4 "Spoof strategy (VIP)".

use crate::types::SpoofCandidate;

fn sanitize_partition_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Build the ordered, deduplicated list of `(label, filename)` candidates
/// for a `read(lun, start_sector, ..)` call. The empty strategy (no
/// filename/label attributes at all) is always last - law §8.6.
pub fn build_spoof_strategy(
    lun: u8,
    start_sector: u64,
    partition_name: Option<&str>,
    is_gpt: bool,
) -> Vec<SpoofCandidate> {
    let mut out: Vec<SpoofCandidate> = Vec::new();
    let mut priority = 0u32;
    let mut push = |filename: String, label: String| {
        out.push(SpoofCandidate {
            filename,
            label,
            priority,
        });
        priority += 1;
    };

    if start_sector <= 33 || is_gpt {
        push(format!("PrimaryGPT/gpt_main{lun}.bin"), "PrimaryGPT".into());
        push(
            format!("BackupGPT/gpt_backup{lun}.bin"),
            "BackupGPT".into(),
        );
    }

    if let Some(name) = partition_name {
        let sanitized = sanitize_partition_name(name);
        if !sanitized.is_empty() {
            push(
                format!("{sanitized}/{sanitized}.bin"),
                sanitized.clone(),
            );
            push(format!("{sanitized}/gpt_main0.bin"), sanitized);
        }
    }

    push("ssd/ssd".into(), "ssd".into());
    push("gpt_main0.bin/gpt_main0.bin".into(), "gpt_main0.bin".into());
    push(
        "gpt_backup0.bin/BackupGPT".into(),
        "gpt_backup0.bin".into(),
    );
    push("buffer.bin/buffer".into(), "buffer.bin".into());

    // Dedup by (label, filename), keeping the first (highest-priority)
    // occurrence.
    let mut seen = std::collections::HashSet::new();
    out.retain(|c| seen.insert((c.label.clone(), c.filename.clone())));

    // The empty strategy - a bare `read` with no spoof attributes at all -
    // is appended last, unconditionally, and is never deduplicated away.
    out.push(SpoofCandidate {
        filename: String::new(),
        label: String::new(),
        priority,
    });

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_strategy_is_always_last() {
        let strat = build_spoof_strategy(0, 100, Some("boot"), false);
        assert!(strat.last().unwrap().filename.is_empty());
        assert!(strat.last().unwrap().label.is_empty());
    }

    #[test]
    fn dedup_and_ascending_priority() {
        let strat = build_spoof_strategy(0, 10, Some("boot"), true);
        let mut seen = std::collections::HashSet::new();
        for c in &strat {
            assert!(seen.insert((c.label.clone(), c.filename.clone())), "duplicate candidate");
        }
        for w in strat.windows(2) {
            assert!(w[0].priority < w[1].priority);
        }
    }

    #[test]
    fn gpt_candidates_present_for_low_sector() {
        let strat = build_spoof_strategy(1, 2, None, false);
        assert!(strat.iter().any(|c| c.filename == "PrimaryGPT/gpt_main1.bin"));
        assert!(strat.iter().any(|c| c.filename == "BackupGPT/gpt_backup1.bin"));
    }

    #[test]
    fn real_partition_context_is_not_overridden() {
        // Design Notes §9, Open Question (3): the unconditional
        // `gpt_backup{lun}.bin` program-write bypass from the source is
        // not reproduced - every non-empty candidate for a named
        // partition threads that partition's own sanitized name.
        let strat = build_spoof_strategy(0, 1000, Some("modem"), false);
        assert!(strat.iter().any(|c| c.filename == "modem/modem.bin"));
    }
}
