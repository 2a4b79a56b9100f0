// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use indexmap::IndexMap;
use log::{info, warn};
use owo_colors::OwoColorize;

use crate::error::{NakKind, QdlError};
use crate::firehose::{FirehoseStatus, firehose_configure, firehose_read, firehose_reset};
use crate::types::{FirehoseResetMode, QdlChan};

/// The highest protocol version currently supported by the library.
pub(crate) const FH_PROTO_VERSION_SUPPORTED: u32 = 1;

// Parsers are kept separate from the verb functions so a log-replay tool
// can reuse them against a captured transcript without a live channel.

/// Check `value` for ack/nak (generic).
pub fn firehose_parser_ack_nak<T: QdlChan>(
    _: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus, QdlError> {
    match attrs.get("value").map(String::as_str) {
        Some("ACK") => Ok(FirehoseStatus::Ack),
        Some("NAK") => Ok(FirehoseStatus::Nak),
        _ => Err(QdlError::MalformedData(attrs.clone())),
    }
}

/// Parse the `<configure>` response.
///
/// Invariant (spec.md §3): `storage_sector_size`/`send_buffer_size` are
/// only ever set from what the device echoes here - never from the
/// request we sent.
pub fn firehose_parser_configure_response<T: QdlChan>(
    channel: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus, QdlError> {
    let status = firehose_parser_ack_nak(channel, attrs)?;

    if status == FirehoseStatus::Nak {
        if let Some(val) = attrs.get("MaxPayloadSizeToTargetInBytes") {
            if let Ok(size) = val.parse::<usize>() {
                channel.mut_fh_config().send_buffer_size = size;
            }
        } else {
            firehose_reset(channel, &FirehoseResetMode::Edl, 0)?;
            return Err(QdlError::DeviceNak {
                kind: NakKind::Other,
                raw_message: "device NAKed <configure>".into(),
            });
        }
        return Ok(FirehoseStatus::Nak);
    }

    let device_max_write_payload_size = attrs
        .get("MaxPayloadSizeToTargetInBytesSupported")
        .and_then(|v| v.parse::<usize>().ok());

    if let Some(version) = attrs.get("Version") {
        info!("device reports Firehose protocol version {}", version.bright_blue());
    }

    let min_version_supported = attrs
        .get("MinVersionSupported")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(FH_PROTO_VERSION_SUPPORTED);

    if min_version_supported > FH_PROTO_VERSION_SUPPORTED {
        return Err(QdlError::ProtocolViolation(format!(
            "device requires Firehose protocol >= {min_version_supported}, we only support {FH_PROTO_VERSION_SUPPORTED}"
        )));
    }

    if let Some(v) = attrs.get("MaxXMLSizeInBytes").and_then(|v| v.parse::<usize>().ok()) {
        channel.mut_fh_config().xml_buf_size = v;
    }
    if let Some(v) = attrs
        .get("MaxPayloadSizeToTargetInBytes")
        .and_then(|v| v.parse::<usize>().ok())
    {
        channel.mut_fh_config().send_buffer_size = v;
    } else {
        warn!("configure ACK missing MaxPayloadSizeToTargetInBytes");
    }
    if let Some(v) = attrs.get("SectorSizeInBytes").and_then(|v| v.parse::<usize>().ok()) {
        channel.mut_fh_config().storage_sector_size = v;
    } else {
        warn!("configure ACK missing SectorSizeInBytes");
    }

    // If the device can take a larger buffer than what we asked for,
    // reconfigure it once with the larger size.
    if let Some(device_max) = device_max_write_payload_size {
        if channel.fh_config().send_buffer_size < device_max {
            info!(
                "reconfiguring to use a larger ({} KB) send buffer",
                device_max / 1024
            );
            channel.mut_fh_config().send_buffer_size = device_max;
            firehose_configure(channel, true)?;
            firehose_read(channel, firehose_parser_ack_nak)?;
        }
    }

    Ok(FirehoseStatus::Ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    struct NoopChan;
    impl std::io::Read for NoopChan {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }
    impl std::io::Write for NoopChan {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    struct MockDev {
        chan: NoopChan,
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

    #[test]
    fn ack_nak_parses_both_values() {
        let mut dev = MockDev { chan: NoopChan, cfg: Default::default() };
        assert_eq!(
            firehose_parser_ack_nak(&mut dev, &attrs(&[("value", "ACK")])).unwrap(),
            FirehoseStatus::Ack
        );
        assert_eq!(
            firehose_parser_ack_nak(&mut dev, &attrs(&[("value", "NAK")])).unwrap(),
            FirehoseStatus::Nak
        );
    }

    #[test]
    fn configure_response_stores_device_echoed_sector_size() {
        let mut dev = MockDev { chan: NoopChan, cfg: Default::default() };
        let a = attrs(&[
            ("value", "ACK"),
            ("SectorSizeInBytes", "4096"),
            ("MaxPayloadSizeToTargetInBytes", "1048576"),
        ]);
        firehose_parser_configure_response(&mut dev, &a).unwrap();
        assert_eq!(dev.fh_config().storage_sector_size, 4096);
        assert_eq!(dev.fh_config().send_buffer_size, 1048576);
    }

    #[test]
    fn configure_response_rejects_future_protocol() {
        let mut dev = MockDev { chan: NoopChan, cfg: Default::default() };
        let a = attrs(&[
            ("value", "ACK"),
            ("MaxPayloadSizeToTargetInBytesSupported", "1048576"),
            ("MaxPayloadSizeToTargetInBytes", "1048576"),
            ("MaxXMLSizeInBytes", "4096"),
            ("Version", "2"),
            ("MinVersionSupported", "2"),
        ]);
        assert!(firehose_parser_configure_response(&mut dev, &a).is_err());
    }
}
