// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! The binary Sahara handshake: upload a programmer into device RAM, with
//! an optional command-mode detour to read chip identity first.
//! spec.md §4.3.

use std::time::Duration;

use log::{debug, info, warn};

use crate::channel::ChannelExt;
use crate::error::{QdlError, SaharaStatusCode};
use crate::types::{ChipIdentity, QdlChan};

const CMD_HELLO: u32 = 0x01;
const CMD_HELLO_RESPONSE: u32 = 0x02;
const CMD_READ_DATA: u32 = 0x03;
const CMD_END_IMAGE_TRANSFER: u32 = 0x04;
const CMD_DONE: u32 = 0x05;
const CMD_DONE_RESPONSE: u32 = 0x06;
const CMD_RESET: u32 = 0x07;
const CMD_RESET_RESPONSE: u32 = 0x08;
const CMD_CMD_READY: u32 = 0x0B;
const CMD_SWITCH_MODE: u32 = 0x0C;
const CMD_EXECUTE: u32 = 0x0D;
const CMD_EXECUTE_RESPONSE: u32 = 0x0E;
const CMD_EXECUTE_DATA: u32 = 0x0F;
const CMD_READ_DATA_64: u32 = 0x12;
const CMD_RESET_STATE_MACHINE: u32 = 0x13;

const PACKET_READ_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;
const MAX_END_IMAGE_TRANSFERS: u32 = 10;

/// The `mode` field carried in Hello/HelloResponse packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaMode {
    /// Device-reported `ImageTransferPending`; the host replies in kind to
    /// proceed with the normal programmer upload.
    WaitingForImage = 0,
    ImageTransferComplete = 1,
    MemoryDebug = 2,
    Command = 3,
}

impl SaharaMode {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SaharaMode::WaitingForImage),
            1 => Some(SaharaMode::ImageTransferComplete),
            2 => Some(SaharaMode::MemoryDebug),
            3 => Some(SaharaMode::Command),
            _ => None,
        }
    }
}

/// The four Execute sub-commands spec.md §4.3's command-mode detour issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 0x01,
    ReadHwId = 0x02,
    ReadOemKeyHash = 0x03,
    ReadChipIdV3 = 0x0A,
}

fn read_header<T: QdlChan>(dev: &mut T) -> Result<Option<(u32, u32)>, QdlError> {
    match dev
        .channel()
        .read_exact_timeout(8, PACKET_READ_TIMEOUT)?
    {
        Some(head) => {
            let cmd = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
            Ok(Some((cmd, len)))
        }
        None => Ok(None),
    }
}

/// Read the packet body. `len` is the packet's *total* length field
/// (header + body, as Sahara specifies it) - the 8-byte header has
/// already been consumed by `read_header`, so only `len - 8` bytes remain.
fn read_body<T: QdlChan>(dev: &mut T, len: u32) -> Result<Vec<u8>, QdlError> {
    let body_len = len.saturating_sub(8) as usize;
    if body_len == 0 {
        return Ok(vec![]);
    }
    dev.channel()
        .read_exact_timeout(body_len, PACKET_READ_TIMEOUT)?
        .ok_or(QdlError::Timeout)
}

fn send_packet<T: QdlChan>(dev: &mut T, cmd: u32, body: &[u8]) -> Result<(), QdlError> {
    let len = 8 + body.len() as u32;
    let mut pkt = Vec::with_capacity(len as usize);
    pkt.extend_from_slice(&cmd.to_le_bytes());
    pkt.extend_from_slice(&len.to_le_bytes());
    pkt.extend_from_slice(body);
    dev.channel().write_all_bytes(&pkt)?;
    Ok(())
}

fn send_hello_response<T: QdlChan>(
    dev: &mut T,
    mode: SaharaMode,
    version: u32,
    version_compatible: u32,
    max_cmd_packet_len: u32,
) -> Result<(), QdlError> {
    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(&version.to_le_bytes());
    body.extend_from_slice(&version_compatible.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes()); // status = success
    body.extend_from_slice(&(mode as u32).to_le_bytes());
    // Historical padding fields some PBL revisions expect after HelloResponse.
    for reserved in 1u32..=6 {
        body.extend_from_slice(&reserved.to_le_bytes());
    }
    let _ = max_cmd_packet_len;
    send_packet(dev, CMD_HELLO_RESPONSE, &body)
}

/// Reply `HelloResponse(mode)` without first waiting for a Hello - used to
/// unwedge a session where another program already consumed it
/// (`--skip-hello-wait` in the CLI).
pub fn sahara_send_hello_rsp<T: QdlChan>(dev: &mut T, mode: SaharaMode) -> Result<(), QdlError> {
    send_hello_response(dev, mode, 2, 1, 0)
}

/// Ask the bootloader to reset its state machine, e.g. after an aborted
/// detour, or at the tail end of a RAM-dump session.
pub fn sahara_reset<T: QdlChan>(dev: &mut T) -> Result<(), QdlError> {
    send_packet(dev, CMD_RESET, &[])?;
    if let Some((cmd, len)) = read_header(dev)? {
        let _ = read_body(dev, len)?;
        if cmd != CMD_RESET_RESPONSE {
            debug!("sahara_reset: unexpected response cmd=0x{cmd:x}");
        }
    }
    Ok(())
}

fn bool_to_chip_id_fallback(v: u16) -> Option<u16> {
    if v == 0 { None } else { Some(v) }
}

/// Run the Execute sub-dance for a single command-mode command and return
/// its raw data payload: `Execute(cmd) -> ExecuteResponse(data_len) ->
/// ExecuteResponse(ack) -> data_len bytes`.
fn exec_cmd_mode_command<T: QdlChan>(
    dev: &mut T,
    cmd: SaharaCmdModeCmd,
) -> Result<Vec<u8>, QdlError> {
    let cmd_val = cmd as u32;
    send_packet(dev, CMD_EXECUTE, &cmd_val.to_le_bytes())?;

    let (rsp_cmd, rsp_len) = read_header(dev)?.ok_or(QdlError::Timeout)?;
    if rsp_cmd != CMD_EXECUTE_RESPONSE {
        return Err(QdlError::ProtocolViolation(format!(
            "expected ExecuteResponse, got cmd=0x{rsp_cmd:x}"
        )));
    }
    let body = read_body(dev, rsp_len)?;
    if body.len() < 8 {
        return Err(QdlError::ProtocolViolation(
            "ExecuteResponse body too short".into(),
        ));
    }
    let echoed_cmd = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let data_len = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    if echoed_cmd != cmd_val {
        return Err(QdlError::ProtocolViolation(
            "ExecuteResponse echoed the wrong command".into(),
        ));
    }

    send_packet(dev, CMD_EXECUTE_DATA, &cmd_val.to_le_bytes())?;
    dev.channel()
        .read_exact_timeout(data_len as usize, PACKET_READ_TIMEOUT)?
        .ok_or(QdlError::Timeout)
}

/// Populate `serial`/`msm_id`/`oem_id`/`model_id`/`pk_hash`/`vendor_guess`
/// per spec.md §4.3's numbered steps, gated on `protocol_version`.
fn run_chip_identity_detour<T: QdlChan>(
    dev: &mut T,
    protocol_version: u32,
) -> Result<ChipIdentity, QdlError> {
    let mut id = ChipIdentity {
        protocol_version,
        ..Default::default()
    };

    let serial_bytes = exec_cmd_mode_command(dev, SaharaCmdModeCmd::ReadSerialNum)?;
    if serial_bytes.len() >= 4 {
        id.serial = Some(u32::from_le_bytes([
            serial_bytes[0],
            serial_bytes[1],
            serial_bytes[2],
            serial_bytes[3],
        ]));
    }

    if protocol_version < 3 {
        let hwid_bytes = exec_cmd_mode_command(dev, SaharaCmdModeCmd::ReadHwId)?;
        if hwid_bytes.len() >= 8 {
            id.msm_id = Some(u32::from_le_bytes([
                hwid_bytes[0],
                hwid_bytes[1],
                hwid_bytes[2],
                hwid_bytes[3],
            ]));
            id.oem_id = Some(u16::from_le_bytes([hwid_bytes[4], hwid_bytes[5]]));
            id.model_id = Some(u16::from_le_bytes([hwid_bytes[6], hwid_bytes[7]]));
        }
    }

    let pk_hash = exec_cmd_mode_command(dev, SaharaCmdModeCmd::ReadOemKeyHash)?;
    id.pk_hash = pk_hash.into_iter().take(48).collect();

    if protocol_version >= 3 {
        let chip_id = exec_cmd_mode_command(dev, SaharaCmdModeCmd::ReadChipIdV3)?;
        if chip_id.len() >= 84 {
            id.msm_id = Some(u32::from_le_bytes([
                chip_id[36],
                chip_id[37],
                chip_id[38],
                chip_id[39],
            ]));
            let oem_id = u16::from_le_bytes([chip_id[40], chip_id[41]]);
            let model_id = u16::from_le_bytes([chip_id[42], chip_id[43]]);
            let oem_id_fallback = u16::from_le_bytes([chip_id[44], chip_id[45]]);
            id.oem_id = Some(bool_to_chip_id_fallback(oem_id).unwrap_or(oem_id_fallback));
            id.model_id = Some(model_id);
        }
    }

    id.vendor_guess = crate::vip::guess_vendor_from_pk_hash(&id.pk_hash);
    Ok(id)
}

/// Connect to a device already waiting at its Sahara Hello and either (a)
/// capture its `ChipIdentity` via the command-mode detour, or (b) upload
/// `programmer` and run the image transfer to completion, depending on
/// whether `identify` is `true`.
///
/// Handles every Hello the device sends during this single call: if the
/// command-mode detour is attempted and rejected/fails, the device is
/// switched back to `WaitingForImage` and, should it re-Hello, the detour
/// is not retried (spec.md's open question (2)).
pub fn sahara_run<T: QdlChan>(
    dev: &mut T,
    identify: bool,
    programmer: Option<&[u8]>,
    verbose: bool,
) -> Result<ChipIdentity, QdlError> {
    let mut command_mode_attempted = false;
    let mut consecutive_timeouts = 0u32;
    let mut end_image_transfers = 0u32;
    let mut chip_identity = ChipIdentity::default();

    loop {
        let (cmd, len) = match read_header(dev)? {
            Some(h) => {
                consecutive_timeouts = 0;
                h
            }
            None => {
                consecutive_timeouts += 1;
                if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    return Err(QdlError::Timeout);
                }
                continue;
            }
        };

        match cmd {
            c if c == CMD_HELLO => {
                let body = read_body(dev, len)?;
                let version = body
                    .get(0..4)
                    .and_then(|b| b.try_into().ok())
                    .map(|b: [u8; 4]| u32::from_le_bytes(b))
                    .unwrap_or(1);
                let device_mode = body
                    .get(12..16)
                    .and_then(|b| b.try_into().ok())
                    .map(|b: [u8; 4]| u32::from_le_bytes(b))
                    .and_then(SaharaMode::from_u32)
                    .unwrap_or(SaharaMode::WaitingForImage);

                if identify && !command_mode_attempted && device_mode == SaharaMode::WaitingForImage {
                    command_mode_attempted = true;
                    send_hello_response(dev, SaharaMode::Command, version, version, 0)?;
                    match read_header(dev)? {
                        Some((c, l)) if c == CMD_CMD_READY => {
                            let _ = read_body(dev, l)?;
                            match run_chip_identity_detour(dev, version) {
                                Ok(id) => {
                                    chip_identity = id;
                                    send_packet(
                                        dev,
                                        CMD_SWITCH_MODE,
                                        &(SaharaMode::WaitingForImage as u32).to_le_bytes(),
                                    )?;
                                }
                                Err(e) => {
                                    warn!("command-mode detour failed: {e}");
                                    send_packet(
                                        dev,
                                        CMD_SWITCH_MODE,
                                        &(SaharaMode::WaitingForImage as u32).to_le_bytes(),
                                    )?;
                                }
                            }
                        }
                        _ => {
                            warn!("device didn't answer CommandReady; resuming image transfer");
                            send_packet(
                                dev,
                                CMD_SWITCH_MODE,
                                &(SaharaMode::WaitingForImage as u32).to_le_bytes(),
                            )?;
                        }
                    }
                    if programmer.is_none() {
                        // Identify-only call: nothing left to do once the
                        // device is back in WaitingForImage.
                        return Ok(chip_identity);
                    }
                    // Otherwise keep looping - the device will re-Hello
                    // with WaitingForImage next, and the detour won't be
                    // retried since `command_mode_attempted` is now set.
                    continue;
                }

                send_hello_response(dev, SaharaMode::WaitingForImage, version, version, 0)?;
            }

            c if c == CMD_READ_DATA => {
                let body = read_body(dev, len)?;
                if body.len() < 12 {
                    return Err(QdlError::ProtocolViolation("short ReadData body".into()));
                }
                let _image_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let offset = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
                let request_len =
                    u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
                serve_read_data(dev, programmer, offset, request_len, verbose)?;
            }

            c if c == CMD_READ_DATA_64 => {
                let body = read_body(dev, len)?;
                if body.len() < 24 {
                    return Err(QdlError::ProtocolViolation(
                        "short ReadData64 body".into(),
                    ));
                }
                let offset = u64::from_le_bytes(body[8..16].try_into().unwrap()) as usize;
                let request_len = u64::from_le_bytes(body[16..24].try_into().unwrap()) as usize;
                serve_read_data(dev, programmer, offset, request_len, verbose)?;
            }

            c if c == CMD_END_IMAGE_TRANSFER => {
                let body = read_body(dev, len)?;
                end_image_transfers += 1;
                if end_image_transfers > MAX_END_IMAGE_TRANSFERS {
                    return Err(QdlError::ProtocolViolation(
                        "too many EndImageTransfer packets".into(),
                    ));
                }
                let status = body
                    .get(4..8)
                    .and_then(|b| b.try_into().ok())
                    .map(|b: [u8; 4]| u32::from_le_bytes(b))
                    .unwrap_or(0);
                let status = SaharaStatusCode::from_u32(status);
                if status == SaharaStatusCode::Success {
                    send_packet(dev, CMD_DONE, &[])?;
                } else {
                    let fatal = status.is_fatal();
                    return Err(QdlError::SaharaStatus {
                        code: status,
                        fatal,
                    });
                }
            }

            c if c == CMD_DONE_RESPONSE => {
                let _ = read_body(dev, len)?;
                info!("Sahara transfer complete");
                return Ok(chip_identity);
            }

            other => {
                let _ = read_body(dev, len)?;
                return Err(QdlError::ProtocolViolation(format!(
                    "unexpected Sahara command 0x{other:x}"
                )));
            }
        }
    }
}

/// Satisfy a single `ReadData`/`ReadData64` request out of `programmer`.
/// A window that runs past EOF is treated as end-of-transfer (spec.md's
/// open question (1)): we never extend the image, and we still answer
/// with whatever bytes remain before sending `Done`-equivalent silence -
/// the device is expected to follow up with `EndImageTransfer`.
fn serve_read_data<T: QdlChan>(
    dev: &mut T,
    programmer: Option<&[u8]>,
    offset: usize,
    request_len: usize,
    verbose: bool,
) -> Result<(), QdlError> {
    let Some(image) = programmer else {
        return Err(QdlError::ProtocolViolation(
            "device requested ReadData but no programmer image was supplied".into(),
        ));
    };

    if offset >= image.len() {
        if verbose {
            debug!("ReadData window past EOF (offset={offset}), treating as end-of-transfer");
        }
        return Ok(());
    }

    let end = (offset + request_len).min(image.len());
    let window = &image[offset..end];
    if verbose {
        debug!("Serving ReadData [{offset}..{end}] ({} bytes)", window.len());
    }
    dev.channel().write_all_bytes(window)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};

    /// A bidirectional in-memory channel: everything written to it is
    /// appended to an outbox the test can inspect, while reads are served
    /// from a pre-scripted inbox.
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

    fn hello_packet(version: u32, mode: u32) -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&CMD_HELLO.to_le_bytes());
        p.extend_from_slice(&0x30u32.to_le_bytes());
        p.extend_from_slice(&version.to_le_bytes()); // version
        p.extend_from_slice(&1u32.to_le_bytes()); // compatible
        p.extend_from_slice(&0u32.to_le_bytes()); // max cmd packet length (unused by host)
        p.extend_from_slice(&mode.to_le_bytes()); // mode
        // length field above is the *total* packet length (cmd+length+body),
        // consistent with read_data_packet/end_image_transfer_packet/
        // done_response_packet below - pad the body out to match, or
        // read_body leaves stray bytes on the stream for the next read_header.
        while p.len() < 0x30 {
            p.push(0);
        }
        p
    }

    fn read_data_packet(image_id: u32, offset: u32, length: u32) -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&CMD_READ_DATA.to_le_bytes());
        p.extend_from_slice(&20u32.to_le_bytes());
        p.extend_from_slice(&image_id.to_le_bytes());
        p.extend_from_slice(&offset.to_le_bytes());
        p.extend_from_slice(&length.to_le_bytes());
        p
    }

    fn end_image_transfer_packet(status: u32) -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&CMD_END_IMAGE_TRANSFER.to_le_bytes());
        p.extend_from_slice(&16u32.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes()); // image id
        p.extend_from_slice(&status.to_le_bytes());
        p
    }

    fn done_response_packet() -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&CMD_DONE_RESPONSE.to_le_bytes());
        p.extend_from_slice(&12u32.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        p
    }

    /// Scenario S1: Sahara happy path.
    #[test]
    fn happy_path_upload() {
        let mut script = vec![];
        script.extend(hello_packet(2, 0));
        script.extend(read_data_packet(13, 0, 1024));
        script.extend(read_data_packet(13, 1024, 512));
        script.extend(end_image_transfer_packet(0));
        script.extend(done_response_packet());

        let mut dev = MockDev {
            chan: MockChan {
                inbox: Cursor::new(script),
                outbox: vec![],
            },
            cfg: Default::default(),
        };

        let programmer: Vec<u8> = (0..1536u32).map(|i| (i & 0xFF) as u8).collect();
        sahara_run(&mut dev, false, Some(&programmer), false).unwrap();

        // HelloResponse first.
        let out = &dev.chan.outbox;
        let hello_rsp_cmd = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(hello_rsp_cmd, CMD_HELLO_RESPONSE);

        // The two ReadData windows should appear back to back right after.
        let hello_rsp_len = u32::from_le_bytes([out[4], out[5], out[6], out[7]]) as usize;
        let after_hello = 8 + hello_rsp_len;
        assert_eq!(&out[after_hello..after_hello + 1024], &programmer[0..1024]);
        assert_eq!(
            &out[after_hello + 1024..after_hello + 1536],
            &programmer[1024..1536]
        );

        // Done(cmd=0x05, length=8) follows.
        let done_off = after_hello + 1536;
        let done_cmd = u32::from_le_bytes([
            out[done_off],
            out[done_off + 1],
            out[done_off + 2],
            out[done_off + 3],
        ]);
        let done_len = u32::from_le_bytes([
            out[done_off + 4],
            out[done_off + 5],
            out[done_off + 6],
            out[done_off + 7],
        ]);
        assert_eq!(done_cmd, CMD_DONE);
        assert_eq!(done_len, 8);
    }

    fn execute_response_packet(echoed_cmd: u32, data_len: u32) -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&CMD_EXECUTE_RESPONSE.to_le_bytes());
        p.extend_from_slice(&16u32.to_le_bytes());
        p.extend_from_slice(&echoed_cmd.to_le_bytes());
        p.extend_from_slice(&data_len.to_le_bytes());
        p
    }

    fn command_ready_packet() -> Vec<u8> {
        let mut p = vec![];
        p.extend_from_slice(&CMD_CMD_READY.to_le_bytes());
        p.extend_from_slice(&8u32.to_le_bytes());
        p
    }

    /// Scenario S2: command-mode detour, protocol v3.
    #[test]
    fn command_mode_detour_v3() {
        let mut script = vec![];
        script.extend(hello_packet(3, 0)); // mode=0 == ImageTransferPending

        script.extend(command_ready_packet());

        // Execute(SerialNumRead)
        script.extend(execute_response_packet(
            SaharaCmdModeCmd::ReadSerialNum as u32,
            4,
        ));
        script.extend([0xDEu8, 0xAD, 0xBE, 0xEF]);

        // protocol_version >= 3, so ReadHwId is skipped.

        // Execute(OemPkHashRead)
        script.extend(execute_response_packet(
            SaharaCmdModeCmd::ReadOemKeyHash as u32,
            48,
        ));
        let mut pk_hash = vec![0x2b, 0xe7, 0x6c, 0xee];
        pk_hash.resize(48, 0xAA);
        script.extend(pk_hash);

        // Execute(ChipIdV3Read)
        script.extend(execute_response_packet(
            SaharaCmdModeCmd::ReadChipIdV3 as u32,
            84,
        ));
        script.extend(vec![0u8; 84]);

        let mut dev = MockDev {
            chan: MockChan {
                inbox: Cursor::new(script),
                outbox: vec![],
            },
            cfg: Default::default(),
        };

        let id = sahara_run(&mut dev, true, None, false).unwrap();
        assert_eq!(id.serial, Some(0xEFBEADDE));
        assert_eq!(id.vendor_guess, Some("OPPO"));

        // The client must send SwitchMode(ImageTransferPending) afterwards
        // (header(8) + mode(4) = 12 trailing bytes).
        let out = &dev.chan.outbox;
        let last_cmd = u32::from_le_bytes([
            out[out.len() - 12],
            out[out.len() - 11],
            out[out.len() - 10],
            out[out.len() - 9],
        ]);
        assert_eq!(last_cmd, CMD_SWITCH_MODE);
    }
}
