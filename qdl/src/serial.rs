// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Result, bail};
use serial2::{self, SerialPort};

/// A per-read timeout short enough that `qdl::channel::ChannelExt`'s
/// deadline loops get to retry promptly, long enough that a slow EDL
/// bootloader doesn't look like a dropped link.
const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(250);

pub struct QdlSerialConfig {
    serport: SerialPort,
}

impl Write for QdlSerialConfig {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        self.serport.write(buf)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.serport.flush()
    }
}

impl Read for QdlSerialConfig {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        self.serport.read(buf)
    }
}

pub fn setup_serial_device(dev_path: Option<String>) -> Result<QdlSerialConfig> {
    let Some(dev_path) = dev_path else {
        bail!("Serial port path unspecified");
    };

    let serport = SerialPort::open(dev_path, |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(115200)?;
        Ok(settings)
    })?;
    serport.set_read_timeout(SERIAL_READ_TIMEOUT)?;

    Ok(QdlSerialConfig { serport })
}
