// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fmt;
use std::io;

use indexmap::IndexMap;

/// Coarse classification of a Firehose `<response value="NAK" .../>`.
///
/// The device's own NAK text is free-form; this enum buckets it into the
/// handful of shapes the orchestrator needs to make retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakKind {
    Auth,
    Signature,
    Hash,
    PartitionNotFound,
    InvalidLun,
    InvalidParam,
    InvalidSector,
    WriteProtected,
    EraseFail,
    WriteFail,
    Busy,
    Crc,
    Unsupported,
    Other,
}

impl NakKind {
    /// Buckets a NAK from its raw human-readable message. The device never
    /// gives us a machine-readable error code, only English prose, so this
    /// is necessarily a substring sniff.
    pub fn classify(raw_message: &str) -> Self {
        let m = raw_message.to_ascii_lowercase();
        if m.contains("auth") {
            NakKind::Auth
        } else if m.contains("signature") || m.contains("sig ") {
            NakKind::Signature
        } else if m.contains("hash") {
            NakKind::Hash
        } else if m.contains("partition") && (m.contains("not found") || m.contains("invalid")) {
            NakKind::PartitionNotFound
        } else if m.contains("lun") {
            NakKind::InvalidLun
        } else if m.contains("sector") {
            NakKind::InvalidSector
        } else if m.contains("write protect") || m.contains("write-protect") {
            NakKind::WriteProtected
        } else if m.contains("erase") {
            NakKind::EraseFail
        } else if m.contains("write") {
            NakKind::WriteFail
        } else if m.contains("busy") {
            NakKind::Busy
        } else if m.contains("crc") {
            NakKind::Crc
        } else if m.contains("unsupported") || m.contains("not implemented") {
            NakKind::Unsupported
        } else if m.contains("param") || m.contains("attribute") {
            NakKind::InvalidParam
        } else {
            NakKind::Other
        }
    }

    /// NAKs that must abort the current verb outright; the orchestrator
    /// must not re-invoke the same attempt.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            NakKind::Auth
                | NakKind::Signature
                | NakKind::Hash
                | NakKind::PartitionNotFound
                | NakKind::InvalidLun
                | NakKind::Unsupported
                | NakKind::WriteProtected
        )
    }

    /// Short machine-readable code, e.g. for log lines and the CLI's exit
    /// message.
    pub fn code(self) -> &'static str {
        match self {
            NakKind::Auth => "AUTH_FAIL",
            NakKind::Signature => "SIGNATURE_FAIL",
            NakKind::Hash => "HASH_FAIL",
            NakKind::PartitionNotFound => "PARTITION_NOT_FOUND",
            NakKind::InvalidLun => "INVALID_LUN",
            NakKind::InvalidParam => "INVALID_PARAM",
            NakKind::InvalidSector => "INVALID_SECTOR",
            NakKind::WriteProtected => "WRITE_PROTECTED",
            NakKind::EraseFail => "ERASE_FAIL",
            NakKind::WriteFail => "WRITE_FAIL",
            NakKind::Busy => "BUSY",
            NakKind::Crc => "CRC",
            NakKind::Unsupported => "UNSUPPORTED",
            NakKind::Other => "OTHER",
        }
    }
}

/// Sahara `EndImageTransfer`/detour status codes that short-circuit the
/// upload with no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaStatusCode {
    Success = 0,
    InvalidClientCommand = 1,
    ProtocolMismatch = 2,
    InvalidTargetProtocol = 3,
    InvalidHostProtocol = 4,
    InvalidPacketSize = 5,
    UnexpectedImageId = 6,
    InvalidHeaderSize = 7,
    InvalidDataSize = 8,
    InvalidImageType = 9,
    InvalidTxLength = 10,
    InvalidRxLength = 11,
    GeneralTxRxError = 12,
    ReadDataError = 13,
    UnsupportedNumPhdrs = 14,
    InvalidPhdrSize = 15,
    MultipleSharedSeg = 16,
    UninitPhdrLoc = 17,
    InvalidDestAddr = 18,
    InvalidImageHeaderDataSize = 19,
    InvalidElfHeader = 20,
    UnknownHostError = 21,
    TimeoutRx = 22,
    TimeoutTx = 23,
    InvalidHostCmd = 24,
    NotImplemented = 25,
    InvalidVersion = 26,
    InvalidCmdId = 27,
    InvalidTargetId = 28,
    InvalidModeSwitch = 29,
    CommandExecFailure = 30,
    ExecDataReadFailure = 31,
    ExecDataFailure = 32,
    HashTableAuthFailure = 33,
    HashVerificationFailure = 34,
    HashTableNotFound = 35,
    TargetInitFailure = 36,
    ImageAuthFailure = 37,
    InvalidImgHashTableSrcAddr = 38,
    Unknown = 0xffff_ffff,
}

impl SaharaStatusCode {
    pub fn from_u32(v: u32) -> Self {
        use SaharaStatusCode::*;
        match v {
            0 => Success,
            1 => InvalidClientCommand,
            2 => ProtocolMismatch,
            3 => InvalidTargetProtocol,
            4 => InvalidHostProtocol,
            5 => InvalidPacketSize,
            6 => UnexpectedImageId,
            7 => InvalidHeaderSize,
            8 => InvalidDataSize,
            9 => InvalidImageType,
            10 => InvalidTxLength,
            11 => InvalidRxLength,
            12 => GeneralTxRxError,
            13 => ReadDataError,
            14 => UnsupportedNumPhdrs,
            15 => InvalidPhdrSize,
            16 => MultipleSharedSeg,
            17 => UninitPhdrLoc,
            18 => InvalidDestAddr,
            19 => InvalidImageHeaderDataSize,
            20 => InvalidElfHeader,
            21 => UnknownHostError,
            22 => TimeoutRx,
            23 => TimeoutTx,
            24 => InvalidHostCmd,
            25 => NotImplemented,
            26 => InvalidVersion,
            27 => InvalidCmdId,
            28 => InvalidTargetId,
            29 => InvalidModeSwitch,
            30 => CommandExecFailure,
            31 => ExecDataReadFailure,
            32 => ExecDataFailure,
            33 => HashTableAuthFailure,
            34 => HashVerificationFailure,
            35 => HashTableNotFound,
            36 => TargetInitFailure,
            37 => ImageAuthFailure,
            38 => InvalidImgHashTableSrcAddr,
            _ => Unknown,
        }
    }

    /// Per spec.md §4.3: these never get retried, the whole connect unwinds.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            SaharaStatusCode::HashTableAuthFailure
                | SaharaStatusCode::HashVerificationFailure
                | SaharaStatusCode::HashTableNotFound
                | SaharaStatusCode::InvalidElfHeader
                | SaharaStatusCode::ProtocolMismatch
        )
    }
}

/// The crate-wide error type. Every fallible public operation returns
/// `Result<T, QdlError>`; CLI binaries wrap it in `anyhow::Error` at the
/// edge via `.context(...)`, same as the teacher's `cli/` does for its own
/// `anyhow::bail!` call sites.
#[derive(Debug)]
pub enum QdlError {
    Io(io::Error),
    Timeout,
    Cancelled,
    ProtocolViolation(String),
    DeviceNak {
        kind: NakKind,
        raw_message: String,
    },
    SaharaStatus {
        code: SaharaStatusCode,
        fatal: bool,
    },
    BadImage(String),
    NotConfigured,
    /// Malformed Firehose XML fragment; kept for call sites that already
    /// pattern-match on the raw attribute map (see `qdl::parsers`).
    MalformedData(IndexMap<String, String>),
}

impl fmt::Display for QdlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdlError::Io(e) => write!(f, "I/O error: {e}"),
            QdlError::Timeout => write!(f, "timed out waiting for the device"),
            QdlError::Cancelled => write!(f, "operation cancelled"),
            QdlError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            QdlError::DeviceNak { kind, raw_message } => {
                write!(f, "{} ({}): {}", kind.code(), "NAK", raw_message)
            }
            QdlError::SaharaStatus { code, fatal } => {
                write!(f, "Sahara status {code:?} (fatal={fatal})")
            }
            QdlError::BadImage(msg) => write!(f, "malformed image: {msg}"),
            QdlError::NotConfigured => {
                write!(f, "Firehose verb issued before a successful <configure>")
            }
            QdlError::MalformedData(attrs) => write!(f, "malformed Firehose XML: {attrs:?}"),
        }
    }
}

impl std::error::Error for QdlError {}

impl From<io::Error> for QdlError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            QdlError::Timeout
        } else {
            QdlError::Io(e)
        }
    }
}

impl From<xmltree::ParseError> for QdlError {
    fn from(e: xmltree::ParseError) -> Self {
        QdlError::ProtocolViolation(format!("XML parse error: {e}"))
    }
}

/// Compatibility alias kept for `qdl::parsers`, which already spelled this
/// type `FirehoseError` before the crate-wide error model was unified.
pub type FirehoseError = QdlError;

/// Compatibility alias for the old two-case NAK error some call sites use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakError {
    Configure,
    Generic(NakKind),
}

impl fmt::Display for NakError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NakError::Configure => write!(f, "device NAKed <configure>"),
            NakError::Generic(k) => write!(f, "device NAKed: {}", k.code()),
        }
    }
}
