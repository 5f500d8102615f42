//! Core type definitions for LunBridge
//!
//! SCSI completion status, sense data, block geometry and the set of block
//! I/O operation types understood by the device framework.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// ASC/ASCQ pair reported when the target's capacity changed (ASC 0x2A, ASCQ 0x09)
pub const ASCQ_CAPACITY_DATA_HAS_CHANGED: u16 = 0x2a09;

/// SCSI command status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ScsiStatus {
    #[display("GOOD")]
    Good,
    #[display("CHECK CONDITION")]
    CheckCondition,
    #[display("CONDITION MET")]
    ConditionMet,
    #[display("BUSY")]
    Busy,
    #[display("RESERVATION CONFLICT")]
    ReservationConflict,
    #[display("TASK SET FULL")]
    TaskSetFull,
    #[display("ACA ACTIVE")]
    AcaActive,
    #[display("TASK ABORTED")]
    TaskAborted,
    #[display("status {_0:#04x}")]
    Other(u8),
}

impl ScsiStatus {
    #[must_use]
    pub fn is_good(self) -> bool {
        self == Self::Good
    }
}

impl From<u8> for ScsiStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Good,
            0x02 => Self::CheckCondition,
            0x04 => Self::ConditionMet,
            0x08 => Self::Busy,
            0x18 => Self::ReservationConflict,
            0x28 => Self::TaskSetFull,
            0x30 => Self::AcaActive,
            0x40 => Self::TaskAborted,
            other => Self::Other(other),
        }
    }
}

impl From<ScsiStatus> for u8 {
    fn from(status: ScsiStatus) -> u8 {
        match status {
            ScsiStatus::Good => 0x00,
            ScsiStatus::CheckCondition => 0x02,
            ScsiStatus::ConditionMet => 0x04,
            ScsiStatus::Busy => 0x08,
            ScsiStatus::ReservationConflict => 0x18,
            ScsiStatus::TaskSetFull => 0x28,
            ScsiStatus::AcaActive => 0x30,
            ScsiStatus::TaskAborted => 0x40,
            ScsiStatus::Other(value) => value,
        }
    }
}

/// SCSI sense key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SenseKey {
    #[default]
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    AbortedCommand,
    VolumeOverflow,
    Miscompare,
    Other(u8),
}

impl From<u8> for SenseKey {
    fn from(value: u8) -> Self {
        match value & 0x0f {
            0x0 => Self::NoSense,
            0x1 => Self::RecoveredError,
            0x2 => Self::NotReady,
            0x3 => Self::MediumError,
            0x4 => Self::HardwareError,
            0x5 => Self::IllegalRequest,
            0x6 => Self::UnitAttention,
            0x7 => Self::DataProtect,
            0x8 => Self::BlankCheck,
            0x9 => Self::VendorSpecific,
            0xa => Self::CopyAborted,
            0xb => Self::AbortedCommand,
            0xd => Self::VolumeOverflow,
            0xe => Self::Miscompare,
            other => Self::Other(other),
        }
    }
}

impl From<SenseKey> for u8 {
    fn from(key: SenseKey) -> u8 {
        match key {
            SenseKey::NoSense => 0x0,
            SenseKey::RecoveredError => 0x1,
            SenseKey::NotReady => 0x2,
            SenseKey::MediumError => 0x3,
            SenseKey::HardwareError => 0x4,
            SenseKey::IllegalRequest => 0x5,
            SenseKey::UnitAttention => 0x6,
            SenseKey::DataProtect => 0x7,
            SenseKey::BlankCheck => 0x8,
            SenseKey::VendorSpecific => 0x9,
            SenseKey::CopyAborted => 0xa,
            SenseKey::AbortedCommand => 0xb,
            SenseKey::VolumeOverflow => 0xd,
            SenseKey::Miscompare => 0xe,
            SenseKey::Other(value) => value,
        }
    }
}

/// Sense data as reported by the protocol client.
///
/// `ascq` packs the additional sense code in the high byte and the qualifier
/// in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sense {
    pub key: SenseKey,
    pub ascq: u16,
}

impl Sense {
    pub const NONE: Self = Self {
        key: SenseKey::NoSense,
        ascq: 0,
    };

    #[must_use]
    pub const fn new(key: SenseKey, ascq: u16) -> Self {
        Self { key, ascq }
    }

    /// Additional sense code
    #[must_use]
    pub const fn asc(&self) -> u8 {
        (self.ascq >> 8) as u8
    }

    /// Additional sense code qualifier
    #[must_use]
    pub const fn qualifier(&self) -> u8 {
        (self.ascq & 0xff) as u8
    }
}

/// Decoded SCSI outcome of a command, relayed to the submitter as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiOutcome {
    pub status: ScsiStatus,
    pub sense_key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl ScsiOutcome {
    #[must_use]
    pub fn new(status: ScsiStatus, sense: Sense) -> Self {
        Self {
            status,
            sense_key: sense.key,
            asc: sense.asc(),
            ascq: sense.qualifier(),
        }
    }

    #[must_use]
    pub fn good() -> Self {
        Self::new(ScsiStatus::Good, Sense::NONE)
    }
}

/// Geometry of a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGeometry {
    /// Logical block size in bytes
    pub block_size: u32,
    /// Physical block size is `block_size << phys_block_exp`
    pub phys_block_exp: u8,
    /// Number of logical blocks
    pub num_blocks: u64,
}

impl BlockGeometry {
    #[must_use]
    pub const fn phys_block_size(&self) -> u32 {
        self.block_size << self.phys_block_exp
    }
}

/// Block I/O operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum IoType {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("flush")]
    Flush,
    #[display("reset")]
    Reset,
    #[display("unmap")]
    Unmap,
    #[display("write_zeroes")]
    WriteZeroes,
}
