//! Block I/O to SCSI command encoding

use crate::client::ScsiCommand;

use bytes::BytesMut;
use lunbridge_common::{Error, IoType, Result};

/// One UNMAP block descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapDescriptor {
    pub lba: u64,
    pub num_blocks: u32,
}

/// Unmap parameters discovered for a LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapLimits {
    /// Max blocks per descriptor
    pub max_unmap: u32,
    /// Max descriptors per command
    pub max_descriptors: u32,
}

/// Split `[lba, lba + num_blocks)` into descriptors of at most `max_unmap`
/// blocks. Fails without building anything when more than `limit`
/// descriptors would be needed.
pub fn build_unmap_descriptors(
    lba: u64,
    num_blocks: u64,
    max_unmap: u32,
    limit: u32,
) -> Result<Vec<UnmapDescriptor>> {
    if num_blocks == 0 {
        return Err(Error::invalid_argument("unmap of zero blocks"));
    }
    if max_unmap == 0 {
        return Err(Error::invalid_argument("max unmap size is zero"));
    }
    if lba.checked_add(num_blocks).is_none() {
        return Err(Error::invalid_argument(format!(
            "unmap range {lba}+{num_blocks} overflows"
        )));
    }

    let required = num_blocks.div_ceil(u64::from(max_unmap));
    if required > u64::from(limit) {
        return Err(Error::UnmapRangeTooLarge { required, limit });
    }

    let mut descriptors = Vec::with_capacity(usize::try_from(required).unwrap_or(0));
    let mut offset = lba;
    let mut remaining = num_blocks;
    while remaining > 0 {
        let chunk = remaining.min(u64::from(max_unmap));
        descriptors.push(UnmapDescriptor {
            lba: offset,
            // chunk <= max_unmap
            num_blocks: chunk as u32,
        });
        offset += chunk;
        remaining -= chunk;
    }
    Ok(descriptors)
}

/// Encodes block requests for one LUN
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    pub block_size: u32,
    /// `None` when the LUN does not support unmap
    pub unmap: Option<UnmapLimits>,
}

impl Encoder {
    /// Build the command for a block request.
    ///
    /// Data buffers move from `iovs` into the command only on success; on
    /// error `iovs` is left untouched.
    pub fn encode(
        &self,
        io_type: IoType,
        offset_blocks: u64,
        num_blocks: u64,
        iovs: &mut Vec<BytesMut>,
    ) -> Result<ScsiCommand> {
        match io_type {
            IoType::Read | IoType::Write => {
                let nbytes = num_blocks
                    .checked_mul(u64::from(self.block_size))
                    .ok_or_else(|| {
                        Error::invalid_argument(format!(
                            "{num_blocks} blocks of {} bytes overflow",
                            self.block_size
                        ))
                    })?;
                let iovs = std::mem::take(iovs);
                Ok(if io_type == IoType::Read {
                    ScsiCommand::Read16 {
                        lba: offset_blocks,
                        nbytes,
                        block_size: self.block_size,
                        iovs,
                    }
                } else {
                    ScsiCommand::Write16 {
                        lba: offset_blocks,
                        nbytes,
                        block_size: self.block_size,
                        iovs,
                    }
                })
            }
            IoType::Flush => Ok(ScsiCommand::SynchronizeCache16 {
                lba: offset_blocks,
                num_blocks: u32::try_from(num_blocks).map_err(|_| {
                    Error::invalid_argument(format!("flush of {num_blocks} blocks"))
                })?,
                immed: false,
            }),
            IoType::Unmap => {
                let limits = self
                    .unmap
                    .ok_or_else(|| Error::unsupported("unmap not supported by LUN"))?;
                let descriptors = build_unmap_descriptors(
                    offset_blocks,
                    num_blocks,
                    limits.max_unmap,
                    limits.max_descriptors,
                )?;
                Ok(ScsiCommand::Unmap { descriptors })
            }
            IoType::Reset => Ok(ScsiCommand::LunReset),
            IoType::WriteZeroes => Err(Error::unsupported(format!("{io_type}"))),
        }
    }
}
