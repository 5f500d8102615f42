//! iSCSI protocol client contract
//!
//! The bridge never touches wire framing. It drives a connection through
//! [`IscsiContext`]: commands go in with [`IscsiContext::submit`], and
//! completions come back as values from [`IscsiContext::service`] once the
//! connection's descriptor is ready. Returning completions instead of
//! invoking callbacks keeps every state change on the caller's stack, where
//! the caller already holds the right locks.
//!
//! A connection handle is not thread-safe; whoever owns it must drive it
//! from one execution context at a time.

use crate::encoder::UnmapDescriptor;
use crate::url::TargetUrl;

use bytes::BytesMut;
use lunbridge_common::{Error, Result, ScsiStatus, Sense};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::AsFd;

/// Tag identifying one task on a connection
pub type TaskTag = u32;

/// Task management function response code for "function complete"
pub const TMF_RESPONSE_COMPLETE: u32 = 0;

/// Inquiry page code of the logical block provisioning VPD page
pub const VPD_LOGICAL_BLOCK_PROVISIONING: u8 = 0xb2;

/// Inquiry page code of the block limits VPD page
pub const VPD_BLOCK_LIMITS: u8 = 0xb0;

/// Login parameters
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams<'a> {
    pub target: &'a TargetUrl,
}

impl<'a> ConnectParams<'a> {
    /// Normal session without header digest
    #[must_use]
    pub fn normal(target: &'a TargetUrl) -> Self {
        Self { target }
    }
}

/// A command for one LUN
#[derive(Debug)]
pub enum ScsiCommand {
    Read16 {
        lba: u64,
        nbytes: u64,
        block_size: u32,
        iovs: Vec<BytesMut>,
    },
    Write16 {
        lba: u64,
        nbytes: u64,
        block_size: u32,
        iovs: Vec<BytesMut>,
    },
    SynchronizeCache16 {
        lba: u64,
        num_blocks: u32,
        immed: bool,
    },
    Unmap {
        descriptors: Vec<UnmapDescriptor>,
    },
    Inquiry {
        evpd: bool,
        page: u8,
        alloc_len: u16,
    },
    ReadCapacity16,
    /// LUN RESET task management function
    LunReset,
}

impl ScsiCommand {
    /// Command name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read16 { .. } => "READ16",
            Self::Write16 { .. } => "WRITE16",
            Self::SynchronizeCache16 { .. } => "SYNCHRONIZE CACHE16",
            Self::Unmap { .. } => "UNMAP",
            Self::Inquiry { .. } => "INQUIRY",
            Self::ReadCapacity16 => "READ CAPACITY16",
            Self::LunReset => "LUN RESET",
        }
    }

    /// Give back the data buffers carried by the command
    pub fn into_iovs(self) -> Vec<BytesMut> {
        match self {
            Self::Read16 { iovs, .. } | Self::Write16 { iovs, .. } => iovs,
            _ => Vec::new(),
        }
    }
}

/// Typed payload of a completed task
#[derive(Debug, Default)]
pub enum TaskData {
    #[default]
    None,
    /// Data buffers of a READ16 or WRITE16, handed back
    Buffers(Vec<BytesMut>),
    /// Logical block provisioning page
    Provisioning { lbpu: bool },
    /// Block limits page
    BlockLimits { max_unmap: u32 },
    /// READ CAPACITY16 parameter data
    Capacity {
        returned_lba: u64,
        block_length: u32,
        lbppbe: u8,
    },
    /// Task management function response code
    TmfResponse(u32),
}

/// A finished task reported by [`IscsiContext::service`]
#[derive(Debug)]
pub struct TaskCompletion {
    pub tag: TaskTag,
    pub status: ScsiStatus,
    pub sense: Sense,
    pub data: TaskData,
}

impl TaskCompletion {
    #[must_use]
    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }

    /// Take the data buffers out of the payload
    pub fn take_iovs(&mut self) -> Vec<BytesMut> {
        match std::mem::take(&mut self.data) {
            TaskData::Buffers(iovs) => iovs,
            other => {
                self.data = other;
                Vec::new()
            }
        }
    }
}

/// A command the client refused to queue; the command is handed back
#[derive(Debug)]
pub struct SubmitError {
    pub command: ScsiCommand,
    pub error: Error,
}

/// One connection to an iSCSI target
pub trait IscsiContext: AsFd + Send {
    /// Readiness events the connection currently waits for
    fn which_events(&self) -> PollFlags;

    /// Start the login; completes with the returned tag
    fn connect(&mut self, params: &ConnectParams<'_>) -> Result<TaskTag>;

    /// Queue a command for `lun`
    fn submit(&mut self, lun: u32, command: ScsiCommand) -> std::result::Result<TaskTag, SubmitError>;

    /// Process readiness events, returning the tasks that finished
    fn service(&mut self, revents: PollFlags) -> Result<Vec<TaskCompletion>>;

    /// Description of the last error on this connection
    fn last_error(&self) -> String;
}

/// Creates connection handles
pub trait Connector: Send + Sync {
    fn create(&self, initiator_iqn: &str) -> Result<Box<dyn IscsiContext>>;
}

/// Check readiness without blocking and service the connection if ready.
///
/// `Ok(None)` means the descriptor was not ready.
pub fn drive(conn: &mut dyn IscsiContext) -> Result<Option<Vec<TaskCompletion>>> {
    let events = conn.which_events();
    let revents = {
        let mut fds = [PollFd::new(conn.as_fd(), events)];
        let ready = poll(&mut fds, PollTimeout::ZERO).map_err(std::io::Error::from)?;
        if ready == 0 {
            return Ok(None);
        }
        fds[0].revents().unwrap_or(PollFlags::empty())
    };
    conn.service(revents).map(Some)
}
