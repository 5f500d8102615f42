//! LunBridge iSCSI
//!
//! Exposes a LUN on a remote iSCSI target as a local block device. Block
//! I/O is translated to SCSI commands and sent over an asynchronous
//! connection that is polled, never blocked on.
//!
//! # Features
//!
//! - **Attach/detach**: asynchronous attach with a handshake that discovers
//!   unmap support and geometry
//! - **Single-context connections**: each connection is driven by one
//!   context; I/O from other contexts is forwarded by message
//! - **Online growth**: a "capacity data has changed" unit attention
//!   refreshes the block count and retries the command
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ IscsiBdevModule  │  attach / detach / config
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐     ┌──────────────────┐
//! │ConnectionRegistry│────▶│    Handshake     │
//! └────────┬─────────┘     └──────────────────┘
//!          │ provision
//! ┌────────▼─────────┐     ┌──────────────────┐
//! │    IscsiLun      │────▶│     Encoder      │
//! │  (BlockDevice)   │     └──────────────────┘
//! └────────┬─────────┘
//!          │ IscsiContext
//! ┌────────▼─────────┐
//! │   iSCSI target   │
//! └──────────────────┘
//! ```

pub mod capacity;
pub mod client;
pub mod encoder;
pub mod handshake;
pub mod lun;
pub mod module;
pub mod registry;
pub mod url;

#[cfg(test)]
mod testing;

pub use client::{
    ConnectParams, Connector, IscsiContext, ScsiCommand, SubmitError, TaskCompletion, TaskData,
    TaskTag,
};
pub use encoder::{Encoder, UnmapDescriptor, UnmapLimits};
pub use handshake::{Handshake, LunParams, Stage};
pub use lun::{IscsiLun, LunStats, MODULE_NAME, PRODUCT_NAME};
pub use module::IscsiBdevModule;
pub use registry::{ConnectionRegistry, ConnectionRequest, ProvisionRequest, Provisioner};
pub use url::TargetUrl;
