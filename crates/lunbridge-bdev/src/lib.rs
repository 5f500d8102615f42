//! LunBridge block device framework
//!
//! The host side of the bridge: cooperative execution contexts that run
//! messages and pollers, block device registration, per-context I/O channels
//! and I/O completion reporting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Application   │  submits I/O on an IoChannel
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   BdevManager   │
//! │  - Bdev         │
//! │  - IoChannel    │
//! │  - BdevIo       │
//! └────────┬────────┘
//!          │  BlockDevice trait
//! ┌────────▼────────┐
//! │  Device module  │  (e.g. iSCSI LUN)
//! └─────────────────┘
//! ```
//!
//! Every context is driven by whoever owns the [`Reactor`]; nothing here
//! spawns threads.

pub mod bdev;
pub mod reactor;

pub use bdev::{
    Bdev, BdevIo, BdevManager, BdevProps, BlockDevice, DestructDone, IoChannel, IoCompletion,
    IoStatus,
};
pub use reactor::{ContextId, ExecContext, Poller, PollerStatus, Reactor};
