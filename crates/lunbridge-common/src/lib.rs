//! LunBridge Common - Shared types and utilities
//!
//! This crate provides the error type, SCSI status/sense definitions, block
//! geometry and configuration structures used by the block-device framework
//! and the iSCSI bridge.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AttachParams, IscsiModuleConfig};
pub use error::{Error, Result};
pub use types::*;
