//! Configuration types for LunBridge
//!
//! `IscsiModuleConfig` tunes the iSCSI bridge (poll cadences, unmap limits,
//! retry policy). `AttachParams` is the persisted form of one attached
//! device, as replayed from a saved configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Initiator identity used when an attach request does not name one
pub const DEFAULT_INITIATOR_IQN: &str = "iqn.2016-06.io.lunbridge:init";

/// Max unmap block count used when the target reports none
pub const DEFAULT_MAX_UNMAP_BLOCKS: u32 = 32768;

/// Number of block descriptors carried by a single UNMAP command
pub const MAX_UNMAP_DESCRIPTORS: u32 = 1;

/// iSCSI bridge configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiModuleConfig {
    /// Initiator IQN for config-replayed devices without one
    pub default_initiator_iqn: String,
    /// Period of the shared poller driving pending connection handshakes
    pub connection_poll_us: u64,
    /// Period of the per-device poller on the home context (0 = every iteration)
    pub lun_poll_us: u64,
    /// Period of the per-device poller that runs while no channel is open
    pub idle_poll_us: u64,
    /// Max unmap block count when the target's block-limits page reports 0
    pub default_max_unmap_blocks: u32,
    /// Descriptor limit for one UNMAP command
    pub max_unmap_descriptors: u32,
    /// Cap on resubmissions after "capacity data has changed" (None = unbounded)
    pub capacity_retry_limit: Option<u32>,
}

impl Default for IscsiModuleConfig {
    fn default() -> Self {
        Self {
            default_initiator_iqn: DEFAULT_INITIATOR_IQN.to_string(),
            connection_poll_us: 500, // 0.5 ms
            lun_poll_us: 0,
            idle_poll_us: 10_000, // 10 ms
            default_max_unmap_blocks: DEFAULT_MAX_UNMAP_BLOCKS,
            max_unmap_descriptors: MAX_UNMAP_DESCRIPTORS,
            capacity_retry_limit: None,
        }
    }
}

impl IscsiModuleConfig {
    #[must_use]
    pub fn connection_poll_interval(&self) -> Duration {
        Duration::from_micros(self.connection_poll_us)
    }

    #[must_use]
    pub fn lun_poll_interval(&self) -> Duration {
        Duration::from_micros(self.lun_poll_us)
    }

    #[must_use]
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_micros(self.idle_poll_us)
    }
}

/// Parameters of one attached iSCSI device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachParams {
    /// Block device name
    pub name: String,
    /// Target URL, `iscsi://[user[%secret]@]host[:port]/iqn/lun`
    pub url: String,
    /// Initiator IQN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_iqn: Option<String>,
}
