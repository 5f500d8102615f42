//! Connection handshake
//!
//! Brings a fresh connection to the point where the LUN can be registered:
//!
//! 1. login
//! 2. INQUIRY, logical block provisioning page (unmap support)
//! 3. INQUIRY, block limits page (max unmap size), only when unmap is supported
//! 4. READ CAPACITY16 (geometry)
//!
//! Each step is started by the completion of the previous one. Failures
//! carry the stage and status; tearing the connection down is left to the
//! owner of the connection.

use crate::capacity::is_capacity_changed;
use crate::client::{
    ConnectParams, IscsiContext, ScsiCommand, TaskCompletion, TaskData, TaskTag,
    VPD_BLOCK_LIMITS, VPD_LOGICAL_BLOCK_PROVISIONING,
};
use crate::url::TargetUrl;

use lunbridge_common::{BlockGeometry, Error, Result};
use tracing::{debug, error, warn};

/// Allocation length of the VPD inquiries
const INQUIRY_ALLOC_LEN: u16 = 255;

/// Handshake step waiting for a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    QueryProvisioning,
    QueryLimits,
    QueryCapacity,
}

impl Stage {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::QueryProvisioning => "provisioning query",
            Self::QueryLimits => "block limits query",
            Self::QueryCapacity => "capacity query",
        }
    }
}

/// What the handshake learned about the LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LunParams {
    pub lun: u32,
    pub geometry: BlockGeometry,
    /// Max unmap blocks, `None` if unmap is unsupported
    pub max_unmap: Option<u32>,
}

/// Result of feeding one completion to the handshake
#[derive(Debug)]
pub enum Progress {
    Pending,
    Ready(LunParams),
    Failed(Error),
}

#[derive(Debug, Clone, Copy)]
enum State {
    Waiting { stage: Stage, tag: TaskTag },
    Done,
}

/// Handshake state for one connection
#[derive(Debug)]
pub struct Handshake {
    lun: u32,
    default_max_unmap: u32,
    unmap_supported: bool,
    max_unmap: u32,
    state: State,
}

impl Handshake {
    /// Start the login. An error here means nothing was issued.
    pub fn start(
        conn: &mut dyn IscsiContext,
        target: &TargetUrl,
        default_max_unmap: u32,
    ) -> Result<Self> {
        let tag = conn.connect(&ConnectParams::normal(target)).map_err(|e| {
            error!(
                "failed to connect to {} ({}): {e}",
                target.portal(),
                conn.last_error()
            );
            e
        })?;
        debug!("connecting to {} LUN {}", target.portal(), target.lun);

        Ok(Self {
            lun: target.lun,
            default_max_unmap,
            unmap_supported: false,
            max_unmap: default_max_unmap,
            state: State::Waiting {
                stage: Stage::Connect,
                tag,
            },
        })
    }

    /// Step currently waiting for a completion
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self.state {
            State::Waiting { stage, .. } => Some(stage),
            State::Done => None,
        }
    }

    /// Feed a completion. Completions of other tasks are ignored.
    pub fn advance(&mut self, conn: &mut dyn IscsiContext, completion: &TaskCompletion) -> Progress {
        let State::Waiting { stage, tag } = self.state else {
            warn!("completion {} after handshake finished", completion.tag);
            return Progress::Pending;
        };
        if completion.tag != tag {
            debug!("ignoring completion {} while waiting for {tag}", completion.tag);
            return Progress::Pending;
        }

        let progress = match stage {
            Stage::Connect => self.on_connect(conn, completion),
            Stage::QueryProvisioning => self.on_provisioning(conn, completion),
            Stage::QueryLimits => self.on_limits(conn, completion),
            Stage::QueryCapacity => self.on_capacity(conn, completion),
        };
        if !matches!(progress, Progress::Pending) {
            self.state = State::Done;
        }
        progress
    }

    fn on_connect(&mut self, conn: &mut dyn IscsiContext, completion: &TaskCompletion) -> Progress {
        if !completion.is_good() {
            error!("iSCSI login failed: {}", conn.last_error());
            return fail(Stage::Connect, scsi_status(completion));
        }
        self.issue(
            conn,
            Stage::QueryProvisioning,
            ScsiCommand::Inquiry {
                evpd: true,
                page: VPD_LOGICAL_BLOCK_PROVISIONING,
                alloc_len: INQUIRY_ALLOC_LEN,
            },
        )
    }

    fn on_provisioning(
        &mut self,
        conn: &mut dyn IscsiContext,
        completion: &TaskCompletion,
    ) -> Progress {
        if completion.is_good() && matches!(completion.data, TaskData::Provisioning { lbpu: true }) {
            self.unmap_supported = true;
            let limits = ScsiCommand::Inquiry {
                evpd: true,
                page: VPD_BLOCK_LIMITS,
                alloc_len: INQUIRY_ALLOC_LEN,
            };
            match conn.submit(self.lun, limits) {
                Ok(tag) => {
                    self.state = State::Waiting {
                        stage: Stage::QueryLimits,
                        tag,
                    };
                    return Progress::Pending;
                }
                Err(e) => warn!("block limits query not sent: {}", e.error),
            }
        }
        self.issue(conn, Stage::QueryCapacity, ScsiCommand::ReadCapacity16)
    }

    fn on_limits(&mut self, conn: &mut dyn IscsiContext, completion: &TaskCompletion) -> Progress {
        if completion.is_good() {
            match completion.data {
                TaskData::BlockLimits { max_unmap: 0 } => {
                    warn!("target reports no max unmap, using {}", self.default_max_unmap);
                    self.max_unmap = self.default_max_unmap;
                }
                TaskData::BlockLimits { max_unmap } => self.max_unmap = max_unmap,
                _ => {}
            }
        }
        self.issue(conn, Stage::QueryCapacity, ScsiCommand::ReadCapacity16)
    }

    fn on_capacity(&mut self, conn: &mut dyn IscsiContext, completion: &TaskCompletion) -> Progress {
        if !completion.is_good() {
            error!("READ CAPACITY16 failed: {}", conn.last_error());
            if is_capacity_changed(completion.status, completion.sense) {
                return self.issue(conn, Stage::QueryCapacity, ScsiCommand::ReadCapacity16);
            }
            return fail(Stage::QueryCapacity, scsi_status(completion));
        }

        let TaskData::Capacity {
            returned_lba,
            block_length,
            lbppbe,
        } = completion.data
        else {
            return Progress::Failed(Error::protocol("READ CAPACITY16 returned no data"));
        };

        Progress::Ready(LunParams {
            lun: self.lun,
            geometry: BlockGeometry {
                block_size: block_length,
                phys_block_exp: lbppbe,
                num_blocks: returned_lba.saturating_add(1),
            },
            max_unmap: self.unmap_supported.then_some(self.max_unmap),
        })
    }

    fn issue(&mut self, conn: &mut dyn IscsiContext, stage: Stage, command: ScsiCommand) -> Progress {
        match conn.submit(self.lun, command) {
            Ok(tag) => {
                self.state = State::Waiting { stage, tag };
                Progress::Pending
            }
            Err(e) => {
                error!("{} not sent: {} ({})", stage.name(), e.error, conn.last_error());
                fail(stage, e.error.status_code())
            }
        }
    }
}

fn scsi_status(completion: &TaskCompletion) -> i32 {
    i32::from(u8::from(completion.status))
}

fn fail(stage: Stage, status: i32) -> Progress {
    Progress::Failed(Error::Handshake {
        stage: stage.name(),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::drive;
    use crate::testing::SimTarget;

    const URL: &str = "iscsi://127.0.0.1/iqn.2016-06.io.lunbridge:disk1/0";

    fn run(target: &SimTarget) -> Progress {
        let mut conn = target.connector().create_sim("iqn.test:init");
        let url = TargetUrl::parse(URL).unwrap();
        let mut handshake = Handshake::start(&mut conn, &url, 32768).unwrap();
        for _ in 0..16 {
            let Some(completions) = drive(&mut conn).unwrap() else {
                continue;
            };
            for completion in completions {
                match handshake.advance(&mut conn, &completion) {
                    Progress::Pending => {}
                    done => return done,
                }
            }
        }
        panic!("handshake stuck at {:?}", handshake.stage());
    }

    #[test]
    fn test_handshake_with_unmap() {
        let target = SimTarget::new(512, 4096);
        target.configure(|s| {
            s.lbpu = true;
            s.max_unmap = 8192;
            s.lbppbe = 3;
        });
        let Progress::Ready(params) = run(&target) else {
            panic!("handshake failed");
        };
        assert_eq!(params.lun, 0);
        assert_eq!(params.geometry.num_blocks, 4096);
        assert_eq!(params.geometry.phys_block_size(), 4096);
        assert_eq!(params.max_unmap, Some(8192));
        assert_eq!(
            target.command_names(),
            vec!["INQUIRY", "INQUIRY", "READ CAPACITY16"]
        );
    }

    #[test]
    fn test_handshake_without_unmap_skips_limits() {
        let target = SimTarget::new(4096, 100);
        let Progress::Ready(params) = run(&target) else {
            panic!("handshake failed");
        };
        assert_eq!(params.max_unmap, None);
        assert_eq!(params.geometry.block_size, 4096);
        assert_eq!(target.command_names(), vec!["INQUIRY", "READ CAPACITY16"]);
    }

    #[test]
    fn test_handshake_zero_max_unmap_uses_default() {
        let target = SimTarget::new(512, 64);
        target.configure(|s| {
            s.lbpu = true;
            s.max_unmap = 0;
        });
        let Progress::Ready(params) = run(&target) else {
            panic!("handshake failed");
        };
        assert_eq!(params.max_unmap, Some(32768));
    }

    #[test]
    fn test_handshake_failed_limits_query_is_not_fatal() {
        let target = SimTarget::new(512, 64);
        target.configure(|s| {
            s.lbpu = true;
            s.fail_limits_query = true;
        });
        let Progress::Ready(params) = run(&target) else {
            panic!("handshake failed");
        };
        assert_eq!(params.max_unmap, Some(32768));
    }

    #[test]
    fn test_handshake_failed_provisioning_query_skips_to_capacity() {
        let target = SimTarget::new(512, 64);
        target.configure(|s| {
            s.lbpu = true;
            s.fail_provisioning_query = true;
        });
        let Progress::Ready(params) = run(&target) else {
            panic!("handshake failed");
        };
        assert_eq!(params.max_unmap, None);
    }

    #[test]
    fn test_handshake_capacity_retry_on_unit_attention() {
        let target = SimTarget::new(512, 64);
        target.configure(|s| s.unit_attentions = 1);
        let Progress::Ready(params) = run(&target) else {
            panic!("handshake failed");
        };
        assert_eq!(params.geometry.num_blocks, 64);
        assert_eq!(
            target.command_names(),
            vec!["INQUIRY", "READ CAPACITY16", "READ CAPACITY16"]
        );
    }

    #[test]
    fn test_handshake_login_failure() {
        let target = SimTarget::new(512, 64);
        target.configure(|s| s.fail_connect = true);
        let Progress::Failed(err) = run(&target) else {
            panic!("handshake succeeded");
        };
        assert!(matches!(err, Error::Handshake { stage: "connect", .. }));
        assert!(target.command_names().is_empty());
    }

    #[test]
    fn test_handshake_capacity_failure() {
        let target = SimTarget::new(512, 64);
        target.configure(|s| s.fail_capacity_query = true);
        let Progress::Failed(err) = run(&target) else {
            panic!("handshake succeeded");
        };
        assert!(matches!(
            err,
            Error::Handshake {
                stage: "capacity query",
                status: 2
            }
        ));
    }

    #[test]
    fn test_handshake_submit_failure() {
        let target = SimTarget::new(512, 64);
        target.configure(|s| s.reject_submissions = true);
        let Progress::Failed(err) = run(&target) else {
            panic!("handshake succeeded");
        };
        assert!(matches!(
            err,
            Error::Handshake {
                stage: "provisioning query",
                ..
            }
        ));
        assert_eq!(err.status_code(), -libc::ENOMEM);
    }
}
