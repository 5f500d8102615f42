//! In-process iSCSI target for tests
//!
//! `SimTarget` executes commands against an in-memory disk. Its connections
//! complete every command at submit time and signal readiness through a
//! socket pair, so `client::drive` sees a real readable descriptor.

use crate::client::{
    ConnectParams, Connector, IscsiContext, ScsiCommand, SubmitError, TaskCompletion, TaskData,
    TaskTag, VPD_BLOCK_LIMITS, VPD_LOGICAL_BLOCK_PROVISIONING,
};
use crate::encoder::UnmapDescriptor;
use crate::module::IscsiBdevModule;

use bytes::BytesMut;
use lunbridge_bdev::{
    Bdev, BdevIo, BdevManager, BdevProps, BlockDevice, DestructDone, ExecContext, IoChannel,
    IoCompletion, IoStatus, Reactor,
};
use lunbridge_common::{
    ASCQ_CAPACITY_DATA_HAS_CHANGED, BlockGeometry, Error, IoType, IscsiModuleConfig, Result,
    ScsiStatus, Sense, SenseKey,
};
use nix::poll::PollFlags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_URL: &str = "iscsi://127.0.0.1/iqn.2016-06.io.lunbridge:disk1/0";
pub const TEST_IQN: &str = "iqn.2016-06.io.lunbridge:test";

pub const LBA_OUT_OF_RANGE: u16 = 0x2100;
pub const UNRECOVERED_READ_ERROR: u16 = 0x1100;
const INVALID_FIELD_IN_CDB: u16 = 0x2400;

/// Target state; tests flip the public knobs through [`SimTarget::configure`]
pub struct SimState {
    pub block_size: u32,
    pub lbppbe: u8,
    pub num_blocks: u64,
    pub lbpu: bool,
    pub max_unmap: u32,
    pub fail_create: bool,
    pub fail_connect: bool,
    pub fail_provisioning_query: bool,
    pub fail_limits_query: bool,
    pub fail_capacity_query: bool,
    /// Fail reads and writes with a medium error
    pub fail_io: bool,
    pub reject_submissions: bool,
    /// Capacity-changed unit attentions still to report
    pub unit_attentions: usize,
    pub tmf_response: u32,

    disk: Vec<u8>,
    commands: Vec<(u32, &'static str)>,
    unmaps: Vec<Vec<UnmapDescriptor>>,
    initiators: Vec<String>,
    logins: Vec<(String, String, Option<String>)>,
    created: usize,
    dropped: usize,
}

impl SimState {
    fn check_condition(key: SenseKey, ascq: u16) -> (ScsiStatus, Sense) {
        (ScsiStatus::CheckCondition, Sense::new(key, ascq))
    }

    fn take_unit_attention(&mut self) -> Option<(ScsiStatus, Sense)> {
        if self.unit_attentions == 0 {
            return None;
        }
        self.unit_attentions -= 1;
        Some(Self::check_condition(
            SenseKey::UnitAttention,
            ASCQ_CAPACITY_DATA_HAS_CHANGED,
        ))
    }

    fn range(&self, lba: u64, blocks: u64) -> Option<std::ops::Range<usize>> {
        let end = lba.checked_add(blocks)?;
        if end > self.num_blocks {
            return None;
        }
        let bs = u64::from(self.block_size);
        Some(usize::try_from(lba * bs).ok()?..usize::try_from(end * bs).ok()?)
    }

    fn execute(&mut self, lun: u32, command: ScsiCommand) -> (ScsiStatus, Sense, TaskData) {
        let good = (ScsiStatus::Good, Sense::NONE);
        self.commands.push((lun, command.name()));

        match command {
            ScsiCommand::Inquiry { page, .. } => {
                let (failed, data) = match page {
                    VPD_LOGICAL_BLOCK_PROVISIONING => (
                        self.fail_provisioning_query,
                        TaskData::Provisioning { lbpu: self.lbpu },
                    ),
                    VPD_BLOCK_LIMITS => (
                        self.fail_limits_query,
                        TaskData::BlockLimits {
                            max_unmap: self.max_unmap,
                        },
                    ),
                    _ => (true, TaskData::None),
                };
                if failed {
                    let (status, sense) =
                        Self::check_condition(SenseKey::IllegalRequest, INVALID_FIELD_IN_CDB);
                    (status, sense, TaskData::None)
                } else {
                    (good.0, good.1, data)
                }
            }
            ScsiCommand::ReadCapacity16 => {
                if let Some((status, sense)) = self.take_unit_attention() {
                    return (status, sense, TaskData::None);
                }
                if self.fail_capacity_query {
                    let (status, sense) =
                        Self::check_condition(SenseKey::MediumError, UNRECOVERED_READ_ERROR);
                    return (status, sense, TaskData::None);
                }
                (
                    good.0,
                    good.1,
                    TaskData::Capacity {
                        returned_lba: self.num_blocks - 1,
                        block_length: self.block_size,
                        lbppbe: self.lbppbe,
                    },
                )
            }
            ScsiCommand::LunReset => (good.0, good.1, TaskData::TmfResponse(self.tmf_response)),
            ScsiCommand::Read16 {
                lba,
                nbytes,
                block_size,
                mut iovs,
            } => {
                let (status, sense) = self.data_command(lba, nbytes / u64::from(block_size));
                if status.is_good() {
                    if let Some(range) = self.range(lba, nbytes / u64::from(block_size)) {
                        let mut pos = range.start;
                        for iov in &mut iovs {
                            let n = iov.len().min(range.end - pos);
                            iov[..n].copy_from_slice(&self.disk[pos..pos + n]);
                            pos += n;
                        }
                    }
                }
                (status, sense, TaskData::Buffers(iovs))
            }
            ScsiCommand::Write16 {
                lba,
                nbytes,
                block_size,
                iovs,
            } => {
                let (status, sense) = self.data_command(lba, nbytes / u64::from(block_size));
                if status.is_good() {
                    if let Some(range) = self.range(lba, nbytes / u64::from(block_size)) {
                        let mut pos = range.start;
                        for iov in &iovs {
                            let n = iov.len().min(range.end - pos);
                            self.disk[pos..pos + n].copy_from_slice(&iov[..n]);
                            pos += n;
                        }
                    }
                }
                (status, sense, TaskData::Buffers(iovs))
            }
            ScsiCommand::SynchronizeCache16 { lba, num_blocks, .. } => {
                let (status, sense) = self.range_command(lba, u64::from(num_blocks));
                (status, sense, TaskData::None)
            }
            ScsiCommand::Unmap { descriptors } => {
                for d in &descriptors {
                    if let Some(range) = self.range(d.lba, u64::from(d.num_blocks)) {
                        self.disk[range].fill(0);
                    }
                }
                self.unmaps.push(descriptors);
                (good.0, good.1, TaskData::None)
            }
        }
    }

    fn range_command(&mut self, lba: u64, blocks: u64) -> (ScsiStatus, Sense) {
        if let Some(ua) = self.take_unit_attention() {
            return ua;
        }
        if self.range(lba, blocks).is_none() {
            return Self::check_condition(SenseKey::IllegalRequest, LBA_OUT_OF_RANGE);
        }
        (ScsiStatus::Good, Sense::NONE)
    }

    fn data_command(&mut self, lba: u64, blocks: u64) -> (ScsiStatus, Sense) {
        let (status, sense) = self.range_command(lba, blocks);
        if status.is_good() && self.fail_io {
            return Self::check_condition(SenseKey::MediumError, UNRECOVERED_READ_ERROR);
        }
        (status, sense)
    }
}

/// Handle to a simulated target
#[derive(Clone)]
pub struct SimTarget {
    state: Arc<Mutex<SimState>>,
}

impl SimTarget {
    pub fn new(block_size: u32, num_blocks: u64) -> Self {
        let size = usize::try_from(num_blocks * u64::from(block_size)).unwrap();
        Self {
            state: Arc::new(Mutex::new(SimState {
                block_size,
                lbppbe: 0,
                num_blocks,
                lbpu: false,
                max_unmap: 0,
                fail_create: false,
                fail_connect: false,
                fail_provisioning_query: false,
                fail_limits_query: false,
                fail_capacity_query: false,
                fail_io: false,
                reject_submissions: false,
                unit_attentions: 0,
                tmf_response: 0,
                disk: vec![0; size],
                commands: Vec::new(),
                unmaps: Vec::new(),
                initiators: Vec::new(),
                logins: Vec::new(),
                created: 0,
                dropped: 0,
            })),
        }
    }

    pub fn configure(&self, f: impl FnOnce(&mut SimState)) {
        f(&mut self.state.lock());
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            target: self.clone(),
        }
    }

    /// Grow the LUN and queue one capacity-changed unit attention
    pub fn grow(&self, num_blocks: u64) {
        let mut state = self.state.lock();
        state.num_blocks = num_blocks;
        let size = usize::try_from(num_blocks * u64::from(state.block_size)).unwrap();
        state.disk.resize(size, 0);
        state.unit_attentions += 1;
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        self.state.lock().commands.iter().map(|c| c.1).collect()
    }

    pub fn command_luns(&self) -> Vec<u32> {
        self.state.lock().commands.iter().map(|c| c.0).collect()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn unmaps(&self) -> Vec<Vec<UnmapDescriptor>> {
        self.state.lock().unmaps.clone()
    }

    pub fn initiators(&self) -> Vec<String> {
        self.state.lock().initiators.clone()
    }

    /// `(portal, target iqn, chap user)` per login
    pub fn logins(&self) -> Vec<(String, String, Option<String>)> {
        self.state.lock().logins.clone()
    }

    /// Connections created and not yet dropped
    pub fn live_connections(&self) -> usize {
        let state = self.state.lock();
        state.created - state.dropped
    }

    pub fn read_disk(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().disk[offset..offset + len].to_vec()
    }
}

pub struct SimConnector {
    target: SimTarget,
}

impl SimConnector {
    pub fn create_sim(&self, initiator_iqn: &str) -> SimContext {
        let (wake_tx, wake_rx) = UnixStream::pair().unwrap();
        wake_rx.set_nonblocking(true).unwrap();
        {
            let mut state = self.target.state.lock();
            state.created += 1;
            state.initiators.push(initiator_iqn.to_string());
        }
        SimContext {
            target: self.target.clone(),
            wake_tx,
            wake_rx,
            ready: VecDeque::new(),
            next_tag: 1,
        }
    }
}

impl Connector for SimConnector {
    fn create(&self, initiator_iqn: &str) -> Result<Box<dyn IscsiContext>> {
        if self.target.state.lock().fail_create {
            return Err(Error::ResourceExhausted("iscsi context".to_string()));
        }
        Ok(Box::new(self.create_sim(initiator_iqn)))
    }
}

/// A connection to a [`SimTarget`]
pub struct SimContext {
    target: SimTarget,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
    ready: VecDeque<TaskCompletion>,
    next_tag: TaskTag,
}

impl SimContext {
    fn finish(&mut self, status: ScsiStatus, sense: Sense, data: TaskData) -> TaskTag {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.ready.push_back(TaskCompletion {
            tag,
            status,
            sense,
            data,
        });
        self.wake_tx.write_all(&[1]).unwrap();
        tag
    }
}

impl AsFd for SimContext {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.wake_rx.as_fd()
    }
}

impl IscsiContext for SimContext {
    fn which_events(&self) -> PollFlags {
        PollFlags::POLLIN
    }

    fn connect(&mut self, params: &ConnectParams<'_>) -> Result<TaskTag> {
        let failed = {
            let mut state = self.target.state.lock();
            state.logins.push((
                params.target.portal(),
                params.target.target_iqn.clone(),
                params.target.user.clone(),
            ));
            state.fail_connect
        };
        let (status, sense) = if failed {
            SimState::check_condition(SenseKey::NotReady, 0)
        } else {
            (ScsiStatus::Good, Sense::NONE)
        };
        Ok(self.finish(status, sense, TaskData::None))
    }

    fn submit(&mut self, lun: u32, command: ScsiCommand) -> std::result::Result<TaskTag, SubmitError> {
        let (status, sense, data) = {
            let mut state = self.target.state.lock();
            if state.reject_submissions {
                return Err(SubmitError {
                    command,
                    error: Error::ResourceExhausted("scsi task".to_string()),
                });
            }
            state.execute(lun, command)
        };
        Ok(self.finish(status, sense, data))
    }

    fn service(&mut self, _revents: PollFlags) -> Result<Vec<TaskCompletion>> {
        let mut buf = [0u8; 64];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.ready.drain(..).collect())
    }

    fn last_error(&self) -> String {
        "simulated target error".to_string()
    }
}

impl Drop for SimContext {
    fn drop(&mut self) {
        self.target.state.lock().dropped += 1;
    }
}

/// Device that completes everything successfully
pub struct StubDevice;

impl BlockDevice for StubDevice {
    fn submit_request(self: Arc<Self>, _ch: &IoChannel, io: BdevIo) {
        io.complete(IoStatus::Success);
    }

    fn io_type_supported(&self, _io_type: IoType) -> bool {
        true
    }

    fn create_channel(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    fn destroy_channel(self: Arc<Self>) {}

    fn destruct(self: Arc<Self>, done: DestructDone) {
        done.done(Ok(()));
    }
}

pub fn register_stub_bdev(num_blocks: u64) -> (BdevManager, Arc<Bdev>) {
    let manager = BdevManager::new();
    let bdev = manager
        .register(
            BdevProps {
                name: "stub0".to_string(),
                product_name: "Stub".to_string(),
                module: "stub",
                geometry: BlockGeometry {
                    block_size: 512,
                    phys_block_exp: 0,
                    num_blocks,
                },
                max_unmap: 0,
                max_unmap_segments: 0,
            },
            Arc::new(StubDevice),
        )
        .unwrap();
    (manager, bdev)
}

/// Fill a buffer list of `len` bytes with `byte`
pub fn pattern(len: usize, byte: u8) -> Vec<BytesMut> {
    let mut buf = BytesMut::zeroed(len);
    buf.fill(byte);
    vec![buf]
}

/// Completions recorded with the name of the context they ran on
pub type Captured = Arc<Mutex<Vec<(String, IoCompletion)>>>;

pub fn capture() -> (Captured, impl FnOnce(IoCompletion) + Send + 'static) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let inner = Arc::clone(&captured);
    let cb = move |completion| {
        let ctx = ExecContext::current()
            .map(|ctx| ctx.name().to_string())
            .unwrap_or_default();
        inner.lock().push((ctx, completion));
    };
    (captured, cb)
}

/// A module wired to a [`SimTarget`] and a two-context reactor
pub struct Harness {
    pub target: SimTarget,
    pub reactor: Reactor,
    pub manager: Arc<BdevManager>,
    pub module: Arc<IscsiBdevModule>,
}

impl Harness {
    pub fn new(target: SimTarget) -> Self {
        Self::with_config(target, IscsiModuleConfig::default())
    }

    pub fn with_config(target: SimTarget, config: IscsiModuleConfig) -> Self {
        let manager = Arc::new(BdevManager::new());
        let module =
            IscsiBdevModule::new(config, Arc::clone(&manager), Arc::new(target.connector()));
        Self {
            target,
            reactor: Reactor::new(2),
            manager,
            module,
        }
    }

    /// Run the reactor through 50ms of simulated time
    pub fn settle(&self) {
        for _ in 0..50 {
            self.reactor.advance(Duration::from_millis(1));
        }
    }

    /// Attach [`TEST_URL`] from context `ctx` and wait for the device
    pub fn attach_on(&self, ctx: usize, name: &str) -> Arc<Bdev> {
        let slot = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        self.reactor
            .context(ctx)
            .run(|| {
                self.module
                    .attach(name, TEST_URL, TEST_IQN, move |result| {
                        *inner.lock() = Some(result);
                    })
            })
            .unwrap();
        self.settle();
        let result = slot.lock().take().expect("attach did not complete");
        result.unwrap()
    }

    pub fn lun(&self, name: &str) -> Arc<crate::lun::IscsiLun> {
        self.module.lun(name).unwrap()
    }

    pub fn channel(&self, ctx: usize, bdev: &Arc<Bdev>) -> IoChannel {
        self.reactor.context(ctx).run(|| bdev.get_io_channel()).unwrap()
    }
}
