//! iSCSI LUN device session
//!
//! An [`IscsiLun`] owns one connection and serves block I/O for one LUN.
//! The connection is not thread-safe, so it is driven from exactly one
//! context at a time:
//!
//! - while any channel is open, by the *home* context (the context of the
//!   first channel), through a poller registered on it;
//! - while no channel is open, by the idle poller on the context that
//!   provisioned the device.
//!
//! I/O submitted on another context is moved to the home context by
//! message, and its completion is moved back the same way.

use crate::capacity;
use crate::client::{
    self, IscsiContext, SubmitError, TMF_RESPONSE_COMPLETE, TaskCompletion, TaskData, TaskTag,
};
use crate::encoder::{Encoder, UnmapLimits};
use crate::handshake::LunParams;

use lunbridge_bdev::{
    Bdev, BdevIo, BlockDevice, DestructDone, ExecContext, IoChannel, IoStatus, Poller,
    PollerStatus,
};
use lunbridge_common::{Error, IoType, IscsiModuleConfig, Result, ScsiOutcome};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Module name devices are registered under
pub const MODULE_NAME: &str = "iscsi";

/// Product name reported for every LUN
pub const PRODUCT_NAME: &str = "iSCSI LUN";

/// Per-LUN I/O counters
#[derive(Debug, Default)]
pub struct LunStats {
    submitted: AtomicU64,
    redirected: AtomicU64,
    capacity_retries: AtomicU64,
    failed: AtomicU64,
}

impl LunStats {
    fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_redirected(&self) {
        self.redirected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_capacity_retry(&self) {
        self.capacity_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// I/Os accepted from the framework
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// I/Os moved to the home context
    pub fn redirected(&self) -> u64 {
        self.redirected.load(Ordering::Relaxed)
    }

    /// Resubmissions after a capacity change
    pub fn capacity_retries(&self) -> u64 {
        self.capacity_retries.load(Ordering::Relaxed)
    }

    /// I/Os completed with anything but success
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn to_json(&self) -> Value {
        json!({
            "submitted": self.submitted(),
            "redirected": self.redirected(),
            "capacity_retries": self.capacity_retries(),
            "failed": self.failed(),
        })
    }
}

/// Retry count after one more resubmission, `None` once `limit` is reached
fn next_retry(retries: u32, limit: Option<u32>) -> Option<u32> {
    limit
        .is_none_or(|limit| retries < limit)
        .then(|| retries.saturating_add(1))
}

/// A block I/O owned by the session
#[derive(Debug)]
struct LunIo {
    io: BdevIo,
    /// Context to hand the completion back to; set when redirected
    submit_ctx: Option<Arc<ExecContext>>,
    /// Resubmissions after a capacity change
    retries: u32,
}

#[derive(Debug)]
enum InFlight {
    Io(LunIo),
    CapacityRefresh,
}

#[derive(Default)]
struct ChannelState {
    /// Contexts holding a channel
    count: u32,
    /// Context driving the connection while `count > 0`
    home: Option<Arc<ExecContext>>,
    poller: Option<Poller>,
}

/// Device session for one iSCSI LUN
pub struct IscsiLun {
    name: String,
    url: String,
    initiator_iqn: String,
    lun: u32,
    encoder: Encoder,
    lun_poll_interval: Duration,
    capacity_retry_limit: Option<u32>,

    channels: Mutex<ChannelState>,
    conn: Mutex<Option<Box<dyn IscsiContext>>>,
    inflight: Mutex<HashMap<TaskTag, InFlight>>,
    idle_poller: Mutex<Option<Poller>>,
    idle_ctx: Mutex<Option<Arc<ExecContext>>>,
    bdev: OnceLock<Weak<Bdev>>,
    stats: LunStats,
}

impl std::fmt::Debug for IscsiLun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IscsiLun")
            .field("name", &self.name)
            .field("lun", &self.lun)
            .field("encoder", &self.encoder)
            .finish_non_exhaustive()
    }
}

impl IscsiLun {
    /// Create a session without a connection; the connection is attached
    /// with [`IscsiLun::start`] once the device is registered.
    pub fn new(
        name: &str,
        url: &str,
        initiator_iqn: &str,
        params: &LunParams,
        config: &IscsiModuleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            url: url.to_string(),
            initiator_iqn: initiator_iqn.to_string(),
            lun: params.lun,
            encoder: Encoder {
                block_size: params.geometry.block_size,
                unmap: params.max_unmap.map(|max_unmap| UnmapLimits {
                    max_unmap,
                    max_descriptors: config.max_unmap_descriptors,
                }),
            },
            lun_poll_interval: config.lun_poll_interval(),
            capacity_retry_limit: config.capacity_retry_limit,
            channels: Mutex::new(ChannelState::default()),
            conn: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
            idle_poller: Mutex::new(None),
            idle_ctx: Mutex::new(None),
            bdev: OnceLock::new(),
            stats: LunStats::default(),
        })
    }

    /// Adopt the connection and start the idle poller on the current context
    pub fn start(
        self: &Arc<Self>,
        bdev: &Arc<Bdev>,
        conn: Box<dyn IscsiContext>,
        idle_poll_interval: Duration,
    ) -> Result<()> {
        let ctx = ExecContext::current().ok_or(Error::NoExecContext)?;
        if self.bdev.set(Arc::downgrade(bdev)).is_err() {
            return Err(Error::AlreadyExists(self.name.clone()));
        }
        *self.conn.lock() = Some(conn);

        let lun = Arc::downgrade(self);
        let poller = ctx.register_poller(
            format!("iscsi_idle:{}", self.name),
            idle_poll_interval,
            move || lun.upgrade().map_or(PollerStatus::Idle, |lun| lun.idle_poll()),
        );
        *self.idle_poller.lock() = Some(poller);
        *self.idle_ctx.lock() = Some(ctx);
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn initiator_iqn(&self) -> &str {
        &self.initiator_iqn
    }

    #[must_use]
    pub fn lun(&self) -> u32 {
        self.lun
    }

    #[must_use]
    pub fn stats(&self) -> &LunStats {
        &self.stats
    }

    /// Number of contexts holding a channel
    #[must_use]
    pub fn channel_count(&self) -> u32 {
        self.channels.lock().count
    }

    /// Context driving the connection while channels are open
    #[must_use]
    pub fn home(&self) -> Option<Arc<ExecContext>> {
        self.channels.lock().home.clone()
    }

    /// Commands sent and not yet completed
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    fn bdev(&self) -> Option<Arc<Bdev>> {
        self.bdev.get().and_then(Weak::upgrade)
    }

    /// Home context poller
    fn poll_lun(self: &Arc<Self>) -> PollerStatus {
        match self.service() {
            Some(completions) => self.dispatch(completions),
            None => PollerStatus::Idle,
        }
    }

    /// Idle poller: drives the connection only while no channel is open
    fn idle_poll(self: &Arc<Self>) -> PollerStatus {
        let completions = {
            let Some(channels) = self.channels.try_lock() else {
                return PollerStatus::Idle;
            };
            if channels.count > 0 {
                return PollerStatus::Idle;
            }
            self.service()
        };
        match completions {
            Some(completions) => self.dispatch(completions),
            None => PollerStatus::Idle,
        }
    }

    fn service(&self) -> Option<Vec<TaskCompletion>> {
        let mut conn = self.conn.lock();
        let conn = conn.as_deref_mut()?;
        match client::drive(conn) {
            Ok(completions) => completions,
            Err(e) => {
                error!("{}: iSCSI service failed: {e} ({})", self.name, conn.last_error());
                None
            }
        }
    }

    fn dispatch(self: &Arc<Self>, completions: Vec<TaskCompletion>) -> PollerStatus {
        if completions.is_empty() {
            return PollerStatus::Idle;
        }
        for completion in completions {
            self.on_completion(completion);
        }
        PollerStatus::Busy
    }

    fn on_completion(self: &Arc<Self>, mut completion: TaskCompletion) {
        let Some(task) = self.inflight.lock().remove(&completion.tag) else {
            warn!("{}: completion for unknown task {}", self.name, completion.tag);
            return;
        };

        let mut io = match task {
            InFlight::CapacityRefresh => {
                if let Some(bdev) = self.bdev() {
                    capacity::on_refresh_complete(&bdev, &completion);
                }
                return;
            }
            InFlight::Io(io) => io,
        };

        if io.io.io_type() == IoType::Reset {
            let done = completion.is_good()
                && matches!(completion.data, TaskData::TmfResponse(TMF_RESPONSE_COMPLETE));
            if !done {
                warn!("{}: LUN reset failed: {:?}", self.name, completion.data);
            }
            self.finish(io, if done { IoStatus::Success } else { IoStatus::Failed });
            return;
        }

        let iovs = completion.take_iovs();
        if !iovs.is_empty() {
            io.io.set_iovs(iovs);
        }
        let outcome = ScsiOutcome::new(completion.status, completion.sense);

        if capacity::is_capacity_changed(completion.status, completion.sense) {
            if let Some(retries) = next_retry(io.retries, self.capacity_retry_limit) {
                info!("{}: capacity changed, refreshing and retrying", self.name);
                self.refresh_capacity();
                io.retries = retries;
                self.stats.record_capacity_retry();
                self.resubmit(io);
                return;
            }
            warn!(
                "{}: capacity changed again after {} retries, giving up",
                self.name, io.retries
            );
        }

        if !outcome.status.is_good() {
            debug!("{}: {} failed with {outcome:?}", self.name, io.io.io_type());
            self.stats.record_failed();
        }
        self.relay(io, move |io| io.complete_scsi_status(outcome));
    }

    fn refresh_capacity(&self) {
        let mut conn = self.conn.lock();
        let Some(conn) = conn.as_deref_mut() else {
            return;
        };
        if let Some(tag) = capacity::request_refresh(conn, self.lun) {
            self.inflight.lock().insert(tag, InFlight::CapacityRefresh);
        }
    }

    /// Send again after a capacity change, from the context that drives the
    /// connection
    fn resubmit(self: &Arc<Self>, io: LunIo) {
        let home = self.channels.lock().home.clone();
        match home {
            Some(home) if !home.is_current() => {
                let lun = Arc::clone(self);
                home.send_msg(move || lun.execute(io));
            }
            _ => self.execute(io),
        }
    }

    /// Encode and send one I/O. Runs on the context driving the connection.
    fn execute(&self, mut io: LunIo) {
        let io_type = io.io.io_type();
        if io_type == IoType::Read
            && let Err(e) = io.io.ensure_buffer()
        {
            self.fail(io, &e);
            return;
        }

        let mut iovs = io.io.take_iovs();
        let encoded = self.encoder.encode(
            io_type,
            io.io.offset_blocks(),
            io.io.num_blocks(),
            &mut iovs,
        );
        io.io.set_iovs(iovs);
        let command = match encoded {
            Ok(command) => command,
            Err(e) => {
                self.fail(io, &e);
                return;
            }
        };

        let (iovs, error) = {
            let mut conn = self.conn.lock();
            match conn.as_deref_mut() {
                None => (command.into_iovs(), Error::Shutdown),
                Some(conn) => match conn.submit(self.lun, command) {
                    Ok(tag) => {
                        self.inflight.lock().insert(tag, InFlight::Io(io));
                        return;
                    }
                    Err(SubmitError { command, error }) => {
                        error!(
                            "{}: failed to send {}: {}",
                            self.name,
                            command.name(),
                            conn.last_error()
                        );
                        (command.into_iovs(), error)
                    }
                },
            }
        };
        if !iovs.is_empty() {
            io.io.set_iovs(iovs);
        }
        self.fail(io, &error);
    }

    fn fail(&self, io: LunIo, error: &Error) {
        error!("{}: {} failed: {error}", self.name, io.io.io_type());
        self.finish(io, IoStatus::Failed);
    }

    fn finish(&self, io: LunIo, status: IoStatus) {
        if status != IoStatus::Success {
            self.stats.record_failed();
        }
        self.relay(io, move |io| io.complete(status));
    }

    /// Complete on the submitting context if the I/O was redirected,
    /// inline otherwise
    fn relay(&self, io: LunIo, complete: impl FnOnce(BdevIo) + Send + 'static) {
        let LunIo { io, submit_ctx, .. } = io;
        match submit_ctx {
            Some(ctx) => ctx.send_msg(move || complete(io)),
            None => complete(io),
        }
    }

    fn release_home(channels: &mut ChannelState) {
        channels.home = None;
        if let Some(poller) = channels.poller.take() {
            poller.unregister();
        }
    }

    /// Last close of a channel, forwarded to the home context
    fn destroy_channel_on_home(&self) {
        let mut channels = self.channels.lock();
        debug_assert!(channels.count > 0);
        channels.count = channels.count.saturating_sub(1);
        if channels.count == 0 {
            debug!("{}: last channel closed, releasing home context", self.name);
            Self::release_home(&mut channels);
        }
    }

    /// Stop the idle poller and release the connection on the idle context
    fn destruct_on_idle(self: Arc<Self>, done: DestructDone) {
        if let Some(home) = self.channels.lock().home.as_ref() {
            warn!("{}: destroyed while {} still drives it", self.name, home.name());
        }
        let Some(ctx) = self.idle_ctx.lock().clone() else {
            self.conn.lock().take();
            done.done(Ok(()));
            return;
        };
        let lun = Arc::clone(&self);
        ctx.send_msg(move || {
            if let Some(poller) = lun.idle_poller.lock().take() {
                poller.unregister();
            }
            let inflight: Vec<InFlight> = lun.inflight.lock().drain().map(|(_, t)| t).collect();
            if !inflight.is_empty() {
                warn!("{}: destroyed with {} commands in flight", lun.name, inflight.len());
            }
            drop(inflight);
            lun.conn.lock().take();
            info!("{}: connection closed", lun.name);
            done.done(Ok(()));
        });
    }
}

impl BlockDevice for IscsiLun {
    fn submit_request(self: Arc<Self>, ch: &IoChannel, io: BdevIo) {
        self.stats.record_submitted();
        let submit_ctx = Arc::clone(ch.context());
        let home = self.channels.lock().home.clone();
        let io_type = io.io_type();
        let mut io = LunIo {
            io,
            submit_ctx: None,
            retries: 0,
        };

        let Some(home) = home else {
            self.execute(io);
            return;
        };
        let on_home = home.id() == submit_ctx.id();
        if !on_home {
            self.stats.record_redirected();
            io.submit_ctx = Some(submit_ctx);
        }

        // Resets always go through the home context's message queue
        if io_type == IoType::Reset || !on_home {
            let lun = Arc::clone(&self);
            home.send_msg(move || lun.execute(io));
        } else {
            self.execute(io);
        }
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        match io_type {
            IoType::Read | IoType::Write | IoType::Flush | IoType::Reset => true,
            IoType::Unmap => self.encoder.unmap.is_some(),
            IoType::WriteZeroes => false,
        }
    }

    fn create_channel(self: Arc<Self>) -> Result<()> {
        let ctx = ExecContext::current().ok_or(Error::NoExecContext)?;
        let mut channels = self.channels.lock();
        if channels.count == 0 {
            debug_assert!(channels.home.is_none());
            let lun = Arc::downgrade(&self);
            channels.poller = Some(ctx.register_poller(
                format!("iscsi_lun:{}", self.name),
                self.lun_poll_interval,
                move || lun.upgrade().map_or(PollerStatus::Idle, |lun| lun.poll_lun()),
            ));
            debug!("{}: home context is {}", self.name, ctx.name());
            channels.home = Some(ctx);
        }
        channels.count += 1;
        Ok(())
    }

    fn destroy_channel(self: Arc<Self>) {
        let mut channels = self.channels.lock();
        channels.count = channels.count.saturating_sub(1);
        if channels.count > 0 {
            return;
        }
        let Some(home) = channels.home.clone() else {
            warn!("{}: last channel closed without a home context", self.name);
            return;
        };

        if !home.is_current() {
            // Only the home context may unregister its poller
            channels.count += 1;
            drop(channels);
            debug!("{}: forwarding channel teardown to {}", self.name, home.name());
            let lun = Arc::clone(&self);
            home.send_msg(move || lun.destroy_channel_on_home());
            return;
        }

        debug!("{}: last channel closed, releasing home context", self.name);
        Self::release_home(&mut channels);
    }

    fn destruct(self: Arc<Self>, done: DestructDone) {
        let home = self.channels.lock().home.clone();
        match home {
            // A last close forwarded to home is still queued there; tear down
            // behind it so the home poller is gone first
            Some(home) => {
                debug!("{}: destruct waits for channel teardown on {}", self.name, home.name());
                let lun = Arc::clone(&self);
                home.send_msg(move || lun.destruct_on_idle(done));
            }
            None => self.destruct_on_idle(done),
        }
    }

    fn dump_info_json(&self) -> Value {
        json!({
            "iscsi": {
                "initiator_name": self.initiator_iqn,
                "url": self.url,
            },
            "stats": self.stats.to_json(),
        })
    }

    fn write_config_json(&self, bdev: &Bdev) -> Option<Value> {
        Some(json!({
            "method": "bdev_iscsi_create",
            "params": {
                "name": bdev.name(),
                "initiator_iqn": self.initiator_iqn,
                "url": self.url,
            },
        }))
    }
}
