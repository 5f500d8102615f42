//! Block device registration, I/O channels and I/O completion

use crate::reactor::{ContextId, ExecContext};

use bytes::BytesMut;
use lunbridge_common::{BlockGeometry, Error, IoType, Result, ScsiOutcome};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Completion callback of one I/O
pub type IoCompletionCb = Box<dyn FnOnce(IoCompletion) + Send>;

/// Callback invoked once a device has been unregistered and destroyed
pub type UnregisterCb = Box<dyn FnOnce(Result<()>) + Send>;

/// Driver side of a registered block device
pub trait BlockDevice: Send + Sync + 'static {
    /// Execute an I/O submitted on `ch`. The driver owns `io` and must
    /// complete it exactly once, on any context.
    fn submit_request(self: Arc<Self>, ch: &IoChannel, io: BdevIo);

    /// Check whether the device accepts this I/O type
    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// First channel opened on the current context
    fn create_channel(self: Arc<Self>) -> Result<()>;

    /// Last channel released on the current context
    fn destroy_channel(self: Arc<Self>);

    /// Release driver resources after unregistration; report through `done`
    fn destruct(self: Arc<Self>, done: DestructDone);

    /// Driver-specific introspection data
    fn dump_info_json(&self) -> Value {
        Value::Null
    }

    /// Configuration entry that recreates this device, if any
    fn write_config_json(&self, _bdev: &Bdev) -> Option<Value> {
        None
    }
}

/// Static properties of a device being registered
#[derive(Debug, Clone)]
pub struct BdevProps {
    pub name: String,
    pub product_name: String,
    /// Name of the module owning the device
    pub module: &'static str,
    pub geometry: BlockGeometry,
    /// Max blocks per unmap segment (0 = unmap unsupported)
    pub max_unmap: u32,
    /// Max unmap segments per request
    pub max_unmap_segments: u32,
}

#[derive(Default)]
struct ChannelTable {
    /// Open channel references per context
    refs: HashMap<ContextId, usize>,
    /// Set once unregistered; new channels are refused
    removed: bool,
    /// Unregistration waiting for the last channel
    pending_unregister: Option<UnregisterCb>,
}

/// A registered block device
pub struct Bdev {
    name: String,
    product_name: String,
    module: &'static str,
    block_size: u32,
    phys_block_exp: u8,
    num_blocks: AtomicU64,
    max_unmap: u32,
    max_unmap_segments: u32,
    device: Arc<dyn BlockDevice>,
    channels: Mutex<ChannelTable>,
}

impl std::fmt::Debug for Bdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bdev")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("geometry", &self.geometry())
            .finish_non_exhaustive()
    }
}

impl Bdev {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    #[must_use]
    pub fn module(&self) -> &'static str {
        self.module
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn phys_block_size(&self) -> u32 {
        self.block_size << self.phys_block_exp
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn geometry(&self) -> BlockGeometry {
        BlockGeometry {
            block_size: self.block_size,
            phys_block_exp: self.phys_block_exp,
            num_blocks: self.num_blocks(),
        }
    }

    #[must_use]
    pub fn max_unmap(&self) -> u32 {
        self.max_unmap
    }

    #[must_use]
    pub fn max_unmap_segments(&self) -> u32 {
        self.max_unmap_segments
    }

    /// Check whether the device accepts this I/O type
    #[must_use]
    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        self.device.io_type_supported(io_type)
    }

    /// Apply a new block count reported by the driver
    pub fn notify_blockcnt_change(&self, num_blocks: u64) -> Result<()> {
        let old = self.num_blocks.swap(num_blocks, Ordering::AcqRel);
        info!("Bdev {}: block count {old} -> {num_blocks}", self.name);
        Ok(())
    }

    /// Number of contexts holding a channel to this device
    #[must_use]
    pub fn open_channel_contexts(&self) -> usize {
        self.channels.lock().refs.len()
    }

    /// Get a channel for the current context, opening the driver's
    /// per-context state on first use.
    pub fn get_io_channel(self: &Arc<Self>) -> Result<IoChannel> {
        let ctx = ExecContext::current().ok_or(Error::NoExecContext)?;

        let first = {
            let mut table = self.channels.lock();
            if table.removed {
                return Err(Error::NotFound(self.name.clone()));
            }
            let refs = table.refs.entry(ctx.id()).or_insert(0);
            *refs += 1;
            *refs == 1
        };

        if first {
            if let Err(e) = Arc::clone(&self.device).create_channel() {
                warn!("Bdev {}: channel create failed on {}: {e}", self.name, ctx.name());
                self.channels.lock().refs.remove(&ctx.id());
                return Err(e);
            }
            debug!("Bdev {}: channel opened on {}", self.name, ctx.name());
        }

        Ok(IoChannel {
            bdev: Arc::clone(self),
            ctx,
        })
    }

    fn put_io_channel(&self, ctx_id: ContextId) {
        let pending = {
            let mut table = self.channels.lock();
            let Some(refs) = table.refs.get_mut(&ctx_id) else {
                warn!("Bdev {}: channel put without a reference", self.name);
                return;
            };
            *refs -= 1;
            if *refs > 0 {
                return;
            }
            table.refs.remove(&ctx_id);
            if table.refs.is_empty() {
                table.pending_unregister.take()
            } else {
                None
            }
        };

        Arc::clone(&self.device).destroy_channel();
        debug!("Bdev {}: channel closed on context {ctx_id}", self.name);
        if let Some(cb) = pending {
            self.destruct(cb);
        }
    }

    fn destruct(&self, cb: UnregisterCb) {
        let name = self.name.clone();
        Arc::clone(&self.device).destruct(DestructDone::new(move |result| {
            match &result {
                Ok(()) => info!("Bdev {name}: destroyed"),
                Err(e) => warn!("Bdev {name}: destruct failed: {e}"),
            }
            cb(result);
        }));
    }

    /// Read `num_blocks` blocks at `offset_blocks`. Empty `iovs` lets the
    /// driver allocate the buffer.
    pub fn read_blocks(
        &self,
        ch: &IoChannel,
        iovs: Vec<BytesMut>,
        offset_blocks: u64,
        num_blocks: u64,
        cb: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Result<()> {
        self.submit(ch, IoType::Read, iovs, offset_blocks, num_blocks, Box::new(cb))
    }

    /// Write `iovs` at `offset_blocks`
    pub fn write_blocks(
        &self,
        ch: &IoChannel,
        iovs: Vec<BytesMut>,
        offset_blocks: u64,
        num_blocks: u64,
        cb: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Result<()> {
        let len: usize = iovs.iter().map(BytesMut::len).sum();
        if Some(len as u64) != num_blocks.checked_mul(u64::from(self.block_size)) {
            return Err(Error::invalid_argument(format!(
                "write of {num_blocks} blocks carries {len} bytes"
            )));
        }
        self.submit(ch, IoType::Write, iovs, offset_blocks, num_blocks, Box::new(cb))
    }

    /// Flush a block range to stable storage
    pub fn flush_blocks(
        &self,
        ch: &IoChannel,
        offset_blocks: u64,
        num_blocks: u64,
        cb: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Result<()> {
        self.submit(ch, IoType::Flush, Vec::new(), offset_blocks, num_blocks, Box::new(cb))
    }

    /// Deallocate a block range
    pub fn unmap_blocks(
        &self,
        ch: &IoChannel,
        offset_blocks: u64,
        num_blocks: u64,
        cb: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Result<()> {
        self.submit(ch, IoType::Unmap, Vec::new(), offset_blocks, num_blocks, Box::new(cb))
    }

    /// Reset the device
    pub fn reset(&self, ch: &IoChannel, cb: impl FnOnce(IoCompletion) + Send + 'static) -> Result<()> {
        self.submit(ch, IoType::Reset, Vec::new(), 0, 0, Box::new(cb))
    }

    fn submit(
        &self,
        ch: &IoChannel,
        io_type: IoType,
        iovs: Vec<BytesMut>,
        offset_blocks: u64,
        num_blocks: u64,
        cb: IoCompletionCb,
    ) -> Result<()> {
        if ch.bdev.name != self.name {
            return Err(Error::invalid_argument(format!(
                "channel of {} used for {}",
                ch.bdev.name, self.name
            )));
        }
        if !self.io_type_supported(io_type) {
            return Err(Error::unsupported(format!("{io_type} on {}", self.name)));
        }
        if io_type != IoType::Reset {
            let end = offset_blocks.checked_add(num_blocks);
            if num_blocks == 0 || end.is_none_or(|end| end > self.num_blocks()) {
                return Err(Error::invalid_argument(format!(
                    "range {offset_blocks}+{num_blocks} outside {} blocks",
                    self.num_blocks()
                )));
            }
        }

        let io = BdevIo {
            bdev: Arc::clone(&ch.bdev),
            io_type,
            offset_blocks,
            num_blocks,
            iovs,
            cb: Some(cb),
        };
        Arc::clone(&self.device).submit_request(ch, io);
        Ok(())
    }

    /// Generic introspection dump
    #[must_use]
    pub fn dump_info_json(&self) -> Value {
        json!({
            "name": self.name,
            "product_name": self.product_name,
            "block_size": self.block_size,
            "num_blocks": self.num_blocks(),
            "phys_block_size": self.phys_block_size(),
            "max_unmap": self.max_unmap,
            "max_unmap_segments": self.max_unmap_segments,
            "driver_specific": self.device.dump_info_json(),
        })
    }

    /// Configuration entry that recreates this device
    #[must_use]
    pub fn write_config_json(&self) -> Option<Value> {
        self.device.write_config_json(self)
    }
}

/// Completion hook handed to [`BlockDevice::destruct`]
pub struct DestructDone {
    cb: Box<dyn FnOnce(Result<()>) + Send>,
}

impl DestructDone {
    pub fn new(cb: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self { cb: Box::new(cb) }
    }

    pub fn done(self, result: Result<()>) {
        (self.cb)(result);
    }
}

/// A per-context reference to a device.
///
/// Dropping it releases the reference on its own context, by message.
pub struct IoChannel {
    bdev: Arc<Bdev>,
    ctx: Arc<ExecContext>,
}

impl IoChannel {
    #[must_use]
    pub fn bdev(&self) -> &Arc<Bdev> {
        &self.bdev
    }

    /// Context the channel belongs to
    #[must_use]
    pub fn context(&self) -> &Arc<ExecContext> {
        &self.ctx
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        let bdev = Arc::clone(&self.bdev);
        let ctx_id = self.ctx.id();
        self.ctx.send_msg(move || bdev.put_io_channel(ctx_id));
    }
}

/// Terminal status of an I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    Failed,
    /// Completed by the target with a non-GOOD SCSI status
    ScsiError,
}

/// What the submitter receives when an I/O completes
#[derive(Debug)]
pub struct IoCompletion {
    pub status: IoStatus,
    /// SCSI status and sense, when the driver reported them
    pub scsi: Option<ScsiOutcome>,
    /// The I/O's buffers, filled for reads
    pub iovs: Vec<BytesMut>,
}

impl IoCompletion {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == IoStatus::Success
    }
}

/// One in-flight block I/O, owned by whoever is processing it
pub struct BdevIo {
    bdev: Arc<Bdev>,
    io_type: IoType,
    offset_blocks: u64,
    num_blocks: u64,
    iovs: Vec<BytesMut>,
    cb: Option<IoCompletionCb>,
}

impl std::fmt::Debug for BdevIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdevIo")
            .field("bdev", &self.bdev.name)
            .field("io_type", &self.io_type)
            .field("offset_blocks", &self.offset_blocks)
            .field("num_blocks", &self.num_blocks)
            .field("iovcnt", &self.iovs.len())
            .finish_non_exhaustive()
    }
}

impl BdevIo {
    #[must_use]
    pub fn bdev(&self) -> &Arc<Bdev> {
        &self.bdev
    }

    #[must_use]
    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    #[must_use]
    pub fn offset_blocks(&self) -> u64 {
        self.offset_blocks
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    /// Byte length of the request, `None` on overflow
    #[must_use]
    pub fn num_bytes(&self) -> Option<u64> {
        self.num_blocks
            .checked_mul(u64::from(self.bdev.block_size))
    }

    #[must_use]
    pub fn iovs(&self) -> &[BytesMut] {
        &self.iovs
    }

    pub fn take_iovs(&mut self) -> Vec<BytesMut> {
        std::mem::take(&mut self.iovs)
    }

    pub fn set_iovs(&mut self, iovs: Vec<BytesMut>) {
        self.iovs = iovs;
    }

    /// Allocate a data buffer for a read submitted without one
    pub fn ensure_buffer(&mut self) -> Result<()> {
        if !self.iovs.is_empty() {
            return Ok(());
        }
        let len = self
            .num_bytes()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                Error::ResourceExhausted(format!("{} block buffer", self.num_blocks))
            })?;
        self.iovs.push(BytesMut::zeroed(len));
        Ok(())
    }

    /// Complete with a plain status
    pub fn complete(mut self, status: IoStatus) {
        self.finish(status, None);
    }

    /// Complete with the SCSI status and sense reported by the target.
    /// GOOD maps to success, anything else to [`IoStatus::ScsiError`].
    pub fn complete_scsi_status(mut self, outcome: ScsiOutcome) {
        let status = if outcome.status.is_good() {
            IoStatus::Success
        } else {
            IoStatus::ScsiError
        };
        self.finish(status, Some(outcome));
    }

    fn finish(&mut self, status: IoStatus, scsi: Option<ScsiOutcome>) {
        if let Some(cb) = self.cb.take() {
            cb(IoCompletion {
                status,
                scsi,
                iovs: std::mem::take(&mut self.iovs),
            });
        }
    }
}

impl Drop for BdevIo {
    fn drop(&mut self) {
        if self.cb.is_some() {
            warn!("{self:?} dropped without completion");
            self.finish(IoStatus::Failed, None);
        }
    }
}

/// Registry of block devices by name
pub struct BdevManager {
    bdevs: RwLock<HashMap<String, Arc<Bdev>>>,
}

impl BdevManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bdevs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a device
    pub fn register(&self, props: BdevProps, device: Arc<dyn BlockDevice>) -> Result<Arc<Bdev>> {
        if props.name.is_empty() {
            return Err(Error::invalid_argument("device name is empty"));
        }
        if props.geometry.block_size == 0 || props.geometry.num_blocks == 0 {
            return Err(Error::invalid_argument(format!(
                "device {} has empty geometry {:?}",
                props.name, props.geometry
            )));
        }

        let mut bdevs = self.bdevs.write();
        if bdevs.contains_key(&props.name) {
            return Err(Error::AlreadyExists(props.name));
        }

        let bdev = Arc::new(Bdev {
            name: props.name.clone(),
            product_name: props.product_name,
            module: props.module,
            block_size: props.geometry.block_size,
            phys_block_exp: props.geometry.phys_block_exp,
            num_blocks: AtomicU64::new(props.geometry.num_blocks),
            max_unmap: props.max_unmap,
            max_unmap_segments: props.max_unmap_segments,
            device,
            channels: Mutex::new(ChannelTable::default()),
        });
        bdevs.insert(props.name, Arc::clone(&bdev));
        info!(
            "Bdev {}: registered ({} x {}B, module {})",
            bdev.name,
            bdev.num_blocks(),
            bdev.block_size,
            bdev.module
        );
        Ok(bdev)
    }

    /// Get a device by name
    pub fn get(&self, name: &str) -> Result<Arc<Bdev>> {
        self.bdevs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// List all devices
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Bdev>> {
        self.bdevs.read().values().cloned().collect()
    }

    /// List the devices owned by one module
    #[must_use]
    pub fn list_by_module(&self, module: &str) -> Vec<Arc<Bdev>> {
        let mut bdevs: Vec<_> = self
            .bdevs
            .read()
            .values()
            .filter(|b| b.module == module)
            .cloned()
            .collect();
        bdevs.sort_by(|a, b| a.name.cmp(&b.name));
        bdevs
    }

    /// Unregister a device owned by `module`. The device is destroyed once
    /// its last channel is released; `cb` runs after destruction.
    pub fn unregister_by_name(
        &self,
        name: &str,
        module: &str,
        cb: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        let bdev = {
            let mut bdevs = self.bdevs.write();
            match bdevs.get(name) {
                Some(bdev) if bdev.module == module => {}
                _ => return Err(Error::NotFound(name.to_string())),
            }
            bdevs.remove(name).ok_or_else(|| Error::NotFound(name.to_string()))?
        };

        let cb: UnregisterCb = Box::new(cb);
        let destruct_now = {
            let mut table = bdev.channels.lock();
            table.removed = true;
            if table.refs.is_empty() {
                Some(cb)
            } else {
                info!(
                    "Bdev {name}: unregister waits for {} open channel contexts",
                    table.refs.len()
                );
                table.pending_unregister = Some(cb);
                None
            }
        };

        if let Some(cb) = destruct_now {
            bdev.destruct(cb);
        }
        Ok(())
    }
}

impl Default for BdevManager {
    fn default() -> Self {
        Self::new()
    }
}
