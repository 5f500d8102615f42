//! Pending connection requests
//!
//! Attach requests live here while their handshake runs. One poller, shared
//! by all requests, drives every connection; it is registered with the
//! first request and goes away once nothing is pending.

use crate::client::{self, IscsiContext};
use crate::handshake::{Handshake, LunParams, Progress};

use lunbridge_bdev::{Bdev, ExecContext, Poller, PollerStatus};
use lunbridge_common::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reports the outcome of an attach request
pub type AttachCallback = Box<dyn FnOnce(Result<Arc<Bdev>>) + Send>;

/// A connection that finished its handshake, ready to become a device
pub struct ProvisionRequest<'a> {
    pub name: &'a str,
    pub url: &'a str,
    pub initiator_iqn: &'a str,
    pub params: LunParams,
    /// Taken by the provisioner once the device is registered
    pub conn: &'a mut Option<Box<dyn IscsiContext>>,
}

/// Turns a handshaken connection into a registered device
pub trait Provisioner: Send + Sync {
    fn provision(&self, request: ProvisionRequest<'_>) -> Result<Arc<Bdev>>;
}

#[derive(Debug)]
enum Outcome {
    Pending,
    Succeeded(LunParams),
    Failed(Error),
}

/// One in-progress attach
pub struct ConnectionRequest {
    name: String,
    url: String,
    initiator_iqn: String,
    conn: Option<Box<dyn IscsiContext>>,
    handshake: Handshake,
    outcome: Outcome,
    callback: AttachCallback,
}

impl std::fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("name", &self.name)
            .field("stage", &self.handshake.stage())
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl ConnectionRequest {
    /// Wrap a connection whose handshake has been started
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        initiator_iqn: impl Into<String>,
        conn: Box<dyn IscsiContext>,
        handshake: Handshake,
        callback: AttachCallback,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            initiator_iqn: initiator_iqn.into(),
            conn: Some(conn),
            handshake,
            outcome: Outcome::Pending,
            callback,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_terminal(&self) -> bool {
        !matches!(self.outcome, Outcome::Pending)
    }

    /// Service the connection once and feed its completions to the handshake
    fn drive(&mut self) {
        if self.is_terminal() {
            return;
        }
        let Some(conn) = self.conn.as_deref_mut() else {
            return;
        };

        let completions = match client::drive(conn) {
            Ok(Some(completions)) => completions,
            Ok(None) => return,
            Err(e) => {
                error!("{}: connection failed: {e} ({})", self.name, conn.last_error());
                self.outcome = Outcome::Failed(e);
                return;
            }
        };

        for completion in completions {
            match self.handshake.advance(conn, &completion) {
                Progress::Pending => {}
                Progress::Ready(params) => {
                    self.outcome = Outcome::Succeeded(params);
                    return;
                }
                Progress::Failed(e) => {
                    self.outcome = Outcome::Failed(e);
                    return;
                }
            }
        }
    }
}

/// The set of pending attach requests
pub struct ConnectionRegistry {
    pending: Mutex<Vec<ConnectionRequest>>,
    poller: Mutex<Option<Poller>>,
    poll_interval: Duration,
    provisioner: Weak<dyn Provisioner>,
}

impl ConnectionRegistry {
    pub fn new(poll_interval: Duration, provisioner: Weak<dyn Provisioner>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            poll_interval,
            provisioner,
        })
    }

    /// Add a request, starting the shared poller on the current context if
    /// it is not running.
    pub fn insert(self: &Arc<Self>, request: ConnectionRequest) -> Result<()> {
        let ctx = ExecContext::current().ok_or(Error::NoExecContext)?;

        let mut pending = self.pending.lock();
        debug!("{}: connection request queued", request.name);
        pending.push(request);

        let mut poller = self.poller.lock();
        if poller.is_none() {
            let registry = Arc::downgrade(self);
            *poller = Some(ctx.register_poller(
                "iscsi_conn_poll",
                self.poll_interval,
                move || {
                    registry
                        .upgrade()
                        .map_or(PollerStatus::Idle, |registry| registry.poll())
                },
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check whether the shared poller is registered
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.poller.lock().is_some()
    }

    fn poll(&self) -> PollerStatus {
        let finished: Vec<ConnectionRequest> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                if let Some(poller) = self.poller.lock().take() {
                    debug!("no pending connection requests, stopping poller");
                    poller.unregister();
                }
                return PollerStatus::Idle;
            }

            for request in pending.iter_mut() {
                request.drive();
            }

            let (finished, still_pending): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(ConnectionRequest::is_terminal);
            *pending = still_pending;
            finished
        };

        for request in finished {
            self.finish(request);
        }
        PollerStatus::Busy
    }

    fn finish(&self, request: ConnectionRequest) {
        let ConnectionRequest {
            name,
            url,
            initiator_iqn,
            mut conn,
            outcome,
            callback,
            ..
        } = request;

        let result = match outcome {
            Outcome::Succeeded(params) => match self.provisioner.upgrade() {
                Some(provisioner) => provisioner.provision(ProvisionRequest {
                    name: &name,
                    url: &url,
                    initiator_iqn: &initiator_iqn,
                    params,
                    conn: &mut conn,
                }),
                None => Err(Error::Shutdown),
            },
            Outcome::Failed(e) => Err(e),
            Outcome::Pending => return,
        };

        match &result {
            Ok(bdev) => info!("{name}: attached {url} ({} blocks)", bdev.num_blocks()),
            Err(e) => error!("{name}: attach of {url} failed: {e}"),
        }
        callback(result);
        drop(conn);
    }

    /// Fail every pending request with [`Error::Shutdown`] and stop polling
    pub fn shutdown(&self) {
        let drained: Vec<ConnectionRequest> = self.pending.lock().drain(..).collect();
        if let Some(poller) = self.poller.lock().take() {
            poller.unregister();
        }
        if !drained.is_empty() {
            warn!("shutting down with {} pending connection requests", drained.len());
        }
        for request in drained {
            let ConnectionRequest { conn, callback, .. } = request;
            callback(Err(Error::Shutdown));
            drop(conn);
        }
    }
}
