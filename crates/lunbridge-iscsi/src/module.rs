//! iSCSI block device module
//!
//! Entry points for attaching and detaching iSCSI LUNs. An attach validates
//! its arguments synchronously, starts the login and hands the connection
//! to the [`ConnectionRegistry`]; the callback runs once the LUN is
//! registered or the handshake failed.

use crate::client::Connector;
use crate::handshake::Handshake;
use crate::lun::{IscsiLun, MODULE_NAME, PRODUCT_NAME};
use crate::registry::{ConnectionRegistry, ConnectionRequest, ProvisionRequest, Provisioner};
use crate::url::TargetUrl;

use lunbridge_bdev::{Bdev, BdevManager, BdevProps, ExecContext};
use lunbridge_common::{AttachParams, Error, IscsiModuleConfig, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

type DetachCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// The iSCSI module: attach/detach surface and LUN bookkeeping
pub struct IscsiBdevModule {
    config: IscsiModuleConfig,
    manager: Arc<BdevManager>,
    connector: Arc<dyn Connector>,
    registry: Arc<ConnectionRegistry>,
    luns: RwLock<HashMap<String, Weak<IscsiLun>>>,
}

impl IscsiBdevModule {
    pub fn new(
        config: IscsiModuleConfig,
        manager: Arc<BdevManager>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|module: &Weak<Self>| {
            let provisioner: Weak<dyn Provisioner> = module.clone();
            Self {
                registry: ConnectionRegistry::new(config.connection_poll_interval(), provisioner),
                config,
                manager,
                connector,
                luns: RwLock::new(HashMap::new()),
            }
        })
    }

    #[must_use]
    pub fn config(&self) -> &IscsiModuleConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Session of an attached LUN, kept until its last reference is gone
    #[must_use]
    pub fn lun(&self, name: &str) -> Option<Arc<IscsiLun>> {
        self.luns.read().get(name).and_then(Weak::upgrade)
    }

    /// Attach the LUN at `url` as block device `name`.
    ///
    /// Argument errors are returned directly and the callback is not
    /// invoked. Otherwise the callback runs exactly once, on the context
    /// driving pending connections: the one that inserted the first request
    /// while none were pending.
    pub fn attach(
        &self,
        name: &str,
        url: &str,
        initiator_iqn: &str,
        callback: impl FnOnce(Result<Arc<Bdev>>) + Send + 'static,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("device name is empty"));
        }
        if initiator_iqn.is_empty() {
            return Err(Error::invalid_argument("initiator IQN is empty"));
        }
        if ExecContext::current().is_none() {
            return Err(Error::NoExecContext);
        }
        let target = TargetUrl::parse(url).inspect_err(|e| error!("{name}: {e}"))?;

        let mut conn = self.connector.create(initiator_iqn)?;
        let handshake =
            Handshake::start(&mut *conn, &target, self.config.default_max_unmap_blocks)?;
        info!(
            "{name}: connecting to {} ({} LUN {}) as {initiator_iqn}",
            target.portal(),
            target.target_iqn,
            target.lun
        );

        self.registry.insert(ConnectionRequest::new(
            name,
            url,
            initiator_iqn,
            conn,
            handshake,
            Box::new(callback),
        ))
    }

    /// Attach from persisted parameters, defaulting the initiator IQN
    pub fn attach_params(
        &self,
        params: &AttachParams,
        callback: impl FnOnce(Result<Arc<Bdev>>) + Send + 'static,
    ) -> Result<()> {
        let initiator_iqn = params
            .initiator_iqn
            .as_deref()
            .unwrap_or(&self.config.default_initiator_iqn);
        self.attach(&params.name, &params.url, initiator_iqn, callback)
    }

    /// [`attach`](Self::attach) as a future. The future resolves once the
    /// contexts have been driven far enough to finish the handshake.
    pub fn attach_future(
        &self,
        name: &str,
        url: &str,
        initiator_iqn: &str,
    ) -> Result<impl Future<Output = Result<Arc<Bdev>>> + Send + use<>> {
        let (tx, rx) = oneshot::channel();
        self.attach(name, url, initiator_iqn, move |result| {
            let _ = tx.send(result);
        })?;
        Ok(async move { rx.await.map_err(|_| Error::Shutdown)? })
    }

    /// Detach an iSCSI device. The callback always runs, after the device
    /// is destroyed or with the reason it could not be.
    pub fn detach(&self, name: &str, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let slot: Arc<Mutex<Option<DetachCallback>>> =
            Arc::new(Mutex::new(Some(Box::new(callback))));

        let on_done = Arc::clone(&slot);
        let owned_name = name.to_string();
        let result = self.manager.unregister_by_name(name, MODULE_NAME, move |result| {
            match &result {
                Ok(()) => info!("{owned_name}: detached"),
                Err(e) => warn!("{owned_name}: detach failed: {e}"),
            }
            if let Some(callback) = on_done.lock().take() {
                callback(result);
            }
        });

        if let Err(e) = result {
            warn!("{name}: cannot detach: {e}");
            if let Some(callback) = slot.lock().take() {
                callback(Err(e));
            }
        }
    }

    /// [`detach`](Self::detach) as a future
    pub fn detach_future(&self, name: &str) -> impl Future<Output = Result<()>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        self.detach(name, move |result| {
            let _ = tx.send(result);
        });
        async move { rx.await.map_err(|_| Error::Shutdown)? }
    }

    /// Configuration entries recreating every attached device
    #[must_use]
    pub fn config_json(&self) -> Vec<Value> {
        self.manager
            .list_by_module(MODULE_NAME)
            .iter()
            .filter_map(|bdev| bdev.write_config_json())
            .collect()
    }

    /// Fail pending attaches and stop connection polling
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

impl Provisioner for IscsiBdevModule {
    fn provision(&self, request: ProvisionRequest<'_>) -> Result<Arc<Bdev>> {
        let ProvisionRequest {
            name,
            url,
            initiator_iqn,
            params,
            conn,
        } = request;
        if ExecContext::current().is_none() {
            return Err(Error::NoExecContext);
        }
        if conn.is_none() {
            return Err(Error::protocol("connection already released"));
        }

        let lun = IscsiLun::new(name, url, initiator_iqn, &params, &self.config);
        let bdev = self.manager.register(
            BdevProps {
                name: name.to_string(),
                product_name: PRODUCT_NAME.to_string(),
                module: MODULE_NAME,
                geometry: params.geometry,
                max_unmap: params.max_unmap.unwrap_or(0),
                max_unmap_segments: if params.max_unmap.is_some() {
                    self.config.max_unmap_descriptors
                } else {
                    0
                },
            },
            lun.clone(),
        )?;

        if let Some(conn) = conn.take()
            && let Err(e) = lun.start(&bdev, conn, self.config.idle_poll_interval())
        {
            error!("{name}: cannot start session: {e}");
            let _ = self.manager.unregister_by_name(name, MODULE_NAME, |_| {});
            return Err(e);
        }
        let mut luns = self.luns.write();
        luns.retain(|_, lun| lun.strong_count() > 0);
        luns.insert(name.to_string(), Arc::downgrade(&lun));
        Ok(bdev)
    }
}
