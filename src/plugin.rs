//! Plugin entry point
//!
//! Wires a backend, the registry and the reconciler together and owns
//! every subscription for the lifetime of the plugin.

use crate::backend::{Event, EventSender, Subscription, VpnBackend};
use crate::config::VpnConfig;
use crate::error::VpnResult;
use crate::host::{HostHandles, IndexSink};
use crate::index;
use crate::item::VpnItem;
use crate::reconciler::Reconciler;
use crate::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A running VPN plugin instance.
///
/// Dropping it cancels all platform subscriptions and unlinks every item,
/// including items the host still holds.
pub struct VpnPlugin {
    registry: Arc<Registry>,
    events: EventSender,
    watchers: Vec<Subscription>,
    reconciler: Option<Subscription>,
}

impl VpnPlugin {
    /// Start the plugin on an already connected backend.
    ///
    /// Fails if the inventory cannot be read or active-set changes cannot be
    /// subscribed to. Must be called within a tokio runtime.
    pub async fn new(backend: Arc<dyn VpnBackend>, host: HostHandles) -> VpnResult<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new(events.clone(), host.translator.clone()));
        let mut reconciler =
            Reconciler::new(backend.clone(), registry.clone(), host, events.clone());

        registry.rescan(backend.as_ref()).await?;

        let mut watchers = vec![backend.watch_active_set(events.clone()).await?];
        match backend.watch_inventory(events.clone()).await {
            Ok(subscription) => watchers.push(subscription),
            Err(e) => warn!("Connection definition changes will not be tracked: {}", e),
        }

        // Events queued by the watchers meanwhile are applied after this pass
        let active = backend.active_instances().await?;
        reconciler.reconcile(&active).await;

        let reconciler = Subscription::spawn(reconciler.run(receiver));
        info!("VPN plugin started with {} connection(s)", registry.len());

        Ok(Self {
            registry,
            events,
            watchers,
            reconciler: Some(reconciler),
        })
    }

    /// Start the plugin on the platform's native backend
    pub async fn start_default(config: &VpnConfig, host: HostHandles) -> VpnResult<Self> {
        let backend = default_backend(config).await?;
        Self::new(backend, host).await
    }

    /// Snapshot of all items in registry order
    pub fn items(&self) -> Vec<Arc<VpnItem>> {
        self.registry.items()
    }

    /// Item by id or by name
    pub fn find(&self, key: &str) -> Option<Arc<VpnItem>> {
        self.registry.find(key)
    }

    pub fn update_index_items(&self, sink: &dyn IndexSink) {
        index::publish(&self.registry, sink);
    }

    /// Queue a rescan of the connection inventory
    pub fn rescan(&self) {
        if self.events.send(Event::InventoryChanged).is_err() {
            debug!("Rescan dropped: reconciler stopped");
        }
    }
}

impl Drop for VpnPlugin {
    fn drop(&mut self) {
        drop(self.reconciler.take());
        self.watchers.clear();
        self.registry.unlink_all();
        info!("VPN plugin stopped");
    }
}

#[cfg(target_os = "macos")]
async fn default_backend(config: &VpnConfig) -> VpnResult<Arc<dyn VpnBackend>> {
    let backend = crate::backend::scutil::ScutilBackend::connect(&config.scutil).await?;
    Ok(Arc::new(backend))
}

#[cfg(all(not(target_os = "macos"), feature = "dbus-nm"))]
async fn default_backend(config: &VpnConfig) -> VpnResult<Arc<dyn VpnBackend>> {
    let backend =
        crate::backend::networkmanager::NetworkManagerBackend::connect(&config.networkmanager)
            .await?;
    Ok(Arc::new(backend))
}

#[cfg(all(not(target_os = "macos"), not(feature = "dbus-nm")))]
async fn default_backend(_config: &VpnConfig) -> VpnResult<Arc<dyn VpnBackend>> {
    Err(crate::error::VpnError::ServiceError(
        "no VPN backend available: built without dbus-nm".to_string(),
    ))
}
