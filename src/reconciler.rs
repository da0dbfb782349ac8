//! Active-connection reconciliation
//!
//! The reconciler is the single consumer of [`Event`]s. It diffs each
//! reported active set against the registry, opens and cancels per-instance
//! status subscriptions, and applies status changes to linked items.
//!
//! Per item the machine is `{unlinked, linked} x State` and never
//! terminates:
//!
//! ```text
//!   unlinked ──(instance of this item appears in active set)──▶ linked
//!      ▲          subscribe, read status, set state                │
//!      │                                                           │ status event
//!      └──(instance missing from active set)── set Disconnected ◀──┘ set state
//! ```
//!
//! A reconciliation pass runs to completion before the next event is read,
//! so passes never interleave.

use crate::backend::{Event, EventReceiver, EventSender, LinkId, StatusSink, VpnBackend};
use crate::error::{VpnError, VpnResult};
use crate::host::{HostHandles, Notifier, Translator};
use crate::item::{ActiveLink, VpnItem};
use crate::registry::Registry;
use crate::state::State;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Reconciler {
    backend: Arc<dyn VpnBackend>,
    registry: Arc<Registry>,
    host: HostHandles,
    events: EventSender,
    next_link: u64,
}

impl Reconciler {
    pub fn new(
        backend: Arc<dyn VpnBackend>,
        registry: Arc<Registry>,
        host: HostHandles,
        events: EventSender,
    ) -> Self {
        Self {
            backend,
            registry,
            host,
            events,
            next_link: 0,
        }
    }

    /// Process events until every sender is gone
    pub async fn run(mut self, mut events: EventReceiver) {
        info!("Reconciler started");
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("Reconciler stopped");
    }

    pub async fn handle(&mut self, event: Event) {
        match event {
            Event::ActiveSetChanged(active) => self.reconcile(&active).await,
            Event::StatusChanged { instance, link, state } => {
                self.apply_status(&instance, link, state)
            }
            Event::InventoryChanged => {
                if let Err(e) = self.refresh().await {
                    warn!("Failed to refresh VPN connections: {}", e);
                }
            }
            Event::Request { id, connect } => {
                if let Some(request) = self.prepare_request(&id, connect) {
                    tokio::spawn(request.execute());
                }
            }
        }
    }

    /// One reconciliation pass against the complete active set.
    ///
    /// Removals run before additions so an item whose instance was replaced
    /// in the same report ends up linked to the new instance.
    pub async fn reconcile(&mut self, active: &[String]) {
        let items = self.registry.items();

        // Removals
        for item in &items {
            let stale = item
                .active_instance()
                .is_some_and(|instance| !active.contains(&instance));
            if stale {
                if let Some(link) = item.take_link() {
                    debug!("Active connection {} of {} is gone", link.instance(), item.text());
                }
                item.set_state(State::Disconnected);
            }
        }

        // Additions
        for instance in active {
            if items
                .iter()
                .any(|item| item.active_instance().as_deref() == Some(instance.as_str()))
            {
                continue;
            }

            let owner = match self.backend.instance_owner(instance).await {
                Ok(owner) => owner,
                Err(e) => {
                    debug!("Ignoring active connection {}: {}", instance, e);
                    continue;
                }
            };

            let Some(item) = self.registry.lookup(&owner) else {
                debug!("Ignoring active connection {} of untracked connection {}", instance, owner);
                continue;
            };

            if item.is_linked() {
                debug!("{} already has an active connection, ignoring {}", item.text(), instance);
                continue;
            }

            self.link(&item, instance).await;
        }
    }

    async fn link(&mut self, item: &Arc<VpnItem>, instance: &str) {
        let link = self.allocate_link();
        let sink = StatusSink::new(self.events.clone(), instance.to_string(), link);

        let subscription = match self.backend.watch_instance(sink).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Failed to watch active connection {} of {}: {}", instance, item.text(), e);
                return;
            }
        };

        // Read after subscribing so no transition falls in between
        let state = match self.backend.instance_status(instance).await {
            Ok(state) => state,
            Err(e) => {
                debug!("Active connection {} vanished while linking: {}", instance, e);
                return;
            }
        };

        debug!("Linked {} to active connection {}", item.text(), instance);
        item.attach_link(ActiveLink::new(instance.to_string(), link, subscription));
        item.set_state(state);
    }

    fn allocate_link(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    /// Apply a status event if its link is still current
    pub fn apply_status(&self, instance: &str, link: LinkId, state: State) {
        let item = self
            .registry
            .items()
            .into_iter()
            .find(|item| item.is_linked_to(instance, link));

        match item {
            Some(item) => {
                debug!("Active connection {} of {} reports {}", instance, item.text(), state);
                item.set_state(state);
            }
            None => debug!("Dropping status {} for unlinked active connection {}", state, instance),
        }
    }

    /// Rescan the inventory, then reconcile against the current active set
    pub async fn refresh(&mut self) -> VpnResult<()> {
        self.registry.rescan(self.backend.as_ref()).await?;
        let active = self.backend.active_instances().await?;
        self.reconcile(&active).await;
        Ok(())
    }

    /// Resolve a user request into a platform call that can run detached
    pub fn prepare_request(&self, id: &str, connect: bool) -> Option<PendingRequest> {
        let Some(item) = self.registry.lookup(id) else {
            debug!("Dropping request for unknown connection {}", id);
            return None;
        };

        Some(PendingRequest {
            backend: self.backend.clone(),
            notifier: self.host.notifier.clone(),
            translator: self.host.translator.clone(),
            id: item.id().to_string(),
            name: item.text().to_string(),
            instance: item.active_instance(),
            connect,
        })
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.registry.unlink_all();
    }
}

/// A connect or disconnect request, detached from the event loop.
///
/// Success changes nothing locally; the platform reports the resulting
/// transition through the notification path. Failure is reported to the
/// user and leaves the state alone.
pub struct PendingRequest {
    backend: Arc<dyn VpnBackend>,
    notifier: Arc<dyn Notifier>,
    translator: Arc<dyn Translator>,
    id: String,
    name: String,
    instance: Option<String>,
    connect: bool,
}

impl PendingRequest {
    pub async fn execute(self) {
        let result = if self.connect {
            self.backend.request_connect(&self.id).await
        } else {
            match &self.instance {
                Some(instance) => self.backend.request_disconnect(instance).await,
                None => Err(VpnError::RequestFailed {
                    name: self.name.clone(),
                    reason: "connection is not active".to_string(),
                }),
            }
        };

        match result {
            Ok(()) if self.connect => info!("Successfully started connecting: {}", self.name),
            Ok(()) => info!("Successfully stopped connection: {}", self.name),
            Err(e) => {
                let template = if self.connect {
                    "Failed connecting '%1': %2."
                } else {
                    "Failed disconnecting '%1': %2."
                };
                let reason = platform_reason(&e);
                warn!("{}", fill(template, &self.name, &reason));
                self.notifier
                    .warning(&fill(&self.translator.tr(template), &self.name, &reason));
            }
        }
    }
}

fn fill(template: &str, name: &str, reason: &str) -> String {
    template.replace("%1", name).replace("%2", reason)
}

fn platform_reason(error: &VpnError) -> String {
    match error {
        VpnError::RequestFailed { reason, .. } => reason.clone(),
        VpnError::CommandFailed { stderr, .. } => stderr.clone(),
        other => other.to_string(),
    }
}
