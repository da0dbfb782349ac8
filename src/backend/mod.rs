//! Platform backends
//!
//! A backend is the only code that knows a platform's connection API. The
//! registry and reconciler are written once against [`VpnBackend`]:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Registry / Reconciler (single task)    │
//! └──────────────────┬───────────────────────┘
//!                    │  VpnBackend + Event channel
//!          ┌─────────┴──────────┐
//!          ▼                    ▼
//!   ┌──────────────┐     ┌──────────────┐
//!   │NetworkManager│     │   scutil     │  <- Backends
//!   │ (system bus) │     │ (SC, macOS)  │
//!   └──────────────┘     └──────────────┘
//! ```
//!
//! Notifications flow back as [`Event`]s on one unbounded channel that a
//! single consumer drains, so every state mutation happens in order on
//! one task.

#[cfg(feature = "dbus-nm")]
pub mod networkmanager;
#[cfg(feature = "dbus-nm")]
pub mod nm_proxy;
pub mod scutil;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::VpnResult;
use crate::state::State;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

/// A configured connection as reported by the platform inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDefinition {
    /// Platform identifier (NM object path, SC service id)
    pub id: String,
    /// Display name
    pub name: String,
    /// Connection or interface type string
    pub kind: String,
    /// Whether the definition is enabled in the platform configuration
    pub enabled: bool,
}

/// Identifies one link between an item and an active instance.
///
/// Status events carry the id of the link whose subscription produced
/// them; events for a link that no longer exists are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) u64);

/// Everything the reconciler task consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The platform's complete current set of active instances
    ActiveSetChanged(Vec<String>),
    /// A subscribed instance reported a new status
    StatusChanged {
        instance: String,
        link: LinkId,
        state: State,
    },
    /// Connection definitions were added or removed
    InventoryChanged,
    /// User asked to start or stop a connection
    Request { id: String, connect: bool },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Sending half handed to a per-instance subscription
#[derive(Debug, Clone)]
pub struct StatusSink {
    events: EventSender,
    instance: String,
    link: LinkId,
}

impl StatusSink {
    pub(crate) fn new(events: EventSender, instance: String, link: LinkId) -> Self {
        Self { events, instance, link }
    }

    /// Instance this sink reports for
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Forward a mapped status. Returns false once the consumer is gone.
    pub fn send(&self, state: State) -> bool {
        self.events
            .send(Event::StatusChanged {
                instance: self.instance.clone(),
                link: self.link,
                state,
            })
            .is_ok()
    }
}

/// A live notification subscription, cancelled when dropped
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Run `watcher` as a task owned by the returned subscription
    pub fn spawn<F>(watcher: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(watcher).abort_handle();
        Self::from_fn(move || handle.abort())
    }

    /// Subscription that runs `cancel` when dropped
    pub fn from_fn<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription with nothing to cancel
    pub fn inert() -> Self {
        Self { cancel: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Connection management capability of one platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VpnBackend: Send + Sync {
    /// State given to items right after discovery, before any instance is seen
    fn initial_state(&self) -> State;

    /// Whether an inventory entry is a VPN connection this backend manages
    fn is_eligible(&self, definition: &ConnectionDefinition) -> bool;

    /// Full connection inventory. Unreadable entries are skipped.
    async fn enumerate(&self) -> VpnResult<Vec<ConnectionDefinition>>;

    /// Current set of active instances
    async fn active_instances(&self) -> VpnResult<Vec<String>>;

    /// Id of the connection definition an instance belongs to
    async fn instance_owner(&self, instance: &str) -> VpnResult<String>;

    /// Current status of an instance, mapped to [`State`]
    async fn instance_status(&self, instance: &str) -> VpnResult<State>;

    /// Ask the platform to start a connection
    async fn request_connect(&self, id: &str) -> VpnResult<()>;

    /// Ask the platform to stop an active instance
    async fn request_disconnect(&self, instance: &str) -> VpnResult<()>;

    /// Send [`Event::ActiveSetChanged`] whenever the active set changes
    async fn watch_active_set(&self, events: EventSender) -> VpnResult<Subscription>;

    /// Send [`Event::InventoryChanged`] whenever definitions come or go
    async fn watch_inventory(&self, events: EventSender) -> VpnResult<Subscription>;

    /// Forward status changes of one instance into `sink`
    async fn watch_instance(&self, sink: StatusSink) -> VpnResult<Subscription>;
}
