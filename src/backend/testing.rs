//! In-memory backend driven by tests

use super::{ConnectionDefinition, Event, EventSender, StatusSink, Subscription, VpnBackend};
use crate::error::{VpnError, VpnResult};
use crate::state::State;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    definitions: Vec<ConnectionDefinition>,
    instances: HashMap<String, (String, State)>,
    active: Vec<String>,
    sinks: HashMap<String, Vec<StatusSink>>,
    subscriptions_opened: usize,
    active_set_watcher: Option<EventSender>,
    inventory_watcher: Option<EventSender>,
    fail_enumerate: bool,
    connect_error: Option<String>,
    disconnect_error: Option<String>,
    requests: Vec<(String, bool)>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedBackend {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn define(&self, id: &str, name: &str, kind: &str) {
        self.inner().definitions.push(ConnectionDefinition {
            id: id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            enabled: true,
        });
    }

    pub(crate) fn define_disabled(&self, id: &str, name: &str, kind: &str) {
        self.define(id, name, kind);
        if let Some(last) = self.inner().definitions.last_mut() {
            last.enabled = false;
        }
    }

    pub(crate) fn undefine(&self, id: &str) {
        self.inner().definitions.retain(|d| d.id != id);
    }

    pub(crate) fn fail_enumerate(&self, fail: bool) {
        self.inner().fail_enumerate = fail;
    }

    pub(crate) fn reject_connect(&self, reason: &str) {
        self.inner().connect_error = Some(reason.to_string());
    }

    pub(crate) fn reject_disconnect(&self, reason: &str) {
        self.inner().disconnect_error = Some(reason.to_string());
    }

    /// Register an instance without making it active
    pub(crate) fn instance(&self, instance: &str, owner: &str, state: State) {
        self.inner()
            .instances
            .insert(instance.to_string(), (owner.to_string(), state));
    }

    /// Replace the active set, notifying the watcher if any
    pub(crate) fn set_active(&self, instances: &[&str]) {
        let mut inner = self.inner();
        inner.active = instances.iter().map(|s| s.to_string()).collect();
        if let Some(watcher) = &inner.active_set_watcher {
            let _ = watcher.send(Event::ActiveSetChanged(inner.active.clone()));
        }
    }

    /// Change an instance status and forward it to live subscriptions
    pub(crate) fn emit_status(&self, instance: &str, state: State) {
        let mut inner = self.inner();
        if let Some(entry) = inner.instances.get_mut(instance) {
            entry.1 = state;
        }
        if let Some(sinks) = inner.sinks.get(instance) {
            for sink in sinks {
                sink.send(state);
            }
        }
    }

    pub(crate) fn notify_inventory_changed(&self) {
        if let Some(watcher) = &self.inner().inventory_watcher {
            let _ = watcher.send(Event::InventoryChanged);
        }
    }

    /// Live status subscriptions for an instance
    pub(crate) fn live_subscriptions(&self, instance: &str) -> usize {
        self.inner().sinks.get(instance).map_or(0, Vec::len)
    }

    pub(crate) fn total_live_subscriptions(&self) -> usize {
        self.inner().sinks.values().map(Vec::len).sum()
    }

    pub(crate) fn subscriptions_opened(&self) -> usize {
        self.inner().subscriptions_opened
    }

    /// A copy of the sink of a live subscription, usable after it is cancelled
    pub(crate) fn sink(&self, instance: &str) -> Option<StatusSink> {
        self.inner().sinks.get(instance).and_then(|s| s.first().cloned())
    }

    /// Live active-set and inventory watchers
    pub(crate) fn watcher_count(&self) -> usize {
        let inner = self.inner();
        usize::from(inner.active_set_watcher.is_some()) + usize::from(inner.inventory_watcher.is_some())
    }

    pub(crate) fn requests(&self) -> Vec<(String, bool)> {
        self.inner().requests.clone()
    }
}

#[async_trait]
impl VpnBackend for ScriptedBackend {
    fn initial_state(&self) -> State {
        State::Disconnected
    }

    fn is_eligible(&self, definition: &ConnectionDefinition) -> bool {
        definition.kind == "vpn" || definition.kind == "wireguard"
    }

    async fn enumerate(&self) -> VpnResult<Vec<ConnectionDefinition>> {
        let inner = self.inner();
        if inner.fail_enumerate {
            return Err(VpnError::ServiceError("inventory unavailable".to_string()));
        }
        Ok(inner.definitions.clone())
    }

    async fn active_instances(&self) -> VpnResult<Vec<String>> {
        Ok(self.inner().active.clone())
    }

    async fn instance_owner(&self, instance: &str) -> VpnResult<String> {
        self.inner()
            .instances
            .get(instance)
            .map(|(owner, _)| owner.clone())
            .ok_or_else(|| VpnError::NotFound(instance.to_string()))
    }

    async fn instance_status(&self, instance: &str) -> VpnResult<State> {
        self.inner()
            .instances
            .get(instance)
            .map(|(_, state)| *state)
            .ok_or_else(|| VpnError::NotFound(instance.to_string()))
    }

    async fn request_connect(&self, id: &str) -> VpnResult<()> {
        let mut inner = self.inner();
        inner.requests.push((id.to_string(), true));
        match &inner.connect_error {
            Some(reason) => Err(VpnError::RequestFailed {
                name: id.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn request_disconnect(&self, instance: &str) -> VpnResult<()> {
        let mut inner = self.inner();
        inner.requests.push((instance.to_string(), false));
        match &inner.disconnect_error {
            Some(reason) => Err(VpnError::RequestFailed {
                name: instance.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn watch_active_set(&self, events: EventSender) -> VpnResult<Subscription> {
        self.inner().active_set_watcher = Some(events);
        let inner = self.inner.clone();
        Ok(Subscription::from_fn(move || {
            inner.lock().unwrap().active_set_watcher = None;
        }))
    }

    async fn watch_inventory(&self, events: EventSender) -> VpnResult<Subscription> {
        self.inner().inventory_watcher = Some(events);
        let inner = self.inner.clone();
        Ok(Subscription::from_fn(move || {
            inner.lock().unwrap().inventory_watcher = None;
        }))
    }

    async fn watch_instance(&self, sink: StatusSink) -> VpnResult<Subscription> {
        let instance = sink.instance().to_string();
        let link = sink.link();
        {
            let mut inner = self.inner();
            inner.subscriptions_opened += 1;
            inner.sinks.entry(instance.clone()).or_default().push(sink);
        }
        let inner = self.inner.clone();
        Ok(Subscription::from_fn(move || {
            let mut inner = inner.lock().unwrap();
            if let Some(sinks) = inner.sinks.get_mut(&instance) {
                sinks.retain(|s| s.link() != link);
                if sinks.is_empty() {
                    inner.sinks.remove(&instance);
                }
            }
        }))
    }
}

mod tests {
    use super::*;
    use crate::backend::LinkId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_cancel_removes_own_sink() {
        let backend = ScriptedBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = backend
            .watch_instance(StatusSink::new(tx.clone(), "inst-1".to_string(), LinkId(1)))
            .await
            .unwrap();
        let second = backend
            .watch_instance(StatusSink::new(tx, "inst-1".to_string(), LinkId(2)))
            .await
            .unwrap();
        assert_eq!(backend.live_subscriptions("inst-1"), 2);

        drop(first);
        assert_eq!(backend.live_subscriptions("inst-1"), 1);
        assert_eq!(backend.sink("inst-1").unwrap().link(), LinkId(2));

        drop(second);
        assert_eq!(backend.live_subscriptions("inst-1"), 0);
    }
}
