//! Live set of VPN items

use crate::backend::{ConnectionDefinition, EventSender, VpnBackend};
use crate::error::VpnResult;
use crate::host::Translator;
use crate::item::VpnItem;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

#[derive(Default)]
struct Snapshot {
    items: Vec<Arc<VpnItem>>,
    by_id: HashMap<String, usize>,
}

impl Snapshot {
    fn new(items: Vec<Arc<VpnItem>>) -> Self {
        let by_id = items
            .iter()
            .enumerate()
            .map(|(index, item)| (item.id().to_string(), index))
            .collect();
        Self { items, by_id }
    }

    fn lookup(&self, id: &str) -> Option<&Arc<VpnItem>> {
        self.by_id.get(id).map(|&index| &self.items[index])
    }
}

/// Items keyed by connection id, iterated in inventory order.
///
/// Readers always see a complete snapshot; a rescan swaps the whole
/// snapshot in one step.
pub struct Registry {
    snapshot: RwLock<Arc<Snapshot>>,
    requests: EventSender,
    translator: Arc<dyn Translator>,
}

impl Registry {
    pub fn new(requests: EventSender, translator: Arc<dyn Translator>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            requests,
            translator,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All items in registry order
    pub fn items(&self) -> Vec<Arc<VpnItem>> {
        self.current().items.clone()
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<VpnItem>> {
        self.current().lookup(id).cloned()
    }

    /// Item whose name or id equals `key`
    pub fn find(&self, key: &str) -> Option<Arc<VpnItem>> {
        let snapshot = self.current();
        snapshot
            .lookup(key)
            .or_else(|| snapshot.items.iter().find(|item| item.text() == key))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.current().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the platform inventory and replace the registry contents.
    ///
    /// Items whose definition is still present are kept as they are, with
    /// their state and link. Items whose definition disappeared lose their
    /// link, which cancels its subscription.
    pub async fn rescan(&self, backend: &dyn VpnBackend) -> VpnResult<Vec<Arc<VpnItem>>> {
        let definitions = backend.enumerate().await?;
        let previous = self.current();

        let mut items: Vec<Arc<VpnItem>> = Vec::new();
        let mut seen = HashSet::new();
        for definition in definitions {
            if !Self::accepts(backend, &definition) {
                continue;
            }
            if !seen.insert(definition.id.clone()) {
                debug!("Skipping duplicate connection id {}", definition.id);
                continue;
            }

            let item = match previous.lookup(&definition.id) {
                Some(existing) if existing.text() == definition.name => existing.clone(),
                _ => Arc::new(VpnItem::new(
                    definition.id,
                    definition.name,
                    backend.initial_state(),
                    self.requests.clone(),
                    self.translator.clone(),
                )),
            };
            items.push(item);
        }

        let next = Arc::new(Snapshot::new(items));
        for old in &previous.items {
            let retained = next.lookup(old.id()).is_some_and(|item| Arc::ptr_eq(item, old));
            if !retained {
                debug!("Connection {} ({}) no longer tracked", old.text(), old.id());
                drop(old.take_link());
            }
        }

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        info!("Tracking {} VPN connection(s)", next.items.len());
        Ok(next.items.clone())
    }

    /// Drop every item's link, cancelling all instance subscriptions
    pub(crate) fn unlink_all(&self) {
        for item in self.current().items.iter() {
            drop(item.take_link());
        }
    }

    fn accepts(backend: &dyn VpnBackend, definition: &ConnectionDefinition) -> bool {
        if !definition.enabled {
            debug!("Skipping disabled connection {} ({})", definition.name, definition.id);
            return false;
        }
        if !backend.is_eligible(definition) {
            debug!("Skipping connection type {} ({})", definition.kind, definition.id);
            return false;
        }
        true
    }
}
