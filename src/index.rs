//! Searchable index entries for the host

use crate::host::{IndexItem, IndexSink};
use crate::registry::Registry;
use tracing::debug;

/// One entry per item, keyed by its name, in registry order
pub fn index_items(registry: &Registry) -> Vec<IndexItem> {
    registry
        .items()
        .into_iter()
        .map(|item| IndexItem {
            text: item.text().to_string(),
            item,
        })
        .collect()
}

/// Hand the current snapshot to the host's index
pub fn publish(registry: &Registry, sink: &dyn IndexSink) {
    let items = index_items(registry);
    debug!("Publishing {} index item(s)", items.len());
    sink.set_index_items(items);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::host::Untranslated;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl IndexSink for CollectingSink {
        fn set_index_items(&self, items: Vec<IndexItem>) {
            let batch = items
                .into_iter()
                .map(|entry| (entry.item.id().to_string(), entry.text))
                .collect();
            self.batches.lock().unwrap().push(batch);
        }
    }

    #[tokio::test]
    async fn test_publish_follows_registry_order() {
        let backend = ScriptedBackend::new();
        backend.define("vpn-z", "Zurich", "vpn");
        backend.define("vpn-a", "Amsterdam", "wireguard");
        backend.define("eth-0", "Wired", "802-3-ethernet");

        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Registry::new(tx, Arc::new(Untranslated));
        registry.rescan(&backend).await.unwrap();

        let sink = CollectingSink::default();
        publish(&registry, &sink);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                ("vpn-z".to_string(), "Zurich".to_string()),
                ("vpn-a".to_string(), "Amsterdam".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_registry_publishes_empty_batch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Registry::new(tx, Arc::new(Untranslated));
        let sink = CollectingSink::default();
        publish(&registry, &sink);
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
    }
}
