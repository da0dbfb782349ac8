//! Interfaces to the launcher host
//!
//! The host owns search indexing, rendering, localization and message
//! boxes. This module is the narrow surface vpnctl uses to talk to it.

use crate::item::VpnItem;
use std::fmt;
use std::sync::Arc;

/// Receives state change notifications from items the host displays
pub trait ItemObserver: Send + Sync {
    fn notify(&self, item: &VpnItem);
}

/// Translates user-facing strings
pub trait Translator: Send + Sync {
    fn tr(&self, source: &str) -> String;
}

/// Identity translation
#[derive(Debug, Clone, Copy, Default)]
pub struct Untranslated;

impl Translator for Untranslated {
    fn tr(&self, source: &str) -> String {
        source.to_string()
    }
}

/// Shows non-fatal messages to the user
pub trait Notifier: Send + Sync {
    fn warning(&self, message: &str);
}

/// Notifier for hosts without a message surface.
///
/// Failed requests are logged where they fail, so there is nothing left to show.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn warning(&self, _message: &str) {}
}

/// Receives the searchable item snapshot
pub trait IndexSink {
    fn set_index_items(&self, items: Vec<IndexItem>);
}

/// An item paired with the text the host indexes it under
#[derive(Clone)]
pub struct IndexItem {
    pub item: Arc<VpnItem>,
    pub text: String,
}

impl fmt::Debug for IndexItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexItem")
            .field("id", &self.item.id())
            .field("text", &self.text)
            .finish()
    }
}

/// A user-triggerable action offered by an item
#[derive(Clone)]
pub struct Action {
    pub id: String,
    pub label: String,
    handler: Arc<dyn Fn() + Send + Sync>,
}

impl Action {
    pub fn new<F>(id: impl Into<String>, label: impl Into<String>, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            label: label.into(),
            handler: Arc::new(handler),
        }
    }

    /// Run the action
    pub fn activate(&self) {
        (self.handler)()
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

/// Host services handed to the plugin at construction
#[derive(Clone)]
pub struct HostHandles {
    pub translator: Arc<dyn Translator>,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for HostHandles {
    fn default() -> Self {
        Self {
            translator: Arc::new(Untranslated),
            notifier: Arc::new(SilentNotifier),
        }
    }
}
