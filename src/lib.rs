//! vpnctl - VPN connection items for launcher hosts
//!
//! Exposes each configured VPN connection as an item with a live state,
//! state-dependent actions and change notifications. Platform backends:
//! - NetworkManager over the system D-Bus (Linux/BSD)
//! - SystemConfiguration through `scutil --nc` (macOS)
//!
//! Items follow the platform. Actions only ask the platform to start or
//! stop a connection; the resulting state changes arrive as notifications
//! and are applied by a single reconciler task.

pub mod error;
pub mod config;
pub mod state;
pub mod host;
pub mod item;
pub mod backend;
pub mod registry;
pub mod reconciler;
pub mod index;
pub mod plugin;

// Re-export commonly used types
pub use error::{VpnError, VpnResult};
pub use config::{NetworkManagerSettings, ScutilSettings, VpnConfig};
pub use state::State;
pub use host::{
    Action, HostHandles, IndexItem, IndexSink, ItemObserver, Notifier, SilentNotifier,
    Translator, Untranslated,
};
pub use item::VpnItem;
pub use backend::{ConnectionDefinition, Event, StatusSink, Subscription, VpnBackend};
pub use registry::Registry;
pub use plugin::VpnPlugin;

#[cfg(feature = "dbus-nm")]
pub use backend::networkmanager::NetworkManagerBackend;
pub use backend::scutil::ScutilBackend;
