//! Canonical VPN connection state

use crate::host::Translator;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state shared by every backend.
///
/// `Invalid` is the unknown/uninitialized sentinel. All other variants are a
/// phase reported by the platform. Backends translate their own status codes
/// into this enum; nothing infers a state on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum State {
    #[default]
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl State {
    /// Log string, not translated
    pub fn as_str(self) -> &'static str {
        match self {
            State::Invalid => "Invalid",
            State::Disconnected => "Disconnected",
            State::Connecting => "Connecting…",
            State::Connected => "Connected",
            State::Disconnecting => "Disconnecting…",
        }
    }

    /// User-facing string
    pub fn tr_str(self, tr: &dyn Translator) -> String {
        tr.tr(self.as_str())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
