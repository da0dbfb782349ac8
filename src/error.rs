//! Error types for vpnctl

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// D-Bus call or connection failed
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),
    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", .code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Platform service unreachable or unusable
    #[error("Service error: {0}")]
    ServiceError(String),
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Connect/disconnect request rejected by the platform
    #[error("Request for '{name}' failed: {reason}")]
    RequestFailed { name: String, reason: String },
}

pub type VpnResult<T> = Result<T, VpnError>;
