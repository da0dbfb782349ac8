//! SystemConfiguration backend (macOS)
//!
//! Drives the network-connection API through `scutil --nc`. SC has no
//! separate active-connection objects, so every eligible service is its own
//! instance and the instance id is the service id.
//!
//! A single poller task runs `scutil --nc list` and publishes the service
//! table through a watch channel. The active-set, inventory and
//! per-instance watchers all derive their events from that table.

use super::{ConnectionDefinition, Event, EventSender, StatusSink, Subscription, VpnBackend};
use crate::config::ScutilSettings;
use crate::error::{VpnError, VpnResult};
use crate::state::State;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Map an `SCNetworkConnectionStatus` word as printed by scutil
pub fn map_status_word(word: &str) -> State {
    match word.trim() {
        "Invalid" => State::Invalid,
        "Disconnected" => State::Disconnected,
        "Connecting" => State::Connecting,
        "Connected" => State::Connected,
        "Disconnecting" => State::Disconnecting,
        _ => State::Invalid,
    }
}

/// One row of `scutil --nc list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: String,
    pub name: String,
    pub interface_type: String,
    pub enabled: bool,
    pub state: State,
}

impl ServiceEntry {
    fn definition(&self) -> ConnectionDefinition {
        ConnectionDefinition {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.interface_type.clone(),
            enabled: self.enabled,
        }
    }
}

/// Parse the output of `scutil --nc list`.
///
/// Rows look like
/// `* (Connected)  <service id> PPP --> L2TP  "Name"  [PPP/L2TP]`;
/// the leading `*` marks enabled services. Lines that do not match are
/// skipped.
pub fn parse_list(output: &str) -> Vec<ServiceEntry> {
    output.lines().filter_map(parse_list_line).collect()
}

fn parse_list_line(line: &str) -> Option<ServiceEntry> {
    let enabled = line.starts_with('*');
    let rest = line.trim_start_matches('*').trim_start();

    let (status, rest) = rest.strip_prefix('(')?.split_once(')')?;
    let (id, rest) = rest.trim_start().split_once(char::is_whitespace)?;

    let name_start = rest.find('"')?;
    let name_end = rest.rfind('"')?;
    if name_end <= name_start {
        return None;
    }
    let name = &rest[name_start + 1..name_end];

    let tag = rest[name_end + 1..]
        .trim()
        .strip_prefix('[')?
        .strip_suffix(']')?;
    let interface_type = tag.split(['/', ':']).next().unwrap_or(tag).trim();

    if id.is_empty() || interface_type.is_empty() {
        return None;
    }

    Some(ServiceEntry {
        id: id.to_string(),
        name: name.to_string(),
        interface_type: interface_type.to_string(),
        enabled,
        state: map_status_word(status),
    })
}

/// Runs `scutil --nc` subcommands
#[derive(Debug, Clone)]
struct Scutil {
    binary: String,
}

impl Scutil {
    async fn run(&self, args: &[&str]) -> VpnResult<String> {
        let output = Command::new(&self.binary)
            .arg("--nc")
            .args(args)
            .output()
            .await
            .map_err(|e| VpnError::ServiceError(format!("Failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Err(VpnError::CommandFailed {
                cmd: format!("{} --nc {}", self.binary, args.join(" ")),
                code: output.status.code(),
                stderr: if stderr.is_empty() { stdout } else { stderr },
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn list(&self) -> VpnResult<Vec<ServiceEntry>> {
        Ok(parse_list(&self.run(&["list"]).await?))
    }

    /// Start or stop a service; scutil reports some failures on stdout
    /// with a zero exit status
    async fn control(&self, verb: &str, id: &str) -> VpnResult<()> {
        let reason = match self.run(&[verb, id]).await {
            Ok(output) if output.trim().is_empty() => return Ok(()),
            Ok(output) => output.trim().to_string(),
            Err(VpnError::CommandFailed { stderr, .. }) => stderr,
            Err(e) => e.to_string(),
        };
        Err(VpnError::RequestFailed {
            name: id.to_string(),
            reason,
        })
    }
}

type ServiceTable = Option<Vec<ServiceEntry>>;

pub struct ScutilBackend {
    scutil: Scutil,
    interface_types: Vec<String>,
    poll_interval: Duration,
    services: watch::Sender<ServiceTable>,
    poller: Mutex<Option<Subscription>>,
}

impl ScutilBackend {
    /// Create the backend, checking that scutil can list services
    pub async fn connect(settings: &ScutilSettings) -> VpnResult<Self> {
        let backend = Self::new(settings);
        let services = backend.scutil.list().await.map_err(|e| {
            VpnError::ServiceError(format!("SystemConfiguration is not available: {}", e))
        })?;
        info!("Found {} network connection service(s)", services.len());
        Ok(backend)
    }

    pub fn new(settings: &ScutilSettings) -> Self {
        let (services, _) = watch::channel(None);
        Self {
            scutil: Scutil {
                binary: settings.binary.clone(),
            },
            interface_types: settings.interface_types.clone(),
            poll_interval: settings.poll_interval(),
            services,
            poller: Mutex::new(None),
        }
    }

    fn is_eligible_type(&self, interface_type: &str) -> bool {
        self.interface_types.iter().any(|t| t == interface_type)
    }

    fn active_ids(&self, entries: &[ServiceEntry]) -> Vec<String> {
        entries
            .iter()
            .filter(|e| e.enabled && self.is_eligible_type(&e.interface_type))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Start the shared poller unless it is already running
    fn ensure_poller(&self) -> watch::Receiver<ServiceTable> {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_none() {
            let scutil = self.scutil.clone();
            let services = self.services.clone();
            let period = self.poll_interval;
            debug!("Starting scutil poller every {:?}", period);
            *poller = Some(Subscription::spawn(poll_services(scutil, services, period)));
        }
        self.services.subscribe()
    }
}

async fn poll_services(scutil: Scutil, services: watch::Sender<ServiceTable>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match scutil.list().await {
            Ok(entries) => {
                services.send_if_modified(|current| {
                    if current.as_ref() == Some(&entries) {
                        return false;
                    }
                    *current = Some(entries);
                    true
                });
            }
            Err(e) => warn!("Failed to poll network connection services: {}", e),
        }
    }
}

fn service_state(table: &ServiceTable, id: &str) -> Option<State> {
    table
        .as_ref()
        .and_then(|entries| entries.iter().find(|e| e.id == id))
        .map(|e| e.state)
}

#[async_trait]
impl VpnBackend for ScutilBackend {
    fn initial_state(&self) -> State {
        State::Invalid
    }

    fn is_eligible(&self, definition: &ConnectionDefinition) -> bool {
        self.is_eligible_type(&definition.kind)
    }

    async fn enumerate(&self) -> VpnResult<Vec<ConnectionDefinition>> {
        let entries = self.scutil.list().await?;
        Ok(entries.iter().map(ServiceEntry::definition).collect())
    }

    async fn active_instances(&self) -> VpnResult<Vec<String>> {
        let entries = self.scutil.list().await?;
        Ok(self.active_ids(&entries))
    }

    async fn instance_owner(&self, instance: &str) -> VpnResult<String> {
        Ok(instance.to_string())
    }

    async fn instance_status(&self, instance: &str) -> VpnResult<State> {
        let output = self.scutil.run(&["status", instance]).await?;
        let word = output
            .lines()
            .next()
            .filter(|line| !line.trim().is_empty())
            .ok_or_else(|| VpnError::NotFound(instance.to_string()))?;
        Ok(map_status_word(word))
    }

    async fn request_connect(&self, id: &str) -> VpnResult<()> {
        self.scutil.control("start", id).await
    }

    async fn request_disconnect(&self, instance: &str) -> VpnResult<()> {
        self.scutil.control("stop", instance).await
    }

    async fn watch_active_set(&self, events: EventSender) -> VpnResult<Subscription> {
        let mut services = self.ensure_poller();
        let interface_types = self.interface_types.clone();

        Ok(Subscription::spawn(async move {
            let mut last: Option<Vec<String>> = None;
            while services.changed().await.is_ok() {
                let active: Vec<String> = match &*services.borrow_and_update() {
                    Some(entries) => entries
                        .iter()
                        .filter(|e| e.enabled && interface_types.contains(&e.interface_type))
                        .map(|e| e.id.clone())
                        .collect(),
                    None => continue,
                };
                if last.as_ref() == Some(&active) {
                    continue;
                }
                if events.send(Event::ActiveSetChanged(active.clone())).is_err() {
                    break;
                }
                last = Some(active);
            }
        }))
    }

    async fn watch_inventory(&self, events: EventSender) -> VpnResult<Subscription> {
        let mut services = self.ensure_poller();

        Ok(Subscription::spawn(async move {
            let mut last: Option<Vec<ConnectionDefinition>> = None;
            while services.changed().await.is_ok() {
                let definitions: Vec<ConnectionDefinition> = match &*services.borrow_and_update() {
                    Some(entries) => entries.iter().map(ServiceEntry::definition).collect(),
                    None => continue,
                };
                let changed = last.as_ref().is_some_and(|previous| *previous != definitions);
                last = Some(definitions);
                if changed {
                    debug!("Network connection services changed");
                    if events.send(Event::InventoryChanged).is_err() {
                        break;
                    }
                }
            }
        }))
    }

    async fn watch_instance(&self, sink: StatusSink) -> VpnResult<Subscription> {
        let mut services = self.ensure_poller();
        let mut last = service_state(&services.borrow(), sink.instance());

        Ok(Subscription::spawn(async move {
            while services.changed().await.is_ok() {
                let state = service_state(&services.borrow_and_update(), sink.instance());
                let Some(state) = state else { continue };
                if last == Some(state) {
                    continue;
                }
                last = Some(state);
                if !sink.send(state) {
                    break;
                }
            }
        }))
    }
}
