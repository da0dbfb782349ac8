//! NetworkManager backend
//!
//! Talks to NetworkManager on the system bus. Item ids are settings object
//! paths, instances are `Connection.Active` object paths.

use super::nm_proxy::{
    ActiveConnectionProxy, ConnectionSettings, NetworkManagerProxy, SettingsConnectionProxy,
    SettingsProxy, NM_SERVICE,
};
use super::{ConnectionDefinition, Event, EventSender, StatusSink, Subscription, VpnBackend};
use crate::config::NetworkManagerSettings;
use crate::error::{VpnError, VpnResult};
use crate::state::State;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zbus::proxy::CacheProperties;
use zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::Connection;

/// Map an `NMActiveConnectionState` value
pub fn map_active_state(raw: u32) -> State {
    match raw {
        1 => State::Connecting,
        2 => State::Connected,
        3 => State::Disconnecting,
        4 => State::Disconnected,
        _ => State::Invalid,
    }
}

pub struct NetworkManagerBackend {
    connection: Connection,
    connection_types: Vec<String>,
}

impl NetworkManagerBackend {
    /// Connect to the system bus and verify NetworkManager is running
    pub async fn connect(settings: &NetworkManagerSettings) -> VpnResult<Self> {
        let connection = Connection::system()
            .await
            .map_err(|e| VpnError::ServiceError(format!("Failed to connect to D-Bus: {}", e)))?;

        let dbus = zbus::fdo::DBusProxy::new(&connection)
            .await
            .map_err(|e| VpnError::ServiceError(format!("Failed to create D-Bus proxy: {}", e)))?;

        let service_name = NM_SERVICE.try_into().map_err(|_| {
            VpnError::ServiceError(format!("Invalid D-Bus service name: {}", NM_SERVICE))
        })?;
        match dbus.name_has_owner(service_name).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(VpnError::ServiceError(format!(
                    "Service {} is not available. Is NetworkManager running?",
                    NM_SERVICE
                )))
            }
            Err(e) => {
                return Err(VpnError::ServiceError(format!(
                    "Failed to check service availability: {}",
                    e
                )))
            }
        }

        info!("Connected to NetworkManager on the system bus");
        Ok(Self::with_connection(connection, settings))
    }

    /// Use an existing bus connection without checking the service
    pub fn with_connection(connection: Connection, settings: &NetworkManagerSettings) -> Self {
        Self {
            connection,
            connection_types: settings.connection_types.clone(),
        }
    }

    async fn manager(&self) -> VpnResult<NetworkManagerProxy<'static>> {
        Ok(NetworkManagerProxy::new(&self.connection).await?)
    }

    async fn active_connection(&self, instance: &str) -> VpnResult<ActiveConnectionProxy<'static>> {
        Ok(ActiveConnectionProxy::builder(&self.connection)
            .path(instance.to_string())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?)
    }

    async fn read_definition(&self, path: &OwnedObjectPath) -> VpnResult<ConnectionDefinition> {
        let proxy = SettingsConnectionProxy::builder(&self.connection)
            .path(path.as_str().to_string())?
            .build()
            .await?;
        let settings = proxy.get_settings().await?;
        definition_from_settings(path.as_str(), &settings)
            .ok_or_else(|| VpnError::ParseError("missing connection.id or connection.type".to_string()))
    }
}

/// Build a definition from `GetSettings` output
pub(crate) fn definition_from_settings(
    path: &str,
    settings: &ConnectionSettings,
) -> Option<ConnectionDefinition> {
    let connection = settings.get("connection")?;
    Some(ConnectionDefinition {
        id: path.to_string(),
        name: string_value(connection.get("id")?)?,
        kind: string_value(connection.get("type")?)?,
        enabled: true,
    })
}

fn string_value(value: &OwnedValue) -> Option<String> {
    match &**value {
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn object_path(path: &str) -> VpnResult<ObjectPath<'_>> {
    ObjectPath::try_from(path)
        .map_err(|_| VpnError::ParseError(format!("Invalid object path: {}", path)))
}

fn request_error(name: &str, error: zbus::Error) -> VpnError {
    let reason = match error {
        zbus::Error::MethodError(_, Some(detail), _) => detail,
        other => other.to_string(),
    };
    VpnError::RequestFailed {
        name: name.to_string(),
        reason,
    }
}

#[async_trait]
impl VpnBackend for NetworkManagerBackend {
    fn initial_state(&self) -> State {
        State::Disconnected
    }

    fn is_eligible(&self, definition: &ConnectionDefinition) -> bool {
        self.connection_types.iter().any(|t| *t == definition.kind)
    }

    async fn enumerate(&self) -> VpnResult<Vec<ConnectionDefinition>> {
        let settings = SettingsProxy::new(&self.connection).await?;
        let paths = settings.list_connections().await?;

        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            match self.read_definition(&path).await {
                Ok(definition) => definitions.push(definition),
                Err(e) => warn!("Skipping connection {}: {}", path.as_str(), e),
            }
        }
        Ok(definitions)
    }

    async fn active_instances(&self) -> VpnResult<Vec<String>> {
        let paths = self.manager().await?.active_connections().await?;
        Ok(paths.iter().map(|p| p.as_str().to_string()).collect())
    }

    async fn instance_owner(&self, instance: &str) -> VpnResult<String> {
        let owner = self.active_connection(instance).await?.connection().await?;
        Ok(owner.as_str().to_string())
    }

    async fn instance_status(&self, instance: &str) -> VpnResult<State> {
        let raw = self.active_connection(instance).await?.state().await?;
        Ok(map_active_state(raw))
    }

    async fn request_connect(&self, id: &str) -> VpnResult<()> {
        let root = object_path("/")?;
        self.manager()
            .await?
            .activate_connection(&object_path(id)?, &root, &root)
            .await
            .map_err(|e| request_error(id, e))?;
        Ok(())
    }

    async fn request_disconnect(&self, instance: &str) -> VpnResult<()> {
        self.manager()
            .await?
            .deactivate_connection(&object_path(instance)?)
            .await
            .map_err(|e| request_error(instance, e))
    }

    async fn watch_active_set(&self, events: EventSender) -> VpnResult<Subscription> {
        let manager = self.manager().await?;
        let mut changes = manager.receive_active_connections_changed().await;
        // A cached read waits until PropertiesChanged is matched, so reads
        // after this point cannot miss a change
        manager.active_connections().await?;

        Ok(Subscription::spawn(async move {
            while let Some(change) = changes.next().await {
                let paths = match change.get().await {
                    Ok(paths) => paths,
                    Err(e) => {
                        warn!("Failed to read ActiveConnections: {}", e);
                        continue;
                    }
                };
                let active = paths.iter().map(|p| p.as_str().to_string()).collect();
                if events.send(Event::ActiveSetChanged(active)).is_err() {
                    break;
                }
            }
            debug!("ActiveConnections watcher finished");
        }))
    }

    async fn watch_inventory(&self, events: EventSender) -> VpnResult<Subscription> {
        let settings = SettingsProxy::new(&self.connection).await?;
        let (ready, subscribed) = oneshot::channel();

        let subscription = Subscription::spawn(async move {
            let streams = async {
                let added = settings.receive_new_connection().await?;
                let removed = settings.receive_connection_removed().await?;
                Ok::<_, zbus::Error>((added, removed))
            };
            let (added, removed) = match streams.await {
                Ok(streams) => {
                    let _ = ready.send(Ok(()));
                    streams
                }
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };

            let mut changes = futures::stream::select(added.map(|_| ()), removed.map(|_| ()));
            while changes.next().await.is_some() {
                debug!("Connection definitions changed");
                if events.send(Event::InventoryChanged).is_err() {
                    break;
                }
            }
        });

        wait_subscribed(subscribed).await?;
        Ok(subscription)
    }

    async fn watch_instance(&self, sink: StatusSink) -> VpnResult<Subscription> {
        let active = self.active_connection(sink.instance()).await?;
        let (ready, subscribed) = oneshot::channel();

        let subscription = Subscription::spawn(async move {
            let mut transitions = match active.receive_state_transition().await {
                Ok(stream) => {
                    let _ = ready.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };

            while let Some(signal) = transitions.next().await {
                match signal.args() {
                    Ok(args) => {
                        if !sink.send(map_active_state(*args.state())) {
                            break;
                        }
                    }
                    Err(e) => debug!("Malformed StateChanged on {}: {}", sink.instance(), e),
                }
            }
        });

        // Status reads after this point cannot miss a transition
        wait_subscribed(subscribed).await?;
        Ok(subscription)
    }
}

async fn wait_subscribed(subscribed: oneshot::Receiver<zbus::Result<()>>) -> VpnResult<()> {
    subscribed
        .await
        .map_err(|_| VpnError::ServiceError("Signal watcher stopped before subscribing".to_string()))??;
    Ok(())
}
