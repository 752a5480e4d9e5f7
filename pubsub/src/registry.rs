//! Named broker connections, opened lazily per role.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::{BrokerClient, ConnectOptions, Connector, MqttConnector};
use crate::config::Settings;
use crate::error::{Result, with_timeout};
use crate::types::Role;

type Slot = Arc<OnceCell<Arc<dyn BrokerClient>>>;

/// Holds one publish and one subscribe client per configured connection.
///
/// Clients are created on first use. Concurrent first callers wait for the
/// same handshake instead of opening duplicate connections; a failed
/// handshake is not cached and the next caller tries again.
pub struct ConnectionRegistry {
    settings: Settings,
    connector: Arc<dyn Connector>,
    clients: Mutex<HashMap<(String, Role), Slot>>,
}

impl ConnectionRegistry {
    /// Create a registry that connects with rumqttc.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_connector(settings, Arc::new(MqttConnector::new()))
    }

    /// Create a registry with a custom connector.
    ///
    /// Settings are validated here, before any connection is attempted.
    pub fn with_connector(settings: Settings, connector: Arc<dyn Connector>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            connector,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Name of the connection used when none is given.
    pub fn default_connection(&self) -> &str {
        self.settings.default_connection_name()
    }

    /// Client for publishing on `connection` (or the default connection).
    pub async fn publish_client(&self, connection: Option<&str>) -> Result<Arc<dyn BrokerClient>> {
        self.client(connection, Role::Publish).await
    }

    /// Client for subscribing on `connection` (or the default connection).
    pub async fn subscribe_client(&self, connection: Option<&str>) -> Result<Arc<dyn BrokerClient>> {
        self.client(connection, Role::Subscribe).await
    }

    /// Client of the given role, connecting on first use.
    pub async fn client(&self, connection: Option<&str>, role: Role) -> Result<Arc<dyn BrokerClient>> {
        let config = self.settings.connection(connection)?;
        let slot = self
            .clients
            .lock()
            .entry((config.name.clone(), role))
            .or_default()
            .clone();

        let client = slot
            .get_or_try_init(|| async {
                let options = ConnectOptions::from_config(config, role, &self.settings.project_id)?
                    .with_connect_timeout(self.settings.timeouts.connect());
                info!(
                    connection = %config.name,
                    role = %role,
                    client_id = %options.client_id,
                    "connecting"
                );
                self.connector.connect(options).await
            })
            .await?;
        Ok(client.clone())
    }

    /// Connections that currently have an open client.
    pub fn open_clients(&self) -> Vec<(String, Role)> {
        let mut open: Vec<(String, Role)> = self
            .clients
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.suffix().cmp(b.1.suffix())));
        open
    }

    /// Disconnect every open client of both roles.
    ///
    /// All clients are released even when some disconnects fail or run out
    /// of time; the first failure is returned.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        let slots: Vec<((String, Role), Slot)> = self.clients.lock().drain().collect();

        let mut first_err = None;
        for ((name, role), slot) in slots {
            let Some(client) = slot.get() else {
                continue;
            };
            let remaining = until.saturating_duration_since(Instant::now());
            if let Err(e) = with_timeout("disconnect", remaining, client.disconnect()).await {
                warn!(connection = %name, role = %role, error = %e, "disconnect failed");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.settings.connections.len())
            .field("open", &self.open_clients())
            .finish()
    }
}
