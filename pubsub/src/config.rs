//! Connection settings.
//!
//! Settings are plain serde structs, usually loaded from YAML:
//!
//! ```yaml
//! project_id: toy-server
//! default_connection: local
//! connections:
//!   - name: local
//!     server: 127.0.0.1
//!     port: 1883
//!   - name: cloud
//!     server: mqtts://broker.example.com:8883
//!     username: device
//!     password: secret
//!     server_certificate_fingerprint: "AB:CD:..."
//! outbox:
//!   backend: redb
//!   path: /var/lib/toy/outbox.redb
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::StoreSettings;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_CONNECTION: &str = "default";

fn default_project_id() -> String {
    "giztoy".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    1024
}

/// TLS options of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub use_tls: bool,
    /// Accept any server certificate the verifier rejects.
    pub allow_untrusted_certificates: bool,
    /// Accept unknown issuers, expired or otherwise invalid chains.
    pub ignore_certificate_chain_errors: bool,
    /// Accept revoked certificates or unknown revocation status.
    pub ignore_certificate_revocation_errors: bool,
    /// Hex SHA-256 of the expected server certificate (DER).
    pub server_certificate_fingerprint: Option<String>,
    /// PEM bundle holding the client certificate chain and private key.
    pub client_certificate_path: Option<PathBuf>,
    pub client_certificate_password: Option<String>,
}

impl TlsSettings {
    /// Decoded fingerprint bytes, if configured.
    ///
    /// Accepts upper or lower case hex with optional `:` or space separators.
    pub fn fingerprint(&self) -> Result<Option<Vec<u8>>> {
        let Some(raw) = self.server_certificate_fingerprint.as_deref() else {
            return Ok(None);
        };
        let cleaned: String = raw
            .chars()
            .filter(|c| !matches!(c, ':' | ' ' | '-'))
            .collect();
        if cleaned.is_empty() {
            return Ok(None);
        }
        hex::decode(&cleaned)
            .map(Some)
            .map_err(|e| Error::Configuration(format!("invalid server certificate fingerprint: {e}")))
    }
}

/// Settings of one named broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    /// Host name, or an URL such as `mqtts://host:8883`.
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Keep-alive interval; 0 leaves the client default in place.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_period_seconds: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(flatten)]
    pub tls: TlsSettings,
}

/// Resolved network endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ConnectionConfig {
    /// Create a plain TCP connection config.
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            port,
            client_id: None,
            clean_session: true,
            keep_alive_period_seconds: default_keep_alive(),
            username: None,
            password: None,
            tls: TlsSettings::default(),
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set an explicit client id.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Set TLS options.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Resolve host, port and transport from `server` and `port`.
    ///
    /// An URL `server` decides TLS by scheme (`mqtts`, `ssl`, `tls`) and its
    /// port, when present, takes precedence.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(Error::Configuration(format!(
                "connection {:?}: server address is required",
                self.name
            )));
        }

        if !server.contains("://") {
            return Ok(Endpoint {
                host: server.to_string(),
                port: self.port,
                tls: self.tls.use_tls,
            });
        }

        let url = url::Url::parse(server).map_err(|e| {
            Error::Configuration(format!("connection {:?}: invalid server url: {e}", self.name))
        })?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => self.tls.use_tls,
            "mqtts" | "ssl" | "tls" => true,
            other => {
                return Err(Error::Configuration(format!(
                    "connection {:?}: unsupported scheme {other:?}",
                    self.name
                )));
            }
        };
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
            Error::Configuration(format!("connection {:?}: server url has no host", self.name))
        })?;
        let port = match url.port() {
            Some(port) => port,
            None if tls && self.port == DEFAULT_PORT => DEFAULT_TLS_PORT,
            None => self.port,
        };
        Ok(Endpoint {
            host: host.to_string(),
            port,
            tls,
        })
    }

    /// Keep-alive interval, if one should be set.
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_period_seconds > 0)
            .then(|| Duration::from_secs(self.keep_alive_period_seconds))
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("connection name is required".into()));
        }
        let endpoint = self.endpoint()?;
        if endpoint.port == 0 {
            return Err(Error::Configuration(format!(
                "connection {:?}: port must not be 0",
                self.name
            )));
        }
        self.tls.fingerprint()?;
        Ok(())
    }
}

/// Time limits for broker requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_secs: u64,
    pub operation_secs: u64,
    pub shutdown_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            operation_secs: 10,
            shutdown_secs: 5,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs.max(1))
    }

    pub fn operation(&self) -> Duration {
        Duration::from_secs(self.operation_secs.max(1))
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs.max(1))
    }
}

/// Top-level pubsub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Prefix of generated client ids.
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default)]
    pub default_connection: Option<String>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Bound of each consumer's inbound queue.
    #[serde(default = "default_queue_capacity")]
    pub consumer_queue_capacity: usize,
    #[serde(default)]
    pub outbox: Option<StoreSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            default_connection: None,
            connections: Vec::new(),
            timeouts: Timeouts::default(),
            consumer_queue_capacity: default_queue_capacity(),
            outbox: None,
        }
    }
}

impl Settings {
    /// Settings with a single connection.
    pub fn single(connection: ConnectionConfig) -> Self {
        Self::default().with_connection(connection)
    }

    /// Add a connection.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connections.push(connection);
        self
    }

    /// Parse settings from YAML (JSON is accepted too).
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load settings from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("read {}: {e}", path.display())))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("yaml")
            .to_lowercase();
        match ext.as_str() {
            "json" => serde_json::from_str(&content).map_err(|e| Error::Configuration(e.to_string())),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Check every connection before anything is dialed.
    pub fn validate(&self) -> Result<()> {
        if self.connections.is_empty() {
            return Err(Error::Configuration("no connections configured".into()));
        }
        let mut names = HashSet::new();
        for conn in &self.connections {
            conn.validate()?;
            if !names.insert(conn.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate connection name {:?}",
                    conn.name
                )));
            }
        }
        if let Some(name) = &self.default_connection {
            if !names.contains(name.as_str()) {
                return Err(Error::Configuration(format!(
                    "default connection {name:?} is not configured"
                )));
            }
        }
        if self.consumer_queue_capacity == 0 {
            return Err(Error::Configuration("consumer_queue_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Name used when a caller does not specify a connection.
    pub fn default_connection_name(&self) -> &str {
        if let Some(name) = &self.default_connection {
            return name;
        }
        match self.connections.as_slice() {
            [only] => &only.name,
            _ => DEFAULT_CONNECTION,
        }
    }

    /// Look up a connection, falling back to the default name.
    pub fn connection(&self, name: Option<&str>) -> Result<&ConnectionConfig> {
        let name = name.unwrap_or_else(|| self.default_connection_name());
        self.connections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::UnknownConnection(name.to_string()))
    }
}
