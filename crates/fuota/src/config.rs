//! TOML configuration for the FUOTA server.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub postgresql: Postgresql,
    pub network_server: NetworkServer,
    pub fuota_server: FuotaServer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct General {
    /// Log level: trace, debug, info, warn or error.
    pub log_level: String,
    /// Kept for compatibility with the original configuration format;
    /// syslog output is not supported and falls back to stderr.
    pub log_to_syslog: bool,
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_syslog: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Postgresql {
    pub dsn: String,
    pub automigrate: bool,
    pub max_open_connections: u32,
    pub max_idle_connections: u32,
}

impl Default for Postgresql {
    fn default() -> Self {
        Self {
            dsn: "postgres://localhost/fuota?sslmode=disable".to_string(),
            automigrate: true,
            max_open_connections: 10,
            max_idle_connections: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NetworkServer {
    pub api: NetworkServerApi,
    pub event_handler: EventHandler,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkServerApi {
    /// host:port of the network-server gRPC API.
    pub server: String,
    /// API token, sent as bearer credentials.
    pub token: String,
    pub tls_enabled: bool,
}

impl Default for NetworkServerApi {
    fn default() -> Self {
        Self {
            server: "localhost:8080".to_string(),
            token: String::new(),
            tls_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventHandler {
    /// Payload encoding of posted events.
    pub marshaler: Marshaler,
    /// Bind address of the HTTP event endpoint.
    pub bind: String,
}

impl Default for EventHandler {
    fn default() -> Self {
        Self {
            marshaler: Marshaler::Protobuf,
            bind: "0.0.0.0:8091".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Marshaler {
    #[default]
    Protobuf,
    Json,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FuotaServer {
    pub api: FuotaServerApi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FuotaServerApi {
    /// Bind address of the deployment gRPC API.
    pub bind: String,
    /// Optional mutual-TLS triple; all three must be set to enable TLS.
    pub ca_cert: String,
    pub tls_cert: String,
    pub tls_key: String,
}

impl Default for FuotaServerApi {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8090".to_string(),
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&raw)?)
    }

    /// Renders a commented configuration template with the current values.
    pub fn template(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            r#"[general]
# Log level: trace, debug, info, warn or error.
log_level = "{log_level}"

# Log to syslog (not supported; kept for compatibility).
log_to_syslog = {log_to_syslog}

[postgresql]
# PostgreSQL DSN.
dsn = "{dsn}"

# Automatically apply database schema migrations on start.
automigrate = {automigrate}

# Connection-pool sizes.
max_open_connections = {max_open}
max_idle_connections = {max_idle}

[network_server.api]
# host:port of the network-server gRPC API.
server = "{ns_server}"

# API token, sent as bearer credentials.
token = "{ns_token}"

# Connect using TLS.
tls_enabled = {ns_tls}

[network_server.event_handler]
# Encoding of posted events: "protobuf" or "json".
marshaler = "{marshaler}"

# Bind address of the HTTP event endpoint.
bind = "{eh_bind}"

[fuota_server.api]
# Bind address of the deployment gRPC API.
bind = "{api_bind}"

# Optional TLS; all three paths must be set to enable it.
ca_cert = "{ca_cert}"
tls_cert = "{tls_cert}"
tls_key = "{tls_key}"
"#,
            log_level = self.general.log_level,
            log_to_syslog = self.general.log_to_syslog,
            dsn = self.postgresql.dsn,
            automigrate = self.postgresql.automigrate,
            max_open = self.postgresql.max_open_connections,
            max_idle = self.postgresql.max_idle_connections,
            ns_server = self.network_server.api.server,
            ns_token = self.network_server.api.token,
            ns_tls = self.network_server.api.tls_enabled,
            marshaler = match self.network_server.event_handler.marshaler {
                Marshaler::Protobuf => "protobuf",
                Marshaler::Json => "json",
            },
            eh_bind = self.network_server.event_handler.bind,
            api_bind = self.fuota_server.api.bind,
            ca_cert = self.fuota_server.api.ca_cert,
            tls_cert = self.fuota_server.api.tls_cert,
            tls_key = self.fuota_server.api.tls_key,
        );
        out
    }
}
