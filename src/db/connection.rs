use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::error::ConnectionError;

const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Identifies one database target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionProfile {
    /// Label for saved profiles
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Skip certificate verification in `Prefer`/`Require` modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional PEM bundle used instead of the system trust store.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

/// SSL/TLS connection modes, matching libpq's `sslmode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// The `sslmode` sent to tokio-postgres, which only knows disable, prefer
    /// and require. The verify modes negotiate as `require` and do their
    /// checking in the TLS connector.
    fn wire_mode(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => "require",
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(format!("unknown sslmode {:?}", other)),
        }
    }
}

impl ConnectionProfile {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.user),
            quote_conn_value(&self.password),
            self.ssl_mode.wire_mode()
        )
    }

    pub fn display_string(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }

    /// Every connection field except the password must be present.
    pub fn validate(&self) -> std::result::Result<(), ConnectionError> {
        if self.host.trim().is_empty() {
            return Err(ConnectionError::MissingField("host"));
        }
        if self.port == 0 {
            return Err(ConnectionError::MissingField("port"));
        }
        if self.user.trim().is_empty() {
            return Err(ConnectionError::MissingField("user"));
        }
        if self.database.trim().is_empty() {
            return Err(ConnectionError::MissingField("database"));
        }
        Ok(())
    }
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            name: String::from("Local PostgreSQL"),
            host: String::from("localhost"),
            port: 5432,
            user: String::from("postgres"),
            password: String::new(),
            database: String::from("postgres"),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedConnections {
    #[serde(default)]
    connections: Vec<ConnectionProfile>,
}

pub fn saved_connections_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pgchat")
        .join("connections.toml")
}

/// Saved profiles, without passwords.
pub fn load_saved_connections() -> Result<Vec<ConnectionProfile>> {
    let path = saved_connections_path();
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let saved: SavedConnections = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(saved.connections)
}

/// Insert or replace `profile` (by name) in the saved list.
pub fn save_connection(profile: &ConnectionProfile) -> Result<()> {
    let mut connections = load_saved_connections()?;
    match connections.iter_mut().find(|c| c.name == profile.name) {
        Some(existing) => *existing = profile.clone(),
        None => connections.push(profile.clone()),
    }

    let path = saved_connections_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(&SavedConnections { connections })?;
    std::fs::write(&path, content)?;
    Ok(())
}

/// Open a client, spawn its connection task and probe it with `select 1`.
pub async fn create_client(profile: &ConnectionProfile) -> std::result::Result<Client, ConnectionError> {
    profile.validate()?;
    let conn_string = profile.connection_string();
    let timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);

    let client = match profile.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| ConnectionError::Timeout(CONNECT_TIMEOUT_SECS))?
                    .map_err(|e| ConnectionError::Database(describe_pg_error(&e)))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("connection error: {}", e);
                }
            });
            client
        }
        mode => {
            let tls = build_tls_connector(profile, mode)?;
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| ConnectionError::Timeout(CONNECT_TIMEOUT_SECS))?
                    .map_err(|e| ConnectionError::Database(describe_pg_error(&e)))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!("connection error: {}", e);
                }
            });
            client
        }
    };

    client
        .simple_query("select 1")
        .await
        .map_err(|e| ConnectionError::Database(describe_pg_error(&e)))?;

    info!(target = %profile.display_string(), sslmode = profile.ssl_mode.as_str(), "connected");
    Ok(client)
}

fn describe_pg_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db_err) => db_err.message().to_string(),
        None => err.to_string(),
    }
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// verify-ca and verify-full always check the certificate chain and ignore
/// `accept_invalid_certs`; only verify-full also checks the hostname.
fn build_tls_connector(
    profile: &ConnectionProfile,
    mode: SslMode,
) -> std::result::Result<MakeTlsConnector, ConnectionError> {
    let strict_verify = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
    let mut builder = native_tls::TlsConnector::builder();

    if mode == SslMode::VerifyCa {
        builder.danger_accept_invalid_hostnames(true);
    }

    if profile.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &profile.ca_cert_path {
        let pem = std::fs::read(ca_path)
            .map_err(|e| ConnectionError::Tls(format!("{}: {}", ca_path, e)))?;
        for cert in split_pem_certificates(&pem)? {
            let cert = native_tls::Certificate::from_pem(cert.as_bytes())
                .map_err(|e| ConnectionError::Tls(e.to_string()))?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one string per certificate.
fn split_pem_certificates(pem_data: &[u8]) -> std::result::Result<Vec<String>, ConnectionError> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let pem_str = std::str::from_utf8(pem_data)
        .map_err(|_| ConnectionError::Tls("CA certificate file is not valid UTF-8".to_string()))?;

    let mut certs = Vec::new();
    let mut rest = pem_str;
    while let Some(start) = rest.find(BEGIN) {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        certs.push(rest[start..stop].to_string());
        rest = &rest[stop..];
    }

    if certs.is_empty() {
        return Err(ConnectionError::Tls(
            "no valid certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

/// Quote a value for use in a libpq key=value connection string.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
