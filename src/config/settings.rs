use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the WebSocket server, the relay queues, the device
/// session and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub relay: RelaySettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the server.
///
/// Defines the bind address, the connection limit and the optional
/// certificate/key pair. Both TLS paths must be set to serve `wss://`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The certificate/key pair, if both are configured.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}

/// Queue bounds for the relay.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RelaySettings {
    pub handoff_capacity: usize,
    pub client_queue_capacity: usize,
}

/// Retry and timeout settings for the device session, in milliseconds.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SessionSettings {
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub max_retry_count: u32,
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub relay: Option<PartialRelaySettings>,
    pub session: Option<PartialSessionSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRelaySettings {
    pub handoff_capacity: Option<usize>,
    pub client_queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSessionSettings {
    pub initial_retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub max_retry_count: Option<u32>,
    pub connection_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Settings {
    /// Fill every value missing from `partial` with the default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let relay = partial.relay.unwrap_or_default();
        let session = partial.session.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                max_connections: server
                    .max_connections
                    .unwrap_or(default.server.max_connections),
                tls_cert_path: server.tls_cert_path.filter(|p| !p.is_empty()),
                tls_key_path: server.tls_key_path.filter(|p| !p.is_empty()),
            },
            relay: RelaySettings {
                handoff_capacity: relay
                    .handoff_capacity
                    .unwrap_or(default.relay.handoff_capacity),
                client_queue_capacity: relay
                    .client_queue_capacity
                    .unwrap_or(default.relay.client_queue_capacity),
            },
            session: SessionSettings {
                initial_retry_delay_ms: session
                    .initial_retry_delay_ms
                    .unwrap_or(default.session.initial_retry_delay_ms),
                max_retry_delay_ms: session
                    .max_retry_delay_ms
                    .unwrap_or(default.session.max_retry_delay_ms),
                max_retry_count: session
                    .max_retry_count
                    .unwrap_or(default.session.max_retry_count),
                connection_timeout_ms: session
                    .connection_timeout_ms
                    .unwrap_or(default.session.connection_timeout_ms),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_connections: 1000,
                tls_cert_path: None,
                tls_key_path: None,
            },
            relay: RelaySettings {
                handoff_capacity: 1024,
                client_queue_capacity: 256,
            },
            session: SessionSettings {
                initial_retry_delay_ms: 1000,
                max_retry_delay_ms: 30_000,
                max_retry_count: 10,
                connection_timeout_ms: 15_000,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
