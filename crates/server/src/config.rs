//! Relay server configuration

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::appender::{Appender, AppenderConfig};
use crate::error::ConfigError;
use crate::history::HistoryReader;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::store::ConversationStore;

/// Configuration for the relay server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket listener binds to
    pub bind_addr: SocketAddr,
    /// SQLite database URL for conversation history
    pub database_url: String,
    /// Persistence workers
    pub appender_workers: usize,
    /// Queued appends per worker before new ones are dropped
    pub appender_queue: usize,
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines
    pub log_json: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5003)),
            database_url: "sqlite://relay.sqlite".to_string(),
            appender_workers: 4,
            appender_queue: 1024,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("RELAY_BIND_ADDR") {
            config.bind_addr = parse("RELAY_BIND_ADDR", addr)?;
        }
        if let Some(url) = lookup("RELAY_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(workers) = lookup("RELAY_APPENDER_WORKERS") {
            config.appender_workers = parse_positive("RELAY_APPENDER_WORKERS", workers)?;
        }
        if let Some(queue) = lookup("RELAY_APPENDER_QUEUE") {
            config.appender_queue = parse_positive("RELAY_APPENDER_QUEUE", queue)?;
        }
        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(json) = lookup("RELAY_LOG_JSON") {
            config.log_json = parse("RELAY_LOG_JSON", json)?;
        }

        Ok(config)
    }

    pub fn appender_config(&self) -> AppenderConfig {
        AppenderConfig {
            workers: self.appender_workers,
            queue_capacity: self.appender_queue,
        }
    }
}

fn parse<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
        value,
    })
}

fn parse_positive(name: &'static str, value: String) -> Result<usize, ConfigError> {
    let parsed: usize = parse(name, value.clone())?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            name,
            value,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub router: Arc<MessageRouter>,
    pub appender: Arc<Appender>,
    pub history: HistoryReader,
    pub store: Arc<dyn ConversationStore>,
}

impl AppState {
    /// Wire the relay pipeline around `store`. Spawns the appender workers,
    /// so this must run inside a Tokio runtime.
    pub fn new(store: Arc<dyn ConversationStore>, appender: AppenderConfig) -> Self {
        let registry = ConnectionRegistry::new();
        let appender = Arc::new(Appender::start(store.clone(), appender));
        let router = Arc::new(MessageRouter::new(registry.clone(), appender.clone()));
        Self {
            registry,
            router,
            appender,
            history: HistoryReader::new(store.clone()),
            store,
        }
    }
}
