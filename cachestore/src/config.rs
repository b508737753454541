//! Configuration management for the cache store.
//!
//! Configuration is loaded from multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/cachestore/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `CACHESTORE_`)
//! 5. Command-line arguments
//!
//! Later sources override earlier ones.
//!
//! # Environment Variables
//!
//! Store credentials should be provided via environment variables:
//! - `CACHESTORE_STORE_USERNAME` - Redis ACL username
//! - `CACHESTORE_STORE_PASSWORD` - Redis password

use clap::Parser;
use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/cachestore/config.toml";

/// Command-line arguments parser.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Disable the store entirely; every operation becomes a no-op
    #[arg(long, env = "CACHESTORE_DISABLED")]
    pub disabled: bool,

    /// Store engine type ("redis" or "memory")
    #[arg(long, env = "CACHESTORE_ENGINE")]
    pub engine: Option<String>,

    /// Store host
    #[arg(long, env = "CACHESTORE_HOST")]
    pub host: Option<String>,

    /// Store port
    #[arg(long, env = "CACHESTORE_PORT")]
    pub port: Option<u16>,

    /// Logical database index
    #[arg(long, env = "CACHESTORE_DB")]
    pub db: Option<i64>,

    /// Prefix applied to every key
    #[arg(long, env = "CACHESTORE_KEY_PREFIX")]
    pub key_prefix: Option<String>,

    /// Store username
    #[arg(long)]
    pub username: Option<String>,

    /// Store password
    #[arg(long)]
    pub password: Option<String>,

    /// Admin command to run
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Admin commands understood by the `cachestore` binary.
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Probe the store for liveness
    Ping,
    /// List keys matching a glob pattern
    Keys {
        /// Glob pattern, e.g. `patient:*`
        pattern: String,
    },
    /// Delete every key matching a glob pattern
    Invalidate {
        /// Glob pattern, e.g. `report:*`
        pattern: String,
    },
}

/// Complete store configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    /// Store connection settings
    pub store: StoreConfig,
    /// TTL policy per data category
    #[serde(default)]
    pub ttl: TtlPolicy,
}

/// Connection settings for the key-value store.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// When false every cache operation is a no-op
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Engine type ("redis" or "memory")
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number
    #[serde(default = "default_port")]
    pub port: u16,
    /// Logical database index
    #[serde(default)]
    pub db: i64,
    /// Namespace prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Authentication credentials (not serialized)
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

/// Authentication credentials for the store.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    /// Username (Redis ACL), empty for password-only auth
    pub username: String,
    /// Password
    pub password: String,
}

fn default_enabled() -> bool {
    true
}

fn default_engine() -> String {
    "redis".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "registry:".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            engine: default_engine(),
            host: default_host(),
            port: default_port(),
            db: 0,
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            credentials: None,
        }
    }
}

impl StoreConfig {
    /// In-process store, used for tests and single-node deployments.
    pub fn memory() -> Self {
        Self {
            engine: "memory".to_string(),
            ..Self::default()
        }
    }

    /// Builds the `redis://` connection URL, including credentials when present.
    pub fn redis_url(&self) -> String {
        match &self.credentials {
            Some(creds) => format!(
                "redis://{}:{}@{}:{}/{}",
                creds.username, creds.password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Data categories with their own default cache lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataCategory {
    Default,
    Patient,
    Report,
    Analytics,
    Reference,
    Session,
}

/// Default TTLs, in whole seconds, per [`DataCategory`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    pub default: u64,
    pub patient: u64,
    pub report: u64,
    pub analytics: u64,
    pub reference: u64,
    pub session: u64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default: 600,
            patient: 300,
            report: 1800,
            analytics: 900,
            reference: 3600,
            session: 1800,
        }
    }
}

impl TtlPolicy {
    /// TTL in seconds for a category.
    pub fn ttl_for(&self, category: DataCategory) -> u64 {
        match category {
            DataCategory::Default => self.default,
            DataCategory::Patient => self.patient,
            DataCategory::Report => self.report,
            DataCategory::Analytics => self.analytics,
            DataCategory::Reference => self.reference,
            DataCategory::Session => self.session,
        }
    }
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = builder.add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        if let Ok(metadata) = std::fs::metadata(DEFAULT_CONFIG_PATH) {
            if metadata.is_file() {
                builder = builder.add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
            }
        }

        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CACHESTORE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if cli.disabled {
            builder = builder.set_override("store.enabled", false)?;
        }
        if let Some(ref engine) = cli.engine {
            builder = builder.set_override("store.engine", engine.as_str())?;
        }
        if let Some(ref host) = cli.host {
            builder = builder.set_override("store.host", host.as_str())?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("store.port", port)?;
        }
        if let Some(db) = cli.db {
            builder = builder.set_override("store.db", db)?;
        }
        if let Some(ref prefix) = cli.key_prefix {
            builder = builder.set_override("store.key_prefix", prefix.as_str())?;
        }

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.store.credentials = Self::load_credentials(cli);

        Ok(settings)
    }

    /// Load store credentials.
    /// Priority order (highest to lowest):
    /// 1. Environment variables
    /// 2. Command line arguments
    pub fn load_credentials(cli: &CliArgs) -> Option<Credentials> {
        if let Ok(password) = env::var("CACHESTORE_STORE_PASSWORD") {
            let username = env::var("CACHESTORE_STORE_USERNAME").unwrap_or_default();
            return Some(Credentials { username, password });
        }

        cli.password.as_ref().map(|password| Credentials {
            username: cli.username.clone().unwrap_or_default(),
            password: password.clone(),
        })
    }
}
