//! Cachestore admin binary.
//!
//! Connects to the configured store and runs one maintenance command.
//!
//! # Configuration
//!
//! Configuration can be provided through multiple sources, in order of precedence:
//!
//! 1. Command-line arguments (highest precedence)
//! 2. Environment variables (prefixed with `CACHESTORE_`)
//! 3. User-specified configuration file (via `--config`)
//! 4. System-wide configuration (`/etc/cachestore/config.toml`)
//! 5. Default configuration (embedded in binary)
//!
//! ## Command-line Options
//!
//! ```text
//! Usage: cachestore [OPTIONS] [COMMAND]
//!
//! Commands:
//!   ping        Probe the store for liveness
//!   keys        List keys matching a glob pattern
//!   invalidate  Delete every key matching a glob pattern
//!
//! Options:
//!   -c, --config <FILE>        Path to configuration file
//!       --disabled             Disable the store [env: CACHESTORE_DISABLED]
//!       --engine <ENGINE>      Store engine type [env: CACHESTORE_ENGINE]
//!       --host <HOST>          Store host [env: CACHESTORE_HOST]
//!       --port <PORT>          Store port [env: CACHESTORE_PORT]
//!       --db <DB>              Logical database index [env: CACHESTORE_DB]
//!       --key-prefix <PREFIX>  Prefix applied to every key [env: CACHESTORE_KEY_PREFIX]
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Check that Redis answers
//! cachestore ping
//!
//! # Drop all cached report pages
//! cachestore --host redis.internal invalidate 'report:*'
//! ```

use cachestore_core::client::CacheClient;
use cachestore_core::config::{CliArgs, Command, Settings};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli_args = CliArgs::parse();
    let settings = Settings::new(&cli_args)?;
    let client = CacheClient::connect(&settings.store).await;

    if !client.is_enabled() {
        tracing::warn!("store is disabled or unreachable; nothing to do");
        return Ok(());
    }

    match cli_args.command.unwrap_or(Command::Ping) {
        Command::Ping => {
            let healthy = client.health_check().await;
            println!("{}", if healthy { "PONG" } else { "store did not answer" });
            if !healthy {
                std::process::exit(1);
            }
        }
        Command::Keys { pattern } => {
            for key in client.keys_matching(&pattern).await {
                println!("{}", key);
            }
        }
        Command::Invalidate { pattern } => {
            let removed = client.delete_matching(&pattern).await;
            println!("removed {} keys matching '{}'", removed, pattern);
        }
    }

    Ok(())
}
