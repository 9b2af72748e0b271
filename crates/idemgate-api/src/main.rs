//! `idemgate-api` binary entrypoint.
//!
//! Loads configuration from environment variables, applies command-line
//! overrides and starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use idemgate_api::config::Config;
use idemgate_api::server::Server;
use idemgate_core::observability::{LogFormat, init_logging};
use idemgate_core::store::{MemoryStore, SharedStore};

/// Idempotency gateway demo server.
#[derive(Debug, Parser)]
#[command(name = "idemgate-api", version, about)]
struct Args {
    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Policy file with defaults and per-route overrides.
    #[arg(long, value_name = "PATH")]
    policy_file: Option<PathBuf>,

    /// Redis connection URL.
    #[arg(long, value_name = "URL")]
    redis_url: Option<String>,

    /// Enable debug mode (pretty logs, in-memory store allowed).
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if let Some(path) = self.policy_file {
            config.policy_file = path;
        }
        if let Some(url) = self.redis_url {
            config.redis_url = Some(url);
        }
        if self.debug {
            config.debug = true;
        }
    }
}

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

async fn connect_store(config: &Config) -> Result<Arc<dyn SharedStore>> {
    if let Some(url) = config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        {
            let store = idemgate_core::redis_store::RedisStore::connect(url).await?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            anyhow::bail!("IDEMGATE_REDIS_URL is set but the `redis` feature is disabled");
        }
    }

    if !config.debug {
        anyhow::bail!("IDEMGATE_REDIS_URL is required when IDEMGATE_DEBUG=false");
    }
    tracing::warn!(
        "IDEMGATE_REDIS_URL not set; using in-memory store (debug only, single process)"
    );
    Ok(Arc::new(MemoryStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config);
    config.validate()?;

    init_logging(choose_log_format(&config));

    let store = connect_store(&config).await?;
    let policies = config.policy_resolver()?;

    let server = Server::new(config, store, policies);
    server.serve().await?;
    Ok(())
}
