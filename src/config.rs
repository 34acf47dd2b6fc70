use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

use crate::services::local_store::DEFAULT_MAX_COMPOSE_SOURCES;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Bucket every request is served from.
    pub bucket: String,
    /// Request body limit for uploads.
    pub max_upload_bytes: usize,
    /// Largest archive member that will be buffered and stored.
    pub max_entry_bytes: u64,
    pub max_compose_sources: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Hierarchical file gateway over a flat object store")]
pub struct Args {
    /// Host to bind to (overrides FILE_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads are stored (overrides FILE_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides FILE_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket name (overrides FILE_GATEWAY_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Maximum request body size in bytes (overrides FILE_GATEWAY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Maximum size of one archive entry (overrides FILE_GATEWAY_MAX_ENTRY_BYTES)
    #[arg(long)]
    pub max_entry_bytes: Option<u64>,

    /// Maximum number of parts in one compose (overrides FILE_GATEWAY_MAX_COMPOSE_SOURCES)
    #[arg(long)]
    pub max_compose_sources: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::resolve(args)?, migrate))
    }

    /// Merge parsed CLI arguments over environment variables over defaults.
    pub fn resolve(args: Args) -> Result<Self> {
        let env_host = env::var("FILE_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_storage =
            env::var("FILE_GATEWAY_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("FILE_GATEWAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/file_gateway.db".into());
        let env_bucket = env::var("FILE_GATEWAY_BUCKET").unwrap_or_else(|_| "datasets".into());

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: or_env(args.port, "FILE_GATEWAY_PORT", 8080)?,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            bucket: args.bucket.unwrap_or(env_bucket),
            max_upload_bytes: or_env(
                args.max_upload_bytes,
                "FILE_GATEWAY_MAX_UPLOAD_BYTES",
                1024 * 1024 * 1024,
            )?,
            max_entry_bytes: or_env(
                args.max_entry_bytes,
                "FILE_GATEWAY_MAX_ENTRY_BYTES",
                256 * 1024 * 1024,
            )?,
            max_compose_sources: or_env(
                args.max_compose_sources,
                "FILE_GATEWAY_MAX_COMPOSE_SOURCES",
                DEFAULT_MAX_COMPOSE_SOURCES,
            )?,
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CLI value if given, else the parsed environment variable, else `default`.
fn or_env<T>(cli: Option<T>, var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_win_over_defaults() {
        let cfg = AppConfig::resolve(Args {
            port: Some(9001),
            bucket: Some("media".into()),
            max_entry_bytes: Some(10),
            ..Args::default()
        })
        .unwrap();
        assert_eq!(cfg.port, 9001);
        assert_eq!(cfg.bucket, "media");
        assert_eq!(cfg.max_entry_bytes, 10);
    }

    #[test]
    fn addr_joins_host_and_port() {
        let cfg = AppConfig::resolve(Args {
            host: Some("127.0.0.1".into()),
            port: Some(8080),
            ..Args::default()
        })
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
    }
}
