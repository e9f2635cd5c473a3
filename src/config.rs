use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};
use uuid::Uuid;

use crate::services::{access_token::DEFAULT_LINK_TTL_SECS, security::validator::DEFAULT_MAX_UPLOAD_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageDriver {
    Local,
    S3,
}

impl FromStr for StorageDriver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => bail!("unknown storage driver `{other}`, expected `local` or `s3`"),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_driver: StorageDriver,
    pub storage_dir: String,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub cluster_enabled: bool,
    pub redis_url: Option<String>,
    pub node_id: String,
    pub replication_factor: usize,
    /// `id@baseUrl` entries.
    pub peers: Vec<String>,
    pub health_interval_secs: u64,
    pub signing_secret: String,
    pub link_ttl_secs: u64,
    /// Prefix for signed links handed to clients.
    pub public_base_url: String,
    pub max_upload_bytes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Clustered file vault: uploads, versions and signed downloads")]
pub struct Args {
    /// Host to bind to (overrides FILE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides FILE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend (overrides FILE_VAULT_STORAGE_DRIVER)
    #[arg(long, value_enum)]
    pub storage_driver: Option<StorageDriver>,

    /// Directory for the local backend (overrides FILE_VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket for the s3 backend (overrides FILE_VAULT_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Enable clustering (overrides FILE_VAULT_CLUSTER_ENABLED)
    #[arg(long)]
    pub cluster: bool,

    /// This node's id (overrides FILE_VAULT_NODE_ID)
    #[arg(long)]
    pub node_id: Option<String>,

    /// Comma separated `id@url` peers (overrides FILE_VAULT_PEERS)
    #[arg(long)]
    pub peers: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values found through `lookup`, then defaults.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let env_port = parse_var(&var, "FILE_VAULT_PORT", 4000u16)?;
        let env_driver = parse_var(&var, "FILE_VAULT_STORAGE_DRIVER", StorageDriver::Local)?;
        let env_cluster = parse_var(&var, "FILE_VAULT_CLUSTER_ENABLED", false)?;

        let cfg = Self {
            host: args
                .host
                .or_else(|| var("FILE_VAULT_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            database_url: args
                .database_url
                .or_else(|| var("FILE_VAULT_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/file_vault.db".into()),
            storage_driver: args.storage_driver.unwrap_or(env_driver),
            storage_dir: args
                .storage_dir
                .or_else(|| var("FILE_VAULT_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/uploads".into()),
            s3_bucket: args.s3_bucket.or_else(|| var("FILE_VAULT_S3_BUCKET")),
            s3_region: var("FILE_VAULT_S3_REGION"),
            cluster_enabled: args.cluster || env_cluster,
            redis_url: var("FILE_VAULT_REDIS_URL"),
            node_id: args
                .node_id
                .or_else(|| var("FILE_VAULT_NODE_ID"))
                .unwrap_or_else(|| format!("node-{}", &Uuid::new_v4().simple().to_string()[..6])),
            replication_factor: parse_var(&var, "FILE_VAULT_REPLICATION_FACTOR", 2usize)?,
            peers: args
                .peers
                .or_else(|| var("FILE_VAULT_PEERS"))
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            health_interval_secs: parse_var(&var, "FILE_VAULT_HEALTH_INTERVAL_SECS", 10u64)?,
            signing_secret: var("FILE_VAULT_SIGNING_SECRET")
                .context("FILE_VAULT_SIGNING_SECRET must be set")?,
            link_ttl_secs: parse_var(&var, "FILE_VAULT_LINK_TTL_SECS", DEFAULT_LINK_TTL_SECS)?,
            public_base_url: var("FILE_VAULT_PUBLIC_URL")
                .unwrap_or_else(|| format!("http://localhost:{}", args.port.unwrap_or(env_port))),
            max_upload_bytes: parse_var(
                &var,
                "FILE_VAULT_MAX_UPLOAD_BYTES",
                DEFAULT_MAX_UPLOAD_BYTES,
            )?,
        };

        if cfg.storage_driver == StorageDriver::S3 && cfg.s3_bucket.is_none() {
            bail!("FILE_VAULT_S3_BUCKET is required when the storage driver is s3");
        }
        if cfg.cluster_enabled && cfg.redis_url.is_none() {
            bail!("FILE_VAULT_REDIS_URL is required when clustering is enabled");
        }
        if cfg.node_id.contains(':') {
            bail!("node id `{}` must not contain ':'", cfg.node_id);
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("parsing {name} value `{value}`: {e}")),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_with_only_secret() {
        let cfg =
            AppConfig::from_sources(Args::default(), env_of(&[("FILE_VAULT_SIGNING_SECRET", "s")]))
                .unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:4000");
        assert_eq!(cfg.storage_driver, StorageDriver::Local);
        assert_eq!(cfg.replication_factor, 2);
        assert_eq!(cfg.link_ttl_secs, 900);
        assert_eq!(cfg.max_upload_bytes, 100 * 1024 * 1024);
        assert!(!cfg.cluster_enabled);
        assert!(cfg.node_id.starts_with("node-"));
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn missing_secret_is_an_error() {
        assert!(AppConfig::from_sources(Args::default(), env_of(&[])).is_err());
    }

    #[test]
    fn args_override_environment() {
        let args = Args {
            port: Some(9000),
            node_id: Some("cli-node".into()),
            ..Args::default()
        };
        let cfg = AppConfig::from_sources(
            args,
            env_of(&[
                ("FILE_VAULT_SIGNING_SECRET", "s"),
                ("FILE_VAULT_PORT", "8000"),
                ("FILE_VAULT_NODE_ID", "env-node"),
                ("FILE_VAULT_PEERS", "b@http://b:4000, ,c@http://c:4000"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.node_id, "cli-node");
        assert_eq!(cfg.peers, ["b@http://b:4000", "c@http://c:4000"]);
    }

    #[test]
    fn invalid_numbers_are_reported() {
        let err = AppConfig::from_sources(
            Args::default(),
            env_of(&[("FILE_VAULT_SIGNING_SECRET", "s"), ("FILE_VAULT_PORT", "http")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("FILE_VAULT_PORT"));
    }

    #[test]
    fn driver_and_cluster_requirements() {
        let s3_without_bucket = AppConfig::from_sources(
            Args::default(),
            env_of(&[
                ("FILE_VAULT_SIGNING_SECRET", "s"),
                ("FILE_VAULT_STORAGE_DRIVER", "S3"),
            ]),
        );
        assert!(s3_without_bucket.is_err());

        let cluster_without_redis = AppConfig::from_sources(
            Args::default(),
            env_of(&[
                ("FILE_VAULT_SIGNING_SECRET", "s"),
                ("FILE_VAULT_CLUSTER_ENABLED", "true"),
            ]),
        );
        assert!(cluster_without_redis.is_err());
    }
}
