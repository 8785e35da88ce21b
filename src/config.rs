use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::{fmt, fs, path::Path, str::FromStr, time::Duration};

/// Centralized application configuration.
///
/// Layers, lowest precedence first: built-in defaults, the JSON config file,
/// environment variables, command-line flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub s3: S3Config,
    pub cache: CacheConfig,
    pub indexer: IndexerSettings,
    pub hub: HubSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "local" => Ok(Self::Local),
            other => bail!("unknown storage backend `{}` (expected s3 or local)", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory served as the bucket by the `local` backend.
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::S3,
            root: "./data/bucket".into(),
        }
    }
}

/// Connection settings for the watched bucket.
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Config {
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".into(),
            bucket: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            endpoint: String::new(),
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &str| if value.is_empty() { "" } else { "***" };
        f.debug_struct("S3Config")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &redact(&self.access_key_id))
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Sqlite,
    Memory,
    None,
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            "none" | "off" => Ok(Self::None),
            other => bail!(
                "unknown cache backend `{}` (expected sqlite, memory or none)",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub database_url: String,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Sqlite,
            database_url: "sqlite://./data/cache/snapshot_browser.db?mode=rwc".into(),
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerSettings {
    pub workers: usize,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self { workers: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubSettings {
    pub poll_interval_secs: u64,
    pub client_queue: usize,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            client_queue: 256,
            pong_wait_secs: 60,
            write_wait_secs: 10,
        }
    }
}

impl HubSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs.max(1))
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs.max(1))
    }

    /// Pings go out a little before the peer's read deadline would expire.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }
}

/// Command-line configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Browse ledger snapshots stored in an S3 bucket")]
pub struct Args {
    /// Path to the JSON config file
    #[arg(long, default_value = "config.json")]
    pub config: String,

    /// Host to bind to (overrides SERVER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SERVER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket to browse (overrides S3_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Serve a local directory instead of S3 (overrides STORAGE_ROOT)
    #[arg(long)]
    pub storage_root: Option<String>,

    /// SQLite cache URL (overrides CACHE_DATABASE_URL)
    #[arg(long)]
    pub cache_url: Option<String>,

    /// Run cache migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse the process environment + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let cfg = Self::load(&args, |name| std::env::var(name).ok())?;
        Ok((cfg, args.migrate))
    }

    /// Build the configuration from `args` and an environment lookup.
    pub fn load(args: &Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::from_file(Path::new(&args.config))?;
        cfg.apply_env(|name| env(name).filter(|value| !value.is_empty()))?;
        cfg.apply_args(args);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                "Config file {} not found, using environment variables and defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("decoding config file {}", path.display()))
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("S3_REGION") {
            self.s3.region = v;
        }
        if let Some(v) = env("S3_BUCKET") {
            self.s3.bucket = v;
        }
        if let Some(v) = env("S3_ACCESS_KEY_ID") {
            self.s3.access_key_id = v;
        }
        if let Some(v) = env("S3_SECRET_ACCESS_KEY") {
            self.s3.secret_access_key = v;
        }
        if let Some(v) = env("S3_ENDPOINT") {
            self.s3.endpoint = v;
        }
        if let Some(v) = env("STORAGE_BACKEND") {
            self.storage.backend = v.parse().context("parsing STORAGE_BACKEND")?;
        }
        if let Some(v) = env("STORAGE_ROOT") {
            self.storage.root = v;
        }
        if let Some(v) = env("CACHE_BACKEND") {
            self.cache.backend = v.parse().context("parsing CACHE_BACKEND")?;
        }
        if let Some(v) = env("CACHE_DATABASE_URL") {
            self.cache.database_url = v;
        }
        if let Some(v) = env("CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_env("CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = env("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env("SERVER_PORT") {
            self.server.port = parse_env("SERVER_PORT", &v)?;
        }
        if let Some(v) = env("INDEX_WORKERS") {
            self.indexer.workers = parse_env("INDEX_WORKERS", &v)?;
        }
        if let Some(v) = env("HUB_POLL_INTERVAL_SECS") {
            self.hub.poll_interval_secs = parse_env("HUB_POLL_INTERVAL_SECS", &v)?;
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(bucket) = &args.bucket {
            self.s3.bucket = bucket.clone();
        }
        if let Some(root) = &args.storage_root {
            self.storage.backend = StorageBackend::Local;
            self.storage.root = root.clone();
        }
        if let Some(url) = &args.cache_url {
            self.cache.backend = CacheBackend::Sqlite;
            self.cache.database_url = url.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::S3 && self.s3.bucket.is_empty() {
            bail!("S3 bucket name is required (set S3_BUCKET or --bucket)");
        }
        if self.storage.backend == StorageBackend::Local && self.storage.root.is_empty() {
            bail!("local storage needs a root directory");
        }
        if self.indexer.workers == 0 {
            bail!("indexer worker count must be at least 1");
        }
        if self.hub.client_queue == 0 {
            bail!("hub client queue must hold at least one message");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("parsing {} value `{}`", name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(extra: &[&str], config: &Path) -> Args {
        let mut argv = vec!["snapshot-browser", "--config", config.to_str().unwrap()];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let cfg = AppConfig::load(&args(&[], &missing), env_of(&[("S3_BUCKET", "snaps")])).unwrap();
        assert_eq!(cfg.s3.region, "us-east-1");
        assert_eq!(cfg.s3.bucket, "snaps");
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.indexer.workers, 10);
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.hub.ping_period(), Duration::from_secs(54));
    }

    #[test]
    fn layers_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "s3": {"region": "eu-west-1", "bucket": "from-file", "accessKeyId": "AK"},
                "server": {"port": 9000, "host": "127.0.0.1"},
                "cache": {"backend": "memory"}
            }"#,
        )
        .unwrap();

        let env = env_of(&[("S3_BUCKET", "from-env"), ("SERVER_PORT", "9100")]);
        let cfg = AppConfig::load(&args(&["--port", "9200"], &path), env).unwrap();
        assert_eq!(cfg.s3.region, "eu-west-1");
        assert_eq!(cfg.s3.access_key_id, "AK");
        assert_eq!(cfg.s3.bucket, "from-env");
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 9200);
        assert_eq!(cfg.cache.backend, CacheBackend::Memory);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let env = env_of(&[("S3_BUCKET", "snaps"), ("S3_REGION", "")]);
        let cfg = AppConfig::load(&args(&[], &missing), env).unwrap();
        assert_eq!(cfg.s3.region, "us-east-1");
    }

    #[test]
    fn s3_backend_requires_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let err = AppConfig::load(&args(&[], &missing), env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn storage_root_flag_switches_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let cfg =
            AppConfig::load(&args(&["--storage-root", "/srv/snaps"], &missing), env_of(&[])).unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Local);
        assert_eq!(cfg.storage.root, "/srv/snaps");
    }

    #[test]
    fn bad_numbers_and_workers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let env = env_of(&[("S3_BUCKET", "b"), ("SERVER_PORT", "http")]);
        let err = AppConfig::load(&args(&[], &missing), env).unwrap_err();
        assert!(format!("{:#}", err).contains("SERVER_PORT"));

        let env = env_of(&[("S3_BUCKET", "b"), ("INDEX_WORKERS", "0")]);
        assert!(AppConfig::load(&args(&[], &missing), env).is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let s3 = S3Config {
            secret_access_key: "hunter2".into(),
            ..S3Config::default()
        };
        let printed = format!("{:?}", s3);
        assert!(!printed.contains("hunter2"));
    }
}
