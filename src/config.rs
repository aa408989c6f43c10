use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, fmt, str::FromStr, time::Duration};

/// Which metadata backend records are kept in.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataBackend {
    /// One JSON file per record under `metadata_dir`.
    Files,
    /// Process memory; records are lost on restart.
    Memory,
    /// A SQLite database at `database_url`.
    Sqlite,
    /// A Redis server at `redis_url`, with native key expiry.
    Redis,
}

impl FromStr for MetadataBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(s, true)
            .map_err(|_| anyhow::anyhow!("unknown metadata backend `{}`", s))
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
///
/// `Debug` redacts credentials embedded in the connection URLs.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub metadata_backend: MetadataBackend,
    pub metadata_dir: String,
    pub database_url: String,
    pub redis_url: String,
    pub redis_prefix: String,
    pub redis_pool_size: usize,
    pub sweep_interval: Duration,
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("metadata_backend", &self.metadata_backend)
            .field("metadata_dir", &self.metadata_dir)
            .field("database_url", &redact_url(&self.database_url))
            .field("redis_url", &redact_url(&self.redis_url))
            .field("redis_prefix", &self.redis_prefix)
            .field("redis_pool_size", &self.redis_pool_size)
            .field("sweep_interval", &self.sweep_interval)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Replace the `user:password@` part of a URL's authority with `***@`.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// What the process should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
    pub migrate: bool,
    pub sweep_only: bool,
    pub no_sweeper: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Temporary file sharing with expiring uploads")]
pub struct Args {
    /// Host to bind to (overrides TEMPSTASH_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TEMPSTASH_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded blobs are stored (overrides TEMPSTASH_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata backend (overrides TEMPSTASH_METADATA_BACKEND)
    #[arg(long, value_enum)]
    pub metadata_backend: Option<MetadataBackend>,

    /// Directory for the `files` metadata backend (overrides TEMPSTASH_METADATA_DIR)
    #[arg(long)]
    pub metadata_dir: Option<String>,

    /// Database URL for the `sqlite` backend (overrides TEMPSTASH_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Redis URL for the `redis` backend (overrides TEMPSTASH_REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Prefix for Redis keys (overrides TEMPSTASH_REDIS_PREFIX)
    #[arg(long)]
    pub redis_prefix: Option<String>,

    /// Redis connection pool size (overrides TEMPSTASH_REDIS_POOL_SIZE)
    #[arg(long)]
    pub redis_pool_size: Option<usize>,

    /// Seconds between sweep cycles (overrides TEMPSTASH_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Largest accepted upload in bytes (overrides TEMPSTASH_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Deadline in seconds for each storage call (overrides TEMPSTASH_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Apply the SQLite schema and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run only the reclamation sweeper, without serving HTTP
    #[arg(long, conflicts_with = "no_sweeper")]
    pub sweep_only: bool,

    /// Serve HTTP without the in-process sweeper
    #[arg(long)]
    pub no_sweeper: bool,
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::merge(Args::parse())
    }

    /// Merge parsed CLI args over the environment and defaults.
    pub fn merge(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env_or("TEMPSTASH_HOST", "0.0.0.0".to_string())?;
        let env_port = env_or("TEMPSTASH_PORT", 8080u16)?;
        let env_storage = env_or("TEMPSTASH_STORAGE_DIR", "./data/uploads".to_string())?;
        let env_backend = env_or("TEMPSTASH_METADATA_BACKEND", MetadataBackend::Files)?;
        let env_meta_dir = env_or("TEMPSTASH_METADATA_DIR", "./data/meta".to_string())?;
        let env_db = env_or(
            "TEMPSTASH_DATABASE_URL",
            "sqlite://./data/meta/tempstash.db".to_string(),
        )?;
        let env_redis = env_or("TEMPSTASH_REDIS_URL", "redis://127.0.0.1:6379".to_string())?;
        let env_redis_prefix = env_or("TEMPSTASH_REDIS_PREFIX", String::new())?;
        let env_redis_pool = env_or("TEMPSTASH_REDIS_POOL_SIZE", 10usize)?;
        let env_sweep = env_or("TEMPSTASH_SWEEP_INTERVAL_SECS", 600u64)?;
        let env_max_upload = env_or("TEMPSTASH_MAX_UPLOAD_BYTES", 10 * 1024 * 1024usize)?;
        let env_timeout = env_or("TEMPSTASH_REQUEST_TIMEOUT_SECS", 30u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            metadata_backend: args.metadata_backend.unwrap_or(env_backend),
            metadata_dir: args.metadata_dir.unwrap_or(env_meta_dir),
            database_url: args.database_url.unwrap_or(env_db),
            redis_url: args.redis_url.unwrap_or(env_redis),
            redis_prefix: args.redis_prefix.unwrap_or(env_redis_prefix),
            redis_pool_size: args.redis_pool_size.unwrap_or(env_redis_pool),
            sweep_interval: Duration::from_secs(
                args.sweep_interval_secs.unwrap_or(env_sweep).max(1),
            ),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            request_timeout: Duration::from_secs(
                args.request_timeout_secs.unwrap_or(env_timeout).max(1),
            ),
        };

        let mode = RunMode {
            migrate: args.migrate,
            sweep_only: args.sweep_only,
            no_sweeper: args.no_sweeper,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_parse_into_mode_and_overrides() {
        let args = Args::try_parse_from([
            "tempstash",
            "--port",
            "9000",
            "--metadata-backend",
            "redis",
            "--sweep-interval-secs",
            "5",
            "--sweep-only",
        ])
        .unwrap();

        let (cfg, mode) = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.metadata_backend, MetadataBackend::Redis);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert!(mode.sweep_only);
        assert!(!mode.migrate);
    }

    #[test]
    fn sweep_only_conflicts_with_no_sweeper() {
        assert!(Args::try_parse_from(["tempstash", "--sweep-only", "--no-sweeper"]).is_err());
    }

    #[test]
    fn backend_names_parse_case_insensitively() {
        assert_eq!("SQLite".parse::<MetadataBackend>().unwrap(), MetadataBackend::Sqlite);
        assert!("postgres".parse::<MetadataBackend>().is_err());
    }

    #[test]
    fn url_credentials_are_redacted() {
        assert_eq!(
            redact_url("redis://:s3cret@cache.internal:6379/0"),
            "redis://***@cache.internal:6379/0"
        );
        assert_eq!(
            redact_url("redis://user:p@ss@cache:6379"),
            "redis://***@cache:6379"
        );
        assert_eq!(
            redact_url("sqlite://./data/meta/tempstash.db"),
            "sqlite://./data/meta/tempstash.db"
        );
        assert_eq!(redact_url("not a url"), "not a url");
    }

    #[test]
    fn debug_output_hides_redis_password() {
        let args = Args {
            redis_url: Some("redis://:hunter2@cache:6379".into()),
            ..Args::default()
        };
        let (cfg, _) = AppConfig::merge(args).unwrap();

        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redis://***@cache:6379"));
    }

    #[test]
    fn addr_joins_host_and_port() {
        let args = Args {
            host: Some("127.0.0.1".into()),
            port: Some(1234),
            ..Args::default()
        };
        let (cfg, _) = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:1234");
    }
}
