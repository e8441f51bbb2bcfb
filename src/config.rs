use crate::services::{
    queue_service::QueueConfig, storage_service::is_supported_region,
    thumbnail_service::OutputFormat,
};
use anyhow::{Result, anyhow, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt::Display, str::FromStr, time::Duration};

/// Which halves of the service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Role {
    /// HTTP API only (uploads, listing, dead letters).
    Api,
    /// Queue workers only.
    Worker,
    #[default]
    All,
}

impl Role {
    pub fn runs_api(self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Metadata table name.
    pub table_name: String,
    pub region: String,
    /// Bucket uploads land in and thumbnails are written to.
    pub bucket: String,
    /// Edge of the thumbnail bounding box, in pixels.
    pub thumbnail_size: u32,
    pub thumbnail_format: OutputFormat,
    pub thumbnail_prefix: String,
    pub processing_timeout: Duration,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub retry_delay: Duration,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub public_base_url: String,
    pub role: Role,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Thumbnail generation pipeline")]
pub struct Args {
    /// Host to bind to (overrides THUMBNAIL_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides THUMBNAIL_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides THUMBNAIL_SERVICE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides THUMBNAIL_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Metadata table name (overrides MY_TABLE)
    #[arg(long)]
    pub table: Option<String>,

    /// Region (overrides REGION_NAME)
    #[arg(long)]
    pub region: Option<String>,

    /// Upload bucket (overrides PHOTO_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Thumbnail edge size in pixels (overrides THUMBNAIL_SIZE)
    #[arg(long)]
    pub thumbnail_size: Option<u32>,

    /// Thumbnail encoding: png or jpeg (overrides THUMBNAIL_FORMAT)
    #[arg(long)]
    pub thumbnail_format: Option<String>,

    /// Processing budget per message, seconds (overrides PROCESSING_TIMEOUT_SECS)
    #[arg(long)]
    pub processing_timeout: Option<u64>,

    /// Number of queue workers (overrides WORKER_COUNT)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Which components to run
    #[arg(long, value_enum)]
    pub role: Option<Role>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over the variables visible through `lookup`, then
    /// validate the result.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, bool)> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let host = args
            .host
            .unwrap_or_else(|| var("THUMBNAIL_SERVICE_HOST", "0.0.0.0"));
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&lookup, "THUMBNAIL_SERVICE_PORT", 3000)?,
        };

        let thumbnail_format = match args.thumbnail_format {
            Some(raw) => raw.parse::<OutputFormat>().map_err(|e| anyhow!(e))?,
            None => parse_var(&lookup, "THUMBNAIL_FORMAT", OutputFormat::Png)?,
        };
        let thumbnail_format = match thumbnail_format {
            OutputFormat::Jpeg { .. } => OutputFormat::Jpeg {
                quality: parse_var(&lookup, "THUMBNAIL_QUALITY", 85)?,
            },
            png => png,
        };

        let processing_timeout = match args.processing_timeout {
            Some(secs) => secs,
            None => parse_var(&lookup, "PROCESSING_TIMEOUT_SECS", 20)?,
        };

        let public_base_url = lookup("PUBLIC_BASE_URL").unwrap_or_else(|| {
            let shown_host = if matches!(host.as_str(), "0.0.0.0" | "::") {
                "localhost"
            } else {
                host.as_str()
            };
            format!("http://{}:{}", shown_host, port)
        });

        let cfg = Self {
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| var("THUMBNAIL_SERVICE_STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                var(
                    "THUMBNAIL_SERVICE_DATABASE_URL",
                    "sqlite://./data/meta/thumbnail_service.db",
                )
            }),
            table_name: args.table.unwrap_or_else(|| var("MY_TABLE", "thumbnail_tbl")),
            region: args.region.unwrap_or_else(|| var("REGION_NAME", "us-west-2")),
            bucket: args.bucket.unwrap_or_else(|| var("PHOTO_BUCKET", "photo-bucket")),
            thumbnail_size: match args.thumbnail_size {
                Some(size) => size,
                None => parse_var(&lookup, "THUMBNAIL_SIZE", 128)?,
            },
            thumbnail_format,
            thumbnail_prefix: var("THUMBNAIL_PREFIX", "thumbnails")
                .trim_matches('/')
                .to_string(),
            processing_timeout: Duration::from_secs(processing_timeout),
            visibility_timeout: Duration::from_secs(parse_var(
                &lookup,
                "VISIBILITY_TIMEOUT_SECS",
                300,
            )?),
            max_receive_count: parse_var(&lookup, "MAX_RECEIVE_COUNT", 3)?,
            retry_delay: Duration::from_secs(parse_var(&lookup, "RETRY_DELAY_SECS", 5)?),
            worker_count: match args.workers {
                Some(n) => n,
                None => parse_var(&lookup, "WORKER_COUNT", 2)?,
            },
            poll_interval: Duration::from_millis(parse_var(&lookup, "POLL_INTERVAL_MS", 500)?),
            public_base_url,
            role: args.role.unwrap_or_default(),
            host,
            port,
        };

        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    fn validate(&self) -> Result<()> {
        if self.thumbnail_size == 0 {
            bail!("THUMBNAIL_SIZE must be greater than zero");
        }
        if !is_supported_region(&self.region) {
            bail!("region `{}` is not supported", self.region);
        }
        if self.thumbnail_prefix.is_empty() {
            bail!("THUMBNAIL_PREFIX must not be empty");
        }
        if self.max_receive_count == 0 {
            bail!("MAX_RECEIVE_COUNT must be at least 1");
        }
        if self.worker_count == 0 && self.role.runs_workers() {
            bail!("at least one worker is required for role {:?}", self.role);
        }
        if self.processing_timeout.is_zero() {
            bail!("PROCESSING_TIMEOUT_SECS must be greater than zero");
        }
        if self.processing_timeout >= self.visibility_timeout {
            bail!(
                "processing timeout ({:?}) must be shorter than the visibility timeout ({:?})",
                self.processing_timeout,
                self.visibility_timeout
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: self.visibility_timeout,
            max_receive_count: self.max_receive_count,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|e| anyhow!("parsing {} value `{}`: {}", name, value, e)),
        None => Ok(default),
    }
}
