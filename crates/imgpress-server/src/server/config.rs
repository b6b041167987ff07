use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::{num::NonZeroUsize, time::Duration};
use imgpress_core::{TargetFormat, TinifyConfig, client::DEFAULT_TIMEOUT};
use std::path::PathBuf;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Which ingress adapters the process runs.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// HTTP upload endpoints only.
    #[default]
    Online,
    /// HTTP endpoints plus the watch-folder adapter.
    Local,
}

/// Runtime configuration for the `imgpress-server` binary.
///
/// Every flag falls back to the environment variable of the same name, which
/// may in turn come from a `.env` file in the working directory.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "imgpress-server",
    version,
    about = "Compresses uploaded images through Tinify and streams batch results as ZIP archives"
)]
pub struct CliArgs {
    /// Run mode. `local` additionally watches `WATCH_DIR` for new images.
    ///
    /// Environment variable: `APP_MODE`
    #[arg(long, env = "APP_MODE", value_enum, default_value_t = Mode::Online)]
    pub mode: Mode,

    /// Interface to bind the HTTP listener to.
    ///
    /// Environment variable: `HOST`
    #[arg(long, env = "HOST", default_value_t = String::from("0.0.0.0"))]
    pub host: String,

    /// Port to bind the HTTP listener to.
    ///
    /// Environment variable: `PORT`
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Tinify API key. Without it the server still starts, but every
    /// compression fails with a configuration error.
    ///
    /// Environment variable: `TINIFY_KEY`
    #[arg(long, env = "TINIFY_KEY", hide_env_values = true)]
    pub tinify_key: Option<String>,

    /// Base URL of the Tinify API.
    ///
    /// Environment variable: `TINIFY_API_URL`
    #[arg(long, env = "TINIFY_API_URL", default_value_t = String::from("https://api.tinify.com"))]
    pub tinify_api_url: String,

    /// Target format used when a request (or the watcher) does not choose
    /// one: `original`, `png`, `jpeg`, `webp` or `avif`.
    ///
    /// Environment variable: `OUTPUT_FORMAT`
    #[arg(long, env = "OUTPUT_FORMAT", default_value_t = String::from("original"))]
    pub output_format: String,

    /// Number of compression workers shared by the whole process. This is the
    /// hard cap on concurrent calls to the compression service.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 8)]
    pub num_workers: usize,

    /// Compression calls one batch may have in flight at a time. `1`
    /// processes a batch sequentially.
    ///
    /// Environment variable: `BATCH_CONCURRENCY`
    #[arg(long, env = "BATCH_CONCURRENCY", default_value_t = 4)]
    pub batch_concurrency: usize,

    /// Deadline for a single compression call, in seconds.
    ///
    /// Environment variable: `ITEM_TIMEOUT_SECS`
    #[arg(long, env = "ITEM_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub item_timeout_secs: u64,

    /// Maximum number of files accepted by one batch request.
    ///
    /// Environment variable: `MAX_BATCH_ITEMS`
    #[arg(long, env = "MAX_BATCH_ITEMS", default_value_t = 20)]
    pub max_batch_items: usize,

    /// Maximum combined size of all files in one batch request, in bytes.
    ///
    /// Environment variable: `MAX_BATCH_BYTES`
    #[arg(long, env = "MAX_BATCH_BYTES", default_value_t = 200 * MIB)]
    pub max_batch_bytes: usize,

    /// Maximum size of a single uploaded file, in bytes.
    ///
    /// Environment variable: `MAX_UPLOAD_BYTES`
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 10 * MIB)]
    pub max_upload_bytes: usize,

    /// Capacity of the in-memory pipe between the archive writer and the HTTP
    /// response body. Once full, the writer waits for the client to read.
    ///
    /// Environment variable: `STREAM_BUFFER_BYTES`
    #[arg(long, env = "STREAM_BUFFER_BYTES", default_value_t = 64 * KIB)]
    pub stream_buffer_bytes: usize,

    /// Allowed CORS origin. Any origin is allowed when unset.
    ///
    /// Environment variable: `ALLOW_ORIGIN`
    #[arg(long, env = "ALLOW_ORIGIN")]
    pub allow_origin: Option<String>,

    /// Directory watched for new images in local mode.
    ///
    /// Environment variable: `WATCH_DIR`
    #[arg(long, env = "WATCH_DIR", default_value = "uploads")]
    pub watch_dir: PathBuf,

    /// Directory compressed files are written to in local mode.
    ///
    /// Environment variable: `OUTPUT_DIR`
    #[arg(long, env = "OUTPUT_DIR", default_value = "converted")]
    pub output_dir: PathBuf,

    /// How long a watched file must go without changes before it is picked
    /// up, in milliseconds.
    ///
    /// Environment variable: `WATCH_QUIET_MS`
    #[arg(long, env = "WATCH_QUIET_MS", default_value_t = 1000)]
    pub watch_quiet_ms: u64,

    /// Interval between stability checks of watched files, in milliseconds.
    ///
    /// Environment variable: `WATCH_POLL_MS`
    #[arg(long, env = "WATCH_POLL_MS", default_value_t = 100)]
    pub watch_poll_ms: u64,

    /// Seconds to wait for in-flight batches to drain on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

/// Limits applied while reading multipart uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_batch_items: usize,
    pub max_batch_bytes: usize,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub quiet_period: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: Mode,
    pub server_addr: String,
    pub tinify: TinifyConfig,
    pub default_format: TargetFormat,
    pub num_workers: usize,
    pub batch_concurrency: NonZeroUsize,
    pub item_timeout: Duration,
    pub limits: UploadLimits,
    pub stream_buffer_bytes: usize,
    pub allow_origin: Option<String>,
    pub watch: WatchConfig,
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn has_credential(&self) -> bool {
        self.tinify
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        let Some(batch_concurrency) = NonZeroUsize::new(args.batch_concurrency) else {
            bail!("BATCH_CONCURRENCY must be greater than 0");
        };

        if args.item_timeout_secs == 0 {
            bail!("ITEM_TIMEOUT_SECS must be greater than 0");
        }

        if args.max_batch_items == 0 {
            bail!("MAX_BATCH_ITEMS must be greater than 0");
        }

        if args.max_upload_bytes == 0 {
            bail!("MAX_UPLOAD_BYTES must be greater than 0");
        }

        if args.max_batch_bytes < args.max_upload_bytes {
            bail!(
                "MAX_BATCH_BYTES ({}) must be at least MAX_UPLOAD_BYTES ({})",
                args.max_batch_bytes,
                args.max_upload_bytes
            );
        }

        if args.stream_buffer_bytes == 0 {
            bail!("STREAM_BUFFER_BYTES must be greater than 0");
        }

        if args.watch_poll_ms == 0 {
            bail!("WATCH_POLL_MS must be greater than 0");
        }

        let default_format = TargetFormat::parse_optional(Some(&args.output_format))
            .with_context(|| format!("invalid OUTPUT_FORMAT {:?}", args.output_format))?
            .unwrap_or_default();

        if args.host.trim().is_empty() {
            bail!("HOST must not be empty");
        }
        let server_addr = format!("{}:{}", args.host.trim(), args.port);

        let api_url = args.tinify_api_url.trim_end_matches('/').to_string();
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            bail!("TINIFY_API_URL must be an http(s) URL, got {api_url:?}");
        }

        if args.watch_dir == args.output_dir {
            bail!("OUTPUT_DIR must differ from WATCH_DIR");
        }

        let allow_origin = args
            .allow_origin
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty());
        if let Some(origin) = allow_origin
            .as_deref()
            .filter(|origin| !origin.bytes().all(|b| b.is_ascii_graphic()))
        {
            bail!("ALLOW_ORIGIN must be a single origin, got {origin:?}");
        }

        let item_timeout = Duration::from_secs(args.item_timeout_secs);

        Ok(Self {
            mode: args.mode,
            server_addr,
            tinify: TinifyConfig {
                api_key: args.tinify_key,
                api_url,
                timeout: item_timeout,
            },
            default_format,
            num_workers: args.num_workers,
            batch_concurrency,
            item_timeout,
            limits: UploadLimits {
                max_batch_items: args.max_batch_items,
                max_batch_bytes: args.max_batch_bytes,
                max_upload_bytes: args.max_upload_bytes,
            },
            stream_buffer_bytes: args.stream_buffer_bytes,
            allow_origin,
            watch: WatchConfig {
                watch_dir: args.watch_dir,
                output_dir: args.output_dir,
                quiet_period: Duration::from_millis(args.watch_quiet_ms),
                poll_interval: Duration::from_millis(args.watch_poll_ms),
            },
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}
