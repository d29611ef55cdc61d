use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// How log records are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` on a terminal, `simplified` otherwise.
    Auto,
    /// Multi-line output with colors.
    Pretty,
    /// One line per record, no colors.
    Simplified,
    /// One JSON object per record.
    Json,
}

/// The `logging` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The minimum level of emitted log records.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Rendering of the records.
    pub format: LogFormat,
    /// Exports `RUST_BACKTRACE=1` at startup.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// The `metrics` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server, defaults to `$STATSD_SERVER`.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// Tags appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "mediacache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the temporary files of cached media.
    ///
    /// Everything in here named `mc-*` is owned by the cache. Such files that are older than
    /// `stale_file_age` get swept on startup.
    pub work_dir: PathBuf,

    /// Minimum time since the last modification before a temporary file in the work directory
    /// counts as left behind.
    ///
    /// Registries of other processes may share the work directory, so this should exceed the
    /// longest expected download.
    #[serde(with = "humantime_serde")]
    pub stale_file_age: Duration,

    /// Target number of resident cache entries.
    ///
    /// This is a soft limit: when every resident entry is still referenced, new entries are
    /// admitted anyway and the cache shrinks back once references are released.
    pub capacity: usize,

    /// Upper bound in bytes for the combined size of fetched files.
    ///
    /// Checked whenever an entry is added, evicting like `capacity` does. Referenced entries
    /// are never evicted, so this is a soft limit as well.
    pub max_cache_size: Option<u64>,

    /// Directory that content locators such as `content://media/clip.mp4` resolve into.
    ///
    /// Without it, locators that are neither HTTP URLs nor file paths cannot be fetched.
    pub content_root: Option<PathBuf>,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// Sentry DSN receiving errors of the binary.
    pub sentry_dsn: Option<Dsn>,

    /// Upper bound for a single download, including the streamed body.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// Upper bound for connecting to a download server.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for receiving the response head of a download.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            work_dir: env::temp_dir().join("mediacache"),
            stale_file_age: Duration::from_secs(60 * 60),
            capacity: 10,
            max_cache_size: None,
            content_root: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            max_download_timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let file = fs::File::open(path)
                    .with_context(|| format!("failed to open config file {}", path.display()))?;
                Self::from_reader(file)
            }
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // serde_yaml would happily turn an empty document into the defaults
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::unknown_variant(&level, &["off", "error", "warn", "info", "debug", "trace"])
    })
}
