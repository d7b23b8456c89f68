use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the launcher.
    #[serde(
        deserialize_with = "deserialize_level_filter",
        serialize_with = "serialize_level_filter"
    )]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
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

/// Control the metrics.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "aki_launcher".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the cache providers.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live of entries added without an explicit expiry.
    #[serde(with = "humantime_serde")]
    pub default_expiry: Duration,

    /// Delay between provider construction and the first eviction sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_delay: Duration,

    /// Interval between two eviction sweeps.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_expiry: Duration::from_secs(15 * 60),
            sweep_delay: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Location of the game client installation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory containing `EscapeFromTarkov.exe`.
    pub install_path: Option<PathBuf>,
}

/// Location and behaviour of the local game server.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory containing `Aki.Server.exe`.
    pub install_path: Option<PathBuf>,

    /// How long the ping collaborator keeps retrying refused connections while a freshly
    /// spawned server is still binding its socket.
    #[serde(with = "humantime_serde")]
    pub connect_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            install_path: None,
            connect_window: Duration::from_secs(60),
        }
    }
}

/// Compatibility-layer shim used to run the Windows binaries on other hosts.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct CompatConfig {
    /// The runner executable (e.g. `wine`) that wraps the game binaries.
    ///
    /// Leaving this unset runs the binaries directly.
    pub runner: Option<PathBuf>,
    /// Prefix directory handed to the runner through `WINEPREFIX`.
    pub prefix: Option<PathBuf>,
    /// Additional environment variables for the runner.
    pub env: BTreeMap<String, String>,
    /// Arguments placed between the runner and the game binary.
    pub args: Vec<String>,
}

/// The launcher's persisted settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all caches.
    pub cache_dir: PathBuf,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    #[serde(serialize_with = "serialize_dsn")]
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune cache expiry
    pub caches: CacheConfig,

    /// Shut the launcher down once the client has been started.
    ///
    /// When set, the server output is not captured either.
    pub close_after_launch: bool,

    pub client: ClientConfig,

    pub server: ServerConfig,

    pub compat: CompatConfig,
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("aki-launcher")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfig::default(),
            close_after_launch: false,
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            compat: CompatConfig::default(),
        }
    }
}

impl Config {
    /// Return a cache directory `dir`, joined with the configured base cache directory.
    pub fn cache_dir<P>(&self, dir: P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        self.cache_dir.join(dir)
    }

    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Writes the settings back to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("failed to serialize config")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        fs::write(path, yaml).context("failed to write configuration file")
    }
}

/// A configuration handle shared by all components.
///
/// Components read a snapshot whenever they need one and may [`subscribe`](Self::subscribe)
/// to be told about changes.
#[derive(Clone, Debug)]
pub struct SharedConfig {
    sender: Arc<watch::Sender<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        let (sender, _) = watch::channel(Arc::new(config));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Returns the current settings.
    pub fn get(&self) -> Arc<Config> {
        self.sender.borrow().clone()
    }

    /// Mutates the settings and notifies all subscribers.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Config),
    {
        self.sender.send_modify(|current| {
            let mut config = Config::clone(current);
            f(&mut config);
            *current = Arc::new(config);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.sender.subscribe()
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

fn serialize_level_filter<S: Serializer>(
    level: &LevelFilter,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&level.to_string().to_lowercase())
}

fn serialize_dsn<S: Serializer>(dsn: &Option<Dsn>, serializer: S) -> Result<S::Ok, S::Error> {
    match dsn {
        Some(dsn) => serializer.serialize_some(&dsn.to_string()),
        None => serializer.serialize_none(),
    }
}
