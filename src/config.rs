use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use eyre::{WrapErr, bail};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The JSON file that discovered servers are written to.
    #[serde(default = "default_servers_file")]
    pub servers_file: PathBuf,

    /// If set, debug logs are also written to a daily rolling file in this
    /// directory.
    #[serde(default)]
    pub logging_dir: Option<PathBuf>,

    /// Extra ranges to exclude, on top of the reserved ranges that are never
    /// scanned.
    #[serde(default)]
    pub exclude_file: Option<PathBuf>,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub refresh: RefreshConfig,

    #[serde(default)]
    pub debug: DebugConfig,
}

fn default_servers_file() -> PathBuf {
    PathBuf::from("discovered_servers.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers_file: default_servers_file(),
            logging_dir: None,
            exclude_file: None,
            scanner: ScannerConfig::default(),
            target: TargetConfig::default(),
            refresh: RefreshConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct ScannerConfig {
    /// The number of addresses drawn for every scan cycle.
    pub batch_size: usize,
    /// The maximum number of probes in flight at once.
    pub concurrency: usize,
    /// How long a status ping may take before we give up on the address.
    pub timeout_secs: f64,
    /// How long the query protocol fallback may take. Defaults to
    /// `timeout_secs`.
    pub query_timeout_secs: Option<f64>,
    /// Whether to try the query protocol when the status ping fails. Turning
    /// this off roughly halves the time spent on dead addresses.
    pub query_fallback: bool,
    /// Print a progress line every this many batches.
    pub progress_every: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: 200,
            timeout_secs: 1.0,
            query_timeout_secs: None,
            query_fallback: true,
            progress_every: 3,
        }
    }
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.query_timeout_secs.unwrap_or(self.timeout_secs))
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct TargetConfig {
    pub port: u16,
    /// Sent in the handshake. Servers answer the status request regardless of
    /// the version, this only changes what some proxies report.
    pub protocol_version: i32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            port: 25565,
            protocol_version: 47,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct RefreshConfig {
    pub concurrency: usize,
    pub timeout_secs: f64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            timeout_secs: 1.0,
        }
    }
}

impl RefreshConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DebugConfig {
    /// Stop after this many batches instead of running until interrupted.
    #[serde(default)]
    pub exit_after_batches: Option<u64>,
}

impl Config {
    /// Read the config at `path`, falling back to the defaults if the file
    /// doesn't exist, then apply `MCPROBE_*` environment overrides.
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)
                .wrap_err_with(|| format!("reading config at {}", path.display()))?;
            toml::from_str::<Config>(&contents)
                .wrap_err_with(|| format!("parsing config at {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Apply overrides from the environment. The lookup is a parameter so
    /// this can be tested without touching the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<()> {
        if let Some(batch_size) = parse_override(&lookup, "MCPROBE_BATCH_SIZE")? {
            self.scanner.batch_size = batch_size;
        }
        if let Some(concurrency) = parse_override(&lookup, "MCPROBE_CONCURRENCY")? {
            self.scanner.concurrency = concurrency;
        }
        if let Some(timeout_secs) = parse_override(&lookup, "MCPROBE_TIMEOUT_SECS")? {
            self.scanner.timeout_secs = timeout_secs;
        }
        if let Some(servers_file) = lookup("MCPROBE_SERVERS_FILE") {
            self.servers_file = PathBuf::from(servers_file);
        }
        Ok(())
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.scanner.batch_size == 0 {
            bail!("scanner.batch_size must be at least 1");
        }
        if self.scanner.concurrency == 0 {
            bail!("scanner.concurrency must be at least 1");
        }
        if self.scanner.progress_every == 0 {
            bail!("scanner.progress_every must be at least 1");
        }
        if self.refresh.concurrency == 0 {
            bail!("refresh.concurrency must be at least 1");
        }
        for (name, secs) in [
            ("scanner.timeout_secs", Some(self.scanner.timeout_secs)),
            ("scanner.query_timeout_secs", self.scanner.query_timeout_secs),
            ("refresh.timeout_secs", Some(self.refresh.timeout_secs)),
        ] {
            if let Some(secs) = secs {
                if !secs.is_finite() || secs <= 0. {
                    bail!("{name} must be a positive number of seconds, got {secs}");
                }
            }
        }
        Ok(())
    }
}

fn parse_override<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> eyre::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    let parsed = value
        .trim()
        .parse::<T>()
        .wrap_err_with(|| format!("invalid value {value:?} for {key}"))?;
    Ok(Some(parsed))
}
