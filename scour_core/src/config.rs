use serde::Deserialize;
use std::path::PathBuf;

/// Fuzzing-session configuration, loadable from a TOML file.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ScourConfig {
    /// Directory for persistent session state (corpus, crashers, profiles).
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Number of parallel workers.
    #[serde(default = "default_procs")]
    pub procs: usize,
    /// Per-input execution ceiling, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Time budget for input minimisation, in seconds.
    #[serde(default = "default_minimize_secs")]
    pub minimize_secs: u64,
    /// Keep duplicate crashers instead of collapsing them.
    #[serde(default)]
    pub dup: bool,
    /// Use coverage hit counters rather than plain bits.
    #[serde(default = "default_true")]
    pub covercounters: bool,
    /// Process comparison telemetry and generate rewrite hints.
    #[serde(default = "default_true")]
    pub sonar: bool,
    /// Total fuzzing duration in seconds; unlimited when absent.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Refresh `<workdir>/sonarprofile` as site coverage grows.
    #[serde(default)]
    pub dumpcover: bool,
}

fn default_workdir() -> PathBuf {
    PathBuf::from("scour-work")
}

fn default_procs() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_minimize_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for ScourConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            procs: default_procs(),
            timeout_secs: default_timeout_secs(),
            minimize_secs: default_minimize_secs(),
            dup: false,
            covercounters: true,
            sonar: true,
            ttl_secs: None,
            dumpcover: false,
        }
    }
}

impl ScourConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ScourConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
