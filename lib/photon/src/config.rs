use crate::process::MAX_PROCESS;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the read-only distribution path.
pub const DIST_ENV: &str = "TWK_DIST";
/// Environment variable naming the mutable state path.
pub const VAR_ENV: &str = "TWK_VAR";

pub const DEFAULT_MAX_THREADS: usize = 8;
pub const MIN_WORKER_THREADS: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Runtime configuration. Defaults come from the environment; embedding
/// hosts may also load the whole structure from a TOML file.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub dist_path: PathBuf,
    pub var_path: PathBuf,
    pub max_threads: usize,
    pub max_process: usize,
    pub idle_timeout_secs: u64,
    pub listen_address: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            dist_path: PathBuf::from("."),
            var_path: PathBuf::from("./var"),
            max_threads: DEFAULT_MAX_THREADS,
            max_process: MAX_PROCESS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            listen_address: None,
        }
    }
}

impl Config {
    /// Builds a configuration from `TWK_DIST`/`TWK_VAR`, verifying that both
    /// paths exist as directories.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Ok(path) = env::var(DIST_ENV) {
            config.dist_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var(VAR_ENV) {
            config.var_path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from a TOML file, then validates the paths.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let config: Config =
            serdeconv::from_toml_file(path).map_err(|err| ConfigError::Toml(err.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dist_path.is_dir() {
            return Err(ConfigError::MissingDir(self.dist_path.clone()));
        }
        if !self.var_path.is_dir() {
            return Err(ConfigError::MissingDir(self.var_path.clone()));
        }

        Ok(())
    }

    /// Worker pool size, clamped to the minimum the scheduler requires.
    #[inline]
    pub fn worker_threads(&self) -> usize {
        self.max_threads.max(MIN_WORKER_THREADS)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// A required path is absent or not a directory.
    MissingDir(PathBuf),
    /// The configuration file failed to parse.
    Toml(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::MissingDir(path) => {
                write!(f, "required directory does not exist: {}", path.display())
            }
            ConfigError::Toml(err) => write!(f, "configuration file error: {}", err),
        }
    }
}
