use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use std::{
    env, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::args::BaseArgs;
use crate::ui::{print_command_status, CommandStatus};

mod get;
mod list;
mod set;

const APP_DIR: &str = "neptune-mlflow";
const LOCAL_DIR: &str = ".neptune-mlflow";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown config key: {key}\nValid keys: {}", KNOWN_KEYS.join(", "))]
    UnknownKey { key: String },
    #[error("Invalid value '{value}' for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("Max artifact size must be a positive integer (got {0})")]
    InvalidMaxArtifactSize(i64),
    #[error("Max artifact size of {0} MB is too large")]
    MaxArtifactSizeTooLarge(i64),
}

/// Persisted defaults. Credentials are deliberately not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mlflow_tracking_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_artifact_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_artifacts: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub const KNOWN_KEYS: &[&str] = &[
    "project",
    "mlflow_tracking_uri",
    "max_artifact_size",
    "exclude_artifacts",
];

impl Config {
    pub fn get_field(&self, key: &str) -> Option<String> {
        match key {
            "project" => self.project.clone(),
            "mlflow_tracking_uri" => self.mlflow_tracking_uri.clone(),
            "max_artifact_size" => self.max_artifact_size.map(|size| size.to_string()),
            "exclude_artifacts" => self.exclude_artifacts.map(|flag| flag.to_string()),
            _ => None,
        }
    }

    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |expected| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        };
        match key {
            "project" => self.project = Some(value.to_string()),
            "mlflow_tracking_uri" => self.mlflow_tracking_uri = Some(value.to_string()),
            "max_artifact_size" => {
                let size: i64 = value.parse().map_err(|_| invalid("an integer"))?;
                if size <= 0 {
                    return Err(ConfigError::InvalidMaxArtifactSize(size));
                }
                self.max_artifact_size = Some(size);
            }
            "exclude_artifacts" => {
                self.exclude_artifacts = Some(value.parse().map_err(|_| invalid("true or false"))?)
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        match key {
            "project" => self.project = None,
            "mlflow_tracking_uri" => self.mlflow_tracking_uri = None,
            "max_artifact_size" => self.max_artifact_size = None,
            "exclude_artifacts" => self.exclude_artifacts = None,
            _ => return false,
        }
        true
    }

    pub fn non_empty_fields(&self) -> Vec<(&'static str, String)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|&key| self.get_field(key).map(|v| (key, v)))
            .collect()
    }

    fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        Config {
            project: other.project.clone().or_else(|| self.project.clone()),
            mlflow_tracking_uri: other
                .mlflow_tracking_uri
                .clone()
                .or_else(|| self.mlflow_tracking_uri.clone()),
            max_artifact_size: other.max_artifact_size.or(self.max_artifact_size),
            exclude_artifacts: other.exclude_artifacts.or(self.exclude_artifacts),
            extra,
        }
    }
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join(APP_DIR));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join(APP_DIR))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("Could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("Could not parse {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("Unknown config key {} in {}", key, path.display()),
        );
    }

    config
}

pub fn load_global() -> Result<Config> {
    Ok(load_file(&global_path()?))
}

/// Global config overlaid with the nearest local one.
pub fn load() -> Result<Config> {
    let global = load_global().unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    tracing::debug!(path = %path.display(), "saved config");
    Ok(())
}

fn find_local_config_dir_from(start: PathBuf, home: Option<&Path>) -> Option<PathBuf> {
    let mut current_dir = start;
    loop {
        if current_dir.join(LOCAL_DIR).is_dir() {
            return Some(current_dir.join(LOCAL_DIR));
        }
        if current_dir.join(".git").exists() {
            return None;
        }
        if Some(current_dir.as_path()) == home {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn find_local_config_dir() -> Option<PathBuf> {
    let home = dirs::home_dir();
    find_local_config_dir_from(env::current_dir().ok()?, home.as_deref())
}

pub fn local_path() -> Option<PathBuf> {
    find_local_config_dir().map(|dir| dir.join("config.json"))
}

/// Resolve which config file to write based on --global/--local flags.
/// Without a flag the nearest local file wins, then the global one.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    match local_path() {
        Some(p) => Ok(p),
        None if local => Ok(env::current_dir()?.join(LOCAL_DIR).join("config.json")),
        None => global_path(),
    }
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config (~/.config/neptune-mlflow/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.neptune-mlflow/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// List config values
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Show config values grouped by source
        #[arg(long)]
        verbose: bool,
    },
    /// Get a config value
    Get {
        /// Config key (project, mlflow_tracking_uri, max_artifact_size, exclude_artifacts)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (project, mlflow_tracking_uri, max_artifact_size, exclude_artifacts)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key (project, mlflow_tracking_uri, max_artifact_size, exclude_artifacts)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<(), ConfigError> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(ConfigError::UnknownKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(base, false, false, false),
        Some(ConfigCommands::List { scope, verbose }) => {
            list::run(base, scope.global, scope.local, verbose)
        }
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(base, &key, scope.global, scope.local)
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}
