use crate::gmail::DEFAULT_API_BASE;
use crate::mailbox::DEFAULT_QUERY;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the tool keeps its files and how it talks to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rules_path: PathBuf,
    pub log_path: PathBuf,
    pub token_path: PathBuf,
    pub query: String,
    pub api_base: String,
    pub request_timeout_seconds: u64,
}

/// Directory holding the executable; rule and log files live next to it.
pub fn app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Settings {
    fn default() -> Self {
        let dir = app_dir();
        Settings {
            rules_path: dir.join("rules.json"),
            log_path: dir.join("actions.log"),
            token_path: PathBuf::from("token.json"),
            query: DEFAULT_QUERY.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_seconds: 30,
        }
    }
}

impl Settings {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {path}"))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid configuration file {path}"))?;
        Ok(settings)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load `path` if given; without one, use defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}
