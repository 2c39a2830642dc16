use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub compile: CompileConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Knobs consulted by the graph validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Check every edge with the type compatibility checker.
    #[serde(default = "default_true")]
    pub type_checking: bool,
    /// Accept name-based cycles (nesting is always rejected).
    #[serde(default = "default_true")]
    pub allow_cycles: bool,
    /// Fail compilation on steps the start step cannot reach instead of warning.
    #[serde(default)]
    pub reject_unreachable: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            type_checking: true,
            allow_cycles: true,
            reject_unreachable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum step invocations per run before it fails.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Pass every approval gate without halting.
    #[serde(default)]
    pub auto_approve: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            auto_approve: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database for persisted snapshots.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_steps() -> usize {
    10_000
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EngineError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Resolve the snapshot database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let raw = self
            .store
            .path
            .clone()
            .unwrap_or_else(|| "~/.botrail/snapshots.db".to_string());
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(raw)
    }
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
