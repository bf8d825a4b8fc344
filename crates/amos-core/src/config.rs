//! Static configuration loading: milestone definitions and the role
//! capability table.
//!
//! Both files are YAML, loaded once at startup and read-only thereafter.
//! A missing milestones file yields an empty graph; a missing roles file is
//! an error because nothing can be spawned without it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors produced while loading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("role {role}: prompt must not be empty")]
    EmptyPrompt { role: String },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// One milestone definition: `{id, goal, dependencies}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSpec {
    pub id: String,
    pub goal: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Per-role maximum cumulative spend. Either cap may be absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RoleCaps {
    #[serde(default)]
    pub dollar_cap: Option<f64>,
    #[serde(default)]
    pub token_cap: Option<u64>,
}

impl RoleCaps {
    /// `true` when neither cap is set; admission always succeeds.
    pub fn is_uncapped(&self) -> bool {
        self.dollar_cap.is_none() && self.token_cap.is_none()
    }
}

fn default_debate_rounds() -> usize {
    3
}

fn default_agent_kind() -> String {
    "scripted".to_string()
}

/// Static template for one role: prompt, caps, debate rounds, and the
/// agent-capability implementation to instantiate for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub prompt: String,

    #[serde(flatten)]
    pub caps: RoleCaps,

    #[serde(default = "default_debate_rounds")]
    pub debate_rounds: usize,

    /// Agent implementation selector, resolved by the registry's static
    /// factory. Defaults to the built-in deterministic agent.
    #[serde(default = "default_agent_kind")]
    pub kind: String,

    /// Canned proposals for the built-in scripted agent; cycled per call.
    /// Empty means "echo the issue".
    #[serde(default)]
    pub answers: Vec<String>,

    /// Usage charged against the ledger on every `propose` call.
    #[serde(default)]
    pub tokens_per_call: u64,
    #[serde(default)]
    pub cost_per_call: f64,
}

/// The full role table: `role name -> RoleSpec`.
pub type RoleTable = HashMap<String, RoleSpec>;

/// Load milestone definitions from a YAML list of `{id, goal, dependencies}`.
///
/// A missing file is treated as an empty definition list, so callers get an
/// empty graph rather than an error.
pub fn load_milestones(path: impl AsRef<Path>) -> ConfigResult<Vec<MilestoneSpec>> {
    let path = path.as_ref();
    if !path.exists() {
        debug!(path = %path.display(), "milestones file absent, using empty graph");
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load the role capability table from a YAML map `role -> RoleSpec`.
pub fn load_roles(path: impl AsRef<Path>) -> ConfigResult<RoleTable> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let table: RoleTable = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    for (role, spec) in &table {
        if spec.prompt.trim().is_empty() {
            return Err(ConfigError::EmptyPrompt { role: role.clone() });
        }
    }
    Ok(table)
}

/// Extract the cap table the ledger consumes from a full role table.
pub fn cap_table(roles: &RoleTable) -> HashMap<String, RoleCaps> {
    roles
        .iter()
        .map(|(name, spec)| (name.clone(), spec.caps))
        .collect()
}
