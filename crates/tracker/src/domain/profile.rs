#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// How much of a group's traffic is being blocked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    /// Mixed, or nothing to judge.
    #[default]
    Off,
    /// Everything permitted.
    Low,
    /// Everything blocked.
    High,
}

impl BlockStatus {
    pub fn from_counts(permitted: usize, unpermitted: usize) -> Self {
        match (permitted, unpermitted) {
            (0, u) if u > 0 => Self::High,
            (p, 0) if p > 0 => Self::Low,
            _ => Self::Off,
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::High => "high",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppProfile {
    #[serde(rename = "ID")]
    pub id: String,
    pub source: String,
    pub name: String,
    pub description: String,
    pub linked_path: String,
    pub homepage: String,
    pub created: i64,
    pub approx_last_used: i64,
}

/// Runtime view of a profile with all configuration layers applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LayeredProfile {
    #[serde(rename = "LayerIDs")]
    pub layer_ids: Vec<String>,
    pub revision_counter: i64,
}
