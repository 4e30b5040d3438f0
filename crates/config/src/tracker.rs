#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Tracker {
    /// Query used for the live connection subscription.
    pub network_query: String,

    /// Key prefix of application profiles.
    pub profile_prefix: String,

    /// Key prefix of layered runtime profiles.
    pub layered_profile_prefix: String,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            network_query: "network:".into(),
            profile_prefix: "core:profiles/".into(),
            layered_profile_prefix: "runtime:layeredProfile/".into(),
        }
    }
}

impl Tracker {
    /// Database key of the application profile `source/id`.
    pub fn profile_key(&self, source: &str, id: &str) -> String {
        format!("{}{source}/{id}", self.profile_prefix)
    }

    /// Database key of the layered profile for `source/id`.
    pub fn layered_profile_key(&self, source: &str, id: &str) -> String {
        format!("{}{source}/{id}", self.layered_profile_prefix)
    }
}
