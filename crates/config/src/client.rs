#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Client {
    /// Address of the local backend API.
    pub endpoint: String,

    /// How long to wait for the connection to be established.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub connect_timeout: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:817".into(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}
