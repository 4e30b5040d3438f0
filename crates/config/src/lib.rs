#![forbid(unsafe_code)]

mod client;
mod error;
mod retry_policy;
mod tracker;

pub use client::Client;
pub use error::Error;
pub use retry_policy::{MAX_RETRY_DELAY, MIN_RETRY_DELAY, RetryPolicy};
pub use tracker::Tracker;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variables that override file settings, e.g.
/// `PORTWATCH_CLIENT__ENDPOINT`.
pub const ENV_PREFIX: &str = "PORTWATCH_";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub client: Client,
    pub retry: RetryPolicy,
    pub tracker: Tracker,
}

impl Config {
    /// Default configuration, still honouring environment overrides.
    pub fn new() -> Result<Self, Error> {
        let config: Self = Self::figment().extract()?;
        Ok(config.normalize())
    }

    /// Load configuration from a TOML file layered over the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config.normalize())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        Ok(toml_edit::ser::to_string_pretty(self)?)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn normalize(mut self) -> Self {
        self.retry = self.retry.clamp();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn load_merges_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
endpoint = "127.0.0.1:9000"

[retry]
delay = 250
max_retries = 3
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.client.endpoint, "127.0.0.1:9000");
        assert_eq!(config.client.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, Some(3));
        assert_eq!(config.tracker, Tracker::default());
    }

    #[test]
    fn load_clamps_retry_delay() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\ndelay = 0").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.retry.delay, MIN_RETRY_DELAY);
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn new_rejects_malformed_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PORTWATCH_RETRY__DELAY", "soon");
            let err = Config::new().unwrap_err();
            assert!(matches!(err, Error::Extract(_)));
            Ok(())
        });
    }

    #[test]
    fn new_applies_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PORTWATCH_CLIENT__ENDPOINT", "10.0.0.1:817");
            let config = Config::new().unwrap();
            assert_eq!(config.client.endpoint, "10.0.0.1:817");
            Ok(())
        });
    }

    #[test]
    fn profile_keys() {
        let tracker = Tracker::default();
        assert_eq!(tracker.profile_key("local", "abc"), "core:profiles/local/abc");
        assert_eq!(
            tracker.layered_profile_key("local", "abc"),
            "runtime:layeredProfile/local/abc"
        );
    }

    #[test]
    fn toml_rendering_round_trips() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = Figment::from(Toml::string(&rendered)).extract().unwrap();
        assert_eq!(parsed, config);
    }
}
