// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

//! Client configuration.
//!
//! Configuration is an explicit [`ClientConfig`] value held by the
//! [`Client`][crate::Client]; there is no process-wide mutable state.
//! [`ClientConfig::from_env`] builds one from, in increasing priority:
//!
//! 1. built-in defaults,
//! 2. the credentials file `~/.spb/config` (INI, one section per profile),
//! 3. `SPB_*` environment variables.
//!
//! ```ini
//! [default]
//! team_name = my-team
//! access_key = 0123456789abcdef
//! ```
//!
//! | Variable | Field |
//! |----------|-------|
//! | `SPB_ACCESS_KEY`, `SPB_TEAM_NAME` | credentials |
//! | `SPB_PROFILE` | credentials file section (default `default`) |
//! | `SPB_API_BASE` | API base URL |
//! | `SPB_TIMEOUT` | per-request timeout, seconds |
//! | `SPB_MAX_RETRIES` | attempts per request |
//! | `SPB_MAX_CONCURRENCY` | parallel uploads |
//! | `SPB_POLL_INTERVAL`, `SPB_POLL_TIMEOUT` | job polling, seconds |

use crate::{Error, job::PollOptions, retry::RetryPolicy, upload::UploadOptions};
use config::{Config, Environment, File, FileFormat};
use directories::BaseDirs;
use log::debug;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_API_BASE: &str = "https://api.superb-ai.com";
pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(80);

/// Access key and team name used to authenticate API requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    team_name: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("team_name", &self.team_name)
            .field("access_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, team_name: impl Into<String>) -> Self {
        Credentials {
            access_key: access_key.into(),
            team_name: team_name.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn team_name(&self) -> &str {
        &self.team_name
    }

    /// Reads the credentials of `profile` from an INI credentials file.
    ///
    /// Returns `Ok(None)` when the file or the profile is missing.  Both the
    /// `team_name` key and the legacy `account_name` key are accepted.
    pub fn from_file(path: &Path, profile: &str) -> Result<Option<Self>, Error> {
        if !path.exists() {
            return Ok(None);
        }

        let file = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(false))
            .build()?;

        let access_key = file.get_string(&format!("{}.access_key", profile)).ok();
        let team_name = file
            .get_string(&format!("{}.team_name", profile))
            .or_else(|_| file.get_string(&format!("{}.account_name", profile)))
            .ok();

        match (access_key, team_name) {
            (Some(access_key), Some(team_name)) => Ok(Some(Credentials::new(access_key, team_name))),
            _ => Ok(None),
        }
    }
}

pub(crate) fn missing_credentials() -> Error {
    Error::MissingCredentials(
        "set SPB_ACCESS_KEY and SPB_TEAM_NAME or create ~/.spb/config".to_string(),
    )
}

/// Location of the credentials file, `~/.spb/config`.
pub fn credentials_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".spb").join("config"))
}

#[derive(Deserialize, Default, Debug)]
struct EnvSettings {
    access_key: Option<String>,
    team_name: Option<String>,
    profile: Option<String>,
    api_base: Option<String>,
    timeout: Option<u64>,
    max_retries: Option<u32>,
    max_concurrency: Option<usize>,
    poll_interval: Option<u64>,
    poll_timeout: Option<u64>,
}

/// Everything a [`Client`][crate::Client] needs to talk to Curate.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_base: String,
    pub credentials: Option<Credentials>,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub upload: UploadOptions,
    pub poll: PollOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            upload: UploadOptions::default(),
            poll: PollOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Loads the configuration from the environment and the default
    /// credentials file.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_sources(credentials_path().as_deref())
    }

    /// Like [`from_env`][Self::from_env] with an explicit credentials file.
    pub fn from_sources(credentials_file: Option<&Path>) -> Result<Self, Error> {
        let env: EnvSettings = Config::builder()
            .add_source(Environment::with_prefix("SPB").try_parsing(true))
            .build()?
            .try_deserialize()?;
        Self::from_settings(env, credentials_file)
    }

    fn from_settings(env: EnvSettings, credentials_file: Option<&Path>) -> Result<Self, Error> {
        let defaults = ClientConfig::default();
        let profile = env.profile.as_deref().unwrap_or(DEFAULT_PROFILE);

        let credentials = match (env.access_key, env.team_name) {
            (Some(access_key), Some(team_name)) => Some(Credentials::new(access_key, team_name)),
            (access_key, team_name) => {
                let file = match credentials_file {
                    Some(path) => Credentials::from_file(path, profile)?,
                    None => None,
                };
                if let Some(path) = credentials_file {
                    debug!("Credentials file {:?} profile '{}'", path, profile);
                }
                match file {
                    // Environment wins field by field over the file.
                    Some(file) => Some(Credentials::new(
                        access_key.unwrap_or(file.access_key),
                        team_name.unwrap_or(file.team_name),
                    )),
                    None => None,
                }
            }
        };

        let retry = match env.max_retries {
            Some(n) => defaults.retry.with_max_attempts(n),
            None => defaults.retry,
        };

        let upload = match env.max_concurrency {
            Some(n) => defaults.upload.with_max_concurrency(n),
            None => defaults.upload,
        };

        let mut poll = defaults.poll;
        if let Some(secs) = env.poll_interval {
            poll = poll.with_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = env.poll_timeout {
            poll = poll.with_timeout(Duration::from_secs(secs));
        }

        let config = ClientConfig {
            api_base: env.api_base.unwrap_or(defaults.api_base),
            credentials,
            timeout: env.timeout.map(Duration::from_secs).unwrap_or(defaults.timeout),
            retry,
            upload,
            poll,
        };

        debug!(
            "Client configuration - api_base={}, timeout={}s, max_attempts={}, max_concurrency={}",
            config.api_base,
            config.timeout.as_secs(),
            config.retry.max_attempts(),
            config.upload.max_concurrency()
        );

        Ok(config)
    }

    pub fn with_api_base(self, api_base: &str) -> Self {
        ClientConfig {
            api_base: api_base.to_owned(),
            ..self
        }
    }

    pub fn with_credentials(self, credentials: Credentials) -> Self {
        ClientConfig {
            credentials: Some(credentials),
            ..self
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        ClientConfig { retry, ..self }
    }

    pub fn with_upload(self, upload: UploadOptions) -> Self {
        ClientConfig { upload, ..self }
    }

    pub fn with_poll(self, poll: PollOptions) -> Self {
        ClientConfig { poll, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_credentials(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".ini")
            .tempfile()
            .expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn test_credentials_from_file() {
        let file = write_credentials(
            "[default]\nteam_name = alpha\naccess_key = k1\n\n[other]\naccount_name = beta\naccess_key = k2\n",
        );

        let default = Credentials::from_file(file.path(), "default").unwrap().unwrap();
        assert_eq!(default.team_name(), "alpha");
        assert_eq!(default.access_key(), "k1");

        let other = Credentials::from_file(file.path(), "other").unwrap().unwrap();
        assert_eq!(other.team_name(), "beta");
        assert_eq!(other.access_key(), "k2");

        assert!(Credentials::from_file(file.path(), "missing").unwrap().is_none());
    }

    #[test]
    fn test_missing_file() {
        let path = Path::new("/nonexistent/.spb/config");
        assert!(Credentials::from_file(path, "default").unwrap().is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_credentials("[default]\nteam_name = alpha\naccess_key = k1\n");
        let env = EnvSettings {
            team_name: Some("from-env".to_string()),
            max_retries: Some(7),
            max_concurrency: Some(2),
            poll_interval: Some(5),
            ..Default::default()
        };

        let config = ClientConfig::from_settings(env, Some(file.path())).unwrap();
        let credentials = config.credentials.unwrap();
        assert_eq!(credentials.team_name(), "from-env");
        assert_eq!(credentials.access_key(), "k1");
        assert_eq!(config.retry.max_attempts(), 7);
        assert_eq!(config.upload.max_concurrency(), 2);
        assert_eq!(config.poll.interval(), Duration::from_secs(5));
        assert_eq!(config.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn test_env_only() {
        let env = EnvSettings {
            access_key: Some("k".to_string()),
            team_name: Some("t".to_string()),
            api_base: Some("http://localhost:8080".to_string()),
            timeout: Some(3),
            ..Default::default()
        };
        let config = ClientConfig::from_settings(env, None).unwrap();
        assert_eq!(config.credentials, Some(Credentials::new("k", "t")));
        assert_eq!(config.api_base, "http://localhost:8080");
        assert_eq!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_debug_redacts_key() {
        let credentials = Credentials::new("super-secret", "team");
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("team"));
    }
}
