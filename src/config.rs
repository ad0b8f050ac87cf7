//! Runtime configuration
//!
//! Everything that was a hard-coded constant in earlier deployments lives
//! here: data file locations, poll/sweep intervals, the vote threshold, and
//! cache sizes. Values come from an optional TOML file, with defaults
//! matching the historical behavior.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Known-player list, one name per line.
    pub player_file: PathBuf,
    /// Ban records, `name|reason|ban_time|unban_time`.
    pub banned_file: PathBuf,
    /// Forbidden-command rules, `keyword hours`.
    pub forbidden_file: PathBuf,
    /// Amnesty request store.
    pub request_file: PathBuf,
    /// Directory for uploaded request images.
    pub upload_dir: PathBuf,

    /// Distinct addresses required before a request executes.
    pub vote_threshold: usize,
    /// Most recent player events kept for API consumers.
    pub log_cache_capacity: usize,

    /// Sleep between empty reads of the server's output.
    #[serde(with = "humantime_serde")]
    pub output_poll_interval: Duration,
    /// Ban-expiry sweep period.
    #[serde(with = "humantime_serde")]
    pub ban_sweep_interval: Duration,
    /// Vote execute/cleanup sweep period.
    #[serde(with = "humantime_serde")]
    pub vote_sweep_interval: Duration,
    /// How long executed requests (and their images) are kept.
    #[serde(with = "humantime_serde")]
    pub request_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            player_file: PathBuf::from("data/players.list"),
            banned_file: PathBuf::from("data/banned.list"),
            forbidden_file: PathBuf::from("data/forbidden_commands.list"),
            request_file: PathBuf::from("data/requests.dat"),
            upload_dir: PathBuf::from("data/uploads"),
            vote_threshold: 5,
            log_cache_capacity: 1000,
            output_poll_interval: Duration::from_millis(10),
            ban_sweep_interval: Duration::from_secs(30),
            vote_sweep_interval: Duration::from_secs(10),
            request_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let text = fs::read_to_string(path)?;
                Ok(toml::from_str(&text)?)
            }
        }
    }
}
