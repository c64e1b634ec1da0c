//! Store configuration, loadable from TOML the way this codebase's other
//! config surfaces are loaded.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub lease_duration_secs: i64,
    pub priority_cap: i64,
    pub retry_base_secs: i64,
    pub retry_max_secs: i64,
    pub busy_retry_attempts: u32,
    pub default_list_limit: i64,
    pub max_list_limit: i64,
    pub poison_threshold: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: Self::default_path(),
            lease_duration_secs: 30,
            priority_cap: 100,
            retry_base_secs: 1,
            retry_max_secs: 30,
            busy_retry_attempts: 5,
            default_list_limit: 100,
            max_list_limit: 1000,
            poison_threshold: 3,
        }
    }
}

impl StoreConfig {
    /// `${HOME}/.goclaw/goclaw.db`
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".goclaw").join("goclaw.db")
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn clamp_list_limit(&self, requested: i64) -> i64 {
        if requested <= 0 || requested > self.max_list_limit {
            self.default_list_limit
        } else {
            requested
        }
    }

    /// Like [`Self::clamp_list_limit`], but for event replay, whose default
    /// page size is the max rather than the smaller general-purpose default
    /// (§4.4).
    pub fn clamp_events_limit(&self, requested: i64) -> i64 {
        if requested <= 0 || requested > self.max_list_limit {
            self.max_list_limit
        } else {
            requested
        }
    }
}
