use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Tunables of a replica. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    /// Must be shorter than `election_timeout_min`, otherwise followers time
    /// out between heartbeats.
    pub heartbeat_interval: u64,
    /// How often the threaded runner advances the logical clock.
    pub tick_interval: u64,
    /// Upper bound on entries in a single AppendEntries.
    pub max_append_entries: usize,
    /// Upper bound on log entries shipped with a snapshot.
    pub max_snapshot_tail: usize,
    /// Snapshot automatically once this many entries were applied since the
    /// last snapshot.
    pub snapshot_threshold: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            tick_interval: 10,
            max_append_entries: 64,
            max_snapshot_tail: 64,
            snapshot_threshold: None,
        }
    }
}

impl RaftConfig {
    pub fn from_json(json: &str) -> Result<RaftConfig> {
        let config: RaftConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<RaftConfig> {
        RaftConfig::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.heartbeat_interval == 0 || self.tick_interval == 0 {
            return Err(Error::InvalidConfig("timeouts and intervals must be positive".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(Error::InvalidConfig(format!(
                "election_timeout_min {} exceeds election_timeout_max {}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval {} must be shorter than election_timeout_min {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_append_entries == 0 {
            return Err(Error::InvalidConfig("max_append_entries must be positive".into()));
        }
        if self.snapshot_threshold == Some(0) {
            return Err(Error::InvalidConfig("snapshot_threshold must be positive".into()));
        }

        Ok(())
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }
}
