//! Timing and naming configuration
//!
//! Every component takes its configuration by value at construction time.
//! Defaults reproduce the behaviour of the browser build: a one second
//! election poll, a four second liveness deadline, and ten second grace
//! periods for document lookups.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between owner liveness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline for the owner to acknowledge a poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(4);

/// Default interval between heartbeat sweeps over all tabs
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of unanswered heartbeats before a tab is pruned
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Default deadline for fetching a document from connected peers
pub const DEFAULT_FIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time the WebRTC adapter waits for a first peer
pub const DEFAULT_WEBRTC_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Configuration for a document store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// How long `find` waits for peers to deliver a document
    pub find_timeout: Duration,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            find_timeout: DEFAULT_FIND_TIMEOUT,
        }
    }
}

/// Configuration for the per-session coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Delay between election iterations
    pub poll_interval: Duration,
    /// How long the owner has to answer a liveness poll
    pub poll_timeout: Duration,
    /// Interval between heartbeat sweeps over every registered tab
    pub heartbeat_interval: Duration,
    /// Unanswered sweeps after which a tab is dropped from the list
    pub max_missed_heartbeats: u32,
    /// Store settings for the coordinator's three repos
    pub repo: RepoConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            repo: RepoConfig::default(),
        }
    }
}

/// Configuration for a tab bootstrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabConfig {
    /// Grace period for the WebRTC adapter when the shared document
    /// was not available locally at coordinator startup
    pub webrtc_grace_period: Duration,
    /// Store settings for the tab's three repos
    pub repo: RepoConfig,
}

impl Default for TabConfig {
    fn default() -> Self {
        Self {
            webrtc_grace_period: DEFAULT_WEBRTC_GRACE_PERIOD,
            repo: RepoConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.poll_timeout, Duration::from_secs(4));
        assert!(config.poll_timeout > config.poll_interval);
        assert_eq!(config.max_missed_heartbeats, 3);
    }

    #[test]
    fn test_tab_defaults() {
        let config = TabConfig::default();
        assert_eq!(config.webrtc_grace_period, Duration::from_secs(10));
        assert_eq!(config.repo.find_timeout, Duration::from_secs(10));
    }
}
