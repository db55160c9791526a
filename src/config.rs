//! Consensus runtime configuration.

use std::time::Duration;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 64;
/// Default ceiling on unacknowledged in-flight entries per follower.
pub const DEFAULT_MAX_INFLIGHT_ENTRIES: u64 = 64;
/// Default maximum number of client submissions coalesced into one batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;
/// Default bounded wait of the batcher's consumer loop, in milliseconds.
pub const DEFAULT_BATCH_WAIT: u64 = 1000;
/// Default capacity of the inbound message queue.
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 256;
/// Default bound on how long a client submission waits for a leader, in milliseconds.
pub const DEFAULT_LEADER_WAIT: u64 = 10_000;
/// Default time a joining member is given to catch up, in milliseconds.
pub const DEFAULT_CATCH_UP_TIMEOUT: u64 = 30_000;
/// Default lag (in entries) within which a joining member counts as caught up.
pub const DEFAULT_CATCH_UP_LAG: u64 = 16;

/// The runtime configuration for a consensus node.
///
/// Remember the inequality from the Raft paper when tuning:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. Keep the election timeout high
/// enough that network latency will not cause spurious elections, but low
/// enough that a real leader crash does not cause prolonged downtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this cluster, for observability only.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    ///
    /// The difference between min and max is the jitter range which
    /// desynchronizes simultaneous timer expiry across the cluster.
    pub election_timeout_max: u64,
    /// The interval in milliseconds at which a leader sends heartbeats.
    ///
    /// Heartbeats are not jittered.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: u64,
    /// The ceiling on unacknowledged in-flight entries per follower.
    ///
    /// Bounds the memory held for a slow follower and keeps the leader from
    /// overwhelming it; shipping to a follower pauses once this many entries
    /// are awaiting acknowledgement.
    pub max_inflight_entries: u64,
    /// The maximum number of client submissions coalesced into a single batch.
    pub max_batch_size: usize,
    /// The bounded wait of the batcher's consumer loop.
    pub batch_wait: Duration,
    /// Capacity of the bounded inbound queue; producers block when it is full.
    pub inbound_queue_capacity: usize,
    /// How long a client submission waits for a leader before the retryable
    /// no-leader condition is reported.
    pub leader_wait: Duration,
    /// How long a joining member is given to catch up before the join attempt
    /// is reported failed.
    pub catch_up_timeout: Duration,
    /// A joining member counts as caught up once its match index is within
    /// this many entries of the leader's append index.
    pub catch_up_lag: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: cluster_name.into(),
            ..ConfigBuilder::default()
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> Duration {
        Duration::from_millis(thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max))
    }

    /// The fixed part of the election delay; jitter is added per renewal.
    pub(crate) fn election_delay(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min)
    }

    /// The random jitter range added to each election timeout renewal.
    pub(crate) fn election_jitter(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max - self.election_timeout_min)
    }

    pub(crate) fn heartbeat_delay(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build("default").validate().expect("default config must validate")
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigBuilder {
    pub cluster_name: String,
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub max_payload_entries: Option<u64>,
    pub max_inflight_entries: Option<u64>,
    pub max_batch_size: Option<usize>,
    pub batch_wait: Option<u64>,
    pub inbound_queue_capacity: Option<usize>,
    pub leader_wait: Option<u64>,
    pub catch_up_timeout: Option<u64>,
    pub catch_up_lag: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `max_inflight_entries`.
    pub fn max_inflight_entries(mut self, val: u64) -> Self {
        self.max_inflight_entries = Some(val);
        self
    }

    /// Set the desired value for `max_batch_size`.
    pub fn max_batch_size(mut self, val: usize) -> Self {
        self.max_batch_size = Some(val);
        self
    }

    /// Set the desired value for `batch_wait`, in milliseconds.
    pub fn batch_wait(mut self, millis: u64) -> Self {
        self.batch_wait = Some(millis);
        self
    }

    /// Set the desired value for `inbound_queue_capacity`.
    pub fn inbound_queue_capacity(mut self, val: usize) -> Self {
        self.inbound_queue_capacity = Some(val);
        self
    }

    /// Set the desired value for `leader_wait`, in milliseconds.
    pub fn leader_wait(mut self, millis: u64) -> Self {
        self.leader_wait = Some(millis);
        self
    }

    /// Set the desired value for `catch_up_timeout`, in milliseconds.
    pub fn catch_up_timeout(mut self, millis: u64) -> Self {
        self.catch_up_timeout = Some(millis);
        self
    }

    /// Set the desired value for `catch_up_lag`.
    pub fn catch_up_lag(mut self, val: u64) -> Self {
        self.catch_up_lag = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::HeartbeatIntervalTooLarge);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let max_batch_size = self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE);
        if max_batch_size == 0 {
            return Err(ConfigError::MaxBatchSizeTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            max_inflight_entries: self.max_inflight_entries.unwrap_or(DEFAULT_MAX_INFLIGHT_ENTRIES),
            max_batch_size,
            batch_wait: Duration::from_millis(self.batch_wait.unwrap_or(DEFAULT_BATCH_WAIT)),
            inbound_queue_capacity: self.inbound_queue_capacity.unwrap_or(DEFAULT_INBOUND_QUEUE_CAPACITY),
            leader_wait: Duration::from_millis(self.leader_wait.unwrap_or(DEFAULT_LEADER_WAIT)),
            catch_up_timeout: Duration::from_millis(self.catch_up_timeout.unwrap_or(DEFAULT_CATCH_UP_TIMEOUT)),
            catch_up_lag: self.catch_up_lag.unwrap_or(DEFAULT_CATCH_UP_LAG),
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
