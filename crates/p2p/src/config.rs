//! Configuration for the sync client and the request-response server.

use std::time::Duration;
use thiserror::Error;

/// Errors from chain-level configuration queries.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("timestamp {timestamp} precedes L2 genesis time {genesis_time}")]
    BeforeGenesis { timestamp: u64, genesis_time: u64 },

    #[error("block time must be non-zero")]
    ZeroBlockTime,
}

/// Chain identity and genesis anchoring for the rollup.
#[derive(Debug, Clone)]
pub struct RollupConfig {
    /// Chain id of the L2 network; part of the protocol identifier.
    pub l2_chain_id: u64,
    /// Number of the L2 genesis block. Requests below it cannot be served.
    pub genesis_number: u64,
    /// Unix timestamp of the L2 genesis block.
    pub genesis_time: u64,
    /// Seconds between consecutive L2 blocks.
    pub block_time: u64,
}

impl RollupConfig {
    /// Highest block number the chain could plausibly have reached by
    /// `timestamp`. Requests above it cannot be served.
    pub fn target_block_number(&self, timestamp: u64) -> Result<u64, ConfigError> {
        if self.block_time == 0 {
            return Err(ConfigError::ZeroBlockTime);
        }
        if timestamp < self.genesis_time {
            return Err(ConfigError::BeforeGenesis {
                timestamp,
                genesis_time: self.genesis_time,
            });
        }
        Ok(self.genesis_number + (timestamp - self.genesis_time) / self.block_time)
    }
}

/// Configuration for the sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Chain identity.
    pub rollup: RollupConfig,

    /// Maximum encoded payload size accepted in a response frame.
    pub max_payload_size: u32,

    /// Capacity of the trusted-hash set.
    ///
    /// Grows by one entry per delivered block plus two per range request;
    /// recency-bounded so long-running nodes do not leak.
    pub trust_capacity: usize,

    /// Capacity of the quarantine buffer.
    ///
    /// A small window keeps untrusted data from lingering: unused entries
    /// age out quickly, which is what surfaces bad peers.
    pub quarantine_capacity: usize,

    /// Capacity of the peer-request fan-out queue and the results queue.
    pub channel_capacity: usize,

    /// Budget for one range-scheduling pass.
    pub max_request_scheduling: Duration,

    /// Budget for processing one result, including the receiver callback.
    pub max_result_processing: Duration,

    /// Budget for handing a range request to the main loop before the
    /// caller gets a busy error.
    pub range_send_timeout: Duration,

    /// Interval at which each peer worker earns one request token.
    pub peer_token_interval: Duration,

    /// Burst size of the per-worker limiter.
    pub peer_token_burst: u32,

    /// Tokens charged to a worker after a failed exchange. At the default
    /// token interval the debt pauses the worker for about one second.
    pub failure_backoff_tokens: u32,

    /// Deadline for opening a stream to a peer.
    pub stream_open_timeout: Duration,

    /// Deadline for writing the request.
    pub write_timeout: Duration,

    /// Deadline for reading the response, length prefix through body.
    pub read_timeout: Duration,
}

impl SyncConfig {
    /// Client configuration with the default tuning for a rollup chain.
    pub fn new(rollup: RollupConfig) -> Self {
        Self {
            rollup,
            max_payload_size: 10 * 1024 * 1024,
            trust_capacity: 10_000,
            quarantine_capacity: 100,
            channel_capacity: 128,
            max_request_scheduling: Duration::from_secs(3),
            max_result_processing: Duration::from_secs(3),
            range_send_timeout: Duration::from_secs(3),
            peer_token_interval: Duration::from_millis(10),
            peer_token_burst: 10,
            failure_backoff_tokens: 100,
            stream_open_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(20),
        }
    }

    /// Set the maximum accepted payload size.
    pub fn with_max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the fan-out and results channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the budget for handing a range request to the main loop.
    pub fn with_range_send_timeout(mut self, timeout: Duration) -> Self {
        self.range_send_timeout = timeout;
        self
    }

    /// Small capacities and short deadlines for tests.
    pub fn for_testing(rollup: RollupConfig) -> Self {
        Self {
            quarantine_capacity: 10,
            max_request_scheduling: Duration::from_millis(500),
            max_result_processing: Duration::from_millis(500),
            range_send_timeout: Duration::from_millis(500),
            stream_open_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            ..Self::new(rollup)
        }
    }
}

/// Configuration for the request-response server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Chain identity.
    pub rollup: RollupConfig,

    /// Maximum encoded payload size written in a response frame.
    pub max_payload_size: u32,

    /// Global admission rate across all peers, requests per second.
    pub global_rate: f64,
    /// Global admission burst.
    pub global_burst: u32,

    /// Per-peer admission rate, requests per second.
    pub peer_rate: f64,
    /// Per-peer admission burst.
    pub peer_burst: u32,

    /// Distinct peers to retain rate-limit state for. Well beyond any
    /// realistic connected-peer count; bounds churn from transient peers.
    pub peer_state_capacity: usize,

    /// Ceiling on admission throttling before the stream is dropped
    /// without a response.
    pub max_throttle_delay: Duration,

    /// Deadline for reading the request number.
    pub read_timeout: Duration,

    /// Deadline for writing the response frame.
    pub write_timeout: Duration,
}

impl ServerConfig {
    /// Server configuration with the default admission tuning.
    pub fn new(rollup: RollupConfig) -> Self {
        Self {
            rollup,
            max_payload_size: 10 * 1024 * 1024,
            global_rate: 3.0,
            global_burst: 2,
            peer_rate: 4.0,
            peer_burst: 3,
            peer_state_capacity: 1_000,
            max_throttle_delay: Duration::from_secs(20),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }

    /// Set the global admission rate and burst.
    pub fn with_global_limit(mut self, rate: f64, burst: u32) -> Self {
        self.global_rate = rate;
        self.global_burst = burst;
        self
    }

    /// Set the per-peer admission rate and burst.
    pub fn with_peer_limit(mut self, rate: f64, burst: u32) -> Self {
        self.peer_rate = rate;
        self.peer_burst = burst;
        self
    }

    /// Short deadlines for tests.
    pub fn for_testing(rollup: RollupConfig) -> Self {
        Self {
            max_throttle_delay: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            ..Self::new(rollup)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollup() -> RollupConfig {
        RollupConfig {
            l2_chain_id: 901,
            genesis_number: 100,
            genesis_time: 1_000,
            block_time: 2,
        }
    }

    #[test]
    fn target_block_number_advances_with_time() {
        let cfg = rollup();
        assert_eq!(cfg.target_block_number(1_000).unwrap(), 100);
        assert_eq!(cfg.target_block_number(1_001).unwrap(), 100);
        assert_eq!(cfg.target_block_number(1_002).unwrap(), 101);
        assert_eq!(cfg.target_block_number(1_020).unwrap(), 110);
    }

    #[test]
    fn target_block_number_rejects_pre_genesis() {
        let cfg = rollup();
        assert!(matches!(
            cfg.target_block_number(999),
            Err(ConfigError::BeforeGenesis { .. })
        ));
    }

    #[test]
    fn sync_defaults_match_protocol_floors() {
        let cfg = SyncConfig::new(rollup());
        assert_eq!(cfg.channel_capacity, 128);
        assert_eq!(cfg.quarantine_capacity, 100);
        assert_eq!(cfg.trust_capacity, 10_000);
        assert_eq!(cfg.failure_backoff_tokens, 100);
        assert_eq!(cfg.read_timeout, Duration::from_secs(20));
    }

    #[test]
    fn server_defaults_match_admission_floors() {
        let cfg = ServerConfig::new(rollup());
        assert_eq!(cfg.global_burst, 2);
        assert_eq!(cfg.peer_burst, 3);
        assert_eq!(cfg.peer_state_capacity, 1_000);
        assert_eq!(cfg.max_throttle_delay, Duration::from_secs(20));
    }
}
