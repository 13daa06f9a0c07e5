//! Protocol tunables shared by the core components.

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::error::ConfigError;
use crate::transfer::MAX_CHUNK_SIZE;
use crate::Millis;

/// Default interval between discovery announcements.
pub const DEFAULT_ANNOUNCE_INTERVAL_MS: Millis = 5_000;

/// Peer liveness thresholds, measured from a record's `last_seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessWindows {
    /// Within this window the peer is Online.
    pub online: Millis,
    /// Past `online` but within this window the peer is Away; past it, Offline.
    pub away: Millis,
    /// Past this window the record is evicted.
    pub eviction: Millis,
}

impl LivenessWindows {
    pub fn new(online: Millis, away: Millis, eviction: Millis) -> Result<Self, ConfigError> {
        let w = Self {
            online,
            away,
            eviction,
        };
        w.validate()?;
        Ok(w)
    }

    /// 2x, 6x and 20x the announcement interval.
    pub fn for_interval(announce_interval: Millis) -> Self {
        Self {
            online: announce_interval.saturating_mul(2),
            away: announce_interval.saturating_mul(6),
            eviction: announce_interval.saturating_mul(20),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.online == 0 {
            return Err(ConfigError::Zero("online window"));
        }
        if !(self.online < self.away && self.away < self.eviction) {
            return Err(ConfigError::WindowOrder);
        }
        Ok(())
    }
}

impl Default for LivenessWindows {
    fn default() -> Self {
        Self::for_interval(DEFAULT_ANNOUNCE_INTERVAL_MS)
    }
}

/// Delivery retry policy for text messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for an acknowledgment before counting the attempt as failed.
    pub ack_timeout: Millis,
    /// Delay before retry `n` is `backoff[n]`; the length is the retry budget.
    pub backoff: Vec<Millis>,
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        self.backoff.len() as u32
    }

    /// Delay before retry number `retry` (0-based), or None once the budget is spent.
    pub fn delay_before(&self, retry: u32) -> Option<Millis> {
        self.backoff.get(retry as usize).copied()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: 5_000,
            backoff: vec![500, 1_000, 2_000],
        }
    }
}

/// All protocol tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    pub announce_interval: Millis,
    pub liveness: LivenessWindows,
    pub messages: RetryPolicy,
    pub chunk_size: u64,
    pub chunk_ack_timeout: Millis,
    pub chunk_retries: u32,
}

impl CoreConfig {
    /// Config with liveness windows derived from `announce_interval`.
    pub fn with_announce_interval(announce_interval: Millis) -> Self {
        Self {
            announce_interval,
            liveness: LivenessWindows::for_interval(announce_interval),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announce_interval == 0 {
            return Err(ConfigError::Zero("announce interval"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Zero("chunk size"));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkTooLarge { max: MAX_CHUNK_SIZE });
        }
        if self.messages.ack_timeout == 0 {
            return Err(ConfigError::Zero("message ack timeout"));
        }
        if self.chunk_ack_timeout == 0 {
            return Err(ConfigError::Zero("chunk ack timeout"));
        }
        self.liveness.validate()
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL_MS,
            liveness: LivenessWindows::default(),
            messages: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_ack_timeout: 10_000,
            chunk_retries: 3,
        }
    }
}
