//! Tunables for the P2P core. Durations are stored in milliseconds so the struct
//! deserializes directly from a `[transfer]` TOML table.

use std::time::Duration;

use serde::Deserialize;

use crate::chunk::{self, DEFAULT_CHUNK_SIZE};

/// Floor for timer periods; a zero period would panic the timer.
pub const MIN_INTERVAL_MS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Preferred chunk size; clamped to the supported range.
    pub chunk_size: u64,
    /// A connection must finish its handshake within this window.
    pub handshake_timeout_ms: u64,
    /// An active session without progress for this long is paused.
    pub idle_timeout_ms: u64,
    /// Peers not seen for this long are evicted.
    pub peer_timeout_ms: u64,
    /// Floored at `MIN_INTERVAL_MS`.
    pub sweep_interval_ms: u64,
    /// Floored at `MIN_INTERVAL_MS`.
    pub heartbeat_interval_ms: u64,
    /// Consecutive failed attempts before a paused session fails.
    pub retry_limit: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Paused sessions not resumed within this window fail.
    pub resume_window_ms: u64,
    /// How long `stop` waits for connections before forcing them closed.
    pub stop_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            peer_timeout_ms: 16_000,
            sweep_interval_ms: 4_000,
            heartbeat_interval_ms: 4_000,
            retry_limit: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            resume_window_ms: 120_000,
            stop_grace_ms: 5_000,
        }
    }
}

impl Config {
    pub fn chunk_size(&self) -> u64 {
        chunk::clamp_chunk_size(self.chunk_size)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(MIN_INTERVAL_MS))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(MIN_INTERVAL_MS))
    }

    pub fn resume_window(&self) -> Duration {
        Duration::from_millis(self.resume_window_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Exponential backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = Config::default();
        assert_eq!(cfg.backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff(2), Duration::from_millis(400));
        assert_eq!(cfg.backoff(3), Duration::from_millis(800));
        assert_eq!(cfg.backoff(30), Duration::from_millis(5_000));
    }

    #[test]
    fn chunk_size_accessor_clamps() {
        let cfg = Config {
            chunk_size: 1,
            ..Config::default()
        };
        assert_eq!(cfg.chunk_size(), chunk::MIN_CHUNK_SIZE);
    }

    #[test]
    fn zero_intervals_are_floored() {
        let cfg = Config {
            sweep_interval_ms: 0,
            heartbeat_interval_ms: 0,
            ..Config::default()
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_millis(MIN_INTERVAL_MS));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(MIN_INTERVAL_MS));
        assert_eq!(Config::default().sweep_interval(), Duration::from_secs(4));
    }
}
