// config.rs — Tunable compile-time and runtime parameters
//
// `ChannelPolicy` controls how Channel Insertion sizes channels. It may be
// embedded in the graph document under `"policy"` and overridden from the
// command line. `PollConfig` controls the backoff of blocking poll loops.

use serde::{Deserialize, Serialize};

/// Channel sizing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPolicy {
    /// Elements transferred per activation, in base-domain samples.
    pub base_block_size: u32,
    /// Channel capacity as a multiple of its block size.
    pub capacity_multiplier: u32,
    /// Let fan-out arcs with identical consumer characteristics share one
    /// channel.
    pub share_fanout: bool,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        ChannelPolicy {
            base_block_size: 1,
            capacity_multiplier: 2,
            share_fanout: false,
        }
    }
}

impl ChannelPolicy {
    pub fn with_block_size(mut self, n: u32) -> Self {
        self.base_block_size = n;
        self
    }

    pub fn with_capacity_multiplier(mut self, n: u32) -> Self {
        self.capacity_multiplier = n;
        self
    }

    pub fn with_share_fanout(mut self, on: bool) -> Self {
        self.share_fanout = on;
        self
    }
}

/// Backoff schedule for blocking poll loops: spin, then yield, then park.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Attempts separated by `spin_loop` hints.
    pub spin_limit: u32,
    /// Further attempts separated by `thread::yield_now`.
    pub yield_limit: u32,
    /// Sleep between attempts once spinning and yielding are exhausted.
    pub park_micros: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            spin_limit: 64,
            yield_limit: 64,
            park_micros: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults_double_buffer() {
        let p = ChannelPolicy::default();
        assert_eq!(p.base_block_size, 1);
        assert_eq!(p.capacity_multiplier, 2);
        assert!(!p.share_fanout);
    }

    #[test]
    fn policy_partial_document_fills_defaults() {
        let p: ChannelPolicy = serde_json::from_str(r#"{ "base_block_size": 8 }"#).unwrap();
        assert_eq!(p, ChannelPolicy::default().with_block_size(8));
    }
}
