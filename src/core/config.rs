use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

fn default_flow_control_enforcement_timeout_ms() -> u64 {
    30_000
}

fn default_producer_credit_low_water() -> u64 {
    1_024
}

fn default_producer_credit_topup() -> u64 {
    65_536
}

fn default_unfinished_command_drain_threshold() -> usize {
    500
}

fn default_max_uncommitted_in_memory_size() -> u64 {
    10 * 1024 * 1024
}

fn default_dtx_timeout_ms() -> u64 {
    0
}

fn default_max_dtx_timeout_ms() -> u64 {
    0
}

fn default_max_message_groups() -> usize {
    255
}

/// Per-session tuning for the session engine.
///
/// All timeouts are advisory; they are polled, never preemptive. A value of
/// zero disables the corresponding check.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// How long a producer session may stay flow-blocked before the
    /// connection is entitled to force-close it. Zero disables enforcement.
    #[serde(default = "default_flow_control_enforcement_timeout_ms")]
    pub flow_control_enforcement_timeout_ms: u64,

    /// Outstanding producer credit level at which a top-up is granted.
    #[serde(default = "default_producer_credit_low_water")]
    pub producer_credit_low_water: u64,

    /// Credit extension granted when the low-water mark is crossed.
    #[serde(default = "default_producer_credit_topup")]
    pub producer_credit_topup: u64,

    /// Unfinished async command depth beyond which the completion queue is
    /// drained forcibly to bound memory and latency.
    #[serde(default = "default_unfinished_command_drain_threshold")]
    pub unfinished_command_drain_threshold: usize,

    /// Uncommitted transactional payload bytes held in memory before
    /// in-transit messages are flowed to disk.
    #[serde(default = "default_max_uncommitted_in_memory_size")]
    pub max_uncommitted_in_memory_size: u64,

    /// Default distributed-transaction branch timeout. Zero means branches
    /// never expire unless a timeout is set explicitly.
    #[serde(default = "default_dtx_timeout_ms")]
    pub default_dtx_timeout_ms: u64,

    /// Upper bound a client may set as a branch timeout. Zero means no cap.
    #[serde(default = "default_max_dtx_timeout_ms")]
    pub max_dtx_timeout_ms: u64,

    /// Maximum distinct message groups tracked per queue; rounded up to the
    /// next power of two for bucket indexing.
    #[serde(default = "default_max_message_groups")]
    pub max_message_groups: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flow_control_enforcement_timeout_ms: default_flow_control_enforcement_timeout_ms(),
            producer_credit_low_water: default_producer_credit_low_water(),
            producer_credit_topup: default_producer_credit_topup(),
            unfinished_command_drain_threshold: default_unfinished_command_drain_threshold(),
            max_uncommitted_in_memory_size: default_max_uncommitted_in_memory_size(),
            default_dtx_timeout_ms: default_dtx_timeout_ms(),
            max_dtx_timeout_ms: default_max_dtx_timeout_ms(),
            max_message_groups: default_max_message_groups(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.producer_credit_topup == 0 {
            bail!("producer_credit_topup must be nonzero");
        }
        if self.unfinished_command_drain_threshold == 0 {
            bail!("unfinished_command_drain_threshold must be nonzero");
        }
        if self.max_message_groups == 0 {
            bail!("max_message_groups must be nonzero");
        }
        if self.max_dtx_timeout_ms != 0 && self.default_dtx_timeout_ms > self.max_dtx_timeout_ms {
            bail!(
                "default_dtx_timeout_ms {} exceeds max_dtx_timeout_ms {}",
                self.default_dtx_timeout_ms,
                self.max_dtx_timeout_ms
            );
        }
        Ok(())
    }

    pub fn flow_control_enforcement_timeout(&self) -> Duration {
        Duration::from_millis(self.flow_control_enforcement_timeout_ms)
    }

    pub fn default_dtx_timeout(&self) -> Option<Duration> {
        if self.default_dtx_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.default_dtx_timeout_ms))
        }
    }

    pub fn max_dtx_timeout(&self) -> Option<Duration> {
        if self.max_dtx_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.max_dtx_timeout_ms))
        }
    }
}
