//! Driver configuration
//!
//! Everything has a default matching the fabric as built. The allocation
//! policy can be chosen at startup through `SOBEL_ALLOCATION_POLICY`.

use crate::policy::AllocationPolicy;
use sobel_chip::bram;

/// Environment variable selecting the allocation policy.
pub const POLICY_ENV: &str = "SOBEL_ALLOCATION_POLICY";

/// Size of every mmap window (pre-process, post-process, metrics).
pub const MMAP_WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// Driver configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// How free groups are handed out
    pub policy: AllocationPolicy,

    /// Bytes allocated per mmap request; other sizes are rejected
    pub mmap_size: usize,

    /// Upper bound on pages per SG list, never more than the BRAM list holds
    pub max_sg_pages: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            policy: AllocationPolicy::BestAvailable,
            mmap_size: MMAP_WINDOW_SIZE,
            max_sg_pages: bram::MAX_SG_ENTRIES,
        }
    }
}

impl DriverConfig {
    /// Defaults, with the policy overridden from [`POLICY_ENV`] if set.
    ///
    /// An unparseable value is logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(POLICY_ENV) {
            match value.parse() {
                Ok(policy) => config.policy = policy,
                Err(e) => tracing::warn!("Ignoring {POLICY_ENV}={value}: {e}"),
            }
        }
        config
    }

    /// Same configuration with a different policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fabric() {
        let config = DriverConfig::default();
        assert_eq!(config.mmap_size, 4 << 20);
        assert_eq!(config.max_sg_pages, 8192);
        assert_eq!(config.policy, AllocationPolicy::BestAvailable);
    }

    #[test]
    fn with_policy_overrides_only_policy() {
        let config = DriverConfig::default().with_policy(AllocationPolicy::Greedy);
        assert_eq!(config.policy, AllocationPolicy::Greedy);
        assert_eq!(config.mmap_size, MMAP_WINDOW_SIZE);
    }
}
