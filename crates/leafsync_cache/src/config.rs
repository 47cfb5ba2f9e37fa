//! Cache configuration.

use serde::{Deserialize, Serialize};

/// Bounds for the two cache tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries in the memory tier.
    pub max_entries: usize,
    /// Maximum total value bytes in the memory tier.
    pub max_bytes: usize,
    /// Maximum total value bytes in the durable tier.
    pub durable_max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_bytes: 32 * 1024 * 1024,          // 32 MB
            durable_max_bytes: 256 * 1024 * 1024, // 256 MB
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default bounds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the memory tier entry bound.
    #[must_use]
    pub const fn max_entries(mut self, value: usize) -> Self {
        self.max_entries = value;
        self
    }

    /// Sets the memory tier byte bound.
    #[must_use]
    pub const fn max_bytes(mut self, value: usize) -> Self {
        self.max_bytes = value;
        self
    }

    /// Sets the durable tier byte bound.
    #[must_use]
    pub const fn durable_max_bytes(mut self, value: usize) -> Self {
        self.durable_max_bytes = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let config = CacheConfig::new()
            .max_entries(10)
            .max_bytes(1024)
            .durable_max_bytes(4096);
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.max_bytes, 1024);
        assert_eq!(config.durable_max_bytes, 4096);
    }
}
