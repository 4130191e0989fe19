//! Runtime tunables for the mesh and sync layers
//!
//! Production code uses the defaults; tests shrink the intervals to keep
//! scenarios fast.

use std::time::Duration;

/// Tunables shared by the mesh node and sync coordinator
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Display name announced to peers
    pub display_name: String,
    /// Interval between peer liveness sweeps
    pub sweep_interval: Duration,
    /// Silence after which a peer is evicted from the active set
    pub peer_timeout: Duration,
    /// Delay between connectivity restoration and the first drain pass,
    /// so flapping connectivity does not thrash the queue
    pub drain_debounce: Duration,
    /// Age after which a trip package is rebuilt from cached rows
    pub package_staleness: Duration,
    /// Capacity of the seen-message set used for relay deduplication
    pub seen_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            display_name: "tripmesh device".to_string(),
            sweep_interval: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(30),
            drain_debounce: Duration::from_secs(1),
            package_staleness: Duration::from_secs(24 * 60 * 60),
            seen_capacity: 1024,
        }
    }
}

impl MeshConfig {
    /// Config with the given display name and default timings
    pub fn with_display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.peer_timeout, Duration::from_secs(30));
        assert_eq!(config.drain_debounce, Duration::from_secs(1));
    }
}
