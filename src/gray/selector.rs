use crate::config::VersionWeight;
use md5::{Digest, Md5};

/// Deterministic user → bucket mapping: the first four bytes of the MD5
/// digest, read as a big-endian `u32`. Stable across restarts and instances.
pub fn consistent_hash(input: &str) -> u32 {
    let digest = Md5::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Pre-computed weighted version selector.
///
/// Binds the versions and their cumulative weights together so they cannot
/// drift out of sync. Immutable; a weight change builds a new selector.
/// Zero-weight versions are dropped at construction.
#[derive(Debug, Clone)]
pub struct WeightedSelector {
    versions: Vec<String>,
    prefix_weights: Vec<u64>,
}

impl WeightedSelector {
    pub fn new(weights: &[VersionWeight]) -> Self {
        let mut versions = Vec::with_capacity(weights.len());
        let mut prefix_weights = Vec::with_capacity(weights.len());
        let mut sum: u64 = 0;
        for w in weights.iter().filter(|w| w.weight > 0) {
            sum += w.weight as u64;
            versions.push(w.version.clone());
            prefix_weights.push(sum);
        }
        Self {
            versions,
            prefix_weights,
        }
    }

    pub fn total_weight(&self) -> u64 {
        self.prefix_weights.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Version owning slot `hash mod total`: the first entry whose
    /// cumulative weight is strictly greater than the slot.
    pub fn select(&self, hash: u32) -> Option<&str> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let slot = hash as u64 % total;
        let idx = self.prefix_weights.partition_point(|&cum| cum <= slot);
        self.versions.get(idx).map(String::as_str)
    }
}
