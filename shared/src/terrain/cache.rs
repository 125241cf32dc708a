//! Bounded height cache keyed on 0.1-unit rounded coordinates.

use std::collections::HashMap;

/// Coordinate quantization: 10 keys per world unit.
pub const CACHE_RESOLUTION: f64 = 10.0;

#[derive(Debug)]
pub struct HeightCache {
    entries: HashMap<(i64, i64), f64>,
    capacity: usize,
    clears: u64,
}

impl HeightCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            clears: 0,
        }
    }

    pub fn key(x: f64, z: f64) -> (i64, i64) {
        (
            (x * CACHE_RESOLUTION).round() as i64,
            (z * CACHE_RESOLUTION).round() as i64,
        )
    }

    /// World coordinate a key stands for.
    pub fn key_center(key: (i64, i64)) -> (f64, f64) {
        (key.0 as f64 / CACHE_RESOLUTION, key.1 as f64 / CACHE_RESOLUTION)
    }

    pub fn get(&self, key: (i64, i64)) -> Option<f64> {
        self.entries.get(&key).copied()
    }

    /// Insert, clearing everything first when full.
    pub fn insert(&mut self, key: (i64, i64), height: f64) {
        if self.entries.len() >= self.capacity {
            self.entries.clear();
            self.clears += 1;
        }
        self.entries.insert(key, height);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many wholesale clears have happened.
    pub fn clears(&self) -> u64 {
        self.clears
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearby_points_share_a_key() {
        assert_eq!(HeightCache::key(1.01, -2.02), HeightCache::key(0.99, -1.98));
        assert_ne!(HeightCache::key(1.0, 0.0), HeightCache::key(1.1, 0.0));
    }

    #[test]
    fn clears_wholesale_at_capacity() {
        let mut cache = HeightCache::new(3);
        for i in 0..3 {
            cache.insert((i, 0), i as f64);
        }
        assert_eq!(cache.len(), 3);
        cache.insert((9, 9), 1.0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clears(), 1);
        assert_eq!(cache.get((0, 0)), None);
        assert_eq!(cache.get((9, 9)), Some(1.0));
    }
}
