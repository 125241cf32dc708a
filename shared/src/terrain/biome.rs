//! Biome records and cell-based biome blending.
//!
//! The world is cut into large square cells; each cell hashes to one fixed biome record.
//! Near a cell edge the record is blended with the record across that edge, so numeric
//! properties (altitude bias, humidity, friction) vary continuously. Categorical properties
//! (label, color, flora) are taken whole from whichever record carries the most weight.

use serde::{Deserialize, Serialize};

use super::layers::{hash2, smoothstep};

/// Ground cover class, consumed by decoration placement outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flora {
    Sparse,
    Grass,
    Trees,
    Shrubs,
    Reeds,
    Rocks,
}

/// One fixed biome definition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomeRecord {
    pub label: &'static str,
    pub color: [f32; 3],
    pub flora: Flora,
    pub humidity: f64,
    pub altitude_bias: f64,
    /// Tire friction coefficient (mu).
    pub friction: f64,
}

pub const BIOMES: [BiomeRecord; 6] = [
    BiomeRecord {
        label: "desert",
        color: [0.85, 0.75, 0.55],
        flora: Flora::Sparse,
        humidity: 0.1,
        altitude_bias: 2.0,
        friction: 0.75,
    },
    BiomeRecord {
        label: "grasslands",
        color: [0.35, 0.55, 0.25],
        flora: Flora::Grass,
        humidity: 0.5,
        altitude_bias: 0.0,
        friction: 0.95,
    },
    BiomeRecord {
        label: "forest",
        color: [0.28, 0.42, 0.22],
        flora: Flora::Trees,
        humidity: 0.7,
        altitude_bias: 3.0,
        friction: 0.9,
    },
    BiomeRecord {
        label: "tundra",
        color: [0.80, 0.82, 0.85],
        flora: Flora::Shrubs,
        humidity: 0.3,
        altitude_bias: 6.0,
        friction: 0.6,
    },
    BiomeRecord {
        label: "wetland",
        color: [0.30, 0.40, 0.30],
        flora: Flora::Reeds,
        humidity: 0.95,
        altitude_bias: -3.0,
        friction: 0.55,
    },
    BiomeRecord {
        label: "highlands",
        color: [0.50, 0.48, 0.40],
        flora: Flora::Rocks,
        humidity: 0.4,
        altitude_bias: 10.0,
        friction: 0.85,
    },
];

/// Look up a record; out-of-range indices wrap.
pub fn biome_record(index: usize) -> &'static BiomeRecord {
    &BIOMES[index % BIOMES.len()]
}

/// Blended biome at a world position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiomeDescriptor {
    pub label: &'static str,
    pub color: [f32; 3],
    pub flora: Flora,
    pub humidity: f64,
    pub altitude_bias: f64,
    pub friction: f64,
}

impl From<&BiomeRecord> for BiomeDescriptor {
    fn from(r: &BiomeRecord) -> Self {
        Self {
            label: r.label,
            color: r.color,
            flora: r.flora,
            humidity: r.humidity,
            altitude_bias: r.altitude_bias,
            friction: r.friction,
        }
    }
}

/// Cell grid that assigns and blends biome records.
#[derive(Debug, Clone)]
pub struct BiomeMap {
    seed: u32,
    cell_size: f64,
    blend_distance: f64,
}

impl BiomeMap {
    pub fn new(seed: u32, cell_size: f64, blend_distance: f64) -> Self {
        Self {
            seed: seed.wrapping_add(4000),
            cell_size: cell_size.max(1.0),
            blend_distance: blend_distance.clamp(0.0, cell_size * 0.5),
        }
    }

    pub fn cell_of(&self, x: f64, z: f64) -> (i64, i64) {
        (
            (x / self.cell_size).floor() as i64,
            (z / self.cell_size).floor() as i64,
        )
    }

    /// Record index for a cell.
    pub fn cell_index(&self, cx: i64, cz: i64) -> usize {
        (hash2(self.seed, cx, cz) % BIOMES.len() as u64) as usize
    }

    /// Neighbor weight along one axis: 0.5 right at the edge, fading to 0 at `blend_distance`.
    fn edge_weight(&self, dist_to_edge: f64) -> f64 {
        if self.blend_distance <= 0.0 {
            return 0.0;
        }
        0.5 * (1.0 - smoothstep(0.0, self.blend_distance, dist_to_edge))
    }

    pub fn blend(&self, x: f64, z: f64) -> BiomeDescriptor {
        let (cx, cz) = self.cell_of(x, z);
        let fx = x / self.cell_size - cx as f64;
        let fz = z / self.cell_size - cz as f64;

        // Neighbor across the nearest edge on each axis.
        let (nx, dx) = if fx < 0.5 {
            (cx - 1, fx * self.cell_size)
        } else {
            (cx + 1, (1.0 - fx) * self.cell_size)
        };
        let (nz, dz) = if fz < 0.5 {
            (cz - 1, fz * self.cell_size)
        } else {
            (cz + 1, (1.0 - fz) * self.cell_size)
        };

        let wx = self.edge_weight(dx);
        let wz = self.edge_weight(dz);

        let contributions = [
            (self.cell_index(cx, cz), (1.0 - wx) * (1.0 - wz)),
            (self.cell_index(nx, cz), wx * (1.0 - wz)),
            (self.cell_index(cx, nz), (1.0 - wx) * wz),
            (self.cell_index(nx, nz), wx * wz),
        ];

        let mut humidity = 0.0;
        let mut altitude_bias = 0.0;
        let mut friction = 0.0;
        let mut per_record = [0.0f64; BIOMES.len()];
        for (index, weight) in contributions {
            let r = biome_record(index);
            humidity += r.humidity * weight;
            altitude_bias += r.altitude_bias * weight;
            friction += r.friction * weight;
            per_record[index % BIOMES.len()] += weight;
        }

        // Whole-record wins for the categorical fields.
        let mut winner = 0;
        for (i, w) in per_record.iter().enumerate() {
            if *w > per_record[winner] {
                winner = i;
            }
        }
        let top = biome_record(winner);

        BiomeDescriptor {
            label: top.label,
            color: top.color,
            flora: top.flora,
            humidity,
            altitude_bias,
            friction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_index_wraps() {
        assert_eq!(biome_record(BIOMES.len() + 1).label, BIOMES[1].label);
    }

    #[test]
    fn cell_interior_is_pure_record() {
        let map = BiomeMap::new(42, 512.0, 64.0);
        let d = map.blend(256.0, 256.0);
        let r = biome_record(map.cell_index(0, 0));
        assert_eq!(d.label, r.label);
        assert!((d.altitude_bias - r.altitude_bias).abs() < 1e-9);
    }

    #[test]
    fn bias_is_continuous_across_cell_edge() {
        let map = BiomeMap::new(42, 512.0, 64.0);
        for z in [10.0, 100.0, 255.0, 500.0] {
            let left = map.blend(512.0 - 1e-6, z);
            let right = map.blend(512.0 + 1e-6, z);
            assert!(
                (left.altitude_bias - right.altitude_bias).abs() < 1e-3,
                "bias jump at z={z}"
            );
            assert!((left.humidity - right.humidity).abs() < 1e-3);
        }
    }
}
