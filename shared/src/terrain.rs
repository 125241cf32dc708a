//! Procedural terrain height field.
//! Deterministic noise composition so server and client sample identical ground from one seed.
//!
//! Scale: 1 unit = 1 meter.
//! - Natural terrain is a sum of continental, mountain, hill, ridge and detail layers
//! - Plateaus, rivers, canyons, climate and dunes are shaped on top
//! - Cities flatten the result toward plateaus with graded road ramps

pub mod biome;
pub mod cache;
pub mod city;
pub mod layers;

use std::sync::Mutex;

use bevy::math::DVec3;
use bevy::prelude::*;
use noise::{NoiseFn, Perlin};

use crate::error::ConfigError;
use biome::{BiomeDescriptor, BiomeMap};
use cache::HeightCache;
use city::{CityConfig, CityRegulator};
use layers::{anisotropic_fbm, fbm, ridged, smoothstep, terrace, turbulence};

/// World generation seed - same seed = same world
pub const WORLD_SEED: u32 = 42;

/// Half-width of the central difference used for normals
pub const DEFAULT_NORMAL_EPSILON: f64 = 0.6;

/// Lowest natural height (sea bed)
pub const OCEAN_FLOOR: f64 = -30.0;

/// Strength of the domain warp applied to the mountain layer
const WARP_STRENGTH: f64 = 15.0;

const PLATEAU_SHARPNESS: f64 = 2.5;
const PLATEAU_THRESHOLD: f64 = 0.35;
const PLATEAU_STEP: f64 = 4.0;

/// Terrain tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct TerrainConfig {
    pub seed: u32,
    pub ocean_floor: f64,
    pub normal_epsilon: f64,
    /// Entries kept before the height cache is cleared wholesale.
    pub cache_capacity: usize,
    pub biome_cell_size: f64,
    pub biome_blend_distance: f64,
    pub city: CityConfig,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            seed: WORLD_SEED,
            ocean_floor: OCEAN_FLOOR,
            normal_epsilon: DEFAULT_NORMAL_EPSILON,
            cache_capacity: 65_536,
            biome_cell_size: 512.0,
            biome_blend_distance: 96.0,
            city: CityConfig::default(),
        }
    }
}

impl TerrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |field: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::NonPositive {
                    field,
                    value: value as f32,
                })
            }
        };
        check("normal_epsilon", self.normal_epsilon)?;
        check("biome_cell_size", self.biome_cell_size)?;
        check("city.zone_frequency", self.city.zone_frequency)?;
        if !self.ocean_floor.is_finite() {
            return Err(ConfigError::NonFinite {
                field: "ocean_floor",
                value: self.ocean_floor as f32,
            });
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::NonPositive {
                field: "cache_capacity",
                value: 0.0,
            });
        }
        Ok(())
    }
}

/// Everything known about the ground at one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainSample {
    pub height: f64,
    pub normal: DVec3,
    /// Gradient magnitude (rise over run).
    pub slope: f64,
    pub biome: BiomeDescriptor,
    pub city_influence: f64,
}

/// Anything the integrator can stand on.
///
/// `height` must be pure and finite for finite input. The provided methods derive normals by
/// central difference and expose f32 wrappers for the physics code.
pub trait HeightField: Send + Sync {
    fn height(&self, x: f64, z: f64) -> f64;

    fn normal_epsilon(&self) -> f64 {
        DEFAULT_NORMAL_EPSILON
    }

    fn normal(&self, x: f64, z: f64) -> DVec3 {
        let e = self.normal_epsilon();
        let h_left = self.height(x - e, z);
        let h_right = self.height(x + e, z);
        let h_back = self.height(x, z - e);
        let h_front = self.height(x, z + e);
        DVec3::new(h_left - h_right, 2.0 * e, h_back - h_front).normalize()
    }

    fn slope(&self, x: f64, z: f64) -> f64 {
        let e = self.normal_epsilon();
        let dx = (self.height(x + e, z) - self.height(x - e, z)) / (2.0 * e);
        let dz = (self.height(x, z + e) - self.height(x, z - e)) / (2.0 * e);
        (dx * dx + dz * dz).sqrt()
    }

    /// Tire friction coefficient of the surface.
    fn surface_friction(&self, _x: f64, _z: f64) -> f64 {
        0.9
    }

    fn height_at(&self, x: f32, z: f32) -> f32 {
        self.height(x as f64, z as f64) as f32
    }

    fn normal_at(&self, x: f32, z: f32) -> Vec3 {
        self.normal(x as f64, z as f64).as_vec3()
    }
}

/// Level ground at a fixed height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatTerrain {
    pub level: f64,
    pub friction: f64,
}

impl FlatTerrain {
    pub fn new(level: f64) -> Self {
        Self {
            level,
            friction: 0.9,
        }
    }
}

impl Default for FlatTerrain {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl HeightField for FlatTerrain {
    fn height(&self, _x: f64, _z: f64) -> f64 {
        self.level
    }

    fn normal(&self, _x: f64, _z: f64) -> DVec3 {
        DVec3::Y
    }

    fn slope(&self, _x: f64, _z: f64) -> f64 {
        0.0
    }

    fn surface_friction(&self, _x: f64, _z: f64) -> f64 {
        self.friction
    }
}

/// Uncached procedural terrain.
pub struct TerrainGenerator {
    config: TerrainConfig,
    warp: Perlin,
    continental: Perlin,
    mountains: Perlin,
    hills: Perlin,
    ridge_a: Perlin,
    ridge_b: Perlin,
    detail: Perlin,
    micro: Perlin,
    plateau: Perlin,
    river: Perlin,
    canyon: Perlin,
    canyon_mask: Perlin,
    moisture: Perlin,
    temperature: Perlin,
    erosion: Perlin,
    shelf: Perlin,
    dunes: Perlin,
    biomes: BiomeMap,
    city: CityRegulator,
}

impl TerrainGenerator {
    pub fn new(config: TerrainConfig) -> Self {
        let seed = config.seed;
        Self {
            warp: Perlin::new(seed.wrapping_add(100)),
            continental: Perlin::new(seed),
            mountains: Perlin::new(seed.wrapping_add(200)),
            hills: Perlin::new(seed.wrapping_add(300)),
            ridge_a: Perlin::new(seed.wrapping_add(400)),
            ridge_b: Perlin::new(seed.wrapping_add(500)),
            detail: Perlin::new(seed.wrapping_add(600)),
            micro: Perlin::new(seed.wrapping_add(700)),
            plateau: Perlin::new(seed.wrapping_add(1000)),
            river: Perlin::new(seed.wrapping_add(1100)),
            canyon: Perlin::new(seed.wrapping_add(1200)),
            canyon_mask: Perlin::new(seed.wrapping_add(1300)),
            moisture: Perlin::new(seed.wrapping_add(1400)),
            temperature: Perlin::new(seed.wrapping_add(1500)),
            erosion: Perlin::new(seed.wrapping_add(1600)),
            shelf: Perlin::new(seed.wrapping_add(2000)),
            dunes: Perlin::new(seed.wrapping_add(2100)),
            biomes: BiomeMap::new(seed, config.biome_cell_size, config.biome_blend_distance),
            city: CityRegulator::new(seed, config.city.clone()),
            config,
        }
    }

    pub fn config(&self) -> &TerrainConfig {
        &self.config
    }

    pub fn biome_at(&self, x: f64, z: f64) -> BiomeDescriptor {
        self.biomes.blend(x, z)
    }

    pub fn city_influence(&self, x: f64, z: f64) -> f64 {
        self.city.influence(x, z)
    }

    /// Height before urban regulation.
    pub fn natural_height(&self, x: f64, z: f64) -> f64 {
        let biome = self.biomes.blend(x, z);

        // Warped coordinates feed the mountain layer only.
        let wx = x + self.warp.get([x * 0.004, z * 0.004]) * WARP_STRENGTH;
        let wz = z + self.warp.get([x * 0.004 + 31.7, z * 0.004 - 12.9]) * WARP_STRENGTH;

        let continental = fbm(&self.continental, x * 0.0008, z * 0.0008, 3) * 18.0;
        let mountains = fbm(&self.mountains, wx * 0.003, wz * 0.003, 4) * 15.0;
        let hills = fbm(&self.hills, x * 0.01, z * 0.01, 3) * 8.0;

        let ridge_mod = 0.5 + 0.5 * turbulence(&self.erosion, x * 0.004, z * 0.004, 2);
        let ridges = (ridged(&self.ridge_a, x * 0.006, z * 0.006, 3) * 0.6
            + ridged(&self.ridge_b, x * 0.011, z * 0.011, 2) * 0.4)
            * ridge_mod
            * 10.0;

        let detail = turbulence(&self.detail, x * 0.05, z * 0.05, 3) * 2.5;
        let micro = turbulence(&self.micro, x * 0.2, z * 0.2, 2) * 1.2;

        let plateau = self.plateau_layer(x, z);
        let carving = self.carving(x, z);
        let climate = self.climate(x, z);

        let erosion = -(turbulence(&self.erosion, x * 0.02, z * 0.02, 2) * 0.5
            + ridged(&self.ridge_a, x * 0.02 + 7.0, z * 0.02 - 3.0, 2) * 0.5)
            * 1.5;

        let dryness = (1.0 - biome.humidity).clamp(0.0, 1.0);
        let shelf = anisotropic_fbm(&self.shelf, x, z, 0.0015, 0.006, 3) * 4.0;
        let dune_n = self.dunes.get([x * 0.003, z * 0.015]);
        let dunes = (1.0 - dune_n.abs()).powf(1.5) * 6.0 * dryness;

        let h = continental
            + mountains
            + hills
            + ridges
            + detail
            + micro
            + plateau
            + carving
            + climate
            + erosion
            + biome.altitude_bias
            + shelf
            + dunes;

        h.max(self.config.ocean_floor)
    }

    /// Mesa landforms: a sharpened field that terraces once it rises past a threshold.
    fn plateau_layer(&self, x: f64, z: f64) -> f64 {
        let p = (fbm(&self.plateau, x * 0.002, z * 0.002, 2) * 0.5 + 0.5).clamp(0.0, 1.0);
        let shaped = p.powf(PLATEAU_SHARPNESS);
        let raw = shaped * 20.0;
        let stepped = terrace(raw, PLATEAU_STEP, 0.35);
        let mask = smoothstep(PLATEAU_THRESHOLD - 0.05, PLATEAU_THRESHOLD + 0.05, shaped);
        raw + (stepped - raw) * mask
    }

    /// Rivers and canyons, always <= 0.
    fn carving(&self, x: f64, z: f64) -> f64 {
        let river_flow = (self.river.get([x * 0.0015, z * 0.0015]).abs() * 4.0).min(1.0);
        let river = -(1.0 - river_flow).powi(3) * 6.0;

        let canyon_flow = (self.canyon.get([x * 0.004, z * 0.004]).abs() * 3.0).min(1.0);
        let gate = smoothstep(0.25, 0.45, self.canyon_mask.get([x * 0.0007, z * 0.0007]));
        let canyon = -(1.0 - canyon_flow).powi(2) * 12.0 * gate;

        river + canyon
    }

    /// Wetlands sink, permafrost ridges rise.
    fn climate(&self, x: f64, z: f64) -> f64 {
        let moisture = self.moisture.get([x * 0.0007, z * 0.0007]) * 0.5 + 0.5;
        let latitude = (z * 0.00008).sin() * 0.3;
        let temperature = self.temperature.get([x * 0.0006, z * 0.0006]) * 0.35 + 0.5 - latitude;

        let wet = ((moisture - 0.65) / 0.35).clamp(0.0, 1.0);
        let frost = ((0.35 - temperature) / 0.35).clamp(0.0, 1.0);
        let frost_ridge = 0.5 + 0.5 * ridged(&self.ridge_b, x * 0.02, z * 0.02, 2);

        -wet * 4.0 + frost * 5.0 * frost_ridge
    }

    /// Final height at a point, urban regulation included.
    pub fn height(&self, x: f64, z: f64) -> f64 {
        let natural = self.natural_height(x, z);
        self.city.regulate(x, z, natural).height
    }

    pub fn sample(&self, x: f64, z: f64) -> TerrainSample {
        let natural = self.natural_height(x, z);
        let urban = self.city.regulate(x, z, natural);
        TerrainSample {
            height: urban.height,
            normal: HeightField::normal(self, x, z),
            slope: HeightField::slope(self, x, z),
            biome: self.biome_at(x, z),
            city_influence: urban.influence,
        }
    }
}

impl HeightField for TerrainGenerator {
    fn height(&self, x: f64, z: f64) -> f64 {
        TerrainGenerator::height(self, x, z)
    }

    fn normal_epsilon(&self) -> f64 {
        self.config.normal_epsilon
    }

    fn surface_friction(&self, x: f64, z: f64) -> f64 {
        self.biome_at(x, z).friction
    }
}

/// Resource holding the terrain generator and its height cache.
///
/// Heights are cached on a 0.1-unit lattice and bilinearly interpolated, so a query result
/// never depends on which points were sampled earlier.
#[derive(Resource)]
pub struct WorldTerrain {
    pub generator: TerrainGenerator,
    cache: Mutex<HeightCache>,
}

impl WorldTerrain {
    pub fn new(config: TerrainConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = config.cache_capacity;
        Ok(Self {
            generator: TerrainGenerator::new(config),
            cache: Mutex::new(HeightCache::new(capacity)),
        })
    }

    fn lattice_height(&self, cache: &mut HeightCache, key: (i64, i64)) -> f64 {
        if let Some(h) = cache.get(key) {
            return h;
        }
        let (x, z) = HeightCache::key_center(key);
        let h = self.generator.height(x, z);
        cache.insert(key, h);
        h
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn sample(&self, x: f64, z: f64) -> TerrainSample {
        TerrainSample {
            height: HeightField::height(self, x, z),
            normal: HeightField::normal(self, x, z),
            slope: HeightField::slope(self, x, z),
            biome: self.generator.biome_at(x, z),
            city_influence: self.generator.city_influence(x, z),
        }
    }
}

impl Default for WorldTerrain {
    fn default() -> Self {
        let config = TerrainConfig::default();
        let capacity = config.cache_capacity;
        Self {
            generator: TerrainGenerator::new(config),
            cache: Mutex::new(HeightCache::new(capacity)),
        }
    }
}

impl HeightField for WorldTerrain {
    fn height(&self, x: f64, z: f64) -> f64 {
        let gx = x * cache::CACHE_RESOLUTION;
        let gz = z * cache::CACHE_RESOLUTION;
        let (x0, z0) = (gx.floor(), gz.floor());
        let (tx, tz) = (gx - x0, gz - z0);
        let (ix, iz) = (x0 as i64, z0 as i64);

        // A poisoned lock only means another sampler panicked; the cache is still valid data.
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let h00 = self.lattice_height(&mut cache, (ix, iz));
        let h10 = self.lattice_height(&mut cache, (ix + 1, iz));
        let h01 = self.lattice_height(&mut cache, (ix, iz + 1));
        let h11 = self.lattice_height(&mut cache, (ix + 1, iz + 1));

        let a = h00 + (h10 - h00) * tx;
        let b = h01 + (h11 - h01) * tx;
        a + (b - a) * tz
    }

    fn normal_epsilon(&self) -> f64 {
        self.generator.config().normal_epsilon
    }

    fn surface_friction(&self, x: f64, z: f64) -> f64 {
        self.generator.biome_at(x, z).friction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_is_deterministic() {
        let a = TerrainGenerator::new(TerrainConfig::default());
        let b = TerrainGenerator::new(TerrainConfig::default());
        for i in 0..50 {
            let (x, z) = (i as f64 * 123.4 - 3000.0, i as f64 * -77.7 + 900.0);
            assert_eq!(a.height(x, z).to_bits(), a.height(x, z).to_bits());
            assert_eq!(a.height(x, z).to_bits(), b.height(x, z).to_bits());
        }
    }

    #[test]
    fn cached_height_ignores_query_history() {
        let fresh = WorldTerrain::default();
        let warmed = WorldTerrain::default();
        for i in 0..200 {
            warmed.height_at(i as f32 * 0.037, i as f32 * -0.051);
        }
        for i in 0..20 {
            let (x, z) = (i as f64 * 0.31, i as f64 * -0.27);
            assert_eq!(
                HeightField::height(&fresh, x, z).to_bits(),
                HeightField::height(&warmed, x, z).to_bits()
            );
        }
    }

    #[test]
    fn height_is_finite_and_above_floor() {
        let gen = TerrainGenerator::new(TerrainConfig::default());
        for i in 0..400 {
            let x = (i as f64 * 997.0) % 50_000.0 - 25_000.0;
            let z = (i as f64 * 613.0) % 50_000.0 - 25_000.0;
            let h = gen.height(x, z);
            assert!(h.is_finite());
            assert!(h >= OCEAN_FLOOR - 1e-9);
        }
        assert!(gen.height(1e9, -1e9).is_finite());
    }

    #[test]
    fn normals_are_unit_and_upward() {
        let terrain = WorldTerrain::default();
        for i in 0..50 {
            let n = terrain.normal_at(i as f32 * 13.0, i as f32 * 7.0);
            assert!((n.length() - 1.0).abs() < 1e-4);
            assert!(n.y > 0.0);
        }
    }

    #[test]
    fn flat_terrain_samples() {
        let flat = FlatTerrain::new(2.0);
        assert_eq!(flat.height_at(100.0, -3.0), 2.0);
        assert_eq!(flat.normal_at(0.0, 0.0), Vec3::Y);
        assert_eq!(flat.slope(5.0, 5.0), 0.0);
    }

    #[test]
    fn generic_normal_matches_gradient() {
        struct Ramp;
        impl HeightField for Ramp {
            fn height(&self, x: f64, _z: f64) -> f64 {
                x * 0.5
            }
        }
        let n = Ramp.normal(0.0, 0.0);
        let expected = DVec3::new(-0.5, 1.0, 0.0).normalize();
        assert!((n - expected).length() < 1e-9);
        assert!((Ramp.slope(3.0, 3.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sample_carries_biome() {
        let gen = TerrainGenerator::new(TerrainConfig::default());
        let s = gen.sample(10.0, 10.0);
        assert!(!s.biome.label.is_empty());
        assert!((0.0..=1.0).contains(&s.city_influence));
        assert!(s.slope >= 0.0);
    }

    #[test]
    fn invalid_config_rejected() {
        let cfg = TerrainConfig {
            normal_epsilon: 0.0,
            ..Default::default()
        };
        assert!(WorldTerrain::new(cfg).is_err());
    }
}
