//! Noise layer helpers shared by the natural terrain, biome and city fields.
//!
//! All helpers are pure functions of their inputs and the seeded noise source.

use noise::{NoiseFn, Perlin};

/// Classic smoothstep, tolerant of degenerate edges.
#[inline]
pub fn smoothstep(edge0: f64, edge1: f64, x: f64) -> f64 {
    if edge1 <= edge0 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Per-octave domain offset so octaves don't share lattice points.
#[inline]
fn octave_offset(i: u32) -> (f64, f64) {
    (i as f64 * 19.19, i as f64 * -7.31)
}

/// Fractal Brownian motion, roughly in [-1, 1].
pub fn fbm(noise: &Perlin, x: f64, z: f64, octaves: u32) -> f64 {
    let mut sum = 0.0;
    let mut amp = 1.0;
    let mut freq = 1.0;
    let mut norm = 0.0;
    for i in 0..octaves.max(1) {
        let (ox, oz) = octave_offset(i);
        sum += noise.get([x * freq + ox, z * freq + oz]) * amp;
        norm += amp;
        amp *= 0.5;
        freq *= 2.0;
    }
    sum / norm
}

/// Ridged fractal in [0, 1]: sharp crests where the base noise crosses zero.
pub fn ridged(noise: &Perlin, x: f64, z: f64, octaves: u32) -> f64 {
    let mut sum = 0.0;
    let mut amp = 1.0;
    let mut freq = 1.0;
    let mut norm = 0.0;
    for i in 0..octaves.max(1) {
        let (ox, oz) = octave_offset(i);
        let n = 1.0 - noise.get([x * freq + ox, z * freq + oz]).abs();
        sum += n * n * amp;
        norm += amp;
        amp *= 0.5;
        freq *= 2.0;
    }
    (sum / norm).clamp(0.0, 1.0)
}

/// Turbulence in [0, 1]: folded absolute-value fractal.
pub fn turbulence(noise: &Perlin, x: f64, z: f64, octaves: u32) -> f64 {
    let mut sum = 0.0;
    let mut amp = 1.0;
    let mut freq = 1.0;
    let mut norm = 0.0;
    for i in 0..octaves.max(1) {
        let (ox, oz) = octave_offset(i);
        sum += noise.get([x * freq + ox, z * freq + oz]).abs() * amp;
        norm += amp;
        amp *= 0.5;
        freq *= 2.0;
    }
    (sum / norm).clamp(0.0, 1.0)
}

/// Fractal noise sampled with different frequencies per axis.
///
/// A smaller `freq_x` than `freq_z` stretches features along X, producing long shelves/dunes.
pub fn anisotropic_fbm(noise: &Perlin, x: f64, z: f64, freq_x: f64, freq_z: f64, octaves: u32) -> f64 {
    fbm(noise, x * freq_x, z * freq_z, octaves)
}

/// Soft terracing: quantizes `value` into `step`-sized levels with a smooth riser
/// between levels so the result stays continuous.
pub fn terrace(value: f64, step: f64, riser: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let level = value / step;
    let base = level.floor();
    let frac = level - base;
    let half = riser.clamp(0.01, 1.0) * 0.5;
    (base + smoothstep(0.5 - half, 0.5 + half, frac)) * step
}

/// Deterministic 2D integer hash (splitmix64 finalizer).
pub fn hash2(seed: u32, x: i64, z: i64) -> u64 {
    let mut h = (seed as u64)
        ^ (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (z as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h = (h ^ (h >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    h ^ (h >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothstep_edges() {
        assert_eq!(smoothstep(0.0, 1.0, -1.0), 0.0);
        assert_eq!(smoothstep(0.0, 1.0, 2.0), 1.0);
        assert!((smoothstep(0.0, 1.0, 0.5) - 0.5).abs() < 1e-12);
        // Degenerate edge acts as a step.
        assert_eq!(smoothstep(1.0, 1.0, 0.5), 0.0);
        assert_eq!(smoothstep(1.0, 1.0, 1.5), 1.0);
    }

    #[test]
    fn layered_ranges() {
        let p = Perlin::new(7);
        for i in 0..200 {
            let x = i as f64 * 3.7;
            let z = i as f64 * -1.3;
            let r = ridged(&p, x * 0.01, z * 0.01, 4);
            let t = turbulence(&p, x * 0.01, z * 0.01, 4);
            let f = fbm(&p, x * 0.01, z * 0.01, 4);
            assert!((0.0..=1.0).contains(&r));
            assert!((0.0..=1.0).contains(&t));
            assert!(f.abs() <= 1.5);
        }
    }

    #[test]
    fn terrace_is_continuous() {
        let mut prev = terrace(0.0, 4.0, 0.3);
        let mut v = 0.0;
        while v < 20.0 {
            v += 0.01;
            let cur = terrace(v, 4.0, 0.3);
            assert!((cur - prev).abs() < 0.5, "jump at {v}: {prev} -> {cur}");
            prev = cur;
        }
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash2(42, 3, -9), hash2(42, 3, -9));
        assert_ne!(hash2(42, 3, -9), hash2(42, -9, 3));
    }
}
