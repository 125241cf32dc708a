//! Urban terrain regulation: city influence mask, plateau profiles and road ramps.
//!
//! Cities sit on flattened plateaus. Inside the forced-plateau region the height is the
//! plateau level plus the local ramp offset, exactly. Outside it, natural terrain is pulled
//! toward the same target with a weight that reaches 1 as influence reaches the tier
//! threshold. Tier parameters blend across importance bands, so neither the plateau edge nor
//! a tier boundary makes a cliff.

use noise::{NoiseFn, Perlin};

use super::layers::{fbm, smoothstep};

/// Urban tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CityConfig {
    pub zone_frequency: f64,
    /// Raw zone value at which influence is 0.5.
    pub influence_threshold: f64,
    /// Half-width of the smoothstep around `influence_threshold`.
    pub influence_band: f64,
    /// Influence range below a tier threshold over which the plateau pull ramps in.
    pub tier_band: f64,
    /// Importance half-width over which neighbouring tiers' parameters blend.
    pub tier_cut_band: f64,
    pub plateau_base_height: f64,
    pub plateau_variation: f64,
    pub ramp_height: f64,
    pub road_frequency: f64,
}

impl Default for CityConfig {
    fn default() -> Self {
        Self {
            zone_frequency: 0.0011,
            influence_threshold: 0.12,
            influence_band: 0.16,
            tier_band: 0.35,
            tier_cut_band: 0.05,
            plateau_base_height: 6.0,
            plateau_variation: 3.0,
            ramp_height: 2.5,
            road_frequency: 0.004,
        }
    }
}

/// Settlement size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrbanTier {
    Village,
    Town,
    Metropolis,
}

/// Importance values where one tier hands over to the next.
const TIER_CUTS: [f64; 2] = [0.33, 0.66];

impl UrbanTier {
    const ORDER: [UrbanTier; 3] = [UrbanTier::Village, UrbanTier::Town, UrbanTier::Metropolis];

    pub fn from_importance(importance: f64) -> Self {
        if importance < TIER_CUTS[0] {
            UrbanTier::Village
        } else if importance < TIER_CUTS[1] {
            UrbanTier::Town
        } else {
            UrbanTier::Metropolis
        }
    }

    /// Influence at which a plateau-forcing tier reaches the plateau exactly.
    pub fn plateau_threshold(self) -> f64 {
        match self {
            UrbanTier::Village => 0.92,
            UrbanTier::Town => 0.85,
            UrbanTier::Metropolis => 0.78,
        }
    }

    pub fn flattening_strength(self) -> f64 {
        match self {
            UrbanTier::Village => 0.55,
            UrbanTier::Town => 0.8,
            UrbanTier::Metropolis => 1.0,
        }
    }

    pub fn forces_plateau(self) -> bool {
        !matches!(self, UrbanTier::Village)
    }

    fn params(self) -> TierParams {
        TierParams {
            threshold: self.plateau_threshold(),
            strength: self.flattening_strength(),
            forcing: if self.forces_plateau() { 1.0 } else { 0.0 },
        }
    }
}

/// Tier parameters, blended across the importance band around each tier cut.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierParams {
    pub threshold: f64,
    pub strength: f64,
    /// 1 for plateau-forcing tiers, 0 for soft flattening, fractional in between.
    pub forcing: f64,
}

impl TierParams {
    pub fn at(importance: f64, band: f64) -> Self {
        let mut params = UrbanTier::ORDER[0].params();
        for (i, cut) in TIER_CUTS.iter().enumerate() {
            let next = UrbanTier::ORDER[i + 1].params();
            let t = smoothstep(cut - band, cut + band, importance);
            params = TierParams {
                threshold: params.threshold + (next.threshold - params.threshold) * t,
                strength: params.strength + (next.strength - params.strength) * t,
                forcing: params.forcing + (next.forcing - params.forcing) * t,
            };
        }
        params
    }
}

/// How the city pulls terrain toward its plateau at one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CityProfile {
    pub tier: UrbanTier,
    pub params: TierParams,
    /// Pull toward the plateau in [0, 1] before road grading; 1 is the plateau exactly.
    pub pull: f64,
    pub plateau_height: f64,
}

/// Road ramp shaping at one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampProfile {
    pub height_offset: f64,
    pub slope_factor: f64,
    pub outside_falloff: f64,
}

/// Result of regulating one natural height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UrbanSample {
    pub height: f64,
    pub influence: f64,
    pub forced_plateau: bool,
}

pub struct CityRegulator {
    config: CityConfig,
    zone: Perlin,
    ring: Perlin,
    edge: Perlin,
    importance: Perlin,
    level: Perlin,
    roads: Perlin,
}

impl CityRegulator {
    pub fn new(seed: u32, config: CityConfig) -> Self {
        Self {
            config,
            zone: Perlin::new(seed.wrapping_add(8000)),
            ring: Perlin::new(seed.wrapping_add(8100)),
            edge: Perlin::new(seed.wrapping_add(8200)),
            importance: Perlin::new(seed.wrapping_add(8300)),
            level: Perlin::new(seed.wrapping_add(8400)),
            roads: Perlin::new(seed.wrapping_add(8500)),
        }
    }

    pub fn config(&self) -> &CityConfig {
        &self.config
    }

    /// City influence in [0, 1].
    pub fn influence(&self, x: f64, z: f64) -> f64 {
        let f = self.config.zone_frequency;
        let zone = self.zone.get([x * f, z * f]) + 0.35 * self.zone.get([x * f * 2.3 + 11.0, z * f * 2.3 - 5.0]);
        let ring = 1.0 - self.ring.get([x * f * 3.0, z * f * 3.0]).abs() - 0.5;
        let edge = self.edge.get([x * 0.02, z * 0.02]);
        let raw = zone + ring * 0.15 + edge * 0.04;
        let t = self.config.influence_threshold;
        let b = self.config.influence_band;
        smoothstep(t - b, t + b, raw)
    }

    /// Settlement importance in [0, 1].
    pub fn importance(&self, x: f64, z: f64) -> f64 {
        let v = fbm(&self.importance, x * 0.0003, z * 0.0003, 2) * 0.5 + 0.5;
        v.clamp(0.0, 1.0)
    }

    pub fn tier(&self, x: f64, z: f64) -> UrbanTier {
        UrbanTier::from_importance(self.importance(x, z))
    }

    pub fn profile(&self, x: f64, z: f64, influence: f64) -> CityProfile {
        let plateau_height = self.config.plateau_base_height
            + self.config.plateau_variation * self.level.get([x * 0.0005, z * 0.0005]);
        self.profile_for(self.importance(x, z), influence, plateau_height)
    }

    /// Profile from importance directly. Continuous in both importance and influence.
    pub fn profile_for(&self, importance: f64, influence: f64, plateau_height: f64) -> CityProfile {
        let params = TierParams::at(importance, self.config.tier_cut_band);
        let band = self.config.tier_band;

        // Forcing tiers reach the plateau exactly at their threshold and stay on it.
        let forced = smoothstep(params.threshold - band, params.threshold, influence);
        let soft = (smoothstep(params.threshold - band, 1.0, influence) * influence * params.strength).clamp(0.0, 1.0);
        let pull = params.forcing * forced + (1.0 - params.forcing) * soft;

        CityProfile {
            tier: UrbanTier::from_importance(importance),
            params,
            pull: pull.clamp(0.0, 1.0),
            plateau_height,
        }
    }

    pub fn ramp(&self, x: f64, z: f64, influence: f64) -> RampProfile {
        let f = self.config.road_frequency;
        let road = 1.0 - self.roads.get([x * f, z * f]).abs();
        let mask = smoothstep(0.9, 0.98, road);
        let outside_falloff = smoothstep(0.05, 0.6, influence);
        RampProfile {
            height_offset: self.config.ramp_height * mask * outside_falloff,
            slope_factor: mask * outside_falloff,
            outside_falloff,
        }
    }

    /// Apply urban flattening to a natural height.
    pub fn regulate(&self, x: f64, z: f64, natural: f64) -> UrbanSample {
        let influence = self.influence(x, z);
        if influence <= 0.0 {
            return UrbanSample {
                height: natural,
                influence,
                forced_plateau: false,
            };
        }

        let profile = self.profile(x, z, influence);
        let ramp = self.ramp(x, z, influence);
        compose(&profile, &ramp, influence, natural)
    }
}

/// Blend a natural height toward the city target for a given influence.
pub fn compose(profile: &CityProfile, ramp: &RampProfile, influence: f64, natural: f64) -> UrbanSample {
    let target = profile.plateau_height + ramp.height_offset;
    if profile.pull >= 1.0 {
        return UrbanSample {
            height: target,
            influence,
            forced_plateau: true,
        };
    }

    let w = profile.pull;
    // Roads grade through a smoothed weight instead of flattening abruptly.
    let graded = smoothstep(0.0, 1.0, w);
    let w = w + (graded - w) * ramp.slope_factor;

    UrbanSample {
        height: natural + (target - natural) * w,
        influence,
        forced_plateau: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(UrbanTier::Metropolis.plateau_threshold() < UrbanTier::Town.plateau_threshold());
        assert!(UrbanTier::Town.plateau_threshold() < UrbanTier::Village.plateau_threshold());
        assert!(!UrbanTier::Village.forces_plateau());
    }

    const TOWN: f64 = 0.5;
    const METROPOLIS: f64 = 0.9;
    const VILLAGE: f64 = 0.1;

    #[test]
    fn pull_reaches_one_at_threshold() {
        let reg = CityRegulator::new(42, CityConfig::default());
        for importance in [TOWN, METROPOLIS] {
            let threshold = TierParams::at(importance, reg.config().tier_cut_band).threshold;
            let tier = UrbanTier::from_importance(importance);
            assert!((threshold - tier.plateau_threshold()).abs() < 1e-12);
            let p = reg.profile_for(importance, threshold, 6.0);
            assert_eq!(p.pull, 1.0, "{tier:?}");
        }
        // Villages only soften terrain.
        let p = reg.profile_for(VILLAGE, 1.0, 6.0);
        assert!(p.pull < 1.0);
    }

    #[test]
    fn no_cliff_at_forced_threshold() {
        let reg = CityRegulator::new(42, CityConfig::default());
        let ramp_limit = reg.config().ramp_height;
        for importance in [TOWN, METROPOLIS] {
            let t = TierParams::at(importance, reg.config().tier_cut_band).threshold;
            let (below, above) = (t - 1e-6, t + 1e-6);
            let ramp = reg.ramp(0.0, 0.0, t);
            for natural in [-30.0, 0.0, 25.0, 60.0] {
                let a = compose(&reg.profile_for(importance, below, 6.0), &ramp, below, natural);
                let b = compose(&reg.profile_for(importance, above, 6.0), &ramp, above, natural);
                assert!(!a.forced_plateau && b.forced_plateau);
                assert!(
                    (a.height - b.height).abs() <= ramp_limit,
                    "cliff of {} at natural {natural}",
                    (a.height - b.height).abs()
                );
            }
        }
    }

    #[test]
    fn no_cliff_across_tier_boundaries() {
        let reg = CityRegulator::new(42, CityConfig::default());
        let ramp_limit = reg.config().ramp_height;
        let flat = RampProfile {
            height_offset: 0.0,
            slope_factor: 0.0,
            outside_falloff: 1.0,
        };
        let road = RampProfile {
            height_offset: ramp_limit,
            slope_factor: 1.0,
            outside_falloff: 1.0,
        };
        // 0.001 of importance spans well over 0.5 m of ground at the importance noise frequency.
        let step = 0.001;
        for cut in TIER_CUTS {
            for influence in [0.6, 0.8, 0.88, 0.95] {
                for natural in [-30.0, 0.0, 25.0, 60.0] {
                    for ramp in [&flat, &road] {
                        let height = |importance: f64| {
                            compose(&reg.profile_for(importance, influence, 6.0), ramp, influence, natural).height
                        };
                        let mut importance = cut - 0.15;
                        let mut prev = height(importance);
                        while importance < cut + 0.15 {
                            importance += step;
                            let h = height(importance);
                            assert!(
                                (h - prev).abs() < ramp_limit,
                                "step of {} at importance {importance}, influence {influence}",
                                (h - prev).abs()
                            );
                            prev = h;
                        }
                    }
                }
            }
        }

        // The two sides of the Town/Metropolis cut really do sit at different heights.
        let town = compose(&reg.profile_for(TIER_CUTS[1] - 0.15, 0.8, 6.0), &flat, 0.8, 60.0);
        let metro = compose(&reg.profile_for(TIER_CUTS[1] + 0.15, 0.8, 6.0), &flat, 0.8, 60.0);
        assert!(metro.forced_plateau && !town.forced_plateau);
        assert!(town.height - metro.height > ramp_limit);
    }

    #[test]
    fn zero_influence_keeps_natural_height() {
        let reg = CityRegulator::new(42, CityConfig::default());
        let profile = reg.profile(0.0, 0.0, 0.0);
        let ramp = reg.ramp(0.0, 0.0, 0.0);
        let s = compose(&profile, &ramp, 0.0, 12.5);
        assert_eq!(s.height, 12.5);
    }

    #[test]
    fn influence_is_unit_range() {
        let reg = CityRegulator::new(42, CityConfig::default());
        for i in 0..500 {
            let v = reg.influence(i as f64 * 37.0, i as f64 * -23.0);
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
