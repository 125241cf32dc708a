//! Vehicle-mounted weapons: seat-to-weapon mapping, cooldowns and bomb ballistics.
//!
//! Firing produces a `SimEvent`; hit detection and damage happen outside the physics core.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::{SeatRole, VehicleId, VehicleType};
use crate::terrain::HeightField;

/// Bomb air drag (velocity-squared model)
pub const BOMB_DRAG_COEFFICIENT: f32 = 0.0004;
/// Bombs that never hit anything are dropped after this long (s)
pub const BOMB_MAX_LIFETIME: f32 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaponKind {
    MainCannon,
    MachineGun,
    Bomb,
}

impl WeaponKind {
    pub const ALL: [WeaponKind; 3] = [WeaponKind::MainCannon, WeaponKind::MachineGun, WeaponKind::Bomb];

    /// Seconds between shots.
    pub fn cooldown(self) -> f32 {
        match self {
            WeaponKind::MainCannon => 2.5,
            WeaponKind::MachineGun => 0.1,
            WeaponKind::Bomb => 1.5,
        }
    }

    /// Initial projectile speed relative to the vehicle (m/s).
    pub fn muzzle_speed(self) -> f32 {
        match self {
            WeaponKind::MainCannon => 300.0,
            WeaponKind::MachineGun => 600.0,
            WeaponKind::Bomb => 0.0,
        }
    }

    fn slot(self) -> usize {
        match self {
            WeaponKind::MainCannon => 0,
            WeaponKind::MachineGun => 1,
            WeaponKind::Bomb => 2,
        }
    }
}

/// Weapon operated from a seat, if any.
pub fn weapon_for(vehicle: VehicleType, role: SeatRole) -> Option<WeaponKind> {
    match (vehicle, role) {
        (VehicleType::Tank, SeatRole::Driver) => Some(WeaponKind::MainCannon),
        (VehicleType::Tank, SeatRole::Gunner) => Some(WeaponKind::MachineGun),
        (VehicleType::Jeep, SeatRole::Gunner) => Some(WeaponKind::MachineGun),
        (VehicleType::Helicopter, SeatRole::Pilot) => Some(WeaponKind::MachineGun),
        (VehicleType::Helicopter, SeatRole::Gunner) => Some(WeaponKind::Bomb),
        _ => None,
    }
}

/// Per-vehicle cooldown timers.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeaponRack {
    cooldowns: [f32; 3],
}

impl WeaponRack {
    pub fn tick(&mut self, dt: f32) {
        for c in &mut self.cooldowns {
            *c = (*c - dt).max(0.0);
        }
    }

    pub fn remaining(&self, weapon: WeaponKind) -> f32 {
        self.cooldowns[weapon.slot()]
    }

    /// Starts the cooldown and returns true when the weapon is ready; otherwise does nothing.
    pub fn try_fire(&mut self, weapon: WeaponKind) -> bool {
        let slot = &mut self.cooldowns[weapon.slot()];
        if *slot > 0.0 {
            return false;
        }
        *slot = weapon.cooldown();
        true
    }
}

/// A released bomb.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projectile {
    pub id: u32,
    pub vehicle: VehicleId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub age: f32,
}

pub enum ProjectileStep {
    Flying,
    Impact(Vec3),
    Expired,
}

/// Advance a bomb one step: gravity, drag, terrain impact.
pub fn step_projectile(p: &mut Projectile, gravity: f32, terrain: &dyn HeightField, dt: f32) -> ProjectileStep {
    p.velocity.y -= gravity * dt;
    let speed = p.velocity.length();
    if speed > 0.1 {
        p.velocity -= p.velocity / speed * BOMB_DRAG_COEFFICIENT * speed * speed * dt;
    }
    p.position += p.velocity * dt;
    p.age += dt;

    let ground = terrain.height_at(p.position.x, p.position.z);
    if p.position.y <= ground {
        p.position.y = ground;
        return ProjectileStep::Impact(p.position);
    }
    if p.age >= BOMB_MAX_LIFETIME {
        return ProjectileStep::Expired;
    }
    ProjectileStep::Flying
}
