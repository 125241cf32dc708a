//! Simulated bodies and their validated construction.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{non_negative, positive, unit_range};
use crate::error::ConfigError;

/// Character capsule radius (meters)
pub const CHARACTER_RADIUS: f32 = 0.4;
/// Character capsule height (meters)
pub const CHARACTER_HEIGHT: f32 = 1.8;
/// Mass used for characters (kg)
pub const CHARACTER_MASS: f32 = 80.0;

/// cos(50 deg): steeper ground is not walkable
pub const DEFAULT_SLOPE_LIMIT: f32 = 0.643;

/// Stable id of a body inside one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Character,
    Vehicle,
    Prop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyShape {
    Capsule { radius: f32, height: f32 },
    Box { half_extents: Vec3 },
}

impl BodyShape {
    /// Half extents of the axis-aligned box used for collision.
    pub fn half_extents(&self) -> Vec3 {
        match *self {
            BodyShape::Capsule { radius, height } => Vec3::new(radius, height * 0.5, radius),
            BodyShape::Box { half_extents } => half_extents,
        }
    }

    pub fn half_height(&self) -> f32 {
        self.half_extents().y
    }

    /// Diagonal of the principal inertia tensor for a solid box of this size.
    pub fn box_inertia(&self, mass: f32) -> Vec3 {
        let size = self.half_extents() * 2.0;
        let (x2, y2, z2) = (size.x * size.x, size.y * size.y, size.z * size.z);
        Vec3::new(y2 + z2, x2 + z2, x2 + y2) * (mass / 12.0)
    }
}

/// A simulated dynamic entity. `position` is the body center.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub handle: BodyHandle,
    pub kind: BodyKind,
    pub shape: BodyShape,
    pub position: Vec3,
    pub velocity: Vec3,
    pub rotation: Quat,
    pub angular_velocity: Vec3,
    pub mass: f32,
    /// Per-second horizontal velocity loss.
    pub linear_damping: f32,
    /// Angular velocity retained per 1/60 s.
    pub angular_damping: f32,
    /// Per-second horizontal velocity loss while in ground contact.
    pub friction: f32,
    pub restitution: f32,
    /// Minimum ground normal y that counts as walkable.
    pub slope_limit: f32,
    pub grounded: bool,
    pub ground_normal: Vec3,
    pub no_gravity: bool,
    pub no_collisions: bool,
    pub is_vehicle: bool,
    /// Integrate orientation from angular velocity.
    pub angular: bool,
}

impl Body {
    pub fn half_extents(&self) -> Vec3 {
        self.shape.half_extents()
    }

    /// Lowest point of the collision box.
    pub fn feet(&self) -> f32 {
        self.position.y - self.shape.half_height()
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn horizontal_speed(&self) -> f32 {
        Vec2::new(self.velocity.x, self.velocity.z).length()
    }

    /// World-space velocity of a point rigidly attached to the body.
    pub fn point_velocity(&self, point: Vec3) -> Vec3 {
        self.velocity + self.angular_velocity.cross(point - self.position)
    }

    /// Apply a world-space force at a world-space point for `dt` seconds.
    pub fn apply_force_at(&mut self, force: Vec3, point: Vec3, dt: f32) {
        self.velocity += force / self.mass * dt;
        let torque = (point - self.position).cross(force);
        self.apply_torque(torque, dt);
    }

    /// Apply a world-space torque for `dt` seconds using the box inertia.
    pub fn apply_torque(&mut self, torque: Vec3, dt: f32) {
        if !self.angular {
            return;
        }
        let inertia = self.shape.box_inertia(self.mass).max(Vec3::splat(1e-3));
        let local = self.rotation.inverse() * torque;
        self.angular_velocity += self.rotation * (local / inertia) * dt;
    }

    /// Yaw around world Y in the Y-X-Z convention.
    pub fn yaw(&self) -> f32 {
        self.rotation.to_euler(EulerRot::YXZ).0
    }
}

/// Body registration. Every field is optional; `build` fills documented defaults and validates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyConfig {
    /// Default: `Character`.
    pub kind: Option<BodyKind>,
    /// Default: 0.4 x 1.8 capsule.
    pub shape: Option<BodyShape>,
    /// Default: origin.
    pub position: Option<Vec3>,
    /// Default: zero.
    pub velocity: Option<Vec3>,
    /// Default: identity.
    pub rotation: Option<Quat>,
    /// Default: 80 kg.
    pub mass: Option<f32>,
    /// Default: 0 for characters (the controller brakes), 0.05 otherwise.
    pub linear_damping: Option<f32>,
    /// Default: 0.98.
    pub angular_damping: Option<f32>,
    /// Default: 0 for characters, 0.5 otherwise.
    pub friction: Option<f32>,
    /// Default: 0.
    pub restitution: Option<f32>,
    /// Default: cos(50 deg).
    pub slope_limit: Option<f32>,
    /// Default: false.
    pub no_gravity: Option<bool>,
    /// Default: false.
    pub no_collisions: Option<bool>,
    /// Default: true only for `Vehicle` bodies.
    pub angular: Option<bool>,
}

impl BodyConfig {
    pub fn character(position: Vec3) -> Self {
        Self {
            kind: Some(BodyKind::Character),
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn vehicle(position: Vec3, half_extents: Vec3, mass: f32) -> Self {
        Self {
            kind: Some(BodyKind::Vehicle),
            shape: Some(BodyShape::Box { half_extents }),
            position: Some(position),
            mass: Some(mass),
            ..Default::default()
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn without_gravity(mut self) -> Self {
        self.no_gravity = Some(true);
        self
    }

    pub fn build(&self, handle: BodyHandle) -> Result<Body, ConfigError> {
        let kind = self.kind.unwrap_or(BodyKind::Character);
        let is_character = kind == BodyKind::Character;
        let shape = self.shape.unwrap_or(BodyShape::Capsule {
            radius: CHARACTER_RADIUS,
            height: CHARACTER_HEIGHT,
        });
        match shape {
            BodyShape::Capsule { radius, height } => {
                positive("radius", radius)?;
                positive("height", height)?;
            }
            BodyShape::Box { half_extents } => {
                positive("half_extents.x", half_extents.x)?;
                positive("half_extents.y", half_extents.y)?;
                positive("half_extents.z", half_extents.z)?;
            }
        }

        let position = self.position.unwrap_or(Vec3::ZERO);
        let velocity = self.velocity.unwrap_or(Vec3::ZERO);
        if !position.is_finite() {
            return Err(ConfigError::NonFinite {
                field: "position",
                value: position.x + position.y + position.z,
            });
        }
        if !velocity.is_finite() {
            return Err(ConfigError::NonFinite {
                field: "velocity",
                value: velocity.x + velocity.y + velocity.z,
            });
        }

        let mass = self.mass.unwrap_or(CHARACTER_MASS);
        positive("mass", mass)?;
        let linear_damping = self
            .linear_damping
            .unwrap_or(if is_character { 0.0 } else { 0.05 });
        non_negative("linear_damping", linear_damping)?;
        let angular_damping = self.angular_damping.unwrap_or(0.98);
        unit_range("angular_damping", angular_damping)?;
        let friction = self.friction.unwrap_or(if is_character { 0.0 } else { 0.5 });
        non_negative("friction", friction)?;
        let restitution = self.restitution.unwrap_or(0.0);
        unit_range("restitution", restitution)?;
        let slope_limit = self.slope_limit.unwrap_or(DEFAULT_SLOPE_LIMIT);
        unit_range("slope_limit", slope_limit)?;

        let rotation = self.rotation.unwrap_or(Quat::IDENTITY).normalize();

        Ok(Body {
            handle,
            kind,
            shape,
            position,
            velocity,
            rotation,
            angular_velocity: Vec3::ZERO,
            mass,
            linear_damping,
            angular_damping,
            friction,
            restitution,
            slope_limit,
            grounded: false,
            ground_normal: Vec3::Y,
            no_gravity: self.no_gravity.unwrap_or(false),
            no_collisions: self.no_collisions.unwrap_or(false),
            is_vehicle: kind == BodyKind::Vehicle,
            angular: self.angular.unwrap_or(kind == BodyKind::Vehicle),
        })
    }
}
