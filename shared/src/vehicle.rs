//! Vehicle dynamics.
//!
//! A vehicle is one physics body plus seats, tuning and control state. Two families:
//! - Ground vehicles (tank, jeep): four wheel contacts with spring-damper suspension
//! - Rotary aircraft (helicopter): lift along the body up axis, control torques
//!
//! `DynamicsMode::Full` is the force-based model used for directly controlled vehicles.
//! `DynamicsMode::Simplified` is the cheaper terrain-follow / direct-velocity fallback.

pub mod aircraft;
pub mod ground;
pub mod weapons;

use std::fmt;
use std::str::FromStr;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::PhysicsConfig;
use crate::error::{SeatError, SpawnError};
use crate::physics::body::{Body, BodyHandle};
use crate::terrain::HeightField;
use ground::WheelContact;
use weapons::WeaponRack;

/// Max distance from a vehicle center at which a character may enter it.
pub const INTERACTION_RADIUS: f32 = 6.0;

/// Rotor visual spin rate (rad/s)
pub const ROTOR_SPEED: f32 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VehicleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Tank,
    Jeep,
    Helicopter,
}

impl VehicleType {
    pub const ALL: [VehicleType; 3] = [VehicleType::Tank, VehicleType::Jeep, VehicleType::Helicopter];

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleType::Tank => "tank",
            VehicleType::Jeep => "jeep",
            VehicleType::Helicopter => "helicopter",
        }
    }

    pub fn is_aircraft(self) -> bool {
        matches!(self, VehicleType::Helicopter)
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = SpawnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tank" => Ok(VehicleType::Tank),
            "jeep" => Ok(VehicleType::Jeep),
            "helicopter" | "heli" => Ok(VehicleType::Helicopter),
            _ => Err(SpawnError::UnknownVehicleType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DynamicsMode {
    #[default]
    Full,
    Simplified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatRole {
    Driver,
    Pilot,
    Gunner,
    Passenger,
}

impl SeatRole {
    /// Whether this seat's input drives the vehicle.
    pub fn controls(self) -> bool {
        matches!(self, SeatRole::Driver | SeatRole::Pilot)
    }
}

/// A seat holds a non-owning handle to its occupant's body.
#[derive(Debug, Clone, PartialEq)]
pub struct Seat {
    pub role: SeatRole,
    /// Local-space offset from the chassis center.
    pub offset: Vec3,
    pub occupant: Option<BodyHandle>,
}

/// Control input. Axes are clamped to [-1, 1] when stored.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInput {
    #[serde(default)]
    pub throttle: f32,
    #[serde(default)]
    pub steer: f32,
    #[serde(default)]
    pub brake: bool,
    #[serde(default)]
    pub lift: f32,
    #[serde(default)]
    pub pitch: f32,
    #[serde(default)]
    pub roll: f32,
    #[serde(default)]
    pub yaw: f32,
}

impl VehicleInput {
    pub fn sanitized(self) -> Self {
        let axis = |v: f32| if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
        Self {
            throttle: axis(self.throttle),
            steer: axis(self.steer),
            brake: self.brake,
            lift: axis(self.lift),
            pitch: axis(self.pitch),
            roll: axis(self.roll),
            yaw: axis(self.yaw),
        }
    }
}

/// Tuning values for a vehicle type.
#[derive(Clone, Copy, Debug)]
pub struct VehicleDef {
    pub mass: f32,
    pub half_extents: Vec3,
    /// Suspension mounts (ground) or skid points (aircraft): FL, FR, RL, RR. -Z is forward.
    pub wheel_offsets: [Vec3; 4],
    pub wheel_radius: f32,
    /// Mount-to-ground distance at which the spring is unloaded.
    pub rest_length: f32,
    pub stiffness: f32,
    pub damping: f32,
    pub engine_force: f32,
    pub brake_force: f32,
    pub max_steer: f32,
    /// Lateral slip rejection rate (1/s) before the friction cone clamp.
    pub lateral_grip: f32,
    pub drag_coefficient: f32,
    pub rolling_resistance: f32,
    pub engine_brake_driver: f32,
    pub engine_brake_idle: f32,
    /// Horizontal speed loss per second for grounded unoccupied vehicles.
    pub idle_friction: f32,
    /// Tilt beyond which grounded, upright vehicles are clamped (rad).
    pub max_tilt: f32,
    /// Angular speed above which the tilt clamp is skipped, so rollovers can happen.
    pub fast_roll_speed: f32,
    pub righting_rate: f32,
    pub recovery_rate: f32,
    pub flipped_drag: f32,
    pub tilt_stiffness: f32,
    pub tilt_damping: f32,
    pub turn_rate: f32,
    /// Extra lift at full collective (N).
    pub lift_force: f32,
    /// Fraction of hover lift kept with nobody at the controls.
    pub unpiloted_hover: f32,
    pub pitch_authority: f32,
    pub roll_authority: f32,
    pub yaw_authority: f32,
    pub level_rate: f32,
    pub air_drag: f32,
    pub unpiloted_drag: f32,
    pub hover_clearance: f32,
    pub climb_rate: f32,
    pub max_horizontal_speed: f32,
    pub horizontal_accel: f32,
    pub yaw_rate: f32,
    pub seats: &'static [(SeatRole, Vec3)],
}

const TANK_SEATS: &[(SeatRole, Vec3)] = &[
    (SeatRole::Driver, Vec3::new(0.0, 0.9, -0.8)),
    (SeatRole::Gunner, Vec3::new(0.0, 1.4, 0.4)),
];

const JEEP_SEATS: &[(SeatRole, Vec3)] = &[
    (SeatRole::Driver, Vec3::new(-0.45, 0.6, -0.2)),
    (SeatRole::Passenger, Vec3::new(0.45, 0.6, -0.2)),
    (SeatRole::Gunner, Vec3::new(0.0, 1.1, 1.2)),
];

const HELICOPTER_SEATS: &[(SeatRole, Vec3)] = &[
    (SeatRole::Pilot, Vec3::new(0.0, 0.3, -1.8)),
    (SeatRole::Gunner, Vec3::new(0.0, 0.3, -0.6)),
    (SeatRole::Passenger, Vec3::new(-0.6, 0.3, 0.8)),
    (SeatRole::Passenger, Vec3::new(0.6, 0.3, 0.8)),
];

pub fn vehicle_def(vehicle_type: VehicleType) -> VehicleDef {
    match vehicle_type {
        VehicleType::Tank => VehicleDef {
            mass: 3000.0,
            half_extents: Vec3::new(1.6, 0.6, 3.0),
            wheel_offsets: [
                Vec3::new(-1.4, 0.0, -2.2),
                Vec3::new(1.4, 0.0, -2.2),
                Vec3::new(-1.4, 0.0, 2.2),
                Vec3::new(1.4, 0.0, 2.2),
            ],
            wheel_radius: 0.45,
            rest_length: 1.2,
            stiffness: 300_000.0,
            damping: 28_000.0,
            engine_force: 45_000.0,
            brake_force: 60_000.0,
            max_steer: 0.45,
            lateral_grip: 8.0,
            drag_coefficient: 2.0,
            rolling_resistance: 1500.0,
            engine_brake_driver: 3000.0,
            engine_brake_idle: 1000.0,
            idle_friction: 1.5,
            max_tilt: 35f32.to_radians(),
            fast_roll_speed: 4.0,
            righting_rate: 1.5,
            recovery_rate: 2.0,
            flipped_drag: 3.0,
            tilt_stiffness: 60.0,
            tilt_damping: 14.0,
            turn_rate: 0.9,
            lift_force: 0.0,
            unpiloted_hover: 0.0,
            pitch_authority: 0.0,
            roll_authority: 0.0,
            yaw_authority: 0.0,
            level_rate: 0.0,
            air_drag: 0.0,
            unpiloted_drag: 0.0,
            hover_clearance: 0.0,
            climb_rate: 0.0,
            max_horizontal_speed: 18.0,
            horizontal_accel: 0.0,
            yaw_rate: 0.0,
            seats: TANK_SEATS,
        },
        VehicleType::Jeep => VehicleDef {
            mass: 1400.0,
            half_extents: Vec3::new(1.0, 0.5, 2.1),
            wheel_offsets: [
                Vec3::new(-0.9, 0.0, -1.5),
                Vec3::new(0.9, 0.0, -1.5),
                Vec3::new(-0.9, 0.0, 1.5),
                Vec3::new(0.9, 0.0, 1.5),
            ],
            wheel_radius: 0.38,
            rest_length: 0.9,
            stiffness: 110_000.0,
            damping: 9_000.0,
            engine_force: 16_000.0,
            brake_force: 20_000.0,
            max_steer: 0.55,
            lateral_grip: 10.0,
            drag_coefficient: 0.8,
            rolling_resistance: 400.0,
            engine_brake_driver: 900.0,
            engine_brake_idle: 300.0,
            idle_friction: 1.2,
            max_tilt: 35f32.to_radians(),
            fast_roll_speed: 3.5,
            righting_rate: 1.2,
            recovery_rate: 2.5,
            flipped_drag: 3.0,
            tilt_stiffness: 80.0,
            tilt_damping: 16.0,
            turn_rate: 1.6,
            lift_force: 0.0,
            unpiloted_hover: 0.0,
            pitch_authority: 0.0,
            roll_authority: 0.0,
            yaw_authority: 0.0,
            level_rate: 0.0,
            air_drag: 0.0,
            unpiloted_drag: 0.0,
            hover_clearance: 0.0,
            climb_rate: 0.0,
            max_horizontal_speed: 32.0,
            horizontal_accel: 0.0,
            yaw_rate: 0.0,
            seats: JEEP_SEATS,
        },
        VehicleType::Helicopter => VehicleDef {
            mass: 2000.0,
            half_extents: Vec3::new(1.2, 1.0, 4.0),
            wheel_offsets: [
                Vec3::new(-1.0, -1.0, -1.5),
                Vec3::new(1.0, -1.0, -1.5),
                Vec3::new(-1.0, -1.0, 1.5),
                Vec3::new(1.0, -1.0, 1.5),
            ],
            wheel_radius: 0.0,
            rest_length: 0.0,
            stiffness: 0.0,
            damping: 0.0,
            engine_force: 0.0,
            brake_force: 0.0,
            max_steer: 0.0,
            lateral_grip: 3.0,
            drag_coefficient: 0.0,
            rolling_resistance: 0.0,
            engine_brake_driver: 0.0,
            engine_brake_idle: 0.0,
            idle_friction: 2.0,
            max_tilt: 35f32.to_radians(),
            fast_roll_speed: 4.0,
            righting_rate: 0.0,
            recovery_rate: 0.0,
            flipped_drag: 0.0,
            tilt_stiffness: 0.0,
            tilt_damping: 0.0,
            turn_rate: 0.0,
            lift_force: 40_000.0,
            unpiloted_hover: 0.85,
            pitch_authority: 2.5,
            roll_authority: 2.5,
            yaw_authority: 1.8,
            level_rate: 2.0,
            air_drag: 0.3,
            unpiloted_drag: 0.8,
            hover_clearance: 3.0,
            climb_rate: 8.0,
            max_horizontal_speed: 45.0,
            horizontal_accel: 14.0,
            yaw_rate: 1.4,
            seats: HELICOPTER_SEATS,
        },
    }
}

/// A vehicle: body handle, seats, control and visual state.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub id: VehicleId,
    pub kind: VehicleType,
    pub body: BodyHandle,
    pub mode: DynamicsMode,
    pub def: VehicleDef,
    pub seats: Vec<Seat>,
    pub input: VehicleInput,
    pub weapons: WeaponRack,
    /// Yaw (rad), -Z forward at 0.
    pub heading: f32,
    /// Pitch (rad).
    pub tilt_x: f32,
    /// Roll (rad).
    pub tilt_z: f32,
    pub tilt_rate: Vec2,
    pub target_altitude: f32,
    pub rotor_angle: f32,
    pub grounded: bool,
    pub wheels: [WheelContact; 4],
    /// Driven by the network rather than simulated here.
    pub remote: bool,
}

impl Vehicle {
    pub fn new(id: VehicleId, kind: VehicleType, body: BodyHandle, mode: DynamicsMode) -> Self {
        let def = vehicle_def(kind);
        Self {
            id,
            kind,
            body,
            mode,
            seats: def
                .seats
                .iter()
                .map(|&(role, offset)| Seat {
                    role,
                    offset,
                    occupant: None,
                })
                .collect(),
            def,
            input: VehicleInput::default(),
            weapons: WeaponRack::default(),
            heading: 0.0,
            tilt_x: 0.0,
            tilt_z: 0.0,
            tilt_rate: Vec2::ZERO,
            target_altitude: 0.0,
            rotor_angle: 0.0,
            grounded: false,
            wheels: [WheelContact::default(); 4],
            remote: false,
        }
    }

    /// Body occupying seat 0, the controlling seat.
    pub fn driver(&self) -> Option<BodyHandle> {
        self.seats.first().and_then(|s| s.occupant)
    }

    pub fn has_driver(&self) -> bool {
        self.driver().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.iter().all(|s| s.occupant.is_none())
    }

    pub fn seat_of(&self, body: BodyHandle) -> Option<usize> {
        self.seats.iter().position(|s| s.occupant == Some(body))
    }

    pub fn occupants(&self) -> impl Iterator<Item = (usize, BodyHandle)> + '_ {
        self.seats
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.occupant.map(|b| (i, b)))
    }

    /// Resolve a seat request without changing anything.
    pub fn pick_seat(&self, requested: Option<usize>) -> Result<usize, SeatError> {
        match requested {
            Some(i) => match self.seats.get(i) {
                None => Err(SeatError::Unavailable(i)),
                Some(seat) if seat.occupant.is_some() => Err(SeatError::Occupied(i)),
                Some(_) => Ok(i),
            },
            None => self
                .seats
                .iter()
                .position(|s| s.occupant.is_none())
                .ok_or(SeatError::Full),
        }
    }

    /// Put `body` in a seat. Leaves the vehicle untouched on error.
    pub fn assign(&mut self, requested: Option<usize>, body: BodyHandle) -> Result<usize, SeatError> {
        let index = self.pick_seat(requested)?;
        self.seats[index].occupant = Some(body);
        Ok(index)
    }

    /// Clear every seat held by `body`. Returns the freed seat, if any.
    pub fn release(&mut self, body: BodyHandle) -> Option<usize> {
        let index = self.seat_of(body)?;
        self.seats[index].occupant = None;
        if index == 0 {
            self.input = VehicleInput::default();
        }
        Some(index)
    }

    pub fn set_input(&mut self, input: VehicleInput) {
        self.input = input.sanitized();
    }

    /// Input actually applied this step: nothing without a driver.
    pub fn effective_input(&self) -> VehicleInput {
        if self.has_driver() {
            self.input
        } else {
            VehicleInput::default()
        }
    }

    /// World position of a seat.
    pub fn seat_position(&self, body: &Body, index: usize) -> Option<Vec3> {
        self.seats
            .get(index)
            .map(|s| body.position + body.rotation * s.offset)
    }

    /// Refresh heading/tilt from the body orientation.
    pub fn sync_pose(&mut self, body: &Body) {
        let (yaw, pitch, roll) = body.rotation.to_euler(EulerRot::YXZ);
        self.heading = yaw;
        self.tilt_x = pitch;
        self.tilt_z = roll;
    }
}

/// Forces and control applied before the integrator moves the body.
pub fn pre_step(
    vehicle: &mut Vehicle,
    body: &mut Body,
    terrain: &dyn HeightField,
    config: &PhysicsConfig,
    dt: f32,
) {
    vehicle.weapons.tick(dt);
    if vehicle.remote {
        return;
    }
    match (vehicle.kind.is_aircraft(), vehicle.mode) {
        (false, DynamicsMode::Full) => ground::apply_suspension(vehicle, body, terrain, config.gravity, dt),
        (false, DynamicsMode::Simplified) => ground::drive_simplified(vehicle, body, dt),
        (true, DynamicsMode::Full) => aircraft::apply_rotor_forces(vehicle, body, config, dt),
        (true, DynamicsMode::Simplified) => aircraft::fly_simplified(vehicle, body, terrain, dt),
    }
}

/// Contact constraints and attitude handling after the integrator moved the body.
pub fn post_step(
    vehicle: &mut Vehicle,
    body: &mut Body,
    terrain: &dyn HeightField,
    config: &PhysicsConfig,
    dt: f32,
) {
    if vehicle.remote {
        return;
    }
    match (vehicle.kind.is_aircraft(), vehicle.mode) {
        (false, DynamicsMode::Full) => ground::settle_chassis(vehicle, body, terrain, dt),
        (false, DynamicsMode::Simplified) => ground::follow_terrain(vehicle, body, terrain, config, dt),
        (true, _) => aircraft::land_on_skids(vehicle, body, terrain, dt),
    }
    if vehicle.mode == DynamicsMode::Full {
        vehicle.sync_pose(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tank() -> Vehicle {
        Vehicle::new(VehicleId(1), VehicleType::Tank, BodyHandle(10), DynamicsMode::Full)
    }

    #[test]
    fn parses_vehicle_types() {
        assert_eq!("Tank".parse::<VehicleType>(), Ok(VehicleType::Tank));
        assert_eq!(" helicopter ".parse::<VehicleType>(), Ok(VehicleType::Helicopter));
        assert_eq!(
            "boat".parse::<VehicleType>(),
            Err(SpawnError::UnknownVehicleType("boat".into()))
        );
    }

    #[test]
    fn occupied_seat_is_rejected() {
        let mut v = tank();
        assert_eq!(v.assign(Some(0), BodyHandle(1)), Ok(0));
        assert_eq!(v.assign(Some(0), BodyHandle(2)), Err(SeatError::Occupied(0)));
        assert_eq!(v.seats[0].occupant, Some(BodyHandle(1)));
        assert_eq!(v.assign(Some(7), BodyHandle(2)), Err(SeatError::Unavailable(7)));
    }

    #[test]
    fn first_free_seat_then_full() {
        let mut v = tank();
        assert_eq!(v.assign(None, BodyHandle(1)), Ok(0));
        assert_eq!(v.assign(None, BodyHandle(2)), Ok(1));
        assert_eq!(v.assign(None, BodyHandle(3)), Err(SeatError::Full));
        assert_eq!(v.occupants().count(), 2);
    }

    #[test]
    fn release_clears_handle_and_controls() {
        let mut v = tank();
        v.assign(Some(0), BodyHandle(1)).unwrap();
        v.set_input(VehicleInput {
            throttle: 3.0,
            ..Default::default()
        });
        assert_eq!(v.input.throttle, 1.0);
        assert_eq!(v.release(BodyHandle(1)), Some(0));
        assert_eq!(v.release(BodyHandle(1)), None);
        assert!(v.is_empty());
        assert_eq!(v.effective_input(), VehicleInput::default());
    }

    #[test]
    fn nan_input_is_zeroed() {
        let input = VehicleInput {
            steer: f32::NAN,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(input.steer, 0.0);
    }
}
