//! Rotary-wing flight.

use bevy::prelude::*;

use super::{Vehicle, ROTOR_SPEED};
use crate::config::PhysicsConfig;
use crate::physics::body::Body;
use crate::terrain::HeightField;

/// Input magnitude below which the attitude hold engages.
const STICK_DEADZONE: f32 = 0.05;
/// Per-second loss of angular velocity off the rotor axis while leveling.
const LEVEL_DAMPING: f32 = 3.0;
const LANDING_SPIN_KEEP: f32 = 0.5;
const SKID_MARGIN: f32 = 0.1;
/// Visual tilt at full stick in simplified flight (rad).
const VISUAL_TILT: f32 = 0.35;

fn advance_rotor(vehicle: &mut Vehicle, dt: f32) {
    vehicle.rotor_angle = (vehicle.rotor_angle + ROTOR_SPEED * dt).rem_euclid(std::f32::consts::TAU);
}

/// Full mode: lift along the rotor axis, stick torques in the body frame, auto-level, drag.
pub fn apply_rotor_forces(vehicle: &mut Vehicle, body: &mut Body, config: &PhysicsConfig, dt: f32) {
    let def = vehicle.def;
    let input = vehicle.effective_input();
    let piloted = vehicle.has_driver();
    let up = body.up();

    let hover = body.mass * config.gravity * if piloted { 1.0 } else { def.unpiloted_hover };
    let lift = (hover + input.lift * def.lift_force).max(0.0);
    body.velocity += up * (lift / body.mass * dt);

    // Positive stick: nose down, right side down, turn right.
    let stick = Vec3::new(
        -input.pitch * def.pitch_authority,
        -input.yaw * def.yaw_authority,
        -input.roll * def.roll_authority,
    );
    body.angular_velocity += body.rotation * stick * dt;

    if input.pitch.abs() < STICK_DEADZONE && input.roll.abs() < STICK_DEADZONE {
        let tilt = up.y.clamp(-1.0, 1.0).acos();
        if let Some(axis) = up.cross(Vec3::Y).try_normalize() {
            body.angular_velocity += axis * tilt * def.level_rate * dt;
        }
        let spin = up * body.angular_velocity.dot(up);
        let off_axis = body.angular_velocity - spin;
        body.angular_velocity -= off_axis * (LEVEL_DAMPING * dt).min(1.0);
    }

    let drag = if piloted { def.air_drag } else { def.unpiloted_drag };
    body.velocity *= (1.0 - drag * dt).max(0.0);

    advance_rotor(vehicle, dt);
}

/// Simplified flight: hold a target altitude and steer a heading vector.
pub fn fly_simplified(vehicle: &mut Vehicle, body: &mut Body, terrain: &dyn HeightField, dt: f32) {
    let def = vehicle.def;
    let input = vehicle.effective_input();
    let piloted = vehicle.has_driver();
    body.no_gravity = true;

    let ground = terrain.height_at(body.position.x, body.position.z);
    let skid_height = def.half_extents.y;
    if piloted {
        vehicle.target_altitude += input.lift * def.climb_rate * dt;
        vehicle.target_altitude = vehicle.target_altitude.max(ground + def.hover_clearance);
    } else {
        vehicle.target_altitude -= def.climb_rate * 0.5 * dt;
        vehicle.target_altitude = vehicle.target_altitude.max(ground + skid_height);
    }

    let desired_vy = ((vehicle.target_altitude - body.position.y) * 2.0).clamp(-def.climb_rate, def.climb_rate);
    body.velocity.y += (desired_vy - body.velocity.y) * (4.0 * dt).min(1.0);

    vehicle.heading -= input.yaw * def.yaw_rate * dt;
    let forward = Vec3::new(-vehicle.heading.sin(), 0.0, -vehicle.heading.cos());
    let right = Vec3::new(-forward.z, 0.0, forward.x);
    let accel = (forward * input.pitch + right * input.roll) * def.horizontal_accel;
    body.velocity.x += accel.x * dt;
    body.velocity.z += accel.z * dt;

    let drag = if piloted { def.air_drag } else { def.unpiloted_drag };
    let keep = (1.0 - drag * dt).max(0.0);
    let mut horizontal = Vec2::new(body.velocity.x, body.velocity.z) * keep;
    let speed = horizontal.length();
    if speed > def.max_horizontal_speed {
        horizontal *= def.max_horizontal_speed / speed;
    }
    body.velocity.x = horizontal.x;
    body.velocity.z = horizontal.y;

    let target = Vec2::new(-input.pitch, -input.roll) * VISUAL_TILT;
    let blend = (def.level_rate * dt).min(1.0);
    vehicle.tilt_x += (target.x - vehicle.tilt_x) * blend;
    vehicle.tilt_z += (target.y - vehicle.tilt_z) * blend;
    body.rotation = Quat::from_euler(EulerRot::YXZ, vehicle.heading, vehicle.tilt_x, vehicle.tilt_z);
    body.angular_velocity = Vec3::ZERO;

    advance_rotor(vehicle, dt);
}

/// Keep the skids above the terrain and track the grounded state.
pub fn land_on_skids(vehicle: &mut Vehicle, body: &mut Body, terrain: &dyn HeightField, dt: f32) {
    let skid_height = vehicle.def.half_extents.y;
    let ground = vehicle
        .def
        .wheel_offsets
        .iter()
        .map(|o| {
            let p = body.position + body.rotation * *o;
            terrain.height_at(p.x, p.z)
        })
        .fold(terrain.height_at(body.position.x, body.position.z), f32::max);
    let floor = ground + skid_height;

    if body.position.y < floor {
        body.position.y = floor;
        if body.velocity.y < 0.0 {
            body.velocity.y = 0.0;
        }
    }
    let grounded = body.position.y - floor <= SKID_MARGIN;
    if grounded && !vehicle.grounded {
        body.angular_velocity *= LANDING_SPIN_KEEP;
    }
    if grounded {
        let keep = (1.0 - vehicle.def.idle_friction * dt).max(0.0);
        if !vehicle.has_driver() {
            body.velocity.x *= keep;
            body.velocity.z *= keep;
        }
    }
    vehicle.grounded = grounded;
    body.grounded |= grounded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::body::{BodyConfig, BodyHandle};
    use crate::physics::collider::ColliderIndex;
    use crate::physics::integrator::{step_body, StepContext};
    use crate::terrain::FlatTerrain;
    use crate::vehicle::{vehicle_def, DynamicsMode, VehicleId, VehicleInput, VehicleType};

    fn helicopter(mode: DynamicsMode, y: f32) -> (Vehicle, Body) {
        let def = vehicle_def(VehicleType::Helicopter);
        let body = BodyConfig::vehicle(Vec3::new(0.0, y, 0.0), def.half_extents, def.mass)
            .build(BodyHandle(1))
            .unwrap();
        let mut vehicle = Vehicle::new(VehicleId(1), VehicleType::Helicopter, BodyHandle(1), mode);
        vehicle.target_altitude = y;
        (vehicle, body)
    }

    fn run(vehicle: &mut Vehicle, body: &mut Body, steps: usize) {
        let terrain = FlatTerrain::new(0.0);
        let config = PhysicsConfig::default();
        let colliders = ColliderIndex::new(config.chunk_size);
        let mut events = Vec::new();
        for _ in 0..steps {
            crate::vehicle::pre_step(vehicle, body, &terrain, &config, config.fixed_step);
            let ctx = StepContext {
                config: &config,
                terrain: &terrain,
                colliders: &colliders,
                volumes: &[],
            };
            step_body(body, &ctx, config.fixed_step, &mut events);
            crate::vehicle::post_step(vehicle, body, &terrain, &config, config.fixed_step);
        }
    }

    #[test]
    fn piloted_hover_holds_altitude() {
        let (mut vehicle, mut body) = helicopter(DynamicsMode::Full, 50.0);
        vehicle.assign(Some(0), BodyHandle(7)).unwrap();
        run(&mut vehicle, &mut body, 60);
        assert!((body.position.y - 50.0).abs() < 0.01);
    }

    #[test]
    fn unpiloted_helicopter_sinks_and_lands() {
        let (mut vehicle, mut body) = helicopter(DynamicsMode::Full, 30.0);
        run(&mut vehicle, &mut body, 60);
        assert!(body.position.y < 30.0);
        run(&mut vehicle, &mut body, 60 * 20);
        assert!(vehicle.grounded);
        assert!(body.position.y >= vehicle.def.half_extents.y - 1e-3);
    }

    #[test]
    fn collective_climbs() {
        let (mut vehicle, mut body) = helicopter(DynamicsMode::Full, 20.0);
        vehicle.assign(Some(0), BodyHandle(7)).unwrap();
        vehicle.set_input(VehicleInput {
            lift: 1.0,
            ..Default::default()
        });
        run(&mut vehicle, &mut body, 60);
        assert!(body.position.y > 25.0);
    }

    #[test]
    fn forward_stick_tilts_nose_down() {
        let (mut vehicle, mut body) = helicopter(DynamicsMode::Full, 40.0);
        vehicle.assign(Some(0), BodyHandle(7)).unwrap();
        vehicle.set_input(VehicleInput {
            pitch: 1.0,
            ..Default::default()
        });
        run(&mut vehicle, &mut body, 20);
        assert!(body.forward().y < -0.05);
    }

    #[test]
    fn rotor_spin_ignores_pilot_and_ground() {
        let dt = 0.01;
        let (mut parked, _) = helicopter(DynamicsMode::Full, 1.0);
        parked.grounded = true;
        advance_rotor(&mut parked, dt);

        let (mut flown, _) = helicopter(DynamicsMode::Full, 1.0);
        flown.assign(Some(0), BodyHandle(7)).unwrap();
        advance_rotor(&mut flown, dt);

        assert!((parked.rotor_angle - ROTOR_SPEED * dt).abs() < 1e-6);
        assert_eq!(parked.rotor_angle, flown.rotor_angle);
    }

    #[test]
    fn simplified_flight_respects_clearance_and_speed() {
        let (mut vehicle, mut body) = helicopter(DynamicsMode::Simplified, 1.0);
        vehicle.assign(Some(0), BodyHandle(7)).unwrap();
        vehicle.set_input(VehicleInput {
            pitch: 1.0,
            ..Default::default()
        });
        run(&mut vehicle, &mut body, 60 * 10);
        assert!(vehicle.target_altitude >= vehicle.def.hover_clearance);
        assert!(body.horizontal_speed() <= vehicle.def.max_horizontal_speed + 1e-3);
        assert!(body.position.z < -50.0);
        assert!(vehicle.rotor_angle >= 0.0 && vehicle.rotor_angle < std::f32::consts::TAU);
    }
}
