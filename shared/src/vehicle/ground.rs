//! Wheeled/tracked ground vehicles.
//!
//! Full mode: each of the four wheels is a spring-damper along the chassis up axis with a
//! tire force clamped to the friction cone `mu * N`. Simplified mode: the chassis follows the
//! terrain under the wheel points with a sprung tilt and direct velocity control.

use bevy::prelude::*;

use super::{Vehicle, VehicleDef};
use crate::config::PhysicsConfig;
use crate::physics::body::Body;
use crate::terrain::HeightField;

/// Extra clearance above rest length that still counts as ground contact.
pub const GROUND_MARGIN: f32 = 0.15;
/// No wheel contact when the chassis up axis is flatter than this.
pub const MIN_CONTACT_UP: f32 = 0.3;
/// Share of engine, brake and weight per wheel.
const WHEEL_SHARE: f32 = 0.25;
const FLOOR_BOUNCE: f32 = 0.1;
const MIN_FLOOR_BOUNCE_SPEED: f32 = 0.5;
const LANDING_SPIN_KEEP: f32 = 0.7;
/// Share of the tilt spring used to level an unoccupied chassis in the air.
const IDLE_LEVEL_WEIGHT: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelContact {
    pub compression: f32,
    /// Suspension force (N), never negative.
    pub force: f32,
    pub point: Vec3,
    pub grounded: bool,
}

/// Spring-damper output. Suspension only pushes.
pub fn suspension_force(def: &VehicleDef, compression: f32, compression_velocity: f32) -> f32 {
    (def.stiffness * compression + def.damping * compression_velocity).max(0.0)
}

/// Compression of one spring carrying its share of the chassis weight.
pub fn static_sag(def: &VehicleDef, gravity: f32) -> f32 {
    if def.stiffness <= 0.0 {
        return 0.0;
    }
    def.mass * gravity * WHEEL_SHARE / def.stiffness
}

/// Unloaded spring length. Springs are measured from here so that the loaded chassis
/// rides at exactly `rest_length` above flat ground.
pub fn free_length(def: &VehicleDef, gravity: f32) -> f32 {
    def.rest_length + static_sag(def, gravity)
}

fn mount_points(def: &VehicleDef, body: &Body) -> [Vec3; 4] {
    def.wheel_offsets.map(|o| body.position + body.rotation * o)
}

/// Velocity change that cancels `speed` along a direction, capped at `limit` force.
fn opposing_force(speed: f32, limit: f32, mass: f32, dt: f32) -> f32 {
    if dt <= 0.0 {
        return 0.0;
    }
    limit.min(speed.abs() * mass / dt)
}

/// Full-mode forces: suspension, tires, drive/brake, drag, rolling resistance and engine brake.
pub fn apply_suspension(vehicle: &mut Vehicle, body: &mut Body, terrain: &dyn HeightField, gravity: f32, dt: f32) {
    let def = vehicle.def;
    let spring_length = free_length(&def, gravity);
    let input = vehicle.effective_input();
    let occupied = vehicle.has_driver();
    let up = body.up();
    let forward = body.forward();
    let mounts = mount_points(&def, body);

    let mut contacts = [WheelContact::default(); 4];
    let mut wheels_down = 0;

    for (i, mount) in mounts.iter().enumerate() {
        if up.y < MIN_CONTACT_UP {
            continue;
        }
        let ground = terrain.height_at(mount.x, mount.z);
        let distance = (mount.y - ground) / up.y;
        if distance > spring_length {
            continue;
        }
        let compression = (spring_length - distance).min(spring_length);
        let point = *mount - up * distance;
        let point_velocity = body.point_velocity(point);
        let compression_velocity = -point_velocity.dot(up);
        let load = suspension_force(&def, compression, compression_velocity);

        let steer = if i < 2 { input.steer * def.max_steer } else { 0.0 };
        let steered = Quat::from_axis_angle(up, -steer) * forward;
        let wheel_forward = (steered - up * steered.dot(up)).normalize_or_zero();
        let wheel_right = wheel_forward.cross(up);

        let mu = terrain.surface_friction(point.x as f64, point.z as f64) as f32;
        let max_tire = mu * load;
        let long_speed = point_velocity.dot(wheel_forward);
        let lat_speed = point_velocity.dot(wheel_right);
        let wheel_mass = body.mass * WHEEL_SHARE;

        let longitudinal = if input.brake {
            -long_speed.signum() * opposing_force(long_speed, def.brake_force * WHEEL_SHARE, wheel_mass, dt)
        } else {
            input.throttle * def.engine_force * WHEEL_SHARE
        }
        .clamp(-max_tire, max_tire);
        let lateral = (-lat_speed * def.lateral_grip * wheel_mass).clamp(-max_tire, max_tire);

        let force = up * load + wheel_forward * longitudinal + wheel_right * lateral;
        body.apply_force_at(force, point, dt);

        contacts[i] = WheelContact {
            compression,
            force: load,
            point,
            grounded: true,
        };
        wheels_down += 1;
    }

    let horizontal = Vec3::new(body.velocity.x, 0.0, body.velocity.z);
    let speed = horizontal.length();
    if speed > 0.01 {
        let dir = horizontal / speed;
        let mut resist = def.drag_coefficient * speed * speed;
        if wheels_down > 0 {
            resist += def.rolling_resistance;
            if input.throttle.abs() < 0.1 {
                resist += if occupied {
                    def.engine_brake_driver
                } else {
                    def.engine_brake_idle
                };
            }
        }
        let resist = opposing_force(speed, resist, body.mass, dt);
        body.velocity -= dir * resist / body.mass * dt;
    }

    vehicle.wheels = contacts;
}

/// Full-mode contact handling after integration.
pub fn settle_chassis(vehicle: &mut Vehicle, body: &mut Body, terrain: &dyn HeightField, dt: f32) {
    let def = vehicle.def;
    let mounts = mount_points(&def, body);

    let mut lift = 0.0f32;
    let mut ground_sum = 0.0;
    for mount in &mounts {
        let ground = terrain.height_at(mount.x, mount.z);
        ground_sum += ground;
        lift = lift.max(ground + def.wheel_radius - mount.y);
    }
    if lift > 0.0 {
        body.position.y += lift;
        if body.velocity.y < 0.0 {
            let bounce = -body.velocity.y * FLOOR_BOUNCE;
            body.velocity.y = if bounce < MIN_FLOOR_BOUNCE_SPEED { 0.0 } else { bounce };
        }
    }

    let average = ground_sum / mounts.len() as f32;
    let grounded = body.position.y - average <= def.rest_length + GROUND_MARGIN;
    body.grounded |= grounded;
    if grounded && !vehicle.grounded {
        body.angular_velocity *= LANDING_SPIN_KEEP;
    }
    vehicle.grounded = grounded;

    let up = body.up();
    let tilt = up.y.clamp(-1.0, 1.0).acos();
    // Rotating about this axis by a positive angle brings `up` back toward world up.
    let level_axis = up.cross(Vec3::Y).try_normalize().unwrap_or(body.forward());

    if !grounded && !vehicle.has_driver() && tilt <= std::f32::consts::FRAC_PI_2 {
        let rate = body.angular_velocity.dot(level_axis);
        let accel = tilt * def.tilt_stiffness - rate * def.tilt_damping;
        body.angular_velocity += level_axis * accel * IDLE_LEVEL_WEIGHT * dt;
    } else if !grounded {
        body.angular_velocity += level_axis * def.righting_rate * tilt * dt;
    } else if tilt > std::f32::consts::FRAC_PI_2 {
        body.angular_velocity += level_axis * def.recovery_rate * dt;
        let keep = (1.0 - def.flipped_drag * dt).max(0.0);
        body.velocity.x *= keep;
        body.velocity.z *= keep;
    } else if tilt > def.max_tilt && body.angular_velocity.length() < def.fast_roll_speed {
        body.rotation = (Quat::from_axis_angle(level_axis, tilt - def.max_tilt) * body.rotation).normalize();
        let toward_tilt = body.angular_velocity.dot(level_axis);
        if toward_tilt < 0.0 {
            body.angular_velocity -= level_axis * toward_tilt;
        }
    }

    if grounded && !vehicle.has_driver() {
        let keep = (1.0 - def.idle_friction * dt).max(0.0);
        body.velocity.x *= keep;
        body.velocity.z *= keep;
    }
}

/// Simplified drive: heading and horizontal velocity set directly from input.
pub fn drive_simplified(vehicle: &mut Vehicle, body: &mut Body, dt: f32) {
    let def = vehicle.def;
    let input = vehicle.effective_input();
    let heading_dir = Vec3::new(-vehicle.heading.sin(), 0.0, -vehicle.heading.cos());
    let forward_speed = body.velocity.dot(heading_dir);

    let turn_scale = (forward_speed.abs() / 5.0).min(1.0) * forward_speed.signum();
    vehicle.heading -= input.steer * def.turn_rate * turn_scale * dt;

    if !vehicle.grounded {
        return;
    }
    let forward = Vec3::new(-vehicle.heading.sin(), 0.0, -vehicle.heading.cos());
    let right = Vec3::new(-forward.z, 0.0, forward.x);
    let mut along = body.velocity.dot(forward);
    let mut side = body.velocity.dot(right);

    if input.brake {
        along -= along.signum() * (def.brake_force / def.mass * dt).min(along.abs());
    } else {
        along += input.throttle * def.engine_force / def.mass * dt;
    }
    let resist = if input.throttle.abs() < 0.1 {
        if vehicle.has_driver() {
            def.engine_brake_driver + def.rolling_resistance
        } else {
            def.engine_brake_idle + def.rolling_resistance + def.idle_friction * def.mass
        }
    } else {
        def.rolling_resistance
    };
    along -= along.signum() * (resist / def.mass * dt).min(along.abs());
    along = along.clamp(-def.max_horizontal_speed * 0.5, def.max_horizontal_speed);
    side *= (-def.lateral_grip * dt).exp();

    let horizontal = forward * along + right * side;
    body.velocity.x = horizontal.x;
    body.velocity.z = horizontal.z;
}

/// Simplified contact: ride height and sprung tilt toward the terrain under the wheels.
pub fn follow_terrain(
    vehicle: &mut Vehicle,
    body: &mut Body,
    terrain: &dyn HeightField,
    config: &PhysicsConfig,
    dt: f32,
) {
    let def = vehicle.def;
    let yaw = Quat::from_rotation_y(vehicle.heading);
    let h = def
        .wheel_offsets
        .map(|o| {
            let p = body.position + yaw * o;
            terrain.height_at(p.x, p.z)
        });
    let [fl, fr, rl, rr] = h;
    let wheel_base = (def.wheel_offsets[2].z - def.wheel_offsets[0].z).abs().max(0.1);
    let track = (def.wheel_offsets[1].x - def.wheel_offsets[0].x).abs().max(0.1);
    let target_pitch = ((fl + fr) * 0.5 - (rl + rr) * 0.5).atan2(wheel_base);
    let target_roll = ((fr + rr) * 0.5 - (fl + rl) * 0.5).atan2(track);

    let average = (fl + fr + rl + rr) * 0.25;
    let ride = average + def.rest_length;
    let grounded = body.position.y <= ride + GROUND_MARGIN;
    if grounded {
        body.position.y = body.position.y.max(ride);
        if body.velocity.y < 0.0 {
            body.velocity.y = 0.0;
        }
    }
    if grounded && !vehicle.grounded {
        vehicle.tilt_rate *= LANDING_SPIN_KEEP;
    }
    vehicle.grounded = grounded;
    body.grounded |= grounded;

    let (target, weight) = if grounded {
        (Vec2::new(target_pitch, target_roll), 1.0)
    } else if vehicle.has_driver() {
        (Vec2::new(target_pitch, target_roll), 0.3)
    } else {
        (Vec2::ZERO, IDLE_LEVEL_WEIGHT)
    };
    let tilt = Vec2::new(vehicle.tilt_x, vehicle.tilt_z);
    let accel = (target - tilt) * def.tilt_stiffness - vehicle.tilt_rate * def.tilt_damping;
    vehicle.tilt_rate += accel * weight * dt;
    let tilt = tilt + vehicle.tilt_rate * dt;
    vehicle.tilt_x = tilt.x.clamp(-def.max_tilt, def.max_tilt);
    vehicle.tilt_z = tilt.y.clamp(-def.max_tilt, def.max_tilt);

    body.rotation = Quat::from_euler(EulerRot::YXZ, vehicle.heading, vehicle.tilt_x, vehicle.tilt_z);
    body.angular_velocity = Vec3::ZERO;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::body::{BodyConfig, BodyHandle};
    use crate::physics::integrator::{step_body, StepContext};
    use crate::physics::collider::ColliderIndex;
    use crate::terrain::FlatTerrain;
    use crate::vehicle::{vehicle_def, DynamicsMode, VehicleId, VehicleInput, VehicleType};

    fn spawn(kind: VehicleType, mode: DynamicsMode, y: f32) -> (Vehicle, Body) {
        let def = vehicle_def(kind);
        let mut body = BodyConfig::vehicle(Vec3::new(0.0, y, 0.0), def.half_extents, def.mass)
            .build(BodyHandle(1))
            .unwrap();
        if mode == DynamicsMode::Simplified {
            body.angular = false;
        }
        (Vehicle::new(VehicleId(1), kind, BodyHandle(1), mode), body)
    }

    fn run(vehicle: &mut Vehicle, body: &mut Body, terrain: &FlatTerrain, steps: usize) {
        let config = PhysicsConfig::default();
        let colliders = ColliderIndex::new(config.chunk_size);
        let dt = config.fixed_step;
        let mut events = Vec::new();
        for _ in 0..steps {
            crate::vehicle::pre_step(vehicle, body, terrain, &config, dt);
            let ctx = StepContext {
                config: &config,
                terrain,
                colliders: &colliders,
                volumes: &[],
            };
            step_body(body, &ctx, dt, &mut events);
            crate::vehicle::post_step(vehicle, body, terrain, &config, dt);
        }
    }

    #[test]
    fn suspension_never_pulls() {
        let def = vehicle_def(VehicleType::Tank);
        assert_eq!(suspension_force(&def, 0.1, -100.0), 0.0);
        assert!(suspension_force(&def, 0.1, 0.0) > 0.0);
        assert!(suspension_force(&def, 0.1, 1.0) > suspension_force(&def, 0.1, 0.0));
    }

    #[test]
    fn springs_carry_weight_at_rest_length() {
        let gravity = PhysicsConfig::default().gravity;
        for kind in [VehicleType::Tank, VehicleType::Jeep] {
            let def = vehicle_def(kind);
            let compression = free_length(&def, gravity) - def.rest_length;
            let per_wheel = suspension_force(&def, compression, 0.0);
            let weight = def.mass * gravity;
            assert!((per_wheel * 4.0 - weight).abs() < weight * 1e-4, "{kind:?}");
        }
    }

    #[test]
    fn airborne_wheels_have_no_contact() {
        let terrain = FlatTerrain::new(0.0);
        let (mut vehicle, mut body) = spawn(VehicleType::Tank, DynamicsMode::Full, 20.0);
        apply_suspension(&mut vehicle, &mut body, &terrain, PhysicsConfig::default().gravity, 1.0 / 60.0);
        assert!(vehicle.wheels.iter().all(|w| !w.grounded));
        assert_eq!(body.velocity, Vec3::ZERO);
    }

    #[test]
    fn jeep_drives_forward() {
        let terrain = FlatTerrain::new(0.0);
        let (mut vehicle, mut body) = spawn(VehicleType::Jeep, DynamicsMode::Full, 1.0);
        run(&mut vehicle, &mut body, &terrain, 120);
        vehicle.assign(Some(0), BodyHandle(9)).unwrap();
        vehicle.set_input(VehicleInput {
            throttle: 1.0,
            ..Default::default()
        });
        let start = body.position;
        run(&mut vehicle, &mut body, &terrain, 120);
        assert!(body.position.z < start.z - 5.0);
        assert!(body.position.y > 0.3);
        assert!(body.up().y > 0.9);
    }

    #[test]
    fn unoccupied_vehicle_ignores_input() {
        let terrain = FlatTerrain::new(0.0);
        let (mut vehicle, mut body) = spawn(VehicleType::Jeep, DynamicsMode::Full, 1.0);
        vehicle.set_input(VehicleInput {
            throttle: 1.0,
            ..Default::default()
        });
        run(&mut vehicle, &mut body, &terrain, 120);
        assert!(body.horizontal_speed() < 1e-3);
    }

    #[test]
    fn flipped_vehicle_rights_itself_over_time() {
        let terrain = FlatTerrain::new(0.0);
        let (mut vehicle, mut body) = spawn(VehicleType::Jeep, DynamicsMode::Full, 0.6);
        body.rotation = Quat::from_rotation_z(std::f32::consts::PI * 0.95);
        let before = body.up().y;
        run(&mut vehicle, &mut body, &terrain, 30);
        assert!(body.up().y > before);
    }

    #[test]
    fn unoccupied_vehicles_level_in_the_air() {
        let terrain = FlatTerrain::new(0.0);
        let tilt = |body: &Body| body.up().y.clamp(-1.0, 1.0).acos();

        let (mut full, mut full_body) = spawn(VehicleType::Jeep, DynamicsMode::Full, 80.0);
        full_body.rotation = Quat::from_rotation_z(0.5);
        run(&mut full, &mut full_body, &terrain, 60);
        assert!(!full.grounded);
        assert!(tilt(&full_body) < 0.15, "full mode tilt {}", tilt(&full_body));

        let (mut simple, mut simple_body) = spawn(VehicleType::Jeep, DynamicsMode::Simplified, 80.0);
        simple.tilt_z = 0.5;
        let config = PhysicsConfig::default();
        for _ in 0..60 {
            crate::vehicle::pre_step(&mut simple, &mut simple_body, &terrain, &config, config.fixed_step);
            crate::vehicle::post_step(&mut simple, &mut simple_body, &terrain, &config, config.fixed_step);
        }
        assert!(!simple.grounded);
        assert!(simple.tilt_z.abs() < 0.15, "simplified tilt {}", simple.tilt_z);
    }

    #[test]
    fn simplified_tank_follows_ramp() {
        // Rising toward -Z: nose up when facing forward.
        struct Ramp;
        impl HeightField for Ramp {
            fn height(&self, _x: f64, z: f64) -> f64 {
                -z * 0.2
            }
        }
        let def = vehicle_def(VehicleType::Tank);
        let mut body = BodyConfig::vehicle(Vec3::new(0.0, 2.0, 0.0), def.half_extents, def.mass)
            .build(BodyHandle(1))
            .unwrap();
        body.angular = false;
        let mut vehicle = Vehicle::new(VehicleId(1), VehicleType::Tank, BodyHandle(1), DynamicsMode::Simplified);
        let config = PhysicsConfig::default();
        for _ in 0..240 {
            crate::vehicle::pre_step(&mut vehicle, &mut body, &Ramp, &config, config.fixed_step);
            body.velocity.y -= config.gravity * config.fixed_step;
            body.position += body.velocity * config.fixed_step;
            crate::vehicle::post_step(&mut vehicle, &mut body, &Ramp, &config, config.fixed_step);
        }
        assert!(vehicle.grounded);
        assert!((vehicle.tilt_x - 0.2f32.atan()).abs() < 0.02);
        assert!(vehicle.tilt_z.abs() < 1e-3);
    }
}
