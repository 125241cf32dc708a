//! Input intent to body/vehicle control, plus camera follow.
//!
//! Conventions: +X right, +Y up, -Z forward. Yaw 0 faces -Z.

use std::collections::HashSet;
use std::str::FromStr;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::KeyParseError;
use crate::physics::body::Body;
use crate::vehicle::{VehicleInput, VehicleType};

/// Player movement intent, as sent on the wire in `player_input`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInput {
    #[serde(default)]
    pub forward: bool,
    #[serde(default)]
    pub backward: bool,
    #[serde(default)]
    pub left: bool,
    #[serde(default)]
    pub right: bool,
    #[serde(default)]
    pub jump: bool,
    #[serde(default)]
    pub running: bool,
    /// Facing yaw (rad).
    #[serde(default)]
    pub rotation_y: f32,
}

impl PlayerInput {
    /// Unit move direction on the XZ plane, or zero.
    pub fn move_direction(&self) -> Vec3 {
        let forward = forward_from_yaw(self.rotation_y);
        let right = right_from_yaw(self.rotation_y);
        let mut dir = Vec3::ZERO;
        if self.forward {
            dir += forward;
        }
        if self.backward {
            dir -= forward;
        }
        if self.right {
            dir += right;
        }
        if self.left {
            dir -= right;
        }
        dir.normalize_or_zero()
    }
}

pub fn forward_from_yaw(yaw: f32) -> Vec3 {
    Vec3::new(-yaw.sin(), 0.0, -yaw.cos())
}

pub fn right_from_yaw(yaw: f32) -> Vec3 {
    Vec3::new(yaw.cos(), 0.0, -yaw.sin())
}

/// On-foot movement tuning.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CharacterTuning {
    pub walk_speed: f32,
    pub sprint_multiplier: f32,
    /// Horizontal acceleration toward the desired velocity (m/s^2).
    pub accel: f32,
    /// Deceleration with no move input (m/s^2).
    pub brake: f32,
    pub jump_velocity: f32,
    /// Grace window after leaving the ground during which a jump still works (s).
    pub coyote_time: f32,
    /// Scale on acceleration while airborne.
    pub air_control: f32,
}

impl Default for CharacterTuning {
    fn default() -> Self {
        Self {
            walk_speed: 12.0,
            sprint_multiplier: 1.7,
            accel: 45.0,
            brake: 55.0,
            jump_velocity: 14.0,
            coyote_time: 0.12,
            air_control: 0.35,
        }
    }
}

/// Per-character controller state.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CharacterController {
    pub input: PlayerInput,
    /// Seconds since the body was last grounded.
    pub time_since_grounded: f32,
}

impl CharacterController {
    pub fn can_jump(&self, tuning: &CharacterTuning) -> bool {
        self.time_since_grounded < tuning.coyote_time
    }
}

/// Drive a character body from its stored input. Runs before the integrator.
pub fn apply_player_input(body: &mut Body, controller: &mut CharacterController, tuning: &CharacterTuning, dt: f32) {
    let input = controller.input;
    if body.grounded {
        controller.time_since_grounded = 0.0;
    } else {
        controller.time_since_grounded += dt;
    }

    body.rotation = Quat::from_rotation_y(input.rotation_y);

    let dir = input.move_direction();
    let speed = if input.running {
        tuning.walk_speed * tuning.sprint_multiplier
    } else {
        tuning.walk_speed
    };
    let desired = dir * speed;
    let mut horizontal = Vec3::new(body.velocity.x, 0.0, body.velocity.z);
    let delta = desired - horizontal;

    let mut rate = if dir != Vec3::ZERO { tuning.accel } else { tuning.brake };
    if controller.time_since_grounded > 0.0 {
        rate *= tuning.air_control;
    }
    let max_change = rate * dt;
    let delta_len = delta.length();
    if delta_len <= max_change {
        horizontal = desired;
    } else if delta_len > 0.0 {
        horizontal += delta * (max_change / delta_len);
    }
    body.velocity.x = horizontal.x;
    body.velocity.z = horizontal.z;

    if input.jump && controller.can_jump(tuning) && body.velocity.y < 1.0 {
        body.velocity.y = tuning.jump_velocity;
        controller.time_since_grounded = tuning.coyote_time;
    }
}

/// Keys the controller layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    A,
    S,
    D,
    Space,
    Shift,
    Q,
    E,
}

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "w" => Ok(Key::W),
            "a" => Ok(Key::A),
            "s" => Ok(Key::S),
            "d" => Ok(Key::D),
            "space" => Ok(Key::Space),
            "shift" => Ok(Key::Shift),
            "q" => Ok(Key::Q),
            "e" => Ok(Key::E),
            other => Err(KeyParseError::UnknownKey(other.to_string())),
        }
    }
}

/// Boolean key map filled by whatever polls the device.
#[derive(Resource, Debug, Clone, Default, PartialEq)]
pub struct KeyState {
    held: HashSet<Key>,
}

impl KeyState {
    pub fn press(&mut self, key: Key) {
        self.held.insert(key);
    }

    pub fn release(&mut self, key: Key) {
        self.held.remove(&key);
    }

    pub fn is_held(&self, key: Key) -> bool {
        self.held.contains(&key)
    }

    fn axis(&self, negative: Key, positive: Key) -> f32 {
        let mut v = 0.0;
        if self.is_held(positive) {
            v += 1.0;
        }
        if self.is_held(negative) {
            v -= 1.0;
        }
        v
    }

    pub fn player_input(&self, yaw: f32) -> PlayerInput {
        PlayerInput {
            forward: self.is_held(Key::W),
            backward: self.is_held(Key::S),
            left: self.is_held(Key::A),
            right: self.is_held(Key::D),
            jump: self.is_held(Key::Space),
            running: self.is_held(Key::Shift),
            rotation_y: yaw,
        }
    }

    pub fn vehicle_input(&self, kind: VehicleType) -> VehicleInput {
        if kind.is_aircraft() {
            VehicleInput {
                lift: self.axis(Key::Shift, Key::Space),
                pitch: self.axis(Key::S, Key::W),
                roll: self.axis(Key::A, Key::D),
                yaw: self.axis(Key::Q, Key::E),
                ..Default::default()
            }
        } else {
            VehicleInput {
                throttle: self.axis(Key::S, Key::W),
                steer: self.axis(Key::A, Key::D),
                brake: self.is_held(Key::Space),
                ..Default::default()
            }
        }
    }
}

const FOLLOW_DISTANCE: f32 = 5.5;
const VEHICLE_FOLLOW_DISTANCE: f32 = 11.0;
const PIVOT_HEIGHT: f32 = 1.0;
const DEFAULT_ORBIT_PITCH: f32 = 0.25;
const MIN_ORBIT_PITCH: f32 = -0.2;
const MAX_ORBIT_PITCH: f32 = 1.3;

/// Third-person orbit camera that follows a character or vehicle.
#[derive(Resource, Debug, Clone, Copy, PartialEq)]
pub struct CameraFollow {
    /// Look offset from the target yaw (rad).
    pub look_yaw: f32,
    /// Look pitch input; looking down orbits the camera up.
    pub look_pitch: f32,
    /// Exponential smoothing rate (1/s); 0 snaps.
    pub smoothing: f32,
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for CameraFollow {
    fn default() -> Self {
        Self {
            look_yaw: 0.0,
            look_pitch: 0.0,
            smoothing: 10.0,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl CameraFollow {
    /// Pose the camera should reach for a target at `target` facing `target_rotation`.
    pub fn desired_pose(&self, target: Vec3, target_rotation: Quat, in_vehicle: bool) -> (Vec3, Quat) {
        let (yaw, _, _) = target_rotation.to_euler(EulerRot::YXZ);
        let orbit_yaw = yaw + self.look_yaw;
        let orbit_pitch = (DEFAULT_ORBIT_PITCH - self.look_pitch * 0.6).clamp(MIN_ORBIT_PITCH, MAX_ORBIT_PITCH);
        let distance = if in_vehicle { VEHICLE_FOLLOW_DISTANCE } else { FOLLOW_DISTANCE };
        let pivot = target + Vec3::Y * PIVOT_HEIGHT;
        let eye = orbit_position(pivot, orbit_yaw, orbit_pitch, distance);
        (eye, look_at_level(eye, pivot))
    }

    /// Move toward the desired pose.
    pub fn update(&mut self, target: Vec3, target_rotation: Quat, in_vehicle: bool, dt: f32) {
        let (eye, rot) = self.desired_pose(target, target_rotation, in_vehicle);
        let t = if self.smoothing <= 0.0 {
            1.0
        } else {
            1.0 - (-self.smoothing * dt).exp()
        };
        self.position = self.position.lerp(eye, t);
        self.rotation = self.rotation.slerp(rot, t);
    }
}

/// Camera position on an orbit around `pivot`. Pitch 0 is level behind, positive is above.
pub fn orbit_position(pivot: Vec3, yaw: f32, pitch: f32, distance: f32) -> Vec3 {
    let behind = Vec3::new(yaw.sin(), 0.0, yaw.cos());
    pivot + behind * (distance * pitch.cos()) + Vec3::Y * (distance * pitch.sin())
}

/// Rotation that looks from `eye` at `target` with no roll.
pub fn look_at_level(eye: Vec3, target: Vec3) -> Quat {
    Transform::from_translation(eye).looking_at(target, Vec3::Y).rotation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::body::{BodyConfig, BodyHandle};

    fn grounded_character() -> Body {
        let mut body = BodyConfig::character(Vec3::ZERO).build(BodyHandle(1)).unwrap();
        body.grounded = true;
        body
    }

    #[test]
    fn yaw_zero_faces_negative_z() {
        let input = PlayerInput {
            forward: true,
            ..Default::default()
        };
        let dir = input.move_direction();
        assert!((dir - Vec3::NEG_Z).length() < 1e-6);
        let input = PlayerInput {
            right: true,
            ..Default::default()
        };
        assert!((input.move_direction() - Vec3::X).length() < 1e-6);
    }

    #[test]
    fn accelerates_to_walk_speed() {
        let tuning = CharacterTuning::default();
        let mut body = grounded_character();
        let mut controller = CharacterController {
            input: PlayerInput {
                forward: true,
                ..Default::default()
            },
            ..Default::default()
        };
        apply_player_input(&mut body, &mut controller, &tuning, 1.0 / 60.0);
        assert!((body.velocity.z + tuning.accel / 60.0).abs() < 1e-4);
        for _ in 0..120 {
            apply_player_input(&mut body, &mut controller, &tuning, 1.0 / 60.0);
        }
        assert!((body.horizontal_speed() - tuning.walk_speed).abs() < 1e-4);
    }

    #[test]
    fn sprint_is_faster() {
        let tuning = CharacterTuning::default();
        let mut body = grounded_character();
        let mut controller = CharacterController {
            input: PlayerInput {
                forward: true,
                running: true,
                ..Default::default()
            },
            ..Default::default()
        };
        for _ in 0..240 {
            apply_player_input(&mut body, &mut controller, &tuning, 1.0 / 60.0);
        }
        assert!(body.horizontal_speed() > tuning.walk_speed * 1.5);
    }

    #[test]
    fn coyote_jump_window() {
        let tuning = CharacterTuning::default();
        let mut body = grounded_character();
        let mut controller = CharacterController::default();
        apply_player_input(&mut body, &mut controller, &tuning, 1.0 / 60.0);

        body.grounded = false;
        controller.input.jump = true;
        apply_player_input(&mut body, &mut controller, &tuning, 1.0 / 60.0);
        assert_eq!(body.velocity.y, tuning.jump_velocity);

        // Long after leaving the ground, no jump.
        let mut body = grounded_character();
        body.grounded = false;
        let mut controller = CharacterController {
            time_since_grounded: 1.0,
            ..Default::default()
        };
        controller.input.jump = true;
        apply_player_input(&mut body, &mut controller, &tuning, 1.0 / 60.0);
        assert_eq!(body.velocity.y, 0.0);
    }

    #[test]
    fn key_map_to_vehicle_axes() {
        let mut keys = KeyState::default();
        keys.press(Key::W);
        keys.press(Key::D);
        keys.press(Key::Space);
        let ground = keys.vehicle_input(VehicleType::Jeep);
        assert_eq!((ground.throttle, ground.steer, ground.brake), (1.0, 1.0, true));
        let air = keys.vehicle_input(VehicleType::Helicopter);
        assert_eq!((air.pitch, air.roll, air.lift), (1.0, 1.0, 1.0));
        keys.release(Key::W);
        keys.press(Key::S);
        assert_eq!(keys.vehicle_input(VehicleType::Tank).throttle, -1.0);
        assert_eq!("Space".parse::<Key>(), Ok(Key::Space));
        assert_eq!(
            "F13".parse::<Key>(),
            Err(KeyParseError::UnknownKey("f13".to_string()))
        );
    }

    #[test]
    fn camera_sits_behind_and_above() {
        let cam = CameraFollow::default();
        let (eye, rot) = cam.desired_pose(Vec3::ZERO, Quat::IDENTITY, false);
        // Facing -Z, so behind is +Z.
        assert!(eye.z > 4.0);
        assert!(eye.y > 1.0);
        let look = rot * Vec3::NEG_Z;
        assert!(look.z < 0.0);
    }
}
