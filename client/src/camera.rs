//! Third-person follow camera
//!
//! Headless: the pose lives in the `CameraFollow` resource instead of a `Camera3d`.

use bevy::prelude::*;
use shared::controller::CameraFollow;

use crate::sync::{LocalPlayer, NetEntities};
use crate::systems::connection::Session;

/// Seconds between camera pose log lines
const REPORT_INTERVAL: f32 = 2.0;

/// Follow our vehicle while seated, otherwise our character.
pub fn update_camera(
    time: Res<Time>,
    session: Res<Session>,
    entities: Res<NetEntities>,
    player: Query<&Transform, With<LocalPlayer>>,
    poses: Query<&Transform, Without<LocalPlayer>>,
    mut camera: ResMut<CameraFollow>,
) {
    let vehicle_pose = session
        .seat
        .as_ref()
        .and_then(|(vehicle_id, _)| entities.get(vehicle_id))
        .and_then(|entity| poses.get(entity).ok());

    match (vehicle_pose, player.single()) {
        // The vehicle pose is already interpolated, so snap instead of smoothing twice.
        (Some(vehicle), _) => {
            let (eye, rot) = camera.desired_pose(vehicle.translation, vehicle.rotation, true);
            camera.position = eye;
            camera.rotation = rot;
        }
        (None, Ok(me)) => camera.update(me.translation, me.rotation, false, time.delta_secs()),
        (None, Err(_)) => {}
    }
}

/// Periodic status line with where we are and what we see.
pub fn report_camera(
    time: Res<Time>,
    mut since: Local<f32>,
    camera: Res<CameraFollow>,
    session: Res<Session>,
    entities: Res<NetEntities>,
) {
    *since += time.delta_secs();
    if *since < REPORT_INTERVAL {
        return;
    }
    *since = 0.0;
    let seat = match &session.seat {
        Some((vehicle, index)) => format!("{} seat {}", vehicle, index),
        None => "on foot".to_string(),
    };
    info!(
        "Camera at ({:.1}, {:.1}, {:.1}), {}, {} entities in view",
        camera.position.x,
        camera.position.y,
        camera.position.z,
        seat,
        entities.len()
    );
}
