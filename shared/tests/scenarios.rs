use bevy::prelude::*;

use shared::controller::{CharacterTuning, PlayerInput};
use shared::interpolation::{interpolation_delay_ms, RemoteBuffers};
use shared::physics::PhysicsWorld;
use shared::protocol::{BodySnapshot, EntityKind, Envelope, Message, PhysicsState};
use shared::terrain::FlatTerrain;
use shared::vehicle::{vehicle_def, VehicleType};
use shared::PhysicsConfig;

const DT: f32 = 1.0 / 60.0;

#[test]
fn tank_settles_on_flat_ground() {
    let config = PhysicsConfig::default();
    assert_eq!(config.gravity, 38.5);
    let mut world = PhysicsWorld::builder()
        .config(config)
        .terrain(FlatTerrain::new(0.0))
        .build()
        .unwrap();
    let id = world.spawn_vehicle(VehicleType::Tank, Vec3::ZERO, 0.0).unwrap();

    for _ in 0..60 {
        world.step(DT);
    }

    let vehicle = world.vehicle(id).unwrap();
    let body = world.body(vehicle.body).unwrap();
    let rest = vehicle_def(VehicleType::Tank).rest_length;
    assert!((body.position.y - rest).abs() < 0.05, "y = {}", body.position.y);
    assert!(body.position.x.abs() < 0.05);
    assert!(body.position.z.abs() < 0.05);
    assert!(vehicle.grounded);
    assert!(body.grounded);
}

/// Peer A drives a character forward; peer B only sees `physics_state` frames and renders
/// through its interpolation buffer.
#[test]
fn remote_peer_trails_by_interpolation_delay() {
    let speed = 20.0;
    let mut authority = PhysicsWorld::builder()
        .terrain(FlatTerrain::new(0.0))
        .character_tuning(CharacterTuning {
            walk_speed: speed,
            accel: 400.0,
            ..Default::default()
        })
        .build()
        .unwrap();
    let player = authority.spawn_character(Vec3::new(0.0, 1.0, 0.0)).unwrap();
    for _ in 0..30 {
        authority.step(DT);
    }

    let delay = interpolation_delay_ms(20.0);
    assert_eq!(delay, 100.0);
    let mut peer_b = RemoteBuffers::new(20, delay);

    let start_ms = 500.0;
    let mut rendered = Vec::new();
    let mut authoritative_z = 0.0;
    for tick in 1..=60u32 {
        // Inputs arrive every 50 ms.
        if tick % 3 == 1 {
            authority.set_player_input(
                player,
                PlayerInput {
                    forward: true,
                    rotation_y: 0.0,
                    ..Default::default()
                },
            );
        }
        authority.step(DT);

        if tick % 3 == 0 {
            let now = start_ms + f64::from(tick) * 1000.0 / 60.0;
            let body = authority.body(player).unwrap();
            authoritative_z = body.position.z;
            let frame = Envelope::new(
                Message::PhysicsState(PhysicsState {
                    timestamp: now,
                    bodies: vec![BodySnapshot::from_body("player-1", EntityKind::Player, body, None)],
                }),
                now,
            )
            .encode()
            .unwrap();

            let Message::PhysicsState(state) = Envelope::decode(&frame).unwrap().message else {
                panic!("expected physics_state");
            };
            for snapshot in &state.bodies {
                peer_b.ingest(&snapshot.entity_id, snapshot.to_remote_state(state.timestamp));
            }
            rendered.push(peer_b.sample("player-1", now).unwrap().position.z);
        }
    }

    // Forward is -Z, so the rendered position only ever decreases.
    for pair in rendered.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-4, "{rendered:?}");
    }
    let last = *rendered.last().unwrap();
    assert!(last < -10.0);
    let lag = last - authoritative_z;
    let expected = speed * (delay / 1000.0) as f32;
    assert!((lag - expected).abs() < 0.25, "lag {lag}, expected {expected}");
}
