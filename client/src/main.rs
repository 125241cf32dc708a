//! Headless game client - joins a room, drives a character or vehicle, mirrors the world
//!
//! Lightyear 0.25 / Bevy 0.17
//!
//! Usage: `client [--yaw RAD] [--spawn TYPE] [--enter] [--fire] [KEY...]`
//! with keys from `w a s d space shift q e`, held for the whole session.

mod camera;
mod input;
mod states;
mod sync;
mod systems;

use std::sync::Arc;

use bevy::app::ScheduleRunnerPlugin;
use bevy::prelude::*;
use lightyear::prelude::client::ClientPlugins;
use shared::controller::CameraFollow;
use shared::interpolation::{interpolation_delay_ms, RemoteBuffers};
use shared::protocol::tick_duration;
use shared::terrain::{HeightField, TerrainConfig, WorldTerrain};
use shared::{NetConfig, PhysicsWorld, ProtocolPlugin};
use states::GameState;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = input::ClientArgs::parse(std::env::args().skip(1))?;
    let net = NetConfig::from_env();
    let session = systems::Session::from_env();

    // Same seed as the server, so predicted ground matches.
    let terrain: Arc<dyn HeightField> = Arc::new(WorldTerrain::new(TerrainConfig::default())?);
    let prediction_world = PhysicsWorld::builder().shared_terrain(terrain).build()?;

    let mut app = App::new();

    app.add_plugins(MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(tick_duration())));
    app.add_plugins(bevy::log::LogPlugin::default());
    app.add_plugins(bevy::state::app::StatesPlugin);

    app.init_state::<GameState>();

    app.add_plugins(ClientPlugins {
        tick_duration: tick_duration(),
    });
    app.add_plugins(ProtocolPlugin);

    app.insert_resource(args.key_state());
    app.insert_resource(RemoteBuffers::new(
        net.buffer_capacity,
        interpolation_delay_ms(net.broadcast_rate),
    ));
    app.insert_resource(sync::LocalPrediction::new(prediction_world));
    app.insert_resource(args);
    app.insert_resource(session);
    app.insert_resource(net);
    app.init_resource::<sync::NetEntities>();
    app.init_resource::<sync::ServerClock>();
    app.init_resource::<input::InputThrottle>();
    app.init_resource::<input::ActionTimers>();
    app.init_resource::<CameraFollow>();

    // Connection systems
    app.add_systems(OnEnter(GameState::Connecting), systems::start_connection);
    app.add_systems(Update, systems::check_connection);

    // Inbound frames are applied in every state: the handshake reply arrives while `Joining`.
    app.add_systems(Update, (sync::receive_frames, sync::apply_interpolation).chain());

    app.add_systems(
        FixedUpdate,
        (input::send_input_to_server, sync::predict_local_player)
            .chain()
            .run_if(in_state(GameState::Playing)),
    );

    app.add_systems(
        Update,
        (
            input::handle_actions,
            systems::send_ping,
            camera::update_camera.after(sync::apply_interpolation),
            camera::report_camera,
        )
            .run_if(in_state(GameState::Playing)),
    );

    info!("Starting client for room '{}'", app.world().resource::<systems::Session>().room_id);
    app.run();
    Ok(())
}
