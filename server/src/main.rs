//! Room server - headless Bevy app hosting memory-only physics rooms
//!
//! Lightyear 0.25 / Bevy 0.17

mod rooms;
mod systems;

use std::net::SocketAddr;
use std::sync::Arc;

use bevy::app::ScheduleRunnerPlugin;
use bevy::prelude::*;
use lightyear::prelude::server::*;
use lightyear::prelude::*;
use shared::protocol::{server_bind_addr, tick_duration, PRIVATE_KEY};
use shared::terrain::{TerrainConfig, WorldTerrain};
use shared::{NetConfig, ProtocolPlugin};

use rooms::Rooms;
use systems::Outbox;

/// Marker for our server entity
#[derive(Component)]
struct GameServer;

#[derive(Resource)]
struct BindAddr(SocketAddr);

/// Spawn the server entity with all required networking components
fn spawn_server(mut commands: Commands, bind: Res<BindAddr>, rooms: Res<Rooms>) {
    info!("Spawning server entity, binding to {:?}", bind.0);
    commands.spawn((
        GameServer,
        Server::default(),
        ServerUdpIo::default(),
        LocalAddr(bind.0),
        NetcodeServer::new(NetcodeConfig {
            protocol_id: rooms.net.protocol_id,
            private_key: PRIVATE_KEY,
            ..default()
        }),
    ));
}

/// Start the server after it's spawned
fn start_server(
    mut commands: Commands,
    server_query: Query<Entity, (With<GameServer>, Without<Started>, Without<Starting>)>,
) {
    for server_entity in server_query.iter() {
        info!("Starting server...");
        commands.trigger(Start { entity: server_entity });
    }
}

/// Check if server is started (run condition)
fn server_is_started(server_query: Query<(), (With<GameServer>, With<Started>)>) -> bool {
    !server_query.is_empty()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let net = NetConfig::from_env();
    let host = std::env::var("SERVER_ADDR").unwrap_or_else(|_| server_bind_addr().to_string());
    let bind: SocketAddr = format!("{}:{}", host, net.server_port).parse()?;

    // One deterministic terrain shared by every room.
    let terrain = Arc::new(WorldTerrain::new(TerrainConfig::default())?);
    let mut rooms = Rooms::new(terrain, net);
    if let Ok(room) = std::env::var("ROOM_ID") {
        rooms.default_room = room;
    }

    let mut app = App::new();

    // Run the loop at the fixed tick rate so frame-scoped message buffers are not cleared
    // before `FixedUpdate` has read them.
    app.add_plugins(MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(tick_duration())));
    app.add_plugins(bevy::log::LogPlugin::default());
    app.add_plugins(bevy::state::app::StatesPlugin);

    app.insert_resource(BindAddr(bind));
    app.insert_resource(rooms);
    app.init_resource::<Outbox>();

    app.add_plugins(ServerPlugins {
        tick_duration: tick_duration(),
    });
    app.add_plugins(ProtocolPlugin);

    app.add_systems(Startup, spawn_server);
    app.add_systems(Update, start_server);
    app.add_observer(systems::handle_disconnections);

    // Fixed tick: link setup, inbound frames, simulation, then one flush.
    app.add_systems(
        FixedUpdate,
        (
            systems::handle_connections,
            systems::receive_frames,
            systems::step_rooms,
            systems::flush_outbox,
        )
            .chain()
            .run_if(server_is_started),
    );

    info!("Starting room server on {}", bind);
    app.run();
    Ok(())
}
