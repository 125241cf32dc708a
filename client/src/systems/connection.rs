//! Connection systems
//!
//! Transport link, handshake, and the outbound frame helper.

use std::net::SocketAddr;

use bevy::prelude::*;
use lightyear::prelude::client::*;
use lightyear::prelude::*;
use shared::protocol::{
    Envelope, HandshakeRequest, InputChannel, Message, Ping, ReliableChannel, WireFrame, PRIVATE_KEY,
    PROTOCOL_VERSION,
};
use shared::NetConfig;

use crate::states::GameState;

/// Seconds between latency pings
const PING_INTERVAL: f32 = 2.0;

/// Marker component for our client entity
#[derive(Component)]
pub struct GameClient;

/// Who we are once the server has accepted the handshake.
#[derive(Resource, Debug, Clone, Default)]
pub struct Session {
    pub username: String,
    pub room_id: String,
    pub client_id: Option<String>,
    pub is_host: bool,
    /// Entity id of our character, once spawned
    pub player_entity: Option<String>,
    /// Vehicle we sit in and our seat index
    pub seat: Option<(String, usize)>,
}

impl Session {
    pub fn from_env() -> Self {
        Self {
            username: std::env::var("PLAYER_NAME").unwrap_or_else(|_| format!("player{}", rand::random::<u16>())),
            room_id: std::env::var("ROOM_ID").unwrap_or_default(),
            ..default()
        }
    }

    pub fn is_driving(&self) -> bool {
        matches!(self.seat, Some((_, 0)))
    }
}

/// Wrap a message in an envelope and queue it on the matching channel.
pub fn send_message(sender: &mut MessageSender<WireFrame>, session: &Session, message: Message, now_ms: f64) {
    let unreliable = message.is_unreliable();
    let name = message.type_name();
    let envelope = match &session.client_id {
        Some(id) => Envelope::from_client(message, id.clone(), now_ms),
        None => Envelope::new(message, now_ms),
    };
    match envelope.to_frame() {
        Ok(frame) if unreliable => {
            sender.send::<InputChannel>(frame);
        }
        Ok(frame) => {
            sender.send::<ReliableChannel>(frame);
        }
        Err(e) => error!("Failed to encode {}: {}", name, e),
    }
}

/// Spawn the client entity and start connecting.
pub fn start_connection(mut commands: Commands, net: Res<NetConfig>, mut exit: MessageWriter<AppExit>) {
    let server_addr: SocketAddr = match format!("{}:{}", net.server_addr, net.server_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid server address {}:{}: {}", net.server_addr, net.server_port, e);
            exit.write(AppExit::error());
            return;
        }
    };
    let local_addr = SocketAddr::from(([0, 0, 0, 0], 0));
    let netcode_id = rand::random::<u64>();
    info!("Connecting to {} (netcode id {})", server_addr, netcode_id);

    let auth = Authentication::Manual {
        server_addr,
        protocol_id: net.protocol_id,
        private_key: PRIVATE_KEY,
        client_id: netcode_id,
    };
    let netcode = match NetcodeClient::new(auth, NetcodeConfig::default()) {
        Ok(netcode) => netcode,
        Err(e) => {
            error!("Failed to create netcode client: {:?}", e);
            exit.write(AppExit::error());
            return;
        }
    };

    let client_entity = commands
        .spawn((
            GameClient,
            Client::default(),
            UdpIo::default(),
            LocalAddr(local_addr),
            PeerAddr(server_addr),
            netcode,
            MessageSender::<WireFrame>::default(),
            MessageReceiver::<WireFrame>::default(),
        ))
        .id();
    commands.trigger(Connect { entity: client_entity });
}

/// Link up: send the handshake. Link lost: quit.
pub fn check_connection(
    mut next_state: ResMut<NextState<GameState>>,
    mut new_connections: Query<&mut MessageSender<WireFrame>, (With<GameClient>, Added<Connected>)>,
    new_disconnections: Query<Entity, (With<GameClient>, Added<Disconnected>)>,
    session: Res<Session>,
    time: Res<Time>,
    mut exit: MessageWriter<AppExit>,
) {
    for mut sender in new_connections.iter_mut() {
        info!("Connected; joining room '{}' as '{}'", session.room_id, session.username);
        let hello = Message::Handshake(HandshakeRequest {
            room_id: session.room_id.clone(),
            username: session.username.clone(),
            version: PROTOCOL_VERSION.to_string(),
        });
        send_message(&mut sender, &session, hello, time.elapsed_secs_f64() * 1000.0);
        next_state.set(GameState::Joining);
    }

    if !new_disconnections.is_empty() {
        warn!("Connection failed or disconnected");
        exit.write(AppExit::error());
    }
}

/// Probe round-trip time; the server echoes the ping back as `pong`.
pub fn send_ping(
    time: Res<Time>,
    session: Res<Session>,
    mut since: Local<f32>,
    mut client: Query<&mut MessageSender<WireFrame>, (With<GameClient>, With<Connected>)>,
) {
    *since += time.delta_secs();
    if *since < PING_INTERVAL {
        return;
    }
    *since = 0.0;
    if let Ok(mut sender) = client.single_mut() {
        let now_ms = time.elapsed_secs_f64() * 1000.0;
        send_message(&mut sender, &session, Message::Ping(Ping { time: now_ms }), now_ms);
    }
}
