//! Wire protocol.
//!
//! Every frame is one JSON envelope `{ type, data, clientId?, timestamp }` carried as a single
//! lightyear `WireFrame` message. Control traffic goes over `ReliableChannel`; input and
//! `physics_state` over the unreliable channels.

use std::time::Duration;

use bevy::prelude::*;
use lightyear::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::FIXED_TIMESTEP_HZ;
use crate::controller::PlayerInput;
use crate::error::ProtocolError;
use crate::interpolation::RemoteState;
use crate::physics::body::{Body, BodyHandle};
use crate::vehicle::{Vehicle, VehicleId, VehicleInput, VehicleType};

/// Version string a client must present in `handshake`.
pub const PROTOCOL_VERSION: &str = "1.0";

// --- Payload primitives ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct WireVec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<Vec3> for WireVec3 {
    fn from(v: Vec3) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }
}

impl From<WireVec3> for Vec3 {
    fn from(v: WireVec3) -> Self {
        Vec3::new(v.x, v.y, v.z)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct WireQuat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for WireQuat {
    fn default() -> Self {
        Quat::IDENTITY.into()
    }
}

impl From<Quat> for WireQuat {
    fn from(q: Quat) -> Self {
        Self {
            x: q.x,
            y: q.y,
            z: q.z,
            w: q.w,
        }
    }
}

impl From<WireQuat> for Quat {
    fn from(q: WireQuat) -> Self {
        let q = Quat::from_xyzw(q.x, q.y, q.z, q.w);
        if q.length_squared() > 1e-12 && q.is_finite() {
            q.normalize()
        } else {
            Quat::IDENTITY
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Player,
    Vehicle,
    Prop,
}

/// Wire id of a character body.
pub fn player_entity_id(body: BodyHandle) -> String {
    format!("player-{}", body.0)
}

/// Wire id of a vehicle.
pub fn vehicle_entity_id(vehicle: VehicleId) -> String {
    format!("vehicle-{}", vehicle.0)
}

pub fn parse_vehicle_entity_id(entity_id: &str) -> Option<VehicleId> {
    entity_id.strip_prefix("vehicle-")?.parse().ok().map(VehicleId)
}

// --- Payloads ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub room_id: String,
    pub username: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub success: bool,
    pub room_id: String,
    pub is_host: bool,
    pub client_count: usize,
    pub physics_enabled: bool,
    pub physics_tick_rate: f64,
    pub network_broadcast_rate: f64,
    /// Id assigned to this client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BodySnapshot {
    pub entity_id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub position: WireVec3,
    pub rotation: WireQuat,
    pub velocity: WireVec3,
    pub angular_velocity: WireVec3,
    pub grounded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<VehicleType>,
}

impl BodySnapshot {
    pub fn from_body(entity_id: impl Into<String>, kind: EntityKind, body: &Body, vehicle_type: Option<VehicleType>) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            position: body.position.into(),
            rotation: body.rotation.into(),
            velocity: body.velocity.into(),
            angular_velocity: body.angular_velocity.into(),
            grounded: body.grounded,
            vehicle_type,
        }
    }

    pub fn to_remote_state(&self, timestamp: f64) -> RemoteState {
        RemoteState {
            position: self.position.into(),
            rotation: self.rotation.into(),
            velocity: self.velocity.into(),
            angular_velocity: self.angular_velocity.into(),
            grounded: self.grounded,
            timestamp,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PhysicsState {
    pub timestamp: f64,
    pub bodies: Vec<BodySnapshot>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInputMessage {
    pub vehicle_id: String,
    #[serde(flatten)]
    pub input: VehicleInput,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SpawnPlayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<WireVec3>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnVehicle {
    pub vehicle_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<WireVec3>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeatOccupant {
    pub seat_index: usize,
    pub occupant_id: String,
}

/// Vehicle fields carried by `entity_spawn`/`entity_update`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VehicleExtras {
    pub heading: f32,
    pub tilt_x: f32,
    pub tilt_z: f32,
    pub target_altitude: f32,
    pub occupants: Vec<SeatOccupant>,
}

impl VehicleExtras {
    /// `occupant_id` maps a seated body to its entity id.
    pub fn from_vehicle(vehicle: &Vehicle, occupant_id: impl Fn(BodyHandle) -> String) -> Self {
        Self {
            heading: vehicle.heading,
            tilt_x: vehicle.tilt_x,
            tilt_z: vehicle.tilt_z,
            target_altitude: vehicle.target_altitude,
            occupants: vehicle
                .occupants()
                .map(|(seat_index, body)| SeatOccupant {
                    seat_index,
                    occupant_id: occupant_id(body),
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntitySpawn {
    pub entity_id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<VehicleType>,
    pub position: WireVec3,
    pub rotation: WireQuat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehicleExtras>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub entity_id: String,
    pub position: WireVec3,
    pub rotation: WireQuat,
    pub velocity: WireVec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehicleExtras>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityDestroy {
    pub entity_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoin {
    pub client_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeave {
    pub client_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Absent for system messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub text: String,
    #[serde(default)]
    pub system: bool,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            sender: None,
            text: text.into(),
            system: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Ping {
    pub time: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnterVehicle {
    pub vehicle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seat_index: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Empty {}

/// Every message kind, tagged by `type` with its payload under `data`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    Handshake(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    PhysicsState(PhysicsState),
    PlayerInput(PlayerInput),
    VehicleInput(VehicleInputMessage),
    SpawnPlayer(SpawnPlayer),
    SpawnVehicle(SpawnVehicle),
    EntitySpawn(EntitySpawn),
    EntityUpdate(EntityUpdate),
    EntityDestroy(EntityDestroy),
    PlayerJoin(PlayerJoin),
    PlayerLeave(PlayerLeave),
    ChatMessage(ChatMessage),
    Ping(Ping),
    Pong(Ping),
    EnterVehicle(EnterVehicle),
    ExitVehicle(Empty),
    FireWeapon(Empty),
}

impl Message {
    /// High-rate messages that tolerate loss.
    pub fn is_unreliable(&self) -> bool {
        matches!(
            self,
            Message::PhysicsState(_) | Message::PlayerInput(_) | Message::VehicleInput(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeResponse(_) => "handshake_response",
            Message::PhysicsState(_) => "physics_state",
            Message::PlayerInput(_) => "player_input",
            Message::VehicleInput(_) => "vehicle_input",
            Message::SpawnPlayer(_) => "spawn_player",
            Message::SpawnVehicle(_) => "spawn_vehicle",
            Message::EntitySpawn(_) => "entity_spawn",
            Message::EntityUpdate(_) => "entity_update",
            Message::EntityDestroy(_) => "entity_destroy",
            Message::PlayerJoin(_) => "player_join",
            Message::PlayerLeave(_) => "player_leave",
            Message::ChatMessage(_) => "chat_message",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::EnterVehicle(_) => "enter_vehicle",
            Message::ExitVehicle(_) => "exit_vehicle",
            Message::FireWeapon(_) => "fire_weapon",
        }
    }
}

/// One frame on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Sender clock in milliseconds.
    #[serde(default)]
    pub timestamp: f64,
}

impl Envelope {
    pub fn new(message: Message, timestamp: f64) -> Self {
        Self {
            message,
            client_id: None,
            timestamp,
        }
    }

    pub fn from_client(message: Message, client_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            message,
            client_id: Some(client_id.into()),
            timestamp,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<WireFrame, ProtocolError> {
        Ok(WireFrame(self.encode()?))
    }
}

/// Reject handshakes from an incompatible client.
pub fn check_version(request: &HandshakeRequest) -> Result<(), ProtocolError> {
    if request.version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::Version {
            got: request.version.clone(),
            expected: PROTOCOL_VERSION,
        })
    }
}

// --- Transport ---

/// A JSON envelope as one lightyear message.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct WireFrame(pub String);

impl WireFrame {
    pub fn decode(&self) -> Result<Envelope, ProtocolError> {
        Envelope::decode(&self.0)
    }
}

/// Ordered reliable channel for control messages
pub struct ReliableChannel;

/// Unreliable client -> server input
pub struct InputChannel;

/// Unreliable server -> client state broadcast
pub struct StateChannel;

pub struct ProtocolPlugin;

impl Plugin for ProtocolPlugin {
    fn build(&self, app: &mut App) {
        app.register_message::<WireFrame>()
            .add_direction(NetworkDirection::Bidirectional);

        app.add_channel::<ReliableChannel>(ChannelSettings {
            mode: ChannelMode::OrderedReliable(ReliableSettings::default()),
            ..default()
        })
        .add_direction(NetworkDirection::Bidirectional);

        app.add_channel::<InputChannel>(ChannelSettings {
            mode: ChannelMode::UnorderedUnreliable,
            ..default()
        })
        .add_direction(NetworkDirection::ClientToServer);

        app.add_channel::<StateChannel>(ChannelSettings {
            mode: ChannelMode::UnorderedUnreliable,
            ..default()
        })
        .add_direction(NetworkDirection::ServerToClient);
    }
}

// --- Network configuration ---

pub const SERVER_PORT: u16 = 5000;
pub const SERVER_ADDR: &str = "127.0.0.1";
pub const PROTOCOL_ID: u64 = 0x1234567890ABCDEF;

/// Local development key shared by both binaries.
pub const PRIVATE_KEY: [u8; 32] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
    0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18,
    0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f, 0x20,
];

/// Address the server binds to unless `SERVER_ADDR` overrides it.
pub fn server_bind_addr() -> &'static str {
    "0.0.0.0"
}

/// Tick duration for lightyear plugins
pub fn tick_duration() -> Duration {
    Duration::from_secs_f64(1.0 / FIXED_TIMESTEP_HZ)
}
