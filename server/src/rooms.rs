//! Memory-only rooms. Each room owns one independent physics world and its member list.
//!
//! Everything in here is transport-agnostic: handlers take decoded messages and return
//! `Delivery` lists that the lightyear layer in `systems` turns into frames.

use std::collections::HashMap;
use std::sync::Arc;

use bevy::prelude::*;
use rand::Rng;
use thiserror::Error;

use shared::controller::forward_from_yaw;
use shared::physics::{BodyHandle, BodyKind, EventHandlers, SimEvent, SimEventKind};
use shared::protocol::{
    check_version, parse_vehicle_entity_id, player_entity_id, vehicle_entity_id, BodySnapshot,
    ChatMessage, EnterVehicle, EntityDestroy, EntityKind, EntitySpawn, EntityUpdate, Envelope,
    HandshakeRequest, HandshakeResponse, Message, PhysicsState, PlayerJoin, PlayerLeave,
    SpawnPlayer, SpawnVehicle, VehicleExtras, VehicleInputMessage,
};
use shared::terrain::HeightField;
use shared::vehicle::{vehicle_def, VehicleId, VehicleType};
use shared::{ConfigError, NetConfig, PhysicsWorld, SeatError, SpawnError};

/// Where players appear when they don't ask for a position
pub const SPAWN_POINT: Vec2 = Vec2::new(0.0, 0.0);
/// Random horizontal offset around the spawn point
const SPAWN_JITTER: f32 = 3.0;
/// Distance in front of the sender for `/spawnvehicle`
const VEHICLE_SPAWN_DISTANCE: f32 = 10.0;
/// Vehicles parked in every new room
const ROOM_VEHICLES: [(VehicleType, Vec2); 2] = [
    (VehicleType::Jeep, Vec2::new(8.0, -6.0)),
    (VehicleType::Helicopter, Vec2::new(-14.0, -12.0)),
];
/// Vehicle extras ride along with every Nth state broadcast
const VEHICLE_UPDATE_EVERY: u32 = 5;

pub const DEFAULT_ROOM: &str = "lobby";

const SPAWN_USAGE: &str = "usage: /spawnvehicle <tank|jeep|helicopter>";

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("physics world failed to start: {0}")]
    Physics(#[from] ConfigError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Seat(#[from] SeatError),

    #[error("{0}")]
    Usage(&'static str),

    #[error("unknown command '/{0}'")]
    UnknownCommand(String),

    #[error("spawn a player first")]
    NoPlayer,

    #[error("no such vehicle '{0}'")]
    BadVehicleId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    SpawnVehicle(VehicleType),
}

/// `None` for plain chat, otherwise the parsed slash command.
pub fn parse_command(text: &str) -> Option<Result<ChatCommand, RoomError>> {
    let rest = text.trim().strip_prefix('/')?;
    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    Some(match name.to_ascii_lowercase().as_str() {
        "spawnvehicle" => match words.next() {
            Some(kind) => kind
                .parse::<VehicleType>()
                .map(ChatCommand::SpawnVehicle)
                .map_err(RoomError::from),
            None => Err(RoomError::Usage(SPAWN_USAGE)),
        },
        _ => Err(RoomError::UnknownCommand(name.to_string())),
    })
}

/// One outgoing message and the clients that should get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: Vec<String>,
    pub message: Message,
}

impl Delivery {
    pub fn one(client: &str, message: Message) -> Self {
        Self {
            to: vec![client.to_string()],
            message,
        }
    }

    pub fn envelope(&self, timestamp: f64) -> Envelope {
        Envelope::new(self.message.clone(), timestamp)
    }
}

#[derive(Debug, Clone)]
struct Member {
    client_id: String,
    username: String,
    body: Option<BodyHandle>,
}

pub struct Room {
    pub id: String,
    world: PhysicsWorld,
    /// Join order; the first entry is the host.
    members: Vec<Member>,
    handlers: EventHandlers,
    since_broadcast: f64,
    broadcasts: u32,
    clock_ms: f64,
}

impl Room {
    pub fn open(id: &str, terrain: Arc<dyn HeightField>) -> Result<Self, RoomError> {
        let mut world = PhysicsWorld::builder().shared_terrain(terrain).build()?;
        for (kind, at) in ROOM_VEHICLES {
            let position = vehicle_spawn_position(&world, kind, at);
            world.spawn_vehicle(kind, position, 0.0)?;
        }

        let mut handlers = EventHandlers::new();
        let room = id.to_string();
        handlers.on(SimEventKind::Explosion, move |event| {
            if let SimEvent::Explosion { vehicle, position, .. } = event {
                info!("[{}] Bomb from {:?} exploded at {:?}", room, vehicle, position);
            }
        });
        handlers.on(SimEventKind::Landed, |event| {
            if let SimEvent::Landed { body, impact_speed } = event {
                debug!("{:?} landed at {:.1} m/s", body, impact_speed);
            }
        });

        info!("Room '{}' opened", id);
        Ok(Self {
            id: id.to_string(),
            world,
            members: Vec::new(),
            handlers,
            since_broadcast: 0.0,
            broadcasts: 0,
            clock_ms: 0.0,
        })
    }

    pub fn world(&self) -> &PhysicsWorld {
        &self.world
    }

    pub fn host(&self) -> Option<&str> {
        self.members.first().map(|m| m.client_id.as_str())
    }

    pub fn client_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clock_ms(&self) -> f64 {
        self.clock_ms
    }

    pub fn player_body(&self, client_id: &str) -> Option<BodyHandle> {
        self.member(client_id)?.body
    }

    fn member(&self, client_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.client_id == client_id)
    }

    fn everyone(&self) -> Vec<String> {
        self.members.iter().map(|m| m.client_id.clone()).collect()
    }

    fn everyone_but(&self, client_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.client_id != client_id)
            .map(|m| m.client_id.clone())
            .collect()
    }

    fn owner_of(&self, body: BodyHandle) -> Option<&Member> {
        self.members.iter().find(|m| m.body == Some(body))
    }

    fn vehicle_extras(&self, id: VehicleId) -> Option<VehicleExtras> {
        let vehicle = self.world.vehicle(id)?;
        Some(VehicleExtras::from_vehicle(vehicle, player_entity_id))
    }

    fn player_spawn(&self, member: &Member) -> Option<EntitySpawn> {
        let handle = member.body?;
        let body = self.world.body(handle)?;
        Some(EntitySpawn {
            entity_id: player_entity_id(handle),
            kind: EntityKind::Player,
            owner_id: Some(member.client_id.clone()),
            vehicle_type: None,
            position: body.position.into(),
            rotation: body.rotation.into(),
            vehicle: None,
        })
    }

    fn vehicle_spawn(&self, id: VehicleId) -> Option<EntitySpawn> {
        let vehicle = self.world.vehicle(id)?;
        let body = self.world.body(vehicle.body)?;
        Some(EntitySpawn {
            entity_id: vehicle_entity_id(id),
            kind: EntityKind::Vehicle,
            owner_id: None,
            vehicle_type: Some(vehicle.kind),
            position: body.position.into(),
            rotation: body.rotation.into(),
            vehicle: self.vehicle_extras(id),
        })
    }

    fn vehicle_update(&self, id: VehicleId) -> Option<EntityUpdate> {
        let vehicle = self.world.vehicle(id)?;
        let body = self.world.body(vehicle.body)?;
        Some(EntityUpdate {
            entity_id: vehicle_entity_id(id),
            position: body.position.into(),
            rotation: body.rotation.into(),
            velocity: body.velocity.into(),
            vehicle: self.vehicle_extras(id),
        })
    }

    fn join(&mut self, client_id: &str, username: &str, net: &NetConfig) -> Vec<Delivery> {
        self.members.push(Member {
            client_id: client_id.to_string(),
            username: username.to_string(),
            body: None,
        });
        let is_host = self.host() == Some(client_id);
        info!(
            "'{}' ({}) joined room '{}' ({} clients{})",
            username,
            client_id,
            self.id,
            self.members.len(),
            if is_host { ", host" } else { "" }
        );

        let mut out = vec![Delivery::one(
            client_id,
            Message::HandshakeResponse(HandshakeResponse {
                success: true,
                room_id: self.id.clone(),
                is_host,
                client_count: self.members.len(),
                physics_enabled: net.physics_enabled,
                physics_tick_rate: net.physics_tick_rate,
                network_broadcast_rate: net.broadcast_rate,
                client_id: Some(client_id.to_string()),
                error: None,
            }),
        )];

        let others = self.everyone_but(client_id);
        if !others.is_empty() {
            out.push(Delivery {
                to: others,
                message: Message::PlayerJoin(PlayerJoin {
                    client_id: client_id.to_string(),
                    username: username.to_string(),
                    entity_id: None,
                }),
            });
        }

        // Catch the newcomer up on what already exists.
        for spawn in self.members.iter().filter_map(|m| self.player_spawn(m)) {
            out.push(Delivery::one(client_id, Message::EntitySpawn(spawn)));
        }
        let ids: Vec<VehicleId> = self.world.vehicles().map(|v| v.id).collect();
        for spawn in ids.into_iter().filter_map(|id| self.vehicle_spawn(id)) {
            out.push(Delivery::one(client_id, Message::EntitySpawn(spawn)));
        }
        out
    }

    /// Remove a member and everything it owns. Unknown clients are a no-op.
    fn leave(&mut self, client_id: &str) -> Vec<Delivery> {
        let Some(index) = self.members.iter().position(|m| m.client_id == client_id) else {
            return Vec::new();
        };
        let member = self.members.remove(index);
        info!("'{}' ({}) left room '{}'", member.username, client_id, self.id);
        if index == 0 {
            if let Some(host) = self.host() {
                info!("{} is now host of room '{}'", host, self.id);
            }
        }

        let to = self.everyone();
        if to.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(handle) = member.body {
            let seated_in = self.world.vehicle_of(handle);
            self.world.remove_body(handle);
            out.push(Delivery {
                to: to.clone(),
                message: Message::EntityDestroy(EntityDestroy {
                    entity_id: player_entity_id(handle),
                }),
            });
            if let Some(update) = seated_in.and_then(|v| self.vehicle_update(v)) {
                out.push(Delivery {
                    to: to.clone(),
                    message: Message::EntityUpdate(update),
                });
            }
        }
        out.push(Delivery {
            to,
            message: Message::PlayerLeave(PlayerLeave {
                client_id: client_id.to_string(),
            }),
        });
        out
    }

    fn spawn_player(&mut self, client_id: &str, request: &SpawnPlayer) -> Vec<Delivery> {
        let Some(index) = self.members.iter().position(|m| m.client_id == client_id) else {
            return Vec::new();
        };
        if self.members[index].body.is_some() {
            debug!("{} asked for a second player body; ignored", client_id);
            return Vec::new();
        }

        let position = match request.position {
            Some(p) => Vec3::from(p),
            None => {
                let mut rng = rand::thread_rng();
                let jitter = Vec2::new(
                    rng.gen_range(-SPAWN_JITTER..=SPAWN_JITTER),
                    rng.gen_range(-SPAWN_JITTER..=SPAWN_JITTER),
                );
                let at = SPAWN_POINT + jitter;
                let ground = self.world.terrain().height_at(at.x, at.y);
                Vec3::new(at.x, ground + 1.5, at.y)
            }
        };
        let handle = match self.world.spawn_character(position) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Rejected player spawn for {}: {}", client_id, e);
                return vec![Delivery::one(client_id, Message::ChatMessage(ChatMessage::system(e.to_string())))];
            }
        };
        self.members[index].body = Some(handle);

        let Some(spawn) = self.player_spawn(&self.members[index]) else {
            return Vec::new();
        };
        vec![Delivery {
            to: self.everyone(),
            message: Message::EntitySpawn(spawn),
        }]
    }

    /// Spawn in front of the sender, or at an explicit position.
    fn spawn_vehicle(&mut self, client_id: &str, kind: VehicleType, at: Option<Vec3>) -> Result<Vec<Delivery>, RoomError> {
        let (ground_at, heading) = match at {
            Some(p) => (Vec2::new(p.x, p.z), 0.0),
            None => {
                let handle = self.player_body(client_id).ok_or(RoomError::NoPlayer)?;
                let body = self.world.body(handle).ok_or(RoomError::NoPlayer)?;
                let yaw = body.yaw();
                let ahead = body.position + forward_from_yaw(yaw) * VEHICLE_SPAWN_DISTANCE;
                (Vec2::new(ahead.x, ahead.z), yaw)
            }
        };
        let position = vehicle_spawn_position(&self.world, kind, ground_at);
        let id = self.world.spawn_vehicle(kind, position, heading)?;
        let Some(spawn) = self.vehicle_spawn(id) else {
            return Ok(Vec::new());
        };
        Ok(vec![Delivery {
            to: self.everyone(),
            message: Message::EntitySpawn(spawn),
        }])
    }

    fn chat(&mut self, client_id: &str, chat: &ChatMessage) -> Vec<Delivery> {
        let result = match parse_command(&chat.text) {
            None => {
                let sender = self.member(client_id).map(|m| m.username.clone());
                return vec![Delivery {
                    to: self.everyone(),
                    message: Message::ChatMessage(ChatMessage {
                        sender,
                        text: chat.text.clone(),
                        system: false,
                    }),
                }];
            }
            Some(Ok(ChatCommand::SpawnVehicle(kind))) => self.spawn_vehicle(client_id, kind, None),
            Some(Err(e)) => Err(e),
        };
        self.or_tell(client_id, result)
    }

    fn enter_vehicle(&mut self, client_id: &str, request: &EnterVehicle) -> Result<Vec<Delivery>, RoomError> {
        let body = self.player_body(client_id).ok_or(RoomError::NoPlayer)?;
        let vehicle = parse_vehicle_entity_id(&request.vehicle_id)
            .ok_or_else(|| RoomError::BadVehicleId(request.vehicle_id.clone()))?;
        self.world.enter_vehicle(body, vehicle, request.seat_index)?;
        Ok(self.announce_vehicle(vehicle))
    }

    fn exit_vehicle(&mut self, client_id: &str) -> Result<Vec<Delivery>, RoomError> {
        let body = self.player_body(client_id).ok_or(RoomError::NoPlayer)?;
        let vehicle = self.world.vehicle_of(body).ok_or(SeatError::NotSeated)?;
        self.world.exit_vehicle(body)?;
        Ok(self.announce_vehicle(vehicle))
    }

    fn announce_vehicle(&self, id: VehicleId) -> Vec<Delivery> {
        self.vehicle_update(id)
            .map(|update| Delivery {
                to: self.everyone(),
                message: Message::EntityUpdate(update),
            })
            .into_iter()
            .collect()
    }

    fn vehicle_input(&mut self, client_id: &str, msg: &VehicleInputMessage) {
        let Some(body) = self.player_body(client_id) else {
            return;
        };
        let accepted = parse_vehicle_entity_id(&msg.vehicle_id)
            .is_some_and(|id| self.world.set_vehicle_input(body, id, msg.input));
        if !accepted {
            debug!("Dropped vehicle input from {} for {}", client_id, msg.vehicle_id);
        }
    }

    /// Rejections become a system chat line for the sender only.
    fn or_tell(&self, client_id: &str, result: Result<Vec<Delivery>, RoomError>) -> Vec<Delivery> {
        match result {
            Ok(out) => out,
            Err(e) => {
                debug!("Rejected request from {}: {}", client_id, e);
                vec![Delivery::one(client_id, Message::ChatMessage(ChatMessage::system(e.to_string())))]
            }
        }
    }

    fn handle(&mut self, client_id: &str, message: &Message) -> Vec<Delivery> {
        match message {
            Message::SpawnPlayer(request) => self.spawn_player(client_id, request),
            Message::SpawnVehicle(SpawnVehicle { vehicle_type, position }) => {
                let result = vehicle_type
                    .parse::<VehicleType>()
                    .map_err(RoomError::from)
                    .and_then(|kind| self.spawn_vehicle(client_id, kind, position.map(Vec3::from)));
                self.or_tell(client_id, result)
            }
            Message::PlayerInput(input) => {
                if let Some(body) = self.player_body(client_id) {
                    self.world.set_player_input(body, *input);
                }
                Vec::new()
            }
            Message::VehicleInput(msg) => {
                self.vehicle_input(client_id, msg);
                Vec::new()
            }
            Message::ChatMessage(chat) => self.chat(client_id, chat),
            Message::Ping(ping) => vec![Delivery::one(client_id, Message::Pong(*ping))],
            Message::EnterVehicle(request) => {
                let result = self.enter_vehicle(client_id, request);
                self.or_tell(client_id, result)
            }
            Message::ExitVehicle(_) => {
                let result = self.exit_vehicle(client_id);
                self.or_tell(client_id, result)
            }
            Message::FireWeapon(_) => {
                if let Some(body) = self.player_body(client_id) {
                    self.world.fire_weapon(body);
                }
                Vec::new()
            }
            Message::Handshake(_)
            | Message::HandshakeResponse(_)
            | Message::PhysicsState(_)
            | Message::EntitySpawn(_)
            | Message::EntityUpdate(_)
            | Message::EntityDestroy(_)
            | Message::PlayerJoin(_)
            | Message::PlayerLeave(_)
            | Message::Pong(_) => {
                warn!("Ignoring {} from client {}", message.type_name(), client_id);
                Vec::new()
            }
        }
    }

    /// One fixed step, plus a state broadcast when the broadcast period has elapsed.
    pub fn step(&mut self, dt: f32, net: &NetConfig) -> Vec<Delivery> {
        self.world.step(dt);
        let events = self.world.drain_events();
        self.handlers.dispatch_all(&events);
        self.clock_ms += f64::from(dt) * 1000.0;

        self.since_broadcast += f64::from(dt);
        let period = net.broadcast_period();
        if self.since_broadcast + 1e-9 < period || self.members.is_empty() {
            return Vec::new();
        }
        self.since_broadcast = (self.since_broadcast - period).max(0.0);
        self.broadcasts = self.broadcasts.wrapping_add(1);
        self.broadcast()
    }

    fn broadcast(&self) -> Vec<Delivery> {
        let vehicles: HashMap<BodyHandle, (VehicleId, VehicleType)> = self
            .world
            .vehicles()
            .map(|v| (v.body, (v.id, v.kind)))
            .collect();
        let bodies = self
            .world
            .bodies()
            .filter_map(|body| match (body.kind, vehicles.get(&body.handle)) {
                (BodyKind::Vehicle, Some(&(id, kind))) => Some(BodySnapshot::from_body(
                    vehicle_entity_id(id),
                    EntityKind::Vehicle,
                    body,
                    Some(kind),
                )),
                (BodyKind::Character, _) if self.owner_of(body.handle).is_some() => Some(
                    BodySnapshot::from_body(player_entity_id(body.handle), EntityKind::Player, body, None),
                ),
                _ => None,
            })
            .collect();

        let to = self.everyone();
        let mut out = vec![Delivery {
            to: to.clone(),
            message: Message::PhysicsState(PhysicsState {
                timestamp: self.clock_ms,
                bodies,
            }),
        }];
        if self.broadcasts % VEHICLE_UPDATE_EVERY == 0 {
            out.extend(vehicles.values().filter_map(|&(id, _)| {
                Some(Delivery {
                    to: to.clone(),
                    message: Message::EntityUpdate(self.vehicle_update(id)?),
                })
            }));
        }
        out
    }
}

/// Resting height for a freshly spawned vehicle at a ground position.
fn vehicle_spawn_position(world: &PhysicsWorld, kind: VehicleType, at: Vec2) -> Vec3 {
    let ground = world.terrain().height_at(at.x, at.y);
    let def = vehicle_def(kind);
    let clearance = if kind.is_aircraft() {
        def.half_extents.y
    } else {
        def.rest_length
    };
    Vec3::new(at.x, ground + clearance, at.y)
}

/// All rooms on this server, keyed by room id.
#[derive(Resource)]
pub struct Rooms {
    rooms: HashMap<String, Room>,
    /// client id -> room id
    membership: HashMap<String, String>,
    terrain: Arc<dyn HeightField>,
    pub net: NetConfig,
    /// Room joined by handshakes that don't name one.
    pub default_room: String,
}

impl Rooms {
    pub fn new(terrain: Arc<dyn HeightField>, net: NetConfig) -> Self {
        Self {
            rooms: HashMap::new(),
            membership: HashMap::new(),
            terrain,
            net,
            default_room: DEFAULT_ROOM.to_string(),
        }
    }

    pub fn room(&self, id: &str) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn room_of(&self, client_id: &str) -> Option<&Room> {
        self.rooms.get(self.membership.get(client_id)?)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Join (creating the room if needed). A client already in a room leaves it first.
    pub fn handshake(&mut self, client_id: &str, request: &HandshakeRequest) -> Vec<Delivery> {
        let refuse = |room_id: &str, error: String| {
            vec![Delivery::one(
                client_id,
                Message::HandshakeResponse(HandshakeResponse {
                    success: false,
                    room_id: room_id.to_string(),
                    is_host: false,
                    client_count: 0,
                    physics_enabled: false,
                    physics_tick_rate: 0.0,
                    network_broadcast_rate: 0.0,
                    client_id: None,
                    error: Some(error),
                }),
            )]
        };

        if let Err(e) = check_version(request) {
            warn!("Refused handshake from {}: {}", client_id, e);
            return refuse(&request.room_id, e.to_string());
        }

        let mut out = self.leave(client_id);
        let room_id = match request.room_id.trim() {
            "" => self.default_room.clone(),
            id => id.to_string(),
        };
        let room_id = room_id.as_str();
        if !self.rooms.contains_key(room_id) {
            match Room::open(room_id, self.terrain.clone()) {
                Ok(room) => {
                    self.rooms.insert(room_id.to_string(), room);
                }
                Err(e) => {
                    error!("Room '{}' failed to open: {}", room_id, e);
                    out.extend(refuse(room_id, e.to_string()));
                    return out;
                }
            }
        }
        let Some(room) = self.rooms.get_mut(room_id) else {
            return out;
        };
        out.extend(room.join(client_id, &request.username, &self.net));
        self.membership.insert(client_id.to_string(), room_id.to_string());
        out
    }

    /// Dispatch one decoded message from a client.
    pub fn handle(&mut self, client_id: &str, message: &Message) -> Vec<Delivery> {
        if let Message::Handshake(request) = message {
            return self.handshake(client_id, request);
        }
        let Some(room) = self
            .membership
            .get(client_id)
            .and_then(|id| self.rooms.get_mut(id))
        else {
            debug!("{} from {} before handshake; dropped", message.type_name(), client_id);
            return Vec::new();
        };
        room.handle(client_id, message)
    }

    /// Drop a client. The room closes when its last client leaves.
    pub fn leave(&mut self, client_id: &str) -> Vec<Delivery> {
        let Some(room_id) = self.membership.remove(client_id) else {
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };
        let out = room.leave(client_id);
        if room.is_empty() {
            self.rooms.remove(&room_id);
            info!("Room '{}' closed", room_id);
        }
        out
    }

    /// Step every room once.
    pub fn step(&mut self, dt: f32) -> Vec<Delivery> {
        let net = &self.net;
        self.rooms
            .values_mut()
            .flat_map(|room| room.step(dt, net))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::controller::PlayerInput;
    use shared::protocol::{Empty, Ping, PROTOCOL_VERSION};
    use shared::terrain::FlatTerrain;

    fn rooms() -> Rooms {
        Rooms::new(Arc::new(FlatTerrain::new(0.0)), NetConfig::default())
    }

    fn hello(room: &str, name: &str) -> Message {
        Message::Handshake(HandshakeRequest {
            room_id: room.into(),
            username: name.into(),
            version: PROTOCOL_VERSION.into(),
        })
    }

    fn response(out: &[Delivery]) -> &HandshakeResponse {
        out.iter()
            .find_map(|d| match &d.message {
                Message::HandshakeResponse(r) => Some(r),
                _ => None,
            })
            .expect("handshake response")
    }

    fn system_chat_to<'a>(out: &'a [Delivery], client: &str) -> Option<&'a ChatMessage> {
        out.iter().find_map(|d| match &d.message {
            Message::ChatMessage(c) if c.system && d.to == [client.to_string()] => Some(c),
            _ => None,
        })
    }

    fn chat(text: &str) -> Message {
        Message::ChatMessage(ChatMessage {
            sender: None,
            text: text.into(),
            system: false,
        })
    }

    #[test]
    fn first_client_hosts() {
        let mut r = rooms();
        let out = r.handle("a", &hello("lobby", "ana"));
        let first = response(&out);
        assert!(first.success);
        assert!(first.is_host);
        assert_eq!(first.client_count, 1);
        assert_eq!(first.physics_tick_rate, 60.0);
        assert_eq!(first.network_broadcast_rate, 20.0);

        let out = r.handle("b", &hello("lobby", "bo"));
        let second = response(&out);
        assert!(!second.is_host);
        assert_eq!(second.client_count, 2);
        assert!(out
            .iter()
            .any(|d| matches!(d.message, Message::PlayerJoin(_)) && d.to == ["a".to_string()]));
        // The newcomer learns about the parked vehicles.
        let spawns = out
            .iter()
            .filter(|d| matches!(d.message, Message::EntitySpawn(_)) && d.to == ["b".to_string()])
            .count();
        assert_eq!(spawns, ROOM_VEHICLES.len());
    }

    #[test]
    fn version_mismatch_is_refused() {
        let mut r = rooms();
        let out = r.handle(
            "a",
            &Message::Handshake(HandshakeRequest {
                room_id: "lobby".into(),
                username: "ana".into(),
                version: "0.1".into(),
            }),
        );
        let resp = response(&out);
        assert!(!resp.success);
        assert!(resp.error.is_some());
        assert_eq!(r.room_count(), 0);
    }

    #[test]
    fn room_closes_when_empty_and_host_moves_on() {
        let mut r = rooms();
        r.handle("a", &hello("lobby", "ana"));
        r.handle("b", &hello("lobby", "bo"));
        let out = r.leave("a");
        assert!(out.iter().any(|d| matches!(d.message, Message::PlayerLeave(_))));
        assert_eq!(r.room("lobby").and_then(|room| room.host()), Some("b"));

        r.leave("b");
        assert_eq!(r.room_count(), 0);
        assert!(r.leave("b").is_empty());

        let out = r.handle("c", &hello("lobby", "cy"));
        assert!(response(&out).is_host);
    }

    #[test]
    fn unnamed_room_uses_default() {
        let mut r = rooms();
        r.default_room = "arena".into();
        let out = r.handle("a", &hello("  ", "ana"));
        assert_eq!(response(&out).room_id, "arena");
        assert!(r.room_of("a").is_some_and(|room| room.id == "arena"));
    }

    #[test]
    fn messages_before_handshake_are_dropped() {
        let mut r = rooms();
        assert!(r.handle("a", &Message::SpawnPlayer(SpawnPlayer::default())).is_empty());
    }

    #[test]
    fn spawnvehicle_command() {
        let mut r = rooms();
        r.handle("a", &hello("lobby", "ana"));
        r.handle("b", &hello("lobby", "bo"));
        r.handle(
            "a",
            &Message::SpawnPlayer(SpawnPlayer {
                position: Some(Vec3::new(0.0, 1.0, 0.0).into()),
            }),
        );

        let out = r.handle("a", &chat("/spawnvehicle tank"));
        let spawn = out
            .iter()
            .find_map(|d| match &d.message {
                Message::EntitySpawn(s) => Some((s, &d.to)),
                _ => None,
            })
            .expect("entity_spawn");
        assert_eq!(spawn.0.vehicle_type, Some(VehicleType::Tank));
        assert_eq!(spawn.1.len(), 2);
        // Yaw 0 faces -Z.
        assert!(spawn.0.position.z < -5.0);

        let out = r.handle("a", &chat("/spawnvehicle boat"));
        let reply = system_chat_to(&out, "a").expect("system chat");
        assert!(reply.text.contains("boat"));
        assert_eq!(out.len(), 1);

        let out = r.handle("b", &chat("/spawnvehicle jeep"));
        assert!(system_chat_to(&out, "b").is_some());
    }

    #[test]
    fn plain_chat_is_relayed_with_sender() {
        let mut r = rooms();
        r.handle("a", &hello("lobby", "ana"));
        r.handle("b", &hello("lobby", "bo"));
        let out = r.handle("b", &chat("hi"));
        let Message::ChatMessage(msg) = &out[0].message else {
            panic!("expected chat");
        };
        assert_eq!(msg.sender.as_deref(), Some("bo"));
        assert!(!msg.system);
        assert_eq!(out[0].to.len(), 2);
    }

    #[test]
    fn parses_commands() {
        assert!(parse_command("hello").is_none());
        assert!(matches!(
            parse_command("/spawnvehicle heli"),
            Some(Ok(ChatCommand::SpawnVehicle(VehicleType::Helicopter)))
        ));
        assert!(matches!(parse_command("/spawnvehicle"), Some(Err(RoomError::Usage(_)))));
        assert!(matches!(parse_command("/fly"), Some(Err(RoomError::UnknownCommand(_)))));
    }

    #[test]
    fn seats_and_leaving() {
        let mut r = rooms();
        r.handle("a", &hello("lobby", "ana"));
        r.handle("b", &hello("lobby", "bo"));
        for (client, x) in [("a", 8.0), ("b", 9.0)] {
            r.handle(
                client,
                &Message::SpawnPlayer(SpawnPlayer {
                    position: Some(Vec3::new(x, 1.0, -3.0).into()),
                }),
            );
        }
        let jeep = r
            .room("lobby")
            .and_then(|room| room.world().vehicles().find(|v| v.kind == VehicleType::Jeep))
            .map(|v| vehicle_entity_id(v.id))
            .expect("parked jeep");

        let enter = |seat| {
            Message::EnterVehicle(EnterVehicle {
                vehicle_id: jeep.clone(),
                seat_index: Some(seat),
            })
        };
        let out = r.handle("a", &enter(0));
        assert!(matches!(out[0].message, Message::EntityUpdate(_)));

        let out = r.handle("b", &enter(0));
        assert!(system_chat_to(&out, "b").is_some());

        let out = r.handle("b", &Message::ExitVehicle(Empty {}));
        assert!(system_chat_to(&out, "b").is_some());

        let out = r.leave("a");
        let update = out
            .iter()
            .find_map(|d| match &d.message {
                Message::EntityUpdate(u) => Some(u),
                _ => None,
            })
            .expect("vehicle update after leave");
        assert!(update.vehicle.as_ref().is_some_and(|v| v.occupants.is_empty()));
        assert!(r.handle("b", &enter(0)).iter().all(|d| !matches!(d.message, Message::ChatMessage(_))));
    }

    #[test]
    fn ping_pong() {
        let mut r = rooms();
        r.handle("a", &hello("lobby", "ana"));
        let out = r.handle("a", &Message::Ping(Ping { time: 42.0 }));
        assert_eq!(out, vec![Delivery::one("a", Message::Pong(Ping { time: 42.0 }))]);
    }

    #[test]
    fn broadcasts_at_twenty_hertz() {
        let mut r = rooms();
        r.handle("a", &hello("lobby", "ana"));
        r.handle("a", &Message::SpawnPlayer(SpawnPlayer::default()));
        r.handle(
            "a",
            &Message::PlayerInput(PlayerInput {
                forward: true,
                ..Default::default()
            }),
        );
        let mut states = 0;
        for _ in 0..60 {
            for d in r.step(1.0 / 60.0) {
                if let Message::PhysicsState(state) = &d.message {
                    states += 1;
                    assert_eq!(state.bodies.len(), 1 + ROOM_VEHICLES.len());
                }
            }
        }
        assert!((19..=20).contains(&states), "{states} broadcasts");
    }
}
