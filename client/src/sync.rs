//! Server state mirrored on this client
//!
//! Remote bodies are rendered from interpolation buffers a little in the past.
//! Our own character is predicted locally and pulled back toward the server.

use std::collections::HashMap;

use bevy::prelude::*;
use lightyear::prelude::*;
use shared::controller::PlayerInput;
use shared::interpolation::{interpolation_delay_ms, RemoteBuffers};
use shared::physics::{BodyHandle, PhysicsWorld};
use shared::protocol::{
    BodySnapshot, ChatMessage, EntityKind, EntitySpawn, EntityUpdate, HandshakeResponse, Message,
    PhysicsState, SpawnPlayer, VehicleExtras, WireFrame,
};
use shared::vehicle::VehicleType;

use crate::input::ClientArgs;
use crate::states::GameState;
use crate::systems::connection::{send_message, GameClient, Session};

/// Position error (m) beyond which the prediction snaps to the server.
const SNAP_DISTANCE: f32 = 2.0;
/// Fraction of a smaller error removed per snapshot.
const CORRECTION_RATE: f32 = 0.1;
/// How fast (ms per snapshot) a stale clock offset is allowed to shrink.
const CLOCK_DRIFT_PER_SAMPLE: f64 = 0.5;

/// A networked entity mirrored on this client.
#[derive(Component, Debug, Clone)]
pub struct NetEntity {
    pub id: String,
    pub kind: EntityKind,
    pub vehicle_type: Option<VehicleType>,
}

/// Marker for the character this client controls.
#[derive(Component)]
pub struct LocalPlayer;

/// Latest vehicle extras (seats, heading, tilt) from the server.
#[derive(Component, Debug, Clone, Default)]
pub struct VehicleState(pub VehicleExtras);

/// Entity id to ECS entity.
#[derive(Resource, Debug, Default)]
pub struct NetEntities {
    by_id: HashMap<String, Entity>,
}

impl NetEntities {
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Offset from the local clock to the room clock the server stamps snapshots with.
///
/// The largest observed `server - local` is the sample with the least transit delay.
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct ServerClock {
    offset_ms: Option<f64>,
}

impl ServerClock {
    pub fn observe(&mut self, server_ms: f64, local_ms: f64) {
        let sample = server_ms - local_ms;
        self.offset_ms = Some(match self.offset_ms {
            Some(offset) => sample.max(offset - CLOCK_DRIFT_PER_SAMPLE),
            None => sample,
        });
    }

    /// Estimated room clock, once a snapshot has arrived.
    pub fn server_now(&self, local_ms: f64) -> Option<f64> {
        self.offset_ms.map(|offset| local_ms + offset)
    }
}

/// Client-side simulation of our own character.
#[derive(Resource)]
pub struct LocalPrediction {
    world: PhysicsWorld,
    body: Option<BodyHandle>,
    input: PlayerInput,
    /// While seated the server owns our pose outright.
    seated: bool,
}

impl LocalPrediction {
    pub fn new(world: PhysicsWorld) -> Self {
        Self {
            world,
            body: None,
            input: PlayerInput::default(),
            seated: false,
        }
    }

    pub fn spawn(&mut self, position: Vec3) {
        if let Some(old) = self.body.take() {
            self.world.remove_body(old);
        }
        match self.world.spawn_character(position) {
            Ok(handle) => self.body = Some(handle),
            Err(e) => error!("Failed to spawn predicted character: {}", e),
        }
    }

    pub fn despawn(&mut self) {
        if let Some(handle) = self.body.take() {
            self.world.remove_body(handle);
        }
    }

    pub fn set_input(&mut self, input: PlayerInput) {
        self.input = input;
    }

    pub fn set_seated(&mut self, seated: bool) {
        self.seated = seated;
    }

    /// Advance by wall-clock time in fixed steps.
    pub fn advance(&mut self, dt: f32) {
        let Some(handle) = self.body else {
            return;
        };
        if self.seated {
            return;
        }
        self.world.set_player_input(handle, self.input);
        self.world.advance(dt);
    }

    /// Blend toward an authoritative snapshot; snap when far off or seated.
    /// Returns true when it snapped.
    pub fn reconcile(&mut self, snapshot: &BodySnapshot) -> bool {
        let Some(handle) = self.body else {
            return false;
        };
        let server_pos: Vec3 = snapshot.position.into();
        let server_vel: Vec3 = snapshot.velocity.into();
        let server_rot: Quat = snapshot.rotation.into();
        let Some(body) = self.world.body_mut(handle) else {
            return false;
        };
        let error = server_pos - body.position;
        if self.seated || error.length() > SNAP_DISTANCE {
            self.world.apply_remote_state(handle, server_pos, server_rot, server_vel);
            return true;
        }
        body.position += error * CORRECTION_RATE;
        false
    }

    pub fn pose(&self) -> Option<(Vec3, Quat)> {
        let body = self.world.body(self.body?)?;
        Some((body.position, body.rotation))
    }
}

fn local_ms(time: &Time) -> f64 {
    time.elapsed_secs_f64() * 1000.0
}

fn transform_of(spawn: &EntitySpawn) -> Transform {
    Transform::from_translation(spawn.position.into()).with_rotation(spawn.rotation.into())
}

/// Everything inbound frames may touch.
#[derive(bevy::ecs::system::SystemParam)]
pub struct SyncState<'w, 's> {
    commands: Commands<'w, 's>,
    session: ResMut<'w, Session>,
    entities: ResMut<'w, NetEntities>,
    buffers: ResMut<'w, RemoteBuffers>,
    clock: ResMut<'w, ServerClock>,
    prediction: ResMut<'w, LocalPrediction>,
    next_state: ResMut<'w, NextState<GameState>>,
    vehicles: Query<'w, 's, &'static mut VehicleState>,
    exit: MessageWriter<'w, AppExit>,
}

/// Drain received frames and apply them.
pub fn receive_frames(
    mut client: Query<(&mut MessageReceiver<WireFrame>, &mut MessageSender<WireFrame>), With<GameClient>>,
    args: Res<ClientArgs>,
    time: Res<Time>,
    mut sync: SyncState,
) {
    let Ok((mut receiver, mut sender)) = client.single_mut() else {
        return;
    };
    let now = local_ms(&time);
    for frame in receiver.receive() {
        let envelope = match frame.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping bad frame: {}", e);
                continue;
            }
        };
        match envelope.message {
            Message::HandshakeResponse(response) => {
                on_handshake(&mut sync, &mut sender, &args, response, now);
            }
            Message::EntitySpawn(spawn) => on_spawn(&mut sync, spawn),
            Message::EntityUpdate(update) => on_update(&mut sync, update),
            Message::EntityDestroy(destroy) => on_destroy(&mut sync, &destroy.entity_id),
            Message::PhysicsState(state) => on_physics_state(&mut sync, &state, now),
            Message::PlayerJoin(join) => info!("{} joined ({})", join.username, join.client_id),
            Message::PlayerLeave(leave) => info!("{} left", leave.client_id),
            Message::ChatMessage(ChatMessage { sender, text, system }) => match (system, sender) {
                (true, _) | (_, None) => info!("[system] {}", text),
                (false, Some(from)) => info!("<{}> {}", from, text),
            },
            Message::Pong(ping) => debug!("Round trip {:.1} ms", now - ping.time),
            other => warn!("Unexpected {} from server", other.type_name()),
        }
    }
}

fn on_handshake(
    sync: &mut SyncState,
    sender: &mut MessageSender<WireFrame>,
    args: &ClientArgs,
    response: HandshakeResponse,
    now: f64,
) {
    if !response.success {
        error!(
            "Server refused to join: {}",
            response.error.as_deref().unwrap_or("no reason given")
        );
        sync.exit.write(AppExit::error());
        return;
    }
    info!(
        "Joined room '{}' ({} clients{})",
        response.room_id,
        response.client_count,
        if response.is_host { ", host" } else { "" }
    );
    sync.session.client_id = response.client_id;
    sync.session.room_id = response.room_id;
    sync.session.is_host = response.is_host;
    sync.buffers.delay_ms = interpolation_delay_ms(response.network_broadcast_rate);

    send_message(sender, &sync.session, Message::SpawnPlayer(SpawnPlayer { position: None }), now);
    if let Some(kind) = args.spawn_vehicle {
        let chat = ChatMessage {
            sender: None,
            text: format!("/spawnvehicle {}", kind),
            system: false,
        };
        send_message(sender, &sync.session, Message::ChatMessage(chat), now);
    }
    sync.next_state.set(GameState::Playing);
}

fn on_spawn(sync: &mut SyncState, spawn: EntitySpawn) {
    if sync.entities.by_id.contains_key(&spawn.entity_id) {
        return;
    }
    let mut entity = sync.commands.spawn((
        NetEntity {
            id: spawn.entity_id.clone(),
            kind: spawn.kind,
            vehicle_type: spawn.vehicle_type,
        },
        transform_of(&spawn),
    ));
    if let Some(extras) = &spawn.vehicle {
        entity.insert(VehicleState(extras.clone()));
    }

    let ours = spawn.owner_id.is_some() && spawn.owner_id == sync.session.client_id;
    if ours {
        entity.insert(LocalPlayer);
        info!("Spawned as {}", spawn.entity_id);
        sync.buffers.mark_local(spawn.entity_id.clone());
        sync.prediction.spawn(spawn.position.into());
        sync.session.player_entity = Some(spawn.entity_id.clone());
    } else {
        debug!("Entity {} ({:?}) appeared", spawn.entity_id, spawn.kind);
    }
    let id = entity.id();
    sync.entities.by_id.insert(spawn.entity_id, id);
}

fn on_update(sync: &mut SyncState, update: EntityUpdate) {
    let Some(extras) = update.vehicle else {
        return;
    };
    if let Some(me) = sync.session.player_entity.clone() {
        let seat = extras
            .occupants
            .iter()
            .find(|o| o.occupant_id == me)
            .map(|o| o.seat_index);
        let was_here = matches!(&sync.session.seat, Some((v, _)) if *v == update.entity_id);
        match seat {
            Some(index) if !was_here => {
                info!("Seated in {} (seat {})", update.entity_id, index);
                sync.session.seat = Some((update.entity_id.clone(), index));
                sync.prediction.set_seated(true);
            }
            None if was_here => {
                info!("Left {}", update.entity_id);
                sync.session.seat = None;
                sync.prediction.set_seated(false);
            }
            _ => {}
        }
    }
    if let Some(entity) = sync.entities.get(&update.entity_id) {
        if let Ok(mut state) = sync.vehicles.get_mut(entity) {
            state.0 = extras;
        } else {
            sync.commands.entity(entity).insert(VehicleState(extras));
        }
    }
}

fn on_destroy(sync: &mut SyncState, entity_id: &str) {
    if let Some(entity) = sync.entities.by_id.remove(entity_id) {
        sync.commands.entity(entity).despawn();
    }
    sync.buffers.remove(entity_id);
    if sync.session.player_entity.as_deref() == Some(entity_id) {
        warn!("Our character {} was removed", entity_id);
        sync.session.player_entity = None;
        sync.session.seat = None;
        sync.prediction.despawn();
    }
}

fn on_physics_state(sync: &mut SyncState, state: &PhysicsState, now: f64) {
    sync.clock.observe(state.timestamp, now);
    for body in &state.bodies {
        if sync.buffers.is_local(&body.entity_id) {
            sync.prediction.reconcile(body);
        } else {
            sync.buffers.ingest(&body.entity_id, body.to_remote_state(state.timestamp));
        }
    }
}

/// Step our predicted character.
pub fn predict_local_player(time: Res<Time>, mut prediction: ResMut<LocalPrediction>) {
    prediction.advance(time.delta_secs());
}

/// Write interpolated poses to remote entities and the predicted pose to ours.
pub fn apply_interpolation(
    time: Res<Time>,
    clock: Res<ServerClock>,
    buffers: Res<RemoteBuffers>,
    prediction: Res<LocalPrediction>,
    mut remote: Query<(&NetEntity, &mut Transform), Without<LocalPlayer>>,
    mut local: Query<&mut Transform, With<LocalPlayer>>,
) {
    if let Some(server_now) = clock.server_now(local_ms(&time)) {
        for (net, mut transform) in remote.iter_mut() {
            if let Some(state) = buffers.sample(&net.id, server_now) {
                transform.translation = state.position;
                transform.rotation = state.rotation;
            }
        }
    }
    if let (Ok(mut transform), Some((position, rotation))) = (local.single_mut(), prediction.pose()) {
        transform.translation = position;
        transform.rotation = rotation;
    }
}
