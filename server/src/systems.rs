//! Lightyear glue: client links in, decoded envelopes to `Rooms`, deliveries back out.

use std::collections::HashMap;

use bevy::prelude::*;
use lightyear::prelude::*;
use lightyear::prelude::server::*;

use shared::protocol::{ReliableChannel, StateChannel, WireFrame};

use crate::rooms::{Delivery, Rooms};

/// Session data attached to each client link entity.
#[derive(Component, Debug, Clone)]
pub struct ClientSession {
    pub client_id: String,
}

/// Deliveries waiting for the end-of-tick flush.
#[derive(Resource, Default)]
pub struct Outbox {
    pending: Vec<Delivery>,
}

impl Outbox {
    pub fn extend(&mut self, deliveries: impl IntoIterator<Item = Delivery>) {
        self.pending.extend(deliveries);
    }
}

fn new_client_id() -> String {
    format!("client-{:08x}", rand::random::<u32>())
}

/// Give each freshly connected link its message endpoints and a client id.
/// The client still has to `handshake` before it belongs to a room.
pub fn handle_connections(
    mut commands: Commands,
    new_clients: Query<(Entity, &RemoteId), (Added<Connected>, With<ClientOf>)>,
) {
    for (client_entity, remote_id) in new_clients.iter() {
        let client_id = new_client_id();
        info!("Client connected: {:?} as {}", remote_id.0, client_id);
        commands.entity(client_entity).insert((
            ClientSession { client_id },
            MessageReceiver::<WireFrame>::default(),
            MessageSender::<WireFrame>::default(),
        ));
    }
}

/// Observer: a link dropped. Its room membership (and body) goes with it.
pub fn handle_disconnections(
    trigger: On<Add, Disconnected>,
    sessions: Query<&ClientSession>,
    mut rooms: ResMut<Rooms>,
    mut outbox: ResMut<Outbox>,
) {
    let Ok(session) = sessions.get(trigger.entity) else {
        return;
    };
    let room = rooms.room_of(&session.client_id).map(|r| r.id.clone());
    outbox.extend(rooms.leave(&session.client_id));
    info!(
        "Client {} disconnected from {:?} ({} rooms open)",
        session.client_id,
        room,
        rooms.room_count()
    );
}

/// Decode every frame received this tick and hand it to the rooms.
pub fn receive_frames(
    mut links: Query<(&ClientSession, &mut MessageReceiver<WireFrame>), With<ClientOf>>,
    mut rooms: ResMut<Rooms>,
    mut outbox: ResMut<Outbox>,
) {
    for (session, mut receiver) in links.iter_mut() {
        for frame in receiver.receive() {
            match frame.decode() {
                Ok(envelope) => outbox.extend(rooms.handle(&session.client_id, &envelope.message)),
                Err(e) => warn!("Bad frame from {}: {}", session.client_id, e),
            }
        }
    }
}

/// Advance every room by one fixed tick.
pub fn step_rooms(time: Res<Time>, mut rooms: ResMut<Rooms>, mut outbox: ResMut<Outbox>) {
    let deliveries = rooms.step(time.delta_secs());
    outbox.extend(deliveries);
}

/// Encode each pending delivery once and send it to every recipient that is still linked.
pub fn flush_outbox(
    time: Res<Time>,
    mut outbox: ResMut<Outbox>,
    mut links: Query<(Entity, &ClientSession, &mut MessageSender<WireFrame>), With<ClientOf>>,
) {
    if outbox.pending.is_empty() {
        return;
    }
    let by_client: HashMap<String, Entity> = links
        .iter()
        .map(|(entity, session, _)| (session.client_id.clone(), entity))
        .collect();
    let now_ms = time.elapsed_secs_f64() * 1000.0;

    for delivery in outbox.pending.drain(..) {
        let frame = match delivery.envelope(now_ms).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {}: {}", delivery.message.type_name(), e);
                continue;
            }
        };
        let unreliable = delivery.message.is_unreliable();
        for client_id in &delivery.to {
            let Some(&entity) = by_client.get(client_id) else {
                continue;
            };
            let Ok((_, _, mut sender)) = links.get_mut(entity) else {
                continue;
            };
            if unreliable {
                sender.send::<StateChannel>(frame.clone());
            } else {
                sender.send::<ReliableChannel>(frame.clone());
            }
        }
    }
}
