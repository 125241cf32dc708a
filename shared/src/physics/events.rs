//! Simulation events and the handler table that consumes them.
//!
//! The step never performs presentation side effects itself. It queues `SimEvent`s; whoever
//! owns the world drains them and dispatches through `EventHandlers`.

use std::collections::HashMap;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::body::BodyHandle;
use crate::vehicle::weapons::WeaponKind;
use crate::vehicle::VehicleId;

/// Id of a dynamic volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    WeaponFired {
        vehicle: VehicleId,
        seat: usize,
        weapon: WeaponKind,
        origin: Vec3,
        direction: Vec3,
    },
    BombReleased {
        vehicle: VehicleId,
        projectile: u32,
        origin: Vec3,
        velocity: Vec3,
    },
    Explosion {
        vehicle: VehicleId,
        projectile: u32,
        position: Vec3,
    },
    /// A body's position lies inside a volume this step.
    VolumeEffect {
        volume: VolumeId,
        tag: String,
        body: BodyHandle,
        dt: f32,
    },
    Landed {
        body: BodyHandle,
        impact_speed: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimEventKind {
    WeaponFired,
    BombReleased,
    Explosion,
    VolumeEffect,
    Landed,
}

impl SimEvent {
    pub fn kind(&self) -> SimEventKind {
        match self {
            SimEvent::WeaponFired { .. } => SimEventKind::WeaponFired,
            SimEvent::BombReleased { .. } => SimEventKind::BombReleased,
            SimEvent::Explosion { .. } => SimEventKind::Explosion,
            SimEvent::VolumeEffect { .. } => SimEventKind::VolumeEffect,
            SimEvent::Landed { .. } => SimEventKind::Landed,
        }
    }
}

pub type EventHandler = Box<dyn FnMut(&SimEvent) + Send + Sync>;

/// Handlers keyed by event kind, called in registration order.
#[derive(Default)]
pub struct EventHandlers {
    handlers: HashMap<SimEventKind, Vec<EventHandler>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: SimEventKind, handler: impl FnMut(&SimEvent) + Send + Sync + 'static) {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Run every handler registered for the event's kind. Returns how many ran.
    pub fn dispatch(&mut self, event: &SimEvent) -> usize {
        match self.handlers.get_mut(&event.kind()) {
            Some(list) => {
                for handler in list.iter_mut() {
                    handler(event);
                }
                list.len()
            }
            None => 0,
        }
    }

    pub fn dispatch_all<'a>(&mut self, events: impl IntoIterator<Item = &'a SimEvent>) {
        for event in events {
            self.dispatch(event);
        }
    }

    pub fn has_handlers(&self, kind: SimEventKind) -> bool {
        self.handlers.get(&kind).is_some_and(|l| !l.is_empty())
    }
}
