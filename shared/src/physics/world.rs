//! The body registry and fixed-step driver for one room.
//!
//! Per fixed step, in order:
//! 1. vehicle chassis colliders are refreshed (owned by their chassis body)
//! 2. character controllers apply stored input
//! 3. vehicle forces
//! 4. the integrator advances every free body
//! 5. vehicle contact handling
//! 6. seated bodies follow their seat
//! 7. bombs
//! 8. landing events
//!
//! Colliders and volumes change only between steps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bevy::prelude::*;

use super::body::{Body, BodyConfig, BodyHandle, BodyKind};
use super::collider::{Aabb, ChunkKey, Collider, ColliderId, ColliderIndex};
use super::events::{SimEvent, VolumeId};
use super::integrator::{step_body, StepContext, Volume};
use crate::config::PhysicsConfig;
use crate::controller::{apply_player_input, CharacterController, CharacterTuning, PlayerInput};
use crate::error::{ConfigError, SeatError};
use crate::terrain::HeightField;
use crate::vehicle::weapons::{step_projectile, weapon_for, Projectile, ProjectileStep, WeaponKind};
use crate::vehicle::{
    self, DynamicsMode, Vehicle, VehicleId, VehicleInput, VehicleType, INTERACTION_RADIUS,
};

/// Vertical speed at touchdown above which a `Landed` event is emitted.
pub const LANDING_EVENT_SPEED: f32 = 8.0;
/// Sideways distance from the chassis edge where an exiting occupant is placed.
const EXIT_CLEARANCE: f32 = 1.0;

/// Configures and validates a `PhysicsWorld`.
#[derive(Default)]
pub struct PhysicsWorldBuilder {
    config: PhysicsConfig,
    terrain: Option<Arc<dyn HeightField>>,
    mode: DynamicsMode,
    tuning: CharacterTuning,
}

impl PhysicsWorldBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: PhysicsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn terrain(mut self, terrain: impl HeightField + 'static) -> Self {
        self.terrain = Some(Arc::new(terrain));
        self
    }

    pub fn shared_terrain(mut self, terrain: Arc<dyn HeightField>) -> Self {
        self.terrain = Some(terrain);
        self
    }

    /// Vehicle model used for vehicles spawned into this world.
    pub fn dynamics_mode(mut self, mode: DynamicsMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn character_tuning(mut self, tuning: CharacterTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn build(self) -> Result<PhysicsWorld, ConfigError> {
        self.config.validate()?;
        let terrain = self.terrain.ok_or(ConfigError::MissingTerrain)?;
        Ok(PhysicsWorld {
            colliders: ColliderIndex::new(self.config.chunk_size),
            config: self.config,
            terrain,
            mode: self.mode,
            tuning: self.tuning,
            bodies: BTreeMap::new(),
            vehicles: BTreeMap::new(),
            controllers: BTreeMap::new(),
            seated: HashMap::new(),
            volumes: Vec::new(),
            projectiles: Vec::new(),
            events: Vec::new(),
            accumulator: 0.0,
            tick: 0,
            next_body: 1,
            next_vehicle: 1,
            next_volume: 1,
            next_projectile: 1,
        })
    }
}

/// All bodies, vehicles and static geometry of one independent simulation.
pub struct PhysicsWorld {
    config: PhysicsConfig,
    terrain: Arc<dyn HeightField>,
    mode: DynamicsMode,
    tuning: CharacterTuning,
    bodies: BTreeMap<BodyHandle, Body>,
    vehicles: BTreeMap<VehicleId, Vehicle>,
    controllers: BTreeMap<BodyHandle, CharacterController>,
    seated: HashMap<BodyHandle, VehicleId>,
    colliders: ColliderIndex,
    volumes: Vec<Volume>,
    projectiles: Vec<Projectile>,
    events: Vec<SimEvent>,
    accumulator: f32,
    tick: u64,
    next_body: u32,
    next_vehicle: u32,
    next_volume: u32,
    next_projectile: u32,
}

impl PhysicsWorld {
    pub fn builder() -> PhysicsWorldBuilder {
        PhysicsWorldBuilder::new()
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn terrain(&self) -> &dyn HeightField {
        self.terrain.as_ref()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    // --- Bodies ---

    pub fn spawn_body(&mut self, config: &BodyConfig) -> Result<BodyHandle, ConfigError> {
        let handle = BodyHandle(self.next_body);
        let body = config.build(handle)?;
        self.next_body += 1;
        if body.kind == BodyKind::Character {
            self.controllers.insert(handle, CharacterController::default());
        }
        self.bodies.insert(handle, body);
        Ok(handle)
    }

    pub fn spawn_character(&mut self, position: Vec3) -> Result<BodyHandle, ConfigError> {
        self.spawn_body(&BodyConfig::character(position))
    }

    /// Remove a body. Unknown handles are a no-op returning false.
    pub fn remove_body(&mut self, handle: BodyHandle) -> bool {
        if self.bodies.remove(&handle).is_none() {
            return false;
        }
        self.controllers.remove(&handle);
        if let Some(vehicle_id) = self.seated.remove(&handle) {
            if let Some(vehicle) = self.vehicles.get_mut(&vehicle_id) {
                vehicle.release(handle);
            }
        }
        let owned: Vec<VehicleId> = self
            .vehicles
            .values()
            .filter(|v| v.body == handle)
            .map(|v| v.id)
            .collect();
        for id in owned {
            self.remove_vehicle(id);
        }
        true
    }

    pub fn body(&self, handle: BodyHandle) -> Option<&Body> {
        self.bodies.get(&handle)
    }

    pub fn body_mut(&mut self, handle: BodyHandle) -> Option<&mut Body> {
        self.bodies.get_mut(&handle)
    }

    pub fn bodies(&self) -> impl Iterator<Item = &Body> {
        self.bodies.values()
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Store movement intent for a character. Ignored for unknown or non-character bodies.
    pub fn set_player_input(&mut self, handle: BodyHandle, input: PlayerInput) -> bool {
        match self.controllers.get_mut(&handle) {
            Some(controller) => {
                controller.input = input;
                true
            }
            None => false,
        }
    }

    // --- Vehicles ---

    pub fn spawn_vehicle(&mut self, kind: VehicleType, position: Vec3, heading: f32) -> Result<VehicleId, ConfigError> {
        let def = vehicle::vehicle_def(kind);
        let mut config = BodyConfig::vehicle(position, def.half_extents, def.mass)
            .with_rotation(Quat::from_rotation_y(heading));
        if self.mode == DynamicsMode::Simplified {
            config.angular = Some(false);
            config.no_gravity = Some(kind.is_aircraft());
        }
        let body = self.spawn_body(&config)?;
        let id = VehicleId(self.next_vehicle);
        self.next_vehicle += 1;
        let mut v = Vehicle::new(id, kind, body, self.mode);
        v.heading = heading;
        v.target_altitude = position.y;
        self.vehicles.insert(id, v);
        info!("Spawned {} {:?} at {:?}", kind, id, position);
        Ok(id)
    }

    /// Remove a vehicle and eject its occupants. Unknown ids are a no-op returning false.
    pub fn remove_vehicle(&mut self, id: VehicleId) -> bool {
        let Some(vehicle) = self.vehicles.remove(&id) else {
            return false;
        };
        for (_, occupant) in vehicle.occupants() {
            self.seated.remove(&occupant);
            if let Some(body) = self.bodies.get_mut(&occupant) {
                body.no_collisions = false;
                body.no_gravity = false;
            }
        }
        self.bodies.remove(&vehicle.body);
        true
    }

    pub fn vehicle(&self, id: VehicleId) -> Option<&Vehicle> {
        self.vehicles.get(&id)
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    /// Vehicle a body is seated in.
    pub fn vehicle_of(&self, body: BodyHandle) -> Option<VehicleId> {
        self.seated.get(&body).copied()
    }

    /// Store control input. Only the occupant of seat 0 may drive.
    pub fn set_vehicle_input(&mut self, driver: BodyHandle, vehicle: VehicleId, input: VehicleInput) -> bool {
        match self.vehicles.get_mut(&vehicle) {
            Some(v) if v.driver() == Some(driver) => {
                v.set_input(input);
                true
            }
            _ => false,
        }
    }

    /// Mark a vehicle as driven by the network. Its state is then only set via `apply_remote_state`.
    pub fn set_vehicle_remote(&mut self, id: VehicleId, remote: bool) -> bool {
        match self.vehicles.get_mut(&id) {
            Some(v) => {
                v.remote = remote;
                true
            }
            None => false,
        }
    }

    /// Seat a body. On error nothing changes.
    pub fn enter_vehicle(
        &mut self,
        body: BodyHandle,
        vehicle: VehicleId,
        seat: Option<usize>,
    ) -> Result<usize, SeatError> {
        let occupant_pos = self.bodies.get(&body).ok_or(SeatError::NoBody)?.position;
        let v = self.vehicles.get(&vehicle).ok_or(SeatError::NoVehicle)?;
        if v.body == body {
            return Err(SeatError::NoBody);
        }
        let chassis = self.bodies.get(&v.body).ok_or(SeatError::NoVehicle)?;
        if self.seated.get(&body) != Some(&vehicle)
            && occupant_pos.distance(chassis.position) > INTERACTION_RADIUS + v.def.half_extents.z
        {
            return Err(SeatError::TooFar);
        }
        // Resolved while the old seat is still held, so a switch never lands on it again.
        let index = v.pick_seat(seat)?;

        if let Some(previous) = self.seated.remove(&body) {
            if let Some(pv) = self.vehicles.get_mut(&previous) {
                pv.release(body);
            }
        }
        let v = self.vehicles.get_mut(&vehicle).ok_or(SeatError::NoVehicle)?;
        v.assign(Some(index), body)?;
        self.seated.insert(body, vehicle);
        if let Some(b) = self.bodies.get_mut(&body) {
            b.no_collisions = true;
            b.no_gravity = true;
            b.velocity = Vec3::ZERO;
            b.grounded = false;
        }
        info!("Body {:?} entered {:?} seat {}", body, vehicle, index);
        Ok(index)
    }

    /// Leave the current vehicle. Returns the exit position.
    pub fn exit_vehicle(&mut self, body: BodyHandle) -> Result<Vec3, SeatError> {
        let vehicle_id = *self.seated.get(&body).ok_or(SeatError::NotSeated)?;
        let vehicle = self.vehicles.get_mut(&vehicle_id).ok_or(SeatError::NoVehicle)?;
        let seat = vehicle.release(body).ok_or(SeatError::NotSeated)?;
        self.seated.remove(&body);

        let exit = match self.bodies.get(&vehicle.body) {
            Some(chassis) => {
                let side = if vehicle.seats.get(seat).is_some_and(|s| s.offset.x > 0.0) {
                    1.0
                } else {
                    -1.0
                };
                let local = Vec3::new(side * (vehicle.def.half_extents.x + EXIT_CLEARANCE), 0.0, 0.0);
                let yaw = Quat::from_rotation_y(chassis.yaw());
                let p = chassis.position + yaw * local;
                let ground = self.terrain.height_at(p.x, p.z);
                Vec3::new(p.x, p.y.max(ground + self.config.skin) + 1.0, p.z)
            }
            None => self.bodies.get(&body).map(|b| b.position).unwrap_or(Vec3::ZERO),
        };
        let chassis_velocity = self.bodies.get(&vehicle.body).map(|b| b.velocity).unwrap_or(Vec3::ZERO);
        if let Some(b) = self.bodies.get_mut(&body) {
            b.position = exit;
            b.velocity = chassis_velocity;
            b.no_collisions = false;
            b.no_gravity = false;
            b.rotation = Quat::from_rotation_y(b.yaw());
        }
        info!("Body {:?} left {:?}", body, vehicle_id);
        Ok(exit)
    }

    /// Fire the weapon mapped to the body's seat. `None` when unarmed or cooling down.
    pub fn fire_weapon(&mut self, body: BodyHandle) -> Option<SimEvent> {
        let vehicle_id = *self.seated.get(&body)?;
        let vehicle = self.vehicles.get_mut(&vehicle_id)?;
        let seat = vehicle.seat_of(body)?;
        let weapon = weapon_for(vehicle.kind, vehicle.seats[seat].role)?;
        let chassis = self.bodies.get(&vehicle.body)?;
        if !vehicle.weapons.try_fire(weapon) {
            return None;
        }
        let origin = chassis.position + chassis.rotation * vehicle.seats[seat].offset;
        let event = if weapon == WeaponKind::Bomb {
            let id = self.next_projectile;
            self.next_projectile += 1;
            let origin = chassis.position - chassis.up() * (vehicle.def.half_extents.y + 0.5);
            self.projectiles.push(Projectile {
                id,
                vehicle: vehicle_id,
                position: origin,
                velocity: chassis.velocity,
                age: 0.0,
            });
            SimEvent::BombReleased {
                vehicle: vehicle_id,
                projectile: id,
                origin,
                velocity: chassis.velocity,
            }
        } else {
            SimEvent::WeaponFired {
                vehicle: vehicle_id,
                seat,
                weapon,
                origin,
                direction: chassis.forward(),
            }
        };
        self.events.push(event.clone());
        Some(event)
    }

    pub fn projectiles(&self) -> &[Projectile] {
        &self.projectiles
    }

    /// Overwrite a body from a network snapshot.
    pub fn apply_remote_state(&mut self, handle: BodyHandle, position: Vec3, rotation: Quat, velocity: Vec3) -> bool {
        match self.bodies.get_mut(&handle) {
            Some(body) => {
                body.position = position;
                body.rotation = rotation.normalize();
                body.velocity = velocity;
                true
            }
            None => false,
        }
    }

    // --- Static geometry ---

    /// Install a chunk's colliders, replacing any previous list for that chunk.
    pub fn load_colliders(&mut self, key: ChunkKey, boxes: impl IntoIterator<Item = Aabb>) -> Vec<ColliderId> {
        let ids = self.colliders.load_chunk(key, boxes);
        debug!("Loaded {} colliders for chunk {:?}", ids.len(), key);
        ids
    }

    pub fn unload_colliders(&mut self, key: ChunkKey) -> usize {
        let n = self.colliders.unload_chunk(key);
        debug!("Unloaded {} colliders for chunk {:?}", n, key);
        n
    }

    pub fn add_collider(&mut self, bounds: Aabb) -> ColliderId {
        self.colliders.insert(bounds, None)
    }

    pub fn remove_collider(&mut self, id: ColliderId) -> bool {
        self.colliders.remove(id)
    }

    pub fn colliders(&self) -> &ColliderIndex {
        &self.colliders
    }

    pub fn add_volume(&mut self, bounds: Aabb, tag: impl Into<String>) -> VolumeId {
        let id = VolumeId(self.next_volume);
        self.next_volume += 1;
        self.volumes.push(Volume {
            id,
            bounds,
            tag: tag.into(),
        });
        id
    }

    pub fn remove_volume(&mut self, id: VolumeId) -> bool {
        let before = self.volumes.len();
        self.volumes.retain(|v| v.id != id);
        self.volumes.len() != before
    }

    // --- Stepping ---

    /// Consume wall-clock time in whole fixed steps, at most `max_substeps` per call.
    /// Time beyond that is discarded. Returns the number of steps run.
    pub fn advance(&mut self, frame_dt: f32) -> u32 {
        if frame_dt.is_finite() && frame_dt > 0.0 {
            self.accumulator += frame_dt;
        }
        let step = self.config.fixed_step;
        let mut steps = 0;
        while self.accumulator >= step && steps < self.config.max_substeps {
            self.step(step);
            self.accumulator -= step;
            steps += 1;
        }
        if self.accumulator >= step {
            self.accumulator = 0.0;
        }
        steps
    }

    /// Leftover time not yet consumed by a step.
    pub fn accumulator(&self) -> f32 {
        self.accumulator
    }

    /// Run exactly one step of `dt` for every body.
    pub fn step(&mut self, dt: f32) {
        self.refresh_dynamic_colliders();

        for (handle, controller) in self.controllers.iter_mut() {
            if self.seated.contains_key(handle) {
                continue;
            }
            if let Some(body) = self.bodies.get_mut(handle) {
                apply_player_input(body, controller, &self.tuning, dt);
            }
        }

        let terrain = self.terrain.as_ref();
        for vehicle in self.vehicles.values_mut() {
            if let Some(body) = self.bodies.get_mut(&vehicle.body) {
                vehicle::pre_step(vehicle, body, terrain, &self.config, dt);
            }
        }

        let ctx = StepContext {
            config: &self.config,
            terrain,
            colliders: &self.colliders,
            volumes: &self.volumes,
        };
        let mut landings = Vec::new();
        for body in self.bodies.values_mut() {
            if self.seated.contains_key(&body.handle) {
                continue;
            }
            let remote = body.is_vehicle
                && self
                    .vehicles
                    .values()
                    .any(|v| v.body == body.handle && v.remote);
            if remote {
                continue;
            }
            let was_grounded = body.grounded;
            let falling = -body.velocity.y;
            step_body(body, &ctx, dt, &mut self.events);
            if body.grounded && !was_grounded && falling > LANDING_EVENT_SPEED {
                landings.push((body.handle, falling));
            }
        }

        for vehicle in self.vehicles.values_mut() {
            if let Some(body) = self.bodies.get_mut(&vehicle.body) {
                vehicle::post_step(vehicle, body, terrain, &self.config, dt);
            }
        }

        self.follow_seats();
        self.step_projectiles(dt);

        self.events.extend(
            landings
                .into_iter()
                .map(|(body, impact_speed)| SimEvent::Landed { body, impact_speed }),
        );
        self.tick += 1;
    }

    /// Take every event queued since the last drain.
    pub fn drain_events(&mut self) -> Vec<SimEvent> {
        std::mem::take(&mut self.events)
    }

    fn refresh_dynamic_colliders(&mut self) {
        let dynamic = self
            .vehicles
            .values()
            .filter_map(|v| {
                let body = self.bodies.get(&v.body)?;
                Some(Collider {
                    id: ColliderId(u32::MAX - v.id.0),
                    bounds: Aabb::from_center_half_extents(body.position, body.half_extents()),
                    owner: Some(body.handle),
                })
            })
            .collect();
        self.colliders.set_dynamic(dynamic);
    }

    fn follow_seats(&mut self) {
        for vehicle in self.vehicles.values() {
            let Some(chassis) = self.bodies.get(&vehicle.body) else {
                continue;
            };
            let (position, rotation, velocity) = (chassis.position, chassis.rotation, chassis.velocity);
            for (index, occupant) in vehicle.occupants() {
                let offset = vehicle.seats[index].offset;
                if let Some(body) = self.bodies.get_mut(&occupant) {
                    body.position = position + rotation * offset;
                    body.velocity = velocity;
                    body.rotation = rotation;
                    body.grounded = false;
                }
            }
        }
    }

    fn step_projectiles(&mut self, dt: f32) {
        let gravity = self.config.gravity;
        let terrain = self.terrain.as_ref();
        let events = &mut self.events;
        self.projectiles.retain_mut(|p| match step_projectile(p, gravity, terrain, dt) {
            ProjectileStep::Flying => true,
            ProjectileStep::Impact(position) => {
                events.push(SimEvent::Explosion {
                    vehicle: p.vehicle,
                    projectile: p.id,
                    position,
                });
                false
            }
            ProjectileStep::Expired => false,
        });
    }
}
