//! One fixed step for one body.
//!
//! Order per step (later stages override earlier ones):
//! 1. gravity
//! 2. horizontal linear damping
//! 3. terminal velocity clamp
//! 4. position integration
//! 5. orientation integration (angular bodies)
//! 6. `no_collisions` bodies stop here (volumes still apply)
//! 7. box collider resolution against the 3x3 chunk neighborhood
//! 8. terrain / ground cast resolution with step assist
//! 9. volume effects
//!
//! Every stage after the clamp only removes speed, so `|velocity| <= terminal_velocity` holds
//! at the end of the step.

use bevy::prelude::*;

use super::body::Body;
use super::collider::{Aabb, Collider, ColliderIndex};
use super::events::{SimEvent, VolumeId};
use crate::config::PhysicsConfig;
use crate::terrain::HeightField;

/// Fraction of the hover gap closed per step by step assist.
const STEP_ASSIST_BLEND: f32 = 0.5;

/// Upward bounce speeds below this are dropped to zero.
const MIN_BOUNCE_SPEED: f32 = 1.0;

/// An axis-aligned region that reports every body inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub id: VolumeId,
    pub bounds: Aabb,
    /// Opaque label interpreted by whoever handles `VolumeEffect` events.
    pub tag: String,
}

/// Read-only world state a step needs.
pub struct StepContext<'a> {
    pub config: &'a PhysicsConfig,
    pub terrain: &'a dyn HeightField,
    pub colliders: &'a ColliderIndex,
    pub volumes: &'a [Volume],
}

/// Advance `body` by `dt`. Never fails; contact problems are resolved, not reported.
pub fn step_body(body: &mut Body, ctx: &StepContext, dt: f32, events: &mut Vec<SimEvent>) {
    let was_grounded = body.grounded;
    body.grounded = false;

    apply_forces(body, ctx.config, dt);
    body.position += body.velocity * dt;
    if body.angular {
        integrate_orientation(body, ctx.config, dt);
    }

    if !body.no_collisions {
        let nearby = ctx.colliders.nearby(body.position);
        let on_collider = resolve_colliders(body, &nearby, ctx.config);
        let on_ground = resolve_ground(body, &nearby, ctx, dt, was_grounded);
        body.grounded = on_collider || on_ground;
    }

    apply_volumes(body, ctx.volumes, dt, events);
}

/// Stages 1-3.
fn apply_forces(body: &mut Body, config: &PhysicsConfig, dt: f32) {
    if !body.no_gravity {
        body.velocity.y -= config.gravity * dt;
    }

    let keep = (1.0 - body.linear_damping * dt).max(0.0);
    body.velocity.x *= keep;
    body.velocity.z *= keep;

    body.velocity = body.velocity.clamp_length_max(config.terminal_velocity);
}

/// Stage 5.
fn integrate_orientation(body: &mut Body, config: &PhysicsConfig, dt: f32) {
    let w = body.angular_velocity;
    if w.length_squared() > 1e-12 {
        let dq = Quat::from_scaled_axis(w * dt);
        body.rotation = (dq * body.rotation).normalize();
    }
    body.angular_velocity *= body.angular_damping.powf(dt * 60.0);
    let max = Vec3::splat(config.max_angular_speed);
    body.angular_velocity = body.angular_velocity.clamp(-max, max);
}

/// Stage 7: single ordered pass over the candidates, resolving along the shallowest axis.
pub fn resolve_colliders(body: &mut Body, nearby: &[Collider], config: &PhysicsConfig) -> bool {
    let mut on_ground = false;
    let half = body.half_extents();

    for collider in nearby {
        if collider.owner == Some(body.handle) {
            continue;
        }
        let bbox = Aabb::from_center_half_extents(body.position, half);
        if !bbox.intersects(&collider.bounds) {
            continue;
        }
        let overlap = bbox.overlap(&collider.bounds);
        let center = collider.bounds.center();

        if overlap.y <= overlap.x && overlap.y <= overlap.z {
            if body.position.y >= center.y {
                body.position.y += overlap.y;
                if body.velocity.y < 0.0 {
                    let bounce = -body.velocity.y * config.bounce.max(body.restitution);
                    body.velocity.y = if bounce < MIN_BOUNCE_SPEED { 0.0 } else { bounce };
                }
                body.ground_normal = Vec3::Y;
                on_ground = true;
            } else {
                body.position.y -= overlap.y;
                if body.velocity.y > 0.0 {
                    body.velocity.y = 0.0;
                }
            }
            continue;
        }

        let ledge = collider.bounds.max.y - body.feet();
        if !body.is_vehicle && ledge > 0.0 && ledge <= config.step_height {
            body.position.y += ledge;
            body.velocity.y = body.velocity.y.max(0.0);
            body.ground_normal = Vec3::Y;
            on_ground = true;
            continue;
        }

        let side_keep = if body.is_vehicle { config.vehicle_side_damping } else { 0.0 };
        if overlap.x <= overlap.z {
            let dir = if body.position.x < center.x { -1.0 } else { 1.0 };
            body.position.x += dir * overlap.x;
            if body.velocity.x * dir < 0.0 {
                body.velocity.x = -body.velocity.x * side_keep;
            }
        } else {
            let dir = if body.position.z < center.z { -1.0 } else { 1.0 };
            body.position.z += dir * overlap.z;
            if body.velocity.z * dir < 0.0 {
                body.velocity.z = -body.velocity.z * side_keep;
            }
        }
    }

    on_ground
}

/// Highest collider top under the body footprint that lies below mid-body.
pub fn ground_cast(body: &Body, nearby: &[Collider]) -> Option<f32> {
    let half = body.half_extents();
    let mut best: Option<f32> = None;
    for collider in nearby {
        if collider.owner == Some(body.handle) {
            continue;
        }
        let b = &collider.bounds;
        let overlaps_footprint = body.position.x + half.x > b.min.x
            && body.position.x - half.x < b.max.x
            && body.position.z + half.z > b.min.z
            && body.position.z - half.z < b.max.z;
        if overlaps_footprint && b.max.y <= body.position.y {
            best = Some(best.map_or(b.max.y, |h| h.max(b.max.y)));
        }
    }
    best
}

/// Stage 8. Vehicles only report collider contact here; their ride height belongs to the
/// vehicle model.
fn resolve_ground(
    body: &mut Body,
    nearby: &[Collider],
    ctx: &StepContext,
    dt: f32,
    was_grounded: bool,
) -> bool {
    if body.is_vehicle {
        return false;
    }

    let terrain_height = ctx.terrain.height_at(body.position.x, body.position.z);
    let (surface, normal) = match ground_cast(body, nearby) {
        Some(top) if top >= terrain_height => (top, Vec3::Y),
        _ => (
            terrain_height,
            ctx.terrain.normal_at(body.position.x, body.position.z),
        ),
    };

    let desired = surface + body.shape.half_height() + ctx.config.skin;
    let gap = body.position.y - desired;
    let walkable = normal.y >= body.slope_limit;

    if gap < 0.0 {
        body.position.y = desired;
        if body.velocity.y < 0.0 {
            body.velocity.y = 0.0;
        }

        let horizontal = Vec3::new(body.velocity.x, 0.0, body.velocity.z);
        let along = horizontal - normal * horizontal.dot(normal);
        body.velocity.x = along.x;
        body.velocity.z = along.z;
        body.velocity.y = body.velocity.y.max(along.y);

        if walkable {
            let keep = (1.0 - body.friction * dt).max(0.0);
            body.velocity.x *= keep;
            body.velocity.z *= keep;
        }
        body.ground_normal = normal;
        return walkable;
    }

    if was_grounded && gap <= ctx.config.step_height && body.velocity.y <= 0.0 {
        body.position.y -= gap * STEP_ASSIST_BLEND;
        body.velocity.y = 0.0;
        body.ground_normal = normal;
        return walkable;
    }

    false
}

/// Stage 9.
fn apply_volumes(body: &Body, volumes: &[Volume], dt: f32, events: &mut Vec<SimEvent>) {
    for volume in volumes {
        if volume.bounds.contains(body.position) {
            events.push(SimEvent::VolumeEffect {
                volume: volume.id,
                tag: volume.tag.clone(),
                body: body.handle,
                dt,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::body::{BodyConfig, BodyHandle};
    use crate::terrain::FlatTerrain;

    const DT: f32 = 1.0 / 60.0;

    struct Fixture {
        config: PhysicsConfig,
        terrain: FlatTerrain,
        colliders: ColliderIndex,
        volumes: Vec<Volume>,
    }

    impl Fixture {
        fn new(ground: f64) -> Self {
            let config = PhysicsConfig::default();
            Self {
                colliders: ColliderIndex::new(config.chunk_size),
                config,
                terrain: FlatTerrain::new(ground),
                volumes: Vec::new(),
            }
        }

        fn step(&self, body: &mut Body, events: &mut Vec<SimEvent>) {
            let ctx = StepContext {
                config: &self.config,
                terrain: &self.terrain,
                colliders: &self.colliders,
                volumes: &self.volumes,
            };
            step_body(body, &ctx, DT, events);
        }
    }

    fn character(pos: Vec3) -> Body {
        BodyConfig::character(pos).build(BodyHandle(1)).unwrap()
    }

    #[test]
    fn speed_never_exceeds_terminal_velocity() {
        let fx = Fixture::new(-1.0e6);
        let mut body = character(Vec3::new(0.0, 1000.0, 0.0));
        body.velocity = Vec3::new(400.0, -300.0, 50.0);
        let mut events = Vec::new();
        for _ in 0..600 {
            fx.step(&mut body, &mut events);
            assert!(body.velocity.length() <= fx.config.terminal_velocity + 1e-3);
        }
    }

    #[test]
    fn grounded_every_step_on_flat_collider() {
        let mut fx = Fixture::new(-100.0);
        fx.colliders.insert(
            Aabb::new(Vec3::new(-10.0, -1.0, -10.0), Vec3::new(10.0, 0.0, 10.0)),
            None,
        );
        let rest = 0.9 + fx.config.skin;
        let mut body = character(Vec3::new(0.0, rest, 0.0));
        let mut events = Vec::new();
        for step in 0..120 {
            fx.step(&mut body, &mut events);
            assert!(body.grounded, "not grounded at step {step}");
            assert!((body.position.y - rest).abs() < 1e-3);
        }
    }

    #[test]
    fn free_fall_is_not_grounded() {
        let fx = Fixture::new(0.0);
        let mut body = character(Vec3::new(0.0, 100.0, 0.0));
        let mut events = Vec::new();
        for _ in 0..60 {
            fx.step(&mut body, &mut events);
            assert!(!body.grounded);
        }
        assert!(body.position.y < 100.0);
    }

    #[test]
    fn weightless_body_holds_still() {
        let fx = Fixture::new(0.0);
        for y in [3.0, 10.0] {
            let mut body = BodyConfig::character(Vec3::new(1.0, y, -2.0))
                .without_gravity()
                .build(BodyHandle(7))
                .unwrap();
            let start = body.position;
            let mut events = Vec::new();
            for _ in 0..120 {
                fx.step(&mut body, &mut events);
                assert_eq!(body.position, start);
            }
        }
    }

    #[test]
    fn lands_on_terrain() {
        let fx = Fixture::new(2.0);
        let mut body = character(Vec3::new(0.0, 6.0, 0.0));
        let mut events = Vec::new();
        for _ in 0..120 {
            fx.step(&mut body, &mut events);
        }
        assert!(body.grounded);
        assert!((body.position.y - (2.0 + 0.9 + fx.config.skin)).abs() < 1e-3);
        assert!(body.velocity.y.abs() < 1e-6);
    }

    #[test]
    fn walks_up_a_low_ledge() {
        let mut fx = Fixture::new(0.0);
        fx.colliders.insert(
            Aabb::new(Vec3::new(2.0, 0.0, -5.0), Vec3::new(12.0, 0.4, 5.0)),
            None,
        );
        let mut body = character(Vec3::new(0.0, 0.9 + fx.config.skin, 0.0));
        body.velocity.x = 5.0;
        let mut events = Vec::new();
        for _ in 0..60 {
            fx.step(&mut body, &mut events);
        }
        assert!(body.position.x > 4.0);
        assert!((body.position.y - (0.4 + 0.9 + fx.config.skin)).abs() < 0.02);
        assert!((body.velocity.x - 5.0).abs() < 1e-3);
        assert!(body.grounded);
    }

    #[test]
    fn tall_wall_blocks() {
        let mut fx = Fixture::new(0.0);
        fx.colliders.insert(
            Aabb::new(Vec3::new(2.0, 0.0, -5.0), Vec3::new(3.0, 4.0, 5.0)),
            None,
        );
        let mut body = character(Vec3::new(0.0, 0.9 + fx.config.skin, 0.0));
        body.velocity.x = 5.0;
        let mut events = Vec::new();
        for _ in 0..60 {
            fx.step(&mut body, &mut events);
        }
        assert!(body.position.x + 0.4 <= 2.0 + 1e-3);
        assert_eq!(body.velocity.x, 0.0);
    }

    #[test]
    fn owner_collider_ignored() {
        let mut fx = Fixture::new(-50.0);
        fx.colliders.insert(
            Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(2.0)),
            Some(BodyHandle(1)),
        );
        let mut body = character(Vec3::ZERO);
        let mut events = Vec::new();
        fx.step(&mut body, &mut events);
        assert!(!body.grounded);
        assert!(body.position.y < 0.0);
    }

    #[test]
    fn volume_reports_occupant() {
        let mut fx = Fixture::new(0.0);
        fx.volumes.push(Volume {
            id: VolumeId(4),
            bounds: Aabb::new(Vec3::splat(-5.0), Vec3::splat(5.0)),
            tag: "damage".into(),
        });
        let mut body = character(Vec3::new(0.0, 0.95, 0.0));
        body.no_collisions = true;
        body.no_gravity = true;
        let mut events = Vec::new();
        fx.step(&mut body, &mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SimEvent::VolumeEffect { tag, .. } if tag == "damage"));
    }

    #[test]
    fn angular_velocity_is_clamped() {
        let fx = Fixture::new(-100.0);
        let mut body = BodyConfig::vehicle(Vec3::ZERO, Vec3::ONE, 100.0)
            .without_gravity()
            .build(BodyHandle(9))
            .unwrap();
        body.angular_velocity = Vec3::new(100.0, -100.0, 0.5);
        let mut events = Vec::new();
        fx.step(&mut body, &mut events);
        let max = fx.config.max_angular_speed;
        assert!(body.angular_velocity.abs().max_element() <= max);
        assert!((body.rotation.length() - 1.0).abs() < 1e-5);
    }
}
