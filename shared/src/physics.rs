//! Fixed-timestep body simulation.
//!
//! - `body`: body state and validated construction
//! - `collider`: chunk-indexed box colliders
//! - `integrator`: one step for one body
//! - `world`: registry, vehicles, seats and the step driver
//! - `events`: what a step reports to the outside

pub mod body;
pub mod collider;
pub mod events;
pub mod integrator;
pub mod world;

pub use body::{Body, BodyConfig, BodyHandle, BodyKind, BodyShape};
pub use collider::{Aabb, ChunkKey, Collider, ColliderId, ColliderIndex};
pub use events::{EventHandlers, SimEvent, SimEventKind, VolumeId};
pub use integrator::{step_body, StepContext, Volume};
pub use world::{PhysicsWorld, PhysicsWorldBuilder};
