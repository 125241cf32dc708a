//! Shared simulation core used by both the server and the client.

pub mod config;
pub mod controller;
pub mod error;
pub mod interpolation;
pub mod physics;
pub mod protocol;
pub mod terrain;
pub mod vehicle;

pub use config::{NetConfig, PhysicsConfig};
pub use error::{ConfigError, KeyParseError, ProtocolError, SeatError, SpawnError};
pub use physics::{PhysicsWorld, PhysicsWorldBuilder};
pub use protocol::ProtocolPlugin;
