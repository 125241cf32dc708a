//! Error types for setup, protocol and gameplay rejections.
//!
//! Nothing in here is raised from inside a physics step: the step is infallible.
//! Configuration problems surface at setup time, protocol problems at decode time,
//! and seat/spawn rejections are turned into chat messages by the server.

use thiserror::Error;

/// Setup-time configuration failures. Not recoverable mid-simulation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be finite and positive (got {value})")]
    NonPositive { field: &'static str, value: f32 },

    #[error("{field} must be finite (got {value})")]
    NonFinite { field: &'static str, value: f32 },

    #[error("{field} must lie in [{min}, {max}] (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("max_substeps must be at least 1")]
    NoSubsteps,

    #[error("physics world has no terrain sampler")]
    MissingTerrain,
}

/// Failures while decoding or encoding a wire envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported protocol version {got} (expected {expected})")]
    Version { got: String, expected: &'static str },
}

/// Seat enter/exit rejections. State is left unchanged when one of these is returned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SeatError {
    #[error("no such vehicle")]
    NoVehicle,

    #[error("no such body")]
    NoBody,

    #[error("seat {0} does not exist on this vehicle")]
    Unavailable(usize),

    #[error("seat {0} is already occupied")]
    Occupied(usize),

    #[error("no free seat")]
    Full,

    #[error("too far away to enter")]
    TooFar,

    #[error("not seated in this vehicle")]
    NotSeated,
}

/// Vehicle spawn rejections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("unknown vehicle type '{0}' (try tank, jeep or helicopter)")]
    UnknownVehicleType(String),
}

/// Key names accepted on the client command line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("unknown key '{0}' (try w a s d space shift q e)")]
    UnknownKey(String),
}
