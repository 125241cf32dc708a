//! World and network tuning.
//!
//! Every knob has a default. The world builder calls `validate()`, so bad values fail at setup.

use bevy::prelude::*;

use crate::error::ConfigError;
use crate::protocol::{PROTOCOL_ID, SERVER_ADDR, SERVER_PORT};

/// Fixed timestep for physics/game logic (60 Hz)
pub const FIXED_TIMESTEP_HZ: f64 = 60.0;

/// Rate at which the server broadcasts `physics_state` (20 Hz)
pub const NETWORK_BROADCAST_HZ: f64 = 20.0;

/// Minimum spacing between two `player_input` sends from one client
pub const INPUT_SEND_INTERVAL_MS: f64 = 50.0;

/// Default per-entity capacity of the interpolation ring buffer
pub const INTERPOLATION_BUFFER_CAPACITY: usize = 20;

/// Collider chunk edge length in world units
pub const COLLIDER_CHUNK_SIZE: f32 = 32.0;

/// Global simulation parameters shared by every body in one world.
#[derive(Clone, Debug, PartialEq)]
pub struct PhysicsConfig {
    /// Downward gravity magnitude in units/s^2.
    pub gravity: f32,
    /// Hard cap on linear speed after every step.
    pub terminal_velocity: f32,
    /// Length of one fixed step in seconds.
    pub fixed_step: f32,
    /// Catch-up bound per frame; anything beyond is discarded.
    pub max_substeps: u32,
    /// Gap kept between a resting body and the surface under it.
    pub skin: f32,
    /// Tallest ledge a character walks onto without jumping.
    pub step_height: f32,
    /// Edge length of one collider chunk.
    pub chunk_size: f32,
    /// Per-component angular speed clamp (rad/s).
    pub max_angular_speed: f32,
    /// Fraction of downward speed returned when landing on a collider top.
    pub bounce: f32,
    /// Fraction of horizontal speed kept by vehicles hitting a collider side.
    pub vehicle_side_damping: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: 38.5,
            terminal_velocity: 120.0,
            fixed_step: (1.0 / FIXED_TIMESTEP_HZ) as f32,
            max_substeps: 4,
            skin: 0.05,
            step_height: 0.6,
            chunk_size: COLLIDER_CHUNK_SIZE,
            max_angular_speed: 12.0,
            bounce: 0.2,
            vehicle_side_damping: 0.3,
        }
    }
}

impl PhysicsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("gravity", self.gravity)?;
        positive("terminal_velocity", self.terminal_velocity)?;
        positive("fixed_step", self.fixed_step)?;
        non_negative("skin", self.skin)?;
        non_negative("step_height", self.step_height)?;
        positive("chunk_size", self.chunk_size)?;
        positive("max_angular_speed", self.max_angular_speed)?;
        unit_range("bounce", self.bounce)?;
        unit_range("vehicle_side_damping", self.vehicle_side_damping)?;
        if self.max_substeps == 0 {
            return Err(ConfigError::NoSubsteps);
        }
        Ok(())
    }
}

/// Network cadence used by both peers.
#[derive(Resource, Clone, Debug, PartialEq)]
pub struct NetConfig {
    pub physics_tick_rate: f64,
    pub broadcast_rate: f64,
    pub input_send_interval_ms: f64,
    pub buffer_capacity: usize,
    pub physics_enabled: bool,
    pub server_addr: String,
    pub server_port: u16,
    pub protocol_id: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            physics_tick_rate: FIXED_TIMESTEP_HZ,
            broadcast_rate: NETWORK_BROADCAST_HZ,
            input_send_interval_ms: INPUT_SEND_INTERVAL_MS,
            buffer_capacity: INTERPOLATION_BUFFER_CAPACITY,
            physics_enabled: true,
            server_addr: SERVER_ADDR.to_string(),
            server_port: SERVER_PORT,
            protocol_id: PROTOCOL_ID,
        }
    }
}

impl NetConfig {
    /// Seconds between two `physics_state` broadcasts.
    pub fn broadcast_period(&self) -> f64 {
        1.0 / self.broadcast_rate.max(1.0)
    }

    /// Defaults overridden by `SERVER_ADDR` / `SERVER_PORT` when set.
    pub fn from_env() -> Self {
        Self::default().with_overrides(
            std::env::var("SERVER_ADDR").ok(),
            std::env::var("SERVER_PORT").ok(),
        )
    }

    /// Unparseable ports are ignored with a warning.
    pub fn with_overrides(mut self, addr: Option<String>, port: Option<String>) -> Self {
        if let Some(addr) = addr.filter(|a| !a.trim().is_empty()) {
            self.server_addr = addr.trim().to_string();
        }
        if let Some(port) = port {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server_port = port,
                Err(_) => warn!("Ignoring invalid SERVER_PORT '{}'", port),
            }
        }
        self
    }
}

pub(crate) fn positive(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

pub(crate) fn non_negative(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::NonFinite { field, value });
    }
    if value < 0.0 {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: f32::INFINITY,
        });
    }
    Ok(())
}

pub(crate) fn unit_range(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PhysicsConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_substeps_rejected() {
        let cfg = PhysicsConfig {
            max_substeps: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::NoSubsteps));
    }

    #[test]
    fn nan_gravity_rejected() {
        let cfg = PhysicsConfig {
            gravity: f32::NAN,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn broadcast_period_matches_rate() {
        let net = NetConfig::default();
        assert!((net.broadcast_period() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn env_style_overrides() {
        let net = NetConfig::default().with_overrides(Some("10.0.0.2".into()), Some("7000".into()));
        assert_eq!(net.server_addr, "10.0.0.2");
        assert_eq!(net.server_port, 7000);

        let net = NetConfig::default().with_overrides(Some("  ".into()), Some("not-a-port".into()));
        assert_eq!(net.server_addr, SERVER_ADDR);
        assert_eq!(net.server_port, SERVER_PORT);
    }
}
