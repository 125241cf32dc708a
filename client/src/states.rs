//! Client state machine

use bevy::prelude::*;

#[derive(States, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GameState {
    /// Transport link being established
    #[default]
    Connecting,
    /// Linked, waiting for the handshake reply
    Joining,
    Playing,
}
