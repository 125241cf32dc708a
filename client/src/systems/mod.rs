//! Client-side networking systems

pub mod connection;

pub use connection::*;
