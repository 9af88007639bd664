//! Huddle relay server library.
//!
//! Tracks which users are connected, which channels each connection listens
//! on, and relays already-persisted messages and presence changes to the
//! right connections in real time. Exposed as a library for tests and
//! embedding; the binary in `main.rs` wires it to configuration and signals.

pub mod config;
pub mod lifecycle;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod server;
