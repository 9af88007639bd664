//! Shared protocol definitions for the Huddle relay wire format.
//!
//! Clients and the relay exchange [`event::ClientEvent`] and
//! [`event::ServerEvent`] values, carried as either postcard binary frames
//! or JSON text frames (see [`codec`]).

pub mod codec;
pub mod event;
pub mod identity;
