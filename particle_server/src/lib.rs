//! `particle_server`
//!
//! Server-side systems:
//! - Authoritative scene graph (nodes, tag groups, tags, layers)
//! - Per-node and per-group subscriptions with replay on subscribe
//! - Connection handling and event fan-out
//!
//! Networking model:
//! - TCP: length-prefixed JSON requests and events, see `particle_shared::net`

pub mod graph;
pub mod server;

pub use graph::{Delivery, SceneGraph};
pub use server::{bind_ephemeral, SceneServer};
