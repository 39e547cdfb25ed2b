//! `particle_client`
//!
//! Client-side systems:
//! - Graph synchronization state machine (scene/sender/particle discovery)
//! - Sender-role frame publishing
//! - Frame timer thread driving the event loop
//! - Rendering abstraction and headless backends
//! - Connection management

pub mod client;
pub mod publish;
pub mod render;
pub mod session;
pub mod ticker;

pub use client::{ParticleClient, ShutdownHandle};
pub use session::{Flow, Session};
