//! `particle_shared`
//!
//! Libraries used by both the particle client and the relay server.
//!
//! Design goals:
//! - Clear separation of concerns (protocol, transport, dataset, tracking).
//! - Plain owned data; locks only where threads actually share state.
//! - No `unsafe`.

pub mod config;
pub mod lu_table;
pub mod math;
pub mod net;
pub mod node;
pub mod particle_data;
pub mod protocol;
pub mod received;
pub mod sender;
pub mod timer;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::lu_table::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::node::*;
    pub use crate::particle_data::*;
    pub use crate::protocol::*;
    pub use crate::received::*;
    pub use crate::sender::*;
    pub use crate::timer::*;
}
