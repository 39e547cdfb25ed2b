//! Sender role objects.
//!
//! One [`ParticleSender`] per configured emitter, allocated before connecting
//! and later bound to a sender node. Each owns a frame timer and, in the
//! receiver role, a receipt tracker. Timer and tracker each have their own
//! lock; no call site holds both.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::config::Role;
use crate::math::Vec3;
use crate::particle_data::RefParticleData;
use crate::received::ReceivedParticleData;
use crate::timer::Timer;

/// Grid spacing between senders.
pub const SENDER_SPACING: f32 = 40.0;

#[derive(Debug)]
pub struct ParticleSender {
    pub id: u16,
    position: Mutex<Vec3>,
    pub timer: Timer,
    received: Option<Mutex<ReceivedParticleData>>,
}

impl ParticleSender {
    pub fn new(id: u16, position: Vec3, received: Option<ReceivedParticleData>) -> Self {
        Self {
            id,
            position: Mutex::new(position),
            timer: Timer::new(),
            received: received.map(Mutex::new),
        }
    }

    pub fn position(&self) -> Vec3 {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_position(&self, pos: Vec3) {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner) = pos;
    }

    /// Locks the receipt tracker. `None` in the sender role.
    pub fn received(&self) -> Option<MutexGuard<'_, ReceivedParticleData>> {
        self.received
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Grid position of sender `index` out of `count`.
///
/// Senders fill a `side × side` square (`side = floor(sqrt(count))`), rows
/// along -x, columns along +y; any remainder continues on further rows.
pub fn grid_position(index: usize, count: usize) -> Vec3 {
    let side = ((count as f64).sqrt().floor() as usize).max(1);
    let (i, j) = (index / side, index % side);
    Vec3::new(-SENDER_SPACING * i as f32, SENDER_SPACING * j as f32, 0.0)
}

/// Everything the client threads share: sender role objects plus the
/// read-only reference data.
#[derive(Debug)]
pub struct SenderPool {
    senders: Vec<ParticleSender>,
    data: Arc<RefParticleData>,
}

impl SenderPool {
    /// Allocates `count` senders on the grid.
    pub fn new(count: u16, role: Role, data: Arc<RefParticleData>) -> Self {
        let senders = (0..count)
            .map(|id| {
                let received = match role {
                    Role::Receiver => Some(ReceivedParticleData::new(&data)),
                    Role::Sender => None,
                };
                let pos = grid_position(id as usize, count as usize);
                debug!(id, ?pos, "Sender allocated");
                ParticleSender::new(id, pos, received)
            })
            .collect();
        Self { senders, data }
    }

    pub fn senders(&self) -> &[ParticleSender] {
        &self.senders
    }

    pub fn get(&self, index: usize) -> Option<&ParticleSender> {
        self.senders.get(index)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn data(&self) -> &RefParticleData {
        &self.data
    }

    pub fn frame_count(&self) -> usize {
        self.data.frame_count()
    }

    /// Advances every running timer by `steps`.
    pub fn tick_all(&self, steps: u64) {
        let fc = self.frame_count();
        for s in &self.senders {
            s.timer.tick(steps, fc);
        }
    }
}
