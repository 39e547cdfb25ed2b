//! Received particle tracker.
//!
//! One [`ReceivedParticleData`] per sender records which reference frames of
//! each particle have been observed and how late each observation arrived.
//! Callers wrap it in a mutex and hold the lock only for a single update;
//! the sender's timer is read before the lock is taken, never while holding it.

use serde::Serialize;
use tracing::{trace, warn};

use crate::math::Vec3;
use crate::particle_data::RefParticleData;

/// Timeliness of a received position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Receipt {
    #[default]
    Unreceived,
    /// Arrived at or one frame after its reference frame.
    InTime,
    /// Arrived two or more frames late.
    Delayed,
    /// Arrived before its reference frame was displayed.
    Ahead,
}

/// Classifies `delay = display_frame - matched_frame`.
pub fn classify_delay(delay: i32) -> Receipt {
    match delay {
        0 | 1 => Receipt::InTime,
        d if d > 1 => Receipt::Delayed,
        _ => Receipt::Ahead,
    }
}

/// Receipt record of one particle at one reference frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceivedState {
    pub receipt: Receipt,
    pub delay: i32,
    /// Display frame at which the position arrived.
    pub received_frame: i32,
}

/// Receipt history of one particle; `states` is parallel to its reference frames.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReceivedParticle {
    /// Lowest reference frame received so far.
    pub first: Option<usize>,
    /// Highest reference frame received so far.
    pub last: Option<usize>,
    /// Reference frame of the most recent receipt.
    pub current: Option<usize>,
    pub states: Vec<ReceivedState>,
}

impl ReceivedParticle {
    fn new(frame_count: usize) -> Self {
        Self {
            states: vec![ReceivedState::default(); frame_count],
            ..Default::default()
        }
    }

    /// Most recent receipt, if any.
    pub fn current_state(&self) -> Option<(usize, &ReceivedState)> {
        self.current
            .and_then(|f| self.states.get(f).map(|state| (f, state)))
    }

    /// Forgets first/last/current; per-frame records stay.
    pub fn clear_window(&mut self) {
        self.first = None;
        self.last = None;
        self.current = None;
    }
}

/// Counts of current receipts across all particles of one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReceiptSummary {
    pub in_time: usize,
    pub delayed: usize,
    pub ahead: usize,
    pub unreceived: usize,
}

/// Per-sender receipt tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedParticleData {
    /// Last frame number advertised by the remote sender; -1 until known.
    pub rec_frame: i32,
    pub particles: Vec<ReceivedParticle>,
}

impl ReceivedParticleData {
    /// Creates an empty tracker shaped like `data`.
    pub fn new(data: &RefParticleData) -> Self {
        Self {
            rec_frame: -1,
            particles: (0..data.particle_count())
                .map(|_| ReceivedParticle::new(data.frame_count()))
                .collect(),
        }
    }

    /// Clears every receipt.
    pub fn reset(&mut self) {
        self.rec_frame = -1;
        for p in &mut self.particles {
            p.clear_window();
            p.states.iter_mut().for_each(|s| *s = ReceivedState::default());
        }
    }

    /// Records that `particle`'s reference frame `matched_frame` arrived while
    /// `display_frame` was shown.
    pub fn record(
        &mut self,
        particle: usize,
        matched_frame: usize,
        display_frame: i32,
    ) -> Option<Receipt> {
        let p = self.particles.get_mut(particle)?;
        let state = p.states.get_mut(matched_frame)?;

        let delay = display_frame - matched_frame as i32;
        let receipt = classify_delay(delay);
        *state = ReceivedState {
            receipt,
            delay,
            received_frame: display_frame,
        };

        p.current = Some(matched_frame);
        match (p.first, p.last) {
            (Some(first), Some(last)) => {
                p.first = Some(first.min(matched_frame));
                p.last = Some(last.max(matched_frame));
            }
            _ => {
                p.first = Some(matched_frame);
                p.last = Some(matched_frame);
            }
        }

        trace!(particle, matched_frame, display_frame, delay, ?receipt, "Particle received");
        Some(receipt)
    }

    /// Matches a received position against the reference data and records it.
    ///
    /// The claimed frame is the last frame the sender advertised. Returns
    /// `None` when the position matches no reference frame.
    pub fn classify_position(
        &mut self,
        data: &RefParticleData,
        particle: usize,
        pos: Vec3,
        display_frame: i32,
    ) -> Option<Receipt> {
        let Some(matched) = data.find_ref_particle_state(particle, self.rec_frame, pos) else {
            warn!(
                particle,
                claimed_frame = self.rec_frame,
                ?pos,
                "Received position matches no reference frame"
            );
            return None;
        };
        self.record(particle, matched, display_frame)
    }

    /// Handles a removed layer item.
    pub fn unset(&mut self, particle: usize) {
        if let Some(p) = self.particles.get_mut(particle) {
            p.clear_window();
        }
    }

    pub fn summary(&self) -> ReceiptSummary {
        let mut s = ReceiptSummary::default();
        for p in &self.particles {
            match p.current_state().map(|(_, st)| st.receipt) {
                Some(Receipt::InTime) => s.in_time += 1,
                Some(Receipt::Delayed) => s.delayed += 1,
                Some(Receipt::Ahead) => s.ahead += 1,
                Some(Receipt::Unreceived) | None => s.unreceived += 1,
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> RefParticleData {
        let track: Vec<Vec3> = (0..20).map(|f| Vec3::new(f as f32, 1.0, 0.0)).collect();
        let other: Vec<Vec3> = (0..20).map(|f| Vec3::new(0.0, f as f32, 2.0)).collect();
        RefParticleData::from_tracks(&[track, other])
    }

    #[test]
    fn delay_thresholds() {
        assert_eq!(classify_delay(0), Receipt::InTime);
        assert_eq!(classify_delay(1), Receipt::InTime);
        assert_eq!(classify_delay(2), Receipt::Delayed);
        assert_eq!(classify_delay(30), Receipt::Delayed);
        assert_eq!(classify_delay(-1), Receipt::Ahead);
    }

    #[test]
    fn new_tracker_matches_dataset_shape() {
        let data = dataset();
        let rec = ReceivedParticleData::new(&data);
        assert_eq!(rec.rec_frame, -1);
        assert_eq!(rec.particles.len(), 2);
        assert!(rec.particles.iter().all(|p| p.states.len() == 20));
        assert_eq!(rec.summary().unreceived, 2);
    }

    #[test]
    fn record_widens_first_and_last() {
        let data = dataset();
        let mut rec = ReceivedParticleData::new(&data);

        assert_eq!(rec.record(0, 5, 5), Some(Receipt::InTime));
        assert_eq!(rec.record(0, 3, 9), Some(Receipt::Delayed));
        assert_eq!(rec.record(0, 8, 7), Some(Receipt::Ahead));

        let p = &rec.particles[0];
        assert_eq!(p.first, Some(3));
        assert_eq!(p.last, Some(8));
        assert_eq!(p.current, Some(8));
        assert_eq!(
            p.states[3],
            ReceivedState {
                receipt: Receipt::Delayed,
                delay: 6,
                received_frame: 9
            }
        );
    }

    #[test]
    fn record_out_of_range_is_ignored() {
        let data = dataset();
        let mut rec = ReceivedParticleData::new(&data);
        assert_eq!(rec.record(7, 1, 1), None);
        assert_eq!(rec.record(0, 99, 1), None);
    }

    #[test]
    fn classify_position_uses_advertised_frame() {
        let data = dataset();
        let mut rec = ReceivedParticleData::new(&data);
        rec.rec_frame = 10;

        // Position of frame 10 shown at frame 11: one frame late is in time.
        let r = rec.classify_position(&data, 0, Vec3::new(10.0, 1.0, 0.0), 11);
        assert_eq!(r, Some(Receipt::InTime));

        // Position of frame 4 shown at frame 11.
        let r = rec.classify_position(&data, 0, Vec3::new(4.0, 1.0, 0.0), 11);
        assert_eq!(r, Some(Receipt::Delayed));
        assert_eq!(rec.particles[0].states[4].delay, 7);

        // Unknown position.
        let r = rec.classify_position(&data, 0, Vec3::new(0.5, 0.5, 0.5), 11);
        assert_eq!(r, None);
        assert_eq!(rec.particles[0].current, Some(4));
    }

    #[test]
    fn unset_and_summary() {
        let data = dataset();
        let mut rec = ReceivedParticleData::new(&data);
        rec.record(0, 2, 2);
        rec.record(1, 2, 6);
        let s = rec.summary();
        assert_eq!((s.in_time, s.delayed, s.unreceived), (1, 1, 0));

        rec.unset(1);
        assert_eq!(rec.particles[1].current, None);
        assert_eq!(rec.particles[1].first, None);
        assert_eq!(rec.summary().unreceived, 1);

        rec.reset();
        assert_eq!(rec.summary().unreceived, 2);
        assert_eq!(rec.particles[0].states[2], ReceivedState::default());
    }
}
