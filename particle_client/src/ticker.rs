//! Frame timer thread.
//!
//! Paces the animation: wakes at fixed deadlines derived from a start instant
//! and the frame period, advances every running sender timer (by more than
//! one frame if the thread fell behind) and posts one permit on the wake
//! semaphore so the event loop processes the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use particle_shared::sender::SenderPool;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// Wakes that may pile up while the event loop is busy.
const MAX_PENDING_WAKES: usize = 4;

/// Fixed-rate deadline schedule.
#[derive(Debug, Clone)]
pub struct FrameClock {
    period: Duration,
    next: Instant,
}

impl FrameClock {
    pub fn new(period: Duration, start: Instant) -> Self {
        let period = period.max(Duration::from_micros(1));
        Self {
            period,
            next: start + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time left until the next deadline; zero if it already passed.
    pub fn until_next(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Consumes the deadlines that passed by `now`, returning how many
    /// frames elapsed (at least one) and scheduling the next deadline.
    pub fn advance(&mut self, now: Instant) -> u64 {
        let late = now.saturating_duration_since(self.next);
        let steps = 1 + (late.as_nanos() / self.period.as_nanos()) as u64;
        for _ in 0..steps {
            self.next += self.period;
        }
        steps
    }
}

/// Handle to the running frame timer thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct FrameTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameTicker {
    pub fn spawn(
        pool: Arc<SenderPool>,
        period: Duration,
        wake: Arc<Semaphore>,
    ) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("frame-timer".into())
            .spawn(move || run(pool, period, wake, flag))
            .context("spawn frame timer thread")?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(pool: Arc<SenderPool>, period: Duration, wake: Arc<Semaphore>, stop: Arc<AtomicBool>) {
    let mut clock = FrameClock::new(period, Instant::now());
    debug!(period_ms = period.as_millis() as u64, "Frame timer running");

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(clock.until_next(Instant::now()));
        let steps = clock.advance(Instant::now());
        if steps > 1 {
            trace!(steps, "Frame timer caught up");
        }
        pool.tick_all(steps);
        if wake.available_permits() < MAX_PENDING_WAKES {
            wake.add_permits(1);
        }
    }
    debug!("Frame timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_shared::config::Role;
    use particle_shared::math::Vec3;
    use particle_shared::particle_data::RefParticleData;

    #[test]
    fn clock_counts_missed_deadlines() {
        let t0 = Instant::now();
        let period = Duration::from_millis(40);
        let mut clock = FrameClock::new(period, t0);

        assert_eq!(clock.until_next(t0), period);
        assert_eq!(clock.advance(t0 + period), 1);
        // 2.5 periods late: the due frame plus two skipped ones.
        assert_eq!(clock.advance(t0 + period * 2 + period * 5 / 2), 3);
        assert_eq!(clock.until_next(t0 + period * 5), Duration::ZERO);
        assert_eq!(clock.until_next(t0 + period * 4), period);
    }

    #[test]
    fn ticker_advances_running_timers_and_wakes() {
        let data = Arc::new(RefParticleData::from_tracks(&[vec![Vec3::ZERO; 100]]));
        let pool = Arc::new(SenderPool::new(1, Role::Sender, data));
        pool.get(0).unwrap().timer.start(0, pool.frame_count());

        let wake = Arc::new(Semaphore::new(0));
        let ticker =
            FrameTicker::spawn(Arc::clone(&pool), Duration::from_millis(2), Arc::clone(&wake))
                .unwrap();
        thread::sleep(Duration::from_millis(50));
        ticker.stop();

        assert!(pool.get(0).unwrap().timer.snapshot().total_frame > 0);
        assert!(wake.available_permits() >= 1);
        assert!(wake.available_permits() <= MAX_PENDING_WAKES);
    }
}
