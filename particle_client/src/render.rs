//! Rendering abstraction.
//!
//! The client does not depend on a graphics backend. A render thread builds
//! read-only [`SenderView`] snapshots of every running sender and hands them
//! to a [`RenderBackend`]. Headless backends log summaries or capture frames
//! as JSON lines.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use particle_shared::config::VisualType;
use particle_shared::math::Vec3;
use particle_shared::particle_data::RefParticleData;
use particle_shared::received::{Receipt, ReceiptSummary};
use particle_shared::sender::{ParticleSender, SenderPool};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Render loop rate.
pub const RENDER_PERIOD: Duration = Duration::from_millis(16);

/// One received particle position to draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParticlePoint {
    pub particle: usize,
    /// Reference frame the position belongs to.
    pub frame: usize,
    pub pos: Vec3,
    pub receipt: Receipt,
    pub delay: i32,
}

/// Reference positions a particle should have covered since its last receipt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trail {
    pub particle: usize,
    pub points: Vec<Vec3>,
}

/// What one sender looks like at one rendered frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SenderView {
    pub id: u16,
    pub position: Vec3,
    pub frame: i32,
    pub points: Vec<ParticlePoint>,
    pub trails: Vec<Trail>,
    pub summary: ReceiptSummary,
}

/// Builds the view of `sender`; `None` if its clock is not running.
///
/// Reads the timer first and releases it before locking the tracker.
pub fn build_view(
    sender: &ParticleSender,
    data: &RefParticleData,
    visual: VisualType,
) -> Option<SenderView> {
    let timer = sender.timer.snapshot();
    if !timer.running {
        return None;
    }
    let display = timer.frame;
    let rec = sender.received()?;

    let mut points = Vec::new();
    let mut trails = Vec::new();

    for (id, p) in rec.particles.iter().enumerate() {
        let Some(reference) = data.particle(id) else {
            continue;
        };
        let point = |frame: usize| {
            let st = &p.states[frame];
            ParticlePoint {
                particle: id,
                frame,
                pos: reference.states[frame].pos,
                receipt: st.receipt,
                delay: st.delay,
            }
        };

        if visual.shows_dots() {
            if let (Some(first), Some(last)) = (p.first, p.last) {
                points.extend(
                    (first..=last)
                        .filter(|&f| p.states[f].receipt != Receipt::Unreceived)
                        .map(point),
                );
            }
        } else if let Some((frame, st)) = p.current_state() {
            let visible = match st.receipt {
                Receipt::InTime | Receipt::Ahead => true,
                Receipt::Delayed => reference
                    .die_frame
                    .map_or(true, |die| display + 1 < die as i32),
                Receipt::Unreceived => false,
            };
            if visible {
                points.push(point(frame));
            }
        }

        if visual.shows_lines() {
            if let Some(last) = p.last {
                if display >= last as i32 {
                    let to = (display as usize).min(reference.states.len().saturating_sub(1));
                    trails.push(Trail {
                        particle: id,
                        points: reference.states[last..=to].iter().map(|s| s.pos).collect(),
                    });
                }
            }
        }
    }

    let summary = rec.summary();
    drop(rec);

    Some(SenderView {
        id: sender.id,
        position: sender.position(),
        frame: display,
        points,
        trails,
        summary,
    })
}

/// A minimal rendering API.
pub trait RenderBackend: Send {
    fn begin_frame(&mut self);
    fn draw_sender(&mut self, view: &SenderView);
    fn end_frame(&mut self) -> anyhow::Result<()>;
}

/// A no-op renderer useful for headless tests.
#[derive(Default)]
pub struct NullRenderer;

impl RenderBackend for NullRenderer {
    fn begin_frame(&mut self) {}
    fn draw_sender(&mut self, _view: &SenderView) {}
    fn end_frame(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs a receipt summary per sender every `every` frames.
pub struct LogRenderer {
    every: u64,
    frame: u64,
}

impl LogRenderer {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            frame: 0,
        }
    }
}

impl Default for LogRenderer {
    /// About once a second at the render rate.
    fn default() -> Self {
        Self::new(60)
    }
}

impl RenderBackend for LogRenderer {
    fn begin_frame(&mut self) {
        self.frame += 1;
    }

    fn draw_sender(&mut self, view: &SenderView) {
        if self.frame % self.every != 0 {
            return;
        }
        let s = view.summary;
        info!(
            sender = view.id,
            frame = view.frame,
            in_time = s.in_time,
            delayed = s.delayed,
            ahead = s.ahead,
            unreceived = s.unreceived,
            "Receipts"
        );
    }

    fn end_frame(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct CapturedFrame<'a> {
    index: u64,
    senders: &'a [SenderView],
}

/// Writes every rendered frame as one JSON line.
pub struct CaptureRenderer<W: Write + Send> {
    out: W,
    index: u64,
    views: Vec<SenderView>,
}

impl CaptureRenderer<BufWriter<File>> {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::create(path).with_context(|| format!("create capture {}", path.display()))?;
        info!(path = %path.display(), "Capturing frames");
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> CaptureRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            index: 0,
            views: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RenderBackend for CaptureRenderer<W> {
    fn begin_frame(&mut self) {
        self.views.clear();
    }

    fn draw_sender(&mut self, view: &SenderView) {
        self.views.push(view.clone());
    }

    fn end_frame(&mut self) -> anyhow::Result<()> {
        let frame = CapturedFrame {
            index: self.index,
            senders: &self.views,
        };
        serde_json::to_writer(&mut self.out, &frame).context("serialize frame")?;
        self.out.write_all(b"\n").context("write frame")?;
        self.out.flush().context("flush capture")?;
        self.index += 1;
        Ok(())
    }
}

/// Renders one frame of every running sender.
pub fn render_frame(
    backend: &mut dyn RenderBackend,
    pool: &SenderPool,
    visual: VisualType,
) -> anyhow::Result<()> {
    backend.begin_frame();
    for sender in pool.senders() {
        if let Some(view) = build_view(sender, pool.data(), visual) {
            backend.draw_sender(&view);
        }
    }
    backend.end_frame()
}

/// Handle to the render thread. Dropping it stops the thread.
pub struct RenderLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RenderLoop {
    pub fn spawn(
        pool: Arc<SenderPool>,
        visual: VisualType,
        mut backend: Box<dyn RenderBackend>,
        period: Duration,
    ) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("render".into())
            .spawn(move || {
                debug!(?visual, "Render loop running");
                while !flag.load(Ordering::Relaxed) {
                    if let Err(e) = render_frame(backend.as_mut(), &pool, visual) {
                        warn!(error = %e, "Render backend failed, stopping render loop");
                        break;
                    }
                    thread::sleep(period);
                }
                debug!("Render loop stopped");
            })
            .context("spawn render thread")?;
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

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
