//! Shared fixtures for the integration tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use particle_shared::config::{ClientConfig, Role};
use particle_shared::math::Vec3;
use particle_shared::particle_data::write_frame_file;

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// A particle cache directory removed on drop.
pub struct Dataset {
    dir: PathBuf,
}

impl Dataset {
    /// Writes `frames` cache files for `particles` particles.
    ///
    /// Particles start moving one after another, one unit along x per frame,
    /// so no two active positions are equal.
    pub fn generate(tag: &str, particles: usize, frames: usize) -> anyhow::Result<Self> {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "particle_tests_{tag}_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        for frame in 1..=frames {
            let state: Vec<(Vec3, Vec3)> = (0..particles)
                .map(|p| {
                    let t = frame.saturating_sub(p) as f32;
                    (Vec3::new(t, p as f32, 1.0), Vec3::new(1.0, 0.0, 0.0))
                })
                .collect();
            write_frame_file(&dir, "cache", frame, &state)?;
        }
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Client settings for a local test server.
pub fn client_config(role: Role, server: &str, data: &Dataset, username: &str) -> ClientConfig {
    ClientConfig {
        role,
        server_addr: server.to_string(),
        data_dir: data.path().display().to_string(),
        fps: 50,
        preroll_frames: Some(2),
        username: username.to_string(),
        ..Default::default()
    }
}

/// Polls `cond` every 20 ms until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
