//! Reference particle data.
//!
//! A prerecorded particle simulation stored as one point-cache file per frame.
//! It is both the source the sender replays and the ground truth the receiver
//! compares received positions against. The data is immutable once loaded.
//!
//! # File format
//! Each frame file is little-endian:
//! - 8 bytes magic `BPHYSICS`
//! - `i32` cache type, `i32` particle count, `i32` data type
//! - per particle: position `3 × f32`, velocity `3 × f32`
//!
//! The frame number is encoded in the last 15 characters of the file name
//! (`<name>_NNNNNN_II.bphys`) and is 1-based.
//!
//! # Usage
//! ```ignore
//! let data = RefParticleData::load("cache/")?;
//! println!("{} particles, {} frames", data.particle_count(), data.frame_count());
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::math::Vec3;

/// Point-cache file magic.
pub const BPHYSICS_MAGIC: &[u8; 8] = b"BPHYSICS";

/// Bytes before the first particle record.
const HEADER_LEN: usize = 8 + 3 * 4;

/// Bytes per particle record (position + velocity).
const RECORD_LEN: usize = 6 * 4;

/// Length of the `NNNNNN_II.bphys` suffix that carries the frame number.
const FRAME_SUFFIX_LEN: usize = 15;

/// Lifecycle of a particle at one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticleState {
    /// Not born yet: still sitting at its frame-0 position.
    #[default]
    Unborn,
    Active,
    /// Stopped moving after being born.
    Dead,
}

/// One particle at one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RefParticleState {
    pub frame: usize,
    pub state: ParticleState,
    pub pos: Vec3,
    pub vel: Vec3,
}

/// All frames of one particle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefParticle {
    pub id: usize,
    pub born_frame: Option<usize>,
    pub die_frame: Option<usize>,
    pub states: Vec<RefParticleState>,
}

/// Why a single frame file was rejected.
#[derive(Debug, Error)]
pub enum FrameFileError {
    #[error("not a particle cache file")]
    BadMagic,
    #[error("negative particle count {0}")]
    BadParticleCount(i32),
    #[error("truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("no frame number in file name")]
    NoFrameNumber,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded frame file.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// 1-based frame number.
    pub frame: usize,
    /// `(position, velocity)` per particle.
    pub particles: Vec<(Vec3, Vec3)>,
}

/// Source of reference particle data.
pub trait DatasetLoader {
    fn load(&self, path: &Path) -> anyhow::Result<RefParticleData>;
}

/// Loads point-cache directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct BphysicsLoader;

impl DatasetLoader for BphysicsLoader {
    fn load(&self, path: &Path) -> anyhow::Result<RefParticleData> {
        RefParticleData::load(path)
    }
}

/// Immutable reference dataset: particle × frame table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefParticleData {
    pub dir: Option<PathBuf>,
    frame_count: usize,
    particles: Vec<RefParticle>,
}

impl RefParticleData {
    /// Loads every frame file in `dir`.
    ///
    /// Fails only when the directory cannot be read. Files that are not
    /// particle caches, are truncated, or carry a frame number outside
    /// `1..=frame_count` are skipped with a log line.
    pub fn load<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("open particle directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in &paths {
            match read_frame_file(path) {
                Ok(record) => records.push(record),
                Err(FrameFileError::BadMagic) => {
                    warn!(file = %path.display(), "Not a particle data file, skipping");
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unreadable particle data file, skipping");
                }
            }
        }

        let mut data = Self::from_frames(records);
        data.dir = Some(dir.to_path_buf());

        info!(
            dir = %dir.display(),
            particles = data.particle_count(),
            frames = data.frame_count(),
            "Reference particle data loaded"
        );
        Ok(data)
    }

    /// Builds the table from decoded frame files and classifies lifecycles.
    ///
    /// `frame_count` is the number of records, `particle_count` the largest
    /// particle count seen. Records whose frame number is outside
    /// `1..=frame_count` are dropped.
    pub fn from_frames(records: Vec<FrameRecord>) -> Self {
        let frame_count = records.len();
        let particle_count = records.iter().map(|r| r.particles.len()).max().unwrap_or(0);

        debug!(particle_count, frame_count, "Allocating reference particle table");

        let mut particles: Vec<RefParticle> = (0..particle_count)
            .map(|id| RefParticle {
                id,
                born_frame: None,
                die_frame: None,
                states: (0..frame_count)
                    .map(|frame| RefParticleState {
                        frame,
                        ..Default::default()
                    })
                    .collect(),
            })
            .collect();

        for record in records {
            if record.frame < 1 || record.frame > frame_count {
                error!(frame = record.frame, frame_count, "Bad frame number, skipping");
                continue;
            }
            let index = record.frame - 1;
            for (id, (pos, vel)) in record.particles.into_iter().enumerate() {
                let state = &mut particles[id].states[index];
                state.pos = pos;
                state.vel = vel;
            }
        }

        for particle in &mut particles {
            classify_lifecycle(particle);
        }

        Self {
            dir: None,
            frame_count,
            particles,
        }
    }

    /// Builds a dataset from per-particle position tracks (velocity zero).
    ///
    /// Every track must have the same length; shorter tracks are padded with
    /// their last position.
    pub fn from_tracks(tracks: &[Vec<Vec3>]) -> Self {
        let frame_count = tracks.iter().map(Vec::len).max().unwrap_or(0);
        let records = (0..frame_count)
            .map(|frame| FrameRecord {
                frame: frame + 1,
                particles: tracks
                    .iter()
                    .map(|t| {
                        let pos = t.get(frame).or(t.last()).copied().unwrap_or_default();
                        (pos, Vec3::ZERO)
                    })
                    .collect(),
            })
            .collect();
        Self::from_frames(records)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    pub fn particles(&self) -> &[RefParticle] {
        &self.particles
    }

    pub fn particle(&self, id: usize) -> Option<&RefParticle> {
        self.particles.get(id)
    }

    /// State of particle `id` at `frame`.
    pub fn state(&self, id: usize, frame: usize) -> Option<&RefParticleState> {
        self.particles.get(id).and_then(|p| p.states.get(frame))
    }

    /// Finds the reference frame a received position belongs to.
    ///
    /// Search order: the claimed frame itself, then backwards to frame 0
    /// (late delivery), then forwards to the last frame (early delivery).
    /// Positions compare with exact float equality. A claimed frame outside
    /// the table starts each scan at the nearest valid frame.
    pub fn find_ref_particle_state(
        &self,
        particle: usize,
        claimed_frame: i32,
        pos: Vec3,
    ) -> Option<usize> {
        let states = &self.particles.get(particle)?.states;
        if states.is_empty() {
            return None;
        }
        let last = states.len() - 1;
        let matches = |i: usize| states[i].pos == pos;

        if claimed_frame >= 0 && (claimed_frame as usize) <= last && matches(claimed_frame as usize)
        {
            return Some(claimed_frame as usize);
        }

        if claimed_frame >= 0 {
            let from = (claimed_frame as usize).min(last);
            if let Some(i) = (0..=from).rev().find(|&i| matches(i)) {
                return Some(i);
            }
        }

        let from = claimed_frame.max(0) as usize;
        (from..=last).find(|&i| matches(i))
    }
}

/// Marks each frame of `particle` as unborn, active or dead.
///
/// Unborn while the position equals the frame-0 position; born at the first
/// frame that differs; dead from the first later frame that repeats the
/// previous frame's position. One forward pass, exact comparisons.
pub fn classify_lifecycle(particle: &mut RefParticle) {
    particle.born_frame = None;
    particle.die_frame = None;

    let Some(origin) = particle.states.first().map(|s| s.pos) else {
        return;
    };

    let mut prev = origin;
    for frame in 0..particle.states.len() {
        let pos = particle.states[frame].pos;
        let state = match (particle.born_frame, particle.die_frame) {
            (None, _) if pos == origin => ParticleState::Unborn,
            (None, _) => {
                particle.born_frame = Some(frame);
                ParticleState::Active
            }
            (Some(_), Some(_)) => ParticleState::Dead,
            (Some(_), None) if pos == prev => {
                particle.die_frame = Some(frame);
                ParticleState::Dead
            }
            (Some(_), None) => ParticleState::Active,
        };
        particle.states[frame].state = state;
        prev = pos;
    }
}

/// Extracts the 1-based frame number from a cache file name.
pub fn frame_from_file_name(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    if bytes.len() < FRAME_SUFFIX_LEN {
        return None;
    }
    let digits: String = bytes[bytes.len() - FRAME_SUFFIX_LEN..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .map(|&b| b as char)
        .collect();
    digits.parse().ok()
}

/// Reads and validates one frame file.
pub fn read_frame_file(path: &Path) -> Result<FrameRecord, FrameFileError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;

    let particles = decode_cache_frame(&bytes)?;
    let frame = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(frame_from_file_name)
        .ok_or(FrameFileError::NoFrameNumber)?;

    Ok(FrameRecord { frame, particles })
}

/// Decodes the body of a frame file.
pub fn decode_cache_frame(bytes: &[u8]) -> Result<Vec<(Vec3, Vec3)>, FrameFileError> {
    if bytes.len() < BPHYSICS_MAGIC.len() || &bytes[..BPHYSICS_MAGIC.len()] != BPHYSICS_MAGIC {
        return Err(FrameFileError::BadMagic);
    }
    if bytes.len() < HEADER_LEN {
        return Err(FrameFileError::Truncated {
            expected: HEADER_LEN,
            found: bytes.len(),
        });
    }

    let count = read_i32(&bytes[12..]);
    if count < 0 {
        return Err(FrameFileError::BadParticleCount(count));
    }
    let count = count as usize;
    let expected = HEADER_LEN + count * RECORD_LEN;
    if bytes.len() < expected {
        return Err(FrameFileError::Truncated {
            expected,
            found: bytes.len(),
        });
    }

    Ok((0..count)
        .map(|i| {
            let rec = &bytes[HEADER_LEN + i * RECORD_LEN..];
            let pos = Vec3::new(read_f32(rec), read_f32(&rec[4..]), read_f32(&rec[8..]));
            let vel = Vec3::new(read_f32(&rec[12..]), read_f32(&rec[16..]), read_f32(&rec[20..]));
            (pos, vel)
        })
        .collect())
}

/// Encodes a frame file body.
pub fn encode_cache_frame(particles: &[(Vec3, Vec3)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + particles.len() * RECORD_LEN);
    out.extend_from_slice(BPHYSICS_MAGIC);
    out.extend_from_slice(&1i32.to_le_bytes()); // particle cache
    out.extend_from_slice(&(particles.len() as i32).to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    for (pos, vel) in particles {
        for c in pos.to_array().into_iter().chain(vel.to_array()) {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }
    out
}

/// Writes frame `frame` (1-based) of a cache named `name` into `dir`.
pub fn write_frame_file(
    dir: &Path,
    name: &str,
    frame: usize,
    particles: &[(Vec3, Vec3)],
) -> anyhow::Result<PathBuf> {
    let path = dir.join(format!("{name}_{frame:06}_00.bphys"));
    let mut w = BufWriter::new(
        File::create(&path).with_context(|| format!("create {}", path.display()))?,
    );
    w.write_all(&encode_cache_frame(particles))
        .with_context(|| format!("write {}", path.display()))?;
    w.flush()?;
    Ok(path)
}

// Binary reading helpers. Callers check lengths first.
fn read_i32(d: &[u8]) -> i32 {
    i32::from_le_bytes([d[0], d[1], d[2], d[3]])
}

fn read_f32(d: &[u8]) -> f32 {
    f32::from_le_bytes([d[0], d[1], d[2], d[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f32) -> Vec3 {
        Vec3::new(x, 0.0, 0.0)
    }

    /// Still at 0..=4, moves 5..=9, repeats frame 9 from frame 10 on.
    fn lifecycle_track() -> Vec<Vec3> {
        let mut t = vec![v(0.0); 5];
        t.extend((5..10).map(|f| v(f as f32)));
        t.extend(std::iter::repeat(v(9.0)).take(4));
        t
    }

    #[test]
    fn lifecycle_unborn_active_dead() {
        let data = RefParticleData::from_tracks(&[lifecycle_track()]);
        let p = data.particle(0).unwrap();

        assert_eq!(p.born_frame, Some(5));
        assert_eq!(p.die_frame, Some(10));
        for f in 0..5 {
            assert_eq!(p.states[f].state, ParticleState::Unborn, "frame {f}");
        }
        for f in 5..10 {
            assert_eq!(p.states[f].state, ParticleState::Active, "frame {f}");
        }
        for f in 10..14 {
            assert_eq!(p.states[f].state, ParticleState::Dead, "frame {f}");
        }
    }

    #[test]
    fn lifecycle_dead_stays_dead_even_if_moving_again() {
        let track = vec![v(0.0), v(1.0), v(1.0), v(2.0), v(3.0)];
        let data = RefParticleData::from_tracks(&[track]);
        let p = data.particle(0).unwrap();
        assert_eq!(p.born_frame, Some(1));
        assert_eq!(p.die_frame, Some(2));
        assert_eq!(p.states[3].state, ParticleState::Dead);
        assert_eq!(p.states[4].state, ParticleState::Dead);
    }

    #[test]
    fn lifecycle_never_moving_particle_stays_unborn() {
        let data = RefParticleData::from_tracks(&[vec![v(4.0); 6]]);
        let p = data.particle(0).unwrap();
        assert_eq!(p.born_frame, None);
        assert_eq!(p.die_frame, None);
        assert!(p.states.iter().all(|s| s.state == ParticleState::Unborn));
    }

    #[test]
    fn find_exact_earlier_later_and_missing() {
        let track: Vec<Vec3> = (0..10).map(|f| v(f as f32)).collect();
        let data = RefParticleData::from_tracks(&[track]);

        // exact
        assert_eq!(data.find_ref_particle_state(0, 4, v(4.0)), Some(4));
        // delayed: claimed 7, position from frame 2
        assert_eq!(data.find_ref_particle_state(0, 7, v(2.0)), Some(2));
        // early: claimed 3, position from frame 8
        assert_eq!(data.find_ref_particle_state(0, 3, v(8.0)), Some(8));
        // no such position
        assert_eq!(data.find_ref_particle_state(0, 3, v(42.5)), None);
        // no such particle
        assert_eq!(data.find_ref_particle_state(3, 3, v(1.0)), None);
    }

    #[test]
    fn find_prefers_backward_match_over_forward() {
        // Position 1.0 occurs at frames 1 and 6.
        let track = vec![v(0.0), v(1.0), v(2.0), v(3.0), v(4.0), v(5.0), v(1.0)];
        let data = RefParticleData::from_tracks(&[track]);
        assert_eq!(data.find_ref_particle_state(0, 4, v(1.0)), Some(1));
        assert_eq!(data.find_ref_particle_state(0, 0, v(1.0)), Some(1));
    }

    #[test]
    fn find_handles_out_of_range_claims() {
        let track: Vec<Vec3> = (0..5).map(|f| v(f as f32)).collect();
        let data = RefParticleData::from_tracks(&[track]);
        assert_eq!(data.find_ref_particle_state(0, -1, v(3.0)), Some(3));
        assert_eq!(data.find_ref_particle_state(0, 99, v(3.0)), Some(3));
    }

    #[test]
    fn frame_number_from_file_name() {
        assert_eq!(frame_from_file_name("smoke_000012_00.bphys"), Some(12));
        assert_eq!(frame_from_file_name("x_000001_00.bphys"), Some(1));
        assert_eq!(frame_from_file_name("short.bphys"), None);
        assert_eq!(frame_from_file_name("abc_xxxxxx_00.bphys"), None);
    }

    #[test]
    fn decode_rejects_bad_magic_and_truncation() {
        assert!(matches!(decode_cache_frame(b"NOTPHYS!...."), Err(FrameFileError::BadMagic)));

        let mut bytes = encode_cache_frame(&[(v(1.0), Vec3::ZERO), (v(2.0), Vec3::ZERO)]);
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(
            decode_cache_frame(&bytes),
            Err(FrameFileError::Truncated { .. })
        ));
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "particle_data_{tag}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_directory_skips_foreign_files() {
        let dir = temp_dir("load");
        let vel = Vec3::new(0.5, 0.0, 0.0);
        write_frame_file(&dir, "cache", 1, &[(v(0.0), vel), (v(10.0), vel)]).unwrap();
        write_frame_file(&dir, "cache", 2, &[(v(1.0), vel), (v(10.0), vel)]).unwrap();
        write_frame_file(&dir, "cache", 3, &[(v(2.0), vel)]).unwrap();
        fs::write(dir.join("README.txt"), b"not a cache file").unwrap();

        let data = RefParticleData::load(&dir).unwrap();
        assert_eq!(data.frame_count(), 3);
        assert_eq!(data.particle_count(), 2);
        assert_eq!(data.state(0, 2).unwrap().pos, v(2.0));
        assert_eq!(data.state(0, 1).unwrap().vel, vel);
        assert_eq!(data.particle(0).unwrap().born_frame, Some(1));
        assert_eq!(data.dir.as_deref(), Some(dir.as_path()));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_directory_fails() {
        let missing = std::env::temp_dir().join("particle_data_definitely_missing_dir");
        assert!(RefParticleData::load(missing).is_err());
    }
}
