//! Configuration system.
//!
//! Client and server configuration, loadable from JSON strings (file IO left
//! to the binaries) and filled in from the command line.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::protocol::DEFAULT_PORT;

/// Which half of the demo this client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    #[default]
    Receiver,
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => anyhow::bail!("unknown client type `{other}` (expected sender or receiver)"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        })
    }
}

/// How the receiver visualizes received particles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisualType {
    /// Only the most recent receipt per particle.
    #[default]
    Simple,
    /// Every receipt from the first to the last received frame.
    Dot,
    /// Reference trail from the last receipt to the displayed frame.
    Line,
    DotLine,
}

impl VisualType {
    pub fn shows_dots(self) -> bool {
        matches!(self, VisualType::Dot | VisualType::DotLine)
    }

    pub fn shows_lines(self) -> bool {
        matches!(self, VisualType::Line | VisualType::DotLine)
    }
}

impl FromStr for VisualType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "simple" => Ok(VisualType::Simple),
            "dots" => Ok(VisualType::Dot),
            "lines" => Ok(VisualType::Line),
            "dot-lines" => Ok(VisualType::DotLine),
            other => anyhow::bail!("unknown visualization `{other}`"),
        }
    }
}

/// Verbosity selected with `-d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    None,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    pub fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "none" => Ok(LogLevel::None),
            other => anyhow::bail!("unknown debug level `{other}`"),
        }
    }
}

bitflags::bitflags! {
    /// Client switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientFlags: u32 {
        /// Request a secured transport.
        const SECURE = 1 << 0;
        /// Record rendered frames.
        const SCREENCAST = 1 << 1;
    }
}

impl Serialize for ClientFlags {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for ClientFlags {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(ClientFlags::from_bits_truncate(u32::deserialize(d)?))
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub role: Role,
    /// Server address, `host[:port]`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Directory of reference particle cache files.
    #[serde(default)]
    pub data_dir: String,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_sender_count")]
    pub sender_count: u16,
    /// Slots in the node id lookup table.
    #[serde(default = "default_lookup_capacity")]
    pub lookup_capacity: usize,
    /// Frames the sender waits after its frame tag exists; defaults to `fps`.
    #[serde(default)]
    pub preroll_frames: Option<u32>,
    #[serde(default)]
    pub visual: VisualType,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub flags: ClientFlags,
    /// Output file for screencast capture.
    #[serde(default = "default_capture_path")]
    pub capture_path: String,
}

fn default_server_addr() -> String {
    format!("localhost:{DEFAULT_PORT}")
}

fn default_fps() -> u32 {
    25
}

fn default_sender_count() -> u16 {
    1
}

fn default_lookup_capacity() -> usize {
    10_000
}

fn default_username() -> String {
    "particle".to_string()
}

fn default_capture_path() -> String {
    "particle-capture.jsonl".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            server_addr: default_server_addr(),
            data_dir: String::new(),
            fps: default_fps(),
            sender_count: default_sender_count(),
            lookup_capacity: default_lookup_capacity(),
            preroll_frames: None,
            visual: VisualType::default(),
            log_level: None,
            username: default_username(),
            password: String::new(),
            flags: ClientFlags::empty(),
            capture_path: default_capture_path(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn preroll(&self) -> u32 {
        self.preroll_frames.unwrap_or(self.fps)
    }

    /// Frame period; a zero rate is treated as one frame per second.
    pub fn frame_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = ClientConfig::from_json_str(r#"{"role":"sender","fps":50,"flags":3}"#).unwrap();
        assert_eq!(cfg.role, Role::Sender);
        assert_eq!(cfg.fps, 50);
        assert_eq!(cfg.preroll(), 50);
        assert_eq!(cfg.lookup_capacity, 10_000);
        assert_eq!(cfg.sender_count, 1);
        assert!(cfg.flags.contains(ClientFlags::SECURE | ClientFlags::SCREENCAST));
    }

    #[test]
    fn cli_words_parse() {
        assert_eq!("dot-lines".parse::<VisualType>().unwrap(), VisualType::DotLine);
        assert_eq!("none".parse::<VisualType>().unwrap(), VisualType::Simple);
        assert_eq!("warning".parse::<LogLevel>().unwrap().filter_directive(), "warn");
        assert_eq!("none".parse::<LogLevel>().unwrap().filter_directive(), "off");
        assert!("speaker".parse::<Role>().is_err());
    }

    #[test]
    fn server_default_listen_addr() {
        let cfg = ServerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:12345");
    }
}
