//! Configuration types supplied by the embedding application.
//!
//! All durations are plain millisecond integers so settings files stay
//! readable; accessor methods hand out [`Duration`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default STUN/TURN port when a server URI omits one.
pub const DEFAULT_TRAVERSAL_PORT: u16 = 3478;

/// Which local tracks a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MediaMode {
    #[default]
    #[serde(rename = "video+audio")]
    VideoAudio,
    #[serde(rename = "audio-only")]
    AudioOnly,
    #[serde(rename = "video-only")]
    VideoOnly,
}

impl MediaMode {
    pub fn has_video(self) -> bool {
        matches!(self, Self::VideoAudio | Self::VideoOnly)
    }

    pub fn has_audio(self) -> bool {
        matches!(self, Self::VideoAudio | Self::AudioOnly)
    }
}

impl std::str::FromStr for MediaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video+audio" | "video-audio" | "both" => Ok(Self::VideoAudio),
            "audio-only" | "audio" => Ok(Self::AudioOnly),
            "video-only" | "video" => Ok(Self::VideoOnly),
            other => Err(Error::config(format!("unknown media mode `{other}`"))),
        }
    }
}

/// Per-call media options from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub mode: MediaMode,
    pub mirror: bool,
    /// Output resolution factor in `(0, 1]`.
    pub quality: f32,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            mode: MediaMode::VideoAudio,
            mirror: false,
            quality: 1.0,
        }
    }
}

impl MediaSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.quality > 0.0 && self.quality <= 1.0) {
            return Err(Error::config(format!(
                "quality must be in (0, 1], got {}",
                self.quality
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Stun,
    Turn,
}

/// A traversal server: `stun:host[:port]`, `turn:host[:port]`, or bare
/// `host:port` (STUN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalServer {
    pub address: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl TraversalServer {
    pub fn stun(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: None,
        }
    }

    /// Kind plus `host:port` target.
    pub fn target(&self) -> Result<(ServerKind, String)> {
        let (kind, rest) = if let Some(rest) = self.address.strip_prefix("stun:") {
            (ServerKind::Stun, rest)
        } else if let Some(rest) = self.address.strip_prefix("turn:") {
            (ServerKind::Turn, rest)
        } else {
            (ServerKind::Stun, self.address.as_str())
        };
        // Drop URI query parameters such as `?transport=udp`.
        let rest = rest.split('?').next().unwrap_or_default().trim();
        if rest.is_empty() {
            return Err(Error::config(format!(
                "traversal server `{}` has no host",
                self.address
            )));
        }

        let has_port = if rest.starts_with('[') {
            rest.contains("]:")
        } else {
            rest.matches(':').count() == 1
        };
        let target = if has_port {
            rest.to_string()
        } else if rest.contains(':') && !rest.starts_with('[') {
            format!("[{rest}]:{DEFAULT_TRAVERSAL_PORT}")
        } else {
            format!("{rest}:{DEFAULT_TRAVERSAL_PORT}")
        };
        Ok((kind, target))
    }
}

/// Engine-wide knobs. Every field has a default; a settings file only
/// needs the ones it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Local UDP bind address for the session socket.
    pub bind_addr: String,
    pub traversal_servers: Vec<TraversalServer>,
    /// Overall bound on one traversal resolution.
    pub traversal_timeout_ms: u64,
    pub traversal_retransmit_ms: u64,
    /// Pacing between connectivity checks.
    pub ice_check_interval_ms: u64,
    /// Checks sent on one pair before it is marked failed.
    pub ice_max_check_attempts: u32,
    /// Bound on reaching `connected` after both descriptions are set.
    pub ice_timeout_ms: u64,
    /// Interval of consent checks and transport pings.
    pub consent_interval_ms: u64,
    /// Silence before the path is considered disconnected.
    pub disconnect_timeout_ms: u64,
    /// Silence before the path is considered failed.
    pub failed_timeout_ms: u64,
    pub handshake_attempts: u32,
    pub handshake_step_timeout_ms: u64,
    /// Frames held per track before drop-oldest kicks in.
    pub jitter_depth: usize,
    pub jitter_initial_delay_ms: u64,
    pub jitter_max_delay_ms: u64,
    /// Consecutive undecodable frames before the session fails.
    pub decode_failure_threshold: u32,
    /// XOR parity group size (shards including parity), `None` disables FEC.
    pub fec_group: Option<u32>,
    pub nack: bool,
    /// Sent chunks kept per track for retransmission.
    pub retransmit_cache: usize,
    pub max_chunk_payload: usize,
    /// Bound on releasing all resources in `stop()`.
    pub stop_grace_ms: u64,
    /// Undelivered `FrameReady` events before new frames are dropped.
    pub frame_event_backlog: usize,
    /// Fraction of outgoing media datagrams to drop, for loss testing.
    pub simulated_send_loss: f32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            traversal_servers: Vec::new(),
            traversal_timeout_ms: 3_000,
            traversal_retransmit_ms: 500,
            ice_check_interval_ms: 50,
            ice_max_check_attempts: 7,
            ice_timeout_ms: 10_000,
            consent_interval_ms: 1_000,
            disconnect_timeout_ms: 5_000,
            failed_timeout_ms: 15_000,
            handshake_attempts: 10,
            handshake_step_timeout_ms: 250,
            jitter_depth: 32,
            jitter_initial_delay_ms: 20,
            jitter_max_delay_ms: 200,
            decode_failure_threshold: 30,
            fec_group: Some(5),
            nack: true,
            retransmit_cache: 512,
            max_chunk_payload: 1_100,
            stop_grace_ms: 500,
            frame_event_backlog: 64,
            simulated_send_loss: 0.0,
        }
    }
}

impl EngineSettings {
    pub fn from_json(text: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.jitter_depth == 0 {
            return Err(Error::config("jitter_depth must be at least 1"));
        }
        if let Some(group) = self.fec_group {
            if group < 2 {
                return Err(Error::config("fec_group must be at least 2"));
            }
        }
        if self.max_chunk_payload == 0 {
            return Err(Error::config("max_chunk_payload must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.simulated_send_loss) {
            return Err(Error::config("simulated_send_loss must be in [0, 1)"));
        }
        if self.disconnect_timeout_ms >= self.failed_timeout_ms {
            return Err(Error::config(
                "disconnect_timeout_ms must be below failed_timeout_ms",
            ));
        }
        for server in &self.traversal_servers {
            server.target()?;
        }
        Ok(())
    }

    pub fn traversal_timeout(&self) -> Duration {
        Duration::from_millis(self.traversal_timeout_ms)
    }

    pub fn traversal_retransmit(&self) -> Duration {
        Duration::from_millis(self.traversal_retransmit_ms)
    }

    pub fn ice_check_interval(&self) -> Duration {
        Duration::from_millis(self.ice_check_interval_ms)
    }

    pub fn ice_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_timeout_ms)
    }

    pub fn consent_interval(&self) -> Duration {
        Duration::from_millis(self.consent_interval_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn failed_timeout(&self) -> Duration {
        Duration::from_millis(self.failed_timeout_ms)
    }

    pub fn handshake_step_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_step_timeout_ms)
    }

    pub fn jitter_initial_delay(&self) -> Duration {
        Duration::from_millis(self.jitter_initial_delay_ms)
    }

    pub fn jitter_max_delay(&self) -> Duration {
        Duration::from_millis(self.jitter_max_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&MediaMode::VideoAudio).unwrap(),
            "\"video+audio\""
        );
        let mode: MediaMode = serde_json::from_str("\"audio-only\"").unwrap();
        assert_eq!(mode, MediaMode::AudioOnly);
        assert!(!mode.has_video());
        assert_eq!("video-only".parse::<MediaMode>().unwrap(), MediaMode::VideoOnly);
        assert!("smell-o-vision".parse::<MediaMode>().is_err());
    }

    #[test]
    fn quality_bounds() {
        let mut settings = MediaSettings::default();
        assert!(settings.validate().is_ok());
        settings.quality = 0.25;
        assert!(settings.validate().is_ok());
        for bad in [0.0, -0.5, 1.01, f32::NAN] {
            settings.quality = bad;
            assert!(settings.validate().is_err(), "quality {bad} accepted");
        }
    }

    #[test]
    fn traversal_targets() {
        let cases = [
            ("stun:stun.example.org", ServerKind::Stun, "stun.example.org:3478"),
            ("stun:stun.example.org:19302", ServerKind::Stun, "stun.example.org:19302"),
            ("turn:10.0.0.1:3479?transport=udp", ServerKind::Turn, "10.0.0.1:3479"),
            ("127.0.0.1:5000", ServerKind::Stun, "127.0.0.1:5000"),
            ("stun:[::1]:4000", ServerKind::Stun, "[::1]:4000"),
            ("stun:::1", ServerKind::Stun, "[::1]:3478"),
        ];
        for (uri, kind, target) in cases {
            let server = TraversalServer::stun(uri);
            assert_eq!(server.target().unwrap(), (kind, target.to_string()), "{uri}");
        }
        assert!(TraversalServer::stun("stun:").target().is_err());
    }

    #[test]
    fn partial_settings_file_uses_defaults() {
        let settings = EngineSettings::from_json(
            r#"{"bind_addr":"127.0.0.1:0","fec_group":null,"traversal_servers":[{"address":"turn:relay.example:3478","credentials":{"username":"u","password":"p"}}]}"#,
        )
        .unwrap();
        assert_eq!(settings.bind_addr, "127.0.0.1:0");
        assert_eq!(settings.fec_group, None);
        assert_eq!(settings.jitter_depth, EngineSettings::default().jitter_depth);
        assert!(settings.traversal_servers[0].credentials.is_some());
    }

    #[test]
    fn invalid_settings_rejected() {
        assert!(EngineSettings::from_json(r#"{"jitter_depth":0}"#).is_err());
        assert!(EngineSettings::from_json(r#"{"fec_group":1}"#).is_err());
        assert!(EngineSettings::from_json(r#"{"simulated_send_loss":1.5}"#).is_err());
        assert!(EngineSettings::from_json("not json").is_err());
    }
}
