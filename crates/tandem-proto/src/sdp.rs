//! Session description text format.
//!
//! Descriptions are plain SDP with a handful of `tandem-*` attributes:
//!
//! ```text
//! v=0
//! o=tandem <session-id> <version> IN IP4 0.0.0.0
//! s=-
//! t=0 0
//! a=ice-ufrag:<ufrag>
//! a=ice-pwd:<pwd>
//! a=tandem-key:<base64 X25519 public key>
//! a=ice-options:trickle
//! m=video 9 UDP/TANDEM 96
//! c=IN IP4 0.0.0.0
//! a=mid:0
//! a=sendrecv
//! a=rtpmap:96 TRLE/90000
//! a=tandem-fec:4
//! a=tandem-nack
//! ```

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use thiserror::Error;

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;
pub const VIDEO_CODEC: &str = "TRLE";
pub const VIDEO_CLOCK_RATE: u32 = 90_000;
pub const AUDIO_CODEC: &str = "L16";
pub const AUDIO_CLOCK_RATE: u32 = 48_000;
pub const AUDIO_CHANNELS: u8 = 1;

const PROFILE: &str = "UDP/TANDEM";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("malformed line `{line}`: {reason}")]
    Malformed { line: String, reason: &'static str },
    #[error("unknown description type `{0}`")]
    UnknownType(String),
    #[error("invalid tandem-key")]
    InvalidKey,
    #[error("unsupported codec `{0}`")]
    UnsupportedCodec(String),
    #[error("duplicate mid {0}")]
    DuplicateMid(u32),
}

fn malformed(line: &str, reason: &'static str) -> SdpError {
    SdpError::Malformed {
        line: line.to_string(),
        reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpType {
    Offer,
    Answer,
    /// Provisional answer.
    Pranswer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = SdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "pranswer" => Ok(Self::Pranswer),
            other => Err(SdpError::UnknownType(other.to_string())),
        }
    }
}

/// Media direction from the point of view of the description's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => Self::SendRecv,
            (true, false) => Self::SendOnly,
            (false, true) => Self::RecvOnly,
            (false, false) => Self::Inactive,
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Self::SendRecv | Self::RecvOnly)
    }

    /// Direction an answerer uses for a section offered with `self`.
    pub fn answer(self, local_sends: bool) -> Self {
        Self::from_flags(local_sends && self.receives(), self.sends())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Self::SendRecv),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub media: MediaType,
    pub mid: u32,
    pub direction: Direction,
    /// XOR parity group size, when FEC is offered.
    pub fec_group: Option<u32>,
    pub nack: bool,
}

impl MediaSection {
    pub fn new(media: MediaType, mid: u32, direction: Direction) -> Self {
        Self {
            media,
            mid,
            direction,
            fec_group: None,
            nack: false,
        }
    }

    fn rtpmap(&self) -> String {
        match self.media {
            MediaType::Video => format!(
                "a=rtpmap:{VIDEO_PAYLOAD_TYPE} {VIDEO_CODEC}/{VIDEO_CLOCK_RATE}"
            ),
            MediaType::Audio => format!(
                "a=rtpmap:{AUDIO_PAYLOAD_TYPE} {AUDIO_CODEC}/{AUDIO_CLOCK_RATE}/{AUDIO_CHANNELS}"
            ),
        }
    }

    fn payload_type(&self) -> u8 {
        match self.media {
            MediaType::Video => VIDEO_PAYLOAD_TYPE,
            MediaType::Audio => AUDIO_PAYLOAD_TYPE,
        }
    }
}

/// Structured contents of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub session_id: u64,
    /// Incremented on every renegotiation.
    pub version: u64,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// Static Noise key the author will present in the transport handshake.
    pub public_key: [u8; 32],
    pub trickle: bool,
    pub media: Vec<MediaSection>,
}

impl SessionParams {
    pub fn render(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut lines = vec![
            "v=0".to_string(),
            format!("o=tandem {} {} IN IP4 0.0.0.0", self.session_id, self.version),
            "s=-".to_string(),
            "t=0 0".to_string(),
            format!("a=ice-ufrag:{}", self.ice_ufrag),
            format!("a=ice-pwd:{}", self.ice_pwd),
            format!("a=tandem-key:{}", b64.encode(self.public_key)),
        ];
        if self.trickle {
            lines.push("a=ice-options:trickle".to_string());
        }
        for section in &self.media {
            lines.push(format!(
                "m={} 9 {PROFILE} {}",
                section.media.as_str(),
                section.payload_type()
            ));
            lines.push("c=IN IP4 0.0.0.0".to_string());
            lines.push(format!("a=mid:{}", section.mid));
            lines.push(format!("a={}", section.direction.as_str()));
            lines.push(section.rtpmap());
            if let Some(group) = section.fec_group {
                lines.push(format!("a=tandem-fec:{group}"));
            }
            if section.nack {
                lines.push("a=tandem-nack".to_string());
            }
        }
        let mut out = lines.join("\r\n");
        out.push_str("\r\n");
        out
    }

    pub fn parse(text: &str) -> Result<Self, SdpError> {
        let mut version_seen = false;
        let mut origin = None;
        let mut ice_ufrag = None;
        let mut ice_pwd = None;
        let mut public_key = None;
        let mut trickle = false;
        let mut media: Vec<MediaSection> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| malformed(line, "expected <type>=<value>"))?;

            match kind {
                "v" => {
                    if value != "0" {
                        return Err(malformed(line, "unsupported version"));
                    }
                    version_seen = true;
                }
                "o" => {
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() < 3 {
                        return Err(malformed(line, "short origin"));
                    }
                    let session_id = fields[1]
                        .parse::<u64>()
                        .map_err(|_| malformed(line, "bad session id"))?;
                    let version = fields[2]
                        .parse::<u64>()
                        .map_err(|_| malformed(line, "bad session version"))?;
                    origin = Some((session_id, version));
                }
                "m" => {
                    let media_type = match value.split_whitespace().next() {
                        Some("audio") => MediaType::Audio,
                        Some("video") => MediaType::Video,
                        _ => return Err(malformed(line, "unknown media type")),
                    };
                    // mid defaults to the section index when absent.
                    let index = media.len() as u32;
                    media.push(MediaSection::new(media_type, index, Direction::SendRecv));
                }
                "a" => {
                    let (name, arg) = match value.split_once(':') {
                        Some((name, arg)) => (name, Some(arg)),
                        None => (value, None),
                    };
                    match (name, arg, media.last_mut()) {
                        ("ice-ufrag", Some(arg), _) => ice_ufrag = Some(arg.to_string()),
                        ("ice-pwd", Some(arg), _) => ice_pwd = Some(arg.to_string()),
                        ("tandem-key", Some(arg), _) => public_key = Some(decode_key(arg)?),
                        ("ice-options", Some(arg), _) => {
                            trickle = arg.split_whitespace().any(|o| o == "trickle")
                        }
                        ("mid", Some(arg), Some(section)) => {
                            section.mid = arg
                                .parse::<u32>()
                                .map_err(|_| malformed(line, "non-numeric mid"))?;
                        }
                        ("rtpmap", Some(arg), Some(section)) => {
                            let codec = arg.split_whitespace().nth(1).unwrap_or_default();
                            let name = codec.split('/').next().unwrap_or_default();
                            let expected = match section.media {
                                MediaType::Video => VIDEO_CODEC,
                                MediaType::Audio => AUDIO_CODEC,
                            };
                            if !name.eq_ignore_ascii_case(expected) {
                                return Err(SdpError::UnsupportedCodec(codec.to_string()));
                            }
                        }
                        ("tandem-fec", Some(arg), Some(section)) => {
                            let group = arg
                                .parse::<u32>()
                                .map_err(|_| malformed(line, "bad fec group"))?;
                            if group < 2 {
                                return Err(malformed(line, "fec group below 2"));
                            }
                            section.fec_group = Some(group);
                        }
                        ("tandem-nack", None, Some(section)) => section.nack = true,
                        (dir, None, Some(section)) if Direction::parse(dir).is_some() => {
                            if let Some(direction) = Direction::parse(dir) {
                                section.direction = direction;
                            }
                        }
                        // Session-level direction and unknown attributes are ignored.
                        _ => {}
                    }
                }
                // s=, t=, c= and anything else carry nothing we use.
                _ => {}
            }
        }

        if !version_seen {
            return Err(SdpError::Missing("v= line"));
        }
        let (session_id, version) = origin.ok_or(SdpError::Missing("o= line"))?;
        let ice_ufrag = ice_ufrag.ok_or(SdpError::Missing("a=ice-ufrag"))?;
        let ice_pwd = ice_pwd.ok_or(SdpError::Missing("a=ice-pwd"))?;
        let public_key = public_key.ok_or(SdpError::Missing("a=tandem-key"))?;

        for (i, section) in media.iter().enumerate() {
            if media[..i].iter().any(|other| other.mid == section.mid) {
                return Err(SdpError::DuplicateMid(section.mid));
            }
        }

        Ok(Self {
            session_id,
            version,
            ice_ufrag,
            ice_pwd,
            public_key,
            trickle,
            media,
        })
    }

    pub fn section(&self, mid: u32) -> Option<&MediaSection> {
        self.media.iter().find(|s| s.mid == mid)
    }
}

fn decode_key(value: &str) -> Result<[u8; 32], SdpError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|_| SdpError::InvalidKey)?;
    bytes.try_into().map_err(|_| SdpError::InvalidKey)
}

/// An immutable description plus its type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, params: &SessionParams) -> Self {
        Self {
            sdp_type,
            sdp: params.render(),
        }
    }

    pub fn params(&self) -> Result<SessionParams, SdpError> {
        SessionParams::parse(&self.sdp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionParams {
        let mut video = MediaSection::new(MediaType::Video, 0, Direction::SendRecv);
        video.fec_group = Some(4);
        video.nack = true;
        SessionParams {
            session_id: 4242,
            version: 2,
            ice_ufrag: "uf01".into(),
            ice_pwd: "pwdpwdpwdpwdpwdpwdpwdpwd".into(),
            public_key: [7u8; 32],
            trickle: true,
            media: vec![
                video,
                MediaSection::new(MediaType::Audio, 1, Direction::RecvOnly),
            ],
        }
    }

    #[test]
    fn render_contains_expected_lines() {
        let text = sample().render();
        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("o=tandem 4242 2 IN IP4 0.0.0.0\r\n"));
        assert!(text.contains("a=ice-options:trickle\r\n"));
        assert!(text.contains("m=video 9 UDP/TANDEM 96\r\n"));
        assert!(text.contains("a=rtpmap:96 TRLE/90000\r\n"));
        assert!(text.contains("a=rtpmap:97 L16/48000/1\r\n"));
        assert!(text.contains("a=tandem-fec:4\r\n"));
        assert!(text.contains("a=recvonly\r\n"));
    }

    #[test]
    fn parse_recovers_structure() {
        let params = sample();
        let parsed = SessionParams::parse(&params.render()).unwrap();
        assert_eq!(parsed, params);
        assert_eq!(parsed.section(1).map(|s| s.direction), Some(Direction::RecvOnly));
    }

    #[test]
    fn parse_accepts_bare_newlines() {
        let text = sample().render().replace("\r\n", "\n");
        assert!(SessionParams::parse(&text).is_ok());
    }

    #[test]
    fn parse_requires_credentials_and_key() {
        let text = sample().render();
        let without_pwd: String = text
            .lines()
            .filter(|l| !l.starts_with("a=ice-pwd"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(
            SessionParams::parse(&without_pwd),
            Err(SdpError::Missing("a=ice-pwd"))
        );

        let bad_key = text.replace(
            &format!(
                "a=tandem-key:{}",
                base64::engine::general_purpose::STANDARD.encode([7u8; 32])
            ),
            "a=tandem-key:AAAA",
        );
        assert_eq!(SessionParams::parse(&bad_key), Err(SdpError::InvalidKey));
    }

    #[test]
    fn parse_rejects_garbage_and_foreign_codecs() {
        assert!(SessionParams::parse("this is not sdp").is_err());
        assert_eq!(SessionParams::parse(""), Err(SdpError::Missing("v= line")));
        let text = sample().render().replace("TRLE/90000", "VP8/90000");
        assert!(matches!(
            SessionParams::parse(&text),
            Err(SdpError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn duplicate_mid_rejected() {
        let text = sample().render().replace("a=mid:1", "a=mid:0");
        assert_eq!(SessionParams::parse(&text), Err(SdpError::DuplicateMid(0)));
    }

    #[test]
    fn answer_direction_table() {
        assert_eq!(Direction::SendRecv.answer(true), Direction::SendRecv);
        assert_eq!(Direction::SendRecv.answer(false), Direction::RecvOnly);
        assert_eq!(Direction::SendOnly.answer(true), Direction::RecvOnly);
        assert_eq!(Direction::RecvOnly.answer(true), Direction::SendOnly);
        assert_eq!(Direction::RecvOnly.answer(false), Direction::Inactive);
        assert_eq!(Direction::Inactive.answer(true), Direction::Inactive);
    }

    #[test]
    fn sdp_type_strings() {
        for ty in [SdpType::Offer, SdpType::Answer, SdpType::Pranswer] {
            assert_eq!(ty.as_str().parse::<SdpType>().unwrap(), ty);
        }
        assert!("rollback".parse::<SdpType>().is_err());
    }
}
