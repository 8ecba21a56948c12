use serde::{Deserialize, Serialize};

/// Message exchanged between two orchestrators over the external
/// signaling channel.
///
/// ```json
/// {"type":"offer","sdp":"v=0..."}
/// {"type":"ice_candidate","candidate":"candidate:...","sdpMLineIndex":0,"usernameFragment":"abcd"}
/// {"type":"bye"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    /// Provisional answer.
    Pranswer {
        sdp: String,
    },
    /// Trickled candidate. An empty `candidate` marks end-of-candidates.
    IceCandidate {
        candidate: String,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_m_line_index: u32,
        #[serde(rename = "usernameFragment", default)]
        username_fragment: String,
    },
    /// Hangup.
    Bye,
}

impl SignalMessage {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Pranswer { .. } => "pranswer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Bye => "bye",
        }
    }
}
