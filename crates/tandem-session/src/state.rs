//! Session state enums and the transition tables that connect them.
//!
//! Signaling and ICE progress independently. Each is a plain tagged
//! state, and every allowed move is listed in a table; anything not in a
//! table is an invalid transition. The externally visible
//! [`ConnectionState`] is derived from both plus the transport phase.

use std::fmt;

use serde::Serialize;
use tandem_proto::SdpType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    Stable,
    Closed,
    Failed,
}

impl SignalingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::HaveLocalPranswer => "have-local-pranswer",
            Self::Stable => "stable",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the encrypted bearer on top of the selected ICE path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportPhase {
    Idle,
    Handshaking,
    Established,
    Closed,
}

/// Aggregate state reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Inputs that move the signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingOp {
    SetLocal(SdpType),
    SetRemote(SdpType),
}

impl SignalingOp {
    pub fn describe(self) -> &'static str {
        match self {
            Self::SetLocal(SdpType::Offer) => "set local offer",
            Self::SetLocal(SdpType::Answer) => "set local answer",
            Self::SetLocal(SdpType::Pranswer) => "set local pranswer",
            Self::SetRemote(SdpType::Offer) => "set remote offer",
            Self::SetRemote(SdpType::Answer) => "set remote answer",
            Self::SetRemote(SdpType::Pranswer) => "set remote pranswer",
        }
    }
}

use SignalingState as S;

/// Every legal signaling move. A remote pranswer has no row, and neither
/// does a remote offer while a local one is pending (glare).
const SIGNALING_TRANSITIONS: &[(SignalingState, SignalingOp, SignalingState)] = &[
    (S::New, SignalingOp::SetLocal(SdpType::Offer), S::HaveLocalOffer),
    (S::Stable, SignalingOp::SetLocal(SdpType::Offer), S::HaveLocalOffer),
    (S::New, SignalingOp::SetRemote(SdpType::Offer), S::HaveRemoteOffer),
    (S::Stable, SignalingOp::SetRemote(SdpType::Offer), S::HaveRemoteOffer),
    (S::HaveLocalOffer, SignalingOp::SetRemote(SdpType::Answer), S::Stable),
    (S::HaveRemoteOffer, SignalingOp::SetLocal(SdpType::Answer), S::Stable),
    (S::HaveRemoteOffer, SignalingOp::SetLocal(SdpType::Pranswer), S::HaveLocalPranswer),
    (S::HaveLocalPranswer, SignalingOp::SetLocal(SdpType::Pranswer), S::HaveLocalPranswer),
    (S::HaveLocalPranswer, SignalingOp::SetLocal(SdpType::Answer), S::Stable),
];

pub fn next_signaling_state(from: SignalingState, op: SignalingOp) -> Option<SignalingState> {
    SIGNALING_TRANSITIONS
        .iter()
        .find(|(state, candidate, _)| *state == from && *candidate == op)
        .map(|(_, _, to)| *to)
}

use IceConnectionState as I;

/// Legal ICE connection moves within one negotiation round. Going from
/// connected back to checking needs an ICE restart, which starts a new
/// round instead.
const ICE_TRANSITIONS: &[(IceConnectionState, IceConnectionState)] = &[
    (I::New, I::Checking),
    (I::Checking, I::Connected),
    (I::Checking, I::Failed),
    (I::Connected, I::Completed),
    (I::Connected, I::Disconnected),
    (I::Completed, I::Disconnected),
    (I::Disconnected, I::Connected),
    (I::Disconnected, I::Failed),
    (I::Connected, I::Failed),
    (I::Completed, I::Failed),
];

pub fn ice_transition_allowed(from: IceConnectionState, to: IceConnectionState) -> bool {
    from == to
        || to == I::Closed && from != I::Closed
        || ICE_TRANSITIONS.iter().any(|(a, b)| *a == from && *b == to)
}

/// Combine the three state fields into what the application sees.
pub fn connection_state(
    signaling: SignalingState,
    ice: IceConnectionState,
    transport: TransportPhase,
) -> ConnectionState {
    match (signaling, ice, transport) {
        (S::Closed, _, _) | (_, I::Closed, _) | (_, _, TransportPhase::Closed) => {
            ConnectionState::Closed
        }
        (S::Failed, _, _) | (_, I::Failed, _) => ConnectionState::Failed,
        (_, I::Disconnected, _) => ConnectionState::Disconnected,
        (_, I::Connected | I::Completed, TransportPhase::Established) => {
            ConnectionState::Connected
        }
        (_, I::Connected | I::Completed | I::Checking, _) => ConnectionState::Connecting,
        (S::New, I::New, _) => ConnectionState::New,
        (_, I::New, _) => ConnectionState::Connecting,
    }
}
