//! Offer/answer negotiation for one peer session.
//!
//! The negotiator owns the signaling state, the ICE gathering and
//! connection states, both description slots and both candidate lists.
//! It does no I/O: the orchestrator feeds it local and remote events and
//! acts on what it returns. All mutations happen on the orchestrator's
//! control task, so nothing here is shared.

use tandem_common::helpers::random_ice_token;
use tandem_common::{MediaMode, SignalMessage};
use tandem_media::MediaKind;
use tandem_proto::{
    Direction, IceCandidate, MediaSection, MediaType, SdpType, SessionDescription, SessionParams,
};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::state::{
    ice_transition_allowed, next_signaling_state, IceConnectionState, IceGatheringState,
    SignalingOp, SignalingState,
};

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 24;

/// Media section ids used in every offer we create.
pub const VIDEO_MID: u32 = 0;
pub const AUDIO_MID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Self {
        Self {
            ufrag: random_ice_token(UFRAG_LEN),
            pwd: random_ice_token(PWD_LEN),
        }
    }
}

/// Local capabilities advertised in descriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatorConfig {
    pub mode: MediaMode,
    pub fec_group: Option<u32>,
    pub nack: bool,
}

/// A media section both sides agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedTrack {
    pub mid: u32,
    pub kind: MediaKind,
    /// We send on this section.
    pub send: bool,
    /// The remote sends on this section.
    pub recv: bool,
    pub fec_group: Option<u32>,
    pub nack: bool,
}

/// What the caller has to do after a description was applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Gathering moved from `new` to `gathering`.
    pub start_gathering: bool,
    /// The remote side changed its ICE credentials.
    pub ice_restart: bool,
    /// Buffered remote candidates that became usable.
    pub candidates: Vec<IceCandidate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    Applied(IceCandidate),
    /// Held until a remote description exists.
    Buffered,
    Duplicate,
    EndOfCandidates,
}

pub struct Negotiator {
    session_id: u64,
    version: u64,
    public_key: [u8; 32],
    config: NegotiatorConfig,

    signaling: SignalingState,
    gathering: IceGatheringState,
    ice: IceConnectionState,

    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,
    /// Remote ufrags replaced by an ICE restart.
    retired_ufrags: Vec<String>,
    controlling: Option<bool>,

    pending_local: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,

    local_candidates: Vec<IceCandidate>,
    remote_candidates: Vec<IceCandidate>,
    early_candidates: Vec<(IceCandidate, String)>,
    remote_gathering_done: bool,
}

impl Negotiator {
    pub fn new(public_key: [u8; 32], config: NegotiatorConfig) -> Self {
        Self {
            session_id: rand::random::<u64>() >> 1,
            version: 0,
            public_key,
            config,
            signaling: SignalingState::New,
            gathering: IceGatheringState::New,
            ice: IceConnectionState::New,
            local_credentials: IceCredentials::generate(),
            remote_credentials: None,
            retired_ufrags: Vec::new(),
            controlling: None,
            pending_local: None,
            current_local: None,
            pending_remote: None,
            current_remote: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            early_candidates: Vec::new(),
            remote_gathering_done: false,
        }
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling
    }

    pub fn gathering_state(&self) -> IceGatheringState {
        self.gathering
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice
    }

    /// The offerer of the first round controls ICE and starts the
    /// transport handshake.
    pub fn is_controlling(&self) -> bool {
        self.controlling.unwrap_or(false)
    }

    pub fn local_credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub fn remote_credentials(&self) -> Option<&IceCredentials> {
        self.remote_credentials.as_ref()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.pending_local.as_ref().or(self.current_local.as_ref())
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.pending_remote.as_ref().or(self.current_remote.as_ref())
    }

    pub fn current_local_description(&self) -> Option<&SessionDescription> {
        self.current_local.as_ref()
    }

    pub fn current_remote_description(&self) -> Option<&SessionDescription> {
        self.current_remote.as_ref()
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    pub fn remote_gathering_done(&self) -> bool {
        self.remote_gathering_done
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Static key the remote will present in the transport handshake.
    pub fn remote_public_key(&self) -> Option<[u8; 32]> {
        self.remote_description()
            .and_then(|desc| desc.params().ok())
            .map(|params| params.public_key)
    }

    pub fn create_offer(&mut self) -> Result<SessionDescription> {
        if !matches!(self.signaling, SignalingState::New | SignalingState::Stable) {
            return Err(SessionError::invalid_state(self.signaling, "create offer"));
        }
        let media = vec![
            self.local_section(MediaType::Video, VIDEO_MID, true),
            self.local_section(MediaType::Audio, AUDIO_MID, true),
        ];
        let offer = SessionDescription::new(SdpType::Offer, &self.next_params(media));
        self.set_local_description(offer.clone())?;
        Ok(offer)
    }

    /// Answer (or provisionally answer) the pending remote offer. The
    /// answer mirrors the offer's section order.
    pub fn create_answer(&mut self, sdp_type: SdpType) -> Result<SessionDescription> {
        if sdp_type == SdpType::Offer {
            return Err(SessionError::invalid_state(self.signaling, "create answer of type offer"));
        }
        if !matches!(
            self.signaling,
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer
        ) {
            return Err(SessionError::invalid_state(self.signaling, "create answer"));
        }
        let offer = self
            .pending_remote
            .as_ref()
            .ok_or_else(|| SessionError::invalid_state(self.signaling, "create answer"))?
            .params()?;

        let media = offer
            .media
            .iter()
            .map(|remote| {
                let local_sends = self.mode_sends(remote.media);
                let mut section = MediaSection::new(
                    remote.media,
                    remote.mid,
                    remote.direction.answer(local_sends),
                );
                section.fec_group = match (remote.fec_group, self.config.fec_group) {
                    (Some(theirs), Some(ours)) => Some(theirs.min(ours)),
                    _ => None,
                };
                section.nack = remote.nack && self.config.nack;
                section
            })
            .collect();

        let answer = SessionDescription::new(sdp_type, &self.next_params(media));
        self.set_local_description(answer.clone())?;
        Ok(answer)
    }

    pub fn set_local_description(&mut self, desc: SessionDescription) -> Result<Applied> {
        let op = SignalingOp::SetLocal(desc.sdp_type);
        // Re-applying the offer create_offer already installed.
        if self.signaling == SignalingState::HaveLocalOffer
            && desc.sdp_type == SdpType::Offer
            && self.pending_local.as_ref() == Some(&desc)
        {
            return Ok(Applied::default());
        }
        let next = next_signaling_state(self.signaling, op)
            .ok_or_else(|| SessionError::invalid_state(self.signaling, op.describe()))?;

        let params = desc.params()?;
        if params.ice_ufrag != self.local_credentials.ufrag
            || params.ice_pwd != self.local_credentials.pwd
        {
            return Err(SessionError::NegotiationFailed(
                "local description carries foreign ICE credentials".into(),
            ));
        }

        match desc.sdp_type {
            SdpType::Offer => {
                self.controlling.get_or_insert(true);
                self.pending_local = Some(desc);
            }
            SdpType::Pranswer => {
                self.pending_local = Some(desc);
            }
            SdpType::Answer => {
                self.pending_local = None;
                self.current_local = Some(desc);
                self.current_remote = self.pending_remote.take();
            }
        }
        debug!(from = %self.signaling, to = %next, "{}", op.describe());
        self.signaling = next;

        Ok(Applied {
            start_gathering: self.begin_gathering(),
            ..Applied::default()
        })
    }

    pub fn set_remote_description(&mut self, desc: SessionDescription) -> Result<Applied> {
        let op = SignalingOp::SetRemote(desc.sdp_type);
        let next = next_signaling_state(self.signaling, op)
            .ok_or_else(|| SessionError::invalid_state(self.signaling, op.describe()))?;

        // Validation happens before any mutation so a bad blob leaves the
        // session untouched.
        let params = desc.params()?;
        if desc.sdp_type == SdpType::Answer {
            let offer = self
                .pending_local
                .as_ref()
                .ok_or_else(|| SessionError::invalid_state(self.signaling, op.describe()))?
                .params()?;
            let offered: Vec<u32> = offer.media.iter().map(|s| s.mid).collect();
            let answered: Vec<u32> = params.media.iter().map(|s| s.mid).collect();
            if offered != answered {
                return Err(SessionError::NegotiationFailed(format!(
                    "answer sections {answered:?} do not match offer {offered:?}"
                )));
            }
        }

        let mut applied = Applied::default();
        let previous_ufrag = self
            .remote_credentials
            .as_ref()
            .map(|creds| creds.ufrag.clone())
            .filter(|ufrag| *ufrag != params.ice_ufrag);
        if let Some(previous) = previous_ufrag {
            debug!(old = %previous, new = %params.ice_ufrag, "remote ICE restart");
            self.retired_ufrags.push(previous);
            self.remote_candidates.clear();
            self.remote_gathering_done = false;
            self.ice = IceConnectionState::New;
            applied.ice_restart = true;
            if desc.sdp_type == SdpType::Offer && !self.local_restart_pending() {
                self.reset_local_ice();
            }
        }
        self.remote_credentials = Some(IceCredentials {
            ufrag: params.ice_ufrag.clone(),
            pwd: params.ice_pwd.clone(),
        });

        match desc.sdp_type {
            SdpType::Offer => {
                self.controlling.get_or_insert(false);
                self.pending_remote = Some(desc);
            }
            // Remote pranswers have no table row and never get here.
            SdpType::Answer | SdpType::Pranswer => {
                self.current_remote = Some(desc);
                self.current_local = self.pending_local.take();
            }
        }
        debug!(from = %self.signaling, to = %next, "{}", op.describe());
        self.signaling = next;

        for (candidate, ufrag) in std::mem::take(&mut self.early_candidates) {
            if !ufrag.is_empty() && ufrag != params.ice_ufrag {
                debug!(%ufrag, "dropping buffered candidate from another generation");
                continue;
            }
            if self.push_remote(candidate.clone()) {
                applied.candidates.push(candidate);
            }
        }
        applied.start_gathering = self.begin_gathering();
        Ok(applied)
    }

    /// Accept a trickled remote candidate. An empty candidate string marks
    /// the end of the remote's candidates.
    pub fn add_remote_candidate(&mut self, candidate: &str, ufrag: &str) -> Result<CandidateOutcome> {
        if self.signaling.is_terminal() {
            return Err(SessionError::invalid_state(self.signaling, "add remote candidate"));
        }
        if !ufrag.is_empty() && self.retired_ufrags.iter().any(|old| old == ufrag) {
            return Err(SessionError::StaleCandidate {
                ufrag: ufrag.to_string(),
            });
        }
        if let Some(remote) = &self.remote_credentials {
            if !ufrag.is_empty() && remote.ufrag != ufrag {
                return Err(SessionError::StaleCandidate {
                    ufrag: ufrag.to_string(),
                });
            }
        }

        if candidate.trim().is_empty() {
            self.remote_gathering_done = true;
            return Ok(CandidateOutcome::EndOfCandidates);
        }
        let parsed = IceCandidate::parse(candidate)?;

        if self.remote_credentials.is_none() {
            let already = self
                .early_candidates
                .iter()
                .any(|(c, _)| same_endpoint(c, &parsed));
            if already {
                return Ok(CandidateOutcome::Duplicate);
            }
            self.early_candidates.push((parsed, ufrag.to_string()));
            return Ok(CandidateOutcome::Buffered);
        }

        if self.push_remote(parsed.clone()) {
            Ok(CandidateOutcome::Applied(parsed))
        } else {
            Ok(CandidateOutcome::Duplicate)
        }
    }

    /// Record a gathered local candidate and build the message announcing it.
    pub fn add_local_candidate(&mut self, candidate: IceCandidate) -> SignalMessage {
        let message = SignalMessage::IceCandidate {
            candidate: candidate.to_string(),
            sdp_m_line_index: 0,
            username_fragment: self.local_credentials.ufrag.clone(),
        };
        self.local_candidates.push(candidate);
        message
    }

    /// Message announcing the end of local candidates.
    pub fn end_of_local_candidates(&mut self) -> SignalMessage {
        self.gathering = IceGatheringState::Complete;
        SignalMessage::IceCandidate {
            candidate: String::new(),
            sdp_m_line_index: 0,
            username_fragment: self.local_credentials.ufrag.clone(),
        }
    }

    pub fn set_ice_state(&mut self, to: IceConnectionState) -> Result<bool> {
        if self.ice == to {
            return Ok(false);
        }
        if !ice_transition_allowed(self.ice, to) {
            return Err(SessionError::InvalidStateTransition {
                state: self.ice.to_string(),
                operation: "change ICE state",
            });
        }
        debug!(from = %self.ice, %to, "ICE state");
        self.ice = to;
        Ok(true)
    }

    /// Start a fresh ICE round with new local credentials. The next offer
    /// carries them; candidates gathered for the old round are dropped.
    pub fn restart_ice(&mut self) -> Result<()> {
        if self.signaling != SignalingState::Stable {
            return Err(SessionError::invalid_state(self.signaling, "restart ICE"));
        }
        self.reset_local_ice();
        Ok(())
    }

    /// Change the local media mode. Returns true when the latest local
    /// description, pending or current, sends a different set of sections.
    pub fn set_mode(&mut self, mode: MediaMode) -> bool {
        self.config.mode = mode;
        self.needs_renegotiation()
    }

    /// Whether the latest local description disagrees with the configured
    /// mode. False before any local description exists.
    pub fn needs_renegotiation(&self) -> bool {
        let Some(latest) = self.local_description().and_then(|d| d.params().ok()) else {
            return false;
        };
        latest
            .media
            .iter()
            .any(|section| section.direction.sends() != self.mode_sends(section.media))
    }

    pub fn fail(&mut self) {
        if !self.signaling.is_terminal() {
            self.signaling = SignalingState::Failed;
        }
    }

    pub fn close(&mut self) {
        self.signaling = SignalingState::Closed;
        self.ice = IceConnectionState::Closed;
    }

    /// Sections agreed by the current local and remote descriptions.
    pub fn negotiated_tracks(&self) -> Vec<NegotiatedTrack> {
        let (Some(local), Some(remote)) = (
            self.current_local.as_ref().and_then(|d| d.params().ok()),
            self.current_remote.as_ref().and_then(|d| d.params().ok()),
        ) else {
            return Vec::new();
        };

        local
            .media
            .iter()
            .filter_map(|ours| {
                let theirs = remote.section(ours.mid)?;
                if theirs.media != ours.media {
                    return None;
                }
                Some(NegotiatedTrack {
                    mid: ours.mid,
                    kind: media_kind(ours.media),
                    send: ours.direction.sends() && theirs.direction.receives(),
                    recv: ours.direction.receives() && theirs.direction.sends(),
                    fec_group: match (ours.fec_group, theirs.fec_group) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        _ => None,
                    },
                    nack: ours.nack && theirs.nack,
                })
            })
            .collect()
    }

    fn next_params(&mut self, media: Vec<MediaSection>) -> SessionParams {
        self.version += 1;
        SessionParams {
            session_id: self.session_id,
            version: self.version,
            ice_ufrag: self.local_credentials.ufrag.clone(),
            ice_pwd: self.local_credentials.pwd.clone(),
            public_key: self.public_key,
            trickle: true,
            media,
        }
    }

    fn local_section(&self, media: MediaType, mid: u32, recv: bool) -> MediaSection {
        let mut section =
            MediaSection::new(media, mid, Direction::from_flags(self.mode_sends(media), recv));
        section.fec_group = self.config.fec_group;
        section.nack = self.config.nack;
        section
    }

    fn mode_sends(&self, media: MediaType) -> bool {
        match media {
            MediaType::Video => self.config.mode.has_video(),
            MediaType::Audio => self.config.mode.has_audio(),
        }
    }

    fn begin_gathering(&mut self) -> bool {
        if self.gathering == IceGatheringState::New {
            self.gathering = IceGatheringState::Gathering;
            true
        } else {
            false
        }
    }

    fn reset_local_ice(&mut self) {
        self.local_credentials = IceCredentials::generate();
        self.local_candidates.clear();
        self.gathering = IceGatheringState::New;
        self.ice = IceConnectionState::New;
    }

    /// Local credentials were regenerated but not yet offered.
    fn local_restart_pending(&self) -> bool {
        self.gathering == IceGatheringState::New && self.local_candidates.is_empty()
    }

    fn push_remote(&mut self, candidate: IceCandidate) -> bool {
        if self
            .remote_candidates
            .iter()
            .any(|c| same_endpoint(c, &candidate))
        {
            return false;
        }
        self.remote_candidates.push(candidate);
        true
    }
}

fn same_endpoint(a: &IceCandidate, b: &IceCandidate) -> bool {
    a.address == b.address && a.protocol == b.protocol && a.kind == b.kind
}

pub fn media_kind(media: MediaType) -> MediaKind {
    match media {
        MediaType::Audio => MediaKind::Audio,
        MediaType::Video => MediaKind::Video,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn negotiator(mode: MediaMode) -> Negotiator {
        Negotiator::new(
            [7u8; 32],
            NegotiatorConfig {
                mode,
                fec_group: Some(5),
                nack: true,
            },
        )
    }

    fn host(port: u16) -> IceCandidate {
        IceCandidate::host(SocketAddr::from(([192, 168, 1, 2], port)), 65535)
    }

    fn both_stable() -> (Negotiator, Negotiator) {
        let mut a = negotiator(MediaMode::VideoAudio);
        let mut b = negotiator(MediaMode::VideoAudio);
        let offer = a.create_offer().unwrap();
        b.set_remote_description(offer).unwrap();
        let answer = b.create_answer(SdpType::Answer).unwrap();
        a.set_remote_description(answer).unwrap();
        (a, b)
    }

    #[test]
    fn offer_answer_reaches_stable_with_both_descriptions() {
        let mut a = negotiator(MediaMode::VideoAudio);
        let mut b = negotiator(MediaMode::VideoAudio);

        let offer = a.create_offer().unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(a.gathering_state(), IceGatheringState::Gathering);
        assert!(a.is_controlling());

        // Applying the created offer again is accepted as-is.
        assert_eq!(a.set_local_description(offer.clone()).unwrap(), Applied::default());

        b.set_remote_description(offer).unwrap();
        assert_eq!(b.signaling_state(), SignalingState::HaveRemoteOffer);
        assert!(!b.is_controlling());

        let answer = b.create_answer(SdpType::Answer).unwrap();
        assert_eq!(b.signaling_state(), SignalingState::Stable);
        a.set_remote_description(answer).unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        for side in [&a, &b] {
            assert!(side.current_local_description().is_some());
            assert!(side.current_remote_description().is_some());
        }
        assert_eq!(a.remote_public_key(), Some([7u8; 32]));
    }

    #[test]
    fn second_offer_in_same_direction_is_rejected() {
        let mut a = negotiator(MediaMode::VideoAudio);
        a.create_offer().unwrap();
        let err = a.create_offer().unwrap_err();
        assert!(matches!(err, SessionError::InvalidStateTransition { .. }));

        let mut b = negotiator(MediaMode::VideoAudio);
        let mut c = negotiator(MediaMode::VideoAudio);
        let offer = c.create_offer().unwrap();
        b.set_remote_description(offer.clone()).unwrap();
        assert!(matches!(
            b.set_remote_description(offer),
            Err(SessionError::InvalidStateTransition { .. })
        ));
        assert_eq!(b.signaling_state(), SignalingState::HaveRemoteOffer);
    }

    #[test]
    fn glare_and_remote_pranswer_are_rejected() {
        let mut a = negotiator(MediaMode::VideoAudio);
        let mut b = negotiator(MediaMode::VideoAudio);
        a.create_offer().unwrap();
        let b_offer = b.create_offer().unwrap();
        assert!(matches!(
            a.set_remote_description(b_offer),
            Err(SessionError::InvalidStateTransition { .. })
        ));

        let mut c = negotiator(MediaMode::VideoAudio);
        let offer = a.local_description().unwrap().clone();
        c.set_remote_description(offer).unwrap();
        let pranswer = c.create_answer(SdpType::Pranswer).unwrap();
        assert_eq!(c.signaling_state(), SignalingState::HaveLocalPranswer);
        assert!(matches!(
            a.set_remote_description(pranswer),
            Err(SessionError::InvalidStateTransition { .. })
        ));
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        // The provisional answer can be followed by a final one.
        let answer = c.create_answer(SdpType::Answer).unwrap();
        assert_eq!(c.signaling_state(), SignalingState::Stable);
        a.set_remote_description(answer).unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
    }

    #[test]
    fn malformed_remote_description_leaves_state_untouched() {
        let mut b = negotiator(MediaMode::VideoAudio);
        let err = b
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp: "v=0\r\no=x 1 1 IN IP4 0.0.0.0\r\n".into(),
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::NegotiationFailed(_)));
        assert_eq!(b.signaling_state(), SignalingState::New);
        assert!(b.remote_description().is_none());
        assert_eq!(b.gathering_state(), IceGatheringState::New);
    }

    #[test]
    fn early_candidates_apply_exactly_once() {
        let mut a = negotiator(MediaMode::VideoAudio);
        let mut b = negotiator(MediaMode::VideoAudio);
        let offer = a.create_offer().unwrap();
        let ufrag = a.local_credentials().ufrag.clone();

        let c1 = host(5000).to_string();
        let c2 = host(5001).to_string();
        assert_eq!(b.add_remote_candidate(&c1, &ufrag).unwrap(), CandidateOutcome::Buffered);
        assert_eq!(b.add_remote_candidate(&c2, "").unwrap(), CandidateOutcome::Buffered);
        assert_eq!(b.add_remote_candidate(&c1, &ufrag).unwrap(), CandidateOutcome::Duplicate);
        assert!(b.remote_candidates().is_empty());

        let applied = b.set_remote_description(offer).unwrap();
        assert_eq!(applied.candidates, vec![host(5000), host(5001)]);
        assert_eq!(b.remote_candidates().len(), 2);

        // Re-sending after the description does not duplicate.
        assert_eq!(b.add_remote_candidate(&c1, &ufrag).unwrap(), CandidateOutcome::Duplicate);
        b.create_answer(SdpType::Answer).unwrap();
        assert_eq!(b.remote_candidates().len(), 2);
    }

    #[test]
    fn candidates_from_before_a_restart_are_stale() {
        let (mut a, mut b) = both_stable();
        let old_ufrag = a.local_credentials().ufrag.clone();
        b.add_remote_candidate(&host(6000).to_string(), &old_ufrag)
            .unwrap();

        a.restart_ice().unwrap();
        assert_ne!(a.local_credentials().ufrag, old_ufrag);
        let offer = a.create_offer().unwrap();
        let applied = b.set_remote_description(offer).unwrap();
        assert!(applied.ice_restart);
        assert!(applied.start_gathering);
        assert!(b.remote_candidates().is_empty());

        let err = b
            .add_remote_candidate(&host(6001).to_string(), &old_ufrag)
            .unwrap_err();
        assert!(matches!(err, SessionError::StaleCandidate { .. }));

        let new_ufrag = a.local_credentials().ufrag.clone();
        assert!(matches!(
            b.add_remote_candidate(&host(6002).to_string(), &new_ufrag),
            Ok(CandidateOutcome::Applied(_))
        ));
    }

    #[test]
    fn end_of_candidates_marks_remote_done() {
        let (_a, mut b) = both_stable();
        assert_eq!(
            b.add_remote_candidate("", "").unwrap(),
            CandidateOutcome::EndOfCandidates
        );
        assert!(b.remote_gathering_done());
    }

    #[test]
    fn answer_reflects_local_mode() {
        let mut a = negotiator(MediaMode::VideoAudio);
        let mut b = negotiator(MediaMode::AudioOnly);
        let offer = a.create_offer().unwrap();
        b.set_remote_description(offer).unwrap();
        let answer = b.create_answer(SdpType::Answer).unwrap();
        a.set_remote_description(answer).unwrap();

        let tracks = b.negotiated_tracks();
        let video = tracks.iter().find(|t| t.kind == MediaKind::Video).unwrap();
        let audio = tracks.iter().find(|t| t.kind == MediaKind::Audio).unwrap();
        assert!(!video.send && video.recv);
        assert!(audio.send && audio.recv);
        assert_eq!(audio.fec_group, Some(5));
        assert!(audio.nack);

        let a_tracks = a.negotiated_tracks();
        let a_video = a_tracks.iter().find(|t| t.mid == VIDEO_MID).unwrap();
        assert!(a_video.send && !a_video.recv);
    }

    #[test]
    fn renegotiation_bumps_version_and_detects_mode_change() {
        let (mut a, mut b) = both_stable();
        let first = a.current_local_description().unwrap().params().unwrap();

        assert!(!a.set_mode(MediaMode::VideoAudio));
        assert!(a.set_mode(MediaMode::AudioOnly));

        let offer = a.create_offer().unwrap();
        assert_eq!(offer.params().unwrap().version, first.version + 1);
        assert_eq!(offer.params().unwrap().ice_ufrag, first.ice_ufrag);
        let applied = b.set_remote_description(offer).unwrap();
        assert!(!applied.ice_restart);
        let answer = b.create_answer(SdpType::Answer).unwrap();
        a.set_remote_description(answer).unwrap();

        let video = a
            .negotiated_tracks()
            .into_iter()
            .find(|t| t.kind == MediaKind::Video)
            .unwrap();
        assert!(!video.send);
        // Roles do not change on renegotiation.
        assert!(a.is_controlling());
    }

    #[test]
    fn mode_change_during_pending_offer_still_needs_renegotiation() {
        let mut a = negotiator(MediaMode::VideoAudio);
        let mut b = negotiator(MediaMode::VideoAudio);
        let offer = a.create_offer().unwrap();

        // The pending offer is the one compared, not the absent current one.
        assert!(a.set_mode(MediaMode::AudioOnly));
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        b.set_remote_description(offer).unwrap();
        let answer = b.create_answer(SdpType::Answer).unwrap();
        a.set_remote_description(answer).unwrap();

        // Once stable the committed offer still sends video.
        assert!(a.needs_renegotiation());
        let retry = a.create_offer().unwrap();
        let video = retry
            .params()
            .unwrap()
            .media
            .into_iter()
            .find(|m| m.media == MediaType::Video)
            .unwrap();
        assert!(!video.direction.sends());
        b.set_remote_description(retry).unwrap();
        let answer = b.create_answer(SdpType::Answer).unwrap();
        a.set_remote_description(answer).unwrap();
        assert!(!a.needs_renegotiation());
    }

    #[test]
    fn ice_state_is_monotonic_within_a_round() {
        let (mut a, _b) = both_stable();
        assert!(a.set_ice_state(IceConnectionState::Checking).unwrap());
        assert!(a.set_ice_state(IceConnectionState::Connected).unwrap());
        assert!(!a.set_ice_state(IceConnectionState::Connected).unwrap());
        assert!(a.set_ice_state(IceConnectionState::Checking).is_err());
        assert_eq!(a.ice_state(), IceConnectionState::Connected);

        a.restart_ice().unwrap();
        assert_eq!(a.ice_state(), IceConnectionState::New);
        assert!(a.set_ice_state(IceConnectionState::Checking).is_ok());
    }

    #[test]
    fn closed_session_rejects_everything() {
        let (mut a, _b) = both_stable();
        a.close();
        assert!(a.create_offer().is_err());
        assert!(a.add_remote_candidate(&host(1).to_string(), "").is_err());
        assert_eq!(a.ice_state(), IceConnectionState::Closed);
    }
}
