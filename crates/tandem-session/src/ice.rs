//! ICE connectivity checks.
//!
//! [`IceAgent`] does no I/O. The control task feeds it inbound STUN and
//! periodic ticks and sends whatever [`Transmit`]s it produces over the
//! session socket. One agent covers one ICE round: an ICE restart builds a
//! new agent, so the selected pair never changes inside a round.
//!
//! Roles are fixed by signaling. The offerer is controlling and nominates
//! once a check succeeds, picking among the pairs that have succeeded by
//! candidate type and then round-trip time. The answerer selects the pair
//! the controlling side nominated once its own check on that pair succeeded.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tandem_common::helpers::constant_time_eq;
use tandem_common::EngineSettings;
use tandem_proto::candidate::pair_priority;
use tandem_proto::stun::{StunAttribute, TransactionId};
use tandem_proto::{CandidateType, IceCandidate, StunClass, StunMessage, StunMethod};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::negotiator::IceCredentials;
use crate::state::IceConnectionState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IceConfig {
    pub check_interval: Duration,
    pub max_attempts: u32,
    /// Bound on leaving `checking`.
    pub timeout: Duration,
    pub consent_interval: Duration,
    pub disconnect_timeout: Duration,
    pub failed_timeout: Duration,
}

impl IceConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            check_interval: settings.ice_check_interval(),
            max_attempts: settings.ice_max_check_attempts.max(1),
            timeout: settings.ice_timeout(),
            consent_interval: settings.consent_interval(),
            disconnect_timeout: settings.disconnect_timeout(),
            failed_timeout: settings.failed_timeout(),
        }
    }

    fn retransmit_after(&self) -> Duration {
        (self.check_interval * 4).max(Duration::from_millis(100))
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: IceCandidate,
    pub remote: IceCandidate,
    /// TURN server the local side sends through.
    pub relay: Option<SocketAddr>,
    pub priority: u64,
    pub state: PairState,
    pub rtt: Option<Duration>,
    attempts: u32,
    last_sent: Option<Instant>,
    /// The peer sent USE-CANDIDATE on this pair.
    remote_nominated: bool,
}

impl CandidatePair {
    fn same_path(&self, remote: SocketAddr, relay: Option<SocketAddr>) -> bool {
        self.remote.address == remote && self.relay == relay
    }
}

/// The path media flows over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedPair {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub relay: Option<SocketAddr>,
    pub local_kind: &'static str,
    pub remote_kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub relay: Option<SocketAddr>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IceEvent {
    StateChanged(IceConnectionState),
    Selected(SelectedPair),
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    pair: usize,
    sent_at: Instant,
    nominate: bool,
}

pub struct IceAgent {
    config: IceConfig,
    controlling: bool,
    tie_breaker: u64,
    /// Address of the session socket, used when nothing better is known.
    base: SocketAddr,

    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,
    local_candidates: Vec<(IceCandidate, Option<SocketAddr>)>,
    remote_candidates: Vec<IceCandidate>,
    remote_done: bool,

    pairs: Vec<CandidatePair>,
    triggered: VecDeque<(usize, bool)>,
    in_flight: HashMap<TransactionId, InFlight>,
    nominating: Option<usize>,
    selected: Option<usize>,

    state: IceConnectionState,
    checking_since: Option<Instant>,
    selected_at: Option<Instant>,
    next_check: Option<Instant>,
    last_consent: Option<Instant>,

    transmits: VecDeque<Transmit>,
    events: VecDeque<IceEvent>,
}

impl IceAgent {
    pub fn new(
        config: IceConfig,
        controlling: bool,
        local_credentials: IceCredentials,
        base: SocketAddr,
    ) -> Self {
        Self {
            config,
            controlling,
            tie_breaker: rand::random(),
            base,
            local_credentials,
            remote_credentials: None,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            remote_done: false,
            pairs: Vec::new(),
            triggered: VecDeque::new(),
            in_flight: HashMap::new(),
            nominating: None,
            selected: None,
            state: IceConnectionState::New,
            checking_since: None,
            selected_at: None,
            next_check: None,
            last_consent: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> IceConnectionState {
        self.state
    }

    pub fn is_controlling(&self) -> bool {
        self.controlling
    }

    pub fn local_ufrag(&self) -> &str {
        &self.local_credentials.ufrag
    }

    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn selected_pair(&self) -> Option<SelectedPair> {
        self.selected.map(|idx| describe(&self.pairs[idx]))
    }

    /// RTT of the last successful check on the selected pair.
    pub fn selected_rtt(&self) -> Option<Duration> {
        self.selected.and_then(|idx| self.pairs[idx].rtt)
    }

    pub fn set_remote_credentials(&mut self, credentials: IceCredentials) {
        self.remote_credentials = Some(credentials);
    }

    /// `relay` is the TURN server a relay candidate was allocated on.
    pub fn add_local_candidate(&mut self, candidate: IceCandidate, relay: Option<SocketAddr>) {
        if candidate.kind == CandidateType::ServerReflexive {
            // Checks from a reflexive candidate leave through its host base.
            return;
        }
        if self
            .local_candidates
            .iter()
            .any(|(c, _)| c.address == candidate.address)
        {
            return;
        }
        self.local_candidates.push((candidate.clone(), relay));
        for remote in self.remote_candidates.clone() {
            self.add_pair(candidate.clone(), relay, remote);
        }
    }

    pub fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self
            .remote_candidates
            .iter()
            .any(|c| c.address == candidate.address)
        {
            return;
        }
        self.remote_candidates.push(candidate.clone());
        for (local, relay) in self.local_candidates.clone() {
            self.add_pair(local, relay, candidate.clone());
        }
    }

    pub fn set_remote_gathering_done(&mut self) {
        self.remote_done = true;
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    pub fn close(&mut self) {
        self.state = IceConnectionState::Closed;
        self.triggered.clear();
        self.in_flight.clear();
        self.transmits.clear();
    }

    /// Feed a STUN message from the session socket. Returns false when the
    /// message is not for this agent.
    pub fn handle_stun(
        &mut self,
        now: Instant,
        from: SocketAddr,
        relay: Option<SocketAddr>,
        message: StunMessage,
    ) -> bool {
        if message.method != StunMethod::Binding
            || matches!(self.state, IceConnectionState::Closed)
        {
            return false;
        }
        match message.class {
            StunClass::Request => {
                self.handle_request(now, from, relay, message);
                true
            }
            StunClass::SuccessResponse | StunClass::ErrorResponse => {
                match self.in_flight.remove(&message.transaction_id) {
                    Some(flight) => {
                        self.handle_response(now, flight, message);
                        true
                    }
                    None => false,
                }
            }
            StunClass::Indication => false,
        }
    }

    /// Drive pacing, retransmission, consent and timeouts. `last_inbound`
    /// is the arrival time of the most recent peer datagram.
    pub fn handle_timeout(&mut self, now: Instant, last_inbound: Option<Instant>) {
        let horizon = self.config.failed_timeout.max(self.config.timeout);
        self.in_flight
            .retain(|_, flight| now.saturating_duration_since(flight.sent_at) < horizon);

        match self.state {
            IceConnectionState::New => {
                if self.remote_credentials.is_some() {
                    self.checking_since = Some(now);
                    self.set_state(IceConnectionState::Checking);
                    self.run_checks(now);
                }
            }
            IceConnectionState::Checking => {
                let started = self.checking_since.unwrap_or(now);
                if now.saturating_duration_since(started) >= self.config.timeout {
                    warn!("ICE checks timed out after {:?}", self.config.timeout);
                    self.set_state(IceConnectionState::Failed);
                    return;
                }
                self.run_checks(now);
                let exhausted = !self.pairs.is_empty()
                    && self.pairs.iter().all(|p| p.state == PairState::Failed);
                if exhausted && self.remote_done {
                    warn!("every candidate pair failed");
                    self.set_state(IceConnectionState::Failed);
                }
            }
            IceConnectionState::Connected
            | IceConnectionState::Completed
            | IceConnectionState::Disconnected => {
                self.run_checks(now);
                self.keep_alive(now, last_inbound);
            }
            IceConnectionState::Failed | IceConnectionState::Closed => {}
        }
    }

    fn handle_request(
        &mut self,
        now: Instant,
        from: SocketAddr,
        relay: Option<SocketAddr>,
        request: StunMessage,
    ) {
        let Some((ours, theirs)) = request.username().and_then(|u| u.split_once(':')) else {
            self.respond(from, relay, StunMessage::error_response(&request, 400, "Bad Request"));
            return;
        };
        let theirs_ok = self
            .remote_credentials
            .as_ref()
            .map_or(true, |remote| constant_time_eq(&remote.ufrag, theirs));
        if !constant_time_eq(ours, &self.local_credentials.ufrag) || !theirs_ok {
            debug!(%from, username = ?request.username(), "rejecting check for another ICE round");
            self.respond(from, relay, StunMessage::error_response(&request, 401, "Unauthorized"));
            return;
        }

        self.respond(from, relay, StunMessage::binding_success(&request, from));

        let idx = self.pair_for(from, relay, request.priority());
        let pair = &mut self.pairs[idx];
        if matches!(pair.state, PairState::Waiting | PairState::Failed) {
            pair.state = PairState::Waiting;
            pair.attempts = 0;
            if !self.triggered.iter().any(|(i, _)| *i == idx) {
                self.triggered.push_back((idx, false));
            }
        }

        if request.use_candidate() && !self.controlling {
            self.pairs[idx].remote_nominated = true;
            if self.pairs[idx].state == PairState::Succeeded {
                self.select(now, idx);
            }
        }
    }

    fn handle_response(&mut self, now: Instant, flight: InFlight, response: StunMessage) {
        let idx = flight.pair;
        if response.class == StunClass::ErrorResponse {
            let (code, reason) = response.error_code().unwrap_or((0, ""));
            debug!(remote = %self.pairs[idx].remote.address, code, reason, "check rejected");
            if Some(idx) != self.selected {
                self.pairs[idx].state = PairState::Failed;
            }
            return;
        }

        let pair = &mut self.pairs[idx];
        pair.state = PairState::Succeeded;
        pair.rtt = Some(now.saturating_duration_since(flight.sent_at));
        trace!(remote = %pair.remote.address, rtt = ?pair.rtt, "check succeeded");

        if self.selected.is_some() {
            return;
        }
        if self.controlling {
            if flight.nominate {
                self.select(now, idx);
            } else if self.nominating.is_none() {
                let best = self.best_succeeded().unwrap_or(idx);
                self.nominating = Some(best);
                self.triggered.push_front((best, true));
            }
        } else if self.pairs[idx].remote_nominated {
            self.select(now, idx);
        }
    }

    fn run_checks(&mut self, now: Instant) {
        let rto = self.config.retransmit_after();
        for pair in self.pairs.iter_mut() {
            if pair.state != PairState::InProgress {
                continue;
            }
            let expired = pair
                .last_sent
                .map_or(false, |sent| now.saturating_duration_since(sent) >= rto);
            if expired && pair.attempts >= self.config.max_attempts {
                debug!(remote = %pair.remote.address, "pair failed after {} checks", pair.attempts);
                pair.state = PairState::Failed;
            }
        }

        if self.remote_credentials.is_none() {
            return;
        }
        if self.next_check.map_or(false, |next| now < next) {
            return;
        }

        let next = self.next_triggered().or_else(|| self.next_ordinary(now, rto));
        if let Some((idx, nominate)) = next {
            self.send_check(now, idx, nominate);
            self.next_check = Some(now + self.config.check_interval);
        }
    }

    fn next_triggered(&mut self) -> Option<(usize, bool)> {
        while let Some((idx, nominate)) = self.triggered.pop_front() {
            if nominate {
                // More checks may have succeeded since the nomination was queued.
                let best = self.best_succeeded().unwrap_or(idx);
                self.nominating = Some(best);
                return Some((best, true));
            }
            if self.pairs[idx].state != PairState::Succeeded {
                return Some((idx, nominate));
            }
        }
        None
    }

    /// Succeeded pair with the best candidate types, then the lowest RTT.
    fn best_succeeded(&self) -> Option<usize> {
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PairState::Succeeded)
            .min_by_key(|(_, p)| (Reverse(type_rank(p)), p.rtt.unwrap_or(Duration::MAX)))
            .map(|(idx, _)| idx)
    }

    fn next_ordinary(&self, now: Instant, rto: Duration) -> Option<(usize, bool)> {
        if self.selected.is_some() {
            return None;
        }
        let waiting = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PairState::Waiting)
            .max_by_key(|(_, p)| p.priority)
            .map(|(idx, _)| (idx, false));
        if waiting.is_some() {
            return waiting;
        }
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.state == PairState::InProgress
                    && p.attempts < self.config.max_attempts
                    && p.last_sent
                        .map_or(true, |sent| now.saturating_duration_since(sent) >= rto)
            })
            .max_by_key(|(_, p)| p.priority)
            .map(|(idx, _)| (idx, self.nominating == Some(idx)))
    }

    fn send_check(&mut self, now: Instant, idx: usize, nominate: bool) {
        let Some(remote) = self.remote_credentials.as_ref() else {
            return;
        };
        let pair = &mut self.pairs[idx];
        let role = if self.controlling {
            StunAttribute::IceControlling(self.tie_breaker)
        } else {
            StunAttribute::IceControlled(self.tie_breaker)
        };
        let mut request = StunMessage::binding_request()
            .with_attribute(StunAttribute::Username(format!(
                "{}:{}",
                remote.ufrag, self.local_credentials.ufrag
            )))
            .with_attribute(StunAttribute::Priority(pair.local.priority))
            .with_attribute(role);
        if nominate {
            request = request.with_attribute(StunAttribute::UseCandidate);
        }

        if pair.state != PairState::Succeeded {
            pair.state = PairState::InProgress;
        }
        pair.attempts += 1;
        pair.last_sent = Some(now);
        self.in_flight.insert(
            request.transaction_id,
            InFlight {
                pair: idx,
                sent_at: now,
                nominate,
            },
        );
        self.transmits.push_back(Transmit {
            to: pair.remote.address,
            relay: pair.relay,
            data: request.encode(),
        });
    }

    fn keep_alive(&mut self, now: Instant, last_inbound: Option<Instant>) {
        let Some(selected) = self.selected else {
            return;
        };

        let due = self
            .last_consent
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.config.consent_interval);
        if due {
            self.send_check(now, selected, false);
            self.last_consent = Some(now);
        }

        let heard = match (last_inbound, self.selected_at) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => now,
        };
        let silence = now.saturating_duration_since(heard);
        if silence >= self.config.failed_timeout {
            warn!("no traffic from peer for {:?}", silence);
            self.set_state(IceConnectionState::Failed);
        } else if silence >= self.config.disconnect_timeout {
            if self.state != IceConnectionState::Disconnected {
                info!("peer silent for {:?}", silence);
                self.set_state(IceConnectionState::Disconnected);
            }
        } else if self.state == IceConnectionState::Disconnected {
            info!("peer traffic resumed");
            self.set_state(IceConnectionState::Connected);
        } else if self.state == IceConnectionState::Connected && self.remote_done {
            let pending = self
                .pairs
                .iter()
                .any(|p| matches!(p.state, PairState::Waiting | PairState::InProgress));
            if !pending {
                self.set_state(IceConnectionState::Completed);
            }
        }
    }

    fn select(&mut self, now: Instant, idx: usize) {
        if self.selected.is_some() {
            return;
        }
        self.selected = Some(idx);
        self.selected_at = Some(now);
        self.last_consent = Some(now);
        let selected = describe(&self.pairs[idx]);
        info!(
            local = %selected.local,
            remote = %selected.remote,
            relay = ?selected.relay,
            "selected candidate pair"
        );
        self.events.push_back(IceEvent::Selected(selected));
        self.set_state(IceConnectionState::Connected);
    }

    fn set_state(&mut self, to: IceConnectionState) {
        if self.state == to {
            return;
        }
        debug!(from = %self.state, %to, "ICE agent state");
        self.state = to;
        self.events.push_back(IceEvent::StateChanged(to));
    }

    fn respond(&mut self, to: SocketAddr, relay: Option<SocketAddr>, response: StunMessage) {
        self.transmits.push_back(Transmit {
            to,
            relay,
            data: response.encode(),
        });
    }

    /// Pair for an inbound check, learning the remote address if it was
    /// never signaled.
    fn pair_for(&mut self, from: SocketAddr, relay: Option<SocketAddr>, priority: Option<u32>) -> usize {
        if let Some(idx) = self.pairs.iter().position(|p| p.same_path(from, relay)) {
            return idx;
        }

        let remote = match self.remote_candidates.iter().find(|c| c.address == from) {
            Some(known) => known.clone(),
            None => {
                let mut learned = IceCandidate::host(from, 0);
                if let Some(priority) = priority {
                    learned.priority = priority;
                }
                debug!(%from, "learned remote address from inbound check");
                self.remote_candidates.push(learned.clone());
                learned
            }
        };
        let local = self
            .local_candidates
            .iter()
            .filter(|(c, r)| *r == relay && c.address.is_ipv4() == from.is_ipv4())
            .max_by_key(|(c, _)| c.priority)
            .map(|(c, _)| c.clone())
            .unwrap_or_else(|| IceCandidate::host(self.base, 0));

        self.pairs.push(self.new_pair(local, relay, remote));
        self.pairs.len() - 1
    }

    fn add_pair(&mut self, local: IceCandidate, relay: Option<SocketAddr>, remote: IceCandidate) {
        if local.address.is_ipv4() != remote.address.is_ipv4() {
            return;
        }
        let pair = self.new_pair(local, relay, remote);
        match self
            .pairs
            .iter_mut()
            .find(|p| p.same_path(pair.remote.address, relay))
        {
            // Several host candidates share one socket; keep the best.
            Some(existing) if existing.priority < pair.priority && existing.state == PairState::Waiting => {
                existing.local = pair.local;
                existing.priority = pair.priority;
            }
            Some(_) => {}
            None => self.pairs.push(pair),
        }
    }

    fn new_pair(&self, local: IceCandidate, relay: Option<SocketAddr>, remote: IceCandidate) -> CandidatePair {
        let priority = if self.controlling {
            pair_priority(local.priority, remote.priority)
        } else {
            pair_priority(remote.priority, local.priority)
        };
        CandidatePair {
            local,
            remote,
            relay,
            priority,
            state: PairState::Waiting,
            rtt: None,
            attempts: 0,
            last_sent: None,
            remote_nominated: false,
        }
    }
}

/// A pair is only as direct as its least direct end.
fn type_rank(pair: &CandidatePair) -> u32 {
    let local = if pair.relay.is_some() {
        CandidateType::Relay
    } else {
        pair.local.kind
    };
    local
        .type_preference()
        .min(pair.remote.kind.type_preference())
}

fn describe(pair: &CandidatePair) -> SelectedPair {
    SelectedPair {
        local: pair.local.address,
        remote: pair.remote.address,
        relay: pair.relay,
        local_kind: pair.local.kind.as_str(),
        remote_kind: pair.remote.kind.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(ufrag: &str) -> IceCredentials {
        IceCredentials {
            ufrag: ufrag.to_string(),
            pwd: format!("{ufrag}-password-padding-xx"),
        }
    }

    fn config() -> IceConfig {
        IceConfig {
            check_interval: Duration::from_millis(10),
            max_attempts: 3,
            timeout: Duration::from_secs(2),
            consent_interval: Duration::from_millis(500),
            disconnect_timeout: Duration::from_secs(1),
            failed_timeout: Duration::from_secs(3),
        }
    }

    struct Peer {
        agent: IceAgent,
        addr: SocketAddr,
        events: Vec<IceEvent>,
    }

    fn peers() -> (Peer, Peer) {
        let a_addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let mut a = IceAgent::new(config(), true, creds("aaaa"), a_addr);
        let mut b = IceAgent::new(config(), false, creds("bbbb"), b_addr);
        a.add_local_candidate(IceCandidate::host(a_addr, 65535), None);
        b.add_local_candidate(IceCandidate::host(b_addr, 65535), None);
        a.set_remote_credentials(creds("bbbb"));
        b.set_remote_credentials(creds("aaaa"));
        (
            Peer {
                agent: a,
                addr: a_addr,
                events: Vec::new(),
            },
            Peer {
                agent: b,
                addr: b_addr,
                events: Vec::new(),
            },
        )
    }

    /// Tick both agents and deliver every transmit to its destination.
    fn pump(a: &mut Peer, b: &mut Peer, now: Instant, drop_to_b: bool) {
        a.agent.handle_timeout(now, Some(now));
        b.agent.handle_timeout(now, Some(now));
        for _ in 0..8 {
            let mut moved = false;
            while let Some(t) = a.agent.poll_transmit() {
                moved = true;
                if t.to == b.addr && !drop_to_b {
                    let msg = StunMessage::decode(&t.data).unwrap();
                    b.agent.handle_stun(now, a.addr, None, msg);
                }
            }
            while let Some(t) = b.agent.poll_transmit() {
                moved = true;
                if t.to == a.addr {
                    let msg = StunMessage::decode(&t.data).unwrap();
                    a.agent.handle_stun(now, b.addr, None, msg);
                }
            }
            if !moved {
                break;
            }
        }
        a.events.extend(std::iter::from_fn(|| a.agent.poll_event()));
        b.events.extend(std::iter::from_fn(|| b.agent.poll_event()));
    }

    #[test]
    fn both_sides_select_the_same_path() {
        let (mut a, mut b) = peers();
        a.agent.add_remote_candidate(IceCandidate::host(b.addr, 65535));
        b.agent.add_remote_candidate(IceCandidate::host(a.addr, 65535));

        let start = Instant::now();
        for step in 0..50 {
            pump(&mut a, &mut b, start + Duration::from_millis(step * 10), false);
        }

        assert!(a.agent.state().is_connected());
        assert!(b.agent.state().is_connected());
        let a_sel = a.agent.selected_pair().unwrap();
        let b_sel = b.agent.selected_pair().unwrap();
        assert_eq!(a_sel.remote, b.addr);
        assert_eq!(b_sel.remote, a.addr);
        assert!(a.events.contains(&IceEvent::StateChanged(IceConnectionState::Checking)));
        assert!(a.events.iter().any(|e| matches!(e, IceEvent::Selected(_))));
    }

    #[test]
    fn remote_address_learned_from_checks() {
        let (mut a, mut b) = peers();
        // Only the controlling side knows the other's candidate.
        a.agent.add_remote_candidate(IceCandidate::host(b.addr, 65535));

        let start = Instant::now();
        for step in 0..50 {
            pump(&mut a, &mut b, start + Duration::from_millis(step * 10), false);
        }
        assert!(b.agent.state().is_connected());
        assert_eq!(b.agent.selected_pair().unwrap().remote, a.addr);
    }

    #[test]
    fn unreachable_peer_fails_once_candidates_end() {
        let (mut a, mut b) = peers();
        a.agent.add_remote_candidate(IceCandidate::host(b.addr, 65535));
        a.agent.set_remote_gathering_done();

        let start = Instant::now();
        for step in 0..100 {
            pump(&mut a, &mut b, start + Duration::from_millis(step * 10), true);
        }
        assert_eq!(a.agent.state(), IceConnectionState::Failed);
        assert!(a.agent.pairs().iter().all(|p| p.state == PairState::Failed));
    }

    #[test]
    fn checking_times_out_without_candidates() {
        let (mut a, _) = peers();
        let start = Instant::now();
        a.agent.handle_timeout(start, None);
        assert_eq!(a.agent.state(), IceConnectionState::Checking);
        a.agent.handle_timeout(start + Duration::from_secs(3), None);
        assert_eq!(a.agent.state(), IceConnectionState::Failed);
    }

    #[test]
    fn wrong_username_is_unauthorized() {
        let (mut a, _) = peers();
        let from: SocketAddr = "10.0.0.9:9".parse().unwrap();
        let request = StunMessage::binding_request()
            .with_attribute(StunAttribute::Username("aaaa:stale".into()));
        assert!(a.agent.handle_stun(Instant::now(), from, None, request));
        let reply = StunMessage::decode(&a.agent.poll_transmit().unwrap().data).unwrap();
        assert_eq!(reply.error_code().map(|(c, _)| c), Some(401));
        assert!(a.agent.pairs().is_empty());
    }

    #[test]
    fn silence_disconnects_then_recovers() {
        let (mut a, mut b) = peers();
        a.agent.add_remote_candidate(IceCandidate::host(b.addr, 65535));
        b.agent.add_remote_candidate(IceCandidate::host(a.addr, 65535));
        let start = Instant::now();
        for step in 0..50 {
            pump(&mut a, &mut b, start + Duration::from_millis(step * 10), false);
        }
        assert!(a.agent.state().is_connected());

        let heard = start + Duration::from_millis(500);
        a.agent.handle_timeout(heard + Duration::from_millis(1500), Some(heard));
        assert_eq!(a.agent.state(), IceConnectionState::Disconnected);

        let resumed = heard + Duration::from_millis(1600);
        a.agent.handle_timeout(resumed, Some(resumed));
        assert_eq!(a.agent.state(), IceConnectionState::Connected);

        a.agent.handle_timeout(resumed + Duration::from_secs(4), Some(resumed));
        assert_eq!(a.agent.state(), IceConnectionState::Failed);
    }

    #[test]
    fn nomination_prefers_host_pairs_then_lowest_rtt() {
        let local: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let slow_host: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let fast_host: SocketAddr = "10.0.0.3:3000".parse().unwrap();
        let reflexive: SocketAddr = "203.0.113.4:4000".parse().unwrap();
        let mut a = IceAgent::new(config(), true, creds("aaaa"), local);
        a.add_local_candidate(IceCandidate::host(local, 65535), None);
        a.set_remote_credentials(creds("bbbb"));
        a.add_remote_candidate(IceCandidate::host(slow_host, 65535));
        a.add_remote_candidate(IceCandidate::host(fast_host, 65534));
        a.add_remote_candidate(IceCandidate::server_reflexive(reflexive, fast_host, 65535));

        // One check per tick, host pairs first by priority.
        let start = Instant::now();
        let mut sent = Vec::new();
        for step in 0..3 {
            a.handle_timeout(start + Duration::from_millis(step * 10), None);
            while let Some(t) = a.poll_transmit() {
                sent.push((t.to, StunMessage::decode(&t.data).unwrap()));
            }
        }
        let order: Vec<SocketAddr> = sent.iter().map(|(to, _)| *to).collect();
        assert_eq!(order, vec![slow_host, fast_host, reflexive]);

        // Every answer lands before the next tick; the reflexive pair has the
        // lowest RTT but loses on type.
        let answered = start + Duration::from_millis(30);
        for (to, request) in sent {
            let response = StunMessage::binding_success(&request, local);
            assert!(a.handle_stun(answered, to, None, response));
        }

        a.handle_timeout(start + Duration::from_millis(40), None);
        let nomination = a.poll_transmit().unwrap();
        assert_eq!(nomination.to, fast_host);
        let request = StunMessage::decode(&nomination.data).unwrap();
        assert!(request.use_candidate());

        let response = StunMessage::binding_success(&request, local);
        assert!(a.handle_stun(start + Duration::from_millis(45), fast_host, None, response));
        assert_eq!(a.selected_pair().unwrap().remote, fast_host);
    }

    #[test]
    fn unknown_responses_are_not_consumed() {
        let (mut a, _) = peers();
        let request = StunMessage::binding_request();
        let response = StunMessage::binding_success(&request, "10.0.0.1:1000".parse().unwrap());
        assert!(!a.agent.handle_stun(Instant::now(), "10.0.0.2:2000".parse().unwrap(), None, response));
    }
}
