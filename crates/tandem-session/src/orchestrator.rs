//! Session orchestrator.
//!
//! An [`Orchestrator`] owns one peer session. Every mutation of the
//! negotiator, the ICE agent, the handshake and the transport happens on a
//! single control task; the handle only sends it commands. The task wakes
//! for:
//! - commands from the handle (remote signals, reconfiguration, stop);
//! - STUN and handshake datagrams from the session socket;
//! - traversal results;
//! - transport events (frames, decode failures, remote track state);
//! - the ICE pacing tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tandem_common::{EngineSettings, MediaSettings, SignalMessage};
use tandem_crypto::{PacketCipher, StaticKeypair};
use tandem_media::{CaptureBackend, CaptureHandle, MediaKind, MediaTrack, TransformParams};
use tandem_proto::{Channel, PhysicalPacket, SdpType, SessionDescription};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::events::{EventSender, EventStream, SessionEvent};
use crate::helpers::host_candidates;
use crate::ice::{IceAgent, IceConfig, IceEvent, SelectedPair};
use crate::mux::{Inbound, UdpMux};
use crate::negotiator::{CandidateOutcome, NegotiatedTrack, Negotiator, NegotiatorConfig};
use crate::signaling::SignalChannel;
use crate::state::{
    connection_state, ConnectionState, IceConnectionState, IceGatheringState, SignalingState,
    TransportPhase,
};
use crate::transport::handshake::Handshake;
use crate::transport::receive::ReceiveTrack;
use crate::transport::send::SendTrack;
use crate::transport::{
    replay_window, retransmit_cache, PeerPath, SharedReplayWindow, TransportConfig, TransportEvent,
    TransportSession, TransportSetup,
};
use crate::traversal::{Resolution, TraversalResolver};
use crate::types::SessionStats;

const COMMAND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;
const MIN_TICK: Duration = Duration::from_millis(5);

/// Everything needed to start one session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub engine: EngineSettings,
    pub media: MediaSettings,
    /// Create and send an offer as soon as the session starts.
    pub initiate: bool,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Signal(SignalMessage, Reply<()>),
    Reconfigure(MediaSettings, Reply<()>),
    RestartIce(Reply<()>),
    SetTrackEnabled(MediaKind, bool, Reply<()>),
    Stats(oneshot::Sender<SessionStats>),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running session.
pub struct Orchestrator {
    session_id: Uuid,
    commands: mpsc::Sender<Command>,
    events: EventSender,
    task: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    grace: Duration,
}

impl Orchestrator {
    /// Bind the session socket, open local capture and start the control
    /// task. Outbound signaling goes to `signal_out`.
    pub async fn start(
        config: SessionConfig,
        backend: Arc<dyn CaptureBackend>,
        signal_out: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<(Self, EventStream)> {
        let SessionConfig {
            engine,
            media,
            initiate,
        } = config;
        engine.validate()?;
        media.validate()?;

        let session_id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let mux = Arc::new(UdpMux::bind(&engine.bind_addr, inbound_tx).await?);
        let (events, stream) = EventSender::new(engine.frame_event_backlog);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (gather_tx, gather_rx) = mpsc::channel(4);
        let (transport_tx, transport_rx) = mpsc::channel(engine.frame_event_backlog.max(16));

        let keypair = StaticKeypair::generate();
        let negotiator = Negotiator::new(
            *keypair.public_key(),
            NegotiatorConfig {
                mode: media.mode,
                fec_group: engine.fec_group,
                nack: engine.nack,
            },
        );
        let grace = engine.stop_grace();

        let mut session = Session {
            id: session_id,
            resolver: TraversalResolver::from_settings(&engine),
            transport_config: TransportConfig::from_settings(&engine),
            ice_config: IceConfig::from_settings(&engine),
            settings: engine,
            media,
            keypair,
            negotiator,
            mux,
            backend,
            captures: HashMap::new(),
            local_enabled: HashMap::new(),
            ice: None,
            ice_round: 0,
            traversal: None,
            gather_tx,
            selected: None,
            handshake: None,
            handshake_path: None,
            handshake_packets: 0,
            cipher: None,
            replay: None,
            transport: None,
            transport_tracks: Vec::new(),
            phase: TransportPhase::Idle,
            transport_tx,
            signal_out,
            events: events.clone(),
            reported: ConnectionState::New,
            failed: false,
            renegotiate: false,
        };
        session.sync_captures()?;

        info!(session = %session_id, socket = %session.mux.local_addr(), "session started");
        let span = info_span!("session", id = %session_id);
        let task = tokio::spawn(
            session
                .run(command_rx, inbound_rx, gather_rx, transport_rx, initiate)
                .instrument(span),
        );

        Ok((
            Self {
                session_id,
                commands: command_tx,
                events,
                task: Some(task),
                pump: None,
                grace,
            },
            stream,
        ))
    }

    /// Start a session and feed it from both ends of `channel`.
    pub async fn connect(
        config: SessionConfig,
        backend: Arc<dyn CaptureBackend>,
        channel: SignalChannel,
    ) -> Result<(Self, EventStream)> {
        let SignalChannel { outgoing, incoming } = channel;
        let (mut orchestrator, events) = Self::start(config, backend, outgoing).await?;
        orchestrator.attach_signaling(incoming);
        Ok((orchestrator, events))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Forward every message from `incoming` to [`Self::handle_remote_signal`].
    /// Rejected messages are logged.
    pub fn attach_signaling(&mut self, mut incoming: mpsc::UnboundedReceiver<SignalMessage>) {
        let commands = self.commands.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                let kind = msg.kind();
                let (tx, rx) = oneshot::channel();
                if commands.send(Command::Signal(msg, tx)).await.is_err() {
                    break;
                }
                match rx.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(kind, "remote signal rejected: {}", e),
                    Err(_) => break,
                }
            }
        });
        if let Some(old) = self.pump.replace(pump) {
            old.abort();
        }
    }

    /// Apply one message from the remote orchestrator. Messages are applied
    /// strictly in the order they are handed in.
    pub async fn handle_remote_signal(&self, message: SignalMessage) -> Result<()> {
        self.request(|reply| Command::Signal(message, reply)).await
    }

    /// Update mirror and quality live. A mode change that alters the track
    /// set renegotiates.
    pub async fn reconfigure(&self, media: MediaSettings) -> Result<()> {
        self.request(|reply| Command::Reconfigure(media, reply)).await
    }

    /// Send a new offer with fresh ICE credentials.
    pub async fn restart_ice(&self) -> Result<()> {
        self.request(Command::RestartIce).await
    }

    /// Pause or resume a local track without renegotiating.
    pub async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetTrackEnabled(kind, enabled, reply))
            .await
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Hang up and release everything within the stop grace period. No
    /// event is delivered once this is called.
    pub async fn stop(mut self) {
        self.events.silence();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let Some(mut task) = self.task.take() else {
            return;
        };

        let (tx, rx) = oneshot::channel();
        let commands = self.commands.clone();
        let graceful = time::timeout(self.grace, async move {
            commands.send(Command::Stop(tx)).await.ok()?;
            rx.await.ok()
        })
        .await;
        if !matches!(graceful, Ok(Some(()))) {
            warn!(session = %self.session_id, "session did not stop in time, aborting");
            task.abort();
        }
        if time::timeout(self.grace, &mut task).await.is_err() {
            task.abort();
        }
        info!(session = %self.session_id, "session stopped");
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State owned by the control task.
struct Session {
    id: Uuid,
    settings: EngineSettings,
    media: MediaSettings,
    keypair: StaticKeypair,
    negotiator: Negotiator,
    mux: Arc<UdpMux>,
    resolver: TraversalResolver,
    transport_config: TransportConfig,
    ice_config: IceConfig,

    backend: Arc<dyn CaptureBackend>,
    captures: HashMap<MediaKind, CaptureHandle>,
    local_enabled: HashMap<MediaKind, bool>,

    ice: Option<IceAgent>,
    /// Bumped for every new ICE agent; stale traversal results are ignored.
    ice_round: u64,
    traversal: Option<JoinHandle<()>>,
    gather_tx: mpsc::Sender<(u64, Result<Resolution>)>,
    selected: Option<SelectedPair>,

    handshake: Option<Handshake>,
    handshake_path: Option<PeerPath>,
    handshake_packets: u64,
    cipher: Option<PacketCipher>,
    /// Outlives transport rebuilds on the same cipher.
    replay: Option<SharedReplayWindow>,
    transport: Option<TransportSession>,
    transport_tracks: Vec<NegotiatedTrack>,
    phase: TransportPhase,
    transport_tx: mpsc::Sender<TransportEvent>,

    signal_out: mpsc::UnboundedSender<SignalMessage>,
    events: EventSender,
    reported: ConnectionState,
    failed: bool,
    /// A mode change is waiting for signaling to return to stable.
    renegotiate: bool,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut gathered: mpsc::Receiver<(u64, Result<Resolution>)>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        initiate: bool,
    ) {
        if initiate {
            if let Err(e) = self.offer() {
                warn!("initial offer failed: {}", e);
                self.fail(e);
            }
            self.publish_state();
        }

        let mut tick = time::interval(self.settings.ice_check_interval().max(MIN_TICK));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Stop(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(message) = inbound.recv() => self.handle_inbound(message).await,
                Some((round, result)) = gathered.recv() => self.on_gathered(round, result),
                Some(event) = transport_events.recv() => self.on_transport_event(event),
                _ = tick.tick() => self.on_tick().await,
            }
            self.resume_renegotiation();
            self.publish_state();
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Signal(message, reply) => {
                let result = self.on_signal(message).await;
                let _ = reply.send(result);
            }
            Command::Reconfigure(media, reply) => {
                let _ = reply.send(self.reconfigure(media));
            }
            Command::RestartIce(reply) => {
                let result = self.negotiator.restart_ice().and_then(|()| self.offer());
                let _ = reply.send(result);
            }
            Command::SetTrackEnabled(kind, enabled, reply) => {
                let _ = reply.send(self.set_track_enabled(kind, enabled).await);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            // Handled by the run loop.
            Command::Stop(_) => {}
        }
    }

    async fn on_signal(&mut self, message: SignalMessage) -> Result<()> {
        debug!(kind = message.kind(), "remote signal");
        match message {
            SignalMessage::Offer { sdp } => {
                self.negotiator.set_remote_description(SessionDescription {
                    sdp_type: SdpType::Offer,
                    sdp,
                })?;
                let answer = self.negotiator.create_answer(SdpType::Answer)?;
                self.send_signal(SignalMessage::Answer { sdp: answer.sdp });
                self.ensure_gathering();
                self.sync_remote();
                self.maybe_rebuild_transport();
            }
            SignalMessage::Answer { sdp } => {
                self.negotiator.set_remote_description(SessionDescription {
                    sdp_type: SdpType::Answer,
                    sdp,
                })?;
                self.ensure_gathering();
                self.sync_remote();
                self.maybe_rebuild_transport();
            }
            SignalMessage::Pranswer { sdp } => {
                // No remote provisional answers; this always fails.
                self.negotiator.set_remote_description(SessionDescription {
                    sdp_type: SdpType::Pranswer,
                    sdp,
                })?;
            }
            SignalMessage::IceCandidate {
                candidate,
                username_fragment,
                ..
            } => match self
                .negotiator
                .add_remote_candidate(&candidate, &username_fragment)
            {
                Ok(CandidateOutcome::Applied(_) | CandidateOutcome::EndOfCandidates) => {
                    self.sync_remote();
                }
                Ok(CandidateOutcome::Buffered) => trace!("candidate buffered"),
                Ok(CandidateOutcome::Duplicate) => trace!("duplicate candidate"),
                Err(SessionError::StaleCandidate { ufrag }) => {
                    debug!(%ufrag, "ignoring candidate from a previous ICE round");
                }
                Err(e) => return Err(e),
            },
            SignalMessage::Bye => self.close_remote("bye signal"),
        }
        self.drive_ice().await;
        Ok(())
    }

    fn reconfigure(&mut self, media: MediaSettings) -> Result<()> {
        media.validate()?;
        let state = self.negotiator.signaling_state();
        if state.is_terminal() {
            return Err(SessionError::invalid_state(state, "reconfigure"));
        }
        self.media = media;
        if let Some(transport) = &self.transport {
            transport.set_transform(TransformParams::from(&self.media));
        }
        self.sync_captures()?;
        if !self.negotiator.set_mode(media.mode) {
            return Ok(());
        }
        if self.negotiator.signaling_state() == SignalingState::Stable {
            info!(mode = ?media.mode, "track set changed, renegotiating");
            self.offer()?;
        } else {
            info!(
                mode = ?media.mode,
                state = %self.negotiator.signaling_state(),
                "track set changed, renegotiating once stable"
            );
            self.renegotiate = true;
        }
        Ok(())
    }

    /// Send the offer a mode change deferred while an exchange was open.
    fn resume_renegotiation(&mut self) {
        if !self.renegotiate
            || self.failed
            || self.negotiator.signaling_state() != SignalingState::Stable
        {
            return;
        }
        self.renegotiate = false;
        if !self.negotiator.needs_renegotiation() {
            return;
        }
        info!(mode = ?self.media.mode, "sending deferred renegotiation");
        if let Err(e) = self.offer() {
            warn!("deferred renegotiation failed: {}", e);
        }
    }

    async fn set_track_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<()> {
        self.local_enabled.insert(kind, enabled);
        let mid = self
            .transport_tracks
            .iter()
            .find(|t| t.kind == kind && t.send)
            .map(|t| t.mid);
        if let (Some(transport), Some(mid)) = (&self.transport, mid) {
            transport.set_track_enabled(mid, enabled).await?;
        }
        Ok(())
    }

    fn offer(&mut self) -> Result<()> {
        let offer = self.negotiator.create_offer()?;
        self.renegotiate = false;
        self.send_signal(SignalMessage::Offer { sdp: offer.sdp });
        self.ensure_gathering();
        Ok(())
    }

    /// Open capture for every kind the mode sends and release the rest.
    fn sync_captures(&mut self) -> Result<()> {
        let mode = self.media.mode;
        for kind in [MediaKind::Video, MediaKind::Audio] {
            let wanted = match kind {
                MediaKind::Video => mode.has_video(),
                MediaKind::Audio => mode.has_audio(),
            };
            if wanted && !self.captures.contains_key(&kind) {
                let handle = self.backend.open(kind)?;
                debug!(%kind, track = handle.track().id(), "capture opened");
                self.captures.insert(kind, handle);
            } else if !wanted && self.captures.remove(&kind).is_some() {
                debug!(%kind, "capture released");
            }
        }
        Ok(())
    }

    /// Start a new ICE agent and traversal when the negotiator began
    /// gathering for credentials no agent has yet.
    fn ensure_gathering(&mut self) {
        if self.negotiator.gathering_state() == IceGatheringState::New {
            return;
        }
        let credentials = self.negotiator.local_credentials().clone();
        if self
            .ice
            .as_ref()
            .is_some_and(|agent| agent.local_ufrag() == credentials.ufrag)
        {
            return;
        }

        self.ice_round += 1;
        let base = self.mux.local_addr();
        let mut agent = IceAgent::new(
            self.ice_config,
            self.negotiator.is_controlling(),
            credentials,
            base,
        );
        for candidate in host_candidates(base) {
            agent.add_local_candidate(candidate.clone(), None);
            let message = self.negotiator.add_local_candidate(candidate);
            self.send_signal(message);
        }
        self.ice = Some(agent);
        info!(round = self.ice_round, controlling = self.negotiator.is_controlling(), "gathering candidates");

        if let Some(task) = self.traversal.take() {
            task.abort();
        }
        let resolver = self.resolver.clone();
        let mux = self.mux.clone();
        let tx = self.gather_tx.clone();
        let round = self.ice_round;
        self.traversal = Some(tokio::spawn(async move {
            let result = resolver.resolve(&mux).await;
            let _ = tx.send((round, result)).await;
        }));
    }

    /// Hand the negotiator's view of the remote side to the ICE agent.
    /// Skipped while our own offer is pending, since the remote state then
    /// belongs to the previous round.
    fn sync_remote(&mut self) {
        if self.negotiator.signaling_state() == SignalingState::HaveLocalOffer {
            return;
        }
        let Some(agent) = self.ice.as_mut() else {
            return;
        };
        if let Some(credentials) = self.negotiator.remote_credentials() {
            agent.set_remote_credentials(credentials.clone());
        }
        for candidate in self.negotiator.remote_candidates() {
            agent.add_remote_candidate(candidate.clone());
        }
        if self.negotiator.remote_gathering_done() {
            agent.set_remote_gathering_done();
        }
    }

    fn on_gathered(&mut self, round: u64, result: Result<Resolution>) {
        if round != self.ice_round || self.negotiator.signaling_state().is_terminal() {
            return;
        }
        self.traversal = None;
        match result {
            Ok(resolution) => {
                for candidate in resolution.candidates {
                    let relay = resolution
                        .relays
                        .iter()
                        .find(|binding| binding.relayed == candidate.address)
                        .map(|binding| binding.server);
                    if let Some(agent) = self.ice.as_mut() {
                        agent.add_local_candidate(candidate.clone(), relay);
                    }
                    let message = self.negotiator.add_local_candidate(candidate);
                    self.send_signal(message);
                }
            }
            Err(e) => warn!("traversal failed, continuing with host candidates: {}", e),
        }
        let done = self.negotiator.end_of_local_candidates();
        self.send_signal(done);
    }

    async fn handle_inbound(&mut self, message: Inbound) {
        let now = Instant::now();
        match message {
            Inbound::Stun {
                from,
                relay,
                message,
            } => {
                let claimed = self
                    .ice
                    .as_mut()
                    .is_some_and(|agent| agent.handle_stun(now, from, relay, message));
                if !claimed {
                    trace!(%from, "unclaimed STUN message");
                }
                self.drive_ice().await;
            }
            Inbound::Handshake {
                from,
                relay,
                packet,
            } => self.on_handshake(now, from, relay, &packet.payload).await,
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        if let Some(agent) = self.ice.as_mut() {
            agent.handle_timeout(now, self.mux.last_inbound());
        }
        self.drive_ice().await;

        if self.phase != TransportPhase::Handshaking {
            return;
        }
        let retransmit = match self.handshake.as_mut() {
            Some(handshake) => handshake.poll_retransmit(now),
            None => return,
        };
        match retransmit {
            Ok(Some(message)) => self.send_handshake(&message).await,
            Ok(None) => {}
            Err(e) => self.fail(e),
        }
    }

    /// Flush queued connectivity checks and react to ICE events.
    async fn drive_ice(&mut self) {
        let Some(agent) = self.ice.as_mut() else {
            return;
        };
        let mut transmits = Vec::new();
        while let Some(transmit) = agent.poll_transmit() {
            transmits.push(transmit);
        }
        let mut events = Vec::new();
        while let Some(event) = agent.poll_event() {
            events.push(event);
        }

        for transmit in transmits {
            if let Err(e) = self.mux.send(&transmit.data, transmit.to, transmit.relay).await {
                debug!(to = %transmit.to, "check send failed: {}", e);
            }
        }
        for event in events {
            match event {
                IceEvent::StateChanged(state) => self.on_ice_state(state),
                IceEvent::Selected(pair) => self.on_selected(pair).await,
            }
        }
    }

    fn on_ice_state(&mut self, state: IceConnectionState) {
        let previous = self.negotiator.ice_state();
        if let Err(e) = self.negotiator.set_ice_state(state) {
            debug!("ignoring ICE state {}: {}", state, e);
            return;
        }
        if state == IceConnectionState::Failed {
            self.fail(SessionError::IceFailed(format!(
                "no working path (was {previous})"
            )));
        }
    }

    async fn on_selected(&mut self, pair: SelectedPair) {
        info!(
            local = %pair.local,
            remote = %pair.remote,
            kind = pair.remote_kind,
            relayed = pair.relay.is_some(),
            "path selected"
        );
        let path = PeerPath {
            remote: pair.remote,
            relay: pair.relay,
        };
        self.selected = Some(pair);

        if let Some(transport) = &self.transport {
            transport.set_path(path);
            self.handshake_path = Some(path);
            return;
        }
        if self.handshake.is_some() {
            self.handshake_path = Some(path);
            return;
        }
        self.begin_handshake(path).await;
    }

    async fn begin_handshake(&mut self, path: PeerPath) {
        let Some(remote_key) = self.negotiator.remote_public_key() else {
            self.fail(SessionError::NegotiationFailed(
                "remote description carries no transport key".into(),
            ));
            return;
        };
        let initiator = self.negotiator.is_controlling();
        let handshake = Handshake::new(
            initiator,
            &self.keypair,
            remote_key,
            self.settings.handshake_attempts,
            self.settings.handshake_step_timeout(),
        )
        .and_then(|mut handshake| {
            let first = handshake.start(Instant::now())?;
            Ok((handshake, first))
        });
        match handshake {
            Ok((handshake, first)) => {
                debug!(initiator, remote = %path.remote, "starting transport handshake");
                self.handshake = Some(handshake);
                self.handshake_path = Some(path);
                self.phase = TransportPhase::Handshaking;
                if let Some(message) = first {
                    self.send_handshake(&message).await;
                }
            }
            Err(e) => self.fail(e),
        }
    }

    async fn on_handshake(
        &mut self,
        now: Instant,
        from: std::net::SocketAddr,
        relay: Option<std::net::SocketAddr>,
        payload: &[u8],
    ) {
        if self.failed || self.phase == TransportPhase::Closed {
            return;
        }
        // The initiator can be faster than our own nomination.
        if self.handshake.is_none()
            && !self.negotiator.is_controlling()
            && self.negotiator.remote_public_key().is_some()
        {
            self.begin_handshake(PeerPath {
                remote: from,
                relay,
            })
            .await;
        }
        let reply = match self.handshake.as_mut() {
            Some(handshake) => handshake.handle(now, payload),
            None => {
                trace!(%from, "handshake packet before a path was selected");
                return;
            }
        };
        match reply {
            Ok(Some(message)) => self.send_handshake(&message).await,
            Ok(None) => {}
            Err(e) => {
                debug!(%from, "dropping handshake packet: {}", e);
                return;
            }
        }

        if self.phase != TransportPhase::Handshaking {
            return;
        }
        let cipher = match self.handshake.as_ref().and_then(Handshake::cipher) {
            Some(Ok(cipher)) => cipher,
            Some(Err(e)) => {
                self.fail(e);
                return;
            }
            None => return,
        };
        let Some(path) = self.handshake_path else {
            return;
        };
        let replay = replay_window();
        self.cipher = Some(cipher.clone());
        self.replay = Some(replay.clone());
        self.launch_transport(cipher, replay, path, 0);
        self.phase = TransportPhase::Established;
    }

    async fn send_handshake(&mut self, message: &[u8]) {
        let Some(path) = self.handshake_path else {
            return;
        };
        let packet =
            PhysicalPacket::new(Channel::Handshake, self.handshake_packets, message.to_vec());
        self.handshake_packets += 1;
        if let Err(e) = self.mux.send(&packet.encode(), path.remote, path.relay).await {
            debug!(remote = %path.remote, "handshake send failed: {}", e);
        }
    }

    fn launch_transport(
        &mut self,
        cipher: PacketCipher,
        replay: SharedReplayWindow,
        path: PeerPath,
        first_packet_id: u64,
    ) {
        let tracks = self.negotiator.negotiated_tracks();
        let mut local = Vec::new();
        let mut remote = Vec::new();
        let mut added: Vec<(u32, MediaKind, MediaTrack)> = Vec::new();

        for negotiated in &tracks {
            if negotiated.send {
                if let Some(capture) = self.captures.get(&negotiated.kind) {
                    local.push(SendTrack {
                        mid: negotiated.mid,
                        kind: negotiated.kind,
                        track: capture.track().clone(),
                        fec_group: negotiated.fec_group,
                        cache: negotiated
                            .nack
                            .then(|| retransmit_cache(self.settings.retransmit_cache)),
                        enabled: self
                            .local_enabled
                            .get(&negotiated.kind)
                            .copied()
                            .unwrap_or(true),
                    });
                }
            }
            if negotiated.recv {
                let id = format!("remote-{}-{}", negotiated.kind, negotiated.mid);
                let (writer, track) = MediaTrack::channel(negotiated.kind, id);
                remote.push(ReceiveTrack {
                    mid: negotiated.mid,
                    kind: negotiated.kind,
                    writer,
                    nack: negotiated.nack,
                });
                added.push((negotiated.mid, negotiated.kind, track));
            }
        }

        info!(
            sending = local.len(),
            receiving = remote.len(),
            "transport established"
        );
        let setup = TransportSetup {
            cipher,
            replay,
            path,
            first_packet_id,
            local,
            remote,
            params: TransformParams::from(&self.media),
        };
        self.transport = Some(TransportSession::start(
            self.mux.clone(),
            setup,
            &self.transport_config,
            self.transport_tx.clone(),
        ));
        self.transport_tracks = tracks;
        for (mid, kind, track) in added {
            self.events
                .emit(SessionEvent::TrackAdded { mid, kind, track });
        }
    }

    /// After a renegotiation the agreed track set may differ from what the
    /// transport carries; restart it on the same keys and path.
    fn maybe_rebuild_transport(&mut self) {
        if self.phase != TransportPhase::Established
            || self.negotiator.signaling_state() != SignalingState::Stable
        {
            return;
        }
        let tracks = self.negotiator.negotiated_tracks();
        if tracks == self.transport_tracks {
            return;
        }
        let (Some(cipher), Some(replay)) = (self.cipher.clone(), self.replay.clone()) else {
            return;
        };
        let Some(old) = self.transport.take() else {
            return;
        };
        let path = old.path();
        let next_packet_id = old.next_packet_id();
        drop(old);
        info!("track set changed, restarting transport");
        self.launch_transport(cipher, replay, path, next_packet_id);
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::FrameReady { mid, kind, frame } => {
                self.events
                    .emit(SessionEvent::FrameReady { mid, kind, frame });
            }
            TransportEvent::DecodeFailure { mid, consecutive } => {
                self.fail(SessionError::DecodeFailure { mid, consecutive });
            }
            TransportEvent::RemoteTrackState { mid, enabled } => {
                debug!(mid, enabled, "remote track state");
                self.events.emit(SessionEvent::TrackEnabled { mid, enabled });
            }
            TransportEvent::RemoteBye { reason } => {
                info!(%reason, "remote hung up");
                self.close_remote("transport bye");
            }
        }
    }

    fn stats(&self) -> SessionStats {
        let mut transport = self
            .transport
            .as_ref()
            .map(TransportSession::stats)
            .unwrap_or_default();
        if transport.rtt_ms.is_none() {
            transport.rtt_ms = self
                .ice
                .as_ref()
                .and_then(IceAgent::selected_rtt)
                .map(|rtt| rtt.as_secs_f64() * 1000.0);
        }
        SessionStats {
            session_id: self.id,
            connection: self.current_state(),
            signaling: self.negotiator.signaling_state(),
            ice_gathering: self.negotiator.gathering_state(),
            ice: self.negotiator.ice_state(),
            selected_pair: self.selected.clone(),
            local_candidates: self.negotiator.local_candidates().len(),
            remote_candidates: self.negotiator.remote_candidates().len(),
            transport,
            events_dropped: self.events.dropped(),
        }
    }

    fn current_state(&self) -> ConnectionState {
        connection_state(
            self.negotiator.signaling_state(),
            self.negotiator.ice_state(),
            self.phase,
        )
    }

    fn publish_state(&mut self) {
        let state = self.current_state();
        if state != self.reported {
            info!(from = %self.reported, to = %state, "connection state");
            self.reported = state;
            self.events.emit(SessionEvent::StateChanged(state));
        }
    }

    fn send_signal(&self, message: SignalMessage) {
        trace!(kind = message.kind(), "signal out");
        if self.signal_out.send(message).is_err() {
            debug!("signaling channel closed");
        }
    }

    fn fail(&mut self, err: SessionError) {
        if self.failed {
            return;
        }
        self.failed = true;
        error!("session failed: {}", err);
        self.negotiator.fail();
        self.stop_media();
        self.captures.clear();
        self.phase = TransportPhase::Idle;
        self.events.emit(SessionEvent::Error(err));
    }

    fn close_remote(&mut self, reason: &str) {
        if self.phase == TransportPhase::Closed {
            return;
        }
        info!(reason, "session closed by remote");
        self.stop_media();
        self.captures.clear();
        self.negotiator.close();
        self.phase = TransportPhase::Closed;
    }

    /// Drop the transport, the ICE agent and any traversal in flight.
    fn stop_media(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
        if let Some(task) = self.traversal.take() {
            task.abort();
        }
        self.handshake = None;
        self.ice = None;
    }

    async fn shutdown(&mut self) {
        if let Some(transport) = &self.transport {
            let grace = self.settings.stop_grace() / 2;
            if let Ok(Err(e)) = time::timeout(grace, transport.send_bye("hangup")).await {
                debug!("bye not sent: {}", e);
            }
        }
        if !self.negotiator.signaling_state().is_terminal() {
            self.send_signal(SignalMessage::Bye);
        }
        self.stop_media();
        self.captures.clear();
        self.negotiator.close();
        self.phase = TransportPhase::Closed;
        debug!("session resources released");
    }
}
