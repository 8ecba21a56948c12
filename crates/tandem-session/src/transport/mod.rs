//! Encrypted media transport over the selected ICE path.
//!
//! One task per direction of every track plus a dispatcher:
//! - send workers pull from local tracks, transform, encode, chunk and
//!   seal;
//! - the dispatcher opens inbound packets, routes chunks to their track
//!   and answers pings and NACKs;
//! - receive workers reassemble, smooth through the jitter buffer, decode
//!   and publish into the remote track.

pub mod assembly;
pub mod handshake;
pub mod jitter;
pub mod receive;
pub mod send;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_common::helpers::now_us;
use tandem_common::EngineSettings;
use tandem_crypto::{PacketCipher, ReplayWindow};
use tandem_media::{Frame, MediaKind, TransformParams};
use tandem_proto::envelope::Content;
use tandem_proto::{decode_msg, Bye, Channel, Ping, Pong, TrackState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::error::Result;
use crate::mux::{RoutedPacket, UdpMux};
use crate::types::{TransportCounters, TransportStats};

use jitter::{JitterConfig, RttTracker};
use receive::{ReceiveTrack, ReceiveWorker, ReceiverInput};
use send::{PacketSender, RetransmitCache, SendTrack, SendWorker, SharedCache};

const ROUTE_QUEUE: usize = 1024;
const TRACK_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPath {
    pub remote: SocketAddr,
    /// TURN server to send through.
    pub relay: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub jitter: JitterConfig,
    /// How long a partially received frame is kept.
    pub frame_timeout: Duration,
    pub decode_failure_threshold: u32,
    pub max_chunk_payload: usize,
    pub retransmit_cache: usize,
    pub ping_interval: Duration,
    pub simulated_send_loss: f32,
}

impl TransportConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            jitter: JitterConfig {
                depth: settings.jitter_depth,
                initial_delay: settings.jitter_initial_delay(),
                max_delay: settings.jitter_max_delay(),
            },
            frame_timeout: settings.jitter_max_delay().max(Duration::from_millis(100)) * 2,
            decode_failure_threshold: settings.decode_failure_threshold.max(1),
            max_chunk_payload: settings.max_chunk_payload,
            retransmit_cache: settings.retransmit_cache,
            ping_interval: settings.consent_interval(),
            simulated_send_loss: settings.simulated_send_loss,
        }
    }
}

/// What the transport reports to the control task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    FrameReady {
        mid: u32,
        kind: MediaKind,
        frame: Arc<Frame>,
    },
    DecodeFailure {
        mid: u32,
        consecutive: u32,
    },
    RemoteTrackState {
        mid: u32,
        enabled: bool,
    },
    RemoteBye {
        reason: String,
    },
}

/// Everything one transport instance carries.
pub struct TransportSetup {
    pub cipher: PacketCipher,
    /// Shared with every transport built on the same cipher.
    pub replay: SharedReplayWindow,
    pub path: PeerPath,
    pub first_packet_id: u64,
    /// Local tracks to send.
    pub local: Vec<SendTrack>,
    /// Remote tracks to fill from the wire.
    pub remote: Vec<ReceiveTrack>,
    pub params: TransformParams,
}

pub struct TransportSession {
    mux: Arc<UdpMux>,
    sender: Arc<PacketSender>,
    path: watch::Sender<PeerPath>,
    params: watch::Sender<TransformParams>,
    enabled: HashMap<u32, watch::Sender<bool>>,
    counters: Arc<TransportCounters>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportSession {
    /// Start all workers for `setup` on top of `mux`.
    pub fn start(
        mux: Arc<UdpMux>,
        setup: TransportSetup,
        config: &TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let TransportSetup {
            cipher,
            replay,
            path,
            first_packet_id,
            local,
            remote,
            params,
        } = setup;
        let counters = Arc::new(TransportCounters::default());
        let (path_tx, path_rx) = watch::channel(path);
        let (params_tx, params_rx) = watch::channel(params);
        let sender = Arc::new(PacketSender::new(
            mux.clone(),
            cipher.clone(),
            path_rx,
            first_packet_id,
            config.simulated_send_loss,
            counters.clone(),
        ));

        let mut tasks = Vec::new();
        let mut enabled = HashMap::new();
        let mut caches: HashMap<u32, SharedCache> = HashMap::new();
        for track in local {
            if let Some(cache) = &track.cache {
                caches.insert(track.mid, cache.clone());
            }
            let (enabled_tx, enabled_rx) = watch::channel(track.enabled);
            enabled.insert(track.mid, enabled_tx);
            debug!(mid = track.mid, kind = %track.kind, "starting send worker");
            let worker = SendWorker {
                track,
                sender: sender.clone(),
                params: params_rx.clone(),
                enabled: enabled_rx,
                max_payload: config.max_chunk_payload,
                counters: counters.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        let mut routes = HashMap::new();
        for track in remote {
            let (tx, rx) = mpsc::channel(TRACK_QUEUE);
            routes.insert(track.mid, tx);
            debug!(mid = track.mid, kind = %track.kind, "starting receive worker");
            let worker = ReceiveWorker {
                track,
                input: rx,
                sender: sender.clone(),
                events: events.clone(),
                jitter: config.jitter,
                frame_timeout: config.frame_timeout,
                decode_failure_threshold: config.decode_failure_threshold,
                counters: counters.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        let (route_tx, route_rx) = mpsc::channel(ROUTE_QUEUE);
        mux.set_media_route(Some(route_tx));
        let dispatcher = Dispatcher {
            opener: PacketOpener::new(cipher, replay, counters.clone()),
            sender: sender.clone(),
            routes,
            caches,
            events,
            counters: counters.clone(),
        };
        tasks.push(tokio::spawn(dispatcher.run(route_rx)));
        tasks.push(tokio::spawn(ping_loop(sender.clone(), config.ping_interval)));

        info!(remote = %path.remote, "transport started");
        Self {
            mux,
            sender,
            path: path_tx,
            params: params_tx,
            enabled,
            counters,
            tasks,
        }
    }

    pub fn set_path(&self, path: PeerPath) {
        self.path.send_if_modified(|current| {
            let changed = *current != path;
            *current = path;
            changed
        });
    }

    pub fn set_transform(&self, params: TransformParams) {
        self.params.send_replace(params);
    }

    /// Pause or resume sending a local track and tell the peer.
    pub async fn set_track_enabled(&self, mid: u32, enabled: bool) -> Result<()> {
        if let Some(tx) = self.enabled.get(&mid) {
            tx.send_replace(enabled);
        }
        self.sender
            .send(Channel::Control, Content::TrackState(TrackState { mid, enabled }))
            .await
    }

    pub async fn send_bye(&self, reason: &str) -> Result<()> {
        self.sender
            .send(
                Channel::Control,
                Content::Bye(Bye {
                    reason: reason.to_string(),
                }),
            )
            .await
    }

    pub fn path(&self) -> PeerPath {
        *self.path.borrow()
    }

    pub fn next_packet_id(&self) -> u64 {
        self.sender.next_packet_id()
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    /// Stop every worker immediately. Remote tracks end.
    pub fn shutdown(&mut self) {
        self.mux.set_media_route(None);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Replay window guarding one cipher's inbound packet ids.
pub type SharedReplayWindow = Arc<Mutex<ReplayWindow>>;

pub fn replay_window() -> SharedReplayWindow {
    Arc::new(Mutex::new(ReplayWindow::new()))
}

/// Decrypts inbound packets, rejecting replays.
pub struct PacketOpener {
    cipher: PacketCipher,
    replay: SharedReplayWindow,
    counters: Arc<TransportCounters>,
}

impl PacketOpener {
    pub fn new(
        cipher: PacketCipher,
        replay: SharedReplayWindow,
        counters: Arc<TransportCounters>,
    ) -> Self {
        Self {
            cipher,
            replay,
            counters,
        }
    }

    /// Plaintext of an authentic packet not seen before.
    pub fn open(&self, from: SocketAddr, packet_id: u64, payload: &[u8]) -> Option<Vec<u8>> {
        let fresh = self
            .replay
            .lock()
            .map(|window| window.would_accept(packet_id))
            .unwrap_or(false);
        if !fresh {
            trace!(%from, packet_id, "replayed packet");
            TransportCounters::bump(&self.counters.packets_rejected);
            return None;
        }
        let plaintext = match self.cipher.decrypt(packet_id, payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(%from, packet_id, "dropping packet: {}", e);
                TransportCounters::bump(&self.counters.packets_rejected);
                return None;
            }
        };
        // Re-checked under the lock: a concurrent opener may have taken it.
        let accepted = self
            .replay
            .lock()
            .map(|mut window| window.accept(packet_id))
            .unwrap_or(false);
        if !accepted {
            TransportCounters::bump(&self.counters.packets_rejected);
            return None;
        }
        TransportCounters::bump(&self.counters.packets_received);
        TransportCounters::add(&self.counters.bytes_received, payload.len() as u64);
        Some(plaintext)
    }
}

/// A fresh retransmission cache for one local track.
pub fn retransmit_cache(capacity: usize) -> SharedCache {
    Arc::new(Mutex::new(RetransmitCache::new(capacity)))
}

struct Dispatcher {
    opener: PacketOpener,
    sender: Arc<PacketSender>,
    routes: HashMap<u32, mpsc::Sender<ReceiverInput>>,
    caches: HashMap<u32, SharedCache>,
    events: mpsc::Sender<TransportEvent>,
    counters: Arc<TransportCounters>,
}

impl Dispatcher {
    async fn run(self, mut inbound: mpsc::Receiver<RoutedPacket>) {
        let mut rtt = RttTracker::new();

        while let Some(RoutedPacket { from, packet }) = inbound.recv().await {
            let Some(plaintext) = self.opener.open(from, packet.packet_id, &packet.payload) else {
                continue;
            };

            let content = match decode_msg(&plaintext) {
                Ok(envelope) => envelope.content,
                Err(e) => {
                    debug!(%from, "undecodable envelope: {}", e);
                    TransportCounters::bump(&self.counters.packets_rejected);
                    continue;
                }
            };
            match content {
                Some(Content::Chunk(chunk)) => self.route(chunk.mid, ReceiverInput::Chunk(chunk)),
                Some(Content::Fec(parity)) => self.route(parity.mid, ReceiverInput::Fec(parity)),
                Some(Content::Nack(nack)) => self.retransmit(nack.mid, &nack.seqs).await,
                Some(Content::Ping(Ping { timestamp_us })) => {
                    let pong = Content::Pong(Pong { timestamp_us });
                    if let Err(e) = self.sender.send(Channel::Control, pong).await {
                        trace!("pong failed: {}", e);
                    }
                }
                Some(Content::Pong(Pong { timestamp_us })) => {
                    let sample = Duration::from_micros(now_us().saturating_sub(timestamp_us));
                    let smoothed = rtt.on_sample(sample);
                    self.counters
                        .rtt_us
                        .store(smoothed.as_micros() as u64, Ordering::Relaxed);
                }
                Some(Content::TrackState(TrackState { mid, enabled })) => {
                    let _ = self
                        .events
                        .send(TransportEvent::RemoteTrackState { mid, enabled })
                        .await;
                }
                Some(Content::Bye(Bye { reason })) => {
                    let _ = self.events.send(TransportEvent::RemoteBye { reason }).await;
                }
                None => debug!(%from, "empty envelope"),
            }
        }
    }

    fn route(&self, mid: u32, input: ReceiverInput) {
        match self.routes.get(&mid) {
            Some(tx) => {
                if tx.try_send(input).is_err() {
                    trace!(mid, "receive worker backlogged");
                }
            }
            None => trace!(mid, "media for a track we do not receive"),
        }
    }

    async fn retransmit(&self, mid: u32, seqs: &[u64]) {
        let Some(cache) = self.caches.get(&mid) else {
            return;
        };
        let chunks: Vec<_> = match cache.lock() {
            Ok(cache) => seqs.iter().filter_map(|seq| cache.get(*seq).cloned()).collect(),
            Err(_) => return,
        };
        for chunk in chunks {
            if self.sender.send(Channel::Media, Content::Chunk(chunk)).await.is_ok() {
                TransportCounters::bump(&self.counters.retransmissions);
            }
        }
    }
}

async fn ping_loop(sender: Arc<PacketSender>, interval: Duration) {
    let mut ticker = time::interval(interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let ping = Content::Ping(Ping {
            timestamp_us: now_us(),
        });
        if let Err(e) = sender.send(Channel::Control, ping).await {
            trace!("ping failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ciphers() -> (PacketCipher, PacketCipher) {
        let (a, b) = ([7u8; 32], [9u8; 32]);
        (PacketCipher::new(&a, &b), PacketCipher::new(&b, &a))
    }

    fn from() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn rebuilt_transport_still_rejects_old_packets() {
        let (sender, receiver) = ciphers();
        let sealed = sender.encrypt(5, b"chunk").unwrap();
        let replay = replay_window();
        let counters = Arc::new(TransportCounters::default());

        let before = PacketOpener::new(receiver.clone(), replay.clone(), counters.clone());
        assert_eq!(before.open(from(), 5, &sealed).as_deref(), Some(&b"chunk"[..]));
        drop(before);

        // Same keys after a renegotiation, same window.
        let after = PacketOpener::new(receiver, replay, counters.clone());
        assert!(after.open(from(), 5, &sealed).is_none());

        let newer = sender.encrypt(6, b"next").unwrap();
        assert!(after.open(from(), 6, &newer).is_some());

        let stats = counters.snapshot();
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_rejected, 1);
    }

    #[test]
    fn forged_packets_do_not_advance_the_window() {
        let (sender, receiver) = ciphers();
        let opener = PacketOpener::new(
            receiver,
            replay_window(),
            Arc::new(TransportCounters::default()),
        );
        assert!(opener.open(from(), 10, b"garbage-not-sealed-at-all").is_none());

        let sealed = sender.encrypt(10, b"real").unwrap();
        assert!(opener.open(from(), 10, &sealed).is_some());
    }
}
