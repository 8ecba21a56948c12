//! One UDP socket per session, shared by traversal probes, ICE checks, the
//! transport handshake and media.
//!
//! A single reader task classifies every datagram:
//! - STUN responses matching an outstanding [`UdpMux::transaction`] wake it;
//! - other STUN messages and handshake packets go to the control task;
//! - media and control packets go to the transport, once one is attached.
//!
//! TURN Data indications from a known relay are unwrapped first, so the
//! layers above never see the relay framing.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use tandem_proto::stun::TransactionId;
use tandem_proto::{
    classify_datagram, Channel, DatagramKind, PhysicalPacket, StunClass, StunMessage, StunMethod,
    MAX_DATAGRAM_SIZE,
};

const SOCKET_BUFFER_BYTES: usize = 1 << 20;

/// Something the control task has to look at.
#[derive(Debug)]
pub enum Inbound {
    Stun {
        from: SocketAddr,
        /// Relay server the message arrived through.
        relay: Option<SocketAddr>,
        message: StunMessage,
    },
    Handshake {
        from: SocketAddr,
        relay: Option<SocketAddr>,
        packet: PhysicalPacket,
    },
}

/// Media or control packet for the transport.
#[derive(Debug)]
pub struct RoutedPacket {
    pub from: SocketAddr,
    pub packet: PhysicalPacket,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("no response from {0}")]
    Timeout(SocketAddr),
    #[error("{0} is unreachable: {1}")]
    Unreachable(SocketAddr, String),
}

type Pending = Arc<Mutex<HashMap<TransactionId, oneshot::Sender<StunMessage>>>>;
type MediaRoute = Arc<Mutex<Option<mpsc::Sender<RoutedPacket>>>>;

#[derive(Clone)]
struct Shared {
    socket: Arc<UdpSocket>,
    pending: Pending,
    media_route: MediaRoute,
    relays: Arc<Mutex<HashSet<SocketAddr>>>,
    last_inbound: Arc<Mutex<Option<Instant>>>,
    inbound: mpsc::Sender<Inbound>,
}

pub struct UdpMux {
    shared: Shared,
    local_addr: SocketAddr,
    reader: JoinHandle<()>,
}

impl UdpMux {
    pub async fn bind(addr: &str, inbound: mpsc::Sender<Inbound>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let sock_ref = SockRef::from(&socket);
        if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_BUFFER_BYTES) {
            debug!("failed to grow receive buffer: {}", e);
        }
        if let Err(e) = sock_ref.set_send_buffer_size(SOCKET_BUFFER_BYTES) {
            debug!("failed to grow send buffer: {}", e);
        }
        let local_addr = socket.local_addr()?;

        let shared = Shared {
            socket: Arc::new(socket),
            pending: Arc::default(),
            media_route: Arc::default(),
            relays: Arc::default(),
            last_inbound: Arc::default(),
            inbound,
        };
        let reader = tokio::spawn(read_loop(shared.clone()));
        debug!("session socket bound on {}", local_addr);

        Ok(Self {
            shared,
            local_addr,
            reader,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send `data` to `to`, through `relay` when given.
    pub async fn send(
        &self,
        data: &[u8],
        to: SocketAddr,
        relay: Option<SocketAddr>,
    ) -> std::io::Result<()> {
        match relay {
            Some(server) => {
                let wrapped = StunMessage::send_indication(to, data).encode();
                self.shared.socket.send_to(&wrapped, server).await?;
            }
            None => {
                self.shared.socket.send_to(data, to).await?;
            }
        }
        Ok(())
    }

    /// Send a STUN request and wait for the matching response,
    /// retransmitting every `retransmit` until `timeout` expires.
    pub async fn transaction(
        &self,
        to: SocketAddr,
        request: &StunMessage,
        timeout: Duration,
        retransmit: Duration,
    ) -> Result<StunMessage, TransactionError> {
        let (tx, mut rx) = oneshot::channel();
        let guard = PendingGuard::register(&self.shared.pending, request.transaction_id, tx);
        let wire = request.encode();
        let deadline = Instant::now() + timeout;

        loop {
            if let Err(e) = self.shared.socket.send_to(&wire, to).await {
                return Err(TransactionError::Unreachable(to, e.to_string()));
            }
            let wait_until = (Instant::now() + retransmit).min(deadline);
            match time::timeout_at(wait_until, &mut rx).await {
                Ok(Ok(response)) => {
                    drop(guard);
                    return Ok(response);
                }
                Ok(Err(_)) => return Err(TransactionError::Timeout(to)),
                Err(_) if Instant::now() >= deadline => {
                    return Err(TransactionError::Timeout(to));
                }
                Err(_) => trace!("retransmitting STUN request to {}", to),
            }
        }
    }

    /// Attach (or detach) the transport's packet queue.
    pub fn set_media_route(&self, route: Option<mpsc::Sender<RoutedPacket>>) {
        if let Ok(mut slot) = self.shared.media_route.lock() {
            *slot = route;
        }
    }

    /// Treat Data indications from `server` as relayed peer traffic.
    pub fn add_relay(&self, server: SocketAddr) {
        if let Ok(mut relays) = self.shared.relays.lock() {
            relays.insert(server);
        }
    }

    /// When the last datagram from anything but a traversal server arrived.
    pub fn last_inbound(&self) -> Option<Instant> {
        self.shared.last_inbound.lock().ok().and_then(|t| *t)
    }
}

impl Drop for UdpMux {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct PendingGuard {
    pending: Pending,
    id: TransactionId,
}

impl PendingGuard {
    fn register(pending: &Pending, id: TransactionId, tx: oneshot::Sender<StunMessage>) -> Self {
        if let Ok(mut map) = pending.lock() {
            map.insert(id, tx);
        }
        Self {
            pending: pending.clone(),
            id,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&self.id);
        }
    }
}

async fn read_loop(shared: Shared) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE * 2];
    loop {
        let (len, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                // ICMP errors for earlier sends surface here on some platforms.
                debug!("session socket recv error: {}", e);
                continue;
            }
        };
        dispatch(&shared, from, None, &buf[..len]);
    }
}

fn dispatch(shared: &Shared, from: SocketAddr, relay: Option<SocketAddr>, data: &[u8]) {
    match classify_datagram(data) {
        DatagramKind::Stun => {
            let message = match StunMessage::decode(data) {
                Ok(m) => m,
                Err(e) => {
                    debug!("dropping malformed STUN from {}: {}", from, e);
                    return;
                }
            };

            if message.method == StunMethod::Data
                && message.class == StunClass::Indication
                && relay.is_none()
                && is_relay(shared, from)
            {
                match (message.peer_address(), message.data()) {
                    (Some(peer), Some(inner)) => dispatch(shared, peer, Some(from), inner),
                    _ => debug!("data indication from {} without peer or data", from),
                }
                return;
            }

            if message.class.is_response() {
                let waiter = shared
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut map| map.remove(&message.transaction_id));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message);
                    return;
                }
            }

            touch(shared);
            if shared
                .inbound
                .try_send(Inbound::Stun {
                    from,
                    relay,
                    message,
                })
                .is_err()
            {
                debug!("control queue full, dropping STUN from {}", from);
            }
        }
        DatagramKind::Tandem => {
            let packet = match PhysicalPacket::decode(Bytes::copy_from_slice(data)) {
                Ok(p) => p,
                Err(e) => {
                    debug!("dropping bad packet from {}: {}", from, e);
                    return;
                }
            };
            touch(shared);
            match packet.channel {
                Channel::Handshake => {
                    let _ = shared.inbound.try_send(Inbound::Handshake {
                        from,
                        relay,
                        packet,
                    });
                }
                Channel::Media | Channel::Control => {
                    let route = shared.media_route.lock().ok().and_then(|r| r.clone());
                    match route {
                        Some(tx) => {
                            if tx.try_send(RoutedPacket { from, packet }).is_err() {
                                trace!("transport queue full, dropping packet");
                            }
                        }
                        None => trace!("no transport yet, dropping packet from {}", from),
                    }
                }
            }
        }
        DatagramKind::Unknown => {
            warn!("dropping unrecognised {}-byte datagram from {}", data.len(), from);
        }
    }
}

fn is_relay(shared: &Shared, addr: SocketAddr) -> bool {
    shared
        .relays
        .lock()
        .map(|relays| relays.contains(&addr))
        .unwrap_or(false)
}

fn touch(shared: &Shared) {
    if let Ok(mut last) = shared.last_inbound.lock() {
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn stun_responder() -> (SocketAddr, JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let request = StunMessage::decode(&buf[..len]).unwrap();
                let response = StunMessage::binding_success(&request, from);
                socket.send_to(&response.encode(), from).await.unwrap();
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn transaction_matches_response() {
        let (server, _task) = stun_responder().await;
        let (tx, _rx) = mpsc::channel(8);
        let mux = UdpMux::bind("127.0.0.1:0", tx).await.unwrap();

        let request = StunMessage::binding_request();
        let response = mux
            .transaction(
                server,
                &request,
                Duration::from_secs(1),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(response.transaction_id, request.transaction_id);
        assert_eq!(response.mapped_address(), Some(mux.local_addr()));
        // Traversal responses do not count as peer activity.
        assert!(mux.last_inbound().is_none());
    }

    #[tokio::test]
    async fn transaction_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let mux = UdpMux::bind("127.0.0.1:0", tx).await.unwrap();
        let err = mux
            .transaction(
                silent.local_addr().unwrap(),
                &StunMessage::binding_request(),
                Duration::from_millis(150),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::Timeout(_)));
    }

    #[tokio::test]
    async fn routes_by_datagram_kind() {
        let (tx, mut rx) = mpsc::channel(8);
        let mux = UdpMux::bind("127.0.0.1:0", tx).await.unwrap();
        let (media_tx, mut media_rx) = mpsc::channel(8);
        mux.set_media_route(Some(media_tx));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = mux.local_addr();

        let request = StunMessage::binding_request();
        peer.send_to(&request.encode(), target).await.unwrap();
        let handshake = PhysicalPacket::new(Channel::Handshake, 0, vec![1u8, 2, 3]);
        peer.send_to(&handshake.encode(), target).await.unwrap();
        let media = PhysicalPacket::new(Channel::Media, 9, vec![4u8]);
        peer.send_to(&media.encode(), target).await.unwrap();

        match rx.recv().await.unwrap() {
            Inbound::Stun { message, relay, .. } => {
                assert!(message.is_binding_request());
                assert!(relay.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Inbound::Handshake { .. }));
        let routed = media_rx.recv().await.unwrap();
        assert_eq!(routed.packet.packet_id, 9);
        assert_eq!(routed.from, peer.local_addr().unwrap());
        assert!(mux.last_inbound().is_some());
    }

    #[tokio::test]
    async fn unwraps_relay_data_indications() {
        let (tx, mut rx) = mpsc::channel(8);
        let mux = UdpMux::bind("127.0.0.1:0", tx).await.unwrap();
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        mux.add_relay(relay_addr);

        let peer: SocketAddr = "203.0.113.7:4000".parse().unwrap();
        let inner = PhysicalPacket::new(Channel::Handshake, 0, vec![1u8]).encode();
        let wrapped = StunMessage::data_indication(peer, &inner).encode();
        relay.send_to(&wrapped, mux.local_addr()).await.unwrap();

        match rx.recv().await.unwrap() {
            Inbound::Handshake { from, relay, .. } => {
                assert_eq!(from, peer);
                assert_eq!(relay, Some(relay_addr));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
