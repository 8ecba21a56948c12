//! Traversal resolver: asks STUN/TURN servers how the session socket looks
//! from outside.
//!
//! Every configured server is probed concurrently over the session socket
//! so the reflexive addresses it reports are the ones the peer can reach.
//! A resolution succeeds as soon as any server produced a candidate;
//! servers that time out or cannot be reached are logged and skipped.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future::join_all;
use tandem_common::{EngineSettings, ServerKind, TraversalServer};
use tandem_proto::{IceCandidate, StunClass, StunMessage};
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::mux::{TransactionError, UdpMux};

/// An allocation on a TURN server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayBinding {
    pub server: SocketAddr,
    pub relayed: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// The server never answered.
    Timeout,
    /// Name resolution or sending failed.
    Unreachable(String),
    /// The server answered with an error or without an address.
    Rejected(String),
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Server-reflexive and relay candidates, without duplicates.
    pub candidates: Vec<IceCandidate>,
    pub relays: Vec<RelayBinding>,
    pub failures: Vec<(String, ProbeFailure)>,
}

#[derive(Debug, Default)]
struct Probe {
    reflexive: Option<SocketAddr>,
    relay: Option<RelayBinding>,
}

#[derive(Debug, Clone)]
pub struct TraversalResolver {
    servers: Vec<TraversalServer>,
    timeout: Duration,
    retransmit: Duration,
}

impl TraversalResolver {
    pub fn new(servers: Vec<TraversalServer>, timeout: Duration, retransmit: Duration) -> Self {
        Self {
            servers,
            timeout,
            retransmit,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.traversal_servers.clone(),
            settings.traversal_timeout(),
            settings.traversal_retransmit(),
        )
    }

    pub fn servers(&self) -> &[TraversalServer] {
        &self.servers
    }

    /// Probe every server. Returns whatever was found; fails only when
    /// servers are configured and none of them answered.
    pub async fn resolve(&self, mux: &UdpMux) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        if self.servers.is_empty() {
            return Ok(resolution);
        }

        let base = mux.local_addr();
        let probes = self.servers.iter().map(|server| self.probe(mux, server));
        let results = join_all(probes).await;

        let mut answered = false;
        for (server, result) in self.servers.iter().zip(results) {
            match result {
                Ok(probe) => {
                    answered = true;
                    if let Some(addr) = probe.reflexive {
                        let candidate = IceCandidate::server_reflexive(addr, base, u16::MAX);
                        if !resolution.candidates.contains(&candidate) {
                            resolution.candidates.push(candidate);
                        }
                    }
                    if let Some(relay) = probe.relay {
                        let mapped = probe.reflexive.unwrap_or(base);
                        resolution
                            .candidates
                            .push(IceCandidate::relay(relay.relayed, mapped, u16::MAX));
                        resolution.relays.push(relay);
                    }
                }
                Err(ProbeFailure::Rejected(reason)) => {
                    answered = true;
                    warn!("traversal server {} rejected probe: {}", server.address, reason);
                    resolution
                        .failures
                        .push((server.address.clone(), ProbeFailure::Rejected(reason)));
                }
                Err(failure) => {
                    debug!("traversal server {} failed: {:?}", server.address, failure);
                    resolution.failures.push((server.address.clone(), failure));
                }
            }
        }

        if !answered {
            let servers = self.servers.len();
            let all_unreachable = resolution
                .failures
                .iter()
                .all(|(_, f)| matches!(f, ProbeFailure::Unreachable(_)));
            return Err(if all_unreachable {
                SessionError::TraversalUnreachable { servers }
            } else {
                SessionError::TraversalTimeout { servers }
            });
        }

        info!(
            "traversal resolved {} candidates ({} of {} servers failed)",
            resolution.candidates.len(),
            resolution.failures.len(),
            self.servers.len()
        );
        Ok(resolution)
    }

    async fn probe(
        &self,
        mux: &UdpMux,
        server: &TraversalServer,
    ) -> std::result::Result<Probe, ProbeFailure> {
        let (kind, target) = server
            .target()
            .map_err(|e| ProbeFailure::Unreachable(e.to_string()))?;
        let addr = resolve_target(&target, mux.local_addr(), self.timeout).await?;

        let request = match kind {
            ServerKind::Stun => StunMessage::binding_request(),
            ServerKind::Turn => {
                let username = server.credentials.as_ref().map(|c| c.username.as_str());
                StunMessage::allocate_request(username)
            }
        };

        let response = mux
            .transaction(addr, &request, self.timeout, self.retransmit)
            .await
            .map_err(|e| match e {
                TransactionError::Timeout(_) => ProbeFailure::Timeout,
                TransactionError::Unreachable(_, reason) => ProbeFailure::Unreachable(reason),
            })?;

        if response.class == StunClass::ErrorResponse {
            let reason = response
                .error_code()
                .map(|(code, reason)| format!("{code} {reason}"))
                .unwrap_or_else(|| "error response".to_string());
            return Err(ProbeFailure::Rejected(reason));
        }

        let probe = Probe {
            reflexive: response.mapped_address(),
            relay: response.relayed_address().map(|relayed| RelayBinding {
                server: addr,
                relayed,
            }),
        };
        if probe.reflexive.is_none() && probe.relay.is_none() {
            return Err(ProbeFailure::Rejected("response carries no address".into()));
        }
        if probe.relay.is_some() {
            mux.add_relay(addr);
        }
        Ok(probe)
    }
}

/// Resolve `host:port`, preferring the address family of the local socket.
async fn resolve_target(
    target: &str,
    local: SocketAddr,
    limit: Duration,
) -> std::result::Result<SocketAddr, ProbeFailure> {
    let addrs = bounded_lookup(tokio::net::lookup_host(target), target, limit).await?;
    addrs
        .iter()
        .find(|a| a.is_ipv4() == local.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProbeFailure::Unreachable(format!("{target}: no addresses")))
}

/// Collect a name lookup, giving up after `limit`.
async fn bounded_lookup<I>(
    lookup: impl Future<Output = io::Result<I>>,
    target: &str,
    limit: Duration,
) -> std::result::Result<Vec<SocketAddr>, ProbeFailure>
where
    I: Iterator<Item = SocketAddr>,
{
    match time::timeout(limit, lookup).await {
        Ok(Ok(addrs)) => Ok(addrs.collect()),
        Ok(Err(e)) => Err(ProbeFailure::Unreachable(format!("{target}: {e}"))),
        Err(_) => {
            debug!("name lookup for {} timed out after {:?}", target, limit);
            Err(ProbeFailure::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_proto::CandidateType;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    async fn mux() -> (UdpMux, mpsc::Receiver<crate::mux::Inbound>) {
        let (tx, rx) = mpsc::channel(16);
        (UdpMux::bind("127.0.0.1:0", tx).await.unwrap(), rx)
    }

    /// Answers binding requests with a fixed "public" address.
    async fn fake_stun(public: SocketAddr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let request = StunMessage::decode(&buf[..len]).unwrap();
                let response = StunMessage::binding_success(&request, public);
                let _ = socket.send_to(&response.encode(), from).await;
            }
        });
        addr
    }

    fn resolver(servers: Vec<TraversalServer>) -> TraversalResolver {
        TraversalResolver::new(servers, Duration::from_millis(300), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn no_servers_is_empty_success() {
        let (mux, _rx) = mux().await;
        let resolution = resolver(Vec::new()).resolve(&mux).await.unwrap();
        assert!(resolution.candidates.is_empty());
    }

    #[tokio::test]
    async fn partial_results_survive_a_silent_server() {
        let (mux, _rx) = mux().await;
        let public: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        let good = fake_stun(public).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let resolution = resolver(vec![
            TraversalServer::stun(format!("stun:{good}")),
            TraversalServer::stun(silent.local_addr().unwrap().to_string()),
        ])
        .resolve(&mux)
        .await
        .unwrap();

        assert_eq!(resolution.candidates.len(), 1);
        let candidate = &resolution.candidates[0];
        assert_eq!(candidate.kind, CandidateType::ServerReflexive);
        assert_eq!(candidate.address, public);
        assert_eq!(candidate.related, Some(mux.local_addr()));
        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.failures[0].1, ProbeFailure::Timeout);
    }

    #[tokio::test]
    async fn all_silent_is_timeout() {
        let (mux, _rx) = mux().await;
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = resolver(vec![
            TraversalServer::stun(a.local_addr().unwrap().to_string()),
            TraversalServer::stun(b.local_addr().unwrap().to_string()),
        ])
        .resolve(&mux)
        .await
        .unwrap_err();
        assert_eq!(err, SessionError::TraversalTimeout { servers: 2 });
    }

    #[tokio::test]
    async fn unresolvable_servers_are_unreachable() {
        let (mux, _rx) = mux().await;
        let err = resolver(vec![TraversalServer::stun("stun:host.invalid:3478")])
            .resolve(&mux)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::TraversalUnreachable { servers: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_name_lookup_times_out() {
        let stalled = std::future::pending::<io::Result<std::vec::IntoIter<SocketAddr>>>();
        let started = time::Instant::now();
        let result = bounded_lookup(stalled, "stun.example.org:3478", Duration::from_millis(300)).await;
        assert_eq!(result, Err(ProbeFailure::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn duplicate_reflexive_addresses_collapse() {
        let (mux, _rx) = mux().await;
        let public: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        let a = fake_stun(public).await;
        let b = fake_stun(public).await;
        let resolution = resolver(vec![
            TraversalServer::stun(a.to_string()),
            TraversalServer::stun(b.to_string()),
        ])
        .resolve(&mux)
        .await
        .unwrap();
        assert_eq!(resolution.candidates.len(), 1);
        assert!(resolution.failures.is_empty());
    }
}
