use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use tandem_proto::IceCandidate;
use tracing::debug;

/// Address of the interface the OS would route public traffic through.
/// Connecting a UDP socket sends nothing; it only picks a route.
pub fn outbound_ip(ipv6: bool) -> Option<IpAddr> {
    let (bind, probe): (SocketAddr, SocketAddr) = if ipv6 {
        (
            (Ipv6Addr::UNSPECIFIED, 0).into(),
            "[2001:4860:4860::8888]:80".parse().ok()?,
        )
    } else {
        (
            (Ipv4Addr::UNSPECIFIED, 0).into(),
            "8.8.8.8:80".parse().ok()?,
        )
    };
    let socket = UdpSocket::bind(bind).ok()?;
    if let Err(e) = socket.connect(probe) {
        debug!("no route for interface discovery: {}", e);
        return None;
    }
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Host candidates for a socket bound on `local`. A wildcard bind yields
/// the routed interface address plus loopback at a lower preference.
pub fn host_candidates(local: SocketAddr) -> Vec<IceCandidate> {
    let port = local.port();
    if !local.ip().is_unspecified() {
        return vec![IceCandidate::host(local, u16::MAX)];
    }

    let mut out = Vec::new();
    if let Some(ip) = outbound_ip(local.is_ipv6()) {
        if !ip.is_loopback() {
            out.push(IceCandidate::host(SocketAddr::new(ip, port), u16::MAX));
        }
    }
    let loopback: IpAddr = if local.is_ipv6() {
        Ipv6Addr::LOCALHOST.into()
    } else {
        Ipv4Addr::LOCALHOST.into()
    };
    out.push(IceCandidate::host(SocketAddr::new(loopback, port), u16::MAX / 2));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_proto::CandidateType;

    #[test]
    fn concrete_bind_is_single_candidate() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let candidates = host_candidates(addr);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address, addr);
        assert_eq!(candidates[0].kind, CandidateType::Host);
    }

    #[test]
    fn wildcard_bind_includes_loopback() {
        let candidates = host_candidates("0.0.0.0:6000".parse().unwrap());
        let last = candidates.last().unwrap();
        assert_eq!(last.address, "127.0.0.1:6000".parse::<SocketAddr>().unwrap());
        assert!(candidates.iter().all(|c| c.address.port() == 6000));
        assert!(candidates.windows(2).all(|w| w[0].priority >= w[1].priority));
    }
}
