//! ICE candidate grammar and priority computation.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Only one component (RTP) is used; media and control share it.
pub const COMPONENT_RTP: u16 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("candidate line is missing the `candidate:` prefix")]
    MissingPrefix,
    #[error("candidate line has too few fields: {0}")]
    TooFewFields(usize),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

fn invalid(field: &'static str, value: &str) -> CandidateError {
    CandidateError::InvalidField {
        field,
        value: value.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateType {
    /// RFC 8445 recommended type preferences.
    pub fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(invalid("type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            _ => Err(invalid("protocol", s)),
        }
    }
}

/// A discovered network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: TransportProtocol,
    pub priority: u32,
    pub address: SocketAddr,
    pub kind: CandidateType,
    /// Base address for reflexive and relay candidates.
    pub related: Option<SocketAddr>,
}

/// `2^24 * type_pref + 2^8 * local_pref + (256 - component)`.
pub fn compute_priority(kind: CandidateType, local_preference: u16, component: u16) -> u32 {
    (kind.type_preference() << 24)
        + ((local_preference as u32) << 8)
        + (256 - component.min(256) as u32)
}

/// RFC 8445 pair priority. `controlling` and `controlled` are the candidate
/// priorities of the respective agents.
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let g = controlling as u64;
    let d = controlled as u64;
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

impl IceCandidate {
    pub fn host(address: SocketAddr, local_preference: u16) -> Self {
        Self::new(CandidateType::Host, address, None, local_preference)
    }

    pub fn server_reflexive(address: SocketAddr, base: SocketAddr, local_preference: u16) -> Self {
        Self::new(
            CandidateType::ServerReflexive,
            address,
            Some(base),
            local_preference,
        )
    }

    pub fn relay(address: SocketAddr, mapped: SocketAddr, local_preference: u16) -> Self {
        Self::new(CandidateType::Relay, address, Some(mapped), local_preference)
    }

    fn new(
        kind: CandidateType,
        address: SocketAddr,
        related: Option<SocketAddr>,
        local_preference: u16,
    ) -> Self {
        let base_ip = related.map(|r| r.ip()).unwrap_or(address.ip());
        Self {
            foundation: foundation_for(kind, base_ip, TransportProtocol::Udp),
            component: COMPONENT_RTP,
            protocol: TransportProtocol::Udp,
            priority: compute_priority(kind, local_preference, COMPONENT_RTP),
            address,
            kind,
            related,
        }
    }

    /// Parse an SDP candidate attribute value, with or without the `a=`
    /// prefix.
    pub fn parse(line: &str) -> Result<Self, CandidateError> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let rest = line
            .strip_prefix("candidate:")
            .ok_or(CandidateError::MissingPrefix)?;

        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(CandidateError::TooFewFields(fields.len()));
        }

        let foundation = fields[0].to_string();
        let component = fields[1]
            .parse::<u16>()
            .map_err(|_| invalid("component", fields[1]))?;
        let protocol = fields[2].parse::<TransportProtocol>()?;
        let priority = fields[3]
            .parse::<u32>()
            .map_err(|_| invalid("priority", fields[3]))?;
        let ip = fields[4]
            .parse::<IpAddr>()
            .map_err(|_| invalid("address", fields[4]))?;
        let port = fields[5]
            .parse::<u16>()
            .map_err(|_| invalid("port", fields[5]))?;
        if fields[6] != "typ" {
            return Err(invalid("typ", fields[6]));
        }
        let kind = fields[7].parse::<CandidateType>()?;

        let mut related_ip = None;
        let mut related_port = None;
        for pair in fields[8..].chunks(2) {
            match pair {
                ["raddr", value] => {
                    related_ip = Some(
                        value
                            .parse::<IpAddr>()
                            .map_err(|_| invalid("raddr", value))?,
                    )
                }
                ["rport", value] => {
                    related_port =
                        Some(value.parse::<u16>().map_err(|_| invalid("rport", value))?)
                }
                // Unknown extensions (generation, network-id, ...) are ignored.
                _ => {}
            }
        }
        let related = match (related_ip, related_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        };

        Ok(Self {
            foundation,
            component,
            protocol,
            priority,
            address: SocketAddr::new(ip, port),
            kind,
            related,
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol.as_str(),
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind.as_str()
        )?;
        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

impl FromStr for IceCandidate {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Candidates sharing type, base IP and protocol share a foundation.
fn foundation_for(kind: CandidateType, base: IpAddr, protocol: TransportProtocol) -> String {
    // FNV-1a, stable across processes.
    let mut hash: u32 = 0x811c9dc5;
    let key = format!("{}|{}|{}", kind.as_str(), base, protocol.as_str());
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash.to_string()
}
