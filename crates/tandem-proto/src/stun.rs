//! STUN message codec (RFC 5389) with the ICE and TURN attributes the
//! session engine needs.
//!
//! Used for three things:
//! - Binding requests to traversal servers (server-reflexive discovery)
//! - Allocate requests to relay servers (relay candidates)
//! - ICE connectivity checks between peers, and Send/Data indications when
//!   a check or datagram travels through a relay

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

pub const STUN_MAGIC_COOKIE: u32 = 0x2112A442;
pub const STUN_HEADER_SIZE: usize = 20;

pub type TransactionId = [u8; 12];

/// Attribute type codes.
pub mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const SOFTWARE: u16 = 0x8022;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

/// IANA protocol number for UDP in REQUESTED-TRANSPORT.
pub const TRANSPORT_UDP: u8 = 17;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("STUN message too short: {0} bytes")]
    TooShort(usize),
    #[error("not a STUN message (first byte 0x{0:02x})")]
    NotStun(u8),
    #[error("invalid magic cookie 0x{0:08x}")]
    InvalidCookie(u32),
    #[error("declared length {declared} does not fit {available} bytes")]
    LengthMismatch { declared: usize, available: usize },
    #[error("unknown method 0x{0:03x}")]
    UnknownMethod(u16),
    #[error("malformed attribute 0x{0:04x}")]
    MalformedAttribute(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StunMethod {
    Binding = 0x001,
    Allocate = 0x003,
    Refresh = 0x004,
    Send = 0x006,
    Data = 0x007,
    CreatePermission = 0x008,
}

impl TryFrom<u16> for StunMethod {
    type Error = StunError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x001 => Ok(Self::Binding),
            0x003 => Ok(Self::Allocate),
            0x004 => Ok(Self::Refresh),
            0x006 => Ok(Self::Send),
            0x007 => Ok(Self::Data),
            0x008 => Ok(Self::CreatePermission),
            other => Err(StunError::UnknownMethod(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl StunClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

fn pack_type(method: StunMethod, class: StunClass) -> u16 {
    let m = method as u16;
    let c = class.bits();
    ((m & 0x0F80) << 2) | ((m & 0x0070) << 1) | (m & 0x000F) | ((c & 0b10) << 7) | ((c & 0b01) << 4)
}

fn unpack_type(raw: u16) -> Result<(StunMethod, StunClass), StunError> {
    let method = (raw & 0x000F) | ((raw & 0x00E0) >> 1) | ((raw & 0x3E00) >> 2);
    let class = ((raw >> 7) & 0b10) | ((raw >> 4) & 0b01);
    Ok((StunMethod::try_from(method)?, StunClass::from_bits(class)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    Username(String),
    Priority(u32),
    UseCandidate,
    IceControlling(u64),
    IceControlled(u64),
    ErrorCode { code: u16, reason: String },
    Lifetime(u32),
    RequestedTransport(u8),
    Data(Vec<u8>),
    Software(String),
    Unknown { kind: u16, value: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub method: StunMethod,
    pub class: StunClass,
    pub transaction_id: TransactionId,
    pub attributes: Vec<StunAttribute>,
}

/// Fresh random transaction id.
pub fn new_transaction_id() -> TransactionId {
    use rand::RngCore;
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    transaction_id
}

/// Cheap check used for demultiplexing: top two bits zero and magic cookie
/// at offset 4.
pub fn looks_like_stun(buf: &[u8]) -> bool {
    buf.len() >= STUN_HEADER_SIZE
        && buf[0] & 0xC0 == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == STUN_MAGIC_COOKIE
}

impl StunMessage {
    pub fn new(method: StunMethod, class: StunClass) -> Self {
        Self {
            method,
            class,
            transaction_id: new_transaction_id(),
            attributes: Vec::new(),
        }
    }

    pub fn binding_request() -> Self {
        Self::new(StunMethod::Binding, StunClass::Request)
    }

    /// Success response to `request` reporting the address it came from.
    pub fn binding_success(request: &StunMessage, observed: SocketAddr) -> Self {
        Self {
            method: StunMethod::Binding,
            class: StunClass::SuccessResponse,
            transaction_id: request.transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(observed)],
        }
    }

    pub fn error_response(request: &StunMessage, code: u16, reason: &str) -> Self {
        Self {
            method: request.method,
            class: StunClass::ErrorResponse,
            transaction_id: request.transaction_id,
            attributes: vec![StunAttribute::ErrorCode {
                code,
                reason: reason.to_string(),
            }],
        }
    }

    /// TURN Allocate request for a UDP relay.
    pub fn allocate_request(username: Option<&str>) -> Self {
        let mut msg = Self::new(StunMethod::Allocate, StunClass::Request);
        msg.attributes
            .push(StunAttribute::RequestedTransport(TRANSPORT_UDP));
        if let Some(user) = username {
            msg.attributes.push(StunAttribute::Username(user.to_string()));
        }
        msg
    }

    /// TURN Send indication wrapping `data` for `peer`.
    pub fn send_indication(peer: SocketAddr, data: &[u8]) -> Self {
        let mut msg = Self::new(StunMethod::Send, StunClass::Indication);
        msg.attributes.push(StunAttribute::XorPeerAddress(peer));
        msg.attributes.push(StunAttribute::Data(data.to_vec()));
        msg
    }

    /// TURN Data indication as a relay server would emit it.
    pub fn data_indication(peer: SocketAddr, data: &[u8]) -> Self {
        let mut msg = Self::new(StunMethod::Data, StunClass::Indication);
        msg.attributes.push(StunAttribute::XorPeerAddress(peer));
        msg.attributes.push(StunAttribute::Data(data.to_vec()));
        msg
    }

    pub fn with_attribute(mut self, attribute: StunAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn is_binding_request(&self) -> bool {
        self.method == StunMethod::Binding && self.class == StunClass::Request
    }

    /// Reflexive address reported by the server, preferring XOR-MAPPED-ADDRESS.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes
            .iter()
            .find_map(|a| match a {
                StunAttribute::XorMappedAddress(addr) => Some(*addr),
                _ => None,
            })
            .or_else(|| {
                self.attributes.iter().find_map(|a| match a {
                    StunAttribute::MappedAddress(addr) => Some(*addr),
                    _ => None,
                })
            })
    }

    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Data(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Username(user) => Some(user.as_str()),
            _ => None,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::UseCandidate))
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        for attribute in &self.attributes {
            encode_attribute(&mut body, attribute, &self.transaction_id);
        }

        let mut buf = Vec::with_capacity(STUN_HEADER_SIZE + body.len());
        buf.extend_from_slice(&pack_type(self.method, self.class).to_be_bytes());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        buf.extend_from_slice(&body);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, StunError> {
        if buf.len() < STUN_HEADER_SIZE {
            return Err(StunError::TooShort(buf.len()));
        }
        if buf[0] & 0xC0 != 0 {
            return Err(StunError::NotStun(buf[0]));
        }

        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != STUN_MAGIC_COOKIE {
            return Err(StunError::InvalidCookie(cookie));
        }
        if STUN_HEADER_SIZE + length > buf.len() {
            return Err(StunError::LengthMismatch {
                declared: length,
                available: buf.len() - STUN_HEADER_SIZE,
            });
        }

        let (method, class) = unpack_type(raw_type)?;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);

        let mut attributes = Vec::new();
        let mut pos = STUN_HEADER_SIZE;
        let end = STUN_HEADER_SIZE + length;

        while pos + 4 <= end {
            let kind = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            pos += 4;

            if pos + attr_len > end {
                return Err(StunError::MalformedAttribute(kind));
            }

            let value = &buf[pos..pos + attr_len];
            attributes.push(decode_attribute(kind, value, &transaction_id)?);

            pos += attr_len;
            if pos % 4 != 0 {
                pos += 4 - (pos % 4);
            }
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }
}

fn put_attribute(buf: &mut Vec<u8>, kind: u16, value: &[u8]) {
    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn encode_attribute(buf: &mut Vec<u8>, attribute: &StunAttribute, txid: &TransactionId) {
    match attribute {
        StunAttribute::MappedAddress(addr) => {
            put_attribute(buf, attr::MAPPED_ADDRESS, &encode_address(*addr, None))
        }
        StunAttribute::XorMappedAddress(addr) => put_attribute(
            buf,
            attr::XOR_MAPPED_ADDRESS,
            &encode_address(*addr, Some(txid)),
        ),
        StunAttribute::XorRelayedAddress(addr) => put_attribute(
            buf,
            attr::XOR_RELAYED_ADDRESS,
            &encode_address(*addr, Some(txid)),
        ),
        StunAttribute::XorPeerAddress(addr) => put_attribute(
            buf,
            attr::XOR_PEER_ADDRESS,
            &encode_address(*addr, Some(txid)),
        ),
        StunAttribute::Username(user) => put_attribute(buf, attr::USERNAME, user.as_bytes()),
        StunAttribute::Priority(p) => put_attribute(buf, attr::PRIORITY, &p.to_be_bytes()),
        StunAttribute::UseCandidate => put_attribute(buf, attr::USE_CANDIDATE, &[]),
        StunAttribute::IceControlling(tie) => {
            put_attribute(buf, attr::ICE_CONTROLLING, &tie.to_be_bytes())
        }
        StunAttribute::IceControlled(tie) => {
            put_attribute(buf, attr::ICE_CONTROLLED, &tie.to_be_bytes())
        }
        StunAttribute::ErrorCode { code, reason } => {
            let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
            value.extend_from_slice(reason.as_bytes());
            put_attribute(buf, attr::ERROR_CODE, &value);
        }
        StunAttribute::Lifetime(secs) => put_attribute(buf, attr::LIFETIME, &secs.to_be_bytes()),
        StunAttribute::RequestedTransport(proto) => {
            put_attribute(buf, attr::REQUESTED_TRANSPORT, &[*proto, 0, 0, 0])
        }
        StunAttribute::Data(data) => put_attribute(buf, attr::DATA, data),
        StunAttribute::Software(name) => put_attribute(buf, attr::SOFTWARE, name.as_bytes()),
        StunAttribute::Unknown { kind, value } => put_attribute(buf, *kind, value),
    }
}

fn decode_attribute(
    kind: u16,
    value: &[u8],
    txid: &TransactionId,
) -> Result<StunAttribute, StunError> {
    let fixed = |n: usize| {
        if value.len() < n {
            Err(StunError::MalformedAttribute(kind))
        } else {
            Ok(())
        }
    };
    let text = || {
        String::from_utf8(value.to_vec()).map_err(|_| StunError::MalformedAttribute(kind))
    };

    Ok(match kind {
        attr::MAPPED_ADDRESS => StunAttribute::MappedAddress(decode_address(kind, value, None)?),
        attr::XOR_MAPPED_ADDRESS => {
            StunAttribute::XorMappedAddress(decode_address(kind, value, Some(txid))?)
        }
        attr::XOR_RELAYED_ADDRESS => {
            StunAttribute::XorRelayedAddress(decode_address(kind, value, Some(txid))?)
        }
        attr::XOR_PEER_ADDRESS => {
            StunAttribute::XorPeerAddress(decode_address(kind, value, Some(txid))?)
        }
        attr::USERNAME => StunAttribute::Username(text()?),
        attr::SOFTWARE => StunAttribute::Software(text()?),
        attr::PRIORITY => {
            fixed(4)?;
            StunAttribute::Priority(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        attr::USE_CANDIDATE => StunAttribute::UseCandidate,
        attr::ICE_CONTROLLING | attr::ICE_CONTROLLED => {
            fixed(8)?;
            let mut tie = [0u8; 8];
            tie.copy_from_slice(&value[..8]);
            let tie = u64::from_be_bytes(tie);
            if kind == attr::ICE_CONTROLLING {
                StunAttribute::IceControlling(tie)
            } else {
                StunAttribute::IceControlled(tie)
            }
        }
        attr::ERROR_CODE => {
            fixed(4)?;
            let code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
            let reason = String::from_utf8_lossy(&value[4..]).into_owned();
            StunAttribute::ErrorCode { code, reason }
        }
        attr::LIFETIME => {
            fixed(4)?;
            StunAttribute::Lifetime(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        attr::REQUESTED_TRANSPORT => {
            fixed(1)?;
            StunAttribute::RequestedTransport(value[0])
        }
        attr::DATA => StunAttribute::Data(value.to_vec()),
        other => StunAttribute::Unknown {
            kind: other,
            value: value.to_vec(),
        },
    })
}

fn xor_mask(txid: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(txid);
    mask
}

fn encode_address(addr: SocketAddr, xor_with: Option<&TransactionId>) -> Vec<u8> {
    let mask = xor_with.map(xor_mask);
    let port = match mask {
        Some(_) => addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if let Some(mask) = mask {
                for (o, m) in octets.iter_mut().zip(mask.iter()) {
                    *o ^= m;
                }
            }
            value.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&port.to_be_bytes());
            let mut octets = ip.octets();
            if let Some(mask) = mask {
                for (o, m) in octets.iter_mut().zip(mask.iter()) {
                    *o ^= m;
                }
            }
            value.extend_from_slice(&octets);
        }
    }
    value
}

fn decode_address(
    kind: u16,
    value: &[u8],
    xor_with: Option<&TransactionId>,
) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::MalformedAttribute(kind));
    }
    let mask = xor_with.map(xor_mask);
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if mask.is_some() {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }
    match family {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if let Some(mask) = mask {
                for (o, m) in octets.iter_mut().zip(mask.iter()) {
                    *o ^= m;
                }
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(StunError::MalformedAttribute(kind));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(mask) = mask {
                for (o, m) in octets.iter_mut().zip(mask.iter()) {
                    *o ^= m;
                }
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::MalformedAttribute(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_header_layout() {
        let msg = StunMessage::binding_request();
        let bytes = msg.encode();
        assert_eq!(bytes.len(), STUN_HEADER_SIZE);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 0x00]);
        assert_eq!(&bytes[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&bytes[8..20], &msg.transaction_id);
        assert!(looks_like_stun(&bytes));
    }

    #[test]
    fn transaction_ids_are_random() {
        let a = StunMessage::binding_request();
        let b = StunMessage::binding_request();
        assert_ne!(a.transaction_id, b.transaction_id);
    }

    #[test]
    fn message_type_packing() {
        assert_eq!(pack_type(StunMethod::Binding, StunClass::SuccessResponse), 0x0101);
        assert_eq!(pack_type(StunMethod::Binding, StunClass::ErrorResponse), 0x0111);
        assert_eq!(pack_type(StunMethod::Allocate, StunClass::Request), 0x0003);
        assert_eq!(pack_type(StunMethod::Send, StunClass::Indication), 0x0016);
        assert_eq!(pack_type(StunMethod::Data, StunClass::Indication), 0x0017);
        assert_eq!(
            unpack_type(0x0103).unwrap(),
            (StunMethod::Allocate, StunClass::SuccessResponse)
        );
    }

    #[test]
    fn xor_mapped_address_v4_matches_rfc_vector() {
        // RFC 5769 2.2: 192.0.2.1:32853
        let txid = [
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ];
        let value = [0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43];
        let addr = decode_address(attr::XOR_MAPPED_ADDRESS, &value, Some(&txid)).unwrap();
        assert_eq!(addr, "192.0.2.1:32853".parse().unwrap());
        assert_eq!(encode_address(addr, Some(&txid)), value.to_vec());
    }

    #[test]
    fn binding_success_carries_observed_address() {
        let request = StunMessage::binding_request();
        let observed: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let response = StunMessage::binding_success(&request, observed);
        let decoded = StunMessage::decode(&response.encode()).unwrap();
        assert_eq!(decoded.class, StunClass::SuccessResponse);
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert_eq!(decoded.mapped_address(), Some(observed));
    }

    #[test]
    fn ipv6_address_survives_encoding() {
        let request = StunMessage::binding_request();
        let observed: SocketAddr = "[2001:db8::42]:5000".parse().unwrap();
        let response = StunMessage::binding_success(&request, observed);
        let decoded = StunMessage::decode(&response.encode()).unwrap();
        assert_eq!(decoded.mapped_address(), Some(observed));
    }

    #[test]
    fn ice_check_attributes() {
        let msg = StunMessage::binding_request()
            .with_attribute(StunAttribute::Username("abcd:efgh".into()))
            .with_attribute(StunAttribute::Priority(1_862_270_975))
            .with_attribute(StunAttribute::IceControlling(0xDEAD_BEEF))
            .with_attribute(StunAttribute::UseCandidate);
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.is_binding_request());
        assert_eq!(decoded.username(), Some("abcd:efgh"));
        assert_eq!(decoded.priority(), Some(1_862_270_975));
        assert!(decoded.use_candidate());
        assert!(decoded
            .attributes
            .contains(&StunAttribute::IceControlling(0xDEAD_BEEF)));
    }

    #[test]
    fn error_code_round_trip() {
        let request = StunMessage::binding_request();
        let err = StunMessage::error_response(&request, 487, "Role Conflict");
        let decoded = StunMessage::decode(&err.encode()).unwrap();
        assert_eq!(decoded.class, StunClass::ErrorResponse);
        assert_eq!(decoded.error_code(), Some((487, "Role Conflict")));
    }

    #[test]
    fn send_indication_wraps_payload() {
        let peer: SocketAddr = "198.51.100.2:6000".parse().unwrap();
        let msg = StunMessage::send_indication(peer, b"odd-len");
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.method, StunMethod::Send);
        assert_eq!(decoded.class, StunClass::Indication);
        assert_eq!(decoded.peer_address(), Some(peer));
        assert_eq!(decoded.data(), Some(&b"odd-len"[..]));
    }

    #[test]
    fn allocate_success_exposes_relay() {
        let request = StunMessage::allocate_request(Some("user"));
        let relay: SocketAddr = "192.0.2.15:49152".parse().unwrap();
        let response = StunMessage {
            method: StunMethod::Allocate,
            class: StunClass::SuccessResponse,
            transaction_id: request.transaction_id,
            attributes: vec![
                StunAttribute::XorRelayedAddress(relay),
                StunAttribute::XorMappedAddress("203.0.113.9:1000".parse().unwrap()),
                StunAttribute::Lifetime(600),
            ],
        };
        let decoded = StunMessage::decode(&response.encode()).unwrap();
        assert_eq!(decoded.relayed_address(), Some(relay));
    }

    #[test]
    fn unknown_attributes_are_kept_and_padded() {
        let msg = StunMessage::binding_request().with_attribute(StunAttribute::Unknown {
            kind: 0xC001,
            value: vec![1, 2, 3],
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len() % 4, 0);
        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.attributes.len(), 1);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(StunMessage::decode(&[0u8; 4]), Err(StunError::TooShort(4)));
        let mut bytes = StunMessage::binding_request().encode();
        bytes[4] = 0;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::InvalidCookie(_))
        ));
        let mut bytes = StunMessage::binding_request().encode();
        bytes[3] = 40;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::LengthMismatch { .. })
        ));
    }
}
