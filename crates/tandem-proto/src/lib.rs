//! Tandem wire formats.
//!
//! This crate provides:
//! - Datagram framing for handshake, media and control channels
//! - STUN/TURN message codec used by traversal and connectivity checks
//! - ICE candidate grammar and priority computation
//! - Session description (SDP) rendering and parsing
//! - Media chunking and XOR parity FEC

#![forbid(unsafe_code)]

pub mod candidate;
pub mod messages;
pub mod sdp;
pub mod stun;

pub use candidate::{CandidateError, CandidateType, IceCandidate, TransportProtocol};
pub use messages::*;
pub use sdp::{
    Direction, MediaSection, MediaType, SdpError, SdpType, SessionDescription, SessionParams,
};
pub use stun::{StunClass, StunError, StunMessage, StunMethod};

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TANDEM_VERSION: u16 = 1;

/// Datagram header
/// [Magic (2B)][Version (2B)][Channel (1B)][PacketID (8B)][Csum (2B)]
pub const PACKET_HEADER_SIZE: usize = 15;

pub const TANDEM_MAGIC: [u8; 2] = [0x54, 0x44]; // 'TD'

/// Largest media payload placed in a single chunk. Keeps datagrams under a
/// 1280-byte path MTU after framing, AEAD tag and protobuf overhead.
pub const DEFAULT_CHUNK_PAYLOAD: usize = 1100;

/// Upper bound on a received datagram.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("packet too short: {0}")]
    TooShort(usize),
    #[error("invalid magic: {0:?}")]
    InvalidMagic([u8; 2]),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("unknown channel: {0}")]
    UnknownChannel(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("protobuf decode error: {0}")]
    ProtoDecode(String),
    #[error("empty envelope")]
    EmptyEnvelope,
}

/// Logical channel of a tandem datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Noise handshake messages (plaintext framing, Noise-protected content).
    Handshake = 0x01,
    /// Encrypted media chunks and FEC parity.
    Media = 0x02,
    /// Encrypted feedback and liveness (NACK, ping, track state, bye).
    Control = 0x03,
}

impl TryFrom<u8> for Channel {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::Media),
            0x03 => Ok(Self::Control),
            other => Err(ProtoError::UnknownChannel(other)),
        }
    }
}

/// Classification of a raw datagram received on the session socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    Stun,
    Tandem,
    Unknown,
}

/// Demultiplex a datagram by its leading bytes.
pub fn classify_datagram(buf: &[u8]) -> DatagramKind {
    if stun::looks_like_stun(buf) {
        DatagramKind::Stun
    } else if buf.len() >= 2 && buf[0..2] == TANDEM_MAGIC {
        DatagramKind::Tandem
    } else {
        DatagramKind::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalPacket {
    pub version: u16,
    pub channel: Channel,
    pub packet_id: u64,
    pub payload: Bytes,
}

impl PhysicalPacket {
    pub fn new(channel: Channel, packet_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            version: TANDEM_VERSION,
            channel,
            packet_id,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_slice(&TANDEM_MAGIC);
        buf.put_u16(self.version);
        buf.put_u8(self.channel as u8);
        buf.put_u64(self.packet_id);

        let csum_pos = buf.len();
        let mut state = crc16::State::<crc16::KERMIT>::new();
        state.update(&buf[..csum_pos]);
        buf.put_u16(state.get());

        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(bytes: Bytes) -> Result<Self, ProtoError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(ProtoError::TooShort(bytes.len()));
        }

        if bytes[0..2] != TANDEM_MAGIC {
            return Err(ProtoError::InvalidMagic([bytes[0], bytes[1]]));
        }

        let version = u16::from_be_bytes([bytes[2], bytes[3]]);
        if version != TANDEM_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let mut state = crc16::State::<crc16::KERMIT>::new();
        state.update(&bytes[..13]);
        let csum = u16::from_be_bytes([bytes[13], bytes[14]]);
        if state.get() != csum {
            return Err(ProtoError::ChecksumMismatch);
        }

        let channel = Channel::try_from(bytes[4])?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[5..13]);
        let packet_id = u64::from_be_bytes(id);

        let mut payload = bytes;
        payload.advance(PACKET_HEADER_SIZE);

        Ok(Self {
            version,
            channel,
            packet_id,
            payload,
        })
    }
}

/// Split an encoded frame into chunks of at most `max_payload` bytes.
///
/// Sequence numbers are assigned consecutively from `first_seq`.
pub fn chunk_media_payload(
    mid: u32,
    frame_id: u64,
    timestamp_us: u64,
    keyframe: bool,
    payload: &[u8],
    max_payload: usize,
    first_seq: u64,
) -> Result<Vec<MediaChunk>, ChunkError> {
    if max_payload == 0 {
        return Err(ChunkError::InvalidMaxPayload);
    }
    // An empty frame still occupies one chunk so the receiver sees it.
    let chunk_count = payload.len().div_ceil(max_payload).max(1);
    if chunk_count > u32::MAX as usize {
        return Err(ChunkError::TooManyChunks);
    }
    let mut chunks = Vec::with_capacity(chunk_count);
    let slices: Vec<&[u8]> = if payload.is_empty() {
        vec![payload]
    } else {
        payload.chunks(max_payload).collect()
    };
    for (index, slice) in slices.into_iter().enumerate() {
        chunks.push(MediaChunk {
            mid,
            seq: first_seq + index as u64,
            frame_id,
            chunk_index: index as u32,
            chunk_count: chunk_count as u32,
            timestamp_us,
            keyframe,
            payload: slice.to_vec(),
        });
    }
    Ok(chunks)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("max payload must be non-zero")]
    InvalidMaxPayload,
    #[error("too many chunks for a single frame")]
    TooManyChunks,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FecError {
    #[error("shard count must be at least 2")]
    InvalidShardCount,
}

/// Accumulates serialized chunks of one track and emits a parity packet
/// every `shard_count - 1` chunks.
#[derive(Debug, Clone)]
pub struct FecBuilder {
    mid: u32,
    shard_count: u32,
    group_id: u64,
    first_seq: Option<u64>,
    payloads: Vec<Vec<u8>>,
    shard_lengths: Vec<u32>,
    max_payload_len: usize,
}

impl FecBuilder {
    pub fn new(mid: u32, shard_count: u32) -> Result<Self, FecError> {
        if shard_count < 2 {
            return Err(FecError::InvalidShardCount);
        }
        Ok(Self {
            mid,
            shard_count,
            group_id: 0,
            first_seq: None,
            payloads: Vec::with_capacity(shard_count as usize),
            shard_lengths: Vec::with_capacity(shard_count as usize),
            max_payload_len: 0,
        })
    }

    /// Add a chunk. Sequence numbers within a group must be consecutive;
    /// a gap flushes the partial group.
    pub fn push(&mut self, seq: u64, serialized: &[u8]) -> Option<FecParity> {
        if let Some(first) = self.first_seq {
            if seq != first + self.payloads.len() as u64 {
                self.reset();
            }
        }
        if self.payloads.is_empty() {
            self.first_seq = Some(seq);
        }

        self.max_payload_len = self.max_payload_len.max(serialized.len());
        self.shard_lengths.push(serialized.len() as u32);
        self.payloads.push(serialized.to_vec());

        if self.payloads.len() == (self.shard_count - 1) as usize {
            let parity = FecParity {
                mid: self.mid,
                group_id: self.group_id,
                first_seq: self.first_seq.unwrap_or(seq),
                shard_count: self.shard_count,
                payload: xor_parity(&self.payloads, self.max_payload_len),
                shard_lengths: self.shard_lengths.clone(),
            };
            self.group_id = self.group_id.wrapping_add(1);
            self.reset();
            Some(parity)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.payloads.clear();
        self.shard_lengths.clear();
        self.max_payload_len = 0;
        self.first_seq = None;
    }
}

fn xor_parity(payloads: &[Vec<u8>], max_len: usize) -> Vec<u8> {
    let mut parity = vec![0u8; max_len];
    for payload in payloads {
        xor_in_place(&mut parity, payload);
    }
    parity
}

/// XOR `payload` into `target`, truncating to the shorter of the two.
pub fn xor_in_place(target: &mut [u8], payload: &[u8]) {
    for (t, p) in target.iter_mut().zip(payload.iter()) {
        *t ^= p;
    }
}

pub fn encode_msg(msg: &Envelope) -> Vec<u8> {
    use prost::Message as _;
    msg.encode_to_vec()
}

pub fn decode_msg(bytes: &[u8]) -> Result<Envelope, ProtoError> {
    use prost::Message as _;
    let envelope =
        Envelope::decode(bytes).map_err(|err| ProtoError::ProtoDecode(err.to_string()))?;
    if envelope.content.is_none() {
        return Err(ProtoError::EmptyEnvelope);
    }
    Ok(envelope)
}

pub fn encode_chunk(chunk: &MediaChunk) -> Vec<u8> {
    use prost::Message as _;
    chunk.encode_to_vec()
}

pub fn decode_chunk(bytes: &[u8]) -> Result<MediaChunk, ProtoError> {
    use prost::Message as _;
    MediaChunk::decode(bytes).map_err(|err| ProtoError::ProtoDecode(err.to_string()))
}
