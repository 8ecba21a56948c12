//! Protobuf messages carried inside media and control datagrams.
//!
//! These are declared with `prost` derives directly; there is no `.proto`
//! build step. Tags are part of the wire contract and must not be reused.

/// Top-level payload of a media or control datagram.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Content", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub content: Option<envelope::Content>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "1")]
        Chunk(super::MediaChunk),
        #[prost(message, tag = "2")]
        Fec(super::FecParity),
        #[prost(message, tag = "3")]
        Nack(super::Nack),
        #[prost(message, tag = "4")]
        Ping(super::Ping),
        #[prost(message, tag = "5")]
        Pong(super::Pong),
        #[prost(message, tag = "6")]
        TrackState(super::TrackState),
        #[prost(message, tag = "7")]
        Bye(super::Bye),
    }
}

/// One slice of an encoded media frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MediaChunk {
    /// Media section index the chunk belongs to.
    #[prost(uint32, tag = "1")]
    pub mid: u32,
    /// Per-track transmission sequence number, used for NACK and FEC.
    #[prost(uint64, tag = "2")]
    pub seq: u64,
    #[prost(uint64, tag = "3")]
    pub frame_id: u64,
    #[prost(uint32, tag = "4")]
    pub chunk_index: u32,
    #[prost(uint32, tag = "5")]
    pub chunk_count: u32,
    #[prost(uint64, tag = "6")]
    pub timestamp_us: u64,
    #[prost(bool, tag = "7")]
    pub keyframe: bool,
    #[prost(bytes = "vec", tag = "8")]
    pub payload: Vec<u8>,
}

/// XOR parity over a group of serialized chunks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FecParity {
    #[prost(uint32, tag = "1")]
    pub mid: u32,
    #[prost(uint64, tag = "2")]
    pub group_id: u64,
    /// Sequence number of the first protected chunk.
    #[prost(uint64, tag = "3")]
    pub first_seq: u64,
    /// Number of shards including the parity shard.
    #[prost(uint32, tag = "4")]
    pub shard_count: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
    #[prost(uint32, repeated, tag = "6")]
    pub shard_lengths: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Nack {
    #[prost(uint32, tag = "1")]
    pub mid: u32,
    #[prost(uint64, repeated, tag = "2")]
    pub seqs: Vec<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub timestamp_us: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    /// Echo of the ping timestamp.
    #[prost(uint64, tag = "1")]
    pub timestamp_us: u64,
}

/// Sender-side enable/disable of a track without renegotiation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackState {
    #[prost(uint32, tag = "1")]
    pub mid: u32,
    #[prost(bool, tag = "2")]
    pub enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Bye {
    #[prost(string, tag = "1")]
    pub reason: String,
}

impl Envelope {
    pub fn new(content: envelope::Content) -> Self {
        Self {
            content: Some(content),
        }
    }
}
