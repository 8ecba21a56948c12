use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tandem_crypto::PacketCipher;
use tandem_media::{encoder_for, transform, MediaKind, MediaTrack, TransformParams};
use tandem_proto::envelope::Content;
use tandem_proto::{
    chunk_media_payload, encode_chunk, encode_msg, Channel, Envelope, FecBuilder, MediaChunk,
    PhysicalPacket,
};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::Result;
use crate::mux::UdpMux;
use crate::types::TransportCounters;

use super::PeerPath;

/// Seals envelopes and sends them to the current peer path.
pub struct PacketSender {
    mux: Arc<UdpMux>,
    cipher: PacketCipher,
    next_id: AtomicU64,
    path: watch::Receiver<PeerPath>,
    /// Fraction of media packets dropped before sending.
    loss: f32,
    counters: Arc<TransportCounters>,
}

impl PacketSender {
    pub fn new(
        mux: Arc<UdpMux>,
        cipher: PacketCipher,
        path: watch::Receiver<PeerPath>,
        first_packet_id: u64,
        loss: f32,
        counters: Arc<TransportCounters>,
    ) -> Self {
        Self {
            mux,
            cipher,
            next_id: AtomicU64::new(first_packet_id),
            path,
            loss,
            counters,
        }
    }

    /// Id the next packet will carry. A transport rebuilt with the same
    /// cipher continues from here so the peer's replay window stays valid.
    pub fn next_packet_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    pub async fn send(&self, channel: Channel, content: Content) -> Result<()> {
        let packet_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sealed = self
            .cipher
            .encrypt(packet_id, &encode_msg(&Envelope::new(content)))?;
        let wire = PhysicalPacket::new(channel, packet_id, sealed).encode();

        if channel == Channel::Media && self.loss > 0.0 && rand::random::<f32>() < self.loss {
            TransportCounters::bump(&self.counters.packets_discarded);
            return Ok(());
        }

        let path = *self.path.borrow();
        self.mux.send(&wire, path.remote, path.relay).await?;
        TransportCounters::bump(&self.counters.packets_sent);
        TransportCounters::add(&self.counters.bytes_sent, wire.len() as u64);
        Ok(())
    }
}

/// Most recent chunks of one track, for answering NACKs.
pub struct RetransmitCache {
    capacity: usize,
    chunks: VecDeque<MediaChunk>,
}

impl RetransmitCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chunks: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, chunk: MediaChunk) {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    pub fn get(&self, seq: u64) -> Option<&MediaChunk> {
        let first = self.chunks.front()?.seq;
        let idx = usize::try_from(seq.checked_sub(first)?).ok()?;
        self.chunks.get(idx).filter(|c| c.seq == seq)
    }
}

pub type SharedCache = Arc<Mutex<RetransmitCache>>;

/// A local track being sent.
pub struct SendTrack {
    pub mid: u32,
    pub kind: MediaKind,
    pub track: MediaTrack,
    pub fec_group: Option<u32>,
    pub cache: Option<SharedCache>,
    /// Initial state; later toggled through the worker's `enabled` watch.
    pub enabled: bool,
}

pub struct SendWorker {
    pub track: SendTrack,
    pub sender: Arc<PacketSender>,
    pub params: watch::Receiver<TransformParams>,
    pub enabled: watch::Receiver<bool>,
    pub max_payload: usize,
    pub counters: Arc<TransportCounters>,
}

impl SendWorker {
    /// Pull frames from the track until it ends.
    pub async fn run(self) {
        let SendTrack {
            mid,
            kind,
            track,
            fec_group,
            cache,
            ..
        } = self.track;
        let mut reader = track.reader();
        let mut encoder = encoder_for(kind);
        let mut fec = fec_group.and_then(|group| FecBuilder::new(mid, group).ok());
        let mut next_seq: u64 = 0;
        let mut frame_id: u64 = 0;

        while let Some(frame) = reader.next_frame().await {
            if !*self.enabled.borrow() {
                continue;
            }
            let params = *self.params.borrow();
            let frame = if params.is_identity() {
                frame
            } else {
                Arc::new(transform(&frame, params))
            };
            let encoded = match encoder.encode(&frame) {
                Ok(encoded) => encoded,
                Err(e) => {
                    debug!(mid, "encode failed: {}", e);
                    continue;
                }
            };
            let chunks = match chunk_media_payload(
                mid,
                frame_id,
                encoded.timestamp_us,
                encoded.keyframe,
                &encoded.data,
                self.max_payload,
                next_seq,
            ) {
                Ok(chunks) => chunks,
                Err(e) => {
                    debug!(mid, "chunking failed: {}", e);
                    continue;
                }
            };
            next_seq += chunks.len() as u64;
            frame_id += 1;

            for chunk in chunks {
                let parity = fec
                    .as_mut()
                    .and_then(|builder| builder.push(chunk.seq, &encode_chunk(&chunk)));
                if let Some(cache) = &cache {
                    if let Ok(mut cache) = cache.lock() {
                        cache.insert(chunk.clone());
                    }
                }
                if let Err(e) = self.sender.send(Channel::Media, Content::Chunk(chunk)).await {
                    trace!(mid, "send failed: {}", e);
                }
                if let Some(parity) = parity {
                    if let Err(e) = self.sender.send(Channel::Media, Content::Fec(parity)).await {
                        trace!(mid, "parity send failed: {}", e);
                    }
                }
            }
            TransportCounters::bump(&self.counters.frames_sent);
        }
        debug!(mid, "local track ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u64) -> MediaChunk {
        MediaChunk {
            mid: 0,
            seq,
            frame_id: seq,
            chunk_index: 0,
            chunk_count: 1,
            timestamp_us: seq * 10,
            keyframe: true,
            payload: vec![seq as u8],
        }
    }

    #[test]
    fn cache_keeps_the_newest() {
        let mut cache = RetransmitCache::new(3);
        for seq in 0..5 {
            cache.insert(chunk(seq));
        }
        assert!(cache.get(1).is_none());
        assert_eq!(cache.get(2).map(|c| c.seq), Some(2));
        assert_eq!(cache.get(4).map(|c| c.seq), Some(4));
        assert!(cache.get(5).is_none());
    }
}
