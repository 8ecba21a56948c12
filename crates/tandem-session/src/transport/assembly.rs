use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use tandem_proto::{decode_chunk, encode_chunk, xor_in_place, FecParity, MediaChunk};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Chunks per frame accepted before a frame is considered hostile.
const MAX_CHUNKS_PER_FRAME: u32 = 4096;
/// Completed frame ids remembered to reject late duplicates.
const COMPLETED_MEMORY: usize = 64;
pub const NACK_WINDOW_SIZE: u64 = 128;
const MAX_FEC_CACHE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub mid: u32,
    pub frame_id: u64,
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

struct Partial {
    first_seen: Instant,
    timestamp_us: u64,
    keyframe: bool,
    chunks: Vec<Option<Vec<u8>>>,
}

/// Rebuilds frames from chunks. Incomplete frames expire after `timeout`.
pub struct FrameAssembler {
    mid: u32,
    timeout: Duration,
    frames: HashMap<u64, Partial>,
    completed: VecDeque<u64>,
    expired: u64,
}

impl FrameAssembler {
    pub fn new(mid: u32, timeout: Duration) -> Self {
        Self {
            mid,
            timeout,
            frames: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_MEMORY),
            expired: 0,
        }
    }

    pub fn push(&mut self, chunk: MediaChunk, now: Instant) -> Option<AssembledFrame> {
        let before = self.frames.len();
        let timeout = self.timeout;
        self.frames
            .retain(|_, frame| now.saturating_duration_since(frame.first_seen) < timeout);
        self.expired += (before - self.frames.len()) as u64;

        if chunk.chunk_count == 0
            || chunk.chunk_count > MAX_CHUNKS_PER_FRAME
            || chunk.chunk_index >= chunk.chunk_count
        {
            debug!(frame = chunk.frame_id, "dropping chunk with bad index");
            return None;
        }
        if self.completed.contains(&chunk.frame_id) {
            trace!(frame = chunk.frame_id, "chunk for a completed frame");
            return None;
        }

        let entry = self.frames.entry(chunk.frame_id).or_insert_with(|| Partial {
            first_seen: now,
            timestamp_us: chunk.timestamp_us,
            keyframe: chunk.keyframe,
            chunks: vec![None; chunk.chunk_count as usize],
        });
        if entry.chunks.len() != chunk.chunk_count as usize {
            debug!(frame = chunk.frame_id, "chunk count changed mid-frame");
            return None;
        }
        entry.chunks[chunk.chunk_index as usize] = Some(chunk.payload);

        if !entry.chunks.iter().all(Option::is_some) {
            return None;
        }
        let partial = self.frames.remove(&chunk.frame_id)?;
        let mut data = Vec::new();
        for part in partial.chunks.into_iter().flatten() {
            data.extend_from_slice(&part);
        }
        if self.completed.len() == COMPLETED_MEMORY {
            self.completed.pop_front();
        }
        self.completed.push_back(chunk.frame_id);

        Some(AssembledFrame {
            mid: self.mid,
            frame_id: chunk.frame_id,
            timestamp_us: partial.timestamp_us,
            keyframe: partial.keyframe,
            data,
        })
    }

    /// Frames abandoned because chunks never arrived.
    pub fn expired(&self) -> u64 {
        self.expired
    }
}

/// Received chunks by sequence number, kept for parity recovery.
pub struct FecCache {
    packets: BTreeMap<u64, Vec<u8>>,
}

impl Default for FecCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FecCache {
    pub fn new() -> Self {
        Self {
            packets: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, chunk: &MediaChunk) {
        if self.packets.len() >= MAX_FEC_CACHE {
            self.packets.pop_first();
        }
        self.packets.insert(chunk.seq, encode_chunk(chunk));
    }

    /// Rebuild the single missing chunk of a parity group, if exactly one
    /// is missing.
    pub fn try_recover(&self, fec: &FecParity) -> Option<MediaChunk> {
        let data_shards = fec.shard_count.checked_sub(1)? as usize;
        if data_shards == 0 || fec.shard_lengths.len() != data_shards {
            return None;
        }

        let mut missing = None;
        let mut recovered = fec.payload.clone();
        for offset in 0..data_shards {
            let seq = fec.first_seq + offset as u64;
            match self.packets.get(&seq) {
                Some(bytes) => xor_in_place(&mut recovered, bytes),
                None if missing.is_none() => missing = Some(offset),
                None => return None,
            }
        }

        let offset = missing?;
        let len = fec.shard_lengths[offset] as usize;
        if len > recovered.len() {
            return None;
        }
        recovered.truncate(len);
        match decode_chunk(&recovered) {
            Ok(chunk) if chunk.seq == fec.first_seq + offset as u64 => {
                debug!(seq = chunk.seq, "recovered chunk from parity");
                Some(chunk)
            }
            Ok(_) | Err(_) => {
                debug!(group = fec.group_id, "parity recovery produced garbage");
                None
            }
        }
    }
}

/// Tracks gaps in chunk sequence numbers.
pub struct NackTracker {
    window: u64,
    highest: Option<u64>,
    received: BTreeSet<u64>,
    missing: BTreeSet<u64>,
}

impl NackTracker {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            highest: None,
            received: BTreeSet::new(),
            missing: BTreeSet::new(),
        }
    }

    /// Record a received sequence number. Returns numbers that just became
    /// missing.
    pub fn on_seq(&mut self, seq: u64) -> Vec<u64> {
        let mut newly_missing = Vec::new();
        match self.highest {
            Some(highest) if seq > highest + 1 => {
                let start = seq.saturating_sub(self.window).max(highest + 1);
                for id in start..seq {
                    if !self.received.contains(&id) && self.missing.insert(id) {
                        newly_missing.push(id);
                    }
                }
                self.highest = Some(seq);
            }
            Some(highest) if seq > highest => self.highest = Some(seq),
            Some(_) => {}
            None => self.highest = Some(seq),
        }

        self.received.insert(seq);
        self.missing.remove(&seq);
        self.evict_old();
        newly_missing
    }

    pub fn missing(&self) -> usize {
        self.missing.len()
    }

    fn evict_old(&mut self) {
        if let Some(highest) = self.highest {
            let cutoff = highest.saturating_sub(self.window);
            self.received = self.received.split_off(&cutoff);
            self.missing = self.missing.split_off(&cutoff);
        }
    }
}
