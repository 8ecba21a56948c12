use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

use crate::ice::SelectedPair;
use crate::state::{ConnectionState, IceConnectionState, IceGatheringState, SignalingState};

/// Live transport counters, shared by the workers of one transport.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Media packets discarded by simulated loss.
    pub packets_discarded: AtomicU64,
    pub packets_rejected: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub decode_failures: AtomicU64,
    pub nacks_sent: AtomicU64,
    pub retransmissions: AtomicU64,
    pub fec_recoveries: AtomicU64,
    pub rtt_us: AtomicU64,
}

impl TransportCounters {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let rtt_us = load(&self.rtt_us);
        TransportStats {
            packets_sent: load(&self.packets_sent),
            bytes_sent: load(&self.bytes_sent),
            packets_received: load(&self.packets_received),
            bytes_received: load(&self.bytes_received),
            packets_discarded: load(&self.packets_discarded),
            packets_rejected: load(&self.packets_rejected),
            frames_sent: load(&self.frames_sent),
            frames_decoded: load(&self.frames_decoded),
            frames_dropped: load(&self.frames_dropped),
            decode_failures: load(&self.decode_failures),
            nacks_sent: load(&self.nacks_sent),
            retransmissions: load(&self.retransmissions),
            fec_recoveries: load(&self.fec_recoveries),
            rtt_ms: (rtt_us > 0).then(|| rtt_us as f64 / 1000.0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_discarded: u64,
    /// Replayed, undecryptable or malformed packets.
    pub packets_rejected: u64,
    pub frames_sent: u64,
    pub frames_decoded: u64,
    /// Frames lost to jitter buffer overflow, lateness or a full event queue.
    pub frames_dropped: u64,
    pub decode_failures: u64,
    pub nacks_sent: u64,
    pub retransmissions: u64,
    pub fec_recoveries: u64,
    pub rtt_ms: Option<f64>,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub connection: ConnectionState,
    pub signaling: SignalingState,
    pub ice_gathering: IceGatheringState,
    pub ice: IceConnectionState,
    pub selected_pair: Option<SelectedPair>,
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub transport: TransportStats,
    /// Events not delivered because the consumer fell behind.
    pub events_dropped: u64,
}
