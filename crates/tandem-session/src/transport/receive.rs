use std::sync::Arc;
use std::time::Duration;

use tandem_media::{decoder_for, Decoder, MediaKind, TrackWriter};
use tandem_proto::envelope::Content;
use tandem_proto::{Channel, FecParity, MediaChunk, Nack};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::types::TransportCounters;

use super::assembly::{AssembledFrame, FecCache, FrameAssembler, NackTracker, NACK_WINDOW_SIZE};
use super::jitter::{JitterBuffer, JitterConfig};
use super::send::PacketSender;
use super::TransportEvent;

#[derive(Debug)]
pub enum ReceiverInput {
    Chunk(MediaChunk),
    Fec(FecParity),
}

/// A remote track being received.
pub struct ReceiveTrack {
    pub mid: u32,
    pub kind: MediaKind,
    pub writer: TrackWriter,
    pub nack: bool,
}

pub struct ReceiveWorker {
    pub track: ReceiveTrack,
    pub input: mpsc::Receiver<ReceiverInput>,
    pub sender: Arc<PacketSender>,
    pub events: mpsc::Sender<TransportEvent>,
    pub jitter: JitterConfig,
    pub frame_timeout: Duration,
    pub decode_failure_threshold: u32,
    pub counters: Arc<TransportCounters>,
}

impl ReceiveWorker {
    pub async fn run(mut self) {
        let mid = self.track.mid;
        let mut assembler = FrameAssembler::new(mid, self.frame_timeout);
        let mut fec = FecCache::new();
        let mut nack = NackTracker::new(NACK_WINDOW_SIZE);
        let mut jitter = JitterBuffer::new(self.jitter);
        let mut decoder = decoder_for(self.track.kind);
        let mut consecutive_failures: u32 = 0;
        let mut dropped_seen: u64 = 0;

        loop {
            let deadline = jitter.next_deadline();
            tokio::select! {
                input = self.input.recv() => {
                    let Some(input) = input else { break };
                    let now = Instant::now();
                    let chunks = match input {
                        ReceiverInput::Chunk(chunk) => vec![chunk],
                        ReceiverInput::Fec(parity) => match fec.try_recover(&parity) {
                            Some(chunk) => {
                                TransportCounters::bump(&self.counters.fec_recoveries);
                                vec![chunk]
                            }
                            None => Vec::new(),
                        },
                    };
                    for chunk in chunks {
                        fec.insert(&chunk);
                        let missing = nack.on_seq(chunk.seq);
                        if self.track.nack && !missing.is_empty() {
                            self.request_retransmit(missing).await;
                        }
                        if let Some(frame) = assembler.push(chunk, now) {
                            jitter.push(frame, now);
                        }
                    }
                }
                _ = sleep_until(deadline) => {}
            }

            let now = Instant::now();
            while let Some(frame) = jitter.pop_ready(now) {
                if self.deliver(decoder.as_mut(), frame) {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                    if consecutive_failures == self.decode_failure_threshold {
                        warn!(mid, consecutive_failures, "track keeps failing to decode");
                        let _ = self
                            .events
                            .send(TransportEvent::DecodeFailure {
                                mid,
                                consecutive: consecutive_failures,
                            })
                            .await;
                    }
                }
            }

            let dropped = jitter.dropped() + jitter.late();
            if dropped > dropped_seen {
                TransportCounters::add(&self.counters.frames_dropped, dropped - dropped_seen);
                dropped_seen = dropped;
            }
        }
        self.track.writer.end();
        debug!(mid, "remote track ended");
    }

    /// Decode and publish one frame. False when the payload did not decode.
    fn deliver(&mut self, decoder: &mut dyn Decoder, frame: AssembledFrame) -> bool {
        let mid = self.track.mid;
        let decoded = match decoder.decode(&frame.data, frame.timestamp_us) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(mid, frame = frame.frame_id, "dropping undecodable frame: {}", e);
                TransportCounters::bump(&self.counters.decode_failures);
                return false;
            }
        };
        let shared = match self.track.writer.push(decoded) {
            Ok(shared) => shared,
            Err(e) => {
                debug!(mid, "track rejected frame: {}", e);
                TransportCounters::bump(&self.counters.frames_dropped);
                return true;
            }
        };
        TransportCounters::bump(&self.counters.frames_decoded);

        let event = TransportEvent::FrameReady {
            mid,
            kind: self.track.kind,
            frame: shared,
        };
        if self.events.try_send(event).is_err() {
            TransportCounters::bump(&self.counters.frames_dropped);
        }
        true
    }

    async fn request_retransmit(&self, seqs: Vec<u64>) {
        let count = seqs.len() as u64;
        let nack = Nack {
            mid: self.track.mid,
            seqs,
        };
        match self.sender.send(Channel::Control, Content::Nack(nack)).await {
            Ok(()) => TransportCounters::add(&self.counters.nacks_sent, count),
            Err(e) => debug!(mid = self.track.mid, "nack send failed: {}", e),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::UdpMux;
    use crate::transport::PeerPath;
    use tandem_crypto::PacketCipher;
    use tandem_media::{encoder_for, AudioFrame, Frame, MediaTrack};
    use tokio::sync::watch;

    const MID: u32 = 1;
    const THRESHOLD: u32 = 3;

    async fn sender(counters: Arc<TransportCounters>) -> Arc<PacketSender> {
        let (tx, _rx) = mpsc::channel(4);
        let mux = Arc::new(UdpMux::bind("127.0.0.1:0", tx).await.unwrap());
        let (_path_tx, path) = watch::channel(PeerPath {
            remote: "127.0.0.1:9".parse().unwrap(),
            relay: None,
        });
        let cipher = PacketCipher::new(&[7; 32], &[9; 32]);
        Arc::new(PacketSender::new(mux, cipher, path, 0, 0.0, counters))
    }

    fn chunk(frame_id: u64, payload: Vec<u8>) -> ReceiverInput {
        ReceiverInput::Chunk(MediaChunk {
            mid: MID,
            seq: frame_id,
            frame_id,
            chunk_index: 0,
            chunk_count: 1,
            timestamp_us: 1_000 + frame_id * 20_000,
            keyframe: true,
            payload,
        })
    }

    fn pcm(timestamp_us: u64) -> Vec<u8> {
        let audio = AudioFrame::new(48_000, 1, vec![0, 1, 2, 3]).unwrap();
        encoder_for(MediaKind::Audio)
            .encode(&Frame::audio(timestamp_us, audio))
            .unwrap()
            .data
    }

    /// Run a worker over one single-chunk frame per entry, decodable or not,
    /// and collect its events once the input closes.
    async fn run(decodable: &[bool]) -> (Vec<TransportEvent>, Arc<TransportCounters>, MediaTrack) {
        let counters = Arc::new(TransportCounters::default());
        let (writer, track) = MediaTrack::channel(MediaKind::Audio, "remote-audio");
        let (input_tx, input) = mpsc::channel(32);
        let (events_tx, mut events) = mpsc::channel(32);
        let worker = ReceiveWorker {
            track: ReceiveTrack {
                mid: MID,
                kind: MediaKind::Audio,
                writer,
                nack: false,
            },
            input,
            sender: sender(counters.clone()).await,
            events: events_tx,
            jitter: JitterConfig {
                depth: 16,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            frame_timeout: Duration::from_secs(1),
            decode_failure_threshold: THRESHOLD,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run());

        for (frame_id, &good) in decodable.iter().enumerate() {
            let frame_id = frame_id as u64;
            let payload = if good {
                pcm(1_000 + frame_id * 20_000)
            } else {
                b"not audio".to_vec()
            };
            input_tx.send(chunk(frame_id, payload)).await.unwrap();
        }
        drop(input_tx);
        handle.await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        (seen, counters, track)
    }

    fn decode_failures(events: &[TransportEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::DecodeFailure { mid, consecutive } => {
                    assert_eq!(*mid, MID);
                    Some(*consecutive)
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn decode_failure_fires_once_at_the_threshold() {
        let (events, counters, track) = run(&[false; 5]).await;
        assert_eq!(decode_failures(&events), vec![THRESHOLD]);
        assert_eq!(counters.snapshot().decode_failures, 5);
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn below_threshold_stays_quiet() {
        let (events, counters, _) = run(&[false; THRESHOLD as usize - 1]).await;
        assert!(decode_failures(&events).is_empty());
        assert_eq!(counters.snapshot().decode_failures, u64::from(THRESHOLD) - 1);
    }

    #[tokio::test]
    async fn a_decoded_frame_resets_the_count() {
        let pattern = [false, false, true, false, false, true, false, false, false];
        let (events, counters, _) = run(&pattern).await;
        assert_eq!(decode_failures(&events), vec![THRESHOLD]);
        let frames = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::FrameReady { .. }))
            .count();
        assert_eq!(frames, 2);
        assert_eq!(counters.snapshot().frames_decoded, 2);
        assert_eq!(counters.snapshot().decode_failures, 7);
    }
}
