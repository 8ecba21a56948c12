//! Pull-based media tracks.
//!
//! A track has exactly one [`TrackWriter`] (the capture backend or a
//! transport receive worker) and any number of [`TrackReader`] cursors.
//! Readers share a single most-recent-frame slot rather than a queue: a
//! slow reader skips frames, it never makes the writer buffer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::{Frame, MediaError, MediaKind};

#[derive(Debug, Clone, Default)]
struct Slot {
    /// Incremented on every push; 0 means nothing pushed yet.
    seq: u64,
    frame: Option<Arc<Frame>>,
    ended: bool,
}

/// Single-writer end of a track.
#[derive(Debug)]
pub struct TrackWriter {
    tx: watch::Sender<Slot>,
    kind: MediaKind,
    last_timestamp_us: Option<u64>,
}

impl TrackWriter {
    /// Publish a frame and get back the shared copy readers see.
    /// Timestamps must not go backwards.
    pub fn push(&mut self, frame: Frame) -> Result<Arc<Frame>, MediaError> {
        if frame.kind() != self.kind {
            return Err(MediaError::KindMismatch {
                expected: self.kind,
                got: frame.kind(),
            });
        }
        if let Some(previous) = self.last_timestamp_us {
            if frame.timestamp_us < previous {
                return Err(MediaError::NonMonotonicTimestamp {
                    previous,
                    got: frame.timestamp_us,
                });
            }
        }
        if self.tx.borrow().ended {
            return Err(MediaError::TrackEnded);
        }
        self.last_timestamp_us = Some(frame.timestamp_us);
        let frame = Arc::new(frame);
        let shared = frame.clone();
        self.tx.send_modify(|slot| {
            slot.seq += 1;
            slot.frame = Some(frame);
        });
        Ok(shared)
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn last_timestamp_us(&self) -> Option<u64> {
        self.last_timestamp_us
    }

    /// Mark the track ended. Readers drain the last frame, then see `None`.
    pub fn end(&self) {
        self.tx.send_modify(|slot| slot.ended = true);
    }

    pub fn is_ended(&self) -> bool {
        self.tx.borrow().ended
    }
}

impl Drop for TrackWriter {
    fn drop(&mut self) {
        self.end();
    }
}

/// Handle to a live or ended track. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: Arc<str>,
    kind: MediaKind,
    rx: watch::Receiver<Slot>,
}

impl MediaTrack {
    pub fn channel(kind: MediaKind, id: impl Into<Arc<str>>) -> (TrackWriter, MediaTrack) {
        let (tx, rx) = watch::channel(Slot::default());
        (
            TrackWriter {
                tx,
                kind,
                last_timestamp_us: None,
            },
            MediaTrack {
                id: id.into(),
                kind,
                rx,
            },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_ended(&self) -> bool {
        self.rx.borrow().ended
    }

    /// Most recent frame, without consuming anything.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.rx.borrow().frame.clone()
    }

    /// New independent cursor. It starts at the current latest frame.
    pub fn reader(&self) -> TrackReader {
        TrackReader {
            rx: self.rx.clone(),
            kind: self.kind,
            last_seq: 0,
            skipped: 0,
        }
    }
}

/// A consumer cursor over a track.
#[derive(Debug)]
pub struct TrackReader {
    rx: watch::Receiver<Slot>,
    kind: MediaKind,
    last_seq: u64,
    skipped: u64,
}

impl TrackReader {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Frames this cursor never saw because newer ones replaced them.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// `Some(Some(frame))` for an unseen frame, `Some(None)` once ended
    /// with nothing unseen, `None` when the caller has to wait.
    fn poll_slot(&mut self) -> Option<Option<Arc<Frame>>> {
        let slot = self.rx.borrow_and_update();
        if slot.seq > self.last_seq {
            if let Some(frame) = slot.frame.clone() {
                if self.last_seq > 0 {
                    self.skipped += slot.seq - self.last_seq - 1;
                }
                self.last_seq = slot.seq;
                return Some(Some(frame));
            }
        }
        if slot.ended {
            return Some(None);
        }
        None
    }

    /// Wait for the next frame. Returns `None` once the track has ended
    /// and nothing unseen remains.
    pub async fn next_frame(&mut self) -> Option<Arc<Frame>> {
        loop {
            if let Some(result) = self.poll_slot() {
                return result;
            }
            if self.rx.changed().await.is_err() {
                return self.poll_slot().flatten();
            }
        }
    }

    /// Like [`next_frame`](Self::next_frame) with an upper bound on the wait.
    pub async fn next_frame_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Arc<Frame>, MediaError> {
        match tokio::time::timeout(timeout, self.next_frame()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(MediaError::TrackEnded),
            Err(_) => Err(MediaError::Timeout),
        }
    }
}
