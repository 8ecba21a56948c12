//! Event stream handed to the embedding application.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tandem_media::{Frame, MediaKind, MediaTrack};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::SessionError;
use crate::state::ConnectionState;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A remote track was negotiated. Its frames arrive on `track` and as
    /// `FrameReady` events.
    TrackAdded {
        mid: u32,
        kind: MediaKind,
        track: MediaTrack,
    },
    /// The remote paused or resumed one of its tracks.
    TrackEnabled {
        mid: u32,
        enabled: bool,
    },
    FrameReady {
        mid: u32,
        kind: MediaKind,
        frame: Arc<Frame>,
    },
    Error(SessionError),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "stateChanged",
            Self::TrackAdded { .. } => "trackAdded",
            Self::TrackEnabled { .. } => "trackEnabled",
            Self::FrameReady { .. } => "frameReady",
            Self::Error(_) => "error",
        }
    }
}

struct Shared {
    /// `FrameReady` events queued and not yet received.
    frames_queued: AtomicUsize,
    backlog: usize,
    dropped: AtomicU64,
    silenced: AtomicBool,
}

/// Producer side, owned by the control task.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
    shared: Arc<Shared>,
}

impl EventSender {
    /// `backlog` bounds queued frame events; state events are never dropped.
    pub(crate) fn new(backlog: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            frames_queued: AtomicUsize::new(0),
            backlog: backlog.max(1),
            dropped: AtomicU64::new(0),
            silenced: AtomicBool::new(false),
        });
        (
            Self {
                tx,
                shared: shared.clone(),
            },
            EventStream { rx, shared },
        )
    }

    pub(crate) fn emit(&self, event: SessionEvent) -> bool {
        if self.shared.silenced.load(Ordering::Acquire) {
            return false;
        }
        let is_frame = matches!(event, SessionEvent::FrameReady { .. });
        if is_frame {
            let queued = self.shared.frames_queued.fetch_add(1, Ordering::AcqRel);
            if queued >= self.shared.backlog {
                self.shared.frames_queued.fetch_sub(1, Ordering::AcqRel);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("event consumer behind, frame event dropped");
                return false;
            }
        }
        if self.tx.send(event).is_err() {
            if is_frame {
                self.shared.frames_queued.fetch_sub(1, Ordering::AcqRel);
            }
            return false;
        }
        true
    }

    /// Stop delivering events, including those already queued.
    pub(crate) fn silence(&self) {
        self.shared.silenced.store(true, Ordering::Release);
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of a session's events. Ends after `stop()` or when the
/// session is gone.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    shared: Arc<Shared>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        if self.shared.silenced.load(Ordering::Acquire) {
            return None;
        }
        let event = self.rx.recv().await?;
        self.accept(event)
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        if self.shared.silenced.load(Ordering::Acquire) {
            return None;
        }
        let event = self.rx.try_recv().ok()?;
        self.accept(event)
    }

    /// Frame events dropped because this stream fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn accept(&self, event: SessionEvent) -> Option<SessionEvent> {
        if matches!(event, SessionEvent::FrameReady { .. }) {
            self.shared.frames_queued.fetch_sub(1, Ordering::AcqRel);
        }
        // The session may have been stopped while we were waiting.
        if self.shared.silenced.load(Ordering::Acquire) {
            return None;
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_media::{AudioFrame, Frame};

    fn frame_event(ts: u64) -> SessionEvent {
        let audio = AudioFrame::new(48_000, 1, vec![0; 480]).unwrap();
        SessionEvent::FrameReady {
            mid: 1,
            kind: MediaKind::Audio,
            frame: Arc::new(Frame::audio(ts, audio)),
        }
    }

    #[tokio::test]
    async fn frame_backlog_drops_but_state_passes() {
        let (tx, mut rx) = EventSender::new(2);
        assert!(tx.emit(frame_event(1)));
        assert!(tx.emit(frame_event(2)));
        assert!(!tx.emit(frame_event(3)));
        assert!(tx.emit(SessionEvent::StateChanged(ConnectionState::Connected)));
        assert_eq!(rx.dropped(), 1);

        assert_eq!(rx.recv().await.map(|e| e.name()), Some("frameReady"));
        // Room for one more frame now.
        assert!(tx.emit(frame_event(4)));
        assert_eq!(rx.recv().await.map(|e| e.name()), Some("frameReady"));
        assert_eq!(rx.recv().await.map(|e| e.name()), Some("stateChanged"));
        assert_eq!(rx.recv().await.map(|e| e.name()), Some("frameReady"));
    }

    #[tokio::test]
    async fn silenced_stream_yields_nothing() {
        let (tx, mut rx) = EventSender::new(8);
        tx.emit(SessionEvent::StateChanged(ConnectionState::Connecting));
        tx.silence();
        assert!(!tx.emit(SessionEvent::StateChanged(ConnectionState::Closed)));
        assert!(rx.recv().await.is_none());
        assert!(rx.try_recv().is_none());
    }
}
