use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::assembly::AssembledFrame;

/// Inter-arrival jitter, RFC 3550 style smoothing (1/16).
#[derive(Debug, Default)]
pub struct ArrivalJitter {
    last_arrival: Option<Instant>,
    ia_avg_us: f64,
    jitter_us: f64,
}

impl ArrivalJitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_arrival(&mut self, arrival: Instant) {
        if let Some(last) = self.last_arrival {
            let ia = arrival.saturating_duration_since(last).as_micros() as f64;
            if self.ia_avg_us == 0.0 {
                self.ia_avg_us = ia;
            } else {
                self.ia_avg_us += (ia - self.ia_avg_us) / 16.0;
            }
            let deviation = (ia - self.ia_avg_us).abs();
            self.jitter_us += (deviation - self.jitter_us) / 16.0;
        }
        self.last_arrival = Some(arrival);
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_micros(self.jitter_us.max(0.0) as u64)
    }
}

/// Smoothed round-trip time (EWMA 1/8).
#[derive(Debug, Default)]
pub struct RttTracker {
    smooth_us: f64,
}

impl RttTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sample(&mut self, rtt: Duration) -> Duration {
        let sample = rtt.as_micros() as f64;
        if self.smooth_us == 0.0 {
            self.smooth_us = sample;
        } else {
            self.smooth_us = 0.875 * self.smooth_us + 0.125 * sample;
        }
        self.current()
    }

    pub fn current(&self) -> Duration {
        Duration::from_micros(self.smooth_us as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterConfig {
    /// Frames held before the oldest is dropped.
    pub depth: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

struct Buffered {
    arrival: Instant,
    frame: AssembledFrame,
}

/// Per-track reorder and smoothing buffer.
///
/// Frames are held sorted by timestamp for the playout delay, which starts
/// at `initial_delay` and grows with measured jitter up to `max_delay`.
/// Overflow drops the oldest frame. A frame older than one already
/// released is discarded, so output timestamps never go backwards.
pub struct JitterBuffer {
    config: JitterConfig,
    delay: Duration,
    queue: VecDeque<Buffered>,
    jitter: ArrivalJitter,
    last_released: Option<u64>,
    dropped: u64,
    late: u64,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            delay: config.initial_delay.min(config.max_delay),
            config,
            queue: VecDeque::with_capacity(config.depth),
            jitter: ArrivalJitter::new(),
            last_released: None,
            dropped: 0,
            late: 0,
        }
    }

    pub fn push(&mut self, frame: AssembledFrame, arrival: Instant) {
        if self
            .last_released
            .map_or(false, |released| frame.timestamp_us <= released)
        {
            self.late += 1;
            return;
        }
        if self.queue.iter().any(|b| b.frame.frame_id == frame.frame_id) {
            return;
        }

        self.jitter.on_arrival(arrival);
        self.delay = (self.config.initial_delay + self.jitter.jitter() * 2).min(self.config.max_delay);

        let at = self
            .queue
            .iter()
            .position(|b| b.frame.timestamp_us > frame.timestamp_us)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, Buffered { arrival, frame });

        while self.queue.len() > self.config.depth.max(1) {
            self.queue.pop_front();
            self.dropped += 1;
        }
    }

    /// Oldest frame whose playout delay has elapsed.
    pub fn pop_ready(&mut self, now: Instant) -> Option<AssembledFrame> {
        let front = self.queue.front()?;
        if now.saturating_duration_since(front.arrival) < self.delay {
            return None;
        }
        let frame = self.queue.pop_front()?.frame;
        self.last_released = Some(frame.timestamp_us);
        Some(frame)
    }

    /// When the oldest held frame becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.front().map(|b| b.arrival + self.delay)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Frames lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Frames that arrived after a newer one was released.
    pub fn late(&self) -> u64 {
        self.late
    }
}
