//! Sliding replay window over packet ids.
//!
//! Tracks the highest accepted id and a 128-bit bitmap of the ids just
//! below it. Ids older than the window, or already marked, are rejected.
//! Not thread-safe; each receive path owns one.

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    highest: Option<u64>,
    /// Bit 0 = highest, bit n = highest - n.
    bitmap: u128,
    size: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub const DEFAULT_SIZE: u64 = 128;

    pub fn new() -> Self {
        Self::with_size(Self::DEFAULT_SIZE)
    }

    /// `size` is clamped to `1..=128`.
    pub fn with_size(size: u64) -> Self {
        Self {
            highest: None,
            bitmap: 0,
            size: size.clamp(1, 128),
        }
    }

    /// Whether `id` would be accepted, without recording it.
    pub fn would_accept(&self, id: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if id > highest {
            return true;
        }
        let offset = highest - id;
        offset < self.size && self.bitmap & (1u128 << offset) == 0
    }

    /// Record `id`. Returns false for replays and ids behind the window.
    pub fn accept(&mut self, id: u64) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(id);
            self.bitmap = 1;
            return true;
        };

        if id > highest {
            let shift = id - highest;
            self.bitmap = if shift >= 128 { 1 } else { (self.bitmap << shift) | 1 };
            self.highest = Some(id);
            return true;
        }

        let offset = highest - id;
        if offset >= self.size {
            return false;
        }
        let mask = 1u128 << offset;
        if self.bitmap & mask != 0 {
            return false;
        }
        self.bitmap |= mask;
        true
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    pub fn reset(&mut self) {
        self.highest = None;
        self.bitmap = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_accepted() {
        let mut window = ReplayWindow::new();
        for i in 0..300 {
            assert!(window.accept(i), "id {i} should be accepted");
        }
        assert_eq!(window.highest(), Some(299));
    }

    #[test]
    fn replays_rejected() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(0));
        assert!(window.accept(1));
        assert!(!window.accept(0));
        assert!(!window.accept(1));
    }

    #[test]
    fn reordering_within_window() {
        let mut window = ReplayWindow::new();
        for id in [5, 3, 4, 1, 2] {
            assert!(window.accept(id));
        }
        for id in 1..=5 {
            assert!(!window.accept(id));
        }
    }

    #[test]
    fn ids_behind_window_rejected() {
        let mut window = ReplayWindow::with_size(10);
        for i in 1..=10 {
            assert!(window.accept(i));
        }
        assert!(window.accept(20));
        assert!(!window.accept(10));
        assert!(window.accept(11));
        assert!(!window.would_accept(11));
    }

    #[test]
    fn large_jump_resets_bitmap() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(1));
        assert!(window.accept(1000));
        assert!(!window.accept(1));
        assert!(window.accept(999));
    }

    #[test]
    fn would_accept_does_not_record() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(1));
        assert!(window.would_accept(2));
        assert!(window.would_accept(2));
        assert!(window.accept(2));
        assert!(!window.would_accept(2));
        window.reset();
        assert!(window.would_accept(2));
    }
}
