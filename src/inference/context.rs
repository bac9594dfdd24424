//! Context window bookkeeping
//!
//! The backend owns the actual key/value memory; [`ContextWindow`] tracks how
//! many positions of the single sequence are in use and refuses to go past the
//! capacity. The counters sit in a [`ContextGauge`] so other threads can read
//! the fill ratio without touching the engine thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::inference::engine::EngineError;

/// Lock-free view of the window occupancy
#[derive(Debug, Default)]
pub struct ContextGauge {
    capacity: AtomicU32,
    filled: AtomicU32,
}

impl ContextGauge {
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn filled(&self) -> u32 {
        self.filled.load(Ordering::Acquire)
    }

    /// `filled / capacity`, or 0.0 when nothing is loaded.
    pub fn fill_ratio(&self) -> f32 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        (self.filled() as f32 / capacity as f32).clamp(0.0, 1.0)
    }
}

/// Position accounting for one session's sequence
#[derive(Debug)]
pub struct ContextWindow {
    gauge: Arc<ContextGauge>,
    capacity: u32,
    filled: u32,
}

impl ContextWindow {
    /// Starts an empty window of `capacity` tokens and publishes it to `gauge`.
    pub fn new(capacity: u32, gauge: Arc<ContextGauge>) -> Self {
        gauge.filled.store(0, Ordering::Release);
        gauge.capacity.store(capacity, Ordering::Release);
        Self {
            gauge,
            capacity,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn filled(&self) -> u32 {
        self.filled
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.filled
    }

    /// Fails if `n` more positions do not fit.
    pub fn ensure_room(&self, n: usize) -> Result<(), EngineError> {
        if n > self.remaining() as usize {
            return Err(EngineError::ContextFull {
                needed: self.filled as usize + n,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Records `n` newly evaluated positions.
    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled as usize + n).min(self.capacity as usize) as u32;
        self.gauge.filled.store(self.filled, Ordering::Release);
    }

    /// Marks every position free again.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.gauge.filled.store(0, Ordering::Release);
    }
}

impl Drop for ContextWindow {
    fn drop(&mut self) {
        // The session is going away; nothing is loaded any more
        self.gauge.capacity.store(0, Ordering::Release);
        self.gauge.filled.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_ratio_before_load_is_zero() {
        let gauge = ContextGauge::default();
        assert_eq!(gauge.fill_ratio(), 0.0);
    }

    #[test]
    fn test_advance_and_reset() {
        let gauge = Arc::new(ContextGauge::default());
        let mut window = ContextWindow::new(8, Arc::clone(&gauge));
        assert_eq!(gauge.fill_ratio(), 0.0);

        window.advance(2);
        assert_eq!(window.filled(), 2);
        assert!((gauge.fill_ratio() - 0.25).abs() < f32::EPSILON);

        window.reset();
        assert_eq!(gauge.fill_ratio(), 0.0);
        assert_eq!(window.remaining(), 8);
    }

    #[test]
    fn test_ensure_room_rejects_overflow() {
        let gauge = Arc::new(ContextGauge::default());
        let mut window = ContextWindow::new(4, gauge);
        window.advance(3);
        assert!(window.ensure_room(1).is_ok());
        assert_eq!(
            window.ensure_room(2),
            Err(EngineError::ContextFull {
                needed: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn test_drop_clears_gauge() {
        let gauge = Arc::new(ContextGauge::default());
        let mut window = ContextWindow::new(4, Arc::clone(&gauge));
        window.advance(4);
        assert_eq!(gauge.fill_ratio(), 1.0);
        drop(window);
        assert_eq!(gauge.capacity(), 0);
        assert_eq!(gauge.fill_ratio(), 0.0);
    }
}
