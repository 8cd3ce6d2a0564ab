//! Adaptive share difficulty
//!
//! Each vardiff-enabled port carries one controller. Every connection keeps
//! its own [`VarDiffState`] with a ring buffer of inter-submission gaps; when
//! a retarget window elapses the controller compares the average gap against
//! the variance band around the target time and proposes a new difficulty,
//! which the session queues for the next job broadcast.

use crate::config::VarDiffConfig;

/// Fixed-capacity ring buffer of submission time gaps
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<u64>,
    cursor: usize,
    is_full: bool,
    max_size: usize,
}

impl RingBuffer {
    /// An empty buffer holding at most `max_size` samples
    pub fn new(max_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_size),
            cursor: 0,
            is_full: false,
            max_size,
        }
    }

    /// Push a sample, overwriting the oldest once full
    pub fn append(&mut self, value: u64) {
        if self.is_full {
            self.data[self.cursor] = value;
            self.cursor = (self.cursor + 1) % self.max_size;
        } else {
            self.data.push(value);
            self.cursor += 1;
            if self.data.len() == self.max_size {
                self.cursor = 0;
                self.is_full = true;
            }
        }
    }

    /// Mean of the samples currently held, 0.0 when empty
    pub fn avg(&self) -> f64 {
        let size = self.size();
        if size == 0 {
            return 0.0;
        }
        self.data.iter().sum::<u64>() as f64 / size as f64
    }

    /// Number of samples currently held
    pub fn size(&self) -> usize {
        if self.is_full {
            self.max_size
        } else {
            self.cursor
        }
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.data.clear();
        self.cursor = 0;
        self.is_full = false;
    }
}

/// Per-connection retarget state
#[derive(Debug, Clone, Default)]
pub struct VarDiffState {
    last_ts: u64,
    last_retarget: u64,
    buffer: Option<RingBuffer>,
}

/// Per-port difficulty controller
#[derive(Debug, Clone)]
pub struct VarDiff {
    cfg: VarDiffConfig,
    buffer_size: usize,
    t_min: f64,
    t_max: f64,
}

impl VarDiff {
    /// Build a controller for one port's vardiff settings
    pub fn new(cfg: &VarDiffConfig) -> Self {
        let variance = cfg.target_time as f64 * (cfg.variance_percent / 100.0);
        Self {
            buffer_size: (cfg.retarget_time / cfg.target_time * 4).max(1) as usize,
            t_min: cfg.target_time as f64 - variance,
            t_max: cfg.target_time as f64 + variance,
            cfg: cfg.clone(),
        }
    }

    /// Starting difficulty for fresh connections, the configured minimum
    pub fn min_diff(&self) -> f64 {
        self.cfg.min_diff
    }

    /// Feed one accepted-or-rejected submission timestamp through the
    /// controller. Returns the proposed difficulty when a retarget fires.
    pub fn on_submit(&self, state: &mut VarDiffState, difficulty: f64, now: u64) -> Option<f64> {
        let buffer = match state.buffer.as_mut() {
            Some(buffer) => buffer,
            None => {
                // first submission seeds the clocks half a window back so
                // the first real retarget is not a full window away
                state.last_retarget = now.saturating_sub(self.cfg.retarget_time / 2);
                state.last_ts = now;
                state.buffer = Some(RingBuffer::new(self.buffer_size));
                return None;
            }
        };

        buffer.append(now.saturating_sub(state.last_ts));
        state.last_ts = now;

        if now.saturating_sub(state.last_retarget) < self.cfg.retarget_time && buffer.size() > 0 {
            return None;
        }

        state.last_retarget = now;
        let avg = buffer.avg();
        if avg <= 0.0 {
            return None;
        }
        let mut ddiff = self.cfg.target_time as f64 / avg;

        if avg > self.t_max && difficulty > self.cfg.min_diff {
            if self.cfg.x2mode {
                ddiff = 0.5;
            }
            if ddiff * difficulty < self.cfg.min_diff {
                ddiff = self.cfg.min_diff / difficulty;
            }
        } else if avg < self.t_min {
            if self.cfg.x2mode {
                ddiff = 2.0;
            }
            if ddiff * difficulty > self.cfg.max_diff {
                ddiff = self.cfg.max_diff / difficulty;
            }
        } else {
            return None;
        }

        let new_diff = ((difficulty * ddiff) * 1e8).round() / 1e8;
        buffer.clear();
        Some(new_diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(x2mode: bool) -> VarDiff {
        VarDiff::new(&VarDiffConfig {
            min_diff: 8.0,
            max_diff: 512.0,
            target_time: 15,
            retarget_time: 90,
            variance_percent: 30.0,
            x2mode,
        })
    }

    #[test]
    fn test_ring_buffer_wraps() {
        let mut buffer = RingBuffer::new(3);
        buffer.append(10);
        buffer.append(20);
        assert_eq!(buffer.size(), 2);
        assert_eq!(buffer.avg(), 15.0);
        buffer.append(30);
        buffer.append(90); // overwrites 10
        assert_eq!(buffer.size(), 3);
        assert!((buffer.avg() - (20.0 + 30.0 + 90.0) / 3.0).abs() < 1e-9);
        buffer.clear();
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.avg(), 0.0);
    }

    #[test]
    fn test_first_submit_only_seeds() {
        let vardiff = controller(false);
        let mut state = VarDiffState::default();
        assert_eq!(vardiff.on_submit(&mut state, 8.0, 1000), None);
    }

    #[test]
    fn test_fast_shares_raise_difficulty() {
        let vardiff = controller(false);
        let mut state = VarDiffState::default();
        let mut now = 1000;
        vardiff.on_submit(&mut state, 8.0, now);

        // one share per second is far below tMin, the first retarget after
        // the half-seeded window scales difficulty by roughly 15x
        let mut proposed = None;
        for _ in 0..60 {
            now += 1;
            if let Some(diff) = vardiff.on_submit(&mut state, 8.0, now) {
                proposed = Some(diff);
                break;
            }
        }
        let new_diff = proposed.unwrap();
        assert!(new_diff > 8.0);
        assert!((new_diff - 120.0).abs() < 1e-6);
    }

    #[test]
    fn test_slow_shares_halve_in_x2_mode() {
        let vardiff = controller(true);
        let mut state = VarDiffState::default();
        let mut now = 1000;
        vardiff.on_submit(&mut state, 64.0, now);

        let mut proposed = None;
        for _ in 0..10 {
            now += 60; // far above tMax
            if let Some(diff) = vardiff.on_submit(&mut state, 64.0, now) {
                proposed = Some(diff);
                break;
            }
        }
        assert_eq!(proposed, Some(32.0));
    }

    #[test]
    fn test_fast_shares_double_in_x2_mode() {
        let vardiff = controller(true);
        let mut state = VarDiffState::default();
        let mut now = 1000;
        vardiff.on_submit(&mut state, 64.0, now);

        // one share per second is far below tMin; x2 mode doubles instead
        // of scaling by the measured ratio
        let mut proposed = None;
        for _ in 0..60 {
            now += 1;
            if let Some(diff) = vardiff.on_submit(&mut state, 64.0, now) {
                proposed = Some(diff);
                break;
            }
        }
        assert_eq!(proposed, Some(128.0));

        // doubling past the ceiling clamps at max_diff
        let mut state = VarDiffState::default();
        let mut now = 1000;
        vardiff.on_submit(&mut state, 300.0, now);
        let mut proposed = None;
        for _ in 0..60 {
            now += 1;
            if let Some(diff) = vardiff.on_submit(&mut state, 300.0, now) {
                proposed = Some(diff);
                break;
            }
        }
        assert_eq!(proposed, Some(512.0));
    }

    #[test]
    fn test_clamped_to_bounds() {
        let vardiff = controller(false);
        let mut state = VarDiffState::default();
        let mut now = 1000;
        vardiff.on_submit(&mut state, 500.0, now);

        // sub-second shares would overshoot max_diff, clamp at 512
        let mut proposed = None;
        for _ in 0..120 {
            now += 1;
            if let Some(diff) = vardiff.on_submit(&mut state, 500.0, now) {
                proposed = Some(diff);
                break;
            }
        }
        assert_eq!(proposed, Some(512.0));

        // already at the floor, slow shares propose nothing
        let mut state = VarDiffState::default();
        let mut now = 1000;
        vardiff.on_submit(&mut state, 8.0, now);
        for _ in 0..10 {
            now += 60;
            assert_eq!(vardiff.on_submit(&mut state, 8.0, now), None);
        }
    }

    #[test]
    fn test_in_band_average_keeps_difficulty() {
        let vardiff = controller(false);
        let mut state = VarDiffState::default();
        let mut now = 1000;
        vardiff.on_submit(&mut state, 16.0, now);
        for _ in 0..10 {
            now += 15; // exactly on target
            assert_eq!(vardiff.on_submit(&mut state, 16.0, now), None);
        }
    }
}
