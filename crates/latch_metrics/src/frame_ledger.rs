//! Per-frame samples for the last N frames

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSample {
    pub frame: u64,
    pub values: Vec<(&'static str, u64)>,
}

#[derive(Debug, Clone)]
pub struct FrameLedger {
    frames: VecDeque<FrameSample>,
    capacity: usize,
}

impl FrameLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Record `value` under `name` for `frame`, opening a new sample when the
    /// frame changes and dropping the oldest one past capacity.
    pub fn record(&mut self, frame: u64, name: &'static str, value: u64) {
        if self.frames.back().map_or(true, |s| s.frame != frame) {
            if self.frames.len() == self.capacity {
                self.frames.pop_front();
            }
            self.frames.push_back(FrameSample {
                frame,
                values: Vec::new(),
            });
        }
        if let Some(sample) = self.frames.back_mut() {
            match sample.values.iter_mut().find(|(n, _)| *n == name) {
                Some((_, v)) => *v = value,
                None => sample.values.push((name, value)),
            }
        }
    }

    pub fn latest(&self) -> Option<&FrameSample> {
        self.frames.back()
    }

    /// `(frame, value)` for every retained frame that recorded `name`.
    pub fn history(&self, name: &str) -> Vec<(u64, u64)> {
        self.frames
            .iter()
            .filter_map(|s| {
                s.values
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|&(_, v)| (s.frame, v))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
