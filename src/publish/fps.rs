use std::collections::VecDeque;

/// Samples kept by the FPS smoother.
pub const FPS_WINDOW: usize = 10;

/// Rolling median over the last `capacity` samples.
#[derive(Debug, Clone)]
pub struct MedianFilter {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl MedianFilter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a sample, evicting the oldest once full, and return the new
    /// median.
    pub fn push(&mut self, sample: f64) -> f64 {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.median()
    }

    /// Median of the current window; the mean of the two middle samples
    /// when the count is even. Zero when empty.
    pub fn median(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Default for MedianFilter {
    fn default() -> Self {
        Self::new(FPS_WINDOW)
    }
}
