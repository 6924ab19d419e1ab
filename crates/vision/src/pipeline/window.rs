use std::collections::VecDeque;

/// Fixed-capacity sample buffer with FIFO eviction.
///
/// Statistics are computed over the current contents only and are `0.0` for
/// an empty window. The window is not synchronised; its owner serialises
/// access.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recently pushed sample.
    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Population standard deviation.
    pub fn std(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|x| (x - mean) * (x - mean))
            .sum::<f64>()
            / self.samples.len() as f64;
        variance.sqrt()
    }

    pub fn min(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_samples_in_order() {
        for capacity in [1usize, 3, 8] {
            for pushes in 0..20usize {
                let mut window = RollingWindow::new(capacity);
                for value in 0..pushes {
                    window.push(value as f64);
                }
                let kept = pushes.min(capacity);
                assert_eq!(window.len(), kept);
                let expected: Vec<f64> = (pushes - kept..pushes).map(|v| v as f64).collect();
                assert_eq!(window.iter().collect::<Vec<_>>(), expected);
            }
        }
    }

    #[test]
    fn empty_window_statistics_are_zero() {
        let window = RollingWindow::new(4);
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.std(), 0.0);
        assert_eq!(window.min(), 0.0);
        assert_eq!(window.max(), 0.0);
        assert_eq!(window.latest(), None);
    }

    #[test]
    fn population_statistics() {
        let mut window = RollingWindow::new(8);
        for value in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            window.push(value);
        }
        assert!((window.mean() - 5.0).abs() < 1e-12);
        assert!((window.std() - 2.0).abs() < 1e-12);
        assert_eq!(window.min(), 2.0);
        assert_eq!(window.max(), 9.0);
    }

    #[test]
    fn statistics_follow_eviction() {
        let mut window = RollingWindow::new(2);
        window.push(100.0);
        window.push(1.0);
        window.push(3.0);
        assert_eq!(window.mean(), 2.0);
        assert_eq!(window.latest(), Some(3.0));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut window = RollingWindow::new(0);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![2.0]);
    }

    #[test]
    fn clear_resets_statistics() {
        let mut window = RollingWindow::new(4);
        window.push(1.0);
        window.push(3.0);
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 4);
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.latest(), None);
        window.push(5.0);
        assert_eq!(window.mean(), 5.0);
    }
}
