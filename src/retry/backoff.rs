use std::time::Duration;

/// Doubling delay sequence capped at a maximum: 1s, 2s, 4s, 8s, 8s, ...
#[derive(Clone, Debug)]
pub struct BackoffSchedule {
    next: Duration,
    max: Duration,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn reset(&mut self, initial: Duration) {
        self.next = initial.min(self.max);
    }
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.saturating_mul(2).min(self.max);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let delays: Vec<u64> = BackoffSchedule::new(Duration::from_secs(1), Duration::from_secs(8))
            .take(6)
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn test_backoff_never_exceeds_max() {
        let max = Duration::from_millis(300);
        let schedule = BackoffSchedule::new(Duration::from_millis(7), max);
        assert!(schedule.take(64).all(|d| d <= max));
    }

    #[test]
    fn test_initial_above_max_is_clamped() {
        let mut schedule = BackoffSchedule::new(Duration::from_secs(20), Duration::from_secs(8));
        assert_eq!(schedule.next(), Some(Duration::from_secs(8)));
    }
}
