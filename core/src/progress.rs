/// `floor(processed / total * 100)`, or `None` when there is nothing to count.
pub fn percentage(processed: usize, total: usize) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let processed = processed.min(total) as u128;
    Some((processed * 100 / total as u128) as u8)
}

/// Tracks the batch-level percentage and refuses to move it backwards.
#[derive(Debug, Default, Clone)]
pub struct ProgressAggregator {
    last: Option<u8>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, processed: usize, total: usize) -> Option<u8> {
        let current = percentage(processed, total)?;
        let next = match self.last {
            Some(last) if last > current => last,
            _ => current,
        };
        self.last = Some(next);
        Some(next)
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Percentage of a single stream's bytes, used for the per-item indicator.
pub fn byte_percentage(downloaded: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|t| *t > 0)?;
    let downloaded = downloaded.min(total) as u128;
    Some((downloaded * 100 / total as u128) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_and_ignores_empty_totals() {
        assert_eq!(percentage(1, 3), Some(33));
        assert_eq!(percentage(2, 3), Some(66));
        assert_eq!(percentage(3, 3), Some(100));
        assert_eq!(percentage(0, 0), None);
    }

    #[test]
    fn hundred_only_at_the_end() {
        for total in 1..200usize {
            for processed in 0..total {
                assert!(percentage(processed, total).expect("total > 0") < 100);
            }
            assert_eq!(percentage(total, total), Some(100));
        }
    }

    #[test]
    fn aggregator_is_idempotent_and_monotonic() {
        let mut agg = ProgressAggregator::new();
        assert_eq!(agg.update(0, 0), None);
        assert_eq!(agg.update(1, 4), Some(25));
        assert_eq!(agg.update(1, 4), Some(25));
        assert_eq!(agg.update(3, 4), Some(75));
        assert_eq!(agg.update(2, 4), Some(75));
        assert_eq!(agg.update(4, 4), Some(100));
        agg.reset();
        assert_eq!(agg.last(), None);
    }

    #[test]
    fn byte_progress() {
        assert_eq!(byte_percentage(50, Some(200)), Some(25));
        assert_eq!(byte_percentage(50, None), None);
        assert_eq!(byte_percentage(50, Some(0)), None);
    }
}
