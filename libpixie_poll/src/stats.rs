use fxhash::FxHashMap;

/// Throughput accounting for the active run.
///
/// The assembler reports every non-virtual event it parses and the
/// controller reports the wall time between spills; the status line and the
/// end-of-run summary read the totals back out.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    total_time: f64,
    total_bytes: u64,
    event_counts: FxHashMap<(usize, usize), u64>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one parsed event of `bytes` bytes on (module, channel).
    pub fn add_event(&mut self, module: usize, channel: usize, bytes: u64) {
        *self.event_counts.entry((module, channel)).or_insert(0) += 1;
        self.total_bytes += bytes;
    }

    /// Add the wall-time span of one spill, in seconds.
    pub fn add_time(&mut self, seconds: f64) {
        self.total_time += seconds;
    }

    /// Accumulated run time in seconds.
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Accumulated event payload in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Events recorded for one (module, channel).
    pub fn events(&self, module: usize, channel: usize) -> u64 {
        self.event_counts
            .get(&(module, channel))
            .copied()
            .unwrap_or(0)
    }

    /// Events recorded across the crate.
    pub fn total_events(&self) -> u64 {
        self.event_counts.values().sum()
    }

    /// Average data rate over the run, in bytes per second.
    pub fn total_data_rate(&self) -> f64 {
        if self.total_time > 0.0 {
            self.total_bytes as f64 / self.total_time
        } else {
            0.0
        }
    }

    /// Zero every counter, at file open and close.
    pub fn clear(&mut self) {
        self.total_time = 0.0;
        self.total_bytes = 0;
        self.event_counts.clear();
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_clear() {
        let mut stats = StatsAggregator::new();
        stats.add_event(0, 3, 400);
        stats.add_event(0, 3, 400);
        stats.add_event(1, 15, 600);
        stats.add_time(2.0);

        assert_eq!(stats.events(0, 3), 2);
        assert_eq!(stats.events(1, 15), 1);
        assert_eq!(stats.total_events(), 3);
        assert_eq!(stats.total_bytes(), 1400);
        assert!((stats.total_data_rate() - 700.0).abs() < 1e-9);

        stats.clear();
        assert_eq!(stats.total_events(), 0);
        assert_eq!(stats.total_bytes(), 0);
        assert_eq!(stats.total_data_rate(), 0.0);
    }
}
