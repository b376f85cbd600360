use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::shared::SharedState;

/// Turns a stream of freshness ages into at most one trip per staleness episode.
///
/// An episode starts when the age first exceeds the threshold and ends when the
/// age drops back under it.
#[derive(Clone, Debug)]
pub struct StalenessMonitor {
    threshold: Duration,
    in_episode: bool,
    trips: u64,
}

impl StalenessMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            in_episode: false,
            trips: 0,
        }
    }

    /// Returns true exactly when a new episode begins.
    pub fn observe(&mut self, age: Duration) -> bool {
        if age > self.threshold {
            if self.in_episode {
                return false;
            }
            self.in_episode = true;
            self.trips += 1;
            true
        } else {
            self.in_episode = false;
            false
        }
    }

    pub fn in_episode(&self) -> bool {
        self.in_episode
    }

    pub fn trips(&self) -> u64 {
        self.trips
    }
}

pub(crate) fn run_watchdog(
    shared: Arc<SharedState>,
    threshold: Duration,
    poll: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut monitor = StalenessMonitor::new(threshold);
    while !shutdown.load(Ordering::SeqCst) {
        let age = shared.freshness_age();
        if monitor.observe(age) {
            let interrupted = shared.interrupt_device();
            shared.record_watchdog_trip();
            log::warn!(
                "Watchdog: no frame for {:?} (threshold {:?}), forcing device release (device open: {})",
                age,
                threshold,
                interrupted
            );
        }
        std::thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_trip_per_episode() {
        let mut m = StalenessMonitor::new(Duration::from_secs(5));
        let ages = [1, 4, 6, 7, 9, 30, 2, 1, 6, 8, 3, 5, 6];
        let trips: Vec<bool> = ages
            .iter()
            .map(|s| m.observe(Duration::from_secs(*s)))
            .collect();
        assert_eq!(
            trips,
            vec![false, false, true, false, false, false, false, false, true, false, false, false, true]
        );
        assert_eq!(m.trips(), 3);
    }
}
