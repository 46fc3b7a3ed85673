//! The unified presentation timeline and the drift delta derived from it.

use tracing::trace;

/// Representative spacing of a timeline.
///
/// Walks the timeline backwards looking at consecutive deltas, skipping any
/// pair that contains a zero entry or does not increase. The first delta that
/// agrees with the previous candidate within `tolerance` (relative) wins. If
/// no two deltas agree the last one computed is returned, which may be 0.
pub fn estimate_drift(timeline: &[i64], tolerance: f64) -> i64 {
    let mut drift = 0i64;

    for pair in timeline.windows(2).rev() {
        let (previous, current) = (pair[0], pair[1]);

        if previous == 0 || current == 0 || current <= previous {
            continue;
        }

        let delta = current - previous;
        if drift > 0 && (drift - delta).abs() as f64 <= drift as f64 * tolerance {
            break;
        }

        drift = delta;
    }

    drift
}

/// Lazily estimated drift delta, kept once it is known.
///
/// A zero estimate is not kept, so the next request scans the (by then
/// longer) timeline again.
#[derive(Debug, Clone, Copy)]
pub struct DriftDelta {
    value: i64,
    tolerance: f64,
}

impl DriftDelta {
    pub fn new(tolerance: f64) -> Self {
        Self {
            value: 0,
            tolerance,
        }
    }

    pub fn get(&mut self, timeline: &PresentationTimeline) -> i64 {
        if self.value == 0 {
            self.value = estimate_drift(timeline.as_slice(), self.tolerance);
            trace!(drift_us = self.value, "estimated drift");
        }

        self.value
    }

    pub fn is_known(&self) -> bool {
        self.value != 0
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

/// One microsecond timestamp per decode iteration that produced output.
/// Never decreases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentationTimeline {
    entries: Vec<i64>,
}

impl PresentationTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<i64>) -> Self {
        let mut timeline = Self::new();
        let mut drift = DriftDelta::new(0.0);
        for entry in entries {
            timeline.record(Some(entry), &mut drift);
        }
        timeline
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        self.entries.get(index).copied()
    }

    pub fn first(&self) -> Option<i64> {
        self.entries.first().copied()
    }

    pub fn last(&self) -> Option<i64> {
        self.entries.last().copied()
    }

    /// Appends the unified timestamp of one iteration.
    ///
    /// `candidate` is the smallest output timestamp among the tracks that
    /// produced output, or `None` if none did (nothing is appended then).
    /// A candidate that does not move past the last entry is replaced by
    /// `last + drift`. Returns the appended value.
    pub fn record(&mut self, candidate: Option<i64>, drift: &mut DriftDelta) -> Option<i64> {
        let candidate = candidate?;

        let value = match self.last() {
            None => candidate,
            Some(last) if candidate > last => candidate,
            Some(last) => last.saturating_add(drift.get(self).max(0)),
        };

        self.entries.push(value);
        Some(value)
    }

    /// Timestamp for the `index`-th output unit. Past the end, the timeline
    /// is extended by whole multiples of `drift` from its last entry.
    pub fn extrapolate(&self, index: usize, drift: i64) -> i64 {
        if let Some(value) = self.get(index) {
            return value;
        }

        let multiplier = (index - self.len()) as i64 + 1;
        self.last()
            .unwrap_or(0)
            .saturating_add(drift.saturating_mul(multiplier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_deltas_converge() {
        assert_eq!(estimate_drift(&[0, 23_000, 46_000, 69_000, 92_000], 0.05), 23_000);
        assert_eq!(estimate_drift(&[10, 20, 30], 0.05), 10);
    }

    #[test]
    fn accepts_delta_within_tolerance() {
        // Scanning backwards: 1000, then 1040 is within 5% of 1000.
        assert_eq!(estimate_drift(&[1_000, 2_040, 3_040], 0.05), 1_000);
    }

    #[test]
    fn keeps_last_delta_without_agreement() {
        // Backwards: 100, then 1000 (disagrees), then 10_000 (disagrees).
        assert_eq!(estimate_drift(&[1, 10_001, 11_001, 11_101], 0.05), 10_000);
    }

    #[test]
    fn pairs_with_zero_are_skipped() {
        assert_eq!(estimate_drift(&[0, 500], 0.05), 0);
        assert_eq!(estimate_drift(&[0, 500, 1_000], 0.05), 500);
        assert_eq!(estimate_drift(&[], 0.05), 0);
        assert_eq!(estimate_drift(&[7], 0.05), 0);
    }

    #[test]
    fn non_increasing_pairs_are_skipped() {
        assert_eq!(estimate_drift(&[100, 200, 200, 300], 0.05), 100);
    }

    #[test]
    fn drift_is_cached_once_nonzero() {
        let mut drift = DriftDelta::new(0.05);
        let mut timeline = PresentationTimeline::new();

        assert_eq!(drift.get(&timeline), 0);
        assert!(!drift.is_known());

        timeline.record(Some(100), &mut drift);
        timeline.record(Some(200), &mut drift);
        assert_eq!(drift.get(&timeline), 100);

        timeline.record(Some(1_000), &mut drift);
        assert_eq!(drift.get(&timeline), 100);
    }

    #[test]
    fn first_entry_is_taken_as_is() {
        let mut drift = DriftDelta::new(0.05);
        let mut timeline = PresentationTimeline::new();

        assert_eq!(timeline.record(Some(0), &mut drift), Some(0));
        assert_eq!(timeline.as_slice(), &[0]);
    }

    #[test]
    fn iterations_without_output_are_not_recorded() {
        let mut drift = DriftDelta::new(0.05);
        let mut timeline = PresentationTimeline::new();

        assert_eq!(timeline.record(None, &mut drift), None);
        assert!(timeline.is_empty());
    }

    #[test]
    fn stale_candidates_are_extrapolated() {
        let mut drift = DriftDelta::new(0.05);
        let mut timeline = PresentationTimeline::from_entries(vec![100, 200, 300]);

        assert_eq!(timeline.record(Some(250), &mut drift), Some(400));
        assert_eq!(timeline.record(Some(400), &mut drift), Some(500));
        assert_eq!(timeline.record(Some(900), &mut drift), Some(900));
    }

    #[test]
    fn stale_candidate_without_drift_repeats_last() {
        let mut drift = DriftDelta::new(0.05);
        let mut timeline = PresentationTimeline::new();
        timeline.record(Some(0), &mut drift);

        assert_eq!(timeline.record(Some(0), &mut drift), Some(0));
        assert!(timeline.as_slice().windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn extrapolates_past_the_end() {
        let timeline = PresentationTimeline::from_entries(vec![0, 10, 20]);

        assert_eq!(timeline.extrapolate(1, 10), 10);
        assert_eq!(timeline.extrapolate(3, 10), 30);
        assert_eq!(timeline.extrapolate(5, 10), 50);
        assert_eq!(PresentationTimeline::new().extrapolate(0, 7), 7);
    }
}
