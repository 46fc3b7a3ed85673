use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::{DriftDelta, MixContext, PresentationTimeline, TrackBuffer};

/// Realizes per-track start delays by prepending shared silence buffers.
#[derive(Debug, Clone)]
pub struct SilencePadder {
    delays_us: Vec<i64>,
}

impl SilencePadder {
    pub fn new(delays_us: Vec<i64>) -> Self {
        Self { delays_us }
    }

    pub fn has_delays(&self) -> bool {
        self.delays_us.iter().any(|delay| *delay > 0)
    }

    /// Number of timeline positions that fall before `delay_us`.
    ///
    /// Walks the timeline from its first entry and, once it runs out, keeps
    /// stepping by the drift delta. Stops early (with a warning) if the
    /// timeline is exhausted and no positive drift is available, since the
    /// delay could never be reached.
    pub fn padding_for(
        delay_us: i64,
        timeline: &PresentationTimeline,
        drift: &mut DriftDelta,
    ) -> usize {
        let mut count = 0;
        let mut index = 0;
        let mut position = timeline.first().unwrap_or(0);

        while position < delay_us {
            count += 1;
            index += 1;

            position = match timeline.get(index) {
                Some(next) => next,
                None => {
                    let step = drift.get(timeline);
                    if step <= 0 {
                        warn!(
                            delay_us,
                            position, count, "no drift estimate, delay padding cut short"
                        );
                        break;
                    }
                    position.saturating_add(step)
                }
            };
        }

        count
    }

    /// Prepends the padding to every delayed track and returns how many
    /// silence buffers each track received.
    pub fn apply(
        &self,
        buffers: &mut [VecDeque<TrackBuffer>],
        timeline: &PresentationTimeline,
        drift: &mut DriftDelta,
        ctx: &mut MixContext,
    ) -> Vec<usize> {
        let mut padded = vec![0; buffers.len()];

        for ((track, list), delay_us) in buffers.iter_mut().enumerate().zip(&self.delays_us) {
            if *delay_us <= 0 {
                continue;
            }

            let count = Self::padding_for(*delay_us, timeline, drift);
            let silence = ctx.silence();
            for _ in 0..count {
                list.push_front(TrackBuffer::Silence(silence.clone()));
            }

            debug!(track, delay_us, count, "padded track start");
            padded[track] = count;
        }

        padded
    }
}
