use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::{MixContext, PresentationTimeline, Samples, TrackBuffer};

const SAMPLE_SCALE: f32 = 32768.0;

/// Sums `inputs` with per-input gain.
///
/// Samples are normalized to [-1, 1], scaled by their input's volume and added
/// to a running accumulator that is hard clipped after every input, so the
/// result depends on input order once clipping kicks in. The accumulator
/// grows to the longest input. Conversion back truncates toward zero and
/// saturates at the i16 range.
pub fn mix_samples(inputs: &[&[i16]], volumes: &[f32]) -> Vec<i16> {
    let mut accumulator: Vec<f32> = Vec::new();

    for (input, volume) in inputs.iter().zip(volumes) {
        if accumulator.len() < input.len() {
            accumulator.resize(input.len(), 0.0);
        }

        for (acc, sample) in accumulator.iter_mut().zip(input.iter()) {
            *acc = (*acc + *sample as f32 / SAMPLE_SCALE * volume).clamp(-1.0, 1.0);
        }
    }

    accumulator
        .into_iter()
        .map(|value| (value * SAMPLE_SCALE) as i16)
        .collect()
}

/// Folds the per-track buffer lists into one mixed sequence.
#[derive(Debug, Clone)]
pub struct Mixer {
    volumes: Vec<f32>,
    general_delay_us: i64,
    has_track_delays: bool,
}

#[derive(Debug, Default)]
pub struct MixedOutput {
    pub buffers: Vec<Samples>,
    /// Silence buffers prepended for the general delay.
    pub delay_padding: usize,
}

impl Mixer {
    pub fn new(volumes: Vec<f32>) -> Self {
        Self {
            volumes,
            general_delay_us: 0,
            has_track_delays: false,
        }
    }

    /// The general delay only applies when no track carries its own delay.
    pub fn with_general_delay(mut self, general_delay_us: i64, has_track_delays: bool) -> Self {
        self.general_delay_us = general_delay_us;
        self.has_track_delays = has_track_delays;
        self
    }

    /// A single full-volume track is handed through untouched.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.volumes.as_slice(), [volume] if *volume >= 1.0)
    }

    pub fn mix(
        &self,
        mut buffers: Vec<VecDeque<TrackBuffer>>,
        timeline: &PresentationTimeline,
        ctx: &mut MixContext,
    ) -> MixedOutput {
        let iterations = buffers.iter().map(VecDeque::len).max().unwrap_or(0);
        let passthrough = self.is_passthrough();
        let apply_general_delay = !self.has_track_delays && self.general_delay_us > 0;

        let mut mixed = VecDeque::with_capacity(iterations);
        let mut delay_padding = 0;

        for index in 0..iterations {
            let row: Vec<Samples> = buffers
                .iter_mut()
                .map(|list| match list.pop_front() {
                    Some(buffer) => buffer.shared_samples(),
                    None => ctx.silence(),
                })
                .collect();

            let output: Samples = if passthrough {
                row[0].clone()
            } else {
                let inputs: Vec<&[i16]> = row.iter().map(|samples| &samples[..]).collect();
                mix_samples(&inputs, &self.volumes).into()
            };

            trace!(index, samples = output.len(), "mixed iteration");

            if apply_general_delay
                && timeline
                    .get(index)
                    .is_some_and(|value| value < self.general_delay_us)
            {
                let silence = ctx.silence_or(output.len());
                mixed.push_front(silence);
                delay_padding += 1;
            }

            mixed.push_back(output);
        }

        debug!(
            iterations,
            delay_padding, passthrough, "mixed track buffers"
        );

        MixedOutput {
            buffers: mixed.into(),
            delay_padding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn decoded(track: usize, samples: Vec<i16>) -> TrackBuffer {
        TrackBuffer::Decoded {
            track,
            iteration: 0,
            samples: Arc::from(samples),
        }
    }

    #[test]
    fn normalizes_scales_and_truncates() {
        assert_eq!(mix_samples(&[&[16384, -16384, 3]], &[0.5]), vec![8192, -8192, 1]);
    }

    #[test]
    fn clips_instead_of_overflowing() {
        let loud: &[i16] = &[i16::MAX, i16::MIN, 20_000];

        let mixed = mix_samples(&[loud; 8], &[1.0; 8]);

        assert_eq!(mixed, vec![i16::MAX, i16::MIN, i16::MAX]);
    }

    #[test]
    fn clipping_is_applied_per_track() {
        // Clipped to 1.0 after the first two tracks, then pulled back down.
        let mixed = mix_samples(&[&[30_000], &[30_000], &[-16_384]], &[1.0, 1.0, 1.0]);

        assert_eq!(mixed, vec![16_384]);
    }

    #[test]
    fn accumulator_grows_to_longest_input() {
        let mixed = mix_samples(&[&[100], &[100, 200, 300]], &[1.0, 1.0]);

        assert_eq!(mixed, vec![200, 200, 300]);
    }

    #[test]
    fn single_full_volume_track_passes_through() {
        let samples: Samples = Arc::from(vec![i16::MIN, -1, 0, 1, i16::MAX]);
        let buffers = vec![VecDeque::from(vec![TrackBuffer::Decoded {
            track: 0,
            iteration: 0,
            samples: samples.clone(),
        }])];

        let mixer = Mixer::new(vec![1.0]);
        let output = mixer.mix(buffers, &PresentationTimeline::new(), &mut MixContext::new());

        assert!(mixer.is_passthrough());
        assert!(Arc::ptr_eq(&output.buffers[0], &samples));
    }

    #[test]
    fn single_quiet_track_is_scaled() {
        let buffers = vec![VecDeque::from(vec![decoded(0, vec![1000, -1000])])];

        let output = Mixer::new(vec![0.5]).mix(
            buffers,
            &PresentationTimeline::new(),
            &mut MixContext::new(),
        );

        assert_eq!(&*output.buffers[0], &[500, -500]);
    }

    #[test]
    fn shorter_track_is_filled_with_silence() {
        let mut ctx = MixContext::new();
        ctx.observe_unit_size(2);

        let buffers = vec![
            VecDeque::from(vec![decoded(0, vec![10, 10]), decoded(0, vec![20, 20])]),
            VecDeque::from(vec![decoded(1, vec![2, 2])]),
        ];

        let output = Mixer::new(vec![1.0, 1.0]).mix(buffers, &PresentationTimeline::new(), &mut ctx);

        assert_eq!(output.buffers.len(), 2);
        assert_eq!(&*output.buffers[0], &[12, 12]);
        assert_eq!(&*output.buffers[1], &[20, 20]);
    }

    #[test]
    fn general_delay_prepends_silence() {
        let mut ctx = MixContext::new();
        ctx.observe_unit_size(1);
        let timeline = PresentationTimeline::from_entries(vec![0, 100, 200, 300]);
        let buffers = vec![VecDeque::from(vec![
            decoded(0, vec![1]),
            decoded(0, vec![2]),
            decoded(0, vec![3]),
            decoded(0, vec![4]),
        ])];

        let output = Mixer::new(vec![1.0])
            .with_general_delay(150, false)
            .mix(buffers, &timeline, &mut ctx);

        assert_eq!(output.delay_padding, 2);
        let flat: Vec<i16> = output.buffers.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(flat, vec![0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn general_delay_is_ignored_with_track_delays() {
        let timeline = PresentationTimeline::from_entries(vec![0, 100]);
        let buffers = vec![VecDeque::from(vec![decoded(0, vec![1]), decoded(0, vec![2])])];

        let output = Mixer::new(vec![1.0])
            .with_general_delay(150, true)
            .mix(buffers, &timeline, &mut MixContext::new());

        assert_eq!(output.delay_padding, 0);
        assert_eq!(output.buffers.len(), 2);
    }
}
