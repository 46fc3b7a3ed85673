//! Round-robin decoding of every input track into per-track PCM lists.

use std::collections::VecDeque;
use std::time::Duration;

use avmix_media_info::le_bytes_to_samples;
use tracing::{debug, info, trace, warn};

use crate::{
    BufferFlags, Codec, DequeueOutput, Demuxer, DriftDelta, MixContext, MixError, MixerConfig,
    PresentationTimeline, TrackBuffer, TrackSource,
};

/// One input track with everything that drives it.
struct DecodeTrack<D, C> {
    source: TrackSource,
    demuxer: D,
    decoder: C,
    input_ended: bool,
    output_ended: bool,
    buffers: VecDeque<TrackBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fed {
    Nothing,
    Sample,
    /// An empty unit stamped before the track's start offset.
    Muted,
    EndOfInput,
}

impl<D: Demuxer, C: Codec> DecodeTrack<D, C> {
    fn feed(&mut self, scratch: &mut Vec<u8>, timeout: Duration) -> Result<Fed, MixError> {
        if self.input_ended {
            return Ok(Fed::Nothing);
        }

        let Some(slot) = self.decoder.dequeue_input_slot(timeout)? else {
            return Ok(Fed::Nothing);
        };

        let Some(size) = self.demuxer.read_sample(scratch)? else {
            self.input_ended = true;
            self.decoder
                .queue_input(slot, &[], 0, BufferFlags::END_OF_STREAM)?;
            return Ok(Fed::EndOfInput);
        };

        let presentation_time_us = self.demuxer.sample_time_us();
        let fed = if presentation_time_us < self.source.start_at_us() {
            self.decoder
                .queue_input(slot, &[], presentation_time_us, BufferFlags::NONE)?;
            Fed::Muted
        } else {
            let size = size.min(scratch.len());
            self.decoder.queue_input(
                slot,
                &scratch[..size],
                presentation_time_us,
                BufferFlags::NONE,
            )?;
            Fed::Sample
        };

        self.demuxer.advance()?;

        Ok(fed)
    }

    /// Returns the presentation time of the decoded buffer, if there was one.
    fn drain(
        &mut self,
        track: usize,
        iteration: u64,
        timeout: Duration,
        ctx: &mut MixContext,
    ) -> Result<Option<i64>, MixError> {
        if self.output_ended {
            return Ok(None);
        }

        let output = match self.decoder.dequeue_output(timeout)? {
            DequeueOutput::Buffer(output) => output,
            DequeueOutput::TryAgainLater => return Ok(None),
            DequeueOutput::FormatChanged => {
                debug!(track, "decoder output format changed");
                return Ok(None);
            }
            DequeueOutput::BuffersChanged => return Ok(None),
            DequeueOutput::Unknown(code) => {
                warn!(track, code, "unknown status from decoder output dequeue");
                return Ok(None);
            }
        };

        let mut decoded = None;

        if output.size > 0 {
            let data = self.decoder.output_data(output.slot)?;
            let samples = le_bytes_to_samples(&data[..output.size.min(data.len())]);

            if !samples.is_empty() {
                ctx.observe_unit_size(samples.len());
                self.buffers.push_back(TrackBuffer::Decoded {
                    track,
                    iteration,
                    samples: samples.into(),
                });
                decoded = Some(output.presentation_time_us);
            }
        }

        self.decoder.release_output(output.slot)?;

        if output.flags.is_end_of_stream() {
            self.output_ended = true;
            debug!(track, buffers = self.buffers.len(), "track reached end of stream");
        }

        Ok(decoded)
    }
}

/// What the decode phase leaves for mixing.
#[derive(Debug)]
pub struct DecodeOutput {
    pub buffers: Vec<VecDeque<TrackBuffer>>,
    pub timeline: PresentationTimeline,
    pub drift: DriftDelta,
    pub ctx: MixContext,
    pub iterations: u64,
    /// The loop ended on the stall budget rather than end of stream.
    pub stalled: bool,
}

/// Drives N decoders until every track reached end of stream, or until
/// `stall_budget` consecutive iterations produced no output at all.
pub struct DecodeLoop<D: Demuxer, C: Codec> {
    tracks: Vec<DecodeTrack<D, C>>,
    stall_budget: u32,
    drift_tolerance: f64,
    timeout: Duration,
}

impl<D: Demuxer, C: Codec> DecodeLoop<D, C> {
    pub fn new(config: &MixerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            stall_budget: config.stall_budget,
            drift_tolerance: config.drift_tolerance,
            timeout: config.decode_timeout(),
        }
    }

    /// `decoder` must already be started and `demuxer` positioned on its
    /// audio track.
    pub fn add_track(&mut self, source: TrackSource, demuxer: D, decoder: C) {
        self.tracks.push(DecodeTrack {
            source,
            demuxer,
            decoder,
            input_ended: false,
            output_ended: false,
            buffers: VecDeque::new(),
        });
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn all_ended(&self) -> bool {
        self.tracks.iter().all(|track| track.output_ended)
    }

    pub fn run(mut self) -> Result<DecodeOutput, MixError> {
        let mut ctx = MixContext::new();
        let mut timeline = PresentationTimeline::new();
        let mut drift = DriftDelta::new(self.drift_tolerance);
        let mut scratch = Vec::new();

        let mut idle = 0;
        let mut iterations = 0u64;

        let result = loop {
            if self.all_ended() || idle >= self.stall_budget {
                break Ok(());
            }
            idle += 1;

            if let Err(e) = self.iterate(
                iterations,
                &mut idle,
                &mut scratch,
                &mut ctx,
                &mut timeline,
                &mut drift,
            ) {
                break Err(e);
            }

            iterations += 1;
        };

        for (index, track) in self.tracks.iter_mut().enumerate() {
            if let Err(e) = track.decoder.stop() {
                warn!(track = index, "failed to stop decoder: {e}");
            }
        }

        result?;

        let stalled = !self.all_ended();
        if stalled {
            info!(
                iterations,
                stall_budget = self.stall_budget,
                "decode loop stopped on stall budget"
            );
        } else {
            info!(iterations, timeline = timeline.len(), "all tracks decoded");
        }

        Ok(DecodeOutput {
            buffers: self
                .tracks
                .into_iter()
                .map(|track| track.buffers)
                .collect(),
            timeline,
            drift,
            ctx,
            iterations,
            stalled,
        })
    }

    fn iterate(
        &mut self,
        iteration: u64,
        idle: &mut u32,
        scratch: &mut Vec<u8>,
        ctx: &mut MixContext,
        timeline: &mut PresentationTimeline,
        drift: &mut DriftDelta,
    ) -> Result<(), MixError> {
        avmix_fail::fail_err!("decode_loop", MixError::Injected("decode_loop"));

        for track in &mut self.tracks {
            if track.feed(scratch, self.timeout)? == Fed::Muted {
                *idle = 0;
            }
        }

        let mut candidate: Option<i64> = None;

        for (index, track) in self.tracks.iter_mut().enumerate() {
            match track.drain(index, iteration, self.timeout, ctx)? {
                Some(presentation_time_us) => {
                    *idle = 0;
                    candidate = Some(candidate.map_or(presentation_time_us, |current| {
                        current.min(presentation_time_us)
                    }));
                }
                None => {
                    drift.get(timeline);
                }
            }
        }

        let recorded = timeline.record(candidate, drift);
        trace!(iteration, ?candidate, ?recorded, "decode iteration");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_backend::{FakeBackend, FakeTrack};
    use crate::MediaBackend;
    use avmix_media_info::{AudioCodec, PcmInfo, TrackFormat};

    const STEP: i64 = 100_000;

    fn format() -> TrackFormat {
        TrackFormat::new(AudioCodec::Aac, 48_000, 2)
    }

    fn decode(
        backend: &FakeBackend,
        sources: Vec<TrackSource>,
        config: &MixerConfig,
    ) -> DecodeOutput {
        let mut decode_loop = DecodeLoop::new(config);

        for source in sources {
            let mut demuxer = backend.open_demuxer(source.path()).unwrap();
            demuxer.select_track(0).unwrap();
            let mut decoder = backend
                .create_decoder(&demuxer, PcmInfo::new_raw(48_000, 2))
                .unwrap();
            decoder.start().unwrap();
            decode_loop.add_track(source, demuxer, decoder);
        }

        decode_loop.run().unwrap()
    }

    #[test]
    fn decodes_every_track_to_end_of_stream() {
        let backend = FakeBackend::new()
            .with_track("a", FakeTrack::constant(format(), 5, 4, STEP, 10))
            .with_track("b", FakeTrack::constant(format(), 3, 4, STEP, 20));

        let output = decode(
            &backend,
            vec![TrackSource::new("a"), TrackSource::new("b")],
            &MixerConfig::default(),
        );

        assert!(!output.stalled);
        assert_eq!(output.buffers[0].len(), 5);
        assert_eq!(output.buffers[1].len(), 3);
        assert_eq!(output.timeline.as_slice(), &[0, STEP, 2 * STEP, 3 * STEP, 4 * STEP]);
        assert_eq!(output.ctx.unit_size(), Some(4));
    }

    #[test]
    fn unknown_decoder_status_is_skipped() {
        let tracks = |backend: FakeBackend| {
            backend
                .with_track("a", FakeTrack::ramp(format(), 5, 4, STEP))
                .with_track("b", FakeTrack::constant(format(), 3, 4, STEP, 20))
        };
        let sources = || vec![TrackSource::new("a"), TrackSource::new("b")];

        let plain = decode(&tracks(FakeBackend::new()), sources(), &MixerConfig::default());
        let noisy = decode(
            &tracks(FakeBackend::new().with_unknown_status(4)),
            sources(),
            &MixerConfig::default(),
        );

        assert!(!noisy.stalled);
        assert!(noisy.iterations > plain.iterations);
        assert_eq!(noisy.timeline.as_slice(), plain.timeline.as_slice());
        for (got, expected) in noisy.buffers.iter().zip(&plain.buffers) {
            let got: Vec<_> = got.iter().map(TrackBuffer::samples).collect();
            let expected: Vec<_> = expected.iter().map(TrackBuffer::samples).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn samples_before_start_are_never_decoded() {
        let backend = FakeBackend::new().with_track("a", FakeTrack::ramp(format(), 10, 2, STEP));

        let output = decode(
            &backend,
            vec![TrackSource::new("a").with_start_at_us(4 * STEP)],
            &MixerConfig::default(),
        );

        assert_eq!(output.buffers[0].len(), 6);
        assert!(
            output.buffers[0]
                .iter()
                .all(|buffer| buffer.samples().iter().all(|sample| *sample >= 5))
        );
        assert_eq!(output.timeline.first(), Some(4 * STEP));
    }

    #[test]
    fn stalls_when_a_decoder_never_finishes() {
        let backend = FakeBackend::new()
            .with_track("a", FakeTrack::constant(format(), 2, 4, STEP, 1))
            .with_silent_decoder("a");

        let config = MixerConfig::default().with_stall_budget(7);
        let output = decode(&backend, vec![TrackSource::new("a")], &config);

        assert!(output.stalled);
        assert!(output.buffers[0].is_empty());
        assert!(output.timeline.is_empty());
        // Two samples and the end-of-input unit reset nothing, so the budget
        // alone ends the loop.
        assert_eq!(output.iterations, 7);
    }

    #[test]
    fn buffers_remember_their_iteration() {
        let backend = FakeBackend::new().with_track("a", FakeTrack::constant(format(), 3, 4, STEP, 1));

        let output = decode(&backend, vec![TrackSource::new("a")], &MixerConfig::default());

        let iterations: Vec<u64> = output.buffers[0]
            .iter()
            .map(|buffer| match buffer {
                TrackBuffer::Decoded { iteration, .. } => *iteration,
                TrackBuffer::Silence(_) => u64::MAX,
            })
            .collect();
        assert_eq!(iterations, vec![0, 1, 2]);
    }
}
