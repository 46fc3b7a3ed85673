use std::time::Duration;

use avmix_media_info::samples_to_le_bytes;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::{
    BufferFlags, Codec, ContainerWriter, DequeueOutput, MixError, OutputBuffer, PresentationTimeline,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub submitted: usize,
    /// Mixed buffers the encoder had no input slot for.
    pub rejected: usize,
    pub written: usize,
    /// Units stamped earlier than the last written one.
    pub dropped: usize,
    pub codec_config_skipped: usize,
}

/// Re-encodes mixed PCM and writes it to the container.
///
/// Every encoded unit is stamped with the timestamp its input was submitted
/// at, whatever the encoder reported, so units drained after one submit share
/// a stamp. A unit is written when its stamp is not earlier than the last
/// written one; older units are dropped.
pub struct EncodeMuxSink<E: Codec, W: ContainerWriter> {
    encoder: E,
    writer: W,
    timeout: Duration,
    track: Option<usize>,
    last_written_us: Option<i64>,
    last_assigned_us: Option<i64>,
    stats: SinkStats,
}

impl<E: Codec, W: ContainerWriter> EncodeMuxSink<E, W> {
    pub fn new(encoder: E, writer: W, timeout: Duration) -> Self {
        Self {
            encoder,
            writer,
            timeout,
            track: None,
            last_written_us: None,
            last_assigned_us: None,
            stats: SinkStats::default(),
        }
    }

    pub fn start(&mut self) -> Result<(), MixError> {
        self.encoder.start()?;
        Ok(())
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Feeds the whole mixed sequence in order. Buffer `k` (counting only
    /// non-empty buffers) is stamped with timeline entry `k`, or an
    /// extrapolation past the end of the timeline.
    pub fn write_all<'a>(
        &mut self,
        buffers: impl IntoIterator<Item = &'a [i16]>,
        timeline: &PresentationTimeline,
        drift_us: i64,
    ) -> Result<(), MixError> {
        let mut counter = 0;

        for samples in buffers {
            if samples.is_empty() {
                continue;
            }

            let presentation_time_us = timeline.extrapolate(counter, drift_us);
            counter += 1;

            self.submit(samples, presentation_time_us)?;
        }

        Ok(())
    }

    pub fn submit(&mut self, samples: &[i16], presentation_time_us: i64) -> Result<(), MixError> {
        let data = samples_to_le_bytes(samples);

        match self.encoder.dequeue_input_slot(self.timeout)? {
            Some(slot) => {
                self.encoder
                    .queue_input(slot, &data, presentation_time_us, BufferFlags::NONE)?;
                self.stats.submitted += 1;
            }
            None => {
                warn!(presentation_time_us, "encoder has no free input slot, buffer skipped");
                self.stats.rejected += 1;
            }
        }

        self.last_assigned_us = Some(presentation_time_us);
        self.drain(&mut || presentation_time_us)?;

        Ok(())
    }

    /// Signals end of input and drains the encoder until it reports end of
    /// stream or `max_attempts` polls in a row come back empty. Tail units are
    /// stamped `last + drift * k`.
    pub fn flush(&mut self, drift_us: i64, max_attempts: u32) -> Result<(), MixError> {
        let base = self.last_assigned_us.unwrap_or(0);
        let step = drift_us.max(1);
        let mut multiplier = 0i64;
        let mut next_stamp = || {
            multiplier += 1;
            base.saturating_add(step.saturating_mul(multiplier))
        };

        let mut queued = false;
        let mut idle = 0;

        while idle < max_attempts {
            let slot = if queued {
                None
            } else {
                self.encoder.dequeue_input_slot(self.timeout)?
            };

            if let Some(slot) = slot {
                self.encoder.queue_input(
                    slot,
                    &[],
                    base.saturating_add(step),
                    BufferFlags::END_OF_STREAM,
                )?;
                queued = true;
            }

            let before = self.stats.written + self.stats.dropped;
            if self.drain(&mut next_stamp)? {
                debug!(written = self.stats.written, "encoder flushed");
                return Ok(());
            }

            if self.stats.written + self.stats.dropped == before {
                idle += 1;
            } else {
                idle = 0;
            }
        }

        warn!(max_attempts, "encoder did not signal end of stream");
        Ok(())
    }

    /// Stops the encoder and finalizes the container.
    pub fn finish(mut self) -> Result<SinkStats, MixError> {
        self.encoder.stop()?;

        if self.track.is_some() {
            self.writer.stop()?;
            info!(
                written = self.stats.written,
                dropped = self.stats.dropped,
                "container finalized"
            );
        } else {
            warn!("encoder never reported an output format, nothing written");
        }

        Ok(self.stats)
    }

    /// Drains everything currently available. Returns `true` once the
    /// encoder reports end of stream.
    fn drain(&mut self, stamp: &mut dyn FnMut() -> i64) -> Result<bool, MixError> {
        loop {
            match self.encoder.dequeue_output(self.timeout)? {
                DequeueOutput::Buffer(output) => {
                    let end_of_stream = output.flags.is_end_of_stream();

                    if output.flags.is_codec_config() {
                        self.stats.codec_config_skipped += 1;
                    } else if output.size > 0 {
                        self.write_unit(output, stamp())?;
                    }

                    self.encoder.release_output(output.slot)?;

                    if end_of_stream {
                        return Ok(true);
                    }
                }
                DequeueOutput::TryAgainLater => return Ok(false),
                DequeueOutput::FormatChanged => self.on_format_changed()?,
                DequeueOutput::BuffersChanged => debug!("encoder output buffers changed"),
                DequeueOutput::Unknown(code) => {
                    warn!(code, "unknown status from encoder output dequeue")
                }
            }
        }
    }

    fn on_format_changed(&mut self) -> Result<(), MixError> {
        if self.track.is_some() {
            return Err(MixError::FormatChangedTwice);
        }

        let format = self
            .encoder
            .output_format()
            .ok_or(MixError::MissingOutputFormat)?;

        let track = self.writer.add_track(&format)?;
        self.writer.start()?;
        self.track = Some(track);

        info!(
            track,
            codec = ?format.codec,
            sample_rate = format.sample_rate,
            channels = format.channels,
            "container writer started"
        );

        Ok(())
    }

    fn write_unit(&mut self, output: OutputBuffer, presentation_time_us: i64) -> Result<(), MixError> {
        avmix_fail::fail_err!("sink_write", MixError::Injected("sink_write"));

        let track = self.track.ok_or(MixError::WriterNotStarted)?;

        if self
            .last_written_us
            .is_some_and(|last| presentation_time_us < last)
        {
            trace!(presentation_time_us, "dropping out-of-order unit");
            self.stats.dropped += 1;
            return Ok(());
        }

        let data = self.encoder.output_data(output.slot)?;
        let data = &data[..output.size.min(data.len())];
        let flags = if output.flags.contains(BufferFlags::KEY_FRAME) {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };

        self.writer
            .write_sample(track, data, presentation_time_us, flags)?;

        self.last_written_us = Some(presentation_time_us);
        self.stats.written += 1;

        Ok(())
    }
}
