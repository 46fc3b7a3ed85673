use std::collections::VecDeque;
use std::time::Duration;

use avmix_media_info::{AudioCodec, PcmInfo, TrackFormat};
use avmix_mixer::{BufferFlags, Codec, CodecError, DequeueOutput, OutputBuffer};
use ffmpeg::{ChannelLayout, Packet, codec, frame, software::resampling, sys::EAGAIN};
use tracing::{debug, warn};

use crate::{FfmpegDemuxer, MICROS_TIME_BASE, ffmpeg_err};

const SLOT: usize = 0;

struct Decoded {
    data: Vec<u8>,
    presentation_time_us: i64,
    flags: BufferFlags,
}

/// Decodes one compressed stream to interleaved 16-bit PCM in a fixed layout.
///
/// Packets are stamped in microseconds on the way in, so decoded frames come
/// back in microseconds too.
pub struct FfmpegDecoder {
    decoder: codec::decoder::Audio,
    output: PcmInfo,
    resampler: Option<resampling::Context>,
    stashed: Option<Packet>,
    eof_pending: bool,
    eof_sent: bool,
    finished: bool,
    started: bool,
    announced: bool,
    next_pts_us: i64,
    queue: VecDeque<Decoded>,
    held: Option<Decoded>,
}

impl FfmpegDecoder {
    pub fn new(demuxer: &FfmpegDemuxer, output: PcmInfo) -> Result<Self, CodecError> {
        let mut decoder = codec::Context::from_parameters(demuxer.parameters().clone())
            .and_then(|ctx| ctx.decoder().audio())
            .map_err(ffmpeg_err)?;

        if decoder.channel_layout().is_empty() {
            decoder.set_channel_layout(ChannelLayout::default(decoder.channels() as i32));
        }
        decoder.set_packet_time_base(MICROS_TIME_BASE);

        debug!(
            path = %demuxer.path().display(),
            rate = decoder.rate(),
            channels = decoder.channels(),
            target = ?output,
            "decoder created"
        );

        Ok(Self {
            decoder,
            output,
            resampler: None,
            stashed: None,
            eof_pending: false,
            eof_sent: false,
            finished: false,
            started: false,
            announced: false,
            next_pts_us: 0,
            queue: VecDeque::new(),
            held: None,
        })
    }

    /// Retries whatever the decoder refused last time. Returns `true` once
    /// nothing is waiting.
    fn send_pending(&mut self) -> Result<bool, CodecError> {
        if let Some(packet) = self.stashed.take() {
            match self.decoder.send_packet(&packet) {
                Ok(()) => {}
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => {
                    self.stashed = Some(packet);
                    return Ok(false);
                }
                Err(e) => return Err(ffmpeg_err(e)),
            }
        }

        if self.eof_pending {
            match self.decoder.send_eof() {
                Ok(()) | Err(ffmpeg::Error::Eof) => {
                    self.eof_pending = false;
                    self.eof_sent = true;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => return Ok(false),
                Err(e) => return Err(ffmpeg_err(e)),
            }
        }

        Ok(true)
    }

    fn receive_frames(&mut self) -> Result<(), CodecError> {
        let mut decoded = frame::Audio::empty();

        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let pts = decoded.timestamp().or(decoded.pts());
                    let samples = self.resample(&decoded)?;
                    self.push(samples, pts);
                }
                Err(ffmpeg::Error::Eof) => {
                    let tail = self.flush_resampler()?;
                    self.push(tail, None);
                    self.queue.push_back(Decoded {
                        data: Vec::new(),
                        presentation_time_us: self.next_pts_us,
                        flags: BufferFlags::END_OF_STREAM,
                    });
                    self.finished = true;
                    return Ok(());
                }
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => return Ok(()),
                Err(e) => return Err(ffmpeg_err(e)),
            }
        }
    }

    fn push(&mut self, data: Vec<u8>, pts_us: Option<i64>) {
        if data.is_empty() {
            return;
        }

        let presentation_time_us = pts_us.unwrap_or(self.next_pts_us);
        let duration = self.output.duration_of(data.len() / 2);
        self.next_pts_us = presentation_time_us + duration.as_micros() as i64;

        self.queue.push_back(Decoded {
            data,
            presentation_time_us,
            flags: BufferFlags::NONE,
        });
    }

    fn resample(&mut self, input: &frame::Audio) -> Result<Vec<u8>, CodecError> {
        let output = self.output;
        let capacity = (input.samples() as u64 * u64::from(output.sample_rate)
            / u64::from(input.rate().max(1))) as usize
            + 256;

        let mut resampled =
            frame::Audio::new(output.sample_format(), capacity, output.channel_layout());
        resampled.set_rate(output.sample_rate);

        if self.resampler.is_none() {
            self.resampler = Some(create_resampler(input, output)?);
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        resampler.run(input, &mut resampled).map_err(ffmpeg_err)?;

        Ok(packed_bytes(&resampled, output))
    }

    fn flush_resampler(&mut self) -> Result<Vec<u8>, CodecError> {
        let output = self.output;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };

        let mut tail = Vec::new();
        while resampler.delay().is_some() {
            let mut resampled = frame::Audio::new(output.sample_format(), 1024, output.channel_layout());
            resampled.set_rate(output.sample_rate);

            resampler.flush(&mut resampled).map_err(ffmpeg_err)?;
            if resampled.samples() == 0 {
                break;
            }
            tail.extend(packed_bytes(&resampled, output));
        }

        Ok(tail)
    }
}

fn create_resampler(input: &frame::Audio, output: PcmInfo) -> Result<resampling::Context, CodecError> {
    let layout = if input.channel_layout().is_empty() {
        ChannelLayout::default(input.channels() as i32)
    } else {
        input.channel_layout()
    };

    ffmpeg::software::resampler(
        (input.format(), layout, input.rate()),
        (
            output.sample_format(),
            output.channel_layout(),
            output.sample_rate,
        ),
    )
    .map_err(ffmpeg_err)
}

fn packed_bytes(frame: &frame::Audio, info: PcmInfo) -> Vec<u8> {
    let len = frame.samples() * info.bytes_per_frame();
    frame.data(0)[..len].to_vec()
}

impl Codec for FfmpegDecoder {
    fn start(&mut self) -> Result<(), CodecError> {
        self.started = true;
        Ok(())
    }

    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        if !self.started {
            return Err(CodecError::NotStarted);
        }
        if self.eof_pending || self.eof_sent {
            return Ok(None);
        }

        Ok(self.send_pending()?.then_some(SLOT))
    }

    fn queue_input(
        &mut self,
        slot: usize,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        if slot != SLOT {
            return Err(CodecError::InvalidSlot(slot));
        }

        if !data.is_empty() {
            let mut packet = Packet::copy(data);
            packet.set_pts(Some(presentation_time_us));
            packet.set_dts(Some(presentation_time_us));
            self.stashed = Some(packet);
        }

        if flags.is_end_of_stream() {
            self.eof_pending = true;
        }

        self.send_pending()?;

        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<DequeueOutput, CodecError> {
        if !self.started {
            return Err(CodecError::NotStarted);
        }

        if self.queue.is_empty() && !self.finished {
            self.send_pending()?;
            self.receive_frames()?;
        }

        if !self.announced && self.resampler.is_some() {
            self.announced = true;
            return Ok(DequeueOutput::FormatChanged);
        }

        let Some(decoded) = self.queue.pop_front() else {
            return Ok(DequeueOutput::TryAgainLater);
        };

        if self.held.is_some() {
            warn!("decoder output slot was not released");
        }

        let output = OutputBuffer {
            slot: SLOT,
            size: decoded.data.len(),
            presentation_time_us: decoded.presentation_time_us,
            flags: decoded.flags,
        };
        self.held = Some(decoded);

        Ok(DequeueOutput::Buffer(output))
    }

    fn output_data(&self, slot: usize) -> Result<&[u8], CodecError> {
        match (&self.held, slot) {
            (Some(decoded), SLOT) => Ok(&decoded.data),
            _ => Err(CodecError::InvalidSlot(slot)),
        }
    }

    fn release_output(&mut self, slot: usize) -> Result<(), CodecError> {
        if slot != SLOT || self.held.take().is_none() {
            return Err(CodecError::InvalidSlot(slot));
        }

        Ok(())
    }

    fn output_format(&self) -> Option<TrackFormat> {
        Some(TrackFormat::new(
            AudioCodec::PcmS16le,
            self.output.sample_rate,
            self.output.channels,
        ))
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.started = false;
        self.queue.clear();
        self.held = None;
        self.stashed = None;
        Ok(())
    }
}
