use std::collections::VecDeque;
use std::time::Duration;

use avmix_media_info::{
    AudioCodec, ChannelLayout, FFRational, PcmInfo, Sample, TrackFormat, channel_layout_for,
};
use avmix_mixer::{BufferFlags, Codec, CodecError, DequeueOutput, EncoderSettings, OutputBuffer};
use ffmpeg::{
    Packet,
    codec::{self, context, encoder},
    frame,
    software::resampling,
    sys::EAGAIN,
};
use tracing::{debug, info};

use crate::{ffmpeg_err, pick_rate, pick_sample_format, to_micros};

const SLOT: usize = 0;
const FALLBACK_FRAME_SIZE: usize = 1024;

struct Encoded {
    data: Vec<u8>,
    presentation_time_us: i64,
    flags: BufferFlags,
}

/// Encodes interleaved 16-bit PCM into compressed packets.
///
/// Input of any length is buffered per plane and handed to the codec in
/// frames of exactly its frame size; only the last frame may be shorter.
pub struct FfmpegEncoder {
    codec: AudioCodec,
    bit_rate: usize,
    encoder: encoder::Audio,
    input: PcmInfo,
    resampler: Option<resampling::Context>,
    buffer: Vec<VecDeque<u8>>,
    frame_size: usize,
    samples_sent: i64,
    pending: VecDeque<Encoded>,
    held: Option<Encoded>,
    started: bool,
    announced: bool,
    eof_sent: bool,
    finished: bool,
}

impl FfmpegEncoder {
    pub fn new(settings: &EncoderSettings) -> Result<Self, CodecError> {
        let id = settings.codec.id();
        let codec = encoder::find_by_name(settings.codec.encoder_name())
            .or_else(|| encoder::find(id))
            .ok_or(CodecError::UnsupportedCodec(settings.codec))?;

        let (rates, formats) = {
            let audio = codec.audio().map_err(ffmpeg_err)?;
            let rates: Vec<i32> = audio.rates().into_iter().flatten().collect();
            let formats: Vec<Sample> = audio.formats().into_iter().flatten().collect();
            (rates, formats)
        };

        let rate = pick_rate(&rates, settings.sample_rate as i32);
        let sample_format = pick_sample_format(&formats);
        let layout = channel_layout_for(settings.channels);
        let input = PcmInfo::new_raw(settings.sample_rate, settings.channels);

        let mut encoder_ctx = context::Context::new_with_codec(codec);
        encoder_ctx.set_flags(codec::Flags::GLOBAL_HEADER);
        let mut encoder = encoder_ctx.encoder().audio().map_err(ffmpeg_err)?;

        encoder.set_bit_rate(settings.bit_rate);
        encoder.set_rate(rate);
        encoder.set_format(sample_format);
        encoder.set_channel_layout(layout);
        encoder.set_time_base(FFRational(1, rate));

        let encoder = encoder.open().map_err(ffmpeg_err)?;

        let resampler = if (input.sample_format(), input.sample_rate as i32)
            != (sample_format, rate)
        {
            Some(
                ffmpeg::software::resampler(
                    (input.sample_format(), layout, input.sample_rate),
                    (sample_format, layout, rate as u32),
                )
                .map_err(ffmpeg_err)?,
            )
        } else {
            None
        };

        let planes = if sample_format.is_planar() {
            usize::from(settings.channels.max(1))
        } else {
            1
        };

        let frame_size = match encoder.frame_size() {
            0 => FALLBACK_FRAME_SIZE,
            size => size as usize,
        };

        info!(
            codec = ?settings.codec,
            rate,
            channels = settings.channels,
            ?sample_format,
            frame_size,
            resampling = resampler.is_some(),
            "encoder opened"
        );

        Ok(Self {
            codec: settings.codec,
            bit_rate: settings.bit_rate,
            encoder,
            input,
            resampler,
            buffer: vec![VecDeque::new(); planes],
            frame_size,
            samples_sent: 0,
            pending: VecDeque::new(),
            held: None,
            started: false,
            announced: false,
            eof_sent: false,
            finished: false,
        })
    }

    fn layout(&self) -> ChannelLayout {
        self.encoder.channel_layout()
    }

    fn plane_bytes(&self, samples: usize) -> usize {
        let format = self.encoder.format();
        let per_plane_channels = if format.is_planar() {
            1
        } else {
            usize::from(self.input.channels)
        };

        samples * format.bytes() * per_plane_channels
    }

    fn buffer_pcm(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let frame = self.input.wrap_frame(data);

        let frame = match &mut self.resampler {
            Some(resampler) => {
                let output = *resampler.output();
                let capacity = (frame.samples() as u64 * u64::from(output.rate)
                    / u64::from(self.input.sample_rate.max(1))) as usize
                    + 256;

                let mut resampled =
                    frame::Audio::new(output.format, capacity, output.channel_layout);
                resampled.set_rate(output.rate);
                resampler.run(&frame, &mut resampled).map_err(ffmpeg_err)?;
                resampled
            }
            None => frame,
        };

        let len = self.plane_bytes(frame.samples());
        for (i, plane) in self.buffer.iter_mut().enumerate() {
            plane.extend(&frame.data(i)[..len]);
        }

        Ok(())
    }

    fn flush_resampler(&mut self) -> Result<(), CodecError> {
        let Some(mut resampler) = self.resampler.take() else {
            return Ok(());
        };

        let output = *resampler.output();
        while resampler.delay().is_some() {
            let mut resampled = frame::Audio::new(output.format, 1024, output.channel_layout);
            resampled.set_rate(output.rate);

            resampler.flush(&mut resampled).map_err(ffmpeg_err)?;
            if resampled.samples() == 0 {
                break;
            }

            let len = self.plane_bytes(resampled.samples());
            for (i, plane) in self.buffer.iter_mut().enumerate() {
                plane.extend(&resampled.data(i)[..len]);
            }
        }

        Ok(())
    }

    fn send_buffered(&mut self, partial: bool) -> Result<(), CodecError> {
        let full = self.plane_bytes(self.frame_size);

        loop {
            let available = self.buffer[0].len();
            if available == 0 || (available < full && !partial) {
                return Ok(());
            }

            let len = available.min(full);
            let samples = self.frame_size * len / full;

            let mut frame = frame::Audio::new(self.encoder.format(), samples, self.layout());
            frame.set_rate(self.encoder.rate());
            frame.set_pts(Some(self.samples_sent));

            for (i, plane) in self.buffer.iter_mut().enumerate() {
                for (dst, src) in frame.data_mut(i)[..len].iter_mut().zip(plane.drain(..len)) {
                    *dst = src;
                }
            }

            self.samples_sent += samples as i64;
            self.send(Some(&frame))?;
        }
    }

    fn send(&mut self, frame: Option<&frame::Audio>) -> Result<(), CodecError> {
        loop {
            let result = match frame {
                Some(frame) => self.encoder.send_frame(frame),
                None => self.encoder.send_eof(),
            };

            match result {
                Ok(()) => break,
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => {
                    if self.receive_packets()? == 0 {
                        return Err(ffmpeg_err(ffmpeg::Error::Other { errno }));
                    }
                }
                Err(e) => return Err(ffmpeg_err(e)),
            }
        }

        self.receive_packets()?;
        Ok(())
    }

    fn receive_packets(&mut self) -> Result<usize, CodecError> {
        let time_base = self.encoder.time_base();
        let mut received = 0;

        loop {
            let mut packet = Packet::empty();

            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    let flags = if packet.is_key() {
                        BufferFlags::KEY_FRAME
                    } else {
                        BufferFlags::NONE
                    };

                    self.pending.push_back(Encoded {
                        data: packet.data().unwrap_or_default().to_vec(),
                        presentation_time_us: to_micros(
                            packet.pts().unwrap_or(self.samples_sent),
                            time_base,
                        ),
                        flags,
                    });
                    received += 1;
                }
                Err(ffmpeg::Error::Eof) => {
                    self.finished = true;
                    self.pending.push_back(Encoded {
                        data: Vec::new(),
                        presentation_time_us: to_micros(self.samples_sent, time_base),
                        flags: BufferFlags::END_OF_STREAM,
                    });
                    return Ok(received);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => return Ok(received),
                Err(e) => return Err(ffmpeg_err(e)),
            }
        }
    }
}

impl Codec for FfmpegEncoder {
    fn start(&mut self) -> Result<(), CodecError> {
        self.started = true;
        Ok(())
    }

    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        if !self.started {
            return Err(CodecError::NotStarted);
        }

        Ok((!self.eof_sent).then_some(SLOT))
    }

    fn queue_input(
        &mut self,
        slot: usize,
        data: &[u8],
        _presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        if slot != SLOT {
            return Err(CodecError::InvalidSlot(slot));
        }

        if !data.is_empty() {
            self.buffer_pcm(data)?;
        }

        if flags.is_end_of_stream() {
            self.flush_resampler()?;
            self.send_buffered(true)?;
            self.send(None)?;
            self.eof_sent = true;
            debug!(samples = self.samples_sent, "encoder input ended");
        } else {
            self.send_buffered(false)?;
        }

        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<DequeueOutput, CodecError> {
        if !self.started {
            return Err(CodecError::NotStarted);
        }

        if !self.announced {
            self.announced = true;
            return Ok(DequeueOutput::FormatChanged);
        }

        if self.pending.is_empty() && self.eof_sent && !self.finished {
            self.receive_packets()?;
        }

        let Some(encoded) = self.pending.pop_front() else {
            return Ok(DequeueOutput::TryAgainLater);
        };

        let output = OutputBuffer {
            slot: SLOT,
            size: encoded.data.len(),
            presentation_time_us: encoded.presentation_time_us,
            flags: encoded.flags,
        };
        self.held = Some(encoded);

        Ok(DequeueOutput::Buffer(output))
    }

    fn output_data(&self, slot: usize) -> Result<&[u8], CodecError> {
        match (&self.held, slot) {
            (Some(encoded), SLOT) => Ok(&encoded.data),
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
        let mut format = TrackFormat::new(self.codec, self.encoder.rate(), self.input.channels)
            .with_bit_rate(self.bit_rate);
        format.frame_size = Some(self.frame_size as u32);

        format.extradata = unsafe {
            let ctx = self.encoder.as_ptr();
            let size = (*ctx).extradata_size.max(0) as usize;
            if (*ctx).extradata.is_null() || size == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*ctx).extradata, size).to_vec()
            }
        };

        Some(format)
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.started = false;
        self.pending.clear();
        self.held = None;
        Ok(())
    }
}
