use std::path::{Path, PathBuf};

use avmix_media_info::{AudioCodec, FFRational, TrackFormat};
use avmix_mixer::{CodecError, Demuxer};
use ffmpeg::{Packet, codec, format, media};
use tracing::{debug, trace};

use crate::{FfmpegBackendError, ffmpeg_err, to_micros};

/// Reads the compressed packets of one audio stream of a file.
pub struct FfmpegDemuxer {
    path: PathBuf,
    input: format::context::Input,
    audio_streams: Vec<usize>,
    stream_index: usize,
    time_base: FFRational,
    parameters: codec::Parameters,
    format: TrackFormat,
    current: Option<Packet>,
}

impl FfmpegDemuxer {
    /// Opens `path` positioned on its first audio stream.
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        if !path.exists() {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }

        let input = format::input(&path).map_err(ffmpeg_err)?;

        let audio_streams: Vec<usize> = input
            .streams()
            .filter(|stream| stream.parameters().medium() == media::Type::Audio)
            .map(|stream| stream.index())
            .collect();

        let Some(&stream_index) = audio_streams.first() else {
            return Err(CodecError::NoAudioTrack);
        };

        let (format, parameters, time_base) = describe(&input, stream_index)?;

        let mut this = Self {
            path: path.to_path_buf(),
            input,
            audio_streams,
            stream_index,
            time_base,
            parameters,
            format,
            current: None,
        };
        this.current = this.next_packet()?;

        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn time_base(&self) -> FFRational {
        self.time_base
    }

    pub fn parameters(&self) -> &codec::Parameters {
        &self.parameters
    }

    pub fn audio_track_count(&self) -> usize {
        self.audio_streams.len()
    }

    fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        loop {
            let mut packet = Packet::empty();

            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == self.stream_index => return Ok(Some(packet)),
                Ok(()) => continue,
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(ffmpeg_err(e)),
            }
        }
    }
}

fn describe(
    input: &format::context::Input,
    index: usize,
) -> Result<(TrackFormat, codec::Parameters, FFRational), CodecError> {
    let stream = input
        .stream(index)
        .ok_or(CodecError::TrackOutOfRange(index))?;
    let parameters = stream.parameters();

    if parameters.medium() != media::Type::Audio {
        return Err(FfmpegBackendError::NotAudio(index).into());
    }

    let id = parameters.id();
    let codec = AudioCodec::from_id(id).ok_or(FfmpegBackendError::UnmappedCodec(id))?;

    let decoder = codec::Context::from_parameters(parameters.clone())
        .and_then(|ctx| ctx.decoder().audio())
        .map_err(ffmpeg_err)?;

    let mut format = TrackFormat::new(codec, decoder.rate(), decoder.channels());

    if decoder.bit_rate() > 0 {
        format = format.with_bit_rate(decoder.bit_rate());
    }
    if stream.duration() > 0 {
        format = format.with_duration_us(to_micros(stream.duration(), stream.time_base()));
    }
    if decoder.frame_size() > 0 {
        format.frame_size = Some(decoder.frame_size());
    }

    format.extradata = unsafe {
        let par = parameters.as_ptr();
        let size = (*par).extradata_size.max(0) as usize;
        if (*par).extradata.is_null() || size == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts((*par).extradata, size).to_vec()
        }
    };

    debug!(index, ?format, "audio stream described");

    Ok((format, parameters, stream.time_base()))
}

impl Demuxer for FfmpegDemuxer {
    fn track_format(&self) -> &TrackFormat {
        &self.format
    }

    /// `index` counts audio streams only. Selection is expected before the
    /// first read.
    fn select_track(&mut self, index: usize) -> Result<(), CodecError> {
        let stream_index = *self
            .audio_streams
            .get(index)
            .ok_or(CodecError::TrackOutOfRange(index))?;

        if stream_index == self.stream_index {
            return Ok(());
        }

        let (format, parameters, time_base) = describe(&self.input, stream_index)?;
        self.stream_index = stream_index;
        self.format = format;
        self.parameters = parameters;
        self.time_base = time_base;
        self.current = self.next_packet()?;

        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>, CodecError> {
        let Some(packet) = &self.current else {
            return Ok(None);
        };

        buf.clear();
        buf.extend_from_slice(packet.data().unwrap_or_default());

        Ok(Some(buf.len()))
    }

    fn sample_time_us(&self) -> i64 {
        self.current
            .as_ref()
            .and_then(|packet| packet.pts().or(packet.dts()))
            .map_or(-1, |ts| to_micros(ts, self.time_base))
    }

    fn advance(&mut self) -> Result<bool, CodecError> {
        self.current = self.next_packet()?;
        trace!(
            stream = self.stream_index,
            more = self.current.is_some(),
            "demuxer advanced"
        );

        Ok(self.current.is_some())
    }
}
