//! FFmpeg implementation of the media services an [`avmix_mixer::AudioMix`]
//! drives.
//!
//! libavcodec and libavformat are synchronous, so every service here emulates
//! the slot-based contract on top of them: one input slot, one output slot and
//! an internal queue. Poll timeouts are accepted and ignored.

mod decoder;
mod demuxer;
mod encoder;
mod writer;

pub use decoder::*;
pub use demuxer::*;
pub use encoder::*;
pub use writer::*;

use std::path::Path;

use avmix_media_info::{FFRational, PcmInfo, Sample, Type};
use avmix_mixer::{CodecError, EncoderSettings, MediaBackend};
use ffmpeg::Rescale;

/// Presentation timestamps cross the service boundary in microseconds.
pub const MICROS_TIME_BASE: FFRational = FFRational(1, 1_000_000);

#[derive(thiserror::Error, Debug)]
pub enum FfmpegBackendError {
    #[error("{0:?}")]
    FFmpeg(#[from] ffmpeg::Error),
    #[error("No codec available for {0:?}")]
    CodecNotFound(ffmpeg::codec::Id),
    #[error("Source codec {0:?} is not supported")]
    UnmappedCodec(ffmpeg::codec::Id),
    #[error("Stream {0} is not an audio stream")]
    NotAudio(usize),
}

impl From<FfmpegBackendError> for CodecError {
    fn from(value: FfmpegBackendError) -> Self {
        CodecError::backend(value)
    }
}

pub(crate) fn ffmpeg_err(e: ffmpeg::Error) -> CodecError {
    CodecError::backend(FfmpegBackendError::FFmpeg(e))
}

pub fn to_micros(timestamp: i64, time_base: FFRational) -> i64 {
    timestamp.rescale(time_base, MICROS_TIME_BASE)
}

pub fn from_micros(micros: i64, time_base: FFRational) -> i64 {
    micros.rescale(MICROS_TIME_BASE, time_base)
}

/// Picks the encoder rate closest to `wanted` from above, else the highest
/// supported one. An empty list means the codec accepts anything.
pub fn pick_rate(supported: &[i32], wanted: i32) -> i32 {
    let mut rates = supported.to_vec();
    rates.sort_unstable();

    rates
        .iter()
        .find(|rate| **rate >= wanted)
        .or(rates.last())
        .copied()
        .unwrap_or(wanted)
}

/// Packed 16-bit input needs no conversion, so it wins when offered.
pub fn pick_sample_format(supported: &[Sample]) -> Sample {
    let packed = Sample::I16(Type::Packed);

    if supported.is_empty() || supported.contains(&packed) {
        packed
    } else {
        supported[0]
    }
}

/// Media services backed by libavformat and libavcodec.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegBackend {
    _private: (),
}

impl FfmpegBackend {
    pub fn new() -> Result<Self, CodecError> {
        ffmpeg::init().map_err(ffmpeg_err)?;

        Ok(Self { _private: () })
    }
}

impl MediaBackend for FfmpegBackend {
    type Demuxer = FfmpegDemuxer;
    type Decoder = FfmpegDecoder;
    type Encoder = FfmpegEncoder;
    type Writer = FfmpegWriter;

    fn open_demuxer(&self, source: &Path) -> Result<Self::Demuxer, CodecError> {
        FfmpegDemuxer::open(source)
    }

    fn create_decoder(
        &self,
        demuxer: &Self::Demuxer,
        output: PcmInfo,
    ) -> Result<Self::Decoder, CodecError> {
        FfmpegDecoder::new(demuxer, output)
    }

    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Self::Encoder, CodecError> {
        FfmpegEncoder::new(settings)
    }

    fn create_writer(&self, destination: &Path) -> Result<Self::Writer, CodecError> {
        FfmpegWriter::create(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescales_between_stream_and_micros() {
        assert_eq!(to_micros(44_100, FFRational(1, 44_100)), 1_000_000);
        assert_eq!(from_micros(500_000, FFRational(1, 48_000)), 24_000);

        let stream = FFRational(1, 90_000);
        assert_eq!(from_micros(to_micros(90_000, stream), stream), 90_000);
    }

    #[test]
    fn rate_prefers_next_supported_up() {
        let aac = [96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000];

        assert_eq!(pick_rate(&aac, 44_100), 44_100);
        assert_eq!(pick_rate(&aac, 8_000), 16_000);
        assert_eq!(pick_rate(&aac, 192_000), 96_000);
        assert_eq!(pick_rate(&[], 8_000), 8_000);
    }

    #[test]
    fn sample_format_prefers_packed_16_bit() {
        let planar = Sample::F32(Type::Planar);

        assert_eq!(pick_sample_format(&[planar]), planar);
        assert_eq!(
            pick_sample_format(&[planar, Sample::I16(Type::Packed)]),
            Sample::I16(Type::Packed)
        );
        assert_eq!(pick_sample_format(&[]), Sample::I16(Type::Packed));
    }
}
