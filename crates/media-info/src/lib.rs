use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{
    format::sample::{Sample, Type},
    util::{channel_layout::ChannelLayout, rational::Rational as FFRational},
};

/// Multiplier between the millisecond values callers hand us and the
/// microsecond presentation timestamps used everywhere internally.
pub const MICROS_PER_MILLI: i64 = 1_000;
pub const MICROS_PER_SECOND: i64 = 1_000_000;

pub fn millis_to_micros(millis: i64) -> i64 {
    millis.saturating_mul(MICROS_PER_MILLI)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
    Vorbis,
    Flac,
    AmrNb,
    PcmS16le,
}

impl AudioCodec {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Aac => "audio/mp4a-latm",
            Self::Opus => "audio/opus",
            Self::Mp3 => "audio/mpeg",
            Self::Vorbis => "audio/vorbis",
            Self::Flac => "audio/flac",
            Self::AmrNb => "audio/3gpp",
            Self::PcmS16le => "audio/raw",
        }
    }

    pub fn is_amr(&self) -> bool {
        matches!(self, Self::AmrNb)
    }

    #[cfg(feature = "ffmpeg")]
    pub fn id(&self) -> ffmpeg::codec::Id {
        use ffmpeg::codec::Id;

        match self {
            Self::Aac => Id::AAC,
            Self::Opus => Id::OPUS,
            Self::Mp3 => Id::MP3,
            Self::Vorbis => Id::VORBIS,
            Self::Flac => Id::FLAC,
            Self::AmrNb => Id::AMR_NB,
            Self::PcmS16le => Id::PCM_S16LE,
        }
    }

    #[cfg(feature = "ffmpeg")]
    pub fn from_id(id: ffmpeg::codec::Id) -> Option<Self> {
        use ffmpeg::codec::Id;

        Some(match id {
            Id::AAC => Self::Aac,
            Id::OPUS => Self::Opus,
            Id::MP3 => Self::Mp3,
            Id::VORBIS => Self::Vorbis,
            Id::FLAC => Self::Flac,
            Id::AMR_NB => Self::AmrNb,
            Id::PCM_S16LE => Self::PcmS16le,
            _ => return None,
        })
    }

    /// Name of the FFmpeg encoder preferred for this codec.
    #[cfg(feature = "ffmpeg")]
    pub fn encoder_name(&self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "libopus",
            Self::Mp3 => "libmp3lame",
            Self::Vorbis => "libvorbis",
            Self::Flac => "flac",
            Self::AmrNb => "libopencore_amrnb",
            Self::PcmS16le => "pcm_s16le",
        }
    }
}

/// Interleaved signed 16-bit PCM. Every decoded, mixed and generated buffer
/// in a mix shares one of these.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum PcmInfoError {
    #[error("Unsupported number of channels: {0}")]
    ChannelLayout(u16),
    #[error("Sample rate must be greater than zero")]
    SampleRate,
}

impl PcmInfo {
    pub const MAX_AUDIO_CHANNELS: u16 = 8;
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub const fn new(sample_rate: u32, channels: u16) -> Result<Self, PcmInfoError> {
        if channels == 0 || channels > Self::MAX_AUDIO_CHANNELS {
            return Err(PcmInfoError::ChannelLayout(channels));
        }

        if sample_rate == 0 {
            return Err(PcmInfoError::SampleRate);
        }

        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub const fn new_raw(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        Self::BYTES_PER_SAMPLE * usize::from(self.channels.max(1))
    }

    /// Number of frames (one sample per channel) held by `samples` interleaved values.
    pub fn frames_in(&self, samples: usize) -> usize {
        samples / usize::from(self.channels.max(1))
    }

    pub fn duration_of(&self, samples: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64(self.frames_in(samples) as f64 / self.sample_rate as f64)
    }

    /// Interleaved sample count covering `duration`, rounded up to whole frames.
    pub fn samples_for(&self, duration: Duration) -> usize {
        let frames = (duration.as_secs_f64() * self.sample_rate as f64).ceil() as usize;
        frames * usize::from(self.channels.max(1))
    }

    #[cfg(feature = "ffmpeg")]
    pub fn sample_format(&self) -> Sample {
        Sample::I16(Type::Packed)
    }

    #[cfg(feature = "ffmpeg")]
    pub fn rate(&self) -> i32 {
        self.sample_rate as i32
    }

    #[cfg(feature = "ffmpeg")]
    pub fn channel_layout(&self) -> ChannelLayout {
        channel_layout_for(self.channels)
    }

    /// Wraps little-endian interleaved bytes into a packed FFmpeg frame.
    #[cfg(feature = "ffmpeg")]
    pub fn wrap_frame(&self, packed_data: &[u8]) -> ffmpeg::frame::Audio {
        let samples = packed_data.len() / self.bytes_per_frame();

        let mut frame =
            ffmpeg::frame::Audio::new(self.sample_format(), samples, self.channel_layout());
        frame.set_rate(self.sample_rate);

        let len = samples * self.bytes_per_frame();
        frame.data_mut(0)[0..len].copy_from_slice(&packed_data[0..len]);

        frame
    }
}

/// Layout for a channel count, clamped to the range FFmpeg has named layouts for.
#[cfg(feature = "ffmpeg")]
pub fn channel_layout_for(channels: u16) -> ChannelLayout {
    match channels.clamp(1, PcmInfo::MAX_AUDIO_CHANNELS) {
        1 => ChannelLayout::MONO,
        2 => ChannelLayout::STEREO,
        3 => ChannelLayout::SURROUND,
        4 => ChannelLayout::QUAD,
        5 => ChannelLayout::_5POINT0,
        6 => ChannelLayout::_5POINT1,
        7 => ChannelLayout::_6POINT1,
        _ => ChannelLayout::_7POINT1,
    }
}

/// Description of one compressed audio track, as reported by a demuxer or
/// produced by an encoder once its output format is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: Option<usize>,
    pub duration_us: Option<i64>,
    pub frame_size: Option<u32>,
    /// Codec-specific configuration (e.g. the AAC AudioSpecificConfig).
    pub extradata: Vec<u8>,
}

impl TrackFormat {
    pub fn new(codec: AudioCodec, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            bit_rate: None,
            duration_us: None,
            frame_size: None,
            extradata: Vec::new(),
        }
    }

    pub fn with_bit_rate(mut self, bit_rate: usize) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn pcm_info(&self) -> PcmInfo {
        PcmInfo::new_raw(self.sample_rate, self.channels)
    }

    pub fn mime(&self) -> &'static str {
        self.codec.mime()
    }
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * PcmInfo::BYTES_PER_SAMPLE);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// A trailing odd byte is ignored.
pub fn le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(PcmInfo::BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    mod pcm_info {
        use super::*;

        #[test]
        fn rejects_unsupported_channel_counts() {
            assert!(matches!(
                PcmInfo::new(48_000, 0),
                Err(PcmInfoError::ChannelLayout(0))
            ));
            assert!(matches!(
                PcmInfo::new(48_000, 9),
                Err(PcmInfoError::ChannelLayout(9))
            ));
            assert!(matches!(PcmInfo::new(0, 2), Err(PcmInfoError::SampleRate)));
        }

        #[test]
        fn duration_counts_frames_not_samples() {
            let info = PcmInfo::new_raw(48_000, 2);

            assert_eq!(info.duration_of(96_000), Duration::from_secs(1));
            assert_eq!(info.duration_of(960), Duration::from_millis(10));
        }

        #[test]
        fn samples_for_rounds_up_to_whole_frames() {
            let info = PcmInfo::new_raw(44_100, 2);

            assert_eq!(info.samples_for(Duration::from_millis(10)), 441 * 2);
            assert_eq!(info.samples_for(Duration::from_micros(1)), 2);
        }

        #[test]
        fn zero_channels_are_treated_as_mono() {
            let info = PcmInfo::new_raw(8_000, 0);

            assert_eq!(info.bytes_per_frame(), 2);
            assert_eq!(info.frames_in(10), 10);
        }
    }

    #[test]
    fn pcm_bytes_are_little_endian() {
        let bytes = samples_to_le_bytes(&[1, -1, 0x1234]);

        assert_eq!(bytes, vec![0x01, 0x00, 0xff, 0xff, 0x34, 0x12]);
        assert_eq!(le_bytes_to_samples(&bytes), vec![1, -1, 0x1234]);
    }

    #[test]
    fn odd_trailing_byte_is_dropped() {
        assert_eq!(le_bytes_to_samples(&[0x02, 0x00, 0x07]), vec![2]);
    }

    #[test]
    fn codec_names_serialize_in_kebab_case() {
        let json = serde_json::to_string(&AudioCodec::AmrNb).unwrap();
        assert_eq!(json, "\"amr-nb\"");
        assert_eq!(AudioCodec::AmrNb.mime(), "audio/3gpp");
    }

    #[test]
    fn millis_convert_to_micros() {
        assert_eq!(millis_to_micros(500), 500_000);
        assert_eq!(millis_to_micros(i64::MAX), i64::MAX);
    }

    #[cfg(feature = "ffmpeg")]
    mod ffmpeg_conversions {
        use super::*;

        #[test]
        fn channel_layout_is_clamped() {
            assert_eq!(channel_layout_for(0), ChannelLayout::MONO);
            assert_eq!(channel_layout_for(2), ChannelLayout::STEREO);
            assert_eq!(channel_layout_for(32), ChannelLayout::_7POINT1);
        }

        #[test]
        fn codec_ids_round_trip() {
            for codec in [AudioCodec::Aac, AudioCodec::Opus, AudioCodec::AmrNb] {
                assert_eq!(AudioCodec::from_id(codec.id()), Some(codec));
            }
        }
    }
}
