//! Contracts for the media services a mix drives.
//!
//! The shapes follow a slot-based hardware codec API: input slots are
//! dequeued, filled and queued back; output is polled with a timeout and
//! either yields a filled slot or one of several status signals. Services are
//! created on the mix worker and never leave it, so none of these traits
//! require `Send`.

use std::path::Path;
use std::time::Duration;

use avmix_media_info::{PcmInfo, TrackFormat};

use crate::{CodecError, EncoderSettings};

pub const DECODE_TIMEOUT: Duration = Duration::from_millis(5);
pub const ENCODE_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const KEY_FRAME: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(1 << 1);
    pub const END_OF_STREAM: Self = Self(1 << 2);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_end_of_stream(self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }

    pub fn is_codec_config(self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    pub slot: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DequeueOutput {
    Buffer(OutputBuffer),
    TryAgainLater,
    FormatChanged,
    BuffersChanged,
    /// A status code the service does not define. Logged and ignored.
    Unknown(i32),
}

pub trait Demuxer {
    fn track_format(&self) -> &TrackFormat;

    fn select_track(&mut self, index: usize) -> Result<(), CodecError>;

    /// Copies the current sample into `buf`, returning its size, or `None`
    /// once the track is exhausted.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>, CodecError>;

    /// Presentation time of the current sample in microseconds.
    fn sample_time_us(&self) -> i64;

    /// Moves to the next sample. Returns `false` when there is none.
    fn advance(&mut self) -> Result<bool, CodecError>;
}

/// A decoder or an encoder.
pub trait Codec {
    fn start(&mut self) -> Result<(), CodecError>;

    fn dequeue_input_slot(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError>;

    fn queue_input(
        &mut self,
        slot: usize,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    fn dequeue_output(&mut self, timeout: Duration) -> Result<DequeueOutput, CodecError>;

    /// Contents of a slot handed out by [`Codec::dequeue_output`], valid until
    /// it is released.
    fn output_data(&self, slot: usize) -> Result<&[u8], CodecError>;

    fn release_output(&mut self, slot: usize) -> Result<(), CodecError>;

    /// Only meaningful after a [`DequeueOutput::FormatChanged`] signal.
    fn output_format(&self) -> Option<TrackFormat>;

    fn stop(&mut self) -> Result<(), CodecError>;
}

pub trait ContainerWriter {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;
}

/// Creates the services for one mix. The backend itself is moved onto the
/// mix worker; everything it creates stays there.
pub trait MediaBackend: Send + 'static {
    type Demuxer: Demuxer;
    type Decoder: Codec;
    type Encoder: Codec;
    type Writer: ContainerWriter;

    fn open_demuxer(&self, source: &Path) -> Result<Self::Demuxer, CodecError>;

    /// Creates a started-ready decoder for the selected track of `demuxer`,
    /// producing interleaved 16-bit PCM in the `output` layout.
    fn create_decoder(
        &self,
        demuxer: &Self::Demuxer,
        output: PcmInfo,
    ) -> Result<Self::Decoder, CodecError>;

    fn create_encoder(&self, settings: &EncoderSettings) -> Result<Self::Encoder, CodecError>;

    fn create_writer(&self, destination: &Path) -> Result<Self::Writer, CodecError>;
}
