use std::path::PathBuf;

use avmix_media_info::AudioCodec;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by one of the media services (demuxer, codec, container writer).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported codec: {0:?}")]
    UnsupportedCodec(AudioCodec),
    #[error("Source has no audio track")]
    NoAudioTrack,
    #[error("Track index {0} out of range")]
    TrackOutOfRange(usize),
    #[error("Invalid buffer slot {0}")]
    InvalidSlot(usize),
    #[error("Codec has not been started")]
    NotStarted,
    #[error("Container writer has not been started")]
    WriterNotStarted,
    #[error("IO/{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(BoxedError),
}

impl CodecError {
    pub fn backend(err: impl Into<BoxedError>) -> Self {
        Self::Backend(err.into())
    }
}

/// Everything that can abort a mix. Always surfaces to the caller as a
/// single value once the worker has finished.
#[derive(Debug, thiserror::Error)]
pub enum MixError {
    #[error("No audio tracks to mix")]
    NoAudioTracks,
    #[error("Track {track} ({}): {source}", path.display())]
    Setup {
        track: usize,
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("Encoder {settings:?}: {source}")]
    EncoderSetup {
        settings: crate::EncoderSettings,
        #[source]
        source: CodecError,
    },
    #[error("Output {}: {source}", path.display())]
    OutputSetup {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("Codec/{0}")]
    Codec(#[from] CodecError),
    #[error("Encoder signalled an output format change twice")]
    FormatChangedTwice,
    #[error("Encoder signalled a format change without reporting its output format")]
    MissingOutputFormat,
    #[error("Encoder produced output before the container track was registered")]
    WriterNotStarted,
    #[error("Mix worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("Mix worker exited without reporting a result")]
    WorkerDisconnected,
    #[error("Failed to spawn mix worker: {0}")]
    Spawn(std::io::Error),
    #[error("Injected failure at '{0}'")]
    Injected(&'static str),
}

impl MixError {
    pub fn setup(track: usize, path: impl Into<PathBuf>, source: CodecError) -> Self {
        Self::Setup {
            track,
            path: path.into(),
            source,
        }
    }

    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Setup { .. }
                | Self::EncoderSetup { .. }
                | Self::OutputSetup { .. }
                | Self::NoAudioTracks
        )
    }
}
