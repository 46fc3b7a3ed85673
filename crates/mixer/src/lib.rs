//! Decodes N compressed audio tracks, lines them up on one presentation
//! timeline, mixes them and re-encodes the result into a container.
//!
//! A mix runs in two phases on a dedicated worker. Every track is decoded
//! into memory first ([`DecodeLoop`]); only then are start delays padded in
//! ([`SilencePadder`]), the tracks folded together ([`Mixer`]) and the result
//! encoded and written ([`EncodeMuxSink`]). The media services themselves are
//! supplied through a [`MediaBackend`].

mod buffer;
mod codec;
mod config;
pub mod decode;
mod error;
pub mod mix;
pub mod pad;
mod pipeline;
mod project;
pub mod sink;
mod source;
pub mod timeline;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_backend;

pub use buffer::*;
pub use codec::*;
pub use config::*;
pub use decode::{DecodeLoop, DecodeOutput};
pub use error::*;
pub use mix::{MixedOutput, Mixer, mix_samples};
pub use pad::SilencePadder;
pub use pipeline::*;
pub use project::*;
pub use sink::{EncodeMuxSink, SinkStats};
pub use source::*;
pub use timeline::{DriftDelta, PresentationTimeline, estimate_drift};
