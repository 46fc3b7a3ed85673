use std::path::{Path, PathBuf};

use avmix_media_info::millis_to_micros;

/// One input track of a mix. Never modified once the mix has started.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSource {
    path: PathBuf,
    volume: f32,
    start_at_us: i64,
    delay_us: i64,
}

impl TrackSource {
    pub const DEFAULT_VOLUME: f32 = 1.0;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            volume: Self::DEFAULT_VOLUME,
            start_at_us: 0,
            delay_us: 0,
        }
    }

    /// Builds a source from the millisecond values callers work in.
    pub fn from_millis(
        path: impl Into<PathBuf>,
        volume: Option<f32>,
        start_at_ms: i64,
        delay_ms: i64,
    ) -> Self {
        let mut source = Self::new(path)
            .with_start_at_us(millis_to_micros(start_at_ms))
            .with_delay_us(millis_to_micros(delay_ms));

        if let Some(volume) = volume {
            source = source.with_volume(volume);
        }

        source
    }

    /// Negative or non-finite volumes fall back to full volume, anything above
    /// 1.0 is clamped.
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = if volume.is_finite() && volume >= 0.0 {
            volume.min(1.0)
        } else {
            Self::DEFAULT_VOLUME
        };
        self
    }

    pub fn with_start_at_us(mut self, start_at_us: i64) -> Self {
        self.start_at_us = start_at_us.max(0);
        self
    }

    pub fn with_delay_us(mut self, delay_us: i64) -> Self {
        self.delay_us = delay_us.max(0);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Input samples stamped before this are fed to the decoder empty.
    pub fn start_at_us(&self) -> i64 {
        self.start_at_us
    }

    pub fn delay_us(&self) -> i64 {
        self.delay_us
    }

    pub fn is_full_volume(&self) -> bool {
        self.volume >= 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_full_volume() {
        let source = TrackSource::new("a.m4a");

        assert_eq!(source.volume(), 1.0);
        assert!(source.is_full_volume());
        assert_eq!(source.start_at_us(), 0);
        assert_eq!(source.delay_us(), 0);
    }

    #[test]
    fn negative_volume_means_unset() {
        assert_eq!(TrackSource::new("a").with_volume(-1.0).volume(), 1.0);
        assert_eq!(TrackSource::new("a").with_volume(f32::NAN).volume(), 1.0);
        assert_eq!(TrackSource::new("a").with_volume(0.0).volume(), 0.0);
        assert_eq!(TrackSource::new("a").with_volume(3.0).volume(), 1.0);
    }

    #[test]
    fn millis_are_scaled_to_micros() {
        let source = TrackSource::from_millis("b.aac", Some(0.5), 250, 500);

        assert_eq!(source.volume(), 0.5);
        assert_eq!(source.start_at_us(), 250_000);
        assert_eq!(source.delay_us(), 500_000);
        assert_eq!(source.path(), Path::new("b.aac"));
    }
}
