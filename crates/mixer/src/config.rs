use std::time::Duration;

use avmix_media_info::{AudioCodec, PcmInfo, TrackFormat};
use serde::{Deserialize, Serialize};

/// Tunables for one mix.
///
/// `stall_budget` and `drift_tolerance` are empirical values that worked on
/// the decoders this was first run against. They are platform dependent and
/// should only be changed with evidence from the target decoders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Consecutive decode iterations without output before the loop gives up.
    pub stall_budget: u32,
    /// Relative difference under which two timeline deltas count as agreeing.
    pub drift_tolerance: f64,
    pub decode_timeout_ms: u64,
    pub encode_timeout_ms: u64,
    pub bit_rate: usize,
    pub fallback_sample_rate: u32,
    pub fallback_channels: u16,
    pub raise_worker_priority: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            stall_budget: 50,
            drift_tolerance: 0.05,
            decode_timeout_ms: crate::DECODE_TIMEOUT.as_millis() as u64,
            encode_timeout_ms: crate::ENCODE_TIMEOUT.as_millis() as u64,
            bit_rate: 128_000,
            fallback_sample_rate: 48_000,
            fallback_channels: 2,
            raise_worker_priority: true,
        }
    }
}

impl MixerConfig {
    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_millis(self.encode_timeout_ms)
    }

    pub fn with_stall_budget(mut self, stall_budget: u32) -> Self {
        self.stall_budget = stall_budget;
        self
    }

    pub fn with_drift_tolerance(mut self, drift_tolerance: f64) -> Self {
        self.drift_tolerance = drift_tolerance;
        self
    }

    pub fn with_raise_worker_priority(mut self, raise: bool) -> Self {
        self.raise_worker_priority = raise;
        self
    }
}

/// What the encoder is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: usize,
}

impl EncoderSettings {
    pub const AMR_NB_SAMPLE_RATE: u32 = 8_000;
    pub const AMR_NB_BIT_RATE: usize = 8_000;
    pub const AMR_NB_CHANNELS: u16 = 1;
    pub const MIX_CHANNELS: u16 = 2;

    /// Picks the output for a set of input tracks.
    ///
    /// A lone track keeps its own codec and layout (AMR-NB is pinned to its
    /// only valid configuration). Several tracks are mixed into stereo AAC at
    /// the lowest sample rate among the non-AMR inputs.
    pub fn for_tracks(formats: &[TrackFormat], config: &MixerConfig) -> Self {
        if let [format] = formats {
            if format.codec.is_amr() {
                return Self::amr_nb();
            }

            return Self {
                codec: format.codec,
                sample_rate: format.sample_rate,
                channels: format.channels,
                bit_rate: config.bit_rate,
            };
        }

        let sample_rate = formats
            .iter()
            .filter(|format| !format.codec.is_amr())
            .map(|format| format.sample_rate)
            .filter(|rate| *rate > 0)
            .min()
            .unwrap_or(config.fallback_sample_rate);

        Self {
            codec: AudioCodec::Aac,
            sample_rate,
            channels: Self::MIX_CHANNELS,
            bit_rate: config.bit_rate,
        }
    }

    /// Used once when the backend rejects the derived settings.
    pub fn fallback(config: &MixerConfig) -> Self {
        Self {
            codec: AudioCodec::Aac,
            sample_rate: config.fallback_sample_rate,
            channels: config.fallback_channels,
            bit_rate: config.bit_rate,
        }
    }

    pub fn amr_nb() -> Self {
        Self {
            codec: AudioCodec::AmrNb,
            sample_rate: Self::AMR_NB_SAMPLE_RATE,
            channels: Self::AMR_NB_CHANNELS,
            bit_rate: Self::AMR_NB_BIT_RATE,
        }
    }

    /// PCM layout the decoders convert to so every buffer in the mix agrees.
    pub fn pcm_info(&self) -> PcmInfo {
        PcmInfo::new_raw(self.sample_rate, self.channels)
    }
}
