//! Description of a complete audio/visual mix, as handed over by callers.
//!
//! Only the audio components are mixed here. Image and video components are
//! carried so a description survives a load/save round trip intact.

use std::path::{Path, PathBuf};

use avmix_media_info::millis_to_micros;
use serde::{Deserialize, Serialize};

use crate::{MixerConfig, TrackSource};

pub const TEMP_AUDIO_FILE_NAME: &str = "tempAudioMix.m4a";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MixComponent {
    Audio {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<f32>,
        #[serde(default)]
        start_at_ms: i64,
        #[serde(default)]
        delay_ms: i64,
    },
    Image {
        path: PathBuf,
        #[serde(default)]
        presentation_seconds: u32,
    },
    Video {
        path: PathBuf,
        #[serde(default)]
        volume: f32,
        #[serde(default)]
        consider_original_audio: bool,
        #[serde(default)]
        start_frame: f64,
    },
}

impl MixComponent {
    pub const MIN_IMAGE_PRESENTATION_SECONDS: u32 = 3;

    pub fn audio(path: impl Into<PathBuf>) -> Self {
        Self::Audio {
            path: path.into(),
            volume: None,
            start_at_ms: 0,
            delay_ms: 0,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Audio { path, .. } | Self::Image { path, .. } | Self::Video { path, .. } => path,
        }
    }

    /// How long an image stays on screen, never less than the minimum.
    pub fn presentation_seconds(&self) -> Option<u32> {
        match self {
            Self::Image {
                presentation_seconds,
                ..
            } => Some((*presentation_seconds).max(Self::MIN_IMAGE_PRESENTATION_SECONDS)),
            _ => None,
        }
    }

    pub fn track_source(&self) -> Option<TrackSource> {
        match self {
            Self::Audio {
                path,
                volume,
                start_at_ms,
                delay_ms,
            } => Some(TrackSource::from_millis(
                path.clone(),
                *volume,
                *start_at_ms,
                *delay_ms,
            )),
            _ => None,
        }
    }
}

/// What has to happen to the audio of a project.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioPlan {
    /// Decode, synchronize and re-encode every audio track.
    Mix(Vec<TrackSource>),
    /// A single plain track can be copied untouched.
    CopySingle(PathBuf),
    NoAudio,
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("IO/{0}")]
    Io(#[from] std::io::Error),
    #[error("Json/{0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixProject {
    pub file_name: String,
    #[serde(default)]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub components: Vec<MixComponent>,
    #[serde(default)]
    pub audio_delay_ms: i64,
    #[serde(default)]
    pub config: MixerConfig,
}

impl MixProject {
    pub fn new(file_name: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
            output_dir: output_dir.into(),
            components: Vec::new(),
            audio_delay_ms: 0,
            config: MixerConfig::default(),
        }
    }

    pub fn with_audio_delay_ms(mut self, audio_delay_ms: i64) -> Self {
        self.audio_delay_ms = audio_delay_ms;
        self
    }

    pub fn with_component(mut self, component: MixComponent) -> Self {
        self.components.push(component);
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProjectError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProjectError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }

    /// Where the mixed audio is written before it is combined with video.
    pub fn temp_audio_path(&self) -> PathBuf {
        self.output_dir.join(TEMP_AUDIO_FILE_NAME)
    }

    pub fn general_delay_us(&self) -> i64 {
        millis_to_micros(self.audio_delay_ms.max(0))
    }

    pub fn audio_sources(&self) -> Vec<TrackSource> {
        self.components
            .iter()
            .filter_map(MixComponent::track_source)
            .collect()
    }

    pub fn audio_plan(&self) -> AudioPlan {
        let sources = self.audio_sources();

        let needs_mix = sources.len() > 1
            || self.general_delay_us() > 0
            || sources
                .iter()
                .any(|source| source.start_at_us() > 0 || source.delay_us() > 0);

        if needs_mix && !sources.is_empty() {
            return AudioPlan::Mix(sources);
        }

        match sources.into_iter().next() {
            Some(source) => AudioPlan::CopySingle(source.path().to_path_buf()),
            None => AudioPlan::NoAudio,
        }
    }
}
