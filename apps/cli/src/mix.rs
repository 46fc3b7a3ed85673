use std::{path::PathBuf, str::FromStr};

use anyhow::Context;
use avmix_enc_ffmpeg::FfmpegBackend;
use avmix_mixer::{AudioMix, MixerConfig, TrackSource};
use clap::Args;

#[derive(Args)]
pub struct MixArgs {
    /// Input track as `path[,volume[,start_ms[,delay_ms]]]`, repeatable
    #[arg(short, long = "input", required = true)]
    inputs: Vec<InputTrack>,
    /// Where to write the mixed audio
    #[arg(short, long)]
    output: PathBuf,
    /// Silence prepended to the whole mix, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: i64,
    /// JSON file with mixer tuning overrides
    #[arg(long)]
    config: Option<PathBuf>,
}

impl MixArgs {
    pub async fn run(self) -> anyhow::Result<()> {
        let config = match &self.config {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("opening config '{}'", path.display()))?;
                serde_json::from_reader::<_, MixerConfig>(file)
                    .with_context(|| format!("parsing config '{}'", path.display()))?
            }
            None => MixerConfig::default(),
        };

        let backend = FfmpegBackend::new().context("initializing ffmpeg")?;

        let report = AudioMix::builder(backend, &self.output)
            .with_sources(self.inputs.into_iter().map(|input| input.0))
            .with_general_delay_ms(self.delay_ms)
            .with_config(config)
            .build()
            .context("building mix")?
            .mix_async()
            .await
            .with_context(|| format!("mixing into '{}'", self.output.display()))?;

        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing report")?
        );

        Ok(())
    }
}

#[derive(Debug, Clone)]
struct InputTrack(TrackSource);

impl FromStr for InputTrack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');

        let path = parts
            .next()
            .filter(|path| !path.is_empty())
            .ok_or_else(|| "missing input path".to_string())?;

        let volume = parts
            .next()
            .map(|v| v.parse::<f32>().map_err(|e| format!("volume '{v}': {e}")))
            .transpose()?;
        let start_ms = parse_ms(parts.next(), "start")?;
        let delay_ms = parse_ms(parts.next(), "delay")?;

        if parts.next().is_some() {
            return Err(format!("too many fields in '{s}'"));
        }

        Ok(Self(TrackSource::from_millis(
            path, volume, start_ms, delay_ms,
        )))
    }
}

fn parse_ms(value: Option<&str>, name: &str) -> Result<i64, String> {
    value
        .map(|v| v.parse::<i64>().map_err(|e| format!("{name} '{v}': {e}")))
        .transpose()
        .map(Option::unwrap_or_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_path() {
        let input: InputTrack = "music.m4a".parse().unwrap();

        assert_eq!(input.0, TrackSource::new("music.m4a"));
    }

    #[test]
    fn parses_volume_start_and_delay() {
        let input: InputTrack = "voice.m4a,0.5,250,1000".parse().unwrap();

        assert_eq!(input.0.volume(), 0.5);
        assert_eq!(input.0.start_at_us(), 250_000);
        assert_eq!(input.0.delay_us(), 1_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<InputTrack>().is_err());
        assert!("a.m4a,loud".parse::<InputTrack>().is_err());
        assert!("a.m4a,1,0,0,7".parse::<InputTrack>().is_err());
    }
}
