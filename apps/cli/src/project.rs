use std::path::PathBuf;

use anyhow::Context;
use avmix_enc_ffmpeg::FfmpegBackend;
use avmix_mixer::{AudioMix, AudioPlan, MixProject};
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct ProjectArgs {
    /// Path to the JSON mix description
    project_path: PathBuf,
    /// Copy the resulting audio here as well
    #[arg(long)]
    output_path: Option<PathBuf>,
}

impl ProjectArgs {
    pub async fn run(self) -> anyhow::Result<()> {
        let project = MixProject::load(&self.project_path)
            .with_context(|| format!("loading '{}'", self.project_path.display()))?;
        let audio_path = project.temp_audio_path();

        match project.audio_plan() {
            AudioPlan::NoAudio => {
                info!("project has no audio components");
                println!("No audio to produce");
                return Ok(());
            }
            AudioPlan::CopySingle(source) => {
                if let Some(parent) = audio_path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating '{}'", parent.display()))?;
                }
                std::fs::copy(&source, &audio_path).with_context(|| {
                    format!(
                        "copying '{}' to '{}'",
                        source.display(),
                        audio_path.display()
                    )
                })?;
                info!(source = %source.display(), "single plain track copied");
            }
            AudioPlan::Mix(_) => {
                let backend = FfmpegBackend::new().context("initializing ffmpeg")?;
                let report = AudioMix::from_project(backend, &project)
                    .context("building mix")?
                    .mix_async()
                    .await
                    .with_context(|| format!("mixing into '{}'", audio_path.display()))?;

                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing report")?
                );
            }
        }

        let audio_path = match self.output_path {
            Some(output_path) => {
                std::fs::copy(&audio_path, &output_path).with_context(|| {
                    format!("copying result to '{}'", output_path.display())
                })?;
                output_path
            }
            None => audio_path,
        };

        println!("Wrote audio to '{}'", audio_path.display());

        Ok(())
    }
}
