use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use avmix_media_info::{TrackFormat, millis_to_micros};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    Codec, DecodeLoop, Demuxer, EncodeMuxSink, EncoderSettings, MediaBackend, MixError,
    MixProject, Mixer, MixerConfig, SilencePadder, SinkStats, TrackSource,
};

pub const WORKER_THREAD_NAME: &str = "avmix-audio-mix";

/// Summary of a finished mix.
#[derive(Debug, Clone, Serialize)]
pub struct MixReport {
    pub output: PathBuf,
    pub encoder: EncoderSettings,
    pub iterations: u64,
    /// Decoding ended on the stall budget instead of end of stream.
    pub stalled: bool,
    pub timeline_len: usize,
    pub drift_us: i64,
    pub decoded_buffers: Vec<usize>,
    pub padded_buffers: Vec<usize>,
    pub general_delay_padding: usize,
    pub mixed_buffers: usize,
    pub sink: SinkStats,
}

pub struct AudioMixBuilder<B: MediaBackend> {
    backend: B,
    output: PathBuf,
    sources: Vec<TrackSource>,
    general_delay_us: i64,
    config: MixerConfig,
}

impl<B: MediaBackend> AudioMixBuilder<B> {
    pub fn add_source(mut self, source: TrackSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = TrackSource>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_general_delay_ms(self, delay_ms: i64) -> Self {
        self.with_general_delay_us(millis_to_micros(delay_ms))
    }

    pub fn with_general_delay_us(mut self, delay_us: i64) -> Self {
        self.general_delay_us = delay_us.max(0);
        self
    }

    pub fn with_config(mut self, config: MixerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn build(self) -> Result<AudioMix<B>, MixError> {
        if self.sources.is_empty() {
            return Err(MixError::NoAudioTracks);
        }

        Ok(AudioMix {
            backend: self.backend,
            output: self.output,
            sources: self.sources,
            general_delay_us: self.general_delay_us,
            config: self.config,
        })
    }
}

/// One decode, mix and encode run over a fixed set of tracks.
pub struct AudioMix<B: MediaBackend> {
    backend: B,
    output: PathBuf,
    sources: Vec<TrackSource>,
    general_delay_us: i64,
    config: MixerConfig,
}

impl<B: MediaBackend> AudioMix<B> {
    pub fn builder(backend: B, output: impl Into<PathBuf>) -> AudioMixBuilder<B> {
        AudioMixBuilder {
            backend,
            output: output.into(),
            sources: Vec::new(),
            general_delay_us: 0,
            config: MixerConfig::default(),
        }
    }

    /// Mixes the audio components of `project` into its temporary audio path.
    pub fn from_project(backend: B, project: &MixProject) -> Result<Self, MixError> {
        Self::builder(backend, project.temp_audio_path())
            .with_sources(project.audio_sources())
            .with_general_delay_us(project.general_delay_us())
            .with_config(project.config.clone())
            .build()
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn sources(&self) -> &[TrackSource] {
        &self.sources
    }

    /// Runs the mix on a dedicated worker and blocks until it is done.
    pub fn mix(self) -> Result<MixReport, MixError> {
        self.spawn()?.join()
    }

    /// Runs the mix on a dedicated worker, awaiting the result without
    /// blocking the executor.
    pub async fn mix_async(self) -> Result<MixReport, MixError> {
        self.spawn()?.join_async().await
    }

    pub fn spawn(self) -> Result<MixHandle, MixError> {
        let (done_tx, done_rx) = flume::bounded(1);

        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                if self.config.raise_worker_priority {
                    raise_worker_priority();
                }

                avmix_fail::fail!("worker_panic");

                let result = self.run();
                if let Err(e) = &result {
                    warn!("audio mix failed: {e}");
                }

                let _ = done_tx.send(result);
            })
            .map_err(MixError::Spawn)?;

        Ok(MixHandle {
            done_rx,
            thread: Some(thread),
        })
    }

    /// Runs the whole mix on the calling thread.
    pub fn run(self) -> Result<MixReport, MixError> {
        let Self {
            backend,
            output,
            sources,
            general_delay_us,
            config,
        } = self;

        if sources.is_empty() {
            return Err(MixError::NoAudioTracks);
        }

        info!(
            tracks = sources.len(),
            general_delay_us,
            output = %output.display(),
            "starting audio mix"
        );

        let mut demuxers = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let mut demuxer = backend
                .open_demuxer(source.path())
                .map_err(|e| MixError::setup(index, source.path(), e))?;
            demuxer
                .select_track(0)
                .map_err(|e| MixError::setup(index, source.path(), e))?;

            debug!(track = index, format = ?demuxer.track_format(), "opened source");
            demuxers.push(demuxer);
        }

        let formats: Vec<TrackFormat> = demuxers
            .iter()
            .map(|demuxer| demuxer.track_format().clone())
            .collect();

        let (encoder, settings) = create_encoder(&backend, &formats, &config)?;
        let pcm = settings.pcm_info();

        let mut decode_loop = DecodeLoop::new(&config);
        for (index, (source, demuxer)) in sources.iter().zip(demuxers).enumerate() {
            let mut decoder = backend
                .create_decoder(&demuxer, pcm)
                .map_err(|e| MixError::setup(index, source.path(), e))?;
            decoder
                .start()
                .map_err(|e| MixError::setup(index, source.path(), e))?;

            decode_loop.add_track(source.clone(), demuxer, decoder);
        }

        let writer = backend
            .create_writer(&output)
            .map_err(|source| MixError::OutputSetup {
                path: output.clone(),
                source,
            })?;

        let mut decoded = decode_loop.run()?;
        let decoded_buffers: Vec<usize> = decoded.buffers.iter().map(|list| list.len()).collect();

        let padder = SilencePadder::new(sources.iter().map(TrackSource::delay_us).collect());
        let padded_buffers = padder.apply(
            &mut decoded.buffers,
            &decoded.timeline,
            &mut decoded.drift,
            &mut decoded.ctx,
        );

        let mixer = Mixer::new(sources.iter().map(TrackSource::volume).collect())
            .with_general_delay(general_delay_us, padder.has_delays());
        let mixed = mixer.mix(decoded.buffers, &decoded.timeline, &mut decoded.ctx);

        let drift_us = decoded.drift.get(&decoded.timeline);

        let mut sink = EncodeMuxSink::new(encoder, writer, config.encode_timeout());
        sink.start()?;
        sink.write_all(
            mixed.buffers.iter().map(|buffer| &buffer[..]),
            &decoded.timeline,
            drift_us,
        )?;
        sink.flush(drift_us, config.stall_budget)?;
        let sink_stats = sink.finish()?;

        let report = MixReport {
            output,
            encoder: settings,
            iterations: decoded.iterations,
            stalled: decoded.stalled,
            timeline_len: decoded.timeline.len(),
            drift_us,
            decoded_buffers,
            padded_buffers,
            general_delay_padding: mixed.delay_padding,
            mixed_buffers: mixed.buffers.len(),
            sink: sink_stats,
        };

        info!(
            iterations = report.iterations,
            stalled = report.stalled,
            mixed = report.mixed_buffers,
            written = report.sink.written,
            dropped = report.sink.dropped,
            "audio mix finished"
        );

        Ok(report)
    }
}

fn create_encoder<B: MediaBackend>(
    backend: &B,
    formats: &[TrackFormat],
    config: &MixerConfig,
) -> Result<(B::Encoder, EncoderSettings), MixError> {
    let settings = EncoderSettings::for_tracks(formats, config);

    match backend.create_encoder(&settings) {
        Ok(encoder) => Ok((encoder, settings)),
        Err(e) => {
            let fallback = EncoderSettings::fallback(config);
            warn!(?settings, ?fallback, "encoder rejected settings, falling back: {e}");

            backend
                .create_encoder(&fallback)
                .map(|encoder| (encoder, fallback))
                .map_err(|source| MixError::EncoderSetup {
                    settings: fallback,
                    source,
                })
        }
    }
}

/// Pending result of a mix running on its worker.
pub struct MixHandle {
    done_rx: flume::Receiver<Result<MixReport, MixError>>,
    thread: Option<JoinHandle<()>>,
}

impl MixHandle {
    pub fn join(mut self) -> Result<MixReport, MixError> {
        let result = self.done_rx.recv();
        self.finish(result.ok())
    }

    pub async fn join_async(mut self) -> Result<MixReport, MixError> {
        let result = self.done_rx.recv_async().await;
        self.finish(result.ok())
    }

    fn finish(
        &mut self,
        result: Option<Result<MixReport, MixError>>,
    ) -> Result<MixReport, MixError> {
        let joined = self.thread.take().map(JoinHandle::join);

        match (result, joined) {
            (Some(result), _) => result,
            (None, Some(Err(payload))) => Err(MixError::WorkerPanicked(panic_message(&*payload))),
            (None, _) => Err(MixError::WorkerDisconnected),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(unix)]
fn raise_worker_priority() {
    const WORKER_NICENESS: libc::c_int = -10;

    // On Linux this only affects the calling thread.
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, WORKER_NICENESS) };
    if result != 0 {
        warn!(
            "could not raise audio mix worker priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn raise_worker_priority() {
    debug!("worker priority raise not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_backend::{FakeBackend, FakeTrack};
    use avmix_media_info::AudioCodec;

    fn format(codec: AudioCodec, sample_rate: u32) -> TrackFormat {
        TrackFormat::new(codec, sample_rate, 2)
    }

    #[test]
    fn builder_requires_a_source() {
        let result = AudioMix::builder(FakeBackend::new(), "out.m4a").build();

        assert!(matches!(result, Err(MixError::NoAudioTracks)));
    }

    #[test]
    fn falls_back_when_encoder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new()
            .with_track(
                "a",
                FakeTrack::constant(format(AudioCodec::Opus, 44_100), 3, 4, 10_000, 7),
            )
            .rejecting(AudioCodec::Opus);

        let report = AudioMix::builder(backend.clone(), dir.path().join("out.m4a"))
            .add_source(TrackSource::new("a"))
            .build()
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(report.encoder.codec, AudioCodec::Aac);
        assert_eq!(report.encoder.sample_rate, 48_000);
        assert_eq!(backend.recording().decoder_outputs[0].sample_rate, 48_000);
    }

    #[test]
    fn decoders_convert_to_encoder_layout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new()
            .with_track("a", FakeTrack::constant(format(AudioCodec::Aac, 48_000), 2, 4, 10_000, 1))
            .with_track("b", FakeTrack::constant(format(AudioCodec::Mp3, 22_050), 2, 4, 10_000, 1));

        AudioMix::builder(backend.clone(), dir.path().join("out.m4a"))
            .add_source(TrackSource::new("a"))
            .add_source(TrackSource::new("b"))
            .build()
            .unwrap()
            .run()
            .unwrap();

        let recording = backend.recording();
        assert_eq!(recording.encoder_settings[0].sample_rate, 22_050);
        assert!(
            recording
                .decoder_outputs
                .iter()
                .all(|pcm| pcm.sample_rate == 22_050 && pcm.channels == 2)
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
    }
}
