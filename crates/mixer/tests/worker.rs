use avmix_media_info::{AudioCodec, TrackFormat};
use avmix_mixer::test_backend::{FakeBackend, FakeTrack};
use avmix_mixer::{AudioMix, MixError, MixerConfig, TrackSource};
use tempfile::TempDir;

const STEP: i64 = 20_000;

fn backend() -> FakeBackend {
    let format = TrackFormat::new(AudioCodec::Aac, 44_100, 2);

    FakeBackend::new()
        .with_track("a.m4a", FakeTrack::constant(format.clone(), 12, 4, STEP, 100))
        .with_track("b.m4a", FakeTrack::constant(format, 6, 4, STEP, 50))
}

fn mix(backend: &FakeBackend, dir: &TempDir) -> AudioMix<FakeBackend> {
    AudioMix::builder(backend.clone(), dir.path().join("worker.m4a"))
        .add_source(TrackSource::new("a.m4a"))
        .add_source(TrackSource::new("b.m4a").with_delay_us(2 * STEP))
        .with_config(MixerConfig::default().with_raise_worker_priority(false))
        .build()
        .unwrap()
}

#[test]
fn blocking_mix_runs_on_worker() {
    let dir = TempDir::new().unwrap();
    let backend = backend();

    let report = mix(&backend, &dir).mix().unwrap();

    assert_eq!(report.decoded_buffers, vec![12, 6]);
    assert_eq!(report.padded_buffers, vec![0, 2]);
    assert_eq!(report.sink.written, 12);
    assert!(dir.path().join("worker.m4a").exists());
}

#[test]
fn worker_failures_surface_on_the_caller() {
    let dir = TempDir::new().unwrap();

    let result = AudioMix::builder(backend(), dir.path().join("worker.m4a"))
        .add_source(TrackSource::new("nowhere.m4a"))
        .build()
        .unwrap()
        .mix();

    match result {
        Err(MixError::Setup { track, path, .. }) => {
            assert_eq!(track, 0);
            assert_eq!(path, std::path::PathBuf::from("nowhere.m4a"));
        }
        other => panic!("expected setup failure, got {other:?}"),
    }
}

#[test]
fn priority_raise_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let backend = backend();

    let report = AudioMix::builder(backend.clone(), dir.path().join("worker.m4a"))
        .add_source(TrackSource::new("a.m4a"))
        .with_config(MixerConfig::default().with_raise_worker_priority(true))
        .build()
        .unwrap()
        .mix()
        .unwrap();

    assert_eq!(report.sink.written, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_mix_completes() {
    let dir = TempDir::new().unwrap();
    let backend = backend();

    let report = mix(&backend, &dir).mix_async().await.unwrap();

    assert!(!report.stalled);
    assert_eq!(report.mixed_buffers, 12);
    assert_eq!(backend.written().len(), 12);
}
