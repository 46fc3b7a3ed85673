#![cfg(debug_assertions)]

use avmix_fail::FailGuard;
use avmix_media_info::{AudioCodec, TrackFormat};
use avmix_mixer::test_backend::{FakeBackend, FakeTrack};
use avmix_mixer::{AudioMix, MixError, TrackSource};
use tempfile::TempDir;

fn run_mix(dir: &TempDir) -> Result<avmix_mixer::MixReport, MixError> {
    let format = TrackFormat::new(AudioCodec::Aac, 48_000, 2);
    let backend = FakeBackend::new()
        .with_track("a.m4a", FakeTrack::constant(format.clone(), 4, 4, 10_000, 1))
        .with_track("b.m4a", FakeTrack::constant(format, 4, 4, 10_000, 1));

    AudioMix::builder(backend, dir.path().join("out.m4a"))
        .add_source(TrackSource::new("a.m4a"))
        .add_source(TrackSource::new("b.m4a"))
        .build()?
        .mix()
}

// Fail points are process-wide, so every point is exercised from one test.
#[test]
fn runtime_failures_are_reraised_on_the_caller() {
    let dir = TempDir::new().unwrap();

    {
        let _guard = FailGuard::enable("avmix-mixer::decode_loop");
        let result = run_mix(&dir);
        assert!(matches!(result, Err(MixError::Injected("decode_loop"))));
    }

    {
        let _guard = FailGuard::enable("avmix-mixer::sink_write");
        let result = run_mix(&dir);
        assert!(matches!(result, Err(MixError::Injected("sink_write"))));
    }

    {
        let _guard = FailGuard::enable("avmix-mixer::worker_panic");
        let result = run_mix(&dir);
        assert!(matches!(
            result,
            Err(MixError::WorkerPanicked(message)) if message.contains("worker_panic")
        ));
    }

    assert!(run_mix(&dir).is_ok());
    assert!(
        avmix_fail::get_state()
            .get("avmix-mixer::decode_loop")
            .is_some_and(|enabled| !enabled)
    );

    avmix_fail::set_fail("avmix-mixer::sink_write", true);
    avmix_fail::reset_all();
    assert!(run_mix(&dir).is_ok());
}
