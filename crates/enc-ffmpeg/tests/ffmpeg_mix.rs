use std::path::{Path, PathBuf};

use avmix_enc_ffmpeg::{FfmpegBackend, FfmpegDemuxer};
use avmix_media_info::{AudioCodec, TrackFormat};
use avmix_mixer::{
    AudioMix, BufferFlags, CodecError, ContainerWriter, Demuxer, MediaBackend, TrackSource,
};
use tempfile::TempDir;

const RATE: u32 = 44_100;
const AAC_FRAME: i64 = 1024;

/// Writes `seconds` of a stereo 16-bit sine to a RIFF/WAVE file.
fn write_wav(path: &Path, seconds: f32, frequency: f32) -> PathBuf {
    let frames = (RATE as f32 * seconds) as u32;
    let channels = 2u16;
    let data_len = frames * u32::from(channels) * 2;

    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&channels.to_le_bytes());
    bytes.extend_from_slice(&RATE.to_le_bytes());
    bytes.extend_from_slice(&(RATE * u32::from(channels) * 2).to_le_bytes());
    bytes.extend_from_slice(&(channels * 2).to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());

    for frame in 0..frames {
        let t = frame as f32 / RATE as f32;
        let value = ((t * frequency * std::f32::consts::TAU).sin() * 8_000.0) as i16;
        for _ in 0..channels {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }

    std::fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

#[test]
fn demuxer_describes_wav_source() {
    let dir = TempDir::new().unwrap();
    let wav = write_wav(&dir.path().join("tone.wav"), 0.5, 440.0);
    let backend = FfmpegBackend::new().unwrap();

    let mut demuxer = backend.open_demuxer(&wav).unwrap();
    demuxer.select_track(0).unwrap();

    let format = demuxer.track_format();
    assert_eq!(format.codec, AudioCodec::PcmS16le);
    assert_eq!(format.sample_rate, RATE);
    assert_eq!(format.channels, 2);

    let mut buf = Vec::new();
    let mut total = 0;
    let mut last_time = -1;
    while let Some(size) = demuxer.read_sample(&mut buf).unwrap() {
        assert!(demuxer.sample_time_us() > last_time);
        last_time = demuxer.sample_time_us();
        total += size;
        demuxer.advance().unwrap();
    }

    assert_eq!(total, (RATE as usize / 2) * 4);
}

#[test]
fn missing_source_is_not_found() {
    let dir = TempDir::new().unwrap();
    let backend = FfmpegBackend::new().unwrap();

    let result = backend.open_demuxer(&dir.path().join("missing.wav"));

    assert!(matches!(
        result,
        Err(CodecError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound
    ));
}

#[test]
fn second_audio_track_is_out_of_range() {
    let dir = TempDir::new().unwrap();
    let wav = write_wav(&dir.path().join("tone.wav"), 0.1, 440.0);

    let mut demuxer = FfmpegDemuxer::open(&wav).unwrap();

    assert_eq!(demuxer.audio_track_count(), 1);
    assert!(matches!(
        demuxer.select_track(1),
        Err(CodecError::TrackOutOfRange(1))
    ));
}

#[test]
fn mixes_two_wav_sources_into_aac() {
    let dir = TempDir::new().unwrap();
    let low = write_wav(&dir.path().join("low.wav"), 1.0, 220.0);
    let high = write_wav(&dir.path().join("high.wav"), 0.5, 880.0);
    let output = dir.path().join("out").join("mix.m4a");

    let report = AudioMix::builder(FfmpegBackend::new().unwrap(), &output)
        .add_source(TrackSource::new(&low))
        .add_source(
            TrackSource::new(&high)
                .with_volume(0.5)
                .with_delay_us(250_000),
        )
        .build()
        .unwrap()
        .mix()
        .unwrap();

    assert_eq!(report.encoder.codec, AudioCodec::Aac);
    assert_eq!(report.encoder.sample_rate, RATE);
    assert!(report.sink.written > 0);
    assert_eq!(report.sink.dropped, 0);
    assert!(output.exists());

    let mut mixed = FfmpegDemuxer::open(&output).unwrap();
    mixed.select_track(0).unwrap();
    assert_eq!(mixed.track_format().codec, AudioCodec::Aac);
    assert_eq!(mixed.track_format().channels, 2);
    assert_eq!(mixed.track_format().sample_rate, RATE);

    let mut buf = Vec::new();
    let mut packets = 0;
    while mixed.read_sample(&mut buf).unwrap().is_some() {
        packets += 1;
        mixed.advance().unwrap();
    }
    assert_eq!(packets, report.sink.written);

    // Each packet carries one AAC frame and the first one is encoder priming.
    let encoded_frames = (packets as i64 - 1) * AAC_FRAME;
    assert!(
        (encoded_frames - i64::from(RATE)).abs() <= AAC_FRAME,
        "{encoded_frames} frames encoded for a 1 s source"
    );
}

#[test]
fn units_sharing_a_timestamp_are_all_written() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("shared.m4a");
    let backend = FfmpegBackend::new().unwrap();

    let mut format = TrackFormat::new(AudioCodec::Aac, RATE, 2).with_bit_rate(128_000);
    // AAC-LC, 44.1 kHz, stereo
    format.extradata = vec![0x12, 0x10];

    let mut writer = backend.create_writer(&output).unwrap();
    let track = writer.add_track(&format).unwrap();
    writer.start().unwrap();
    for time in [0, 0, 23_220, 23_220, 46_440] {
        writer
            .write_sample(track, &[0x21, 0x10, 0x04, 0x60], time, BufferFlags::KEY_FRAME)
            .unwrap();
    }
    writer.stop().unwrap();

    let mut demuxer = FfmpegDemuxer::open(&output).unwrap();
    demuxer.select_track(0).unwrap();

    let mut buf = Vec::new();
    let mut times = Vec::new();
    while demuxer.read_sample(&mut buf).unwrap().is_some() {
        times.push(demuxer.sample_time_us());
        demuxer.advance().unwrap();
    }

    assert_eq!(times.len(), 5);
    assert!(times.windows(2).all(|pair| pair[1] > pair[0]));
}
