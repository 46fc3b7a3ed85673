//! Scripted in-memory media services.
//!
//! Compressed samples are plain little-endian PCM, the decoder and encoder
//! pass data through unchanged and the container writer records every call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use avmix_media_info::{
    AudioCodec, PcmInfo, TrackFormat, le_bytes_to_samples, samples_to_le_bytes,
};

use crate::{
    BufferFlags, Codec, CodecError, ContainerWriter, DequeueOutput, Demuxer, EncoderSettings,
    MediaBackend, OutputBuffer,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FakeTrack {
    pub format: TrackFormat,
    pub units: Vec<(i64, Vec<i16>)>,
}

impl FakeTrack {
    pub fn new(format: TrackFormat, units: Vec<(i64, Vec<i16>)>) -> Self {
        Self { format, units }
    }

    /// `count` units of `unit_samples` samples all equal to `value`, spaced
    /// `step_us` apart starting at 0.
    pub fn constant(
        format: TrackFormat,
        count: usize,
        unit_samples: usize,
        step_us: i64,
        value: i16,
    ) -> Self {
        let units = (0..count)
            .map(|index| (index as i64 * step_us, vec![value; unit_samples]))
            .collect();
        Self::new(format, units)
    }

    /// Like [`FakeTrack::constant`], but unit `k` holds the value `k + 1`.
    pub fn ramp(format: TrackFormat, count: usize, unit_samples: usize, step_us: i64) -> Self {
        let units = (0..count)
            .map(|index| {
                (
                    index as i64 * step_us,
                    vec![index as i16 + 1; unit_samples],
                )
            })
            .collect();
        Self::new(format, units)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WrittenSample {
    pub track: usize,
    pub data: Vec<u8>,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl WrittenSample {
    pub fn samples(&self) -> Vec<i16> {
        le_bytes_to_samples(&self.data)
    }
}

/// Everything the services were asked to do during a mix.
#[derive(Debug, Default)]
pub struct Recording {
    pub decoder_outputs: Vec<PcmInfo>,
    pub encoder_settings: Vec<EncoderSettings>,
    pub encoder_inputs: Vec<(i64, usize, BufferFlags)>,
    pub tracks: Vec<TrackFormat>,
    pub samples: Vec<WrittenSample>,
    pub writer_started: bool,
    pub writer_stopped: bool,
}

#[derive(Debug, Clone)]
pub struct FakeBackend {
    tracks: HashMap<PathBuf, FakeTrack>,
    silent: HashSet<PathBuf>,
    rejected_codecs: Vec<AudioCodec>,
    format_changes: usize,
    codec_config: bool,
    encoder_lag: usize,
    units_per_input: usize,
    unknown_statuses: usize,
    recording: Arc<Mutex<Recording>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub const UNKNOWN_STATUS: i32 = -1_000;

    pub fn new() -> Self {
        Self {
            tracks: HashMap::new(),
            silent: HashSet::new(),
            rejected_codecs: Vec::new(),
            format_changes: 1,
            codec_config: false,
            encoder_lag: 0,
            units_per_input: 1,
            unknown_statuses: 0,
            recording: Arc::default(),
        }
    }

    pub fn with_track(mut self, path: impl Into<PathBuf>, track: FakeTrack) -> Self {
        self.tracks.insert(path.into(), track);
        self
    }

    /// The decoder for `path` accepts input but never produces output.
    pub fn with_silent_decoder(mut self, path: impl Into<PathBuf>) -> Self {
        self.silent.insert(path.into());
        self
    }

    pub fn rejecting(mut self, codec: AudioCodec) -> Self {
        self.rejected_codecs.push(codec);
        self
    }

    /// The encoder signals a format change twice.
    pub fn with_repeated_format_change(mut self) -> Self {
        self.format_changes = 2;
        self
    }

    /// The encoder emits a codec configuration unit before any data.
    pub fn with_codec_config(mut self) -> Self {
        self.codec_config = true;
        self
    }

    /// The encoder holds back `units` encoded units until end of stream is
    /// queued, like a codec with priming delay.
    pub fn with_encoder_lag(mut self, units: usize) -> Self {
        self.encoder_lag = units;
        self
    }

    /// The encoder splits every input buffer into `units` encoded units,
    /// like a codec whose frame is smaller than the submitted PCM.
    pub fn with_units_per_input(mut self, units: usize) -> Self {
        self.units_per_input = units.max(1);
        self
    }

    /// Every decoder and the encoder answer their first `count` output
    /// dequeues with [`FakeBackend::UNKNOWN_STATUS`].
    pub fn with_unknown_status(mut self, count: usize) -> Self {
        self.unknown_statuses = count;
        self
    }

    pub fn recording(&self) -> MutexGuard<'_, Recording> {
        lock(&self.recording)
    }

    pub fn written(&self) -> Vec<WrittenSample> {
        self.recording().samples.clone()
    }

    pub fn create_fake_encoder(&self, settings: &EncoderSettings) -> FakeEncoder {
        FakeEncoder {
            settings: *settings,
            format_changes_left: self.format_changes,
            codec_config_pending: self.codec_config,
            lag: self.encoder_lag,
            units_per_input: self.units_per_input,
            slots: SlotQueue::with_unknown_statuses(self.unknown_statuses),
            recording: self.recording.clone(),
        }
    }

    pub fn create_fake_writer(&self, destination: &Path) -> FakeWriter {
        FakeWriter {
            destination: destination.to_path_buf(),
            started: false,
            recording: self.recording.clone(),
        }
    }
}

fn lock(recording: &Mutex<Recording>) -> MutexGuard<'_, Recording> {
    recording.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MediaBackend for FakeBackend {
    type Demuxer = FakeDemuxer;
    type Decoder = FakeDecoder;
    type Encoder = FakeEncoder;
    type Writer = FakeWriter;

    fn open_demuxer(&self, source: &Path) -> Result<FakeDemuxer, CodecError> {
        let track = self.tracks.get(source).cloned().ok_or_else(|| {
            CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", source.display()),
            ))
        })?;

        Ok(FakeDemuxer {
            path: source.to_path_buf(),
            track,
            cursor: 0,
        })
    }

    fn create_decoder(
        &self,
        demuxer: &FakeDemuxer,
        output: PcmInfo,
    ) -> Result<FakeDecoder, CodecError> {
        lock(&self.recording).decoder_outputs.push(output);

        Ok(FakeDecoder {
            silent: self.silent.contains(&demuxer.path),
            slots: SlotQueue::with_unknown_statuses(self.unknown_statuses),
        })
    }

    fn create_encoder(&self, settings: &EncoderSettings) -> Result<FakeEncoder, CodecError> {
        if self.rejected_codecs.contains(&settings.codec) {
            return Err(CodecError::UnsupportedCodec(settings.codec));
        }

        lock(&self.recording).encoder_settings.push(*settings);

        Ok(self.create_fake_encoder(settings))
    }

    fn create_writer(&self, destination: &Path) -> Result<FakeWriter, CodecError> {
        std::fs::File::create(destination)?;
        Ok(self.create_fake_writer(destination))
    }
}

pub struct FakeDemuxer {
    path: PathBuf,
    track: FakeTrack,
    cursor: usize,
}

impl Demuxer for FakeDemuxer {
    fn track_format(&self) -> &TrackFormat {
        &self.track.format
    }

    fn select_track(&mut self, index: usize) -> Result<(), CodecError> {
        match index {
            0 => Ok(()),
            _ => Err(CodecError::TrackOutOfRange(index)),
        }
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<usize>, CodecError> {
        let Some((_, samples)) = self.track.units.get(self.cursor) else {
            return Ok(None);
        };

        buf.clear();
        buf.extend_from_slice(&samples_to_le_bytes(samples));
        Ok(Some(buf.len()))
    }

    fn sample_time_us(&self) -> i64 {
        self.track
            .units
            .get(self.cursor)
            .map(|(time, _)| *time)
            .unwrap_or(-1)
    }

    fn advance(&mut self) -> Result<bool, CodecError> {
        self.cursor += 1;
        Ok(self.cursor < self.track.units.len())
    }
}

/// Queued input waiting to come out, and output slots handed out but not
/// yet released.
#[derive(Debug, Default)]
struct SlotQueue {
    started: bool,
    pending: VecDeque<(Vec<u8>, i64, BufferFlags)>,
    outputs: HashMap<usize, Vec<u8>>,
    next_slot: usize,
    unknown_left: usize,
}

impl SlotQueue {
    fn with_unknown_statuses(count: usize) -> Self {
        Self {
            unknown_left: count,
            ..Self::default()
        }
    }

    fn unknown_status(&mut self) -> Option<DequeueOutput> {
        if self.unknown_left == 0 {
            return None;
        }

        self.unknown_left -= 1;
        Some(DequeueOutput::Unknown(FakeBackend::UNKNOWN_STATUS))
    }

    fn input_slot(&self) -> Result<Option<usize>, CodecError> {
        if self.started {
            Ok(Some(0))
        } else {
            Err(CodecError::NotStarted)
        }
    }

    fn hand_out(&mut self, data: Vec<u8>, presentation_time_us: i64, flags: BufferFlags) -> DequeueOutput {
        let slot = self.next_slot;
        self.next_slot += 1;

        let size = data.len();
        self.outputs.insert(slot, data);

        DequeueOutput::Buffer(OutputBuffer {
            slot,
            size,
            presentation_time_us,
            flags,
        })
    }

    fn next_output(&mut self) -> DequeueOutput {
        match self.pending.pop_front() {
            Some((data, time, flags)) => self.hand_out(data, time, flags),
            None => DequeueOutput::TryAgainLater,
        }
    }

    fn data(&self, slot: usize) -> Result<&[u8], CodecError> {
        self.outputs
            .get(&slot)
            .map(Vec::as_slice)
            .ok_or(CodecError::InvalidSlot(slot))
    }

    fn release(&mut self, slot: usize) -> Result<(), CodecError> {
        self.outputs
            .remove(&slot)
            .map(|_| ())
            .ok_or(CodecError::InvalidSlot(slot))
    }
}

pub struct FakeDecoder {
    silent: bool,
    slots: SlotQueue,
}

impl Codec for FakeDecoder {
    fn start(&mut self) -> Result<(), CodecError> {
        self.slots.started = true;
        Ok(())
    }

    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        self.slots.input_slot()
    }

    fn queue_input(
        &mut self,
        _slot: usize,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        if self.silent || (data.is_empty() && !flags.is_end_of_stream()) {
            return Ok(());
        }

        self.slots
            .pending
            .push_back((data.to_vec(), presentation_time_us, flags));
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<DequeueOutput, CodecError> {
        if !self.slots.started {
            return Err(CodecError::NotStarted);
        }

        if let Some(status) = self.slots.unknown_status() {
            return Ok(status);
        }

        Ok(self.slots.next_output())
    }

    fn output_data(&self, slot: usize) -> Result<&[u8], CodecError> {
        self.slots.data(slot)
    }

    fn release_output(&mut self, slot: usize) -> Result<(), CodecError> {
        self.slots.release(slot)
    }

    fn output_format(&self) -> Option<TrackFormat> {
        None
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.slots.started = false;
        Ok(())
    }
}

pub struct FakeEncoder {
    settings: EncoderSettings,
    format_changes_left: usize,
    codec_config_pending: bool,
    lag: usize,
    units_per_input: usize,
    slots: SlotQueue,
    recording: Arc<Mutex<Recording>>,
}

impl FakeEncoder {
    pub const CODEC_CONFIG: [u8; 2] = [0x11, 0x90];
}

impl Codec for FakeEncoder {
    fn start(&mut self) -> Result<(), CodecError> {
        self.slots.started = true;
        Ok(())
    }

    fn dequeue_input_slot(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        self.slots.input_slot()
    }

    fn queue_input(
        &mut self,
        _slot: usize,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        lock(&self.recording)
            .encoder_inputs
            .push((presentation_time_us, data.len(), flags));

        if flags.is_end_of_stream() {
            self.slots
                .pending
                .push_back((data.to_vec(), presentation_time_us, BufferFlags::END_OF_STREAM));
            return Ok(());
        }

        let samples = data.len() / 2;
        let chunk = samples.div_ceil(self.units_per_input).max(1) * 2;
        for unit in data.chunks(chunk) {
            self.slots
                .pending
                .push_back((unit.to_vec(), presentation_time_us, BufferFlags::KEY_FRAME));
        }
        Ok(())
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> Result<DequeueOutput, CodecError> {
        if !self.slots.started {
            return Err(CodecError::NotStarted);
        }

        if self.format_changes_left > 0 {
            self.format_changes_left -= 1;
            return Ok(DequeueOutput::FormatChanged);
        }

        if let Some(status) = self.slots.unknown_status() {
            return Ok(status);
        }

        if self.codec_config_pending {
            self.codec_config_pending = false;
            return Ok(self
                .slots
                .hand_out(Self::CODEC_CONFIG.to_vec(), 0, BufferFlags::CODEC_CONFIG));
        }

        let draining = self
            .slots
            .pending
            .back()
            .is_some_and(|(_, _, flags)| flags.is_end_of_stream());
        if !draining && self.slots.pending.len() <= self.lag {
            return Ok(DequeueOutput::TryAgainLater);
        }

        Ok(self.slots.next_output())
    }

    fn output_data(&self, slot: usize) -> Result<&[u8], CodecError> {
        self.slots.data(slot)
    }

    fn release_output(&mut self, slot: usize) -> Result<(), CodecError> {
        self.slots.release(slot)
    }

    fn output_format(&self) -> Option<TrackFormat> {
        Some(
            TrackFormat::new(
                self.settings.codec,
                self.settings.sample_rate,
                self.settings.channels,
            )
            .with_bit_rate(self.settings.bit_rate),
        )
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        self.slots.started = false;
        Ok(())
    }
}

pub struct FakeWriter {
    destination: PathBuf,
    started: bool,
    recording: Arc<Mutex<Recording>>,
}

impl ContainerWriter for FakeWriter {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, CodecError> {
        let mut recording = lock(&self.recording);
        recording.tracks.push(format.clone());
        Ok(recording.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<(), CodecError> {
        self.started = true;
        lock(&self.recording).writer_started = true;
        Ok(())
    }

    fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        if !self.started {
            return Err(CodecError::WriterNotStarted);
        }

        lock(&self.recording).samples.push(WrittenSample {
            track,
            data: data.to_vec(),
            presentation_time_us,
            flags,
        });
        Ok(())
    }

    /// Dumps every written payload, in order, to the destination file.
    fn stop(&mut self) -> Result<(), CodecError> {
        let mut recording = lock(&self.recording);
        let payload: Vec<u8> = recording
            .samples
            .iter()
            .flat_map(|sample| sample.data.iter().copied())
            .collect();

        std::fs::write(&self.destination, payload)?;
        recording.writer_stopped = true;
        Ok(())
    }
}
