use std::path::{Path, PathBuf};

use avmix_media_info::{FFRational, TrackFormat};
use avmix_mixer::{BufferFlags, CodecError, ContainerWriter};
use ffmpeg::{Packet, format, packet};
use tracing::{info, trace};

use crate::{FfmpegBackendError, ffmpeg_err, from_micros};

#[derive(Clone, Copy)]
struct WriterTrack {
    stream_index: usize,
    last_timestamp: Option<i64>,
}

/// Muxes compressed audio into a container picked from the file extension.
///
/// Units may arrive sharing a presentation time. Containers like mp4 reject
/// a decode timestamp that does not advance, so such units are moved one
/// stream time base tick past the previous one.
pub struct FfmpegWriter {
    path: PathBuf,
    output: format::context::Output,
    tracks: Vec<WriterTrack>,
    started: bool,
    finished: bool,
}

impl FfmpegWriter {
    pub fn create(path: &Path) -> Result<Self, CodecError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let output = format::output(&path).map_err(ffmpeg_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            output,
            tracks: Vec::new(),
            started: false,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn track(&self, track: usize) -> Result<&WriterTrack, CodecError> {
        self.tracks
            .get(track)
            .ok_or(CodecError::TrackOutOfRange(track))
    }
}

impl ContainerWriter for FfmpegWriter {
    fn add_track(&mut self, track_format: &TrackFormat) -> Result<usize, CodecError> {
        let id = track_format.codec.id();
        let codec = ffmpeg::codec::encoder::find(id)
            .or_else(|| ffmpeg::codec::decoder::find(id))
            .ok_or(FfmpegBackendError::CodecNotFound(id))?;

        let mut stream = self.output.add_stream(codec).map_err(ffmpeg_err)?;
        let stream_index = stream.index();
        stream.set_time_base(FFRational(1, track_format.sample_rate as i32));

        unsafe {
            let codecpar = (*stream.as_mut_ptr()).codecpar;
            (*codecpar).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
            (*codecpar).codec_id = id.into();
            (*codecpar).sample_rate = track_format.sample_rate as i32;
            (*codecpar).bit_rate = track_format.bit_rate.unwrap_or_default() as i64;
            (*codecpar).frame_size = track_format.frame_size.unwrap_or_default() as i32;
            ffmpeg::ffi::av_channel_layout_default(
                &mut (*codecpar).ch_layout,
                i32::from(track_format.channels),
            );

            if !track_format.extradata.is_empty() {
                let size = track_format.extradata.len();
                let extradata = ffmpeg::ffi::av_mallocz(
                    size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize,
                ) as *mut u8;
                if extradata.is_null() {
                    return Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory).into());
                }

                std::ptr::copy_nonoverlapping(track_format.extradata.as_ptr(), extradata, size);
                (*codecpar).extradata = extradata;
                (*codecpar).extradata_size = size as i32;
            }
        }

        self.tracks.push(WriterTrack {
            stream_index,
            last_timestamp: None,
        });
        info!(
            stream_index,
            codec = ?track_format.codec,
            sample_rate = track_format.sample_rate,
            channels = track_format.channels,
            "audio track added to {}",
            self.path.display()
        );

        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<(), CodecError> {
        // make sure this happens after adding all tracks
        self.output.write_header().map_err(ffmpeg_err)?;
        self.started = true;

        Ok(())
    }

    fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        if !self.started || self.finished {
            return Err(CodecError::WriterNotStarted);
        }

        let WriterTrack {
            stream_index,
            last_timestamp,
        } = *self.track(track)?;
        let time_base = self
            .output
            .stream(stream_index)
            .map(|stream| stream.time_base())
            .ok_or(CodecError::TrackOutOfRange(track))?;

        let timestamp = match (last_timestamp, from_micros(presentation_time_us, time_base)) {
            (Some(last), timestamp) if timestamp <= last => last + 1,
            (_, timestamp) => timestamp,
        };

        let mut packet = Packet::copy(data);
        packet.set_stream(stream_index);
        packet.set_pts(Some(timestamp));
        packet.set_dts(Some(timestamp));
        if flags.contains(BufferFlags::KEY_FRAME) {
            packet.set_flags(packet::Flags::KEY);
        }

        trace!(track, presentation_time_us, timestamp, size = data.len(), "writing sample");

        packet
            .write_interleaved(&mut self.output)
            .map_err(ffmpeg_err)?;

        if let Some(track) = self.tracks.get_mut(track) {
            track.last_timestamp = Some(timestamp);
        }

        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        if !self.started {
            return Err(CodecError::WriterNotStarted);
        }
        if self.finished {
            return Ok(());
        }

        self.finished = true;
        self.output.write_trailer().map_err(ffmpeg_err)?;
        info!(path = %self.path.display(), "container finalized");

        Ok(())
    }
}
