//! Decoding sessions.
//!
//! A [`Session`] turns a container into a time ordered sequence of normalized audio blocks
//! and video pictures. It owns the demuxer, one decoder per requested track, the format
//! normalizers and the optional per-track [`SeekIndex`].
//!
//! Opening never fails outright. A session that could not be set up is in the error state:
//! [`Session::has_error`] returns true, [`Session::error`] tells why, and every other
//! operation returns [`SessionError::Failed`].
//!
//! # Example
//!
//! ```no_run
//! use avsession::{Session, TrackMask};
//!
//! let mut session = Session::open_from_path(TrackMask::AUDIO, "music.flac");
//! let mut buffer = vec![0u8; session.frame_buffer_size()];
//! while let Some(unit) = session.read(&mut buffer)? {
//!     let bytes = &buffer[..unit.len];
//!     // `unit.timestamp` is the position of the first sample of `bytes`.
//! #   let _ = bytes;
//! }
//! # Ok::<(), avsession::SessionError>(())
//! ```

use std::path::Path;

use num_rational::Rational64;

use crate::common::{assert_error_traits, TrackMask, TrackType};
use crate::conversions::{
    AudioNormalizer, AudioOutputFormat, ConvertError, VideoNormalizer, VideoOutputFormat,
};
use crate::engine::{
    Demuxer, EngineError, Frame, Input, MediaEngine, MediaType, Packet, PictureType, StreamInfo,
};
use crate::position::{PositionTracker, TimeScale};
use crate::seek_index::{SeekIndex, SeekIndexError};
use crate::source::ByteSource;

mod builder;
mod decode_loop;

pub use self::builder::{SessionBuilder, Settings, TrackPriority, MAX_DECODE_ERRORS};
pub use self::decode_loop::DecoderState;

use self::decode_loop::{Normalizer, Track};

/// Errors returned by [`Session`] operations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum SessionError {
    /// The session could not be opened; holds the reason.
    #[error("{0}")]
    Failed(String),
    /// The operation refers to a track type the session does not decode.
    #[error("no {0} track is open")]
    TrackNotOpen(TrackType),
    /// The read buffer cannot hold the next unit. The unit is kept for the next read.
    #[error("output buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
    /// A decoder failed.
    #[error("decoding failed")]
    Decode(#[source] EngineError),
    /// Reading a packet from the container failed.
    #[error("reading the container failed")]
    Demux(#[source] EngineError),
    /// The demuxer could not seek.
    #[error("seeking failed")]
    Seek(#[source] EngineError),
    /// A decoded unit could not be normalized.
    #[error("format conversion failed")]
    Convert(#[source] ConvertError),
    /// The seek index could not be extended.
    #[error("seek index error")]
    Index(#[source] SeekIndexError),
}
assert_error_traits!(SessionError);

/// Result of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedUnit {
    /// The track the unit belongs to.
    pub track: TrackType,
    /// Samples per channel for audio, `1` for video.
    pub units: usize,
    /// Position of the unit's first sample or of the picture, in samples or frames.
    pub timestamp: i64,
    /// Bytes written to the read buffer.
    pub len: usize,
}

/// Properties of the most recently read picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameProps {
    pub keyframe: bool,
    pub picture_type: PictureType,
    pub interlaced: bool,
    pub top_field_first: bool,
}

/// Audio output configuration of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioOutput {
    pub format: AudioOutputFormat,
    /// Stream length in samples per channel, if known.
    pub length: Option<i64>,
    /// Samples per channel in a typical unit.
    pub frame_size: usize,
    /// End position of the last read unit.
    pub position: i64,
}

impl AudioOutput {
    /// Bytes needed to hold a typical unit.
    pub fn frame_bytes(&self) -> usize {
        self.frame_size * self.format.block_align()
    }
}

/// Video output configuration of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoOutput {
    pub format: VideoOutputFormat,
    /// Stream length in frames, if known.
    pub length: Option<i64>,
    /// Bytes needed to hold one picture, including rows padded up to
    /// [`ROW_ALIGNMENT`](crate::conversions::ROW_ALIGNMENT) bytes.
    pub frame_size: usize,
    /// Bytes per row of the last read picture.
    pub stride: usize,
    pub current_frame: FrameProps,
}

/// Output configuration of one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Audio(AudioOutput),
    Video(VideoOutput),
}

/// A decoding session over one container.
pub struct Session {
    settings: Settings,
    error: Option<String>,
    demuxer: Option<Box<dyn Demuxer>>,
    audio: Option<Track>,
    video: Option<Track>,
    audio_output: Option<AudioOutput>,
    video_output: Option<VideoOutput>,
    /// A packet the decoder could not take yet.
    pending_packet: Option<Packet>,
    /// A decoded unit not delivered yet.
    pending_frame: Option<(TrackType, Frame)>,
    eof: bool,
    /// Malformed packets skipped in a row.
    decode_errors: usize,
}

impl Session {
    /// Returns a builder to configure a new session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Opens the file at `path`, decoding the tracks in `mode`.
    pub fn open_from_path(mode: impl Into<TrackMask>, path: impl AsRef<Path>) -> Session {
        SessionBuilder::new()
            .with_mode(mode)
            .with_path(path.as_ref())
            .build()
    }

    /// Opens a caller-provided byte source. `name` is a file name or extension helping format
    /// detection.
    pub fn open_from_source(
        mode: impl Into<TrackMask>,
        source: impl ByteSource + 'static,
        name: Option<&str>,
    ) -> Session {
        SessionBuilder::new()
            .with_mode(mode)
            .with_source(source, name)
            .build()
    }

    pub(crate) fn open(
        input: Option<Input>,
        engine: Option<Box<dyn MediaEngine>>,
        settings: Settings,
    ) -> Session {
        let mut session = Session {
            settings,
            error: None,
            demuxer: None,
            audio: None,
            video: None,
            audio_output: None,
            video_output: None,
            pending_packet: None,
            pending_frame: None,
            eof: false,
            decode_errors: 0,
        };
        if let Err(message) = session.setup(input, engine) {
            tracing::error!("{message}");
            session.error = Some(message);
        }
        session
    }

    fn setup(
        &mut self,
        input: Option<Input>,
        engine: Option<Box<dyn MediaEngine>>,
    ) -> Result<(), String> {
        if self.settings.mode.is_empty() {
            return Err("no mode specified".to_owned());
        }
        let input = input.ok_or_else(|| "no input specified".to_owned())?;
        let engine = match engine {
            Some(engine) => engine,
            None => default_engine()?,
        };

        let description = format!("{input:?}");
        let mut demuxer = engine
            .open(input, &self.settings)
            .map_err(|e| format!("Could not open source {description}: {}", error_chain(&e)))?;

        if self.settings.mode.contains(TrackType::Audio) {
            let (track, output) = open_audio(demuxer.as_mut())?;
            self.audio = Some(track);
            self.audio_output = Some(output);
        }
        if self.settings.mode.contains(TrackType::Video) {
            let (track, output) = open_video(demuxer.as_mut())?;
            self.video = Some(track);
            self.video_output = Some(output);
        }

        self.demuxer = Some(demuxer);
        Ok(())
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Why the session could not be opened.
    #[inline]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The track types this session decodes.
    pub fn tracks(&self) -> TrackMask {
        let mut mask = TrackMask::NONE;
        if self.audio.is_some() {
            mask |= TrackMask::AUDIO;
        }
        if self.video.is_some() {
            mask |= TrackMask::VIDEO;
        }
        mask
    }

    #[inline]
    pub fn audio_output(&self) -> Option<&AudioOutput> {
        self.audio_output.as_ref()
    }

    #[inline]
    pub fn video_output(&self) -> Option<&VideoOutput> {
        self.video_output.as_ref()
    }

    pub fn output_format(&self, track: TrackType) -> Result<OutputFormat, SessionError> {
        self.check()?;
        match track {
            TrackType::Audio => self.audio_output.map(OutputFormat::Audio),
            TrackType::Video => self.video_output.map(OutputFormat::Video),
        }
        .ok_or(SessionError::TrackNotOpen(track))
    }

    /// Size of a read buffer that fits a typical unit of every open track.
    pub fn frame_buffer_size(&self) -> usize {
        let audio = self.audio_output.map_or(0, |output| output.frame_bytes());
        let video = self.video_output.map_or(0, |output| output.frame_size);
        audio.max(video)
    }

    /// Decodes the next unit of any open track into `out`.
    ///
    /// Returns `Ok(None)` once the stream is exhausted and every decoder is drained. A buffer
    /// smaller than the unit fails with [`SessionError::BufferTooSmall`]; the unit is then
    /// delivered by the next read.
    pub fn read(&mut self, out: &mut [u8]) -> Result<Option<DecodedUnit>, SessionError> {
        self.check()?;
        Ok(self
            .next_unit(Some(out))?
            .map(|delivered| delivered.unit))
    }

    /// Seeks `track` to `position`, in samples for audio and frames for video.
    ///
    /// With a finalized seek index for the track, the target is moved back to the closest
    /// indexed timestamp. All decoders are flushed and buffered data is discarded, so the next
    /// read starts at the new position.
    pub fn seek(&mut self, position: i64, track: TrackType) -> Result<(), SessionError> {
        self.check()?;
        let seeked = self.track(track).ok_or(SessionError::TrackNotOpen(track))?;
        let scale = *seeked.tracker.scale();
        let stream_index = seeked.stream_index;

        let mut target = scale.to_timestamp(position);
        if let Some(index) = seeked.index.as_ref().filter(|index| index.is_finalized()) {
            match index.find(target) {
                Ok(indexed) => {
                    tracing::debug!("seek index moves {track} seek target {target} to {indexed}");
                    target = indexed;
                }
                Err(e) => tracing::debug!("seek index lookup for {target} failed: {e}"),
            }
        }

        self.demuxer_mut()?
            .seek(stream_index, target)
            .map_err(SessionError::Seek)?;

        self.pending_packet = None;
        self.pending_frame = None;
        self.eof = false;
        self.decode_errors = 0;

        let position = scale.to_position(target);
        for kind in [TrackType::Audio, TrackType::Video] {
            if let Some(other) = self.track_mut(kind) {
                other.flush();
                let reset = if kind == track {
                    position
                } else {
                    scale.position_in(position, other.tracker.scale())
                };
                other.tracker.reset(reset);
            }
        }
        if let Some(output) = self.audio_output.as_mut() {
            output.position = self.audio.as_ref().map_or(0, |t| t.tracker.position());
        }
        Ok(())
    }

    /// Scans the whole stream and records the timestamp of every unit of the tracks in `mask`.
    ///
    /// Existing indices of these tracks are dropped first. The scan starts at the beginning and
    /// leaves the session at the end of the stream. Indices are finalized even when the scan
    /// fails, holding the timestamps seen until then.
    pub fn build_seek_index(&mut self, mask: TrackMask) -> Result<(), SessionError> {
        self.check()?;
        let requested = mask;
        let mask = mask & self.tracks();
        if mask.is_empty() {
            return match requested.iter().next() {
                Some(missing) => Err(SessionError::TrackNotOpen(missing)),
                None => Ok(()),
            };
        }

        self.drop_seek_index(mask);
        let primary = if self.audio.is_some() {
            TrackType::Audio
        } else {
            TrackType::Video
        };
        self.seek(0, primary)?;

        for kind in mask.iter() {
            if let Some(track) = self.track_mut(kind) {
                track.index = Some(SeekIndex::build());
            }
        }

        let result = self.scan_into_index(mask);

        for kind in mask.iter() {
            if let Some(index) = self.track_mut(kind).and_then(|track| track.index.as_mut()) {
                index.finalize();
                tracing::debug!("{kind} seek index holds {} timestamps", index.len());
            }
        }
        result
    }

    fn scan_into_index(&mut self, mask: TrackMask) -> Result<(), SessionError> {
        while let Some(delivered) = self.next_unit(None)? {
            let kind = delivered.unit.track;
            if !mask.contains(kind) {
                continue;
            }
            if let Some(track) = self.track_mut(kind) {
                let timestamp = delivered
                    .pts
                    .unwrap_or_else(|| track.tracker.scale().to_timestamp(delivered.unit.timestamp));
                if let Some(index) = track.index.as_mut() {
                    index.add(timestamp).map_err(SessionError::Index)?;
                }
            }
        }
        Ok(())
    }

    /// Removes the seek indices of the tracks in `mask`.
    pub fn drop_seek_index(&mut self, mask: TrackMask) {
        for kind in mask.iter() {
            if let Some(track) = self.track_mut(kind) {
                track.index = None;
            }
        }
    }

    pub fn seek_index(&self, track: TrackType) -> Option<&SeekIndex> {
        self.track(track).and_then(|track| track.index.as_ref())
    }

    /// Protocol state of a track's decoder.
    pub fn decoder_state(&self, track: TrackType) -> Option<DecoderState> {
        self.track(track).map(|track| track.state)
    }

    /// Releases the session. Dropping it has the same effect.
    pub fn close(mut self) {
        self.pending_frame = None;
        self.pending_packet = None;
        for kind in [TrackType::Audio, TrackType::Video] {
            if let Some(track) = self.take_track(kind) {
                tracing::trace!(
                    "closing {} track after {} units",
                    track.kind,
                    track.frames_decoded
                );
            }
        }
        self.demuxer = None;
    }

    fn check(&self) -> Result<(), SessionError> {
        match &self.error {
            Some(message) => Err(SessionError::Failed(message.clone())),
            None => Ok(()),
        }
    }

    fn track(&self, kind: TrackType) -> Option<&Track> {
        match kind {
            TrackType::Audio => self.audio.as_ref(),
            TrackType::Video => self.video.as_ref(),
        }
    }

    fn track_mut(&mut self, kind: TrackType) -> Option<&mut Track> {
        match kind {
            TrackType::Audio => self.audio.as_mut(),
            TrackType::Video => self.video.as_mut(),
        }
    }

    fn take_track(&mut self, kind: TrackType) -> Option<Track> {
        match kind {
            TrackType::Audio => self.audio.take(),
            TrackType::Video => self.video.take(),
        }
    }

    fn track_of_stream(&self, stream_index: usize) -> Option<TrackType> {
        [TrackType::Audio, TrackType::Video]
            .into_iter()
            .find(|kind| {
                self.track(*kind)
                    .is_some_and(|track| track.stream_index == stream_index)
            })
    }

    fn demuxer_mut(&mut self) -> Result<&mut Box<dyn Demuxer>, SessionError> {
        self.demuxer
            .as_mut()
            .ok_or_else(|| SessionError::Failed("session is closed".to_owned()))
    }
}

#[cfg(feature = "symphonia")]
fn default_engine() -> Result<Box<dyn MediaEngine>, String> {
    Ok(Box::new(crate::engine::symphonia::SymphoniaEngine))
}

#[cfg(all(feature = "ffmpeg", not(feature = "symphonia")))]
fn default_engine() -> Result<Box<dyn MediaEngine>, String> {
    Ok(Box::new(crate::engine::ffmpeg::FfmpegEngine))
}

#[cfg(not(any(feature = "symphonia", feature = "ffmpeg")))]
fn default_engine() -> Result<Box<dyn MediaEngine>, String> {
    Err(
        "no media engine available, enable the `symphonia` or `ffmpeg` feature or provide one"
            .to_owned(),
    )
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn find_stream(demuxer: &dyn Demuxer, media_type: MediaType) -> Option<StreamInfo> {
    let index = demuxer.best_stream(media_type)?;
    demuxer.streams().get(index).cloned()
}

fn open_audio(demuxer: &mut dyn Demuxer) -> Result<(Track, AudioOutput), String> {
    let stream = find_stream(demuxer, MediaType::Audio)
        .ok_or_else(|| "Cannot find audio stream".to_owned())?;
    let params = stream
        .audio
        .as_ref()
        .ok_or_else(|| format!("audio stream {} has no audio parameters", stream.index))?;

    let normalizer = AudioNormalizer::new(params)
        .map_err(|e| format!("Could not set up audio conversion: {e}"))?;
    let decoder = demuxer
        .open_decoder(stream.index)
        .map_err(|e| format!("Could not open audio decoder {}: {}", stream.codec, error_chain(&e)))?;
    if decoder.has_delay() {
        tracing::warn!("audio decoder {} releases frames with a delay", stream.codec);
    }

    let rate = Rational64::from_integer(i64::from(params.sample_rate));
    let scale = TimeScale::new(stream.time_base, rate);
    let length = match (stream.duration, demuxer.duration()) {
        (Some(duration), _) => Some(scale.to_position(duration)),
        (None, Some(micros)) => {
            Some(TimeScale::new(Rational64::new(1, 1_000_000), rate).to_position(micros))
        }
        (None, None) => None,
    };
    let output = AudioOutput {
        format: *normalizer.format(),
        length,
        frame_size: params.sample_rate as usize,
        position: 0,
    };

    Ok((
        Track {
            kind: TrackType::Audio,
            stream_index: stream.index,
            decoder,
            state: DecoderState::NeedInput,
            tracker: PositionTracker::new(scale),
            normalizer: Normalizer::Audio(normalizer),
            index: None,
            frames_decoded: 0,
        },
        output,
    ))
}

fn open_video(demuxer: &mut dyn Demuxer) -> Result<(Track, VideoOutput), String> {
    let stream = find_stream(demuxer, MediaType::Video)
        .ok_or_else(|| "Cannot find video stream".to_owned())?;
    let params = stream
        .video
        .as_ref()
        .ok_or_else(|| format!("video stream {} has no video parameters", stream.index))?;

    let normalizer = VideoNormalizer::with_scaler(params, demuxer.scaler())
        .map_err(|e| format!("Could not set up video conversion: {e}"))?;
    let decoder = demuxer
        .open_decoder(stream.index)
        .map_err(|e| format!("Could not open video decoder {}: {}", stream.codec, error_chain(&e)))?;
    if decoder.has_delay() {
        tracing::warn!("video decoder {} releases frames with a delay", stream.codec);
    }

    let scale = TimeScale::new(stream.time_base, params.frame_rate);
    let output = VideoOutput {
        format: *normalizer.format(),
        length: stream.duration.map(|duration| scale.to_position(duration)),
        frame_size: normalizer.frame_size(),
        stride: params.width as usize * 3,
        current_frame: FrameProps::default(),
    };

    Ok((
        Track {
            kind: TrackType::Video,
            stream_index: stream.index,
            decoder,
            state: DecoderState::NeedInput,
            tracker: PositionTracker::new(scale),
            normalizer: Normalizer::Video(normalizer),
            index: None,
            frames_decoded: 0,
        },
        output,
    ))
}
