//! Contracts of the demux/decode engine a session drives.
//!
//! A session never parses containers or decodes codecs itself. It drives a [`MediaEngine`],
//! which opens an [`Input`] into a [`Demuxer`]; the demuxer enumerates streams, delivers
//! compressed [`Packet`]s and opens a [`Decoder`] per stream. Decoders follow a two-phase
//! protocol: packets are sent in, then decoded [`Frame`]s are received until the decoder asks
//! for more input. Sending `None` starts draining, after which the decoder releases any
//! buffered frames and finally reports [`Receive::EndOfOutput`].
//!
//! The [`symphonia`](self::symphonia) engine is provided when the `symphonia` feature is
//! enabled, the audio and video capable [`ffmpeg`](self::ffmpeg) engine with the `ffmpeg`
//! feature. Other engines can be plugged in through
//! [`SessionBuilder::with_engine`](crate::SessionBuilder::with_engine).

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use num_rational::Rational64;

use crate::common::assert_error_traits;
use crate::conversions::{Bgr24Scaler, Scaler};
use crate::session::Settings;
use crate::source::ByteSource;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "symphonia")]
pub mod symphonia;

/// Errors reported by engine implementations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    /// The demuxer has no more packets.
    #[error("end of stream")]
    EndOfStream,
    /// Reading from the byte source failed.
    #[error("I/O error")]
    Io(#[source] Arc<io::Error>),
    /// The data could not be parsed or decoded.
    #[error("malformed data: {0}")]
    Malformed(String),
    /// The container, codec or requested operation is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Any other engine failure.
    #[error("{0}")]
    Other(String),
}
assert_error_traits!(EngineError);

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

/// What a session opens: a path the engine reads itself, or a caller-provided byte source.
pub enum Input {
    Path(PathBuf),
    Source {
        source: Box<dyn ByteSource>,
        /// File name or extension that helps format detection for headerless formats.
        hint: Option<String>,
    },
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Input::Source { hint, .. } => f.debug_struct("Source").field("hint", hint).finish(),
        }
    }
}

/// Opens inputs into demuxers.
pub trait MediaEngine: Send {
    fn open(&self, input: Input, settings: &Settings) -> Result<Box<dyn Demuxer>, EngineError>;
}

/// Media type of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    /// Subtitles, data or anything the session does not decode.
    Other,
}

/// Storage format of decoded audio samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    I16,
    I32,
    F32,
    F64,
}

impl SampleFormat {
    #[inline]
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    #[inline]
    pub const fn bits_per_sample(self) -> u32 {
        self.bytes_per_sample() as u32 * 8
    }
}

/// Pixel layout of decoded video pictures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar Y, U, V with 2x2 chroma subsampling.
    Yuv420p,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    Gray8,
}

/// Coding type of a video picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    #[default]
    Unknown,
    I,
    P,
    B,
    S,
    Si,
    Sp,
    Bi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Storage format of the decoder's output samples.
    pub sample_format: SampleFormat,
    /// Significant bits per sample as coded in the stream, if known.
    pub bits_per_raw_sample: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: Rational64,
    pub sample_aspect_ratio: Rational64,
}

/// Description of one elementary stream of a container.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Position of the stream in [`Demuxer::streams`]; packets refer to streams by it.
    pub index: usize,
    pub media_type: MediaType,
    pub codec: String,
    /// Duration of one native tick in seconds.
    pub time_base: Rational64,
    /// Stream duration in native ticks, if the container declares it.
    pub duration: Option<i64>,
    pub audio: Option<AudioParams>,
    pub video: Option<VideoParams>,
}

/// A unit of compressed data of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub duration: Option<i64>,
    /// Decoded frames to drop from the start and the end of this packet (gapless playback).
    pub trim_start: u32,
    pub trim_end: u32,
    pub data: Box<[u8]>,
}

impl Packet {
    /// A packet without gapless trimming.
    pub fn new(
        stream_index: usize,
        pts: Option<i64>,
        duration: Option<i64>,
        data: Box<[u8]>,
    ) -> Self {
        Packet {
            stream_index,
            pts,
            duration,
            trim_start: 0,
            trim_end: 0,
            data,
        }
    }
}

/// Interleaved decoded samples in their storage format.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSamples {
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl AudioSamples {
    /// Total number of samples over all channels.
    pub fn len(&self) -> usize {
        match self {
            AudioSamples::U8(s) => s.len(),
            AudioSamples::I16(s) => s.len(),
            AudioSamples::I32(s) => s.len(),
            AudioSamples::F32(s) => s.len(),
            AudioSamples::F64(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            AudioSamples::U8(_) => SampleFormat::U8,
            AudioSamples::I16(_) => SampleFormat::I16,
            AudioSamples::I32(_) => SampleFormat::I32,
            AudioSamples::F32(_) => SampleFormat::F32,
            AudioSamples::F64(_) => SampleFormat::F64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub pts: Option<i64>,
    pub channels: u16,
    pub samples: AudioSamples,
}

impl AudioFrame {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        match self.channels {
            0 => 0,
            channels => self.samples.len() / channels as usize,
        }
    }
}

/// One plane of a picture; `stride` is the number of bytes per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub pts: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub planes: Vec<Plane>,
    pub keyframe: bool,
    pub picture_type: PictureType,
    pub interlaced: bool,
    pub top_field_first: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    #[inline]
    pub fn pts(&self) -> Option<i64> {
        match self {
            Frame::Audio(frame) => frame.pts,
            Frame::Video(frame) => frame.pts,
        }
    }
}

/// Result of handing a packet to a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// The decoder holds undelivered output; receive frames and send the packet again.
    Busy,
}

/// Result of asking a decoder for output.
#[derive(Debug, Clone, PartialEq)]
pub enum Receive {
    Frame(Frame),
    /// All output for the packets sent so far was delivered.
    NeedInput,
    /// The decoder was drained and will not produce more output until flushed.
    EndOfOutput,
}

/// Container reader.
pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Picks the stream the session should decode for `media_type`.
    fn best_stream(&self, media_type: MediaType) -> Option<usize> {
        self.streams()
            .iter()
            .find(|stream| stream.media_type == media_type)
            .map(|stream| stream.index)
    }

    /// Returns the next packet of any stream, or [`EngineError::EndOfStream`].
    fn read_packet(&mut self) -> Result<Packet, EngineError>;

    /// Positions the demuxer at the last packet of `stream_index` whose timestamp is not after
    /// `timestamp`. Implementations make a best effort; some containers land on the next
    /// packet instead.
    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), EngineError>;

    /// Creates a decoder for one of this demuxer's streams.
    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn Decoder>, EngineError>;

    /// Container duration in microseconds, if known.
    fn duration(&self) -> Option<i64> {
        None
    }

    /// Pixel converter for the pictures of this demuxer's video decoders.
    fn scaler(&self) -> Box<dyn Scaler> {
        Box::new(Bgr24Scaler)
    }
}

/// Codec decoder following the send/receive protocol.
pub trait Decoder: Send {
    /// Sends a packet, or `None` to start draining.
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus, EngineError>;

    fn receive_frame(&mut self) -> Result<Receive, EngineError>;

    /// Drops all buffered state; after a flush the decoder accepts packets again.
    fn flush(&mut self);

    /// Whether the decoder buffers input and releases frames later.
    fn has_delay(&self) -> bool {
        false
    }
}
