//! Streaming audio and video decoding sessions.
//!
//! A [`Session`] opens a container, from a file path or from any [`ByteSource`], and turns it
//! into a time ordered sequence of decoded units: blocks of interleaved audio samples in 16-bit
//! integer or 32-bit float format, and video pictures in packed BGR24. Every unit is reported
//! with its position, in samples for audio and frames for video.
//!
//! ```no_run
//! use avsession::{Session, TrackMask, TrackType};
//!
//! let mut session = Session::open_from_path(TrackMask::BOTH, "clip.mp4");
//! if let Some(message) = session.error() {
//!     panic!("{message}");
//! }
//!
//! let mut buffer = vec![0u8; session.frame_buffer_size()];
//! while let Some(unit) = session.read(&mut buffer)? {
//!     match unit.track {
//!         TrackType::Audio => println!("{} samples at {}", unit.units, unit.timestamp),
//!         TrackType::Video => println!("picture {}", unit.timestamp),
//!     }
//! }
//! # Ok::<(), avsession::SessionError>(())
//! ```
//!
//! # Seeking
//!
//! [`Session::seek`] takes a position in samples or frames. Containers whose demuxer does not
//! land reliably at or before the requested position can be indexed once with
//! [`Session::build_seek_index`], after which every seek target is corrected through the
//! [`SeekIndex`]. For sample exact random access to audio, wrap the session in a
//! [`SampleStream`], which implements [`std::io::Read`] and [`std::io::Seek`].
//!
//! # Engines
//!
//! Demuxing and decoding are done by a [`MediaEngine`](engine::MediaEngine). The Symphonia
//! engine is used by default; the container and codec support it provides is selected through
//! cargo features (`flac`, `mp3`, `mp4`, `vorbis`, `wav` and the `symphonia-*` features).
//! The `ffmpeg` feature adds an engine built on the system FFmpeg libraries, which decodes
//! video too and converts pictures with libswscale. Engines are picked with
//! [`SessionBuilder::with_engine`].
//!
//! # Logging
//!
//! The crate logs through [`tracing`]: session setup failures as errors, recoverable problems
//! such as skipped packets as warnings, and seek and drain decisions at debug level. No
//! subscriber is installed by the library.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod common;

pub mod conversions;
pub mod engine;
pub mod position;
pub mod sample_stream;
pub mod seek_index;
pub mod session;
pub mod source;
#[cfg(feature = "wav_output")]
pub mod wav_output;

pub use crate::common::{ChannelCount, SampleRate, TrackMask, TrackType};
pub use crate::conversions::{
    determine_target_format, AudioOutputFormat, ConvertError, OutputSampleFormat,
    VideoOutputFormat,
};
pub use crate::engine::EngineError;
pub use crate::sample_stream::{SampleStream, StreamError};
pub use crate::seek_index::{SeekIndex, SeekIndexError};
pub use crate::session::{
    AudioOutput, DecodedUnit, FrameProps, OutputFormat, Session, SessionBuilder, SessionError,
    Settings, TrackPriority, VideoOutput,
};
pub use crate::source::{ByteSource, CallbackSource, ReadOnlySource, ReadSeekSource, SeekWhence};
#[cfg(feature = "wav_output")]
pub use crate::wav_output::{write_wav, write_wav_file, ToWavError};
