//! Builder pattern for configuring and opening sessions.
//!
//! # Examples
//!
//! ```no_run
//! use avsession::{Session, TrackMask, TrackPriority};
//!
//! let session = Session::builder()
//!     .with_path("movie.mkv")
//!     .with_mode(TrackMask::BOTH)
//!     .with_priority(TrackPriority::VideoFirst)
//!     .with_coarse_seek(true)
//!     .build();
//!
//! if let Some(message) = session.error() {
//!     eprintln!("cannot decode: {message}");
//! }
//! ```
//!
//! # Settings
//!
//! - `mode` - Which tracks to decode
//! - `hint` - Format hint like "mp3", "wav", etc
//! - `mime_type` - MIME type hint for container formats
//! - `gapless` - Enable gapless playback
//! - `coarse_seek` - Use faster but less precise seeking
//! - `priority` - Which track wins when both have a unit ready
//! - `max_decode_errors` - Malformed packets skipped in a row before a read fails

use std::fmt;
use std::path::PathBuf;

use super::Session;
use crate::common::{TrackMask, TrackType};
use crate::engine::{Input, MediaEngine};
use crate::source::ByteSource;

/// Default number of consecutive malformed packets skipped before a read fails.
pub const MAX_DECODE_ERRORS: usize = 3;

/// Which track is served first when both have a decoded unit ready in the same read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackPriority {
    #[default]
    AudioFirst,
    VideoFirst,
}

impl TrackPriority {
    /// Both track types, in polling order.
    #[inline]
    pub const fn order(self) -> [TrackType; 2] {
        match self {
            TrackPriority::AudioFirst => [TrackType::Audio, TrackType::Video],
            TrackPriority::VideoFirst => [TrackType::Video, TrackType::Audio],
        }
    }
}

/// Session configuration settings.
/// Support for the format related settings depends on the engine; they are used by the
/// Symphonia engine.
#[derive(Clone, Debug)]
pub struct Settings {
    /// The tracks to decode.
    pub(crate) mode: TrackMask,

    /// Whether to use coarse seeking, or sample-accurate seeking instead.
    pub(crate) coarse_seek: bool,

    /// Whether to trim frames for gapless playback.
    pub(crate) gapless: bool,

    /// An extension hint for the demuxer about the format of the stream.
    pub(crate) hint: Option<String>,

    /// An MIME type hint for the demuxer about the format of the stream.
    pub(crate) mime_type: Option<String>,

    pub(crate) priority: TrackPriority,

    pub(crate) max_decode_errors: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: TrackMask::NONE,
            coarse_seek: false,
            gapless: true,
            hint: None,
            mime_type: None,
            priority: TrackPriority::default(),
            max_decode_errors: MAX_DECODE_ERRORS,
        }
    }
}

impl Settings {
    #[inline]
    pub fn mode(&self) -> TrackMask {
        self.mode
    }

    #[inline]
    pub fn coarse_seek(&self) -> bool {
        self.coarse_seek
    }

    #[inline]
    pub fn gapless(&self) -> bool {
        self.gapless
    }

    #[inline]
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    #[inline]
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    #[inline]
    pub fn priority(&self) -> TrackPriority {
        self.priority
    }

    #[inline]
    pub fn max_decode_errors(&self) -> usize {
        self.max_decode_errors
    }
}

/// Builder for configuring and opening a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    input: Option<Input>,
    engine: Option<Box<dyn MediaEngine>>,
    settings: Settings,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("input", &self.input)
            .field("custom_engine", &self.engine.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl SessionBuilder {
    /// Creates a new session builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tracks to decode.
    pub fn with_mode(mut self, mode: impl Into<TrackMask>) -> Self {
        self.settings.mode = mode.into();
        self
    }

    /// Decodes the file at `path`. Its extension serves as format hint unless
    /// [`with_hint`](Self::with_hint) is used.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.input = Some(Input::Path(path.into()));
        self
    }

    /// Decodes a caller-provided byte source.
    ///
    /// `name` is a file name or extension helping format detection, e.g. for MPEG-TS
    /// streams that have no global header.
    pub fn with_source(mut self, source: impl ByteSource + 'static, name: Option<&str>) -> Self {
        self.input = Some(Input::Source {
            source: Box::new(source),
            hint: name.map(str::to_owned),
        });
        self
    }

    /// Sets a format hint for the demuxer.
    ///
    /// Common values are "mp3", "wav", "flac", "ogg", etc.
    pub fn with_hint(mut self, hint: &str) -> Self {
        self.settings.hint = Some(hint.to_string());
        self
    }

    /// Sets a mime type hint for the demuxer.
    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.settings.mime_type = Some(mime_type.to_string());
        self
    }

    /// Enables or disables gapless playback. This is enabled by default.
    pub fn with_gapless(mut self, gapless: bool) -> Self {
        self.settings.gapless = gapless;
        self
    }

    /// Enables or disables coarse seeking. This is disabled by default.
    ///
    /// Coarse seeking is faster but may land further from the requested position. A seek index
    /// corrects targets either way.
    pub fn with_coarse_seek(mut self, coarse_seek: bool) -> Self {
        self.settings.coarse_seek = coarse_seek;
        self
    }

    /// Sets which track is served first when both have a unit ready.
    /// Audio goes first by default.
    pub fn with_priority(mut self, priority: TrackPriority) -> Self {
        self.settings.priority = priority;
        self
    }

    /// Sets how many malformed packets in a row are skipped before a read fails.
    pub fn with_max_decode_errors(mut self, max_decode_errors: usize) -> Self {
        self.settings.max_decode_errors = max_decode_errors;
        self
    }

    /// Uses `engine` to demux and decode instead of the built-in Symphonia engine.
    pub fn with_engine(mut self, engine: impl MediaEngine + 'static) -> Self {
        self.engine = Some(Box::new(engine));
        self
    }

    /// Opens the session.
    ///
    /// This never fails: when the input cannot be opened or a requested track cannot be set up,
    /// the returned session is in the error state and reports why through
    /// [`Session::error`].
    pub fn build(self) -> Session {
        Session::open(self.input, self.engine, self.settings)
    }
}
