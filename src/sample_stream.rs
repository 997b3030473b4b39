//! Sample exact reading of a session's audio track through `std::io`.
//!
//! Demuxers seek to packet boundaries, and some containers miss the requested packet
//! entirely. [`SampleStream`] hides this: it exposes the decoded audio as a flat sequence of
//! interleaved PCM bytes in the session's output format, starting at zero, and seeking reads
//! forward from wherever the demuxer landed until the requested sample.
//!
//! ```no_run
//! use std::io::{Read, Seek, SeekFrom};
//! use avsession::{SampleStream, Session, TrackMask};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::open_from_path(TrackMask::AUDIO, "speech.mp3");
//! let mut stream = SampleStream::new(session)?;
//! let block = stream.format().block_align() as u64;
//!
//! stream.seek(SeekFrom::Start(44_100 * block))?;
//! let mut second = vec![0u8; 44_100 * block as usize];
//! stream.read_exact(&mut second)?;
//! # Ok(())
//! # }
//! ```

use std::io::{self, Read, Seek, SeekFrom};

use crate::common::{assert_error_traits, TrackMask, TrackType};
use crate::conversions::AudioOutputFormat;
use crate::session::{Session, SessionError};

/// Errors of [`SampleStream`].
#[derive(Debug, thiserror::Error, Clone)]
pub enum StreamError {
    /// The stream cannot be positioned reliably.
    #[error("stream is not seekable: {0}")]
    NotSeekable(&'static str),
    /// Reading did not advance the position.
    #[error("read head is stuck at {0}")]
    ReadHeadStuck(i64),
    /// The first unit after a seek starts after the target.
    #[error("read position {position} is beyond the seek target {target}")]
    SeekTargetMissed { target: i64, position: i64 },
    /// Seeking ended at another position than requested, even with a seek index.
    #[error("seeking did not work correctly: expected {expected}, result {actual}")]
    SeekMismatch { expected: u64, actual: u64 },
    /// Byte positions must fall on sample boundaries.
    #[error("position {position} is not a multiple of the block size {block_align}")]
    Unaligned { position: u64, block_align: usize },
    #[error("session error")]
    Session(#[source] SessionError),
}
assert_error_traits!(StreamError);

impl From<SessionError> for StreamError {
    fn from(err: SessionError) -> Self {
        StreamError::Session(err)
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Unaligned { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            err => io::Error::other(err),
        }
    }
}

/// Interleaved PCM bytes of a session's audio track.
pub struct SampleStream {
    session: Session,
    format: AudioOutputFormat,
    /// Stream length in samples per channel.
    length: i64,
    /// Samples per channel of a typical unit.
    frame_size: i64,
    /// Position of the first sample of the stream.
    first_position: i64,
    /// Position of the first sample in `buffer`.
    buffer_start: i64,
    buffer: Vec<u8>,
    /// Valid bytes in `buffer`.
    buffered: usize,
    /// Read offset in `buffer`.
    offset: usize,
    /// Reads return no data until the next successful seek.
    at_end: bool,
    seek_index_created: bool,
}

impl SampleStream {
    /// Wraps a session that decodes audio.
    ///
    /// Fails with [`StreamError::NotSeekable`] when the stream length is unknown or the stream
    /// cannot be read from its start.
    pub fn new(session: Session) -> Result<Self, StreamError> {
        if let Some(message) = session.error() {
            return Err(StreamError::Session(SessionError::Failed(message.to_owned())));
        }
        let output = *session
            .audio_output()
            .ok_or(SessionError::TrackNotOpen(TrackType::Audio))?;
        let length = output
            .length
            .ok_or(StreamError::NotSeekable("stream length is unknown"))?;

        let mut stream = SampleStream {
            buffer: vec![0; session.frame_buffer_size()],
            session,
            format: output.format,
            length,
            frame_size: output.frame_size as i64,
            first_position: 0,
            buffer_start: 0,
            buffered: 0,
            offset: 0,
            at_end: false,
            seek_index_created: false,
        };
        stream.determine_first_position()?;
        Ok(stream)
    }

    /// Streams that do not start at zero, e.g. MPEG-TS, are shifted to start at zero.
    fn determine_first_position(&mut self) -> Result<(), StreamError> {
        self.session.seek(0, TrackType::Audio)?;
        match self.read_unit() {
            Ok(Some(start)) => {
                self.first_position = start;
                tracing::debug!("first audio position is {start}");
                Ok(())
            }
            Ok(None) | Err(_) => Err(StreamError::NotSeekable(
                "determining the first timestamp failed",
            )),
        }
    }

    #[inline]
    pub fn format(&self) -> &AudioOutputFormat {
        &self.format
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.length.max(0) as u64 * self.block_align() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current position in bytes.
    pub fn position(&self) -> u64 {
        let samples = (self.buffer_start - self.first_position).max(0) as u64;
        samples * self.block_align() as u64 + self.offset as u64
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    #[inline]
    fn block_align(&self) -> usize {
        self.format.block_align()
    }

    /// Decodes the next audio unit into the buffer and returns its start position, or `None`
    /// at the end of the stream.
    fn read_unit(&mut self) -> Result<Option<i64>, StreamError> {
        loop {
            match self.session.read(&mut self.buffer) {
                Ok(Some(unit)) if unit.track == TrackType::Audio => {
                    self.buffer_start = unit.timestamp;
                    self.buffered = unit.len;
                    self.offset = 0;
                    return Ok(Some(unit.timestamp));
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.buffer_start += (self.buffered / self.block_align()) as i64;
                    self.buffered = 0;
                    self.offset = 0;
                    return Ok(None);
                }
                Err(SessionError::BufferTooSmall { needed, .. }) => {
                    self.buffer.resize(needed, 0);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads units until the buffer holds the sample at `target`. Returns false at the end of
    /// the stream.
    fn forward_read_until(&mut self, target: i64) -> Result<bool, StreamError> {
        let mut previous = None;
        loop {
            let Some(start) = self.read_unit()? else {
                return Ok(false);
            };
            let units = (self.buffered / self.block_align()) as i64;
            if previous == Some(start) {
                return Err(StreamError::ReadHeadStuck(start));
            } else if target < start {
                return Err(StreamError::SeekTargetMissed {
                    target,
                    position: start,
                });
            } else if target < start + units {
                return Ok(true);
            }
            previous = Some(start);
        }
    }

    fn seek_to(&mut self, target: i64) -> Result<bool, StreamError> {
        self.session.seek(target, TrackType::Audio)?;
        match self.forward_read_until(target) {
            Err(StreamError::SeekTargetMissed { .. }) => {
                // Demuxers sometimes land one packet late; retry from a frame earlier.
                tracing::debug!("seek target {target} missed, retrying from an earlier position");
                self.session
                    .seek(target - self.frame_size, TrackType::Audio)?;
                self.forward_read_until(target)
            }
            result => result,
        }
    }

    /// Moves to a byte position, which must be a multiple of the block size. Positions beyond
    /// the end are allowed; reads then return no data. After a failed seek reads return no
    /// data either, until the stream is positioned again.
    pub fn set_position(&mut self, position: u64) -> Result<(), StreamError> {
        let block_align = self.block_align();
        if position % block_align as u64 != 0 {
            return Err(StreamError::Unaligned {
                position,
                block_align,
            });
        }
        if !self.at_end && position == self.position() {
            return Ok(());
        }

        let samples = i64::try_from(position / block_align as u64).unwrap_or(i64::MAX);
        let target = samples.saturating_add(self.first_position);

        self.buffered = 0;
        self.offset = 0;
        self.at_end = true;
        if samples >= self.length {
            self.buffer_start = target;
            return Ok(());
        }
        if !self.seek_to(target)? {
            self.buffer_start = target;
            return Ok(());
        }

        if target < self.buffer_start {
            return Err(StreamError::SeekMismatch {
                expected: position,
                actual: self.position(),
            });
        }
        self.offset = (target - self.buffer_start) as usize * block_align;

        let actual = self.position();
        if actual != position {
            if self.seek_index_created {
                return Err(StreamError::SeekMismatch {
                    expected: position,
                    actual,
                });
            }
            self.session.build_seek_index(TrackMask::AUDIO)?;
            self.seek_index_created = true;
            tracing::debug!("seek index created after seeking to {actual} instead of {position}");
            return self.set_position(position);
        }
        self.at_end = false;
        Ok(())
    }
}

impl Read for SampleStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.at_end {
            return Ok(0);
        }
        while self.offset == self.buffered {
            if self.read_unit()?.is_none() {
                return Ok(0);
            }
        }
        let count = buf.len().min(self.buffered - self.offset);
        buf[..count].copy_from_slice(&self.buffer[self.offset..self.offset + count]);
        self.offset += count;
        Ok(count)
    }
}

impl Seek for SampleStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.position().checked_add_signed(offset),
            SeekFrom::End(offset) => self.len().checked_add_signed(offset),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        self.set_position(target)?;
        Ok(self.position())
    }
}
