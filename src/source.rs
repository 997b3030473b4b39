//! Byte sources a session can decode from.
//!
//! A [`ByteSource`] is the raw input of a container: something that can be read sequentially
//! and optionally repositioned. Adapters are provided for `Read + Seek` types, for forward-only
//! `Read` types and for a pair of plain read/seek callbacks.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

/// Target of a [`ByteSource::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Start(u64),
    Current(i64),
    End(i64),
    /// Do not move; report the total size of the source in bytes.
    Size,
}

impl SeekWhence {
    /// Builds a whence from a raw `(offset, whence)` pair: `0` absolute, `1` relative, `2` end
    /// relative and `0x10000` size query. Other bits (such as a force flag) are ignored.
    pub fn from_raw(offset: i64, whence: i32) -> Option<SeekWhence> {
        const SIZE: i32 = 0x10000;
        if whence & SIZE != 0 {
            return Some(SeekWhence::Size);
        }
        match whence & 0xffff {
            0 => u64::try_from(offset).ok().map(SeekWhence::Start),
            1 => Some(SeekWhence::Current(offset)),
            2 => Some(SeekWhence::End(offset)),
            _ => None,
        }
    }

    /// The raw `(offset, whence)` pair understood by [`SeekWhence::from_raw`].
    pub fn to_raw(self) -> (i64, i32) {
        match self {
            SeekWhence::Start(offset) => (i64::try_from(offset).unwrap_or(i64::MAX), 0),
            SeekWhence::Current(offset) => (offset, 1),
            SeekWhence::End(offset) => (offset, 2),
            SeekWhence::Size => (0, 0x10000),
        }
    }
}

/// Raw compressed input.
pub trait ByteSource: Send + Sync {
    /// Reads up to `buf.len()` bytes. `Ok(0)` signals the end of the source.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether [`ByteSource::seek`] is supported.
    fn is_seekable(&self) -> bool {
        false
    }

    /// Moves the read position and returns the new position, or the total size for
    /// [`SeekWhence::Size`].
    fn seek(&mut self, whence: SeekWhence) -> io::Result<u64> {
        let _ = whence;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "byte source is not seekable",
        ))
    }

    /// Total size in bytes, if it can be determined.
    fn byte_len(&mut self) -> Option<u64> {
        if self.is_seekable() {
            self.seek(SeekWhence::Size).ok()
        } else {
            None
        }
    }
}

/// Adapter to use `Read + Seek` types as a [`ByteSource`].
pub struct ReadSeekSource<T: Read + Seek + Send + Sync> {
    inner: T,
    byte_len: Option<u64>,
}

impl<T: Read + Seek + Send + Sync> ReadSeekSource<T> {
    /// Instantiates a new `ReadSeekSource<T>` by taking ownership and wrapping the provided
    /// `Read + Seek`er. The size is measured on first request unless given here.
    #[inline]
    pub fn new(inner: T, byte_len: Option<u64>) -> Self {
        ReadSeekSource { inner, byte_len }
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Seek + Send + Sync> ByteSource for ReadSeekSource<T> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    #[inline]
    fn is_seekable(&self) -> bool {
        true
    }

    fn seek(&mut self, whence: SeekWhence) -> io::Result<u64> {
        match whence {
            SeekWhence::Start(offset) => self.inner.seek(SeekFrom::Start(offset)),
            SeekWhence::Current(offset) => self.inner.seek(SeekFrom::Current(offset)),
            SeekWhence::End(offset) => self.inner.seek(SeekFrom::End(offset)),
            SeekWhence::Size => {
                if let Some(len) = self.byte_len {
                    return Ok(len);
                }
                let current = self.inner.stream_position()?;
                let len = self.inner.seek(SeekFrom::End(0))?;
                self.inner.seek(SeekFrom::Start(current))?;
                self.byte_len = Some(len);
                Ok(len)
            }
        }
    }
}

/// Adapter for forward-only readers such as network streams.
pub struct ReadOnlySource<T: Read + Send + Sync> {
    inner: T,
}

impl<T: Read + Send + Sync> ReadOnlySource<T> {
    #[inline]
    pub fn new(inner: T) -> Self {
        ReadOnlySource { inner }
    }
}

impl<T: Read + Send + Sync> ByteSource for ReadOnlySource<T> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

type ReadCallback = Box<dyn FnMut(&mut [u8]) -> i64 + Send + Sync>;
type SeekCallback = Box<dyn FnMut(i64, i32) -> i64 + Send + Sync>;

/// A byte source made of two plain callbacks.
///
/// The read callback returns the number of bytes read, `0` at the end and a negative value on
/// error. The optional seek callback receives a raw `(offset, whence)` pair (see
/// [`SeekWhence::from_raw`]) and returns the new position, the size for size queries, or a
/// negative value on error. Without a seek callback the source is not seekable.
pub struct CallbackSource {
    read: ReadCallback,
    seek: Option<SeekCallback>,
}

impl CallbackSource {
    pub fn new<R>(read: R) -> Self
    where
        R: FnMut(&mut [u8]) -> i64 + Send + Sync + 'static,
    {
        CallbackSource {
            read: Box::new(read),
            seek: None,
        }
    }

    pub fn with_seek<S>(mut self, seek: S) -> Self
    where
        S: FnMut(i64, i32) -> i64 + Send + Sync + 'static,
    {
        self.seek = Some(Box::new(seek));
        self
    }
}

impl fmt::Debug for CallbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSource")
            .field("seekable", &self.seek.is_some())
            .finish()
    }
}

impl ByteSource for CallbackSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = (self.read)(buf);
        usize::try_from(read)
            .ok()
            .filter(|read| *read <= buf.len())
            .ok_or_else(|| io::Error::other(format!("read callback failed ({read})")))
    }

    fn is_seekable(&self) -> bool {
        self.seek.is_some()
    }

    fn seek(&mut self, whence: SeekWhence) -> io::Result<u64> {
        let Some(seek) = self.seek.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "byte source is not seekable",
            ));
        };
        let (offset, raw_whence) = whence.to_raw();
        let result = seek(offset, raw_whence);
        u64::try_from(result)
            .map_err(|_| io::Error::other(format!("seek callback failed ({result})")))
    }
}

/// Exposes a [`ByteSource`] through `std::io` traits, e.g. for the symphonia engine.
pub struct ByteSourceReader {
    inner: Box<dyn ByteSource>,
    byte_len: Option<u64>,
}

impl ByteSourceReader {
    pub fn new(mut inner: Box<dyn ByteSource>) -> Self {
        let byte_len = inner.byte_len();
        ByteSourceReader { inner, byte_len }
    }

    #[inline]
    pub fn is_seekable(&self) -> bool {
        self.inner.is_seekable()
    }

    #[inline]
    pub fn byte_len(&self) -> Option<u64> {
        self.byte_len
    }
}

impl Read for ByteSourceReader {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for ByteSourceReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let whence = match pos {
            SeekFrom::Start(offset) => SeekWhence::Start(offset),
            SeekFrom::Current(offset) => SeekWhence::Current(offset),
            SeekFrom::End(offset) => SeekWhence::End(offset),
        };
        self.inner.seek(whence)
    }
}
