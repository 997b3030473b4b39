use std::fmt;
use std::num::{NonZeroU16, NonZeroU32};
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Stream sample rate (samples per second per channel).
pub type SampleRate = NonZeroU32;

/// Number of channels in a stream.
pub type ChannelCount = NonZeroU16;

/// The kind of elementary stream a decoded unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    /// A block of audio samples.
    Audio,
    /// A single video picture.
    Video,
}

impl TrackType {
    /// The mask containing only this track type.
    #[inline]
    pub const fn mask(self) -> TrackMask {
        match self {
            TrackType::Audio => TrackMask::AUDIO,
            TrackType::Video => TrackMask::VIDEO,
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackType::Audio => f.write_str("audio"),
            TrackType::Video => f.write_str("video"),
        }
    }
}

/// A set of track types, used to request which tracks a session decodes and which
/// tracks an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TrackMask(u8);

impl TrackMask {
    pub const NONE: TrackMask = TrackMask(0x00);
    pub const AUDIO: TrackMask = TrackMask(0x01);
    pub const VIDEO: TrackMask = TrackMask(0x02);
    pub const BOTH: TrackMask = TrackMask(0x01 | 0x02);

    /// Returns true if `track` is part of this mask.
    #[inline]
    pub const fn contains(self, track: TrackType) -> bool {
        self.0 & track.mask().0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The raw bit representation (`0x01` audio, `0x02` video).
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Iterates the track types in the mask, audio first.
    pub fn iter(self) -> impl Iterator<Item = TrackType> {
        [TrackType::Audio, TrackType::Video]
            .into_iter()
            .filter(move |track| self.contains(*track))
    }
}

impl From<TrackType> for TrackMask {
    fn from(track: TrackType) -> Self {
        track.mask()
    }
}

impl BitOr for TrackMask {
    type Output = TrackMask;

    fn bitor(self, rhs: TrackMask) -> TrackMask {
        TrackMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for TrackMask {
    fn bitor_assign(&mut self, rhs: TrackMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TrackMask {
    type Output = TrackMask;

    fn bitand(self, rhs: TrackMask) -> TrackMask {
        TrackMask(self.0 & rhs.0)
    }
}

/// Statically asserts that an error type can be boxed into `Box<dyn Error + Send + Sync>`.
macro_rules! assert_error_traits {
    ($to_test:path) => {
        const _: () = {
            const fn assert_error<T: std::error::Error + Send + Sync + 'static>() {}
            assert_error::<$to_test>();
        };
    };
}
pub(crate) use assert_error_traits;
