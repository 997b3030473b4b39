//! Conversion between native stream timestamps and sample/frame positions.
//!
//! Decoders report a presentation timestamp in the stream's time base for most, but not all,
//! decoded units: when a single compressed packet yields several units only the first one
//! carries a timestamp. [`PositionTracker`] turns this into a monotonically advancing position
//! counter (samples for audio, frames for video) and derives the start timestamp of every unit.

use num_rational::{Ratio, Rational64};

/// Maps native timestamps of one stream to positions in units of that stream's output rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeScale {
    time_base: Rational64,
    rate: Rational64,
}

impl TimeScale {
    /// `time_base` is the duration of one native tick in seconds, `rate` the number of
    /// positions per second (the sample rate for audio, the frame rate for video).
    pub fn new(time_base: Rational64, rate: Rational64) -> Self {
        TimeScale { time_base, rate }
    }

    #[inline]
    pub fn time_base(&self) -> Rational64 {
        self.time_base
    }

    #[inline]
    pub fn rate(&self) -> Rational64 {
        self.rate
    }

    /// Converts a native timestamp to a position, rounding half away from zero.
    pub fn to_position(&self, timestamp: i64) -> i64 {
        let factor = widen(self.time_base) * widen(self.rate);
        saturate((Ratio::from_integer(i128::from(timestamp)) * factor).round())
    }

    /// Converts a position to a native timestamp, rounding half away from zero.
    ///
    /// A degenerate scale (zero time base or rate) maps every position to zero.
    pub fn to_timestamp(&self, position: i64) -> i64 {
        let factor = widen(self.time_base) * widen(self.rate);
        if *factor.numer() == 0 {
            return 0;
        }
        saturate((Ratio::from_integer(i128::from(position)) / factor).round())
    }

    /// Converts a position of this scale to the position at the same instant in `other`.
    pub fn position_in(&self, position: i64, other: &TimeScale) -> i64 {
        let rate = widen(self.rate);
        if *rate.numer() == 0 {
            return 0;
        }
        saturate((Ratio::from_integer(i128::from(position)) * widen(other.rate) / rate).round())
    }
}

fn widen(ratio: Rational64) -> Ratio<i128> {
    Ratio::new(i128::from(*ratio.numer()), i128::from(*ratio.denom()))
}

fn saturate(value: Ratio<i128>) -> i64 {
    let value = value.to_integer();
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

/// Running position of one track.
///
/// The position marks the *end* of the most recently delivered unit, the reported timestamp of
/// a unit is its start.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    scale: TimeScale,
    position: i64,
}

impl PositionTracker {
    pub fn new(scale: TimeScale) -> Self {
        PositionTracker { scale, position: 0 }
    }

    #[inline]
    pub fn scale(&self) -> &TimeScale {
        &self.scale
    }

    /// The end position of the last delivered unit.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Moves the counter, e.g. to the target of a seek.
    #[inline]
    pub fn reset(&mut self, position: i64) {
        self.position = position;
    }

    /// Accounts for a delivered unit of `units` samples or frames and returns its start
    /// position.
    ///
    /// A unit with a timestamp re-anchors the counter; a unit without one continues from where
    /// the previous unit ended. A unit without content does not move the counter and reports
    /// the end of the previous unit.
    pub fn advance(&mut self, timestamp: Option<i64>, units: u64) -> i64 {
        let units = i64::try_from(units).unwrap_or(i64::MAX);

        if let Some(timestamp) = timestamp {
            self.position = self.scale.to_position(timestamp).saturating_add(units);
        } else if units > 0 {
            self.position = self.position.saturating_add(units);
        }

        if units > 0 {
            self.position - units
        } else {
            self.position
        }
    }
}
