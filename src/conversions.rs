//! Normalization of decoded units into the session's output formats.
//!
//! Audio is converted to interleaved 16-bit integer or 32-bit float samples in native byte
//! order, video to packed BGR24. Both write straight into the caller's buffer.

use num_rational::Rational64;

use crate::common::{assert_error_traits, ChannelCount, SampleRate};
use crate::engine::{AudioFrame, AudioParams, PixelFormat, VideoFrame, VideoParams};

pub mod pixel;
pub mod sample;

pub use pixel::{Bgr24Scaler, Scaler};
pub use sample::{Resampler, SampleConverter};

/// Errors of the format normalizer.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    /// The output buffer cannot hold the converted unit.
    #[error("output buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
    /// The scaler cannot read this pixel format.
    #[error("unsupported pixel format {0:?}")]
    UnsupportedPixelFormat(PixelFormat),
    /// The stream parameters cannot be normalized.
    #[error("invalid stream parameters: {0}")]
    InvalidParameters(String),
    /// A decoded unit does not match the negotiated format.
    #[error("decoded unit does not match the output format: {0}")]
    FormatMismatch(String),
    /// The pixel converter failed.
    #[error("pixel conversion failed: {0}")]
    Scaling(String),
}
assert_error_traits!(ConvertError);

/// Sample format of normalized audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSampleFormat {
    /// Signed 16-bit integers.
    I16,
    /// 32-bit floats in `-1.0..=1.0`.
    F32,
}

impl OutputSampleFormat {
    #[inline]
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            OutputSampleFormat::I16 => 2,
            OutputSampleFormat::F32 => 4,
        }
    }

    #[inline]
    pub const fn bits_per_sample(self) -> u32 {
        self.bytes_per_sample() as u32 * 8
    }
}

/// Chooses the output sample format for an audio stream.
///
/// The significant bit depth coded in the stream decides when known, the storage bit depth of
/// the decoder's samples otherwise: exactly 16 bits map to [`OutputSampleFormat::I16`], more
/// than 16 bits to [`OutputSampleFormat::F32`]. Anything else is not supported and falls back
/// to `F32`.
pub fn determine_target_format(params: &AudioParams) -> OutputSampleFormat {
    let storage_bits = params.sample_format.bits_per_sample();
    match params.bits_per_raw_sample.filter(|bits| *bits > 0) {
        Some(16) => OutputSampleFormat::I16,
        Some(bits) if bits > 16 => OutputSampleFormat::F32,
        _ if storage_bits == 16 => OutputSampleFormat::I16,
        _ if storage_bits > 16 => OutputSampleFormat::F32,
        raw => {
            tracing::warn!(
                "unsupported sample format (raw bits {:?}, storage bits {}), using f32",
                raw, storage_bits
            );
            OutputSampleFormat::F32
        }
    }
}

/// Format of the audio a session delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioOutputFormat {
    pub sample_rate: SampleRate,
    pub channels: ChannelCount,
    pub sample_format: OutputSampleFormat,
}

impl AudioOutputFormat {
    /// Bytes of one sample of all channels.
    #[inline]
    pub fn block_align(&self) -> usize {
        self.channels.get() as usize * self.sample_format.bytes_per_sample()
    }
}

/// Format of the video a session delivers. Pictures are always packed BGR24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoOutputFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational64,
    pub aspect_ratio: Rational64,
}

impl VideoOutputFormat {
    #[inline]
    pub const fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Bgr24
    }
}

/// Converts decoded audio frames into the negotiated output format.
pub struct AudioNormalizer {
    format: AudioOutputFormat,
    resampler: Box<dyn Resampler>,
}

impl AudioNormalizer {
    /// Negotiates the output format for `params` and uses the [`SampleConverter`].
    pub fn new(params: &AudioParams) -> Result<Self, ConvertError> {
        let sample_rate = SampleRate::new(params.sample_rate)
            .ok_or_else(|| ConvertError::InvalidParameters("sample rate is zero".to_owned()))?;
        let channels = ChannelCount::new(params.channels)
            .ok_or_else(|| ConvertError::InvalidParameters("channel count is zero".to_owned()))?;
        let format = AudioOutputFormat {
            sample_rate,
            channels,
            sample_format: determine_target_format(params),
        };
        Ok(Self::with_resampler(format, Box::new(SampleConverter)))
    }

    pub fn with_resampler(format: AudioOutputFormat, resampler: Box<dyn Resampler>) -> Self {
        AudioNormalizer { format, resampler }
    }

    #[inline]
    pub fn format(&self) -> &AudioOutputFormat {
        &self.format
    }

    /// Size of `frame` once converted.
    pub fn bytes_needed(&self, frame: &AudioFrame) -> usize {
        frame.frames() * self.format.block_align()
    }

    /// Converts `frame` into `out` and returns the number of bytes written.
    pub fn convert(&mut self, frame: &AudioFrame, out: &mut [u8]) -> Result<usize, ConvertError> {
        if frame.channels != self.format.channels.get() {
            return Err(ConvertError::FormatMismatch(format!(
                "{} channels instead of {}",
                frame.channels, self.format.channels
            )));
        }
        let needed = self.bytes_needed(frame);
        if out.len() < needed {
            return Err(ConvertError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }
        let samples = frame.frames() * frame.channels as usize;
        self.resampler
            .convert(&frame.samples, samples, self.format.sample_format, &mut out[..needed])?;
        Ok(needed)
    }
}

/// Largest row alignment of decoded planes, in bytes.
pub const ROW_ALIGNMENT: usize = 64;

/// Converts decoded pictures into packed BGR24.
pub struct VideoNormalizer {
    format: VideoOutputFormat,
    scaler: Box<dyn Scaler>,
}

impl VideoNormalizer {
    pub fn new(params: &VideoParams) -> Result<Self, ConvertError> {
        Self::with_scaler(params, Box::new(Bgr24Scaler))
    }

    /// Fails when `scaler` cannot read the stream's pixel format.
    pub fn with_scaler(params: &VideoParams, scaler: Box<dyn Scaler>) -> Result<Self, ConvertError> {
        if params.width == 0 || params.height == 0 {
            return Err(ConvertError::InvalidParameters(format!(
                "picture size {}x{}",
                params.width, params.height
            )));
        }
        if !scaler.supports(params.pixel_format) {
            return Err(ConvertError::UnsupportedPixelFormat(params.pixel_format));
        }
        Ok(VideoNormalizer {
            format: VideoOutputFormat {
                width: params.width,
                height: params.height,
                frame_rate: params.frame_rate,
                aspect_ratio: params.sample_aspect_ratio,
            },
            scaler,
        })
    }

    #[inline]
    pub fn format(&self) -> &VideoOutputFormat {
        &self.format
    }

    /// Recommended size of a buffer receiving one picture. Covers source rows padded to
    /// [`ROW_ALIGNMENT`] bytes, as decoders lay them out.
    pub fn frame_size(&self) -> usize {
        let width = self.format.width as usize;
        let padded = width.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT;
        (padded * 3).max(width * 4) * self.format.height as usize
    }

    /// Bytes per output row: three bytes for every pixel of a padded source row.
    pub fn stride(&self, frame: &VideoFrame) -> usize {
        let row_pixels = frame
            .planes
            .first()
            .map_or(frame.width as usize, |plane| {
                plane.stride / pixel::bytes_per_pixel(frame.pixel_format)
            })
            .max(frame.width as usize);
        row_pixels * 3
    }

    pub fn bytes_needed(&self, frame: &VideoFrame) -> usize {
        self.stride(frame) * frame.height as usize
    }

    /// Converts `frame` into `out` and returns the number of bytes written.
    pub fn convert(&mut self, frame: &VideoFrame, out: &mut [u8]) -> Result<usize, ConvertError> {
        if frame.width != self.format.width || frame.height != self.format.height {
            return Err(ConvertError::FormatMismatch(format!(
                "picture size {}x{} instead of {}x{}",
                frame.width, frame.height, self.format.width, self.format.height
            )));
        }
        let needed = self.bytes_needed(frame);
        if out.len() < needed {
            return Err(ConvertError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }
        let stride = self.stride(frame);
        self.scaler.scale(frame, &mut out[..needed], stride)?;
        Ok(needed)
    }
}
