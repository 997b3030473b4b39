use dasp_sample::ToSample;

use super::{ConvertError, OutputSampleFormat};
use crate::engine::AudioSamples;

/// Converts interleaved decoded samples to an output sample format.
pub trait Resampler: Send {
    /// Writes the first `samples` samples of `input` to `out` as `target` in native byte order.
    /// `out` holds exactly `samples` output samples.
    fn convert(
        &mut self,
        input: &AudioSamples,
        samples: usize,
        target: OutputSampleFormat,
        out: &mut [u8],
    ) -> Result<(), ConvertError>;
}

/// Sample type conversion without rate or channel changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleConverter;

impl Resampler for SampleConverter {
    fn convert(
        &mut self,
        input: &AudioSamples,
        samples: usize,
        target: OutputSampleFormat,
        out: &mut [u8],
    ) -> Result<(), ConvertError> {
        if input.len() < samples || out.len() != samples * target.bytes_per_sample() {
            return Err(ConvertError::FormatMismatch(format!(
                "{} samples requested from {} into {} bytes",
                samples,
                input.len(),
                out.len()
            )));
        }
        match target {
            OutputSampleFormat::I16 => write_as::<i16>(input, samples, out),
            OutputSampleFormat::F32 => write_as::<f32>(input, samples, out),
        }
        Ok(())
    }
}

fn write_as<O>(input: &AudioSamples, samples: usize, out: &mut [u8])
where
    O: NativeBytes,
    u8: ToSample<O>,
    i16: ToSample<O>,
    i32: ToSample<O>,
    f32: ToSample<O>,
    f64: ToSample<O>,
{
    match input {
        AudioSamples::U8(s) => convert_slice(&s[..samples], out),
        AudioSamples::I16(s) => convert_slice(&s[..samples], out),
        AudioSamples::I32(s) => convert_slice(&s[..samples], out),
        AudioSamples::F32(s) => convert_slice(&s[..samples], out),
        AudioSamples::F64(s) => convert_slice(&s[..samples], out),
    }
}

#[inline]
fn convert_slice<I, O>(input: &[I], out: &mut [u8])
where
    I: ToSample<O> + Copy,
    O: NativeBytes,
{
    for (sample, chunk) in input.iter().zip(out.chunks_exact_mut(O::SIZE)) {
        ToSample::<O>::to_sample_(*sample).write_ne(chunk);
    }
}

/// Output sample types, written in native byte order.
trait NativeBytes: Copy {
    const SIZE: usize;

    fn write_ne(self, out: &mut [u8]);
}

impl NativeBytes for i16 {
    const SIZE: usize = 2;

    #[inline]
    fn write_ne(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_ne_bytes());
    }
}

impl NativeBytes for f32 {
    const SIZE: usize = 4;

    #[inline]
    fn write_ne(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_ne_bytes());
    }
}
