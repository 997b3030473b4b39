//! Decoding whole audio streams into WAV proxy files.
//!
//! Compressed formats are slow to seek in. A proxy is a plain WAV copy of the decoded audio,
//! in the session's output sample format, that can be read with sample exact seeking at no
//! cost.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hound::{SampleFormat, WavSpec};

use crate::common::assert_error_traits;
use crate::conversions::OutputSampleFormat;
use crate::sample_stream::SampleStream;

/// Suffix appended to a media file name to name its proxy.
pub const PROXY_EXTENSION: &str = ".proxy.wav";

#[derive(Debug, thiserror::Error, Clone)]
pub enum ToWavError {
    #[error("Opening file for writing")]
    OpenFile(#[source] Arc<std::io::Error>),
    #[error("Could not create wav writer")]
    Creating(#[source] Arc<hound::Error>),
    #[error("Failed to read decoded samples")]
    Reading(#[source] Arc<std::io::Error>),
    #[error("Failed to write samples writer")]
    Writing(#[source] Arc<hound::Error>),
    #[error("Failed to update the wav header")]
    Finishing(#[source] Arc<hound::Error>),
    #[error("Failed to flush all bytes to writer")]
    Flushing(#[source] Arc<std::io::Error>),
    #[error("Failed to move the finished proxy into place")]
    Renaming(#[source] Arc<std::io::Error>),
}
assert_error_traits!(ToWavError);

/// Proxy file location for `media`: next to it, or in `directory` when given.
pub fn proxy_path(media: impl AsRef<Path>, directory: Option<&Path>) -> PathBuf {
    let media = media.as_ref();
    let mut name = media.file_name().unwrap_or(media.as_os_str()).to_owned();
    name.push(PROXY_EXTENSION);
    match directory.or_else(|| media.parent()) {
        Some(directory) => directory.join(name),
        None => PathBuf::from(name),
    }
}

/// Decodes `stream` from its current position into a WAV file at `path`.
///
/// An existing file at `path` is taken as a finished proxy and left alone. The data is written
/// to a `.part` file first, which is renamed once complete, so an interrupted run never leaves
/// a truncated proxy behind.
pub fn write_wav_file(
    stream: &mut SampleStream,
    path: impl AsRef<Path>,
) -> Result<(), ToWavError> {
    let path = path.as_ref();
    if path.exists() {
        tracing::debug!("proxy {} already exists", path.display());
        return Ok(());
    }

    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    let part = PathBuf::from(part);
    {
        let mut file = fs::File::create(&part)
            .map_err(Arc::new)
            .map_err(ToWavError::OpenFile)?;
        write_wav(stream, &mut file)?;
    }
    fs::rename(&part, path)
        .map_err(Arc::new)
        .map_err(ToWavError::Renaming)
}

/// Decodes `stream` from its current position into `writer` as WAV. Samples are written as
/// 16-bit integers or 32-bit floats, matching the stream's format.
///
/// # Example
/// ```no_run
/// use avsession::{wav_output::write_wav, SampleStream, Session, TrackMask};
///
/// let session = Session::open_from_path(TrackMask::AUDIO, "lecture.m4a");
/// let mut stream = SampleStream::new(session)?;
/// let mut writer = std::io::Cursor::new(Vec::new());
/// write_wav(&mut stream, &mut writer)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn write_wav(
    stream: &mut SampleStream,
    writer: &mut (impl io::Write + io::Seek),
) -> Result<(), ToWavError> {
    let format = *stream.format();
    let spec = WavSpec {
        channels: format.channels.get(),
        sample_rate: format.sample_rate.get(),
        bits_per_sample: format.sample_format.bits_per_sample() as u16,
        sample_format: match format.sample_format {
            OutputSampleFormat::I16 => SampleFormat::Int,
            OutputSampleFormat::F32 => SampleFormat::Float,
        },
    };
    let bytes_per_sample = format.sample_format.bytes_per_sample();

    let mut writer = io::BufWriter::new(writer);
    {
        let mut wav = hound::WavWriter::new(&mut writer, spec)
            .map_err(Arc::new)
            .map_err(ToWavError::Creating)?;
        let mut buffer = vec![0u8; format.block_align() * 4096];
        let mut carry = 0;
        loop {
            let read = stream
                .read(&mut buffer[carry..])
                .map_err(Arc::new)
                .map_err(ToWavError::Reading)?;
            if read == 0 {
                break;
            }
            let filled = carry + read;
            let whole = filled - filled % bytes_per_sample;
            for sample in buffer[..whole].chunks_exact(bytes_per_sample) {
                let written = match format.sample_format {
                    OutputSampleFormat::I16 => {
                        wav.write_sample(i16::from_ne_bytes([sample[0], sample[1]]))
                    }
                    OutputSampleFormat::F32 => wav.write_sample(f32::from_ne_bytes([
                        sample[0], sample[1], sample[2], sample[3],
                    ])),
                };
                written.map_err(Arc::new).map_err(ToWavError::Writing)?;
            }
            buffer.copy_within(whole..filled, 0);
            carry = filled - whole;
        }
        wav.finalize()
            .map_err(Arc::new)
            .map_err(ToWavError::Finishing)?;
    }
    writer
        .flush()
        .map_err(Arc::new)
        .map_err(ToWavError::Flushing)?;
    Ok(())
}
