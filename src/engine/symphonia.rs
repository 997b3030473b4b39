//! Demux/decode engine backed by Symphonia, supporting AAC, FLAC, MP3, Vorbis, WAV and more.
//!
//! Symphonia only decodes audio; every track with a known codec is exposed as an audio stream.
//! Its decoders produce exactly one buffer per packet and hold no delayed output, so draining
//! ends immediately.

use std::fs::File;
use std::path::Path;

use num_rational::Rational64;
use symphonia::core::{
    audio::{AudioBufferRef, SampleBuffer},
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::{Error, SeekErrorKind},
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track},
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
    sample::SampleFormat as SymphoniaSampleFormat,
};

use super::{
    AudioFrame, AudioParams, AudioSamples, Decoder, Demuxer, EngineError, Frame, Input,
    MediaEngine, MediaType, Packet, Receive, SampleFormat, SendStatus, StreamInfo,
};
use crate::session::Settings;
use crate::source::ByteSourceReader;

impl MediaSource for ByteSourceReader {
    fn is_seekable(&self) -> bool {
        ByteSourceReader::is_seekable(self)
    }

    fn byte_len(&self) -> Option<u64> {
        ByteSourceReader::byte_len(self)
    }
}

/// Engine using Symphonia's default format and codec registries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaEngine;

impl MediaEngine for SymphoniaEngine {
    fn open(&self, input: Input, settings: &Settings) -> Result<Box<dyn Demuxer>, EngineError> {
        let mut hint = Hint::new();
        let (source, extension): (Box<dyn MediaSource>, Option<String>) = match input {
            Input::Path(path) => {
                let extension = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(str::to_owned);
                (Box::new(File::open(&path)?), extension)
            }
            Input::Source { source, hint } => {
                let extension = hint.as_deref().map(extension_of);
                (Box::new(ByteSourceReader::new(source)), extension)
            }
        };
        if let Some(ext) = settings.hint.as_deref().or(extension.as_deref()) {
            hint.with_extension(ext);
        }
        if let Some(typ) = settings.mime_type.as_deref() {
            hint.mime_type(typ);
        }

        let format_opts = FormatOptions {
            enable_gapless: settings.gapless,
            ..Default::default()
        };
        let metadata_opts: MetadataOptions = Default::default();
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(map_error)?;

        let format = probed.format;
        let streams = format
            .tracks()
            .iter()
            .enumerate()
            .map(|(index, track)| stream_info(index, track))
            .collect();

        Ok(Box::new(SymphoniaDemuxer {
            format,
            streams,
            seek_mode: if settings.coarse_seek {
                SeekMode::Coarse
            } else {
                SeekMode::Accurate
            },
            exhausted: false,
        }))
    }
}

/// Accepts `"song.mp3"` as well as `"mp3"`.
fn extension_of(hint: &str) -> String {
    Path::new(hint)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or(hint)
        .to_owned()
}

fn stream_info(index: usize, track: &Track) -> StreamInfo {
    let params = &track.codec_params;
    let codec = symphonia::default::get_codecs()
        .get_codec(params.codec)
        .map(|descriptor| descriptor.short_name.to_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    let audio = match (params.sample_rate, params.channels) {
        (Some(sample_rate), Some(channels)) if params.codec != CODEC_TYPE_NULL => {
            Some(AudioParams {
                sample_rate,
                channels: u16::try_from(channels.count()).unwrap_or(u16::MAX),
                sample_format: storage_format(params.sample_format, params.bits_per_sample),
                bits_per_raw_sample: params.bits_per_sample,
            })
        }
        _ => None,
    };

    let time_base = match (params.time_base, params.sample_rate) {
        (Some(base), _) => Rational64::new(i64::from(base.numer), i64::from(base.denom)),
        (None, Some(rate)) => Rational64::new(1, i64::from(rate)),
        (None, None) => Rational64::new(1, 1),
    };

    StreamInfo {
        index,
        media_type: if audio.is_some() {
            MediaType::Audio
        } else {
            MediaType::Other
        },
        codec,
        time_base,
        duration: params.n_frames.and_then(|n| i64::try_from(n).ok()),
        audio,
        video: None,
    }
}

/// Format the decoder hands out for a track, matching [`samples_of`].
fn storage_format(format: Option<SymphoniaSampleFormat>, bits: Option<u32>) -> SampleFormat {
    use SymphoniaSampleFormat as S;
    match format {
        Some(S::U8 | S::S8 | S::U16 | S::S16) => SampleFormat::I16,
        Some(S::U24 | S::S24 | S::U32 | S::S32) => SampleFormat::I32,
        Some(S::F32) => SampleFormat::F32,
        Some(S::F64) => SampleFormat::F64,
        None => match bits {
            Some(bits) if bits <= 16 => SampleFormat::I16,
            Some(_) => SampleFormat::I32,
            None => SampleFormat::F32,
        },
    }
}

fn samples_of(decoded: AudioBufferRef<'_>) -> AudioSamples {
    let spec = *decoded.spec();
    let capacity = decoded.capacity() as u64;
    match decoded {
        AudioBufferRef::U8(_)
        | AudioBufferRef::S8(_)
        | AudioBufferRef::U16(_)
        | AudioBufferRef::S16(_) => {
            let mut buffer = SampleBuffer::<i16>::new(capacity, spec);
            buffer.copy_interleaved_ref(decoded);
            AudioSamples::I16(buffer.samples().to_vec())
        }
        AudioBufferRef::U24(_)
        | AudioBufferRef::S24(_)
        | AudioBufferRef::U32(_)
        | AudioBufferRef::S32(_) => {
            let mut buffer = SampleBuffer::<i32>::new(capacity, spec);
            buffer.copy_interleaved_ref(decoded);
            AudioSamples::I32(buffer.samples().to_vec())
        }
        AudioBufferRef::F32(_) => {
            let mut buffer = SampleBuffer::<f32>::new(capacity, spec);
            buffer.copy_interleaved_ref(decoded);
            AudioSamples::F32(buffer.samples().to_vec())
        }
        AudioBufferRef::F64(_) => {
            let mut buffer = SampleBuffer::<f64>::new(capacity, spec);
            buffer.copy_interleaved_ref(decoded);
            AudioSamples::F64(buffer.samples().to_vec())
        }
    }
}

fn map_error(error: Error) -> EngineError {
    match error {
        Error::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            EngineError::EndOfStream
        }
        Error::IoError(e) => EngineError::from(e),
        Error::DecodeError(e) => EngineError::Malformed(e.to_owned()),
        Error::SeekError(e) => EngineError::Other(format!("seek failed: {e:?}")),
        Error::Unsupported(e) => EngineError::Unsupported(e.to_owned()),
        Error::LimitError(e) => EngineError::Other(format!("limit reached: {e}")),
        Error::ResetRequired => EngineError::Unsupported("stream parameters changed".to_owned()),
    }
}

/// Symphonia `FormatReader` behind the [`Demuxer`] contract.
pub struct SymphoniaDemuxer {
    format: Box<dyn FormatReader>,
    streams: Vec<StreamInfo>,
    seek_mode: SeekMode,
    /// Set by a seek beyond the last packet; reads report the end until the next seek.
    exhausted: bool,
}

impl SymphoniaDemuxer {
    fn track_id(&self, stream_index: usize) -> Result<u32, EngineError> {
        self.format
            .tracks()
            .get(stream_index)
            .map(|track| track.id)
            .ok_or_else(|| EngineError::Other(format!("no stream with index {stream_index}")))
    }
}

impl Demuxer for SymphoniaDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn best_stream(&self, media_type: MediaType) -> Option<usize> {
        if media_type != MediaType::Audio {
            return None;
        }
        let default_id = self.format.default_track().map(|track| track.id);
        let tracks = self.format.tracks();
        tracks
            .iter()
            .position(|track| Some(track.id) == default_id)
            .filter(|index| self.streams[*index].media_type == MediaType::Audio)
            .or_else(|| {
                self.streams
                    .iter()
                    .find(|stream| stream.media_type == MediaType::Audio)
                    .map(|stream| stream.index)
            })
    }

    fn read_packet(&mut self) -> Result<Packet, EngineError> {
        if self.exhausted {
            return Err(EngineError::EndOfStream);
        }
        let packet = self.format.next_packet().map_err(map_error)?;
        let stream_index = self
            .format
            .tracks()
            .iter()
            .position(|track| track.id == packet.track_id())
            .unwrap_or(usize::MAX);

        Ok(Packet {
            stream_index,
            pts: i64::try_from(packet.ts()).ok(),
            duration: i64::try_from(packet.dur()).ok(),
            trim_start: packet.trim_start(),
            trim_end: packet.trim_end(),
            data: packet.data,
        })
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), EngineError> {
        let track_id = self.track_id(stream_index)?;
        let ts = u64::try_from(timestamp).unwrap_or(0);
        let seeked = match self
            .format
            .seek(self.seek_mode, SeekTo::TimeStamp { ts, track_id })
        {
            Ok(seeked) => seeked,
            Err(Error::SeekError(SeekErrorKind::OutOfRange)) => {
                tracing::debug!("symphonia seek on track {track_id} to {ts} is past the end");
                self.exhausted = true;
                return Ok(());
            }
            Err(e) => return Err(map_error(e)),
        };
        self.exhausted = false;
        tracing::debug!(
            "symphonia seek on track {track_id}: required {}, actual {}",
            seeked.required_ts, seeked.actual_ts
        );
        Ok(())
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn Decoder>, EngineError> {
        let track = self
            .format
            .tracks()
            .get(stream_index)
            .ok_or_else(|| EngineError::Other(format!("no stream with index {stream_index}")))?;
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(map_error)?;
        let channels = self.streams[stream_index]
            .audio
            .as_ref()
            .map_or(0, |audio| audio.channels);

        Ok(Box::new(SymphoniaDecoder {
            decoder,
            track_id: track.id,
            channels,
            pending: None,
            draining: false,
        }))
    }

    fn duration(&self) -> Option<i64> {
        let track = self.format.default_track()?;
        let time_base = track.codec_params.time_base?;
        let n_frames = track.codec_params.n_frames?;
        let time = time_base.calc_time(n_frames);
        let micros = time.seconds as f64 * 1_000_000.0 + time.frac * 1_000_000.0;
        Some(micros.round() as i64)
    }
}

/// One-shot Symphonia decoder adapted to the send/receive protocol.
pub struct SymphoniaDecoder {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    channels: u16,
    pending: Option<AudioFrame>,
    draining: bool,
}

impl Decoder for SymphoniaDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus, EngineError> {
        if self.pending.is_some() {
            return Ok(SendStatus::Busy);
        }
        let Some(packet) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        self.draining = false;

        let mut symphonia_packet = symphonia::core::formats::Packet::new_from_boxed_slice(
            self.track_id,
            packet.pts.and_then(|pts| u64::try_from(pts).ok()).unwrap_or(0),
            packet.duration.and_then(|dur| u64::try_from(dur).ok()).unwrap_or(0),
            packet.data.clone(),
        );
        symphonia_packet.trim_start = packet.trim_start;
        symphonia_packet.trim_end = packet.trim_end;

        match self.decoder.decode(&symphonia_packet) {
            Ok(decoded) => {
                if decoded.frames() > 0 {
                    let channels = u16::try_from(decoded.spec().channels.count())
                        .unwrap_or(self.channels);
                    self.pending = Some(AudioFrame {
                        pts: packet.pts,
                        channels,
                        samples: samples_of(decoded),
                    });
                }
                Ok(SendStatus::Accepted)
            }
            Err(Error::ResetRequired) => {
                self.decoder.reset();
                Err(EngineError::Malformed("decoder reset required".to_owned()))
            }
            Err(Error::IoError(e)) => Err(EngineError::Malformed(e.to_string())),
            Err(e) => Err(map_error(e)),
        }
    }

    fn receive_frame(&mut self) -> Result<Receive, EngineError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Receive::Frame(Frame::Audio(frame)));
        }
        if self.draining {
            Ok(Receive::EndOfOutput)
        } else {
            Ok(Receive::NeedInput)
        }
    }

    fn flush(&mut self) {
        self.decoder.reset();
        self.pending = None;
        self.draining = false;
    }
}
