//! Demux/decode engine backed by the system FFmpeg libraries through `ffmpeg-next`.
//!
//! Unlike the Symphonia engine this one decodes video as well as audio. Decoders keep FFmpeg's
//! own send/receive protocol, so frames may be released with a delay and draining returns
//! the buffered pictures. Pictures in pixel formats the session does not know are converted to
//! BGR24 by swscale right after decoding, and [`SwsScaler`] performs the final BGR24
//! conversion for all others.
//!
//! Only [`Input::Path`] is supported; FFmpeg performs its own I/O.

use ffmpeg_next as ffmpeg;

use ffmpeg::codec::capabilities::Capabilities;
use ffmpeg::codec::context::Context as CodecContext;
use ffmpeg::format::{context::Input as FormatInput, Pixel, Sample};
use ffmpeg::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg::util::frame;
use ffmpeg::{decoder, media, Error};
use num_rational::Rational64;

use super::{
    AudioFrame, AudioParams, AudioSamples, Decoder, Demuxer, EngineError, Frame, Input,
    MediaEngine, MediaType, Packet, PictureType, PixelFormat, Plane, Receive, SampleFormat,
    SendStatus, StreamInfo, VideoFrame, VideoParams,
};
use crate::conversions::{ConvertError, Scaler};
use crate::session::Settings;

/// Frame rate assumed for video streams that declare none.
const FALLBACK_FRAME_RATE: i64 = 25;

/// Engine opening files with libavformat and decoding with libavcodec.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegEngine;

impl MediaEngine for FfmpegEngine {
    fn open(&self, input: Input, settings: &Settings) -> Result<Box<dyn Demuxer>, EngineError> {
        let Input::Path(path) = input else {
            return Err(EngineError::Unsupported(
                "the ffmpeg engine only opens files by path".to_owned(),
            ));
        };
        ffmpeg::init().map_err(map_error)?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        if settings.hint().is_some() || settings.mime_type().is_some() {
            tracing::debug!("ffmpeg probes the format itself, ignoring format hints");
        }

        let input = ffmpeg::format::input(&path).map_err(map_error)?;
        let streams: Vec<StreamInfo> = input
            .streams()
            .map(|stream| stream_info(&stream))
            .collect();
        tracing::debug!("ffmpeg opened {} with {} streams", path.display(), streams.len());

        Ok(Box::new(FfmpegDemuxer { input, streams }))
    }
}

/// libavformat input behind the [`Demuxer`] contract.
pub struct FfmpegDemuxer {
    input: FormatInput,
    streams: Vec<StreamInfo>,
}

// SAFETY: the format context is owned by the demuxer and only used through `&mut self`.
unsafe impl Send for FfmpegDemuxer {}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn best_stream(&self, media_type: MediaType) -> Option<usize> {
        let wanted = match media_type {
            MediaType::Audio => media::Type::Audio,
            MediaType::Video => media::Type::Video,
            MediaType::Other => return None,
        };
        self.input
            .streams()
            .best(wanted)
            .map(|stream| stream.index())
            .filter(|index| {
                self.streams
                    .get(*index)
                    .is_some_and(|stream| stream.media_type == media_type)
            })
            .or_else(|| {
                self.streams
                    .iter()
                    .find(|stream| stream.media_type == media_type)
                    .map(|stream| stream.index)
            })
    }

    fn read_packet(&mut self) -> Result<Packet, EngineError> {
        let mut packet = ffmpeg::Packet::empty();
        packet.read(&mut self.input).map_err(map_error)?;
        Ok(Packet::new(
            packet.stream(),
            packet.pts(),
            Some(packet.duration()).filter(|duration| *duration > 0),
            packet.data().map(Box::from).unwrap_or_default(),
        ))
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), EngineError> {
        let stream = self
            .streams
            .get(stream_index)
            .ok_or_else(|| EngineError::Other(format!("no stream with index {stream_index}")))?;
        let micros = to_micros(timestamp, stream.time_base);
        self.input.seek(micros, ..=micros).map_err(|e| {
            EngineError::Other(format!("seek to {timestamp} in stream {stream_index} failed: {e}"))
        })?;
        tracing::debug!("ffmpeg seek on stream {stream_index} to {timestamp} ({micros} us)");
        Ok(())
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn Decoder>, EngineError> {
        let info = self
            .streams
            .get(stream_index)
            .ok_or_else(|| EngineError::Other(format!("no stream with index {stream_index}")))?;
        let stream = self
            .input
            .stream(stream_index)
            .ok_or_else(|| EngineError::Other(format!("no stream with index {stream_index}")))?;
        let context = CodecContext::from_parameters(stream.parameters()).map_err(map_error)?;
        let delay = context
            .codec()
            .is_some_and(|codec| codec.capabilities().contains(Capabilities::DELAY));

        let codec = match info.media_type {
            MediaType::Audio => Codec::Audio(context.decoder().audio().map_err(map_error)?),
            MediaType::Video => Codec::Video {
                decoder: context.decoder().video().map_err(map_error)?,
                converter: None,
            },
            MediaType::Other => {
                return Err(EngineError::Unsupported(format!(
                    "stream {stream_index} ({}) is neither audio nor video",
                    info.codec
                )))
            }
        };
        Ok(Box::new(FfmpegDecoder { codec, delay }))
    }

    fn duration(&self) -> Option<i64> {
        // Container durations are in AV_TIME_BASE units, which are microseconds.
        Some(self.input.duration()).filter(|duration| *duration > 0)
    }

    fn scaler(&self) -> Box<dyn Scaler> {
        Box::new(SwsScaler::default())
    }
}

fn stream_info(stream: &ffmpeg::Stream<'_>) -> StreamInfo {
    let index = stream.index();
    let parameters = stream.parameters();
    let mut info = StreamInfo {
        index,
        media_type: MediaType::Other,
        codec: parameters.id().name().to_owned(),
        time_base: rational(stream.time_base()).unwrap_or_else(|| {
            Rational64::new(1, i64::from(ffmpeg::ffi::AV_TIME_BASE))
        }),
        duration: Some(stream.duration()).filter(|duration| *duration > 0),
        audio: None,
        video: None,
    };
    // SAFETY: the parameters stay alive for the duration of the read.
    let raw_bits = unsafe { (*parameters.as_ptr()).bits_per_raw_sample };

    let probe = CodecContext::from_parameters(parameters);
    match stream.parameters().medium() {
        media::Type::Audio => match probe.and_then(|context| context.decoder().audio()) {
            Ok(decoder) => {
                info.media_type = MediaType::Audio;
                info.audio = Some(AudioParams {
                    sample_rate: decoder.rate(),
                    channels: decoder.channels(),
                    sample_format: storage_format(decoder.format()),
                    bits_per_raw_sample: u32::try_from(raw_bits).ok().filter(|bits| *bits > 0),
                });
            }
            Err(e) => tracing::warn!("cannot decode audio stream {index} ({}): {e}", info.codec),
        },
        media::Type::Video => match probe.and_then(|context| context.decoder().video()) {
            Ok(decoder) => {
                let frame_rate = rational(stream.avg_frame_rate())
                    .or_else(|| rational(stream.rate()))
                    .unwrap_or_else(|| {
                        tracing::warn!("video stream {index} declares no frame rate");
                        Rational64::from_integer(FALLBACK_FRAME_RATE)
                    });
                info.media_type = MediaType::Video;
                info.video = Some(VideoParams {
                    width: decoder.width(),
                    height: decoder.height(),
                    pixel_format: pixel_format(decoder.format()).unwrap_or(PixelFormat::Bgr24),
                    frame_rate,
                    sample_aspect_ratio: rational(decoder.aspect_ratio())
                        .unwrap_or_else(|| Rational64::from_integer(1)),
                });
            }
            Err(e) => tracing::warn!("cannot decode video stream {index} ({}): {e}", info.codec),
        },
        _ => {}
    }
    info
}

enum Codec {
    Audio(decoder::Audio),
    Video {
        decoder: decoder::Video,
        converter: Option<Converter>,
    },
}

/// libavcodec decoder behind the [`Decoder`] contract.
pub struct FfmpegDecoder {
    codec: Codec,
    delay: bool,
}

// SAFETY: the codec and scaling contexts are owned by the decoder and only used through
// `&mut self`.
unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    fn opened(&mut self) -> &mut decoder::Opened {
        match &mut self.codec {
            Codec::Audio(decoder) => &mut **decoder,
            Codec::Video { decoder, .. } => &mut **decoder,
        }
    }
}

impl Decoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus, EngineError> {
        let Some(packet) = packet else {
            return match self.opened().send_eof() {
                Ok(()) | Err(Error::Eof) => Ok(SendStatus::Accepted),
                Err(e) => Err(map_error(e)),
            };
        };

        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_stream(packet.stream_index);
        av_packet.set_pts(packet.pts);
        if let Some(duration) = packet.duration {
            av_packet.set_duration(duration);
        }
        match self.opened().send_packet(&av_packet) {
            Ok(()) => Ok(SendStatus::Accepted),
            Err(Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(SendStatus::Busy),
            Err(e) => Err(map_error(e)),
        }
    }

    fn receive_frame(&mut self) -> Result<Receive, EngineError> {
        match &mut self.codec {
            Codec::Audio(decoder) => {
                let mut decoded = frame::Audio::empty();
                match decoder.receive_frame(&mut decoded) {
                    Ok(()) => Ok(Receive::Frame(Frame::Audio(audio_frame(&decoded)))),
                    Err(e) => receive_error(e),
                }
            }
            Codec::Video { decoder, converter } => {
                let mut decoded = frame::Video::empty();
                match decoder.receive_frame(&mut decoded) {
                    Ok(()) => Ok(Receive::Frame(Frame::Video(video_frame(&decoded, converter)?))),
                    Err(e) => receive_error(e),
                }
            }
        }
    }

    fn flush(&mut self) {
        self.opened().flush();
    }

    fn has_delay(&self) -> bool {
        self.delay
    }
}

fn receive_error(error: Error) -> Result<Receive, EngineError> {
    match error {
        Error::Other { errno } if errno == ffmpeg::error::EAGAIN => Ok(Receive::NeedInput),
        Error::Eof => Ok(Receive::EndOfOutput),
        e => Err(map_error(e)),
    }
}

fn map_error(error: Error) -> EngineError {
    match error {
        Error::Eof => EngineError::EndOfStream,
        Error::InvalidData => EngineError::Malformed(error.to_string()),
        Error::DecoderNotFound
        | Error::DemuxerNotFound
        | Error::StreamNotFound
        | Error::PatchWelcome => EngineError::Unsupported(error.to_string()),
        e => EngineError::Other(e.to_string()),
    }
}

fn audio_frame(decoded: &frame::Audio) -> AudioFrame {
    let channels = decoded.channels();
    let planes: Vec<&[u8]> = (0..decoded.planes()).map(|index| decoded.data(index)).collect();
    AudioFrame {
        pts: decoded.pts().or_else(|| decoded.timestamp()),
        channels,
        samples: interleave(decoded.format(), &planes, decoded.samples(), channels as usize),
    }
}

fn video_frame(
    decoded: &frame::Video,
    converter: &mut Option<Converter>,
) -> Result<VideoFrame, EngineError> {
    let converted;
    let (format, picture) = match pixel_format(decoded.format()) {
        Some(format) => (format, decoded),
        None => {
            let (width, height) = (decoded.width(), decoded.height());
            let context =
                converter_for(converter, decoded.format(), width, height).map_err(map_error)?;
            let mut bgr = frame::Video::empty();
            context.run(decoded, &mut bgr).map_err(map_error)?;
            converted = bgr;
            (PixelFormat::Bgr24, &converted)
        }
    };

    Ok(VideoFrame {
        pts: decoded.pts().or_else(|| decoded.timestamp()),
        width: decoded.width(),
        height: decoded.height(),
        pixel_format: format,
        planes: (0..picture.planes())
            .map(|index| Plane {
                data: picture.data(index).to_vec(),
                stride: picture.stride(index),
            })
            .collect(),
        keyframe: decoded.is_key(),
        picture_type: picture_type(decoded.kind()),
        interlaced: decoded.is_interlaced(),
        top_field_first: decoded.is_top_first(),
    })
}

/// Storage format of the samples [`interleave`] produces for `sample`.
fn storage_format(sample: Sample) -> SampleFormat {
    match sample {
        Sample::U8(_) => SampleFormat::U8,
        Sample::I16(_) => SampleFormat::I16,
        Sample::I32(_) | Sample::I64(_) => SampleFormat::I32,
        Sample::F64(_) => SampleFormat::F64,
        Sample::F32(_) | Sample::None => SampleFormat::F32,
    }
}

/// Gathers packed or planar sample bytes into interleaved samples. 64-bit integers keep their
/// upper 32 bits.
fn interleave(sample: Sample, planes: &[&[u8]], frames: usize, channels: usize) -> AudioSamples {
    let planar = sample.is_planar();
    match sample {
        Sample::U8(_) => AudioSamples::U8(gather(planes, planar, frames, channels, |[b]: [u8; 1]| b)),
        Sample::I16(_) => {
            AudioSamples::I16(gather(planes, planar, frames, channels, i16::from_ne_bytes))
        }
        Sample::I32(_) => {
            AudioSamples::I32(gather(planes, planar, frames, channels, i32::from_ne_bytes))
        }
        Sample::I64(_) => AudioSamples::I32(gather(planes, planar, frames, channels, |b: [u8; 8]| {
            (i64::from_ne_bytes(b) >> 32) as i32
        })),
        Sample::F32(_) => {
            AudioSamples::F32(gather(planes, planar, frames, channels, f32::from_ne_bytes))
        }
        Sample::F64(_) => {
            AudioSamples::F64(gather(planes, planar, frames, channels, f64::from_ne_bytes))
        }
        Sample::None => AudioSamples::F32(Vec::new()),
    }
}

fn gather<T, const N: usize>(
    planes: &[&[u8]],
    planar: bool,
    frames: usize,
    channels: usize,
    decode: impl Fn([u8; N]) -> T,
) -> Vec<T> {
    let decode_chunk = |chunk: &[u8]| {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(chunk);
        decode(bytes)
    };
    if !planar {
        let bytes = planes.first().copied().unwrap_or_default();
        return bytes
            .chunks_exact(N)
            .take(frames * channels)
            .map(decode_chunk)
            .collect();
    }

    let mut chunks: Vec<_> = planes
        .iter()
        .take(channels)
        .map(|plane| plane.chunks_exact(N).take(frames))
        .collect();
    let mut samples = Vec::with_capacity(frames * chunks.len());
    for _ in 0..frames {
        for channel in &mut chunks {
            if let Some(chunk) = channel.next() {
                samples.push(decode_chunk(chunk));
            }
        }
    }
    samples
}

fn pixel_format(pixel: Pixel) -> Option<PixelFormat> {
    match pixel {
        Pixel::YUV420P => Some(PixelFormat::Yuv420p),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        Pixel::BGR24 => Some(PixelFormat::Bgr24),
        Pixel::RGBA => Some(PixelFormat::Rgba),
        Pixel::BGRA => Some(PixelFormat::Bgra),
        Pixel::GRAY8 => Some(PixelFormat::Gray8),
        _ => None,
    }
}

fn ffmpeg_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Bgr24 => Pixel::BGR24,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
        PixelFormat::Gray8 => Pixel::GRAY8,
    }
}

fn picture_type(kind: ffmpeg::picture::Type) -> PictureType {
    use ffmpeg::picture::Type as T;
    match kind {
        T::I => PictureType::I,
        T::P => PictureType::P,
        T::B => PictureType::B,
        T::S => PictureType::S,
        T::SI => PictureType::Si,
        T::SP => PictureType::Sp,
        T::BI => PictureType::Bi,
        T::None => PictureType::Unknown,
    }
}

fn rational(value: ffmpeg::Rational) -> Option<Rational64> {
    match (value.numerator(), value.denominator()) {
        (0, _) | (_, 0) => None,
        (numer, denom) => Some(Rational64::new(i64::from(numer), i64::from(denom))),
    }
}

/// Converts a timestamp in `time_base` ticks to microseconds, rounding down.
fn to_micros(timestamp: i64, time_base: Rational64) -> i64 {
    let numer = i128::from(timestamp) * i128::from(*time_base.numer()) * 1_000_000;
    let micros = numer.div_euclid(i128::from(*time_base.denom()));
    i64::try_from(micros).unwrap_or(if micros < 0 { i64::MIN } else { i64::MAX })
}

/// Bytes per row and rows of plane `index` of a `width` x `height` picture.
fn plane_geometry(format: PixelFormat, index: usize, width: usize, height: usize) -> (usize, usize) {
    match (format, index) {
        (PixelFormat::Yuv420p, 0) | (PixelFormat::Gray8, _) => (width, height),
        (PixelFormat::Yuv420p, _) => (width.div_ceil(2), height.div_ceil(2)),
        (PixelFormat::Rgb24 | PixelFormat::Bgr24, _) => (width * 3, height),
        (PixelFormat::Rgba | PixelFormat::Bgra, _) => (width * 4, height),
    }
}

fn copy_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<(), ConvertError> {
    let available = dst.len();
    for row in 0..rows {
        let source = src
            .get(row * src_stride..row * src_stride + row_bytes)
            .ok_or_else(|| ConvertError::FormatMismatch(format!("row {row} is out of bounds")))?;
        let target = dst
            .get_mut(row * dst_stride..row * dst_stride + row_bytes)
            .ok_or(ConvertError::BufferTooSmall {
                needed: (rows - 1) * dst_stride + row_bytes,
                available,
            })?;
        target.copy_from_slice(source);
    }
    Ok(())
}

/// Cached swscale context converting one input geometry to BGR24.
struct Converter {
    key: (Pixel, u32, u32),
    context: ScalingContext,
}

fn converter_for(
    slot: &mut Option<Converter>,
    format: Pixel,
    width: u32,
    height: u32,
) -> Result<&mut ScalingContext, Error> {
    let key = (format, width, height);
    let converter = match slot.take() {
        Some(converter) if converter.key == key => converter,
        _ => {
            tracing::debug!("creating swscale context for {format:?} {width}x{height}");
            Converter {
                key,
                context: ScalingContext::get(
                    format,
                    width,
                    height,
                    Pixel::BGR24,
                    width,
                    height,
                    ScalingFlags::BILINEAR,
                )?,
            }
        }
    };
    Ok(&mut slot.insert(converter).context)
}

/// [`Scaler`] running libswscale, for every [`PixelFormat`].
#[derive(Default)]
pub struct SwsScaler {
    converter: Option<Converter>,
}

// SAFETY: the scaling context is owned by the scaler and only used through `&mut self`.
unsafe impl Send for SwsScaler {}

impl Scaler for SwsScaler {
    fn supports(&self, _format: PixelFormat) -> bool {
        true
    }

    fn scale(
        &mut self,
        frame: &VideoFrame,
        out: &mut [u8],
        stride: usize,
    ) -> Result<(), ConvertError> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        if stride < width * 3 || out.len() < stride * height {
            return Err(ConvertError::BufferTooSmall {
                needed: width * 3 * height,
                available: out.len(),
            });
        }

        let format = ffmpeg_pixel(frame.pixel_format);
        let mut source = frame::Video::new(format, frame.width, frame.height);
        if frame.planes.len() < source.planes() {
            return Err(ConvertError::FormatMismatch(format!(
                "{} planes for {:?}",
                frame.planes.len(),
                frame.pixel_format
            )));
        }
        for (index, plane) in frame.planes.iter().enumerate().take(source.planes()) {
            let (row_bytes, rows) = plane_geometry(frame.pixel_format, index, width, height);
            let source_stride = source.stride(index);
            copy_rows(
                &plane.data,
                plane.stride,
                source.data_mut(index),
                source_stride,
                row_bytes,
                rows,
            )?;
        }

        let scaling = |e: Error| ConvertError::Scaling(e.to_string());
        let context =
            converter_for(&mut self.converter, format, frame.width, frame.height).map_err(scaling)?;
        let mut converted = frame::Video::empty();
        context.run(&source, &mut converted).map_err(scaling)?;
        copy_rows(
            converted.data(0),
            converted.stride(0),
            out,
            stride,
            width * 3,
            height,
        )
    }
}
