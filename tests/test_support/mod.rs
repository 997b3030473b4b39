#![allow(dead_code)]
/// in separate folder so its not ran as integration test
///
/// A scripted in-memory engine: containers are lists of packets, decoders turn every packet
/// into a configurable number of frames whose samples/pixels carry the packet's sequence number.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use avsession::engine::{
    AudioFrame, AudioParams, AudioSamples, Decoder, Demuxer, EngineError, Frame, Input,
    MediaEngine, MediaType, Packet, PictureType, PixelFormat, Plane, Receive, SampleFormat,
    SendStatus, StreamInfo, VideoFrame, VideoParams,
};
use avsession::Settings;
use num_rational::Rational64;

pub const SAMPLE_RATE: u32 = 8000;
pub const CHANNELS: u16 = 2;
/// Samples per channel in one audio packet: 40ms, one video frame at 25fps.
pub const SAMPLES_PER_PACKET: usize = 320;
pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;
/// Ticks of the 90kHz video clock per frame at 25fps.
pub const VIDEO_TICKS: i64 = 3600;

const MALFORMED: u8 = 0xff;

/// Installs a subscriber so that `RUST_LOG=avsession=trace cargo test` shows the decode loop.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct DecoderScript {
    /// Frames held back before the first one is released.
    pub delay: usize,
    /// Frames produced per packet; only the first one carries a timestamp.
    pub frames_per_packet: usize,
    /// Picture rows are padded to a multiple of this many bytes.
    pub row_alignment: usize,
}

impl Default for DecoderScript {
    fn default() -> Self {
        Self {
            delay: 0,
            frames_per_packet: 1,
            row_alignment: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub streams: Vec<StreamInfo>,
    pub packets: Vec<Packet>,
    pub decoder: DecoderScript,
    /// Seeks land one packet after the requested one unless the target is a packet start.
    pub late_seeks: bool,
    pub fail_open: Option<String>,
    pub fail_decoder: bool,
    /// Reading fails once this many packets were delivered.
    pub fail_read_after: Option<usize>,
    pub container_duration: Option<i64>,
    /// Timestamps of all demuxer seeks, in order.
    pub seeks: Arc<Mutex<Vec<i64>>>,
}

pub fn audio_stream(index: usize, duration: Option<i64>) -> StreamInfo {
    StreamInfo {
        index,
        media_type: MediaType::Audio,
        codec: "scripted-pcm".to_owned(),
        time_base: Rational64::new(1, i64::from(SAMPLE_RATE)),
        duration,
        audio: Some(AudioParams {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            sample_format: SampleFormat::I16,
            bits_per_raw_sample: Some(16),
        }),
        video: None,
    }
}

pub fn video_stream(index: usize, duration: Option<i64>) -> StreamInfo {
    StreamInfo {
        index,
        media_type: MediaType::Video,
        codec: "scripted-rgb".to_owned(),
        time_base: Rational64::new(1, 90_000),
        duration,
        audio: None,
        video: Some(VideoParams {
            width: WIDTH,
            height: HEIGHT,
            pixel_format: PixelFormat::Rgb24,
            frame_rate: Rational64::from_integer(25),
            sample_aspect_ratio: Rational64::from_integer(1),
        }),
    }
}

fn packet(stream_index: usize, sequence: u32, pts: i64, duration: i64) -> Packet {
    Packet::new(
        stream_index,
        Some(pts),
        Some(duration),
        sequence.to_le_bytes().to_vec().into_boxed_slice(),
    )
}

impl Script {
    /// An audio-only container of `packets` packets, starting at sample `start`.
    pub fn audio(packets: usize) -> Self {
        Self::audio_from(packets, 0)
    }

    pub fn audio_from(packets: usize, start: i64) -> Self {
        let samples = SAMPLES_PER_PACKET as i64;
        Script {
            streams: vec![audio_stream(0, Some(packets as i64 * samples))],
            packets: (0..packets)
                .map(|i| packet(0, i as u32, start + i as i64 * samples, samples))
                .collect(),
            ..Default::default()
        }
    }

    /// A video-only container of `frames` packets.
    pub fn video(frames: usize) -> Self {
        Script {
            streams: vec![video_stream(0, Some(frames as i64 * VIDEO_TICKS))],
            packets: (0..frames)
                .map(|i| packet(0, i as u32, i as i64 * VIDEO_TICKS, VIDEO_TICKS))
                .collect(),
            ..Default::default()
        }
    }

    /// Video on stream 0 and audio on stream 1, interleaved one to one.
    pub fn audio_video(units: usize) -> Self {
        let samples = SAMPLES_PER_PACKET as i64;
        let mut packets = Vec::new();
        for i in 0..units {
            packets.push(packet(0, i as u32, i as i64 * VIDEO_TICKS, VIDEO_TICKS));
            packets.push(packet(1, i as u32, i as i64 * samples, samples));
        }
        Script {
            streams: vec![
                video_stream(0, Some(units as i64 * VIDEO_TICKS)),
                audio_stream(1, Some(units as i64 * samples)),
            ],
            packets,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: usize) -> Self {
        self.decoder.delay = delay;
        self
    }

    /// Each packet decodes into `frames` frames; packet durations and stream lengths are scaled
    /// to match.
    pub fn with_frames_per_packet(mut self, frames: usize) -> Self {
        self.decoder.frames_per_packet = frames;
        let factor = frames as i64;
        for stream in &mut self.streams {
            stream.duration = stream.duration.map(|duration| duration * factor);
        }
        for packet in &mut self.packets {
            packet.pts = packet.pts.map(|pts| pts * factor);
            packet.duration = packet.duration.map(|duration| duration * factor);
        }
        self
    }

    pub fn with_row_alignment(mut self, bytes: usize) -> Self {
        self.decoder.row_alignment = bytes;
        self
    }

    pub fn with_late_seeks(mut self) -> Self {
        self.late_seeks = true;
        self
    }

    pub fn with_malformed(mut self, packet_indices: &[usize]) -> Self {
        for index in packet_indices {
            self.packets[*index].data = vec![MALFORMED; 4].into_boxed_slice();
        }
        self
    }

    pub fn without_stream_durations(mut self) -> Self {
        for stream in &mut self.streams {
            stream.duration = None;
        }
        self
    }

    pub fn seek_log(&self) -> Arc<Mutex<Vec<i64>>> {
        Arc::clone(&self.seeks)
    }

    /// Total decoded units the container holds for `stream_index`.
    pub fn units(&self, stream_index: usize) -> usize {
        self.packets
            .iter()
            .filter(|packet| packet.stream_index == stream_index)
            .count()
            * self.decoder.frames_per_packet
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedEngine(pub Script);

impl MediaEngine for ScriptedEngine {
    fn open(&self, _input: Input, _settings: &Settings) -> Result<Box<dyn Demuxer>, EngineError> {
        if let Some(message) = &self.0.fail_open {
            return Err(EngineError::Other(message.clone()));
        }
        Ok(Box::new(ScriptedDemuxer {
            script: self.0.clone(),
            cursor: 0,
            delivered: 0,
        }))
    }
}

pub struct ScriptedDemuxer {
    script: Script,
    cursor: usize,
    delivered: usize,
}

impl ScriptedDemuxer {
    /// Presentation time of a packet in seconds.
    fn time_of(&self, index: usize) -> Rational64 {
        let packet = &self.script.packets[index];
        let time_base = self.script.streams[packet.stream_index].time_base;
        Rational64::from_integer(packet.pts.unwrap_or(0)) * time_base
    }
}

impl Demuxer for ScriptedDemuxer {
    fn streams(&self) -> &[StreamInfo] {
        &self.script.streams
    }

    fn read_packet(&mut self) -> Result<Packet, EngineError> {
        if self.script.fail_read_after == Some(self.delivered) {
            return Err(EngineError::Other("scripted read failure".to_owned()));
        }
        let packet = self
            .script
            .packets
            .get(self.cursor)
            .cloned()
            .ok_or(EngineError::EndOfStream)?;
        self.cursor += 1;
        self.delivered += 1;
        Ok(packet)
    }

    fn seek(&mut self, stream_index: usize, timestamp: i64) -> Result<(), EngineError> {
        self.script.seeks.lock().unwrap().push(timestamp);
        let candidates: Vec<usize> = self
            .script
            .packets
            .iter()
            .enumerate()
            .filter(|(_, packet)| packet.stream_index == stream_index)
            .map(|(index, _)| index)
            .collect();
        let Some(first) = candidates.first() else {
            return Err(EngineError::Other(format!("no stream {stream_index}")));
        };

        let at_or_before = candidates
            .iter()
            .rposition(|index| self.script.packets[*index].pts.unwrap_or(0) <= timestamp);
        let landing = match at_or_before {
            None => *first,
            Some(position) => {
                let exact = self.script.packets[candidates[position]].pts == Some(timestamp);
                if self.script.late_seeks && !exact {
                    match candidates.get(position + 1) {
                        Some(next) => *next,
                        None => {
                            self.cursor = self.script.packets.len();
                            return Ok(());
                        }
                    }
                } else {
                    candidates[position]
                }
            }
        };

        // Resume at the first packet of any stream that is not before the landing packet.
        let time = self.time_of(landing);
        self.cursor = (0..=landing)
            .find(|index| self.time_of(*index) >= time)
            .unwrap_or(landing);
        Ok(())
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn Decoder>, EngineError> {
        if self.script.fail_decoder {
            return Err(EngineError::Unsupported("scripted codec".to_owned()));
        }
        let stream = self
            .script
            .streams
            .get(stream_index)
            .cloned()
            .ok_or_else(|| EngineError::Other(format!("no stream {stream_index}")))?;
        Ok(Box::new(ScriptedDecoder {
            stream,
            script: self.script.decoder.clone(),
            delayed: VecDeque::new(),
            ready: VecDeque::new(),
            draining: false,
        }))
    }

    fn duration(&self) -> Option<i64> {
        self.script.container_duration
    }
}

pub struct ScriptedDecoder {
    stream: StreamInfo,
    script: DecoderScript,
    delayed: VecDeque<Frame>,
    ready: VecDeque<Frame>,
    draining: bool,
}

impl ScriptedDecoder {
    fn frame(&self, sequence: u32, pts: Option<i64>, first: bool) -> Frame {
        if let Some(params) = &self.stream.audio {
            let samples = SAMPLES_PER_PACKET * params.channels as usize;
            Frame::Audio(AudioFrame {
                pts,
                channels: params.channels,
                samples: AudioSamples::I16(vec![sequence as i16; samples]),
            })
        } else {
            let params = self.stream.video.as_ref().unwrap();
            let alignment = self.script.row_alignment;
            let stride = (params.width as usize * 3).div_ceil(alignment) * alignment;
            Frame::Video(VideoFrame {
                pts,
                width: params.width,
                height: params.height,
                pixel_format: params.pixel_format,
                planes: vec![Plane {
                    data: vec![sequence as u8; stride * params.height as usize],
                    stride,
                }],
                keyframe: first && sequence % 10 == 0,
                picture_type: if first && sequence % 10 == 0 {
                    PictureType::I
                } else {
                    PictureType::P
                },
                interlaced: false,
                top_field_first: false,
            })
        }
    }
}

impl Decoder for ScriptedDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<SendStatus, EngineError> {
        if !self.ready.is_empty() {
            return Ok(SendStatus::Busy);
        }
        let Some(packet) = packet else {
            self.draining = true;
            self.ready.extend(self.delayed.drain(..));
            return Ok(SendStatus::Accepted);
        };
        if packet.data.first() == Some(&MALFORMED) {
            return Err(EngineError::Malformed("scripted corruption".to_owned()));
        }
        let sequence = u32::from_le_bytes(packet.data[..4].try_into().unwrap());
        for i in 0..self.script.frames_per_packet {
            let pts = if i == 0 { packet.pts } else { None };
            let frame = self.frame(sequence, pts, i == 0);
            self.delayed.push_back(frame);
        }
        while self.delayed.len() > self.script.delay {
            let frame = self.delayed.pop_front().unwrap();
            self.ready.push_back(frame);
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<Receive, EngineError> {
        match self.ready.pop_front() {
            Some(frame) => Ok(Receive::Frame(frame)),
            None if self.draining => Ok(Receive::EndOfOutput),
            None => Ok(Receive::NeedInput),
        }
    }

    fn flush(&mut self) {
        self.delayed.clear();
        self.ready.clear();
        self.draining = false;
    }

    fn has_delay(&self) -> bool {
        self.script.delay > 0
    }
}

/// Opens a session over `script` decoding the tracks in `mode`.
pub fn open(script: &Script, mode: avsession::TrackMask) -> avsession::Session {
    init_logging();
    avsession::Session::builder()
        .with_path("scripted.bin")
        .with_mode(mode)
        .with_engine(ScriptedEngine(script.clone()))
        .build()
}

/// Reads until the end of the stream, returning every delivered unit.
pub fn read_all(session: &mut avsession::Session) -> Vec<avsession::DecodedUnit> {
    let mut buffer = vec![0u8; session.frame_buffer_size()];
    let mut units = Vec::new();
    while let Some(unit) = session.read(&mut buffer).unwrap() {
        units.push(unit);
    }
    units
}
