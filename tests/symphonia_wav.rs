#![cfg(feature = "wav")]

use std::io::{Cursor, Read, Seek, SeekFrom};

use approx::assert_abs_diff_eq;
use avsession::{
    OutputSampleFormat, ReadOnlySource, ReadSeekSource, SampleStream, Session, TrackMask,
    TrackType,
};

mod test_support;

const RATE: u32 = 8000;
const FRAMES: usize = 2000;

/// Left channel counts up, right channel counts down.
fn sample_pair(frame: usize) -> (i32, i32) {
    let value = frame as i32 * 7;
    (value, -value)
}

fn wav_bytes(bits: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: RATE,
        bits_per_sample: bits,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for frame in 0..FRAMES {
            let (left, right) = sample_pair(frame);
            writer.write_sample(left).unwrap();
            writer.write_sample(right).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn open_wav(bits: u16) -> Session {
    test_support::init_logging();
    let bytes = wav_bytes(bits);
    let len = bytes.len() as u64;
    Session::open_from_source(
        TrackMask::AUDIO,
        ReadSeekSource::new(Cursor::new(bytes), Some(len)),
        Some("tone.wav"),
    )
}

#[test]
fn decodes_16_bit_wav_as_i16() {
    let mut session = open_wav(16);
    assert!(!session.has_error(), "{:?}", session.error());

    let output = *session.audio_output().unwrap();
    assert_eq!(output.format.sample_format, OutputSampleFormat::I16);
    assert_eq!(output.format.sample_rate.get(), RATE);
    assert_eq!(output.format.channels.get(), 2);
    assert_eq!(output.length, Some(FRAMES as i64));

    let mut buffer = vec![0u8; session.frame_buffer_size()];
    let mut samples = Vec::new();
    let mut expected_start = 0;
    while let Some(unit) = session.read(&mut buffer).unwrap() {
        assert_eq!(unit.track, TrackType::Audio);
        assert_eq!(unit.timestamp, expected_start);
        expected_start += unit.units as i64;
        samples.extend(
            buffer[..unit.len]
                .chunks_exact(2)
                .map(|bytes| i16::from_ne_bytes([bytes[0], bytes[1]])),
        );
    }
    assert_eq!(samples.len(), FRAMES * 2);
    for (frame, pair) in samples.chunks_exact(2).enumerate() {
        let (left, right) = sample_pair(frame);
        assert_eq!((i32::from(pair[0]), i32::from(pair[1])), (left, right));
    }
}

#[test]
fn decodes_24_bit_wav_as_f32() {
    let mut session = open_wav(24);
    assert!(!session.has_error(), "{:?}", session.error());
    assert_eq!(
        session.audio_output().unwrap().format.sample_format,
        OutputSampleFormat::F32
    );

    let mut buffer = vec![0u8; session.frame_buffer_size()];
    let unit = session.read(&mut buffer).unwrap().unwrap();
    let samples: Vec<f32> = buffer[..unit.len]
        .chunks_exact(4)
        .map(|bytes| f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect();
    let (left, right) = sample_pair(10);
    assert_abs_diff_eq!(samples[20], left as f32 / 8_388_608.0, epsilon = 1e-6);
    assert_abs_diff_eq!(samples[21], right as f32 / 8_388_608.0, epsilon = 1e-6);
}

#[test]
fn decodes_32_bit_wav_as_f32() {
    let session = open_wav(32);
    assert!(!session.has_error(), "{:?}", session.error());
    assert_eq!(
        session.audio_output().unwrap().format.sample_format,
        OutputSampleFormat::F32
    );
}

#[test]
fn sample_exact_seeking() {
    let mut stream = SampleStream::new(open_wav(16)).unwrap();
    let block = stream.format().block_align() as u64;
    assert_eq!(stream.len(), FRAMES as u64 * block);

    for frame in [1234usize, 17, 1999, 600] {
        stream.seek(SeekFrom::Start(frame as u64 * block)).unwrap();
        let mut bytes = [0u8; 4];
        stream.read_exact(&mut bytes).unwrap();
        let (left, right) = sample_pair(frame);
        assert_eq!(i16::from_ne_bytes([bytes[0], bytes[1]]) as i32, left);
        assert_eq!(i16::from_ne_bytes([bytes[2], bytes[3]]) as i32, right);
    }
}

#[test]
fn seeking_past_the_end_reads_nothing() {
    let mut stream = SampleStream::new(open_wav(16)).unwrap();
    let block = stream.format().block_align() as u64;
    let mut bytes = [0u8; 16];
    stream.read_exact(&mut bytes).unwrap();

    for end in [stream.len(), stream.len() + 300 * block] {
        assert_eq!(stream.seek(SeekFrom::Start(end)).unwrap(), end);
        assert_eq!(stream.read(&mut bytes).unwrap(), 0);
    }

    stream.seek(SeekFrom::Start(1500 * block)).unwrap();
    stream.read_exact(&mut bytes[..4]).unwrap();
    let (left, _) = sample_pair(1500);
    assert_eq!(i16::from_ne_bytes([bytes[0], bytes[1]]) as i32, left);
}

#[test]
fn session_seeks_beyond_the_last_packet_end_the_stream() {
    let mut session = open_wav(16);
    let mut buffer = vec![0u8; session.frame_buffer_size()];
    session.read(&mut buffer).unwrap().unwrap();

    session
        .seek(FRAMES as i64 + 4000, TrackType::Audio)
        .unwrap();
    assert!(session.read(&mut buffer).unwrap().is_none());

    session.seek(100, TrackType::Audio).unwrap();
    let unit = session.read(&mut buffer).unwrap().unwrap();
    assert!(unit.timestamp <= 100);
    assert!(unit.timestamp + unit.units as i64 > 100);
}

#[test]
fn unseekable_sources_still_decode() {
    test_support::init_logging();
    let mut session = Session::open_from_source(
        TrackMask::AUDIO,
        ReadOnlySource::new(Cursor::new(wav_bytes(16))),
        Some("wav"),
    );
    assert!(!session.has_error(), "{:?}", session.error());

    let mut buffer = vec![0u8; session.frame_buffer_size()];
    let mut frames = 0;
    while let Some(unit) = session.read(&mut buffer).unwrap() {
        frames += unit.units;
    }
    assert_eq!(frames, FRAMES);
}

#[test]
fn garbage_is_reported_on_open() {
    test_support::init_logging();
    let session = Session::open_from_source(
        TrackMask::AUDIO,
        ReadOnlySource::new(Cursor::new(vec![0x42u8; 4096])),
        None,
    );
    assert!(session.has_error());
    assert!(session
        .error()
        .unwrap()
        .starts_with("Could not open source"));
}
