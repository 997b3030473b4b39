use std::io::{ErrorKind, Read, Seek, SeekFrom};

use avsession::{SampleStream, SessionError, StreamError, TrackMask, TrackType};

mod test_support;
use test_support::{open, Script, CHANNELS, SAMPLES_PER_PACKET};

const BLOCK_ALIGN: u64 = CHANNELS as u64 * 2;

fn stream(script: &Script) -> SampleStream {
    SampleStream::new(open(script, TrackMask::AUDIO)).unwrap()
}

/// Reads the first sample at the current position.
fn sample(stream: &mut SampleStream) -> i16 {
    let mut bytes = [0u8; 2];
    stream.read_exact(&mut bytes).unwrap();
    i16::from_ne_bytes(bytes)
}

#[test]
fn reads_the_whole_stream() {
    let mut stream = stream(&Script::audio(10));
    assert_eq!(stream.len(), 3200 * BLOCK_ALIGN);
    assert_eq!(stream.position(), 0);

    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    assert_eq!(data.len() as u64, stream.len());
    assert_eq!(stream.position(), stream.len());

    let packet_bytes = SAMPLES_PER_PACKET * BLOCK_ALIGN as usize;
    for (sequence, packet) in data.chunks_exact(packet_bytes).enumerate() {
        assert_eq!(i16::from_ne_bytes([packet[0], packet[1]]), sequence as i16);
    }
}

#[test]
fn seeks_to_a_sample() {
    let mut stream = stream(&Script::audio(10));

    assert_eq!(stream.seek(SeekFrom::Start(1000 * BLOCK_ALIGN)).unwrap(), 4000);
    assert_eq!(sample(&mut stream), 3);

    assert_eq!(stream.seek(SeekFrom::Start(0)).unwrap(), 0);
    assert_eq!(sample(&mut stream), 0);

    stream.seek(SeekFrom::End(-(BLOCK_ALIGN as i64))).unwrap();
    assert_eq!(sample(&mut stream), 9);
}

#[test]
fn relative_seeks() {
    let mut stream = stream(&Script::audio(10));
    stream.seek(SeekFrom::Start(320 * BLOCK_ALIGN)).unwrap();
    let position = stream
        .seek(SeekFrom::Current(640 * BLOCK_ALIGN as i64))
        .unwrap();
    assert_eq!(position, 960 * BLOCK_ALIGN);
    assert_eq!(sample(&mut stream), 3);

    let err = stream.seek(SeekFrom::Current(-(10_000 * BLOCK_ALIGN as i64)));
    assert_eq!(err.unwrap_err().kind(), ErrorKind::InvalidInput);
}

#[test]
fn seeks_past_late_landings() {
    let script = Script::audio(10).with_late_seeks();
    let mut stream = stream(&script);

    stream.seek(SeekFrom::Start(1000 * BLOCK_ALIGN)).unwrap();
    assert_eq!(stream.position(), 1000 * BLOCK_ALIGN);
    assert_eq!(sample(&mut stream), 3);
}

#[test]
fn unaligned_positions_are_rejected() {
    let mut stream = stream(&Script::audio(10));
    let err = stream.seek(SeekFrom::Start(3)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(matches!(
        stream.set_position(3),
        Err(StreamError::Unaligned {
            position: 3,
            block_align: 4
        })
    ));
}

#[test]
fn positions_past_the_end_read_nothing() {
    let mut stream = stream(&Script::audio(10));
    let beyond = 5000 * BLOCK_ALIGN;

    assert_eq!(stream.seek(SeekFrom::Start(beyond)).unwrap(), beyond);
    let mut buffer = [0u8; 16];
    assert_eq!(stream.read(&mut buffer).unwrap(), 0);
}

#[test]
fn seeking_past_the_end_drops_buffered_samples() {
    let script = Script::audio(10);
    let mut stream = stream(&script);
    assert_eq!(sample(&mut stream), 0);
    let seeks = script.seek_log().lock().unwrap().len();

    stream.seek(SeekFrom::End(0)).unwrap();
    let mut buffer = [0u8; 16];
    assert_eq!(stream.read(&mut buffer).unwrap(), 0);
    stream.seek(SeekFrom::End(BLOCK_ALIGN as i64 * 7)).unwrap();
    assert_eq!(stream.read(&mut buffer).unwrap(), 0);
    assert_eq!(script.seek_log().lock().unwrap().len(), seeks);

    stream.seek(SeekFrom::Start(1000 * BLOCK_ALIGN)).unwrap();
    assert_eq!(sample(&mut stream), 3);
}

#[test]
fn streams_starting_late_are_shifted_to_zero() {
    let mut stream = stream(&Script::audio_from(10, 800));
    assert_eq!(stream.position(), 0);
    assert_eq!(sample(&mut stream), 0);

    stream.seek(SeekFrom::Start(1000 * BLOCK_ALIGN)).unwrap();
    assert_eq!(sample(&mut stream), 3);
}

#[test]
fn delayed_decoders_stream_all_samples() {
    let mut stream = stream(&Script::audio(6).with_delay(2));
    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    assert_eq!(data.len() as u64, 6 * SAMPLES_PER_PACKET as u64 * BLOCK_ALIGN);
}

#[test]
fn requires_a_known_length() {
    let session = open(&Script::audio(10).without_stream_durations(), TrackMask::AUDIO);
    assert!(matches!(
        SampleStream::new(session),
        Err(StreamError::NotSeekable(_))
    ));
}

#[test]
fn requires_an_audio_track() {
    let session = open(&Script::video(10), TrackMask::VIDEO);
    assert!(matches!(
        SampleStream::new(session),
        Err(StreamError::Session(SessionError::TrackNotOpen(
            TrackType::Audio
        )))
    ));
}

#[test]
fn gives_back_the_session() {
    let stream = stream(&Script::audio(2));
    let session = stream.into_session();
    assert!(!session.has_error());
    assert_eq!(session.tracks(), TrackMask::AUDIO);
}
