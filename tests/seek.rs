use avsession::session::DecoderState;
use avsession::{SeekIndexError, SessionError, TrackMask, TrackType};

mod test_support;
use test_support::{open, read_all, Script, SAMPLES_PER_PACKET};

fn next_timestamp(session: &mut avsession::Session) -> Option<i64> {
    let mut buffer = vec![0u8; session.frame_buffer_size()];
    session
        .read(&mut buffer)
        .unwrap()
        .map(|unit| unit.timestamp)
}

#[test]
fn seek_lands_on_the_packet_holding_the_target() {
    let script = Script::audio(10);
    let mut session = open(&script, TrackMask::AUDIO);

    session.seek(1000, TrackType::Audio).unwrap();
    assert_eq!(session.audio_output().unwrap().position, 1000);
    assert_eq!(next_timestamp(&mut session), Some(960));
    assert_eq!(script.seek_log().lock().unwrap().as_slice(), &[1000]);
}

#[test]
fn seeking_twice_is_idempotent() {
    let script = Script::audio(10);
    let mut session = open(&script, TrackMask::AUDIO);

    session.seek(2000, TrackType::Audio).unwrap();
    session.seek(2000, TrackType::Audio).unwrap();
    assert_eq!(next_timestamp(&mut session), Some(1920));

    session.seek(2000, TrackType::Audio).unwrap();
    assert_eq!(next_timestamp(&mut session), Some(1920));
}

#[test]
fn seek_after_end_of_stream_restarts_decoding() {
    let script = Script::audio(4).with_delay(2);
    let mut session = open(&script, TrackMask::AUDIO);
    assert_eq!(read_all(&mut session).len(), 4);

    session.seek(0, TrackType::Audio).unwrap();
    assert_eq!(
        session.decoder_state(TrackType::Audio),
        Some(DecoderState::NeedInput)
    );
    let timestamps: Vec<i64> = read_all(&mut session)
        .iter()
        .map(|unit| unit.timestamp)
        .collect();
    assert_eq!(timestamps, vec![0, 320, 640, 960]);
}

#[test]
fn seek_discards_buffered_frames() {
    let script = Script::audio(10).with_delay(3);
    let mut session = open(&script, TrackMask::AUDIO);
    assert_eq!(next_timestamp(&mut session), Some(0));
    assert_eq!(next_timestamp(&mut session), Some(320));

    session.seek(2560, TrackType::Audio).unwrap();
    let timestamps: Vec<i64> = read_all(&mut session)
        .iter()
        .map(|unit| unit.timestamp)
        .collect();
    assert_eq!(timestamps, vec![2560, 2880]);
}

#[test]
fn seek_index_corrects_late_landings() {
    let script = Script::audio(10).with_late_seeks();
    let mut session = open(&script, TrackMask::AUDIO);

    session.seek(1000, TrackType::Audio).unwrap();
    assert_eq!(next_timestamp(&mut session), Some(1280));

    session.build_seek_index(TrackMask::AUDIO).unwrap();
    let index = session.seek_index(TrackType::Audio).unwrap();
    assert!(index.is_finalized());
    assert_eq!(index.len(), 10);
    assert_eq!(index.find(1000), Ok(960));

    // The scan leaves the session at the end of the stream.
    assert_eq!(next_timestamp(&mut session), None);

    session.seek(1000, TrackType::Audio).unwrap();
    assert_eq!(script.seek_log().lock().unwrap().last(), Some(&960));
    assert_eq!(session.audio_output().unwrap().position, 960);
    assert_eq!(next_timestamp(&mut session), Some(960));

    session.drop_seek_index(TrackMask::AUDIO);
    assert!(session.seek_index(TrackType::Audio).is_none());
    session.seek(1000, TrackType::Audio).unwrap();
    assert_eq!(next_timestamp(&mut session), Some(1280));
}

#[test]
fn index_holds_untimestamped_units() {
    let script = Script::audio(3).with_frames_per_packet(2);
    let mut session = open(&script, TrackMask::AUDIO);

    session.build_seek_index(TrackMask::AUDIO).unwrap();
    let entries = session
        .seek_index(TrackType::Audio)
        .and_then(|index| index.entries())
        .unwrap()
        .to_vec();
    let expected: Vec<i64> = (0..6).map(|i| (i * SAMPLES_PER_PACKET) as i64).collect();
    assert_eq!(entries, expected);
}

#[test]
fn seek_below_the_index_uses_the_plain_target() {
    let script = Script::audio_from(10, 800);
    let mut session = open(&script, TrackMask::AUDIO);
    session.build_seek_index(TrackMask::AUDIO).unwrap();
    assert_eq!(
        session.seek_index(TrackType::Audio).unwrap().find(100),
        Err(SeekIndexError::BelowRange)
    );

    session.seek(100, TrackType::Audio).unwrap();
    assert_eq!(script.seek_log().lock().unwrap().last(), Some(&100));
    assert_eq!(next_timestamp(&mut session), Some(800));
}

#[test]
fn failed_index_scan_keeps_what_was_seen() {
    let mut script = Script::audio(10);
    script.fail_read_after = Some(4);
    let mut session = open(&script, TrackMask::AUDIO);

    assert!(matches!(
        session.build_seek_index(TrackMask::AUDIO),
        Err(SessionError::Demux(_))
    ));
    let index = session.seek_index(TrackType::Audio).unwrap();
    assert!(index.is_finalized());
    assert_eq!(index.entries(), Some(&[0, 320, 640, 960][..]));
}

#[test]
fn tracks_that_are_not_open() {
    let script = Script::audio(3);
    let mut session = open(&script, TrackMask::AUDIO);

    assert!(matches!(
        session.seek(0, TrackType::Video),
        Err(SessionError::TrackNotOpen(TrackType::Video))
    ));
    assert!(matches!(
        session.build_seek_index(TrackMask::VIDEO),
        Err(SessionError::TrackNotOpen(TrackType::Video))
    ));
    assert!(session.build_seek_index(TrackMask::NONE).is_ok());
    assert!(session.seek_index(TrackType::Audio).is_none());
}

#[test]
fn seeking_video_moves_audio_along() {
    let script = Script::audio_video(10);
    let mut session = open(&script, TrackMask::BOTH);

    session.seek(5, TrackType::Video).unwrap();
    assert_eq!(script.seek_log().lock().unwrap().as_slice(), &[5 * 3600]);
    assert_eq!(session.audio_output().unwrap().position, 1600);

    let mut buffer = vec![0u8; session.frame_buffer_size()];
    let video = session.read(&mut buffer).unwrap().unwrap();
    assert_eq!((video.track, video.timestamp), (TrackType::Video, 5));
    let audio = session.read(&mut buffer).unwrap().unwrap();
    assert_eq!((audio.track, audio.timestamp), (TrackType::Audio, 1600));
}

#[test]
fn index_of_both_tracks() {
    let script = Script::audio_video(4);
    let mut session = open(&script, TrackMask::BOTH);

    session.build_seek_index(TrackMask::BOTH).unwrap();
    assert_eq!(
        session
            .seek_index(TrackType::Video)
            .and_then(|index| index.entries()),
        Some(&[0, 3600, 7200, 10800][..])
    );
    assert_eq!(
        session
            .seek_index(TrackType::Audio)
            .and_then(|index| index.entries()),
        Some(&[0, 320, 640, 960][..])
    );

    session.drop_seek_index(TrackMask::VIDEO);
    assert!(session.seek_index(TrackType::Video).is_none());
    assert!(session.seek_index(TrackType::Audio).is_some());
}
