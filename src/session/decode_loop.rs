//! The per-read decode state machine.
//!
//! Each read first hands out a decoded unit left over from a previous read, then polls the
//! decoders that may hold output, and only then pulls the next packet from the demuxer. Once
//! the demuxer is exhausted every decoder is drained with empty packets until it reports the
//! end of its output.

use crate::common::TrackType;
use crate::conversions::{AudioNormalizer, VideoNormalizer};
use crate::engine::{Decoder, EngineError, Frame, Packet, Receive, SendStatus};
use crate::position::PositionTracker;
use crate::seek_index::SeekIndex;

use super::{DecodedUnit, FrameProps, Session, SessionError};

/// Protocol state of one track's decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// All output was received; the decoder wants a packet.
    NeedInput,
    /// A packet was sent and output may be available.
    HasOutput,
    /// An empty packet was sent; the decoder releases its buffered frames.
    Draining,
    /// The decoder reported the end of its output.
    Finished,
}

pub(super) enum Normalizer {
    Audio(AudioNormalizer),
    Video(VideoNormalizer),
}

/// Everything a session keeps for one decoded track.
pub(super) struct Track {
    pub(super) kind: TrackType,
    pub(super) stream_index: usize,
    pub(super) decoder: Box<dyn Decoder>,
    pub(super) state: DecoderState,
    pub(super) tracker: PositionTracker,
    pub(super) normalizer: Normalizer,
    pub(super) index: Option<SeekIndex>,
    /// Units delivered since opening, for diagnostics only.
    pub(super) frames_decoded: u64,
}

impl Track {
    /// Resets the decoder protocol after a seek.
    pub(super) fn flush(&mut self) {
        self.decoder.flush();
        self.state = DecoderState::NeedInput;
    }

    fn bytes_needed(&self, frame: &Frame) -> usize {
        match (&self.normalizer, frame) {
            (Normalizer::Audio(normalizer), Frame::Audio(frame)) => normalizer.bytes_needed(frame),
            (Normalizer::Video(normalizer), Frame::Video(frame)) => normalizer.bytes_needed(frame),
            _ => 0,
        }
    }
}

/// A unit handed out by the decode loop, with the native timestamp the decoder reported.
pub(super) struct Delivered {
    pub(super) unit: DecodedUnit,
    pub(super) pts: Option<i64>,
}

impl Session {
    /// Runs the decode loop until one unit is delivered or all tracks are finished.
    ///
    /// Without an output buffer units are accounted for but not converted.
    pub(super) fn next_unit(
        &mut self,
        mut out: Option<&mut [u8]>,
    ) -> Result<Option<Delivered>, SessionError> {
        loop {
            if let Some((kind, frame)) = self.pending_frame.take() {
                return self.deliver(kind, frame, out.as_deref_mut()).map(Some);
            }

            if self.poll_decoders()? {
                continue;
            }

            if self.eof {
                if self.drain()? {
                    continue;
                }
                tracing::debug!("all decoders drained");
                return Ok(None);
            }

            let packet = match self.pending_packet.take() {
                Some(packet) => packet,
                None => match self.demuxer_mut()?.read_packet() {
                    Ok(packet) => packet,
                    Err(EngineError::EndOfStream) => {
                        tracing::debug!("end of stream, draining decoders");
                        self.eof = true;
                        continue;
                    }
                    Err(e) => return Err(SessionError::Demux(e)),
                },
            };
            self.feed(packet)?;
        }
    }

    /// Receives from every decoder that may have output, in priority order. Returns true once a
    /// frame was stored in the pending slot.
    fn poll_decoders(&mut self) -> Result<bool, SessionError> {
        for kind in self.settings.priority.order() {
            let Some(track) = self.track_mut(kind) else {
                continue;
            };
            if !matches!(
                track.state,
                DecoderState::HasOutput | DecoderState::Draining
            ) {
                continue;
            }

            match track.decoder.receive_frame() {
                Ok(Receive::Frame(frame)) => {
                    self.pending_frame = Some((kind, frame));
                    return Ok(true);
                }
                Ok(Receive::NeedInput) => {
                    // A draining decoder asking for input has nothing left to give.
                    track.state = match track.state {
                        DecoderState::Draining => DecoderState::Finished,
                        _ => DecoderState::NeedInput,
                    };
                }
                Ok(Receive::EndOfOutput) => track.state = DecoderState::Finished,
                Err(EngineError::Malformed(reason)) => {
                    track.state = match track.state {
                        DecoderState::Draining => DecoderState::Finished,
                        _ => DecoderState::NeedInput,
                    };
                    self.tolerate_malformed(kind, reason)?;
                }
                Err(e) => return Err(SessionError::Decode(e)),
            }
        }
        Ok(false)
    }

    /// Sends the end-of-input signal to decoders that have not seen it. Returns false once every
    /// track is finished.
    fn drain(&mut self) -> Result<bool, SessionError> {
        let mut active = false;
        for kind in self.settings.priority.order() {
            let Some(track) = self.track_mut(kind) else {
                continue;
            };
            match track.state {
                DecoderState::Finished => {}
                DecoderState::NeedInput => {
                    active = true;
                    track.state = match track.decoder.send_packet(None) {
                        Ok(SendStatus::Accepted) => DecoderState::Draining,
                        Ok(SendStatus::Busy) => {
                            tracing::warn!("{kind} decoder refuses to drain while idle");
                            DecoderState::Finished
                        }
                        Err(e) => return Err(SessionError::Decode(e)),
                    };
                }
                DecoderState::HasOutput | DecoderState::Draining => active = true,
            }
        }
        Ok(active)
    }

    /// Routes a packet to its track's decoder.
    fn feed(&mut self, packet: Packet) -> Result<(), SessionError> {
        let Some(kind) = self.track_of_stream(packet.stream_index) else {
            tracing::trace!("discarding packet of stream {}", packet.stream_index);
            return Ok(());
        };
        let Some(track) = self.track_mut(kind) else {
            return Ok(());
        };

        match track.decoder.send_packet(Some(&packet)) {
            Ok(SendStatus::Accepted) => {
                track.state = DecoderState::HasOutput;
                Ok(())
            }
            Ok(SendStatus::Busy) => {
                track.state = DecoderState::HasOutput;
                self.pending_packet = Some(packet);
                Ok(())
            }
            Err(EngineError::Malformed(reason)) => self.tolerate_malformed(kind, reason),
            Err(e) => Err(SessionError::Decode(e)),
        }
    }

    fn tolerate_malformed(&mut self, kind: TrackType, reason: String) -> Result<(), SessionError> {
        self.decode_errors += 1;
        if self.decode_errors > self.settings.max_decode_errors {
            return Err(SessionError::Decode(EngineError::Malformed(reason)));
        }
        tracing::warn!(
            "skipping malformed {kind} packet ({}/{}): {reason}",
            self.decode_errors,
            self.settings.max_decode_errors
        );
        Ok(())
    }

    /// Normalizes a decoded frame into `out` and accounts for its position.
    fn deliver(
        &mut self,
        kind: TrackType,
        frame: Frame,
        out: Option<&mut [u8]>,
    ) -> Result<Delivered, SessionError> {
        let Some(track) = self.track_mut(kind) else {
            return Err(SessionError::TrackNotOpen(kind));
        };

        let len = match out {
            None => 0,
            Some(out) => {
                let needed = track.bytes_needed(&frame);
                if out.len() < needed {
                    tracing::warn!(
                        "output buffer of {} bytes is too small for a {kind} unit of {needed} bytes",
                        out.len()
                    );
                    self.pending_frame = Some((kind, frame));
                    return Err(SessionError::BufferTooSmall {
                        needed,
                        available: out.len(),
                    });
                }
                let converted = match (&mut track.normalizer, &frame) {
                    (Normalizer::Audio(normalizer), Frame::Audio(frame)) => {
                        normalizer.convert(frame, out)
                    }
                    (Normalizer::Video(normalizer), Frame::Video(frame)) => {
                        normalizer.convert(frame, out)
                    }
                    _ => Err(crate::conversions::ConvertError::FormatMismatch(format!(
                        "{kind} track produced a frame of another media type"
                    ))),
                };
                converted.map_err(SessionError::Convert)?
            }
        };

        let units = match &frame {
            Frame::Audio(frame) => frame.frames(),
            Frame::Video(_) => 1,
        };
        let pts = frame.pts();
        let timestamp = track.tracker.advance(pts, units as u64);
        let position = track.tracker.position();
        track.frames_decoded += 1;
        tracing::trace!(
            "{kind} unit #{}: {units} units at {timestamp}, pts {pts:?}",
            track.frames_decoded
        );

        match &frame {
            Frame::Audio(_) => {
                if let Some(output) = self.audio_output.as_mut() {
                    output.position = position;
                }
            }
            Frame::Video(picture) => {
                if let (Some(output), Some(Track {
                    normalizer: Normalizer::Video(normalizer),
                    ..
                })) = (self.video_output.as_mut(), self.video.as_ref())
                {
                    output.stride = normalizer.stride(picture);
                    output.current_frame = FrameProps {
                        keyframe: picture.keyframe,
                        picture_type: picture.picture_type,
                        interlaced: picture.interlaced,
                        top_field_first: picture.top_field_first,
                    };
                }
            }
        }
        self.decode_errors = 0;

        Ok(Delivered {
            unit: DecodedUnit {
                track: kind,
                units,
                timestamp,
                len,
            },
            pts,
        })
    }
}
