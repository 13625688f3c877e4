//! Channel-level segmentation for peers without native message framing.
//!
//! Segmented frame: `control:u8 || bytes`. The control byte carries
//! FIRST and/or FINAL; a frame with neither is a continuation. A
//! message that fits in one frame is sent as FIRST|FINAL.
//!
//! With native framing every channel message is already one logical
//! message, so [`Framing::Native`] passes bytes through untouched.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAME_FIRST: u8 = 0x01;
pub const FRAME_CONTINUATION: u8 = 0x02;
pub const FRAME_FINAL: u8 = 0x04;

/// Largest logical message the decoder will reassemble (64MB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame control byte {0:#04x}")]
    BadControl(u8),
    #[error("continuation frame without a preceding first frame")]
    OrphanContinuation,
    #[error("first frame while a message of {0} bytes is still being reassembled")]
    Interleaved(usize),
    #[error("reassembled message exceeds {max} bytes")]
    TooLarge { max: usize },
}

/// Result of feeding one channel frame into the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A full logical message is available.
    Complete(Bytes),
    /// More frames are needed.
    Incomplete,
}

/// How logical messages map onto channel messages for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Native,
    Segmented { max_frame: usize },
}

impl Framing {
    /// Split a logical message into the frames to send, lazily.
    pub fn frames(&self, message: Bytes) -> Segments {
        match *self {
            Framing::Native => Segments {
                rest: message,
                max_payload: usize::MAX,
                first: true,
                native: true,
                done: false,
            },
            Framing::Segmented { max_frame } => Segments {
                rest: message,
                // One byte of every frame is the control byte.
                max_payload: max_frame.saturating_sub(1).max(1),
                first: true,
                native: false,
                done: false,
            },
        }
    }

    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder {
            native: matches!(self, Framing::Native),
            partial: None,
            max_message: MAX_MESSAGE_SIZE,
        }
    }
}

/// Lazy iterator over the frames of one outbound message.
pub struct Segments {
    rest: Bytes,
    max_payload: usize,
    first: bool,
    native: bool,
    done: bool,
}

impl Iterator for Segments {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }
        if self.native {
            self.done = true;
            return Some(std::mem::take(&mut self.rest));
        }

        let take = self.rest.len().min(self.max_payload);
        let payload = self.rest.split_to(take);
        let last = self.rest.is_empty();

        let mut control = 0u8;
        if self.first {
            control |= FRAME_FIRST;
        }
        if last {
            control |= FRAME_FINAL;
        }
        if control == 0 {
            control = FRAME_CONTINUATION;
        }
        self.first = false;
        self.done = last;

        let mut frame = BytesMut::with_capacity(1 + payload.len());
        frame.put_u8(control);
        frame.put_slice(&payload);
        Some(frame.freeze())
    }
}

/// Reassembles segmented frames into logical messages.
pub struct FrameDecoder {
    native: bool,
    partial: Option<BytesMut>,
    max_message: usize,
}

impl FrameDecoder {
    pub fn push(&mut self, frame: Bytes) -> Result<FrameOutcome, FramingError> {
        if self.native {
            return Ok(FrameOutcome::Complete(frame));
        }
        let (&control, payload) = frame.split_first().ok_or(FramingError::Empty)?;

        let first = control & FRAME_FIRST != 0;
        let last = control & FRAME_FINAL != 0;
        let cont = control == FRAME_CONTINUATION;
        if !(first || last || cont) || control & !(FRAME_FIRST | FRAME_FINAL | FRAME_CONTINUATION) != 0
        {
            return Err(FramingError::BadControl(control));
        }

        if first {
            if let Some(p) = self.partial.take() {
                return Err(FramingError::Interleaved(p.len()));
            }
            if last {
                return Ok(FrameOutcome::Complete(frame.slice(1..)));
            }
            let mut buf = BytesMut::with_capacity(payload.len() * 2);
            buf.put_slice(payload);
            self.partial = Some(buf);
            return Ok(FrameOutcome::Incomplete);
        }

        let buf = self
            .partial
            .as_mut()
            .ok_or(FramingError::OrphanContinuation)?;
        if buf.len() + payload.len() > self.max_message {
            self.partial = None;
            return Err(FramingError::TooLarge {
                max: self.max_message,
            });
        }
        buf.put_slice(payload);

        if last {
            let done = self.partial.take().unwrap_or_default();
            Ok(FrameOutcome::Complete(done.freeze()))
        } else {
            Ok(FrameOutcome::Incomplete)
        }
    }

    /// Drop any half-assembled message, e.g. after the channel reconnects.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feed several frames and collect the messages they complete.
    pub fn decode_all<I>(&mut self, frames: I) -> impl Iterator<Item = Result<Bytes, FramingError>> + '_
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: 'static,
    {
        frames
            .into_iter()
            .filter_map(move |f| match self.push(f) {
                Ok(FrameOutcome::Complete(m)) => Some(Ok(m)),
                Ok(FrameOutcome::Incomplete) => None,
                Err(e) => Some(Err(e)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_message_single_frame() {
        let framing = Framing::Segmented { max_frame: 16 };
        let frames: Vec<_> = framing.frames(Bytes::from_static(b"hello")).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], FRAME_FIRST | FRAME_FINAL);

        let mut dec = framing.decoder();
        assert_eq!(
            dec.push(frames[0].clone()).unwrap(),
            FrameOutcome::Complete(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn test_large_message_reassembles() {
        let framing = Framing::Segmented { max_frame: 8 };
        let message: Bytes = (0..100u8).collect::<Vec<_>>().into();
        let frames: Vec<_> = framing.frames(message.clone()).collect();
        assert_eq!(frames.len(), 15); // 7 payload bytes per frame
        assert_eq!(frames[0][0], FRAME_FIRST);
        assert_eq!(frames[1][0], FRAME_CONTINUATION);
        assert_eq!(frames[14][0], FRAME_FINAL);

        let mut dec = framing.decoder();
        let out: Vec<_> = dec.decode_all(frames).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap(), &message);
    }

    #[test]
    fn test_orphan_continuation_is_malformed() {
        let mut dec = Framing::Segmented { max_frame: 8 }.decoder();
        let err = dec
            .push(Bytes::from_static(&[FRAME_CONTINUATION, 1, 2]))
            .unwrap_err();
        assert_eq!(err, FramingError::OrphanContinuation);
    }

    #[test]
    fn test_interleaved_first_is_malformed() {
        let mut dec = Framing::Segmented { max_frame: 8 }.decoder();
        assert_eq!(
            dec.push(Bytes::from_static(&[FRAME_FIRST, 1])).unwrap(),
            FrameOutcome::Incomplete
        );
        assert_eq!(
            dec.push(Bytes::from_static(&[FRAME_FIRST, 2])).unwrap_err(),
            FramingError::Interleaved(1)
        );
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut dec = Framing::Segmented { max_frame: 8 }.decoder();
        dec.push(Bytes::from_static(&[FRAME_FIRST, 1])).unwrap();
        dec.reset();
        assert_eq!(
            dec.push(Bytes::from_static(&[FRAME_FIRST | FRAME_FINAL, 9]))
                .unwrap(),
            FrameOutcome::Complete(Bytes::from_static(&[9]))
        );
    }

    #[test]
    fn test_native_passthrough() {
        let framing = Framing::Native;
        let frames: Vec<_> = framing.frames(Bytes::from(vec![0u8; 100_000])).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 100_000);
        let mut dec = framing.decoder();
        assert!(matches!(
            dec.push(frames[0].clone()).unwrap(),
            FrameOutcome::Complete(_)
        ));
    }

    #[test]
    fn test_bad_control_byte() {
        let mut dec = Framing::Segmented { max_frame: 8 }.decoder();
        assert_eq!(
            dec.push(Bytes::from_static(&[0x80, 1])).unwrap_err(),
            FramingError::BadControl(0x80)
        );
        assert_eq!(dec.push(Bytes::new()).unwrap_err(), FramingError::Empty);
    }
}
