/*!
 * Receive-side stream reassembly.
 *
 * Transports hand over arbitrary chunks: a frame may be split across several
 * chunks, and one chunk may carry several frames. The [`FrameAccumulator`]
 * buffers the chunks and emits complete frames in arrival order.
 *
 * ```
 * use linkflow_transport::framing::{FrameAccumulator, FramingRule};
 *
 * let accumulator = FrameAccumulator::new(FramingRule::lf(), 1024).unwrap();
 * assert!(accumulator.feed(b"AB").unwrap().is_empty());
 * let frames = accumulator.feed(b"C\nDE\nF").unwrap();
 * assert_eq!(frames.len(), 2);
 * assert_eq!(&frames[0][..], b"ABC");
 * ```
 */
use std::borrow::Cow;
use std::sync::{Mutex, MutexGuard};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{LinkError, Result};

/// Initial receive buffer capacity
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Default limit for the unterminated remainder
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024;

/// How a byte stream is cut into frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingRule {
    /// Frames end with this byte sequence; the delimiter is not part of the frame
    Delimiter(Bytes),
    /// Every frame is exactly this many bytes
    FixedLength(usize),
}

impl FramingRule {
    /// Frames terminated by an arbitrary delimiter
    pub fn delimiter<B: Into<Bytes>>(delimiter: B) -> Self {
        FramingRule::Delimiter(delimiter.into())
    }

    /// Frames terminated by `\n`
    pub fn lf() -> Self {
        FramingRule::Delimiter(Bytes::from_static(b"\n"))
    }

    /// Frames terminated by `\r`
    pub fn cr() -> Self {
        FramingRule::Delimiter(Bytes::from_static(b"\r"))
    }

    /// Frames terminated by `\r\n`
    pub fn crlf() -> Self {
        FramingRule::Delimiter(Bytes::from_static(b"\r\n"))
    }

    /// Fixed-size binary frames
    pub fn fixed(length: usize) -> Self {
        FramingRule::FixedLength(length)
    }

    fn validate(&self) -> Result<()> {
        match self {
            FramingRule::Delimiter(d) if d.is_empty() => Err(LinkError::Configuration(
                "frame delimiter must not be empty".to_string(),
            )),
            FramingRule::FixedLength(0) => Err(LinkError::Configuration(
                "fixed frame length must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl Default for FramingRule {
    fn default() -> Self {
        FramingRule::lf()
    }
}

/// Bytes that have not yet formed a complete frame
#[derive(Debug)]
struct ReceiveBuffer {
    bytes: BytesMut,
    /// Offset before which no delimiter can start
    scan_from: usize,
}

impl ReceiveBuffer {
    fn drain(&mut self, rule: &FramingRule, frames: &mut Vec<Bytes>) {
        match rule {
            FramingRule::Delimiter(delimiter) => loop {
                match find(&self.bytes[self.scan_from..], delimiter) {
                    Some(pos) => {
                        let end = self.scan_from + pos;
                        frames.push(self.bytes.split_to(end).freeze());
                        self.bytes.advance(delimiter.len());
                        self.scan_from = 0;
                    }
                    None => {
                        // Keep the tail that could still begin a split delimiter.
                        self.scan_from = self.bytes.len().saturating_sub(delimiter.len() - 1);
                        break;
                    }
                }
            },
            FramingRule::FixedLength(length) => {
                while self.bytes.len() >= *length {
                    frames.push(self.bytes.split_to(*length).freeze());
                }
            }
        }
    }

    fn reset(&mut self) {
        self.bytes.clear();
        self.scan_from = 0;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    match needle {
        [single] => haystack.iter().position(|b| b == single),
        _ => haystack.windows(needle.len()).position(|w| w == needle),
    }
}

/// Buffers incoming chunks and splits them into frames.
///
/// Safe to share between tasks: the buffer is guarded by its own mutex, and
/// frame callbacks run after the lock is released.
#[derive(Debug)]
pub struct FrameAccumulator {
    rule: FramingRule,
    max_buffer: usize,
    buffer: Mutex<ReceiveBuffer>,
}

impl FrameAccumulator {
    /// Create an accumulator
    ///
    /// `max_buffer` bounds the unterminated remainder; a stream that never
    /// produces a frame fails with [`LinkError::FramingOverflow`] instead of
    /// growing without limit.
    pub fn new(rule: FramingRule, max_buffer: usize) -> Result<Self> {
        rule.validate()?;
        if max_buffer == 0 {
            return Err(LinkError::Configuration(
                "receive buffer limit must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            rule,
            max_buffer,
            buffer: Mutex::new(ReceiveBuffer {
                bytes: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_buffer)),
                scan_from: 0,
            }),
        })
    }

    /// The framing rule in use
    pub fn rule(&self) -> &FramingRule {
        &self.rule
    }

    /// The remainder limit
    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    fn lock(&self) -> Result<MutexGuard<'_, ReceiveBuffer>> {
        self.buffer
            .lock()
            .map_err(|_| LinkError::Other("receive buffer lock poisoned".to_string()))
    }

    /// Feed a chunk and hand every completed frame to `on_frame`, in order.
    ///
    /// Returns the number of frames emitted. On overflow the frames completed
    /// by this chunk are still delivered, the remainder is discarded, and the
    /// overflow error is returned.
    pub fn feed_with<F>(&self, chunk: &[u8], mut on_frame: F) -> Result<usize>
    where
        F: FnMut(Bytes),
    {
        let mut frames = Vec::new();
        let overflow = {
            let mut buffer = self.lock()?;
            buffer.bytes.extend_from_slice(chunk);
            buffer.drain(&self.rule, &mut frames);

            let buffered = buffer.bytes.len();
            if buffered > self.max_buffer {
                buffer.reset();
                Some(LinkError::FramingOverflow {
                    buffered,
                    limit: self.max_buffer,
                })
            } else {
                None
            }
        };

        let count = frames.len();
        for frame in frames {
            on_frame(frame);
        }

        match overflow {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Feed a chunk and collect the completed frames.
    ///
    /// Frames completed by an overflowing chunk are dropped; use
    /// [`feed_with`](Self::feed_with) to keep them.
    pub fn feed(&self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        self.feed_with(chunk, |frame| frames.push(frame))?;
        Ok(frames)
    }

    /// Copy of the unterminated remainder
    pub fn pending(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(&self.lock()?.bytes))
    }

    /// Number of buffered bytes
    pub fn buffered_len(&self) -> Result<usize> {
        Ok(self.lock()?.bytes.len())
    }

    /// Drop everything buffered
    pub fn clear(&self) -> Result<()> {
        self.lock()?.reset();
        Ok(())
    }
}

/// View a frame as text, replacing invalid UTF-8
pub fn frame_text(frame: &Bytes) -> Cow<'_, str> {
    String::from_utf8_lossy(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn texts(frames: &[Bytes]) -> Vec<String> {
        frames.iter().map(|f| frame_text(f).into_owned()).collect()
    }

    #[test]
    fn test_frames_across_chunks() {
        let acc = FrameAccumulator::new(FramingRule::lf(), 1024).unwrap();

        assert!(acc.feed(b"AB").unwrap().is_empty());
        assert_eq!(texts(&acc.feed(b"C\n").unwrap()), vec!["ABC"]);
        assert_eq!(texts(&acc.feed(b"DE\nFG").unwrap()), vec!["DE"]);
        assert_eq!(acc.pending().unwrap(), Bytes::from_static(b"FG"));
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let acc = FrameAccumulator::new(FramingRule::cr(), 1024).unwrap();
        let frames = acc.feed(b"PWR=1\rINPUT=HDMI1\rVOL=").unwrap();
        assert_eq!(texts(&frames), vec!["PWR=1", "INPUT=HDMI1"]);
        assert_eq!(acc.buffered_len().unwrap(), 4);
    }

    #[test]
    fn test_empty_frames_are_emitted() {
        let acc = FrameAccumulator::new(FramingRule::lf(), 1024).unwrap();
        let frames = acc.feed(b"a\n\n\nb\n").unwrap();
        assert_eq!(texts(&frames), vec!["a", "", "", "b"]);
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let acc = FrameAccumulator::new(FramingRule::crlf(), 1024).unwrap();

        assert!(acc.feed(b"OK\r").unwrap().is_empty());
        assert_eq!(texts(&acc.feed(b"\nNEXT").unwrap()), vec!["OK"]);
        assert!(acc.feed(b"\r").unwrap().is_empty());
        assert_eq!(texts(&acc.feed(b"\n").unwrap()), vec!["NEXT"]);
        assert_eq!(acc.buffered_len().unwrap(), 0);
    }

    #[test]
    fn test_lone_delimiter_prefix_is_data() {
        let acc = FrameAccumulator::new(FramingRule::crlf(), 1024).unwrap();
        assert_eq!(texts(&acc.feed(b"A\rB\r\n").unwrap()), vec!["A\rB"]);
    }

    #[test]
    fn test_fixed_length_frames() {
        let acc = FrameAccumulator::new(FramingRule::fixed(3), 1024).unwrap();

        assert_eq!(acc.feed(&[0x81, 0x01]).unwrap().len(), 0);
        let frames = acc.feed(&[0xFF, 0x90, 0x41, 0xFF, 0x90]).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &[0x81, 0x01, 0xFF]);
        assert_eq!(&frames[1][..], &[0x90, 0x41, 0xFF]);
        assert_eq!(acc.pending().unwrap(), Bytes::from_static(&[0x90]));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(matches!(
            FrameAccumulator::new(FramingRule::delimiter(Bytes::new()), 16),
            Err(LinkError::Configuration(_))
        ));
        assert!(matches!(
            FrameAccumulator::new(FramingRule::fixed(0), 16),
            Err(LinkError::Configuration(_))
        ));
        assert!(matches!(
            FrameAccumulator::new(FramingRule::lf(), 0),
            Err(LinkError::Configuration(_))
        ));
    }

    #[test]
    fn test_overflow_discards_remainder_but_keeps_frames() {
        let acc = FrameAccumulator::new(FramingRule::lf(), 4).unwrap();

        let mut seen = Vec::new();
        let result = acc.feed_with(b"ok\n0123456789", |f| seen.push(f));

        assert!(matches!(
            result,
            Err(LinkError::FramingOverflow { buffered: 10, limit: 4 })
        ));
        assert_eq!(texts(&seen), vec!["ok"]);
        assert_eq!(acc.buffered_len().unwrap(), 0);

        // The accumulator is usable again after the overflow.
        assert_eq!(texts(&acc.feed(b"next\n").unwrap()), vec!["next"]);
    }

    #[test]
    fn test_callback_runs_outside_lock() {
        let acc = FrameAccumulator::new(FramingRule::lf(), 64).unwrap();
        let mut lens = Vec::new();

        // Re-entering the accumulator from the callback must not deadlock.
        let count = acc
            .feed_with(b"x\ny\nrest", |_| lens.push(acc.buffered_len().unwrap()))
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(lens, vec![4, 4]);
    }

    #[test]
    fn test_clear() {
        let acc = FrameAccumulator::new(FramingRule::lf(), 64).unwrap();
        acc.feed(b"partial").unwrap();
        acc.clear().unwrap();
        assert_eq!(texts(&acc.feed(b"\n").unwrap()), vec![""]);
    }

    #[test]
    fn test_concurrent_feeds_keep_frames_whole() {
        let acc = std::sync::Arc::new(FrameAccumulator::new(FramingRule::lf(), 4096).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    let mut count = 0;
                    for i in 0..50 {
                        let line = format!("w{}-{}\n", worker, i);
                        count += acc.feed(line.as_bytes()).unwrap().len();
                    }
                    count
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 200);
        assert_eq!(acc.buffered_len().unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_split_points_do_not_change_frames(
            lines in proptest::collection::vec("[A-Z0-9=]{0,12}", 1..8),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let stream: Vec<u8> = lines
                .iter()
                .flat_map(|l| l.bytes().chain(b"\r\n".iter().copied()))
                .collect();

            let mut offsets: Vec<usize> = cuts.iter().map(|c| c.index(stream.len() + 1)).collect();
            offsets.push(0);
            offsets.push(stream.len());
            offsets.sort_unstable();
            offsets.dedup();

            let acc = FrameAccumulator::new(FramingRule::crlf(), 4096).unwrap();
            let mut frames = Vec::new();
            for window in offsets.windows(2) {
                frames.extend(acc.feed(&stream[window[0]..window[1]]).unwrap());
            }

            prop_assert_eq!(texts(&frames), lines);
            prop_assert_eq!(acc.buffered_len().unwrap(), 0);
        }
    }
}
