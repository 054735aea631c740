//! Reassembly of notification chunks into prompt-delimited frames.
//!
//! The adapter ends every reply with a `>` prompt. Chunk boundaries carry no
//! meaning, so the assembler works byte by byte: feeding a stream in one
//! piece or split at arbitrary points produces the same frames.

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::transport::RawChunk;

/// Prompt byte that terminates every adapter reply.
pub const PROMPT: u8 = b'>';

/// Default cap on bytes buffered without seeing a prompt.
pub const DEFAULT_FRAME_CAPACITY: usize = 512;

/// One complete adapter reply, without the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    content: String,
    completed_at: Instant,
}

impl Frame {
    /// Build a frame from the bytes between two prompts.
    ///
    /// NUL bytes are removed and surrounding whitespace trimmed. Returns
    /// `None` if nothing is left.
    pub fn from_raw(raw: &[u8], completed_at: Instant) -> Option<Self> {
        let cleaned: Vec<u8> = raw.iter().copied().filter(|&b| b != 0).collect();
        let content = String::from_utf8_lossy(&cleaned).trim().to_string();

        if content.is_empty() {
            return None;
        }

        Some(Self {
            content,
            completed_at,
        })
    }

    /// Frame text with surrounding whitespace removed.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Arrival time of the chunk that carried the prompt.
    pub fn completed_at(&self) -> Instant {
        self.completed_at
    }

    /// Non-empty lines of the frame, trimmed.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.content
            .split(|c| c == '\r' || c == '\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

/// Something the assembler produced from a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete frame.
    Frame(Frame),
    /// The buffer passed its cap without a prompt and was discarded.
    Overflow {
        /// Number of bytes discarded.
        discarded: usize,
    },
}

/// Buffers notification bytes until a prompt arrives.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    capacity: usize,
}

impl FrameAssembler {
    /// Create an assembler with [`DEFAULT_FRAME_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FRAME_CAPACITY)
    }

    /// Create an assembler with a custom buffer cap.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Consume a chunk and return the frames it completed.
    pub fn feed(&mut self, chunk: RawChunk) -> Vec<FrameEvent> {
        let mut events = Vec::new();

        for &byte in chunk.data() {
            if byte == PROMPT {
                match Frame::from_raw(&self.buffer, chunk.received_at()) {
                    Some(frame) => {
                        trace!("Frame complete: {:?}", frame.content());
                        events.push(FrameEvent::Frame(frame));
                    }
                    None => trace!("Discarding empty prompt"),
                }
                self.buffer.clear();
                continue;
            }

            self.buffer.push(byte);

            if self.buffer.len() > self.capacity {
                let discarded = self.buffer.len();
                debug!(
                    "No prompt after {} bytes, discarding frame buffer",
                    discarded
                );
                self.buffer.clear();
                events.push(FrameEvent::Overflow { discarded });
            }
        }

        events
    }

    /// Bytes buffered towards the next frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn contents(events: &[FrameEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| match event {
                FrameEvent::Frame(frame) => frame.content().to_string(),
                FrameEvent::Overflow { discarded } => format!("<overflow {}>", discarded),
            })
            .collect()
    }

    fn feed_split(assembler: &mut FrameAssembler, stream: &[u8], cuts: &[usize]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            let cut = cut.clamp(start, stream.len());
            events.extend(assembler.feed(RawChunk::new(stream[start..cut].to_vec())));
            start = cut;
        }
        events.extend(assembler.feed(RawChunk::new(stream[start..].to_vec())));
        events
    }

    #[test]
    fn test_single_frame() {
        let mut assembler = FrameAssembler::new();
        let events = assembler.feed(RawChunk::new(&b"41 0D 32\r\r>"[..]));
        assert_eq!(contents(&events), vec!["41 0D 32"]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.feed(RawChunk::new(&b"ATZ\r\rELM3"[..])).is_empty());
        assert_eq!(assembler.pending(), 9);

        let events = assembler.feed(RawChunk::new(&b"27 v1.5\r\r>"[..]));
        assert_eq!(contents(&events), vec!["ATZ\r\rELM327 v1.5"]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut assembler = FrameAssembler::new();
        let events = assembler.feed(RawChunk::new(&b"OK\r>41 0C 1A F8\r>41"[..]));
        assert_eq!(contents(&events), vec!["OK", "41 0C 1A F8"]);
        assert_eq!(assembler.pending(), 2);
    }

    #[test]
    fn test_empty_prompts_discarded() {
        let mut assembler = FrameAssembler::new();
        let events = assembler.feed(RawChunk::new(&b">\r\n>  >\0>"[..]));
        assert!(events.is_empty());
    }

    #[test]
    fn test_nul_bytes_stripped() {
        let mut assembler = FrameAssembler::new();
        let events = assembler.feed(RawChunk::new(&b"\0OK\0\r>"[..]));
        assert_eq!(contents(&events), vec!["OK"]);
    }

    #[test]
    fn test_overflow_resets_buffer() {
        let mut assembler = FrameAssembler::with_capacity(8);
        let events = assembler.feed(RawChunk::new(&b"0123456789"[..]));
        assert_eq!(events, vec![FrameEvent::Overflow { discarded: 9 }]);
        assert_eq!(assembler.pending(), 1);

        let events = assembler.feed(RawChunk::new(&b"OK>"[..]));
        assert_eq!(contents(&events), vec!["9OK"]);
    }

    #[test]
    fn test_frame_lines() {
        let frame = Frame::from_raw(b"ATZ\r\r\nELM327 v1.5\r\r", Instant::now()).unwrap();
        let lines: Vec<_> = frame.lines().collect();
        assert_eq!(lines, vec!["ATZ", "ELM327 v1.5"]);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let mut assembler = FrameAssembler::new();
        assembler.feed(RawChunk::new(&b"41 0C"[..]));
        assembler.reset();
        let events = assembler.feed(RawChunk::new(&b"OK>"[..]));
        assert_eq!(contents(&events), vec!["OK"]);
    }

    proptest! {
        #[test]
        fn prop_chunking_invariance(
            stream in proptest::collection::vec(
                prop_oneof![
                    Just(b'>'),
                    Just(b'\r'),
                    Just(b' '),
                    Just(0u8),
                    any::<u8>(),
                ],
                0..200,
            ),
            cuts in proptest::collection::vec(0usize..200, 0..12),
        ) {
            let mut cuts = cuts;
            cuts.sort_unstable();

            let mut whole = FrameAssembler::with_capacity(32);
            let expected = contents(&whole.feed(RawChunk::new(stream.clone())));

            let mut split = FrameAssembler::with_capacity(32);
            let actual = contents(&feed_split(&mut split, &stream, &cuts));

            prop_assert_eq!(actual, expected);
            prop_assert_eq!(split.pending(), whole.pending());
        }
    }
}
