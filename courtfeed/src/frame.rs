//! JPEG frame extraction and buffering.
//!
//! The upstream feed (camera or encoder stdout) is a raw byte stream in which
//! complete JPEG images are delimited by the SOI (`FFD8`) and EOI (`FFD9`)
//! markers. Multipart boundary lines between frames fall outside the markers
//! and are skipped naturally by the scan.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Mutex;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Incremental scanner that turns an arbitrary chunking of the byte stream
/// into complete JPEG frames.
///
/// Bytes after the last complete frame stay pending for the next `push`. If
/// the pending buffer grows past `scan_limit` without a complete frame, it is
/// discarded so a malformed source cannot grow memory without bound.
pub struct FrameExtractor {
    pending: BytesMut,
    scan_limit: usize,
}

impl FrameExtractor {
    pub fn new(scan_limit: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            scan_limit,
        }
    }

    /// Feed one received chunk, returning every complete frame it closed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            let Some(start) = find(&self.pending, &SOI, 0) else {
                break;
            };
            let Some(end) = find(&self.pending, &EOI, start + 2) else {
                // Drop garbage before the SOI so the limit check below only
                // measures the unfinished frame.
                if start > 0 {
                    let _ = self.pending.split_to(start);
                }
                break;
            };

            let _ = self.pending.split_to(start);
            let frame = self.pending.split_to(end + 2 - start).freeze();
            frames.push(frame);
        }

        if self.pending.len() > self.scan_limit {
            tracing::warn!(
                "discarding {} pending bytes without a complete frame",
                self.pending.len()
            );
            self.pending.clear();
        }

        frames
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < 2 || from + 2 > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Bounded ring of the most recent frames, tagged with a monotonic sequence.
///
/// Single writer (the capture loop), any number of readers. Readers receive
/// `Bytes` clones — a frame is published by replacing the reference, so a
/// reader can observe skips but never a partially written frame.
pub struct FrameRing {
    inner: Mutex<RingInner>,
    capacity: usize,
}

struct RingInner {
    frames: VecDeque<(u64, Bytes)>,
    next_seq: u64,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                frames: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append a frame, evicting the oldest when full. Returns its sequence.
    pub fn push(&self, frame: Bytes) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        if inner.frames.len() == self.capacity {
            inner.frames.pop_front();
        }
        inner.frames.push_back((seq, frame));
        seq
    }

    /// Most recent frame, if any.
    pub fn latest(&self) -> Option<(u64, Bytes)> {
        self.inner.lock().unwrap().frames.back().cloned()
    }

    /// Frames newer than `seq`, oldest first. Lets a bursty consumer catch
    /// up at its own cadence independent of the producer's.
    pub fn since(&self, seq: u64) -> Vec<(u64, Bytes)> {
        self.inner
            .lock()
            .unwrap()
            .frames
            .iter()
            .filter(|(s, _)| *s > seq)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }

    #[test]
    fn one_frame_then_garbage_leaves_garbage_pending() {
        let mut extractor = FrameExtractor::new(1024 * 1024);
        let mut stream = jpeg(b"image data");
        stream.extend_from_slice(b"trailing garbage");

        let frames = extractor.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..2], &[0xFF, 0xD8]);
        assert_eq!(&frames[0][frames[0].len() - 2..], &[0xFF, 0xD9]);
        // The garbage stays pending rather than being discarded.
        assert_eq!(extractor.pending_len(), b"trailing garbage".len());
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut extractor = FrameExtractor::new(1024 * 1024);
        let frame = jpeg(&[0u8; 100]);
        let (a, b) = frame.split_at(40);

        assert!(extractor.push(a).is_empty());
        let frames = extractor.push(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), frame.len());
        assert_eq!(extractor.pending_len(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut extractor = FrameExtractor::new(1024 * 1024);
        let mut stream = jpeg(b"first");
        stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        stream.extend_from_slice(&jpeg(b"second"));

        let frames = extractor.push(&stream);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn oversized_pending_buffer_is_discarded() {
        let mut extractor = FrameExtractor::new(64);
        let mut stream = vec![0xFF, 0xD8];
        stream.extend_from_slice(&[0u8; 200]); // SOI but never an EOI

        assert!(extractor.push(&stream).is_empty());
        assert_eq!(extractor.pending_len(), 0);

        // Extraction resumes cleanly on the next complete frame.
        let frames = extractor.push(&jpeg(b"recovered"));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn ring_evicts_oldest_and_tracks_sequence() {
        let ring = FrameRing::new(3);
        for i in 0..5u8 {
            ring.push(Bytes::from(vec![i]));
        }
        assert_eq!(ring.len(), 3);
        let (seq, frame) = ring.latest().unwrap();
        assert_eq!(seq, 4);
        assert_eq!(frame[0], 4);

        let newer = ring.since(2);
        assert_eq!(newer.len(), 2);
        assert_eq!(newer[0].0, 3);
        assert_eq!(newer[1].0, 4);
    }
}
