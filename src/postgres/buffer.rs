use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Growable byte queue fed with arbitrarily sized chunks.
///
/// Positions are absolute: `position()` counts every byte ever consumed,
/// and frame ends recorded with [`ByteQueue::mark_frame_end`] are stored as
/// absolute offsets so they survive partial consumption.
#[derive(Debug, Default)]
pub struct ByteQueue {
    buf: BytesMut,
    position: u64,
    frame_ends: VecDeque<u64>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Records that the frame currently being pushed ends after the last
    /// pushed byte.
    pub fn mark_frame_end(&mut self) {
        let end = self.position + self.buf.len() as u64;
        if self.frame_ends.back() != Some(&end) {
            self.frame_ends.push_back(end);
        }
    }

    pub fn available(&self) -> usize {
        self.buf.len()
    }

    pub fn has(&self, n: usize) -> bool {
        self.buf.len() >= n
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// The first `n` buffered bytes, without consuming them.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        self.buf.get(..n)
    }

    pub fn take_exact(&mut self, n: usize) -> Option<Bytes> {
        if !self.has(n) {
            return None;
        }
        self.position += n as u64;
        Some(self.buf.split_to(n).freeze())
    }

    pub fn take_remaining(&mut self) -> Bytes {
        self.position += self.buf.len() as u64;
        self.buf.split().freeze()
    }

    /// Bytes left before the end of the current frame, if that end has
    /// already been marked.
    pub fn frame_remaining(&self) -> Option<usize> {
        self.frame_ends
            .iter()
            .find(|&&end| end >= self.position)
            .map(|&end| (end - self.position) as usize)
    }

    /// Forgets frame ends at or behind the read position.
    ///
    /// Called at message boundaries so that an exhausted frame does not
    /// delimit the next one.
    pub fn discard_finished_frames(&mut self) {
        while let Some(&end) = self.frame_ends.front() {
            if end > self.position {
                break;
            }
            self.frame_ends.pop_front();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
