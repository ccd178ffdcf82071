//! Frame ring between the network producer and the audio device callback
//!
//! A byte buffer with a parallel frame counter behind one mutex. Writes
//! are never capped; the cap is enforced at read time by discarding from
//! the oldest end, which keeps playback latency bounded when the device
//! drains slower than the network fills.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct FrameBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    buffer: VecDeque<u8>,
    frame_count: usize,
    max_frame_count: usize,
    bytes_per_frame: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_count: usize, bytes_per_frame: usize) -> Self {
        assert!(bytes_per_frame >= 1, "frames must be at least one byte");
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                frame_count: 0,
                max_frame_count,
                bytes_per_frame,
            }),
        }
    }

    /// Append `frames` frames of audio. `data` must be whole frames
    /// (`frames * bytes_per_frame` bytes).
    pub fn write(&self, data: &[u8], frames: usize) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(data.len(), frames * inner.bytes_per_frame);
        inner.buffer.extend(data);
        inner.frame_count += frames;
    }

    /// Read up to `frames` frames, discarding the oldest overflow first.
    ///
    /// Returns `(bytes, frames_returned, frames_dropped)`.
    pub fn read(&self, frames: usize) -> (Vec<u8>, usize, usize) {
        self.read_with(frames, true)
    }

    /// Like [`read`](Self::read), with the drop-oldest step optional
    pub fn read_with(&self, frames: usize, drop_excess: bool) -> (Vec<u8>, usize, usize) {
        let mut inner = self.inner.lock();

        let dropped = if drop_excess {
            inner.frame_count.saturating_sub(inner.max_frame_count)
        } else {
            0
        };
        let skip = dropped * inner.bytes_per_frame;
        inner.buffer.drain(..skip);

        let available = inner.frame_count - dropped;
        let served = frames.min(available);
        let take = served * inner.bytes_per_frame;
        let bytes: Vec<u8> = inner.buffer.drain(..take).collect();
        inner.frame_count = available - served;

        (bytes, served, dropped)
    }

    /// Atomically clear the buffer and switch to a new frame width
    pub fn synchronize(&self, bytes_per_frame: usize) {
        assert!(bytes_per_frame >= 1, "frames must be at least one byte");
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.frame_count = 0;
        inner.bytes_per_frame = bytes_per_frame;
    }

    /// Current `(bytes, frames)` held
    pub fn size(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.buffer.len(), inner.frame_count)
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.inner.lock().bytes_per_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_write_then_read() {
        let ring = FrameBuffer::new(100, 2);
        ring.write(&[1, 2, 3, 4], 2);
        assert_eq!(ring.size(), (4, 2));

        let (bytes, served, dropped) = ring.read(1);
        assert_eq!(bytes, vec![1, 2]);
        assert_eq!(served, 1);
        assert_eq!(dropped, 0);
        assert_eq!(ring.size(), (2, 1));
    }

    #[test]
    fn test_overflow_drops_oldest_at_read() {
        let ring = FrameBuffer::new(2, 2);
        ring.write(&[1, 1], 1);
        ring.write(&[2, 2], 1);
        ring.write(&[3, 3], 1);

        let (bytes, served, dropped) = ring.read(1);
        assert_eq!(bytes, vec![2, 2]);
        assert_eq!(served, 1);
        assert_eq!(dropped, 1);
        assert_eq!(ring.size(), (2, 1));
    }

    #[test]
    fn test_read_without_drop_keeps_overflow() {
        let ring = FrameBuffer::new(1, 2);
        ring.write(&[1, 1, 2, 2, 3, 3], 3);

        let (bytes, served, dropped) = ring.read_with(1, false);
        assert_eq!(bytes, vec![1, 1]);
        assert_eq!(served, 1);
        assert_eq!(dropped, 0);
        assert_eq!(ring.size(), (4, 2));
    }

    #[test]
    fn test_read_more_than_available() {
        let ring = FrameBuffer::new(100, 4);
        ring.write(&[9; 8], 2);

        let (bytes, served, dropped) = ring.read(5);
        assert_eq!(bytes.len(), 8);
        assert_eq!(served, 2);
        assert_eq!(dropped, 0);
        assert_eq!(ring.size(), (0, 0));
    }

    #[test]
    fn test_synchronize_clears_and_rewidths() {
        let ring = FrameBuffer::new(100, 2);
        ring.write(&[1, 2, 3, 4], 2);

        ring.synchronize(8);
        assert_eq!(ring.size(), (0, 0));
        assert_eq!(ring.bytes_per_frame(), 8);

        let (bytes, served, dropped) = ring.read(4);
        assert!(bytes.is_empty());
        assert_eq!((served, dropped), (0, 0));
    }

    #[test]
    fn test_returned_bytes_are_a_suffix_aligned_prefix() {
        // Concatenated reads equal the concatenated writes minus the
        // dropped prefix.
        let ring = FrameBuffer::new(4, 2);
        let writes: &[&[u8]] = &[&[1, 1], &[2, 2, 3, 3], &[4, 4, 5, 5, 6, 6]];
        for chunk in writes {
            ring.write(chunk, chunk.len() / 2);
        }

        let (bytes, served, dropped) = ring.read(10);
        let all: Vec<u8> = writes.concat();
        assert_eq!(bytes, all[dropped * 2..dropped * 2 + served * 2].to_vec());
        let (remaining_bytes, remaining_frames) = ring.size();
        assert_eq!(remaining_bytes, remaining_frames * 2);
    }

    #[test]
    fn test_bytes_always_track_frames() {
        let ring = FrameBuffer::new(3, 4);
        for i in 0..6 {
            ring.write(&[i; 4], 1);
            let (bytes, frames) = ring.size();
            assert_eq!(bytes, frames * 4);
        }
        ring.read(2);
        let (bytes, frames) = ring.size();
        assert_eq!(bytes, frames * 4);
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        use std::sync::Arc;

        let ring = Arc::new(FrameBuffer::new(1000, 1));
        let writer_ring = ring.clone();
        let writer = std::thread::spawn(move || {
            for _ in 0..100 {
                writer_ring.write(&[1], 1);
            }
        });

        let mut read_total = 0;
        for _ in 0..200 {
            let (_, served, dropped) = ring.read(5);
            read_total += served;
            assert_eq!(dropped, 0);
        }
        writer.join().unwrap();

        let (_, leftover) = ring.size();
        assert_eq!(read_total + leftover, 100);
    }
}
