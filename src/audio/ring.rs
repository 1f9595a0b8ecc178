//! Sliding audio buffer for the interruption-detector context window.
//!
//! Holds the most recent `capacity` mono samples. A segment mark tracks
//! where the current overlap segment begins; when the buffer overflows, it
//! slides left and the mark decrements correspondingly so it keeps pointing
//! at the same sample.

/// Fixed-capacity sliding buffer of mono PCM16 samples.
pub struct AudioRingBuffer {
    data: Vec<i16>,
    capacity: usize,
    start_idx: usize,
}

impl AudioRingBuffer {
    /// Create a buffer holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            start_idx: 0,
        }
    }

    /// Append samples, sliding the buffer left on overflow.
    pub fn push(&mut self, samples: &[i16]) {
        self.data.extend_from_slice(samples);
        if self.data.len() > self.capacity {
            let excess = self.data.len() - self.capacity;
            self.data.drain(..excess);
            self.start_idx = self.start_idx.saturating_sub(excess);
        }
    }

    /// Move the segment mark to the current end of the buffer.
    ///
    /// Everything before the mark becomes rewindable history.
    pub fn mark_end(&mut self) {
        self.start_idx = self.data.len();
    }

    /// Begin a segment that includes up to `context_samples` of history
    /// before the current mark, discarding anything older.
    ///
    /// After the call the buffer starts exactly `min(mark, context_samples)`
    /// samples before the previous mark position.
    pub fn start_segment(&mut self, context_samples: usize) {
        let keep = self.start_idx.min(context_samples);
        let drop = self.start_idx - keep;
        self.data.drain(..drop);
        self.start_idx = keep;
    }

    /// All buffered samples from the start of the current segment's context.
    pub fn segment_audio(&self) -> &[i16] {
        &self.data
    }

    /// Samples buffered after the segment mark.
    pub fn samples_since_mark(&self) -> usize {
        self.data.len().saturating_sub(self.start_idx)
    }

    /// The segment mark index.
    pub fn start_idx(&self) -> usize {
        self.start_idx
    }

    /// Total buffered samples.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop all samples and reset the mark.
    pub fn reset(&mut self) {
        self.data.clear();
        self.start_idx = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_slides_left_and_decrements_mark() {
        let mut buf = AudioRingBuffer::new(4);
        buf.push(&[1, 2, 3]);
        buf.mark_end();
        assert_eq!(buf.start_idx(), 3);
        buf.push(&[4, 5]);
        // Capacity 4: sample `1` dropped, mark slides from 3 to 2.
        assert_eq!(buf.segment_audio(), &[2, 3, 4, 5]);
        assert_eq!(buf.start_idx(), 2);
    }

    #[test]
    fn start_segment_keeps_bounded_context() {
        let mut buf = AudioRingBuffer::new(100);
        buf.push(&[0; 50]);
        buf.mark_end();
        buf.start_segment(10);
        // 40 stale samples dropped; 10 context samples retained at the front.
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.start_idx(), 10);
    }

    #[test]
    fn start_segment_clamps_to_available_history() {
        let mut buf = AudioRingBuffer::new(100);
        buf.push(&[0; 5]);
        buf.mark_end();
        buf.start_segment(1_000);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.start_idx(), 5);
    }

    #[test]
    fn samples_since_mark_counts_new_audio() {
        let mut buf = AudioRingBuffer::new(100);
        buf.push(&[0; 5]);
        buf.mark_end();
        buf.push(&[0; 7]);
        assert_eq!(buf.samples_since_mark(), 7);
    }

    #[test]
    fn reset_clears_everything() {
        let mut buf = AudioRingBuffer::new(10);
        buf.push(&[1, 2, 3]);
        buf.mark_end();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.start_idx(), 0);
    }
}
