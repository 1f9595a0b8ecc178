//! Fixed-size audio reframing.
//!
//! Downstream models expect uniform windows; `AudioByteStream` accumulates
//! arbitrarily-chunked PCM16 input and re-emits frames of exactly
//! `samples_per_frame` samples per channel, padding the final frame on
//! flush.

use crate::audio::AudioFrame;
use crate::error::{Result, VoxaError};

/// Accumulates PCM16 samples and emits fixed-size frames.
pub struct AudioByteStream {
    sample_rate: u32,
    channels: u16,
    samples_per_frame: usize,
    buf: Vec<i16>,
}

impl AudioByteStream {
    /// Create a reframer emitting `samples_per_frame` samples per channel.
    pub fn new(sample_rate: u32, channels: u16, samples_per_frame: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            samples_per_frame: samples_per_frame.max(1),
            buf: Vec::new(),
        }
    }

    /// Push interleaved samples, returning any complete frames.
    ///
    /// # Errors
    ///
    /// Returns an error if a single write exceeds the frame window — the
    /// caller is expected to chunk input below the window size.
    pub fn write(&mut self, samples: &[i16]) -> Result<Vec<AudioFrame>> {
        let window = self.samples_per_frame * self.channels as usize;
        if samples.len() > window {
            return Err(VoxaError::Channel(format!(
                "write of {} samples exceeds frame window of {}",
                samples.len(),
                window
            )));
        }
        self.buf.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buf.len() >= window {
            let rest = self.buf.split_off(window);
            let data = std::mem::replace(&mut self.buf, rest);
            frames.push(AudioFrame::new(data, self.sample_rate, self.channels));
        }
        Ok(frames)
    }

    /// Emit the remaining samples as one zero-padded final frame.
    ///
    /// Returns `None` when nothing is buffered.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.buf.is_empty() {
            return None;
        }
        let window = self.samples_per_frame * self.channels as usize;
        let mut data = std::mem::take(&mut self.buf);
        data.resize(window, 0);
        Some(AudioFrame::new(data, self.sample_rate, self.channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_fixed_size_frames() {
        let mut stream = AudioByteStream::new(16_000, 1, 4);
        let frames = stream.write(&[1, 2, 3]).unwrap();
        assert!(frames.is_empty());
        let frames = stream.write(&[4, 5, 6]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn flush_pads_final_frame() {
        let mut stream = AudioByteStream::new(16_000, 1, 4);
        stream.write(&[7, 8]).unwrap();
        let last = stream.flush().unwrap();
        assert_eq!(last.data, vec![7, 8, 0, 0]);
        assert!(stream.flush().is_none());
    }

    #[test]
    fn oversized_write_errors() {
        let mut stream = AudioByteStream::new(16_000, 1, 4);
        assert!(stream.write(&[0; 5]).is_err());
    }

    #[test]
    fn respects_channel_count() {
        let mut stream = AudioByteStream::new(16_000, 2, 2);
        let frames = stream.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channels, 2);
        assert_eq!(frames[0].samples_per_channel, 2);
    }
}
