//! Linear PCM resampling.
//!
//! Inference models run at fixed rates (typically 16 kHz); room audio
//! arrives at whatever the client negotiated. Linear interpolation is
//! sufficient for speech-model input.

use crate::audio::AudioFrame;

/// Stateless linear resampler between two fixed rates.
pub struct AudioResampler {
    input_rate: u32,
    output_rate: u32,
}

impl AudioResampler {
    /// Create a resampler from `input_rate` to `output_rate` Hz.
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate: input_rate.max(1),
            output_rate: output_rate.max(1),
        }
    }

    /// Resample a mono frame to the output rate.
    ///
    /// Multi-channel input is mixed down to mono first; inference paths
    /// always run on mono audio.
    pub fn resample(&self, frame: &AudioFrame) -> AudioFrame {
        let mono = frame.mixed_to_mono();
        if self.input_rate == self.output_rate {
            return mono;
        }
        let out = resample_linear(&mono.data, self.input_rate, self.output_rate);
        AudioFrame::new(out, self.output_rate, 1)
    }
}

/// Linear-interpolation resampling of a mono sample buffer.
pub fn resample_linear(samples: &[i16], input_rate: u32, output_rate: u32) -> Vec<i16> {
    if samples.is_empty() || input_rate == output_rate {
        return samples.to_vec();
    }
    let ratio = f64::from(input_rate) / f64::from(output_rate);
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = pos - pos.floor();
        let a = f64::from(samples[idx]);
        let b = f64::from(samples[(idx + 1).min(samples.len() - 1)]);
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_rates_match() {
        let r = AudioResampler::new(16_000, 16_000);
        let frame = AudioFrame::new(vec![1, 2, 3], 16_000, 1);
        assert_eq!(r.resample(&frame).data, vec![1, 2, 3]);
    }

    #[test]
    fn downsample_halves_length() {
        let samples: Vec<i16> = (0..100).collect();
        let out = resample_linear(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 50);
        // Every other input sample survives exactly.
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 2);
    }

    #[test]
    fn upsample_interpolates() {
        let out = resample_linear(&[0, 100], 16_000, 32_000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50);
    }

    #[test]
    fn stereo_input_is_mixed_before_resampling() {
        let r = AudioResampler::new(16_000, 16_000);
        let frame = AudioFrame::new(vec![100, 200, 100, 200], 16_000, 2);
        let out = r.resample(&frame);
        assert_eq!(out.channels, 1);
        assert_eq!(out.data, vec![150, 150]);
    }
}
