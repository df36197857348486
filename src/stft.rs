use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::{FingerprintError, Result};

/// Complex spectrum per frame, in frame order
pub type Spectrogram = Vec<Vec<Complex<f64>>>;

/// Short-time Fourier transform
///
/// Frame `i` covers samples `[i * frame_shift, i * frame_shift + frame_len)`.
/// A trailing partial frame is dropped. Each frame is Hann windowed and
/// transformed with an unnormalized FFT; only the non-negative half of the
/// spectrum (`frame_len / 2 + 1` bins) is kept.
#[derive(Clone)]
pub struct Stft {
    frame_shift: usize,
    frame_len: usize,
    window: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
}

impl Stft {
    /// Creates a transform and plans its FFT
    ///
    /// # Arguments
    /// * `frame_shift` - Hop between frame starts, in samples
    /// * `frame_len` - Frame and FFT length, in samples
    pub fn new(frame_shift: usize, frame_len: usize) -> Result<Self> {
        if frame_shift == 0 {
            return Err(FingerprintError::InvalidParameter(
                "frame_shift must be positive".into(),
            ));
        }
        if frame_len == 0 {
            return Err(FingerprintError::InvalidParameter(
                "frame_len must be positive".into(),
            ));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_len);

        Ok(Stft {
            frame_shift,
            frame_len,
            window: hann_window(frame_len),
            fft,
        })
    }

    pub fn frame_shift(&self) -> usize {
        self.frame_shift
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Number of bins in each output frame
    pub fn num_bins(&self) -> usize {
        self.frame_len / 2 + 1
    }

    /// Number of complete frames that fit in `input`
    pub fn num_frames(&self, input: &[f64]) -> usize {
        if input.len() < self.frame_len {
            return 0;
        }
        (input.len() - self.frame_len) / self.frame_shift + 1
    }

    /// Frame `index` of `input`, borrowed without copying.
    /// `None` when the frame does not lie fully inside `input`.
    pub fn frame_at<'a>(&self, input: &'a [f64], index: usize) -> Option<&'a [f64]> {
        let start = index.checked_mul(self.frame_shift)?;
        let end = start.checked_add(self.frame_len)?;
        input.get(start..end)
    }

    /// Windowed spectrum of frame `index`, `None` past the last complete frame.
    pub fn frame_spectrum(&self, input: &[f64], index: usize) -> Option<Vec<Complex<f64>>> {
        let frame = self.frame_at(input, index)?;

        let mut buffer: Vec<Complex<f64>> = frame
            .iter()
            .zip(&self.window)
            .map(|(&x, &w)| Complex::new(x * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        buffer.truncate(self.num_bins());
        Some(buffer)
    }

    /// Computes the complex spectrogram of `input`
    ///
    /// # Returns
    /// * One spectrum per complete frame; empty when `input` is shorter than a frame
    /// * InvalidParameter for an empty `input`
    pub fn transform(&self, input: &[f64]) -> Result<Spectrogram> {
        if input.is_empty() {
            return Err(FingerprintError::InvalidParameter(
                "cannot transform an empty sample sequence".into(),
            ));
        }

        Ok((0..self.num_frames(input))
            .map_while(|index| self.frame_spectrum(input, index))
            .collect())
    }
}

/// Symmetric Hann window: `0.5 * (1 - cos(2πi / (n - 1)))`
pub fn hann_window(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f64;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / denom).cos()))
        .collect()
}

pub fn magnitudes(spectrum: &[Complex<f64>]) -> Vec<f64> {
    spectrum.iter().map(|c| c.norm()).collect()
}

/// Splits a complex spectrum into amplitude `|X(k)|` and phase `arg X(k)`.
pub fn split_spectrum(spectrum: &[Complex<f64>]) -> (Vec<f64>, Vec<f64>) {
    spectrum.iter().map(|c| (c.norm(), c.im.atan2(c.re))).unzip()
}

pub fn split_spectrogram(spectrogram: &[Vec<Complex<f64>>]) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    spectrogram.iter().map(|frame| split_spectrum(frame)).unzip()
}
