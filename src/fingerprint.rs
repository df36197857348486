use std::collections::HashMap;
use std::time::Instant;

use crate::cancel::CancellationToken;
use crate::config::FingerprintConfig;
use crate::error::{FingerprintError, Result};
use crate::models::{AudioSamples, HashIndex, SongHashLocator};
use crate::stft::{magnitudes, Stft};

/// Peak frequency (Hz) per octave band, 0.0 where the band had no qualifying bin.
/// Has one more element than there are boundary notes.
pub type OctaveBinPeaks = Vec<f64>;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];
const REFERENCE_FREQ: f64 = 440.0;
const REFERENCE_OCTAVE: i32 = 4;
const REFERENCE_NOTE_INDEX: i32 = 9;
const MIN_OCTAVE: i32 = -1;
const MAX_OCTAVE: i32 = 10;

/// Converts a note name to its equal-tempered frequency, with A4 = 440 Hz
///
/// # Arguments
/// * `note` - Letter, optional `#`/`b` accidental and octave, e.g. `C2`, `F#3`, `Bb4`.
///   Octaves run from -1 to 10.
///
/// # Returns
/// * Frequency in Hz, or InvalidParameter for a malformed name
pub fn note_to_frequency(note: &str) -> Result<f64> {
    let invalid = || FingerprintError::InvalidParameter(format!("invalid note name '{}'", note));

    let mut chars = note.chars();
    let letter = chars.next().ok_or_else(invalid)?.to_ascii_uppercase();
    let rest: String = chars.collect();

    let (accidental, octave) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };

    let base = NOTE_NAMES
        .iter()
        .position(|n| n.len() == 1 && n.starts_with(letter))
        .ok_or_else(invalid)? as i32;
    let octave: i32 = octave.parse().map_err(|_| invalid())?;
    if !(MIN_OCTAVE..=MAX_OCTAVE).contains(&octave) {
        return Err(invalid());
    }

    let note_index = base + accidental;
    let exponent = (octave - REFERENCE_OCTAVE) as f64
        + (note_index - REFERENCE_NOTE_INDEX) as f64 / 12.0;

    Ok(REFERENCE_FREQ * 2f64.powf(exponent))
}

/// Octave bands bounded by note frequencies, plus the analysis window.
///
/// Band `i` holds frequencies in `(boundary[i-1], boundary[i]]`; the last band
/// holds everything above the highest boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct OctaveBands {
    boundaries: Vec<f64>,
    min_freq: f64,
    max_freq: f64,
}

impl OctaveBands {
    /// Creates the band layout from boundary note names
    ///
    /// # Arguments
    /// * `notes` - Band boundaries in ascending order, e.g. `["C2", "C3", ..., "C8"]`
    /// * `min_freq` - Lowest frequency considered, in Hz
    /// * `max_freq` - Highest frequency considered, in Hz
    pub fn new<S: AsRef<str>>(notes: &[S], min_freq: f64, max_freq: f64) -> Result<Self> {
        let boundaries = notes
            .iter()
            .map(|n| note_to_frequency(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(OctaveBands {
            boundaries,
            min_freq,
            max_freq,
        })
    }

    pub fn from_config(config: &FingerprintConfig) -> Result<Self> {
        Self::new(&config.band_notes, config.min_freq, config.max_freq)
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    pub fn num_bands(&self) -> usize {
        self.boundaries.len() + 1
    }

    /// First band whose upper bound is >= `freq`
    pub fn band_index(&self, freq: f64) -> usize {
        self.boundaries
            .iter()
            .position(|&b| b >= freq)
            .unwrap_or(self.boundaries.len())
    }

    /// Keeps the loudest in-range frequency of each band.
    ///
    /// Bins are scanned in ascending order and a bin only replaces the
    /// current band maximum when strictly louder, so equal peaks resolve to
    /// the lowest frequency.
    ///
    /// # Arguments
    /// * `frame` - Magnitude per bin; bin `k` sits at `k * sample_rate / (2 * frame.len())` Hz
    /// * `sample_rate` - Sample rate of the analysed audio in Hz
    /// * `min_amplitude` - Bins quieter than this are ignored
    ///
    /// # Returns
    /// * One peak frequency per band, 0.0 for bands without a qualifying bin
    pub fn extract_peaks(&self, frame: &[f64], sample_rate: u32, min_amplitude: f64) -> OctaveBinPeaks {
        let mut band_ampl = vec![0.0; self.num_bands()];
        let mut band_peaks = vec![0.0; self.num_bands()];

        if frame.is_empty() {
            return band_peaks;
        }

        let bin_width = sample_rate as f64 / (2.0 * frame.len() as f64);

        for (k, &m) in frame.iter().enumerate() {
            let freq = k as f64 * bin_width;

            if freq < self.min_freq || freq > self.max_freq {
                continue;
            }
            if m < min_amplitude {
                continue;
            }

            let idx = self.band_index(freq);
            if band_ampl[idx] < m {
                band_ampl[idx] = m;
                band_peaks[idx] = freq;
            }
        }

        band_peaks
    }
}

/// Packs a peak vector into a 64-bit fingerprint.
///
/// Every peak is floored and its lowest bit cleared, so ±1 Hz jitter does not
/// change the result. Values are accumulated base 1000 from the last band to
/// the first. An all-zero vector gives 0, the "no fingerprint" sentinel.
/// Bands that regularly exceed 1000 Hz alias into their neighbours; the
/// encoding is kept as is for index compatibility.
pub fn peaks_hash(peaks: &[f64]) -> u64 {
    peaks.iter().rev().fold(0u64, |h, &peak| {
        let v = (peak as i64 & !1) as u64;
        h.wrapping_mul(1000).wrapping_add(v)
    })
}

/// Frame timestamp in whole milliseconds
pub fn frame_timestamp_ms(frame_index: usize, frame_shift: usize, sample_rate: u32) -> i64 {
    (frame_index as i64 * frame_shift as i64 * 1000) / sample_rate as i64
}

/// Main fingerprinting engine
/// Runs STFT -> octave band peaks -> hash over a sample sequence. Build and
/// query sides must use the same configuration.
#[derive(Clone)]
pub struct AudioFingerprinter {
    config: FingerprintConfig,
    stft: Stft,
    bands: OctaveBands,
}

impl AudioFingerprinter {
    /// Creates a new AudioFingerprinter
    ///
    /// # Arguments
    /// * `config` - Validated here; the STFT plan and band layout are built once and reused
    pub fn new(config: FingerprintConfig) -> Result<Self> {
        config.validate()?;
        let stft = Stft::new(config.frame_shift, config.frame_len)?;
        let bands = OctaveBands::from_config(&config)?;
        Ok(AudioFingerprinter {
            config,
            stft,
            bands,
        })
    }

    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    pub fn bands(&self) -> &OctaveBands {
        &self.bands
    }

    pub fn num_frames(&self, audio: &AudioSamples) -> usize {
        self.stft.num_frames(&audio.samples)
    }

    pub fn extract_peaks(&self, frame: &[f64], sample_rate: u32) -> OctaveBinPeaks {
        self.bands
            .extract_peaks(frame, sample_rate, self.config.min_amplitude)
    }

    /// Hashes every frame of a sample sequence
    ///
    /// # Process
    /// 1. Window and transform each frame
    /// 2. Keep the loudest bin per octave band
    /// 3. Pack the band peaks into one hash, dropping the 0 sentinel
    ///
    /// The token is checked before every frame.
    ///
    /// # Returns
    /// * `(frame index, hash)` pairs in frame order
    pub fn frame_hashes(
        &self,
        audio: &AudioSamples,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, u64)>> {
        if audio.sample_rate == 0 {
            return Err(FingerprintError::InvalidParameter(
                "sample rate must be positive".into(),
            ));
        }
        if audio.is_empty() {
            return Err(FingerprintError::InvalidParameter(
                "cannot fingerprint an empty sample sequence".into(),
            ));
        }

        let t0 = Instant::now();
        let num_frames = self.num_frames(audio);
        let mut hashes = Vec::with_capacity(num_frames);

        for index in 0..num_frames {
            cancel.check()?;

            let Some(spectrum) = self.stft.frame_spectrum(&audio.samples, index) else {
                break;
            };
            let peaks = self.extract_peaks(&magnitudes(&spectrum), audio.sample_rate);
            let hash = peaks_hash(&peaks);
            if hash != 0 {
                hashes.push((index, hash));
            }
        }

        log::debug!(
            "fingerprinted {} frames ({} hashed) in {:?}",
            num_frames,
            hashes.len(),
            t0.elapsed()
        );

        Ok(hashes)
    }

    /// Timestamp-ordered locators, one per frame with a non-zero hash.
    pub fn song_locators(
        &self,
        audio: &AudioSamples,
        song_index: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SongHashLocator>> {
        Ok(self
            .frame_hashes(audio, cancel)?
            .into_iter()
            .map(|(index, hash)| SongHashLocator {
                timestamp_ms: frame_timestamp_ms(index, self.config.frame_shift, audio.sample_rate),
                song_index,
                hash,
            })
            .collect())
    }

    /// Locators grouped by hash, the shape the index is built from.
    pub fn song_hashes(
        &self,
        audio: &AudioSamples,
        song_index: i64,
        cancel: &CancellationToken,
    ) -> Result<HashIndex> {
        let mut hashes: HashIndex = HashMap::new();
        for locator in self.song_locators(audio, song_index, cancel)? {
            hashes.entry(locator.hash).or_default().push(locator);
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn default_bands() -> OctaveBands {
        OctaveBands::from_config(&FingerprintConfig::default()).unwrap()
    }

    #[test]
    fn note_frequencies() {
        assert_abs_diff_eq!(note_to_frequency("A4").unwrap(), 440.0, epsilon = 1e-9);
        assert_abs_diff_eq!(note_to_frequency("C4").unwrap(), 261.6256, epsilon = 1e-3);
        assert_abs_diff_eq!(note_to_frequency("C2").unwrap(), 65.4064, epsilon = 1e-3);
        assert_abs_diff_eq!(note_to_frequency("C8").unwrap(), 4186.009, epsilon = 1e-2);
        assert_abs_diff_eq!(note_to_frequency("F#3").unwrap(), 184.9972, epsilon = 1e-3);
        assert_abs_diff_eq!(
            note_to_frequency("Bb4").unwrap(),
            note_to_frequency("A#4").unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn bad_note_names() {
        for note in ["", "H4", "C", "C#", "Cx4", "C-2147483648", "A2147483647", "C11", "C-2"] {
            assert!(
                matches!(note_to_frequency(note), Err(FingerprintError::InvalidParameter(_))),
                "{:?} should be rejected",
                note
            );
        }
    }

    #[test]
    fn band_assignment() {
        let bands = default_bands();
        assert_eq!(bands.num_bands(), 7);
        assert_eq!(bands.band_index(50.0), 0);
        assert_eq!(bands.band_index(100.0), 1);
        assert_eq!(bands.band_index(bands.boundaries()[1]), 1);
        assert_eq!(bands.band_index(440.0), 3);
        assert_eq!(bands.band_index(4500.0), 6);
    }

    #[test]
    fn peaks_hash_literal() {
        assert_eq!(peaks_hash(&[1.0, 2.0, 3.0, 4.0]), 4002002000);
    }

    #[test]
    fn peaks_hash_jitter_tolerance() {
        assert_eq!(peaks_hash(&[100.4, 200.9]), peaks_hash(&[101.1, 201.3]));
        assert_eq!(peaks_hash(&[100.0, 200.0]), 200100);
    }

    #[test]
    fn all_zero_peaks_are_the_sentinel() {
        assert_eq!(peaks_hash(&[0.0; 7]), 0);
        assert_eq!(peaks_hash(&[]), 0);
    }

    #[test]
    fn extracts_loudest_bin_per_band() {
        let bands = default_bands();
        let mut frame = vec![0.0; 1025];
        frame[1] = 500.0; // 21.5 Hz, below the analysis window
        frame[9] = 40.0;
        frame[10] = 80.0; // 215.1 Hz, C3..C4
        frame[30] = 60.0; // 645.4 Hz, C5..C6
        frame[31] = 0.5; // below min amplitude
        frame[300] = 900.0; // 6453 Hz, above the analysis window

        let peaks = bands.extract_peaks(&frame, 44100, 1.0);
        let bin = |k: f64| k * (44100.0 / 2050.0);

        assert_eq!(peaks.len(), 7);
        assert_eq!(peaks, vec![0.0, 0.0, bin(10.0), 0.0, bin(30.0), 0.0, 0.0]);
        assert_eq!(peaks_hash(&peaks), 644_000_214_000_000);
    }

    #[test]
    fn equal_peaks_keep_the_first_bin() {
        let bands = default_bands();
        let mut frame = vec![0.0; 1025];
        frame[40] = 10.0;
        frame[41] = 10.0;
        let peaks = bands.extract_peaks(&frame, 44100, 1.0);
        // 860.5 Hz and 881.9 Hz, both between C5 and C6
        assert_eq!(bands.band_index(40.0 * (44100.0 / 2050.0)), 4);
        assert_eq!(bands.band_index(41.0 * (44100.0 / 2050.0)), 4);
        assert_eq!(peaks[4], 40.0 * (44100.0 / 2050.0));
        assert_ne!(peaks[4], 41.0 * (44100.0 / 2050.0));
        assert_eq!(peaks[5], 0.0);
    }

    #[test]
    fn silent_frame_has_no_peaks() {
        let bands = default_bands();
        let peaks = bands.extract_peaks(&vec![0.2; 1025], 44100, 1.0);
        assert!(peaks.iter().all(|&p| p == 0.0));
        assert_eq!(peaks_hash(&peaks), 0);
    }

    #[test]
    fn timestamps_use_integer_milliseconds() {
        assert_eq!(frame_timestamp_ms(0, 441, 44100), 0);
        assert_eq!(frame_timestamp_ms(1, 441, 44100), 10);
        assert_eq!(frame_timestamp_ms(3, 441, 48000), 27);
    }

    fn tone(freq: f64, seconds: f64, sample_rate: u32) -> AudioSamples {
        let len = (seconds * sample_rate as f64) as usize;
        AudioSamples::new(
            (0..len)
                .map(|i| 0.5 * (2.0 * PI * freq * i as f64 / sample_rate as f64).sin())
                .collect(),
            sample_rate,
        )
    }

    #[test]
    fn tone_fingerprint_is_stable() {
        let fingerprinter = AudioFingerprinter::new(FingerprintConfig::default()).unwrap();
        let audio = tone(440.0, 1.0, 44100);
        let cancel = CancellationToken::new();

        let a = fingerprinter.song_locators(&audio, 3, &cancel).unwrap();
        let b = fingerprinter.song_locators(&audio, 3, &cancel).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
        assert!(a.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
        assert!(a.iter().all(|l| l.hash != 0 && l.song_index == 3));

        let grouped = fingerprinter.song_hashes(&audio, 3, &cancel).unwrap();
        assert!(!grouped.contains_key(&0));
        assert_eq!(grouped.values().map(Vec::len).sum::<usize>(), a.len());
    }

    #[test]
    fn silence_produces_no_locators() {
        let fingerprinter = AudioFingerprinter::new(FingerprintConfig::default()).unwrap();
        let audio = AudioSamples::new(vec![0.0; 44100], 44100);
        let locators = fingerprinter
            .song_locators(&audio, 0, &CancellationToken::new())
            .unwrap();
        assert!(locators.is_empty());
    }

    #[test]
    fn cancelled_token_stops_fingerprinting() {
        let fingerprinter = AudioFingerprinter::new(FingerprintConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fingerprinter.song_hashes(&tone(440.0, 1.0, 44100), 0, &cancel);
        assert!(matches!(result, Err(FingerprintError::Cancelled)));
    }

    #[test]
    fn rejects_zero_sample_rate() {
        let fingerprinter = AudioFingerprinter::new(FingerprintConfig::default()).unwrap();
        let audio = AudioSamples::new(vec![0.1; 4096], 0);
        assert!(matches!(
            fingerprinter.frame_hashes(&audio, &CancellationToken::new()),
            Err(FingerprintError::InvalidParameter(_))
        ));
    }
}
