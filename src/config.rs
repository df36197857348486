use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FingerprintError, Result};
use crate::fingerprint::note_to_frequency;

/// Fingerprinting parameters
///
/// The defaults are calibrated together: `min_amplitude` and the
/// `min_freq`/`max_freq` window assume 16-bit PCM normalized to [-1, 1]
/// passed through an unnormalized FFT. Changing the FFT scaling means
/// recalibrating them. Build and query must share `frame_shift`,
/// `frame_len` and `band_notes`, otherwise hashes are not comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    // Spectral transform
    pub frame_shift: usize,
    pub frame_len: usize,

    // Peak extraction
    pub min_amplitude: f64,
    pub min_freq: f64,
    pub max_freq: f64,
    pub band_notes: Vec<String>,

    // Indexing
    pub max_workers: usize,

    // Matching
    pub max_candidates: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            // 10 ms hop at 44.1 kHz
            frame_shift: 441,
            frame_len: 2048,

            min_amplitude: 1.0,
            min_freq: 30.0,
            max_freq: 5000.0,
            band_notes: ["C2", "C3", "C4", "C5", "C6", "C8"]
                .iter()
                .map(|n| n.to_string())
                .collect(),

            max_workers: 4,

            max_candidates: 2,
        }
    }
}

impl FingerprintConfig {
    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| FingerprintError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Parses and validates a JSON configuration
    ///
    /// # Returns
    /// * Config error for malformed JSON, InvalidParameter for values that fail [`validate`](Self::validate)
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: FingerprintConfig =
            serde_json::from_str(text).map_err(|e| FingerprintError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every parameter before any audio is touched.
    pub fn validate(&self) -> Result<()> {
        if self.frame_shift == 0 {
            return Err(FingerprintError::InvalidParameter(
                "frame_shift must be positive".into(),
            ));
        }
        if self.frame_len == 0 {
            return Err(FingerprintError::InvalidParameter(
                "frame_len must be positive".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(FingerprintError::InvalidParameter(
                "max_workers must be positive".into(),
            ));
        }
        if !(self.min_freq >= 0.0 && self.min_freq < self.max_freq) {
            return Err(FingerprintError::InvalidParameter(format!(
                "invalid analysis range [{}, {}] Hz",
                self.min_freq, self.max_freq
            )));
        }
        if self.band_notes.is_empty() {
            return Err(FingerprintError::InvalidParameter(
                "at least one octave boundary note is required".into(),
            ));
        }
        for note in &self.band_notes {
            note_to_frequency(note)?;
        }
        Ok(())
    }

    /// Duration of one frame shift in milliseconds at the given sample rate.
    pub fn frame_shift_ms(&self, sample_rate: u32) -> f64 {
        self.frame_shift as f64 * 1000.0 / sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FingerprintConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.band_notes.len(), 6);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = FingerprintConfig::from_json_str(r#"{ "max_workers": 16 }"#).unwrap();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.frame_len, 2048);
        assert_eq!(config.frame_shift, 441);
    }

    #[test]
    fn rejects_zero_frame_shift() {
        let err = FingerprintConfig::from_json_str(r#"{ "frame_shift": 0 }"#).unwrap_err();
        assert!(matches!(err, FingerprintError::InvalidParameter(_)));
    }

    #[test]
    fn rejects_bad_note() {
        let config = FingerprintConfig {
            band_notes: vec!["C2".into(), "H9".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn extreme_octave_is_rejected_not_panicking() {
        for notes in [r#"["C-2147483648"]"#, r#"["C2", "B2147483647"]"#] {
            let json = format!(r#"{{ "band_notes": {} }}"#, notes);
            let err = FingerprintConfig::from_json_str(&json).unwrap_err();
            assert!(matches!(err, FingerprintError::InvalidParameter(_)));
        }
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = FingerprintConfig::from_json_str("{ frame_len: ").unwrap_err();
        assert!(matches!(err, FingerprintError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "frame_len": 4096, "min_amplitude": 2.5 }"#).unwrap();

        let config = FingerprintConfig::from_json_file(&path).unwrap();
        assert_eq!(config.frame_len, 4096);
        assert_eq!(config.min_amplitude, 2.5);
    }
}
