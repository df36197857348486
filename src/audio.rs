use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::cancel::CancellationToken;
use crate::error::{FingerprintError, Result};
use crate::models::{AudioFormat, AudioSamples};

/// Interleaved frames pulled from a decoder per packet
pub const FRAMES_PER_PACKET: usize = 2048;

/// Capability interface of a format-specific decoder.
///
/// Decoders produce interleaved samples normalized to [-1.0, 1.0].
pub trait AudioDecoder: Sized {
    fn open(path: &Path) -> Result<Self>;

    fn format(&self) -> AudioFormat;

    /// Replaces the contents of `buffer` with up to `max_samples` interleaved
    /// samples. Returns how many were decoded; 0 means end of stream.
    fn decode(&mut self, max_samples: usize, buffer: &mut Vec<f64>) -> Result<usize>;

    fn close(self) -> Result<()>;
}

/// WAV decoder backed by `hound`
pub struct WavDecoder {
    path: String,
    reader: hound::WavReader<BufReader<File>>,
}

impl AudioDecoder for WavDecoder {
    fn open(path: &Path) -> Result<Self> {
        let name = path.display().to_string();
        let reader = hound::WavReader::open(path).map_err(|e| FingerprintError::decode(&name, e))?;

        let spec = reader.spec();
        if spec.sample_format == hound::SampleFormat::Int
            && !matches!(spec.bits_per_sample, 8 | 16 | 24 | 32)
        {
            return Err(FingerprintError::decode(
                &name,
                format!("unsupported bit depth: {}", spec.bits_per_sample),
            ));
        }

        log::debug!(
            "{}: {}Hz, {} channels, {} bits",
            name,
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );

        Ok(WavDecoder { path: name, reader })
    }

    fn format(&self) -> AudioFormat {
        let spec = self.reader.spec();
        AudioFormat {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            bits_per_sample: spec.bits_per_sample,
        }
    }

    fn decode(&mut self, max_samples: usize, buffer: &mut Vec<f64>) -> Result<usize> {
        buffer.clear();
        let spec = self.reader.spec();

        // Convert samples to floating point based on the file's format
        let decoded: std::result::Result<(), hound::Error> = match spec.sample_format {
            hound::SampleFormat::Float => self
                .reader
                .samples::<f32>()
                .take(max_samples)
                .try_for_each(|s| s.map(|s| buffer.push(s as f64))),
            hound::SampleFormat::Int => {
                let scale = match spec.bits_per_sample {
                    8 => i8::MAX as f64,
                    16 => i16::MAX as f64,
                    24 => (1 << 23) as f64,
                    _ => i32::MAX as f64,
                };
                self.reader
                    .samples::<i32>()
                    .take(max_samples)
                    .try_for_each(|s| s.map(|s| buffer.push(s as f64 / scale)))
            }
        };

        decoded.map_err(|e| FingerprintError::decode(&self.path, e))?;
        Ok(buffer.len())
    }

    fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Lazy, finite, non-restartable sequence of interleaved sample packets.
///
/// The decoder is closed as soon as the stream is exhausted, fails or is
/// cancelled; after that the iterator only returns `None`.
pub struct SamplePackets<D: AudioDecoder> {
    decoder: Option<D>,
    max_samples: usize,
    cancel: CancellationToken,
}

impl<D: AudioDecoder> SamplePackets<D> {
    pub fn new(decoder: D, frames_per_packet: usize, cancel: CancellationToken) -> Self {
        let channels = decoder.format().channels.max(1) as usize;
        SamplePackets {
            decoder: Some(decoder),
            max_samples: frames_per_packet.max(1) * channels,
            cancel,
        }
    }

    fn finish(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            if let Err(e) = decoder.close() {
                log::warn!("closing decoder failed: {}", e);
            }
        }
    }
}

impl<D: AudioDecoder> Iterator for SamplePackets<D> {
    type Item = Result<Vec<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.decoder.is_none() {
            return None;
        }

        if let Err(e) = self.cancel.check() {
            self.finish();
            return Some(Err(e));
        }

        let mut packet = Vec::with_capacity(self.max_samples);
        let decoded = self.decoder.as_mut()?.decode(self.max_samples, &mut packet);
        match decoded {
            Ok(0) => {
                self.finish();
                None
            }
            Ok(_) => Some(Ok(packet)),
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}

/// Mixes interleaved multi-channel audio down to mono by averaging channels
pub fn downmix_to_mono(interleaved: &[f64], channels: u16) -> Vec<f64> {
    match channels {
        0 | 1 => interleaved.to_vec(),
        2 => interleaved
            .chunks_exact(2)
            .map(|chunk| (chunk[0] + chunk[1]) / 2.0)
            .collect(),
        n => interleaved
            .chunks_exact(n as usize)
            .map(|chunk| chunk.iter().sum::<f64>() / chunk.len() as f64)
            .collect(),
    }
}

/// Handles loading audio files into mono samples ready for fingerprinting
pub struct AudioLoader;

impl AudioLoader {
    /// Loads an audio file as mono samples, picking the decoder by extension
    ///
    /// # Arguments
    /// * `path` - Path to the audio file; only `.wav`/`.wave` are decoded
    /// * `cancel` - Checked between decoder packets
    ///
    /// # Returns
    /// * `AudioSamples` with channels averaged and the file's native sample rate
    pub fn load(path: impl AsRef<Path>, cancel: &CancellationToken) -> Result<AudioSamples> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("wav") | Some("wave") => Self::load_with::<WavDecoder>(path, cancel),
            _ => Err(FingerprintError::decode(
                &path.display().to_string(),
                "unsupported audio format",
            )),
        }
    }

    /// Pulls every packet from decoder `D` and mixes the result to mono
    pub fn load_with<D: AudioDecoder>(
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AudioSamples> {
        let decoder = D::open(path)?;
        let format = decoder.format();

        let mut interleaved = Vec::new();
        for packet in SamplePackets::new(decoder, FRAMES_PER_PACKET, cancel.clone()) {
            interleaved.extend(packet?);
        }

        let samples = downmix_to_mono(&interleaved, format.channels);
        let audio = AudioSamples::new(samples, format.sample_rate);

        log::debug!(
            "loaded {} samples ({:.2} seconds) from {}",
            audio.samples.len(),
            audio.duration(),
            path.display()
        );

        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::path::PathBuf;

    fn write_wav_i16(path: &Path, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn loads_stereo_wav_as_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav_i16(&path, 2, &[i16::MAX, 0, -i16::MAX, -i16::MAX, 0, i16::MAX]);

        let audio = AudioLoader::load(&path, &CancellationToken::new()).unwrap();
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.samples.len(), 3);
        assert_abs_diff_eq!(audio.samples[0], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(audio.samples[1], -1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(audio.samples[2], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn loads_float_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.WAV");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [0.25f32, -0.5, 0.75] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let audio = AudioLoader::load(&path, &CancellationToken::new()).unwrap();
        assert_eq!(audio.samples, vec![0.25, -0.5, 0.75]);
        assert_eq!(audio.sample_rate, 22050);
    }

    #[test]
    fn packets_are_bounded_and_finite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let samples: Vec<i16> = (0..5000).map(|i| (i % 100) as i16).collect();
        write_wav_i16(&path, 1, &samples);

        let decoder = WavDecoder::open(&path).unwrap();
        let mut packets = SamplePackets::new(decoder, 2048, CancellationToken::new());
        let sizes: Vec<usize> = packets.by_ref().map(|p| p.unwrap().len()).collect();
        assert_eq!(sizes, vec![2048, 2048, 904]);
        assert!(packets.next().is_none());
    }

    #[test]
    fn cancelled_stream_yields_error_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav_i16(&path, 1, &[1; 4096]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let decoder = WavDecoder::open(&path).unwrap();
        let mut packets = SamplePackets::new(decoder, 1024, cancel.clone());
        assert!(matches!(packets.next(), Some(Err(FingerprintError::Cancelled))));
        assert!(packets.next().is_none());

        assert!(matches!(
            AudioLoader::load(&path, &cancel),
            Err(FingerprintError::Cancelled)
        ));
    }

    #[test]
    fn missing_file_is_a_decode_failure() {
        let path = PathBuf::from("/nonexistent/song.wav");
        let err = AudioLoader::load(&path, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, FingerprintError::Decode { .. }));
    }

    #[test]
    fn unsupported_extension_is_a_decode_failure() {
        let err = AudioLoader::load("song.mp3", &CancellationToken::new()).unwrap_err();
        match err {
            FingerprintError::Decode { path, .. } => assert_eq!(path, "song.mp3"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix_to_mono(&[1.0, 2.0, 3.0, 4.0], 1), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(downmix_to_mono(&[1.0, 3.0, -1.0, 1.0], 2), vec![2.0, 0.0]);
        assert_eq!(downmix_to_mono(&[3.0, 3.0, 0.0, 1.0, 2.0, 3.0], 3), vec![2.0, 2.0]);
    }
}
