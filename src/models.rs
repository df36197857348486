use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Mono PCM produced once per source file
/// Samples are normalized to roughly [-1.0, 1.0]
#[derive(Clone, Debug, PartialEq)]
pub struct AudioSamples {
    pub samples: Vec<f64>,
    pub sample_rate: u32,
}

impl AudioSamples {
    pub fn new(samples: Vec<f64>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Stream format reported by a decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// One occurrence of a fingerprint: which song, and when
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SongHashLocator {
    pub timestamp_ms: i64,
    pub song_index: i64,
    pub hash: u64,
}

/// A query locator paired with one reference occurrence of the same hash
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatchPosLocator {
    pub candidate_timestamp_ms: i64,
    pub time_diff_ms: f64,
    pub hash: u64,
    pub sample_position_index: usize,
    pub song_index: i64,
}

/// Inverted index: fingerprint -> every place it occurs.
/// Order inside a locator list carries no meaning.
pub type HashIndex = HashMap<u64, Vec<SongHashLocator>>;

/// Song index -> source file path
pub type SongCatalog = BTreeMap<i64, String>;

#[derive(Serialize, Deserialize, Debug)]
pub struct SongFingerprint {
    pub hashes: HashIndex,
    pub metadata: SongMetadata,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct QueryFingerprint {
    /// Ordered by timestamp, one per frame with a non-zero hash
    pub locators: Vec<SongHashLocator>,
    pub duration: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SongMetadata {
    pub duration: f64,
    pub sample_rate: u32,
    pub hash_count: usize,
}

/// A ranked match: the song voted for by one alignment bucket
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MatchCandidate {
    pub song_index: i64,
    pub song_path: Option<String>,
    pub start_offset_ms: i64,
    pub votes: usize,
}
