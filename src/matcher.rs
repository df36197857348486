use std::collections::BTreeMap;

use crate::cancel::CancellationToken;
use crate::config::FingerprintConfig;
use crate::core::generate_query_fingerprint;
use crate::error::{FingerprintError, Result};
use crate::fingerprint::AudioFingerprinter;
use crate::models::{
    AudioSamples, HashIndex, MatchCandidate, MatchPosLocator, SongCatalog, SongHashLocator,
};
use crate::storage::{IndexStore, KvStore};

/// Pairs each query locator with every reference occurrence of its hash.
/// Output follows query order, then reference list order.
pub fn matching_positions(index: &HashIndex, query: &[SongHashLocator]) -> Vec<MatchPosLocator> {
    let mut positions = Vec::new();

    for (idx, sl) in query.iter().enumerate() {
        let Some(references) = index.get(&sl.hash) else {
            continue;
        };
        positions.extend(references.iter().map(|shl| MatchPosLocator {
            candidate_timestamp_ms: shl.timestamp_ms,
            time_diff_ms: (shl.timestamp_ms - sl.timestamp_ms).abs() as f64,
            hash: sl.hash,
            sample_position_index: idx,
            song_index: shl.song_index,
        }));
    }

    positions
}

/// Votes collected by one alignment bucket
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetBucket {
    pub offset_ms: i64,
    pub votes: usize,
    /// First locator that landed in the bucket
    pub first: MatchPosLocator,
}

/// Histogram of truncated time differences, strongest bucket first.
/// Equal vote counts rank the smaller offset first.
pub fn rank_offsets(positions: &[MatchPosLocator]) -> Vec<OffsetBucket> {
    let mut buckets: BTreeMap<i64, OffsetBucket> = BTreeMap::new();

    for mp in positions {
        let key = mp.time_diff_ms as i64;
        buckets
            .entry(key)
            .and_modify(|b| b.votes += 1)
            .or_insert(OffsetBucket {
                offset_ms: key,
                votes: 1,
                first: *mp,
            });
    }

    let mut ranked: Vec<OffsetBucket> = buckets.into_values().collect();
    // Stable sort keeps ascending offsets within equal vote counts
    ranked.sort_by(|a, b| b.votes.cmp(&a.votes));
    ranked
}

/// Ranks candidate alignments for an already fingerprinted query
///
/// # Search Process
/// 1. Pair each query hash with every reference occurrence of it
/// 2. Bucket the pairs by whole-millisecond distance between the two timestamps
/// 3. Rank buckets by vote count; a true sub-clip piles its votes into one
///    bucket while chance matches scatter
///
/// # Arguments
/// * `index` - Reference hash index
/// * `catalog` - Song paths for the reported candidates
/// * `query` - Query locators in timestamp order
/// * `top_k` - Maximum number of candidates, at least 1
pub fn match_locators(
    index: &HashIndex,
    catalog: &SongCatalog,
    query: &[SongHashLocator],
    top_k: usize,
) -> Result<Vec<MatchCandidate>> {
    if top_k == 0 {
        return Err(FingerprintError::InvalidParameter(
            "top_k must be positive".into(),
        ));
    }

    let positions = matching_positions(index, query);
    log::debug!(
        "{} query hashes produced {} matching positions",
        query.len(),
        positions.len()
    );

    Ok(rank_offsets(&positions)
        .into_iter()
        .take(top_k)
        .map(|bucket| MatchCandidate {
            song_index: bucket.first.song_index,
            song_path: catalog.get(&bucket.first.song_index).cloned(),
            start_offset_ms: bucket.offset_ms,
            votes: bucket.votes,
        })
        .collect())
}

/// Matches query samples against a reference index held in memory
///
/// ```no_run
/// use octave_fingerprint::{
///     AudioLoader, CancellationToken, FingerprintConfig, IndexBuilder, IndexStore, Matcher,
///     MemoryStore, SongFile,
/// };
///
/// # fn main() -> octave_fingerprint::Result<()> {
/// let config = FingerprintConfig::default();
/// let build = IndexBuilder::new(config.clone())?
///     .build(SongFile::corpus(["a.wav", "b.wav"]))?;
///
/// let store = IndexStore::new(MemoryStore::new());
/// store.save(&build.hashes, &build.catalog)?;
///
/// let matcher = Matcher::from_store(config, &store)?;
/// let clip = AudioLoader::load("clip.wav", &CancellationToken::new())?;
/// for candidate in matcher.identify(&clip)? {
///     println!("{:?} at {} ms", candidate.song_path, candidate.start_offset_ms);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Matcher {
    fingerprinter: AudioFingerprinter,
    index: HashIndex,
    catalog: SongCatalog,
}

impl Matcher {
    /// Creates a new Matcher over an index already in memory
    ///
    /// # Arguments
    /// * `config` - Must match the configuration the index was built with
    /// * `index` - Reference hash index
    /// * `catalog` - Song paths keyed by song index
    pub fn new(config: FingerprintConfig, index: HashIndex, catalog: SongCatalog) -> Result<Self> {
        Ok(Matcher {
            fingerprinter: AudioFingerprinter::new(config)?,
            index,
            catalog,
        })
    }

    /// Loads the full index and catalog from a store
    pub fn from_store<S: KvStore>(config: FingerprintConfig, store: &IndexStore<S>) -> Result<Self> {
        let index = store.load_hashes()?;
        let catalog = store.load_catalog()?;
        log::info!(
            "loaded {} hashes for {} songs",
            index.len(),
            catalog.len()
        );
        Self::new(config, index, catalog)
    }

    /// One-song reference built directly from samples, without a store
    pub fn from_samples(
        config: FingerprintConfig,
        path: &str,
        reference: &AudioSamples,
    ) -> Result<Self> {
        let fingerprinter = AudioFingerprinter::new(config)?;
        let index = fingerprinter.song_hashes(reference, 0, &CancellationToken::new())?;
        let mut catalog = SongCatalog::new();
        catalog.insert(0, path.to_string());
        Ok(Matcher {
            fingerprinter,
            index,
            catalog,
        })
    }

    pub fn index(&self) -> &HashIndex {
        &self.index
    }

    pub fn catalog(&self) -> &SongCatalog {
        &self.catalog
    }

    /// Fingerprints `query` and returns the `top_k` strongest alignments
    ///
    /// # Arguments
    /// * `query` - Mono samples at the rate the references were indexed at
    /// * `top_k` - Maximum number of candidates, at least 1
    ///
    /// # Returns
    /// * Candidates strongest first; empty when no query hash is in the index
    pub fn match_sample(&self, query: &AudioSamples, top_k: usize) -> Result<Vec<MatchCandidate>> {
        if top_k == 0 {
            return Err(FingerprintError::InvalidParameter(
                "top_k must be positive".into(),
            ));
        }
        let fingerprint = generate_query_fingerprint(&self.fingerprinter, query)?;
        match_locators(&self.index, &self.catalog, &fingerprint.locators, top_k)
    }

    /// [`match_sample`](Self::match_sample) with the configured candidate count
    pub fn identify(&self, query: &AudioSamples) -> Result<Vec<MatchCandidate>> {
        self.match_sample(query, self.fingerprinter.config().max_candidates)
    }
}
