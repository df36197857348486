use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use rayon::prelude::*;

use crate::audio::AudioLoader;
use crate::cancel::CancellationToken;
use crate::config::FingerprintConfig;
use crate::core::generate_song_fingerprint;
use crate::error::{FingerprintError, Result};
use crate::fingerprint::AudioFingerprinter;
use crate::models::{AudioSamples, HashIndex, SongCatalog};

/// Something the index builder can turn into mono samples
pub trait SongSource: Send + Sync {
    /// Path recorded in the song catalog
    fn path(&self) -> &str;

    fn load(&self, cancel: &CancellationToken) -> Result<AudioSamples>;
}

/// A song on disk, decoded when its worker picks it up
#[derive(Clone, Debug)]
pub struct SongFile {
    path: PathBuf,
    display: String,
}

impl SongFile {
    /// # Arguments
    /// * `path` - WAV file, decoded lazily by the worker that indexes it
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();
        SongFile { path, display }
    }

    /// Assigns dense 0-based song indexes in iteration order
    pub fn corpus<I, P>(paths: I) -> Vec<(i64, SongFile)>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths
            .into_iter()
            .enumerate()
            .map(|(idx, p)| (idx as i64, SongFile::new(p)))
            .collect()
    }
}

impl SongSource for SongFile {
    fn path(&self) -> &str {
        &self.display
    }

    fn load(&self, cancel: &CancellationToken) -> Result<AudioSamples> {
        AudioLoader::load(&self.path, cancel)
    }
}

/// Samples that were already decoded elsewhere
#[derive(Clone, Debug)]
pub struct DecodedSong {
    pub path: String,
    pub audio: AudioSamples,
}

impl SongSource for DecodedSong {
    fn path(&self) -> &str {
        &self.path
    }

    fn load(&self, _cancel: &CancellationToken) -> Result<AudioSamples> {
        Ok(self.audio.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedSong {
    pub song_index: i64,
    pub path: String,
    pub reason: String,
}

/// Result of one build pass
#[derive(Debug, Default)]
pub struct IndexBuild {
    pub hashes: HashIndex,
    pub catalog: SongCatalog,
    /// Songs that failed to decode or fingerprint; never present in `catalog`
    pub skipped: Vec<SkippedSong>,
}

impl IndexBuild {
    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn locator_count(&self) -> usize {
        self.hashes.values().map(Vec::len).sum()
    }
}

/// Appends one song's locators into the shared index. Append-only per key,
/// so the order songs are merged in does not change the index content.
pub fn merge_song_hashes(index: &mut HashIndex, song: HashIndex) {
    for (hash, locators) in song {
        index.entry(hash).or_default().extend(locators);
    }
}

/// Builds the reference index from a corpus of songs
///
/// Songs are fingerprinted on a bounded rayon pool. Each worker builds its
/// song's hash map privately; the only shared mutable state is the index
/// behind one mutex, touched once per song in [`merge_song_hashes`].
pub struct IndexBuilder {
    fingerprinter: AudioFingerprinter,
    max_workers: usize,
    cancel: CancellationToken,
}

impl IndexBuilder {
    /// Creates a new IndexBuilder
    ///
    /// # Arguments
    /// * `config` - Fingerprinting parameters; `max_workers` bounds the pool size
    pub fn new(config: FingerprintConfig) -> Result<Self> {
        let max_workers = config.max_workers;
        Ok(IndexBuilder {
            fingerprinter: AudioFingerprinter::new(config)?,
            max_workers,
            cancel: CancellationToken::new(),
        })
    }

    /// Overrides the concurrency ceiling from the configuration
    pub fn with_max_workers(mut self, max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(FingerprintError::InvalidParameter(
                "max_workers must be positive".into(),
            ));
        }
        self.max_workers = max_workers;
        Ok(self)
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels builds run by this builder
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn fingerprinter(&self) -> &AudioFingerprinter {
        &self.fingerprinter
    }

    /// Fingerprints every song of `corpus` into one index.
    ///
    /// # Arguments
    /// * `corpus` - `(song index, source)` pairs; indexes must be unique
    ///
    /// # Returns
    /// * The merged index and catalog, plus the songs that were skipped
    ///
    /// Per-song failures are logged and reported in [`IndexBuild::skipped`].
    /// Only cancellation, duplicate song indexes or a pool that cannot be
    /// started fail the build; a cancelled build returns no partial index.
    pub fn build<S: SongSource>(&self, corpus: Vec<(i64, S)>) -> Result<IndexBuild> {
        let mut seen = HashSet::new();
        if let Some((dup, _)) = corpus.iter().find(|(idx, _)| !seen.insert(*idx)) {
            return Err(FingerprintError::InvalidParameter(format!(
                "song index {} appears more than once in the corpus",
                dup
            )));
        }

        let t0 = Instant::now();
        let shared = Mutex::new(IndexBuild::default());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .thread_name(|i| format!("fingerprint-{}", i))
            .build()
            .map_err(|e| FingerprintError::InvalidParameter(e.to_string()))?;

        pool.install(|| {
            corpus
                .par_iter()
                .try_for_each(|(song_index, song)| self.index_song(*song_index, song, &shared))
        })?;

        self.cancel.check()?;

        let build = shared.into_inner().unwrap_or_else(|e| e.into_inner());

        log::info!(
            "indexed {} songs ({} skipped, {} distinct hashes) in {:?}",
            build.catalog.len(),
            build.skipped.len(),
            build.hashes.len(),
            t0.elapsed()
        );
        if build.is_empty() && !build.skipped.is_empty() {
            log::warn!("every song in the corpus failed to index");
        }

        Ok(build)
    }

    fn index_song<S: SongSource>(
        &self,
        song_index: i64,
        song: &S,
        shared: &Mutex<IndexBuild>,
    ) -> Result<()> {
        self.cancel.check()?;

        let fingerprint = song.load(&self.cancel).and_then(|audio| {
            generate_song_fingerprint(&self.fingerprinter, &audio, song_index, &self.cancel)
        });

        let mut shared = shared.lock().unwrap_or_else(|e| e.into_inner());
        match fingerprint {
            Ok(fingerprint) => {
                log::debug!(
                    "song {} [{}]: {} hashes over {:.2}s",
                    song_index,
                    song.path(),
                    fingerprint.metadata.hash_count,
                    fingerprint.metadata.duration
                );
                merge_song_hashes(&mut shared.hashes, fingerprint.hashes);
                shared.catalog.insert(song_index, song.path().to_string());
                Ok(())
            }
            Err(FingerprintError::Cancelled) => Err(FingerprintError::Cancelled),
            Err(e) => {
                log::warn!("skipping song {} [{}]: {}", song_index, song.path(), e);
                shared.skipped.push(SkippedSong {
                    song_index,
                    path: song.path().to_string(),
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }
}
