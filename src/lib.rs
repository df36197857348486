pub mod audio;
pub mod cancel;
pub mod config;
pub mod core;
pub mod error;
pub mod fingerprint;
pub mod indexer;
pub mod matcher;
pub mod models;
pub mod stft;
pub mod storage;

pub use audio::{AudioDecoder, AudioLoader, SamplePackets, WavDecoder};
pub use cancel::CancellationToken;
pub use config::FingerprintConfig;
pub use error::{FingerprintError, Result};
pub use fingerprint::{peaks_hash, AudioFingerprinter, OctaveBands};
pub use indexer::{DecodedSong, IndexBuild, IndexBuilder, SongFile, SongSource};
pub use matcher::Matcher;
pub use models::{AudioSamples, HashIndex, MatchCandidate, SongCatalog, SongHashLocator};
pub use storage::{IndexStore, KvStore, MemoryStore, RedisStore};
