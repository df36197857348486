use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::RwLock;
use std::time::Instant;

use byteorder::{LittleEndian, ReadBytesExt};
use redis::{Client, Commands};

use crate::error::{FingerprintError, Result};
use crate::models::{HashIndex, SongCatalog, SongHashLocator};

pub const HASH_PREFIX: &[u8; 4] = b"hash";
pub const SONG_PREFIX: &[u8; 4] = b"song";

const KEY_LEN: usize = 12;
const RECORD_LEN: usize = 24;
const KEY_CHUNK: usize = 512;

/// Minimal key-value engine contract
pub trait KvStore {
    /// Writes every entry in a single transaction: all of them or none.
    fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;

    /// Removes every key under any of `prefixes` and writes `entries`, as one
    /// transaction. Readers see either the old contents or the new ones.
    fn replace_prefixes(
        &self,
        prefixes: &[&[u8]],
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`, in no particular order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-process store, mostly for tests and one-off matching sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> FingerprintError {
    FingerprintError::Persistence("memory store lock poisoned".into())
}

impl KvStore for MemoryStore {
    fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut map = self.entries.write().map_err(poisoned)?;
        map.extend(entries);
        Ok(())
    }

    fn replace_prefixes(
        &self,
        prefixes: &[&[u8]],
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let mut map = self.entries.write().map_err(poisoned)?;
        map.retain(|key, _| !prefixes.iter().any(|p| key.starts_with(p)));
        map.extend(entries);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.entries.read().map_err(poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.entries.read().map_err(poisoned)?;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Redis-backed store
/// Batches run as one MULTI/EXEC pipeline; prefix reads use `SCAN MATCH`.
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    /// Creates a new RedisStore instance
    ///
    /// # Arguments
    /// * `redis_url` - URL of the Redis server (e.g., "redis://127.0.0.1/")
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(RedisStore { client })
    }

    /// Every key under `prefix`, deduplicated since SCAN may repeat keys
    fn scan_keys(conn: &mut redis::Connection, prefix: &[u8]) -> Result<BTreeSet<Vec<u8>>> {
        let mut pattern = glob_escape(prefix);
        pattern.push(b'*');
        let keys = conn.scan_match::<_, Vec<u8>>(pattern)?.collect();
        Ok(keys)
    }
}

impl KvStore for RedisStore {
    fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_connection()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set(key, value).ignore();
        }
        pipe.query::<()>(&mut conn)?;
        Ok(())
    }

    /// SCAN cannot run inside MULTI, so stale keys are listed first and the
    /// deletes and writes then commit together. A writer racing between the
    /// two steps can leave keys behind; index saves are not run concurrently.
    fn replace_prefixes(
        &self,
        prefixes: &[&[u8]],
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let mut conn = self.client.get_connection()?;

        let mut stale = BTreeSet::new();
        for prefix in prefixes {
            stale.extend(Self::scan_keys(&mut conn, prefix)?);
        }
        for (key, _) in &entries {
            stale.remove(key);
        }
        if stale.is_empty() && entries.is_empty() {
            return Ok(());
        }

        let stale: Vec<Vec<u8>> = stale.into_iter().collect();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for chunk in stale.chunks(KEY_CHUNK) {
            pipe.del(chunk).ignore();
        }
        for (key, value) in entries {
            pipe.set(key, value).ignore();
        }
        pipe.query::<()>(&mut conn)?;
        log::debug!("replaced prefixes, {} stale keys removed", stale.len());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.client.get_connection()?;
        Ok(conn.get::<_, Option<Vec<u8>>>(key)?)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut conn = self.client.get_connection()?;
        let keys: Vec<Vec<u8>> = Self::scan_keys(&mut conn, prefix)?.into_iter().collect();

        let mut entries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(KEY_CHUNK) {
            let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(chunk).query(&mut conn)?;
            entries.extend(
                chunk
                    .iter()
                    .zip(values)
                    .filter_map(|(k, v)| v.map(|v| (k.clone(), v))),
            );
        }
        Ok(entries)
    }
}

/// Escapes Redis glob metacharacters so the prefix matches literally
fn glob_escape(prefix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1);
    for &b in prefix {
        if matches!(b, b'*' | b'?' | b'[' | b']' | b'\\') {
            out.push(b'\\');
        }
        out.push(b);
    }
    out
}

pub fn hash_key(hash: u64) -> Vec<u8> {
    prefixed_key(HASH_PREFIX, hash)
}

pub fn song_key(song_index: i64) -> Vec<u8> {
    prefixed_key(SONG_PREFIX, song_index as u64)
}

fn prefixed_key(prefix: &[u8; 4], value: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&value.to_le_bytes());
    key
}

fn key_value(key: &[u8], prefix: &[u8; 4]) -> Result<u64> {
    if key.len() != KEY_LEN || !key.starts_with(prefix) {
        return Err(FingerprintError::Persistence(format!(
            "malformed key of {} bytes under prefix {:?}",
            key.len(),
            String::from_utf8_lossy(prefix)
        )));
    }
    let mut rdr = Cursor::new(&key[prefix.len()..]);
    rdr.read_u64::<LittleEndian>().map_err(corrupt)
}

fn corrupt(err: std::io::Error) -> FingerprintError {
    FingerprintError::Persistence(format!("corrupt locator record: {}", err))
}

fn utf8_path(song_index: i64, value: Vec<u8>) -> Result<String> {
    String::from_utf8(value).map_err(|e| {
        FingerprintError::Persistence(format!("song {} path is not UTF-8: {}", song_index, e))
    })
}

/// Serializes a locator list: count, then fixed 24-byte records.
pub fn encode_locators(locators: &[SongHashLocator]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + locators.len() * RECORD_LEN);
    buf.extend_from_slice(&(locators.len() as u32).to_le_bytes());
    for locator in locators {
        buf.extend_from_slice(&locator.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&locator.song_index.to_le_bytes());
        buf.extend_from_slice(&locator.hash.to_le_bytes());
    }
    buf
}

pub fn decode_locators(data: &[u8]) -> Result<Vec<SongHashLocator>> {
    let mut rdr = Cursor::new(data);
    let count = rdr.read_u32::<LittleEndian>().map_err(corrupt)? as usize;

    let expected = 4 + count * RECORD_LEN;
    if data.len() != expected {
        return Err(FingerprintError::Persistence(format!(
            "locator record holds {} bytes, expected {} for {} entries",
            data.len(),
            expected,
            count
        )));
    }

    let mut locators = Vec::with_capacity(count);
    for _ in 0..count {
        locators.push(SongHashLocator {
            timestamp_ms: rdr.read_i64::<LittleEndian>().map_err(corrupt)?,
            song_index: rdr.read_i64::<LittleEndian>().map_err(corrupt)?,
            hash: rdr.read_u64::<LittleEndian>().map_err(corrupt)?,
        });
    }
    Ok(locators)
}

/// Hash index and song catalog persisted on top of a [`KvStore`]
///
/// # Storage Structure
/// All integers are little-endian.
/// - `"hash" ++ u64 hash` holds `u32 count ++ count * (i64 timestamp_ms, i64 song_index, u64 hash)`
/// - `"song" ++ u64 song_index` holds the UTF-8 file path
///
/// The key-value engine behind [`KvStore`] is substitutable; this type owns the layout.
pub struct IndexStore<S: KvStore> {
    store: S,
}

impl<S: KvStore> IndexStore<S> {
    /// Creates a new IndexStore over an opened key-value engine
    ///
    /// # Arguments
    /// * `store` - Engine holding the `hash` and `song` key families
    pub fn new(store: S) -> Self {
        IndexStore { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Replaces the persisted index with a freshly built one
    ///
    /// Every existing `hash` and `song` entry is dropped and the new ones are
    /// written in the same transaction, so nothing from an earlier build
    /// survives and a failed save leaves the previous index intact.
    ///
    /// # Arguments
    /// * `hashes` - Hash index of the build
    /// * `catalog` - Song paths of the build
    pub fn save(&self, hashes: &HashIndex, catalog: &SongCatalog) -> Result<()> {
        let t0 = Instant::now();

        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = hashes
            .iter()
            .map(|(hash, locators)| (hash_key(*hash), encode_locators(locators)))
            .collect();
        entries.extend(
            catalog
                .iter()
                .map(|(idx, path)| (song_key(*idx), path.as_bytes().to_vec())),
        );
        self.store
            .replace_prefixes(&[&HASH_PREFIX[..], &SONG_PREFIX[..]], entries)?;

        log::info!(
            "stored {} hashes and {} songs in {:?}",
            hashes.len(),
            catalog.len(),
            t0.elapsed()
        );
        Ok(())
    }

    /// Reads the whole hash index back into memory
    pub fn load_hashes(&self) -> Result<HashIndex> {
        let mut hashes = HashIndex::new();
        for (key, value) in self.store.scan_prefix(HASH_PREFIX)? {
            let hash = key_value(&key, HASH_PREFIX)?;
            hashes.insert(hash, decode_locators(&value)?);
        }
        Ok(hashes)
    }

    pub fn load_catalog(&self) -> Result<SongCatalog> {
        let mut catalog = SongCatalog::new();
        for (key, value) in self.store.scan_prefix(SONG_PREFIX)? {
            let idx = key_value(&key, SONG_PREFIX)? as i64;
            catalog.insert(idx, utf8_path(idx, value)?);
        }
        Ok(catalog)
    }

    /// Point lookup of a single hash without loading the whole index
    pub fn locators_for(&self, hash: u64) -> Result<Option<Vec<SongHashLocator>>> {
        self.store
            .get(&hash_key(hash))?
            .map(|value| decode_locators(&value))
            .transpose()
    }

    pub fn song_path(&self, song_index: i64) -> Result<Option<String>> {
        self.store
            .get(&song_key(song_index))?
            .map(|value| utf8_path(song_index, value))
            .transpose()
    }
}
