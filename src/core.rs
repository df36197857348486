use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::fingerprint::AudioFingerprinter;
use crate::models::{AudioSamples, QueryFingerprint, SongFingerprint, SongMetadata};

/// Fingerprints one reference song into hash-grouped locators
///
/// # Arguments
/// * `fingerprinter` - Shared engine, reused across songs
/// * `audio` - Mono samples of the song
/// * `song_index` - Index recorded in every locator
/// * `cancel` - Checked before every frame
pub fn generate_song_fingerprint(
    fingerprinter: &AudioFingerprinter,
    audio: &AudioSamples,
    song_index: i64,
    cancel: &CancellationToken,
) -> Result<SongFingerprint> {
    log::debug!(
        "starting fingerprint generation for song {} ({} samples)",
        song_index,
        audio.samples.len()
    );

    let hashes = fingerprinter.song_hashes(audio, song_index, cancel)?;
    let hash_count = hashes.values().map(Vec::len).sum();

    Ok(SongFingerprint {
        hashes,
        metadata: SongMetadata {
            duration: audio.duration(),
            sample_rate: audio.sample_rate,
            hash_count,
        },
    })
}

/// Fingerprints a query clip into timestamp-ordered locators
pub fn generate_query_fingerprint(
    fingerprinter: &AudioFingerprinter,
    audio_clip: &AudioSamples,
) -> Result<QueryFingerprint> {
    // Query-side songs are never indexed; -1 marks the clip itself
    let locators = fingerprinter.song_locators(audio_clip, -1, &CancellationToken::new())?;

    Ok(QueryFingerprint {
        locators,
        duration: audio_clip.duration(),
    })
}
