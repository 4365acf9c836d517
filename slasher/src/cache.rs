use core::num::NonZeroUsize;
use std::collections::HashMap;

use anyhow::Result;
use log::warn;
use lru::LruCache;

use crate::{
    chunks::{SpanChunk, SpanKind},
    config::SlasherConfig,
    error,
    metrics::METRICS,
    primitives::{Epoch, ValidatorIndex},
    spans::{ChunkKey, SpanStore},
};

/// Chunk access shared by the in-batch detection path (the writer's cache)
/// and the between-batch query path (a generation-scoped read cache).
pub trait SpanReader {
    fn span_at(
        &mut self,
        store: &SpanStore,
        kind: SpanKind,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<u16>;
}

struct CacheEntry {
    chunk: SpanChunk,
    dirty: bool,
}

/// Bounded LRU of decompressed chunks, owned by the writer task.
///
/// Dirty chunks displaced by the LRU before the batch flushes are kept in an
/// encoded spill buffer and written together with the flush, so the store
/// batch stays atomic no matter how small the cache is.
pub struct ChunkCache {
    config: SlasherConfig,
    entries: LruCache<ChunkKey, CacheEntry>,
    spilled: HashMap<ChunkKey, Vec<u8>>,
    generation: u64,
    hits: u64,
    misses: u64,
}

impl ChunkCache {
    #[must_use]
    pub fn new(config: SlasherConfig) -> Self {
        let capacity = NonZeroUsize::new(config.chunk_cache_capacity)
            .expect("chunk cache capacity is validated to be nonzero");

        Self {
            config,
            entries: LruCache::new(capacity),
            spilled: HashMap::new(),
            generation: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, store: &SpanStore, key: ChunkKey) -> Result<&SpanChunk> {
        self.ensure_loaded(store, key)?;

        let entry = self
            .entries
            .get(&key)
            .expect("chunk was loaded by ensure_loaded");

        Ok(&entry.chunk)
    }

    pub fn get_mut(&mut self, store: &SpanStore, key: ChunkKey) -> Result<&mut SpanChunk> {
        self.ensure_loaded(store, key)?;

        let entry = self
            .entries
            .get_mut(&key)
            .expect("chunk was loaded by ensure_loaded");

        Ok(&mut entry.chunk)
    }

    pub fn mark_dirty(&mut self, key: ChunkKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.dirty = true;
        }
    }

    fn ensure_loaded(&mut self, store: &SpanStore, key: ChunkKey) -> Result<()> {
        if self.entries.contains(&key) {
            self.hits += 1;
            return Ok(());
        }

        self.misses += 1;

        let (chunk, dirty) = if let Some(bytes) = self.spilled.remove(&key) {
            // Bytes we encoded ourselves; failure here is a bug, not corruption.
            let chunk = SpanChunk::decode(&self.config, key.kind, &bytes).map_err(|_| {
                crate::error::Error::InternalInvariantViolated(
                    "spilled chunk bytes failed to decode",
                )
            })?;

            (chunk, true)
        } else {
            (load_or_blank(&self.config, store, key)?, false)
        };

        self.insert(key, CacheEntry { chunk, dirty })
    }

    fn insert(&mut self, key: ChunkKey, entry: CacheEntry) -> Result<()> {
        if let Some((evicted_key, evicted)) = self.entries.push(key, entry) {
            if evicted_key != key && evicted.dirty {
                self.spilled.insert(evicted_key, evicted.chunk.encode()?);
            }
        }

        Ok(())
    }

    /// Encodes every dirty chunk for the flush batch. Dirty state is cleared
    /// only by [`Self::commit_flush`], after the store batch succeeded.
    pub fn flush_pairs(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = vec![];

        for (key, entry) in &self.entries {
            if entry.dirty {
                pairs.push((key.to_bytes().to_vec(), entry.chunk.encode()?));
            }
        }

        for (key, bytes) in &self.spilled {
            pairs.push((key.to_bytes().to_vec(), bytes.clone()));
        }

        Ok(pairs)
    }

    pub fn commit_flush(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            entry.dirty = false;
        }

        self.spilled.clear();
        self.generation += 1;
    }

    /// Drops all uncommitted updates. Reverted chunks reload from the store.
    pub fn discard(&mut self) {
        let dirty_keys = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        for key in dirty_keys {
            self.entries.pop(&key);
        }

        self.spilled.clear();
    }

    /// Forgets every cached chunk living in the given circular slot.
    /// Called after pruning reclaims the slot for a new generation.
    pub fn purge_epoch_slot(&mut self, epoch_chunk: u32) {
        let keys = self
            .entries
            .iter()
            .filter(|(key, _)| key.epoch_chunk == epoch_chunk)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        for key in keys {
            self.entries.pop(&key);
        }

        self.spilled.retain(|key, _| key.epoch_chunk != epoch_chunk);
        self.generation += 1;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.spilled.clear();
        self.generation += 1;
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn dirty_chunk_count(&self) -> usize {
        let dirty = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .count();

        dirty + self.spilled.len()
    }

    /// Hit and miss counts since the previous call.
    pub fn take_access_counts(&mut self) -> (u64, u64) {
        let counts = (self.hits, self.misses);
        self.hits = 0;
        self.misses = 0;
        counts
    }
}

impl SpanReader for ChunkCache {
    fn span_at(
        &mut self,
        store: &SpanStore,
        kind: SpanKind,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<u16> {
        let key = ChunkKey::new(&self.config, kind, validator_index, epoch)?;
        let chunk = self.get(store, key)?;

        Ok(chunk.span_at(&self.config, validator_index, epoch))
    }
}

/// Read-only chunk cache for detector queries running between batches.
/// A generation mismatch (the writer flushed or pruned) empties it.
pub struct ReadCache {
    config: SlasherConfig,
    entries: LruCache<ChunkKey, SpanChunk>,
    generation: u64,
}

impl ReadCache {
    #[must_use]
    pub fn new(config: SlasherConfig, capacity: NonZeroUsize) -> Self {
        Self {
            config,
            entries: LruCache::new(capacity),
            generation: 0,
        }
    }

    pub fn sync_generation(&mut self, generation: u64) {
        if self.generation != generation {
            self.entries.clear();
            self.generation = generation;
        }
    }
}

impl SpanReader for ReadCache {
    fn span_at(
        &mut self,
        store: &SpanStore,
        kind: SpanKind,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<u16> {
        let key = ChunkKey::new(&self.config, kind, validator_index, epoch)?;

        if !self.entries.contains(&key) {
            let chunk = load_or_blank(&self.config, store, key)?;
            self.entries.push(key, chunk);
        }

        let chunk = self
            .entries
            .get(&key)
            .expect("chunk was inserted above if it was missing");

        Ok(chunk.span_at(&self.config, validator_index, epoch))
    }
}

/// Loads a chunk, substituting a blank one when it is missing or corrupt.
///
/// Corruption is contained: detection capability for the chunk's validators
/// over its epoch range is lost, but the detector keeps running.
fn load_or_blank(config: &SlasherConfig, store: &SpanStore, key: ChunkKey) -> Result<SpanChunk> {
    match store.load_chunk(key) {
        Ok(Some(chunk)) => Ok(chunk),
        Ok(None) => Ok(SpanChunk::blank(config, key.kind)),
        Err(error) if error::is_corruption(&error) => {
            warn!("corrupt span chunk replaced with a blank one (key: {key:?}, error: {error})");

            if let Some(metrics) = METRICS.get() {
                metrics.inc_corrupt_chunks();
            }

            Ok(SpanChunk::blank(config, key.kind))
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use database::Database;

    use crate::config::test_config;

    use super::*;

    fn build_store(config: SlasherConfig) -> SpanStore {
        SpanStore::new(config, Arc::new(Database::in_memory()))
    }

    #[test]
    fn misses_then_hits() -> Result<()> {
        let config = test_config();
        let store = build_store(config);
        let mut cache = ChunkCache::new(config);
        let key = ChunkKey::new(&config, SpanKind::Min, 1, 1)?;

        cache.get(&store, key)?;
        cache.get(&store, key)?;
        cache.get(&store, key)?;

        assert_eq!(cache.take_access_counts(), (2, 1));
        assert_eq!(cache.take_access_counts(), (0, 0));

        Ok(())
    }

    #[test]
    fn flush_and_commit_round_trip() -> Result<()> {
        let config = test_config();
        let store = build_store(config);
        let mut cache = ChunkCache::new(config);
        let key = ChunkKey::new(&config, SpanKind::Min, 1, 5)?;

        cache
            .get_mut(&store, key)?
            .update(&config, 1, 5, 5, 7)?;
        cache.mark_dirty(key);

        assert_eq!(cache.dirty_chunk_count(), 1);

        let generation = cache.generation();
        store.write_batch(cache.flush_pairs()?)?;
        cache.commit_flush();

        assert_eq!(cache.dirty_chunk_count(), 0);
        assert_ne!(cache.generation(), generation);

        let persisted = store.load_chunk(key)?.expect("chunk was flushed");
        assert_eq!(persisted.span_at(&config, 1, 5), 2);

        Ok(())
    }

    #[test]
    fn discard_reverts_to_persisted_state() -> Result<()> {
        let config = test_config();
        let store = build_store(config);
        let mut cache = ChunkCache::new(config);
        let key = ChunkKey::new(&config, SpanKind::Max, 1, 5)?;

        cache
            .get_mut(&store, key)?
            .update(&config, 1, 5, 5, 7)?;
        cache.mark_dirty(key);

        cache.discard();

        assert_eq!(cache.dirty_chunk_count(), 0);

        let reloaded = cache.get(&store, key)?;
        assert_eq!(
            reloaded.span_at(&config, 1, 5),
            crate::chunks::MAX_SPAN_IDENTITY,
        );

        Ok(())
    }

    #[test]
    fn dirty_chunks_spill_on_eviction() -> Result<()> {
        let config = SlasherConfig {
            chunk_cache_capacity: 1,
            ..test_config()
        };

        let store = build_store(config);
        let mut cache = ChunkCache::new(config);

        let first = ChunkKey::new(&config, SpanKind::Min, 1, 1)?;
        cache.get_mut(&store, first)?.update(&config, 1, 1, 1, 3)?;
        cache.mark_dirty(first);

        // Touching a second chunk evicts the first into the spill buffer.
        let second = ChunkKey::new(&config, SpanKind::Min, 1, 5)?;
        cache.get(&store, second)?;

        assert_eq!(cache.dirty_chunk_count(), 1);

        // Reloading the spilled chunk keeps its pending update and its
        // dirtiness.
        let chunk = cache.get(&store, first)?;
        assert_eq!(chunk.span_at(&config, 1, 1), 2);
        assert_eq!(cache.dirty_chunk_count(), 1);

        store.write_batch(cache.flush_pairs()?)?;
        cache.commit_flush();

        let persisted = store.load_chunk(first)?.expect("spilled chunk was flushed");
        assert_eq!(persisted.span_at(&config, 1, 1), 2);

        Ok(())
    }

    #[test]
    fn corrupt_chunks_are_contained_as_blanks() -> Result<()> {
        let config = test_config();
        let store = build_store(config);
        let key = ChunkKey::new(&config, SpanKind::Min, 0, 0)?;

        store.write_batch([(key.to_bytes().to_vec(), b"garbage".to_vec())])?;

        let mut cache = ChunkCache::new(config);
        let chunk = cache.get(&store, key)?;

        assert_eq!(
            chunk.span_at(&config, 0, 0),
            crate::chunks::MIN_SPAN_IDENTITY,
        );

        Ok(())
    }

    #[test]
    fn purge_epoch_slot_drops_only_that_slot() -> Result<()> {
        let config = test_config();
        let store = build_store(config);
        let mut cache = ChunkCache::new(config);

        let in_slot = ChunkKey::new(&config, SpanKind::Min, 1, 5)?;
        let other_slot = ChunkKey::new(&config, SpanKind::Min, 1, 9)?;

        cache.get_mut(&store, in_slot)?.update(&config, 1, 5, 5, 7)?;
        cache.mark_dirty(in_slot);
        cache
            .get_mut(&store, other_slot)?
            .update(&config, 1, 9, 9, 11)?;
        cache.mark_dirty(other_slot);

        cache.purge_epoch_slot(in_slot.epoch_chunk);

        assert_eq!(cache.dirty_chunk_count(), 1);

        Ok(())
    }

    #[test]
    fn read_cache_invalidates_on_generation_change() -> Result<()> {
        let config = test_config();
        let store = build_store(config);
        let capacity = NonZeroUsize::new(8).expect("capacity is nonzero");
        let mut read_cache = ReadCache::new(config, capacity);

        read_cache.sync_generation(0);
        assert_eq!(
            read_cache.span_at(&store, SpanKind::Min, 1, 5)?,
            crate::chunks::MIN_SPAN_IDENTITY,
        );

        // The writer flushes an update; the read cache still holds the old
        // chunk until its generation is synced.
        let key = ChunkKey::new(&config, SpanKind::Min, 1, 5)?;
        let mut chunk = SpanChunk::blank(&config, SpanKind::Min);
        chunk.update(&config, 1, 5, 5, 7)?;
        store.write_batch([(key.to_bytes().to_vec(), chunk.encode()?)])?;

        assert_eq!(
            read_cache.span_at(&store, SpanKind::Min, 1, 5)?,
            crate::chunks::MIN_SPAN_IDENTITY,
        );

        read_cache.sync_generation(1);
        assert_eq!(read_cache.span_at(&store, SpanKind::Min, 1, 5)?, 2);

        Ok(())
    }
}
