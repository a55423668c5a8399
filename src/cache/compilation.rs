//! LRU cache of compiled artifacts, keyed by document identity and version.
//!
//! Artifacts live inside the oracle process, so the cache is tied to the
//! oracle generation that produced them.
//! [`CompilationCache::advance_generation`] empties it when a new process
//! starts and late `put`s from the old process are ignored.
//!
//! At most one version per uri is resident. Storing a new version replaces
//! the old one, which could never be hit again.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use log::debug;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::LOG_TARGET;
use crate::error::LockResultExt;
use crate::service::facets::Facet;

/// Compute the FNV-1a 64-bit hash of text content.
#[inline]
pub fn fnv1a_hash(text: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Which version of a document an artifact was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentVersion {
    /// Editor buffer version of an open document.
    Version(i64),
    /// File metadata of a document without an open buffer.
    Fingerprint { modified_ns: u128, len: u64 },
    /// Content hash, when neither of the above is available.
    ContentHash(u64),
}

impl DocumentVersion {
    pub fn for_content(text: &str) -> Self {
        Self::ContentHash(fnv1a_hash(text))
    }

    /// Fingerprint a file on disk from its modification time and length.
    pub fn fingerprint(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified_ns = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Self::Fingerprint {
            modified_ns,
            len: metadata.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub uri: Url,
    pub version: DocumentVersion,
}

impl CacheKey {
    pub fn new(uri: Url, version: DocumentVersion) -> Self {
        Self { uri, version }
    }
}

/// What the oracle produced for one document version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifact {
    /// Oracle-side handle of the compiled program, if it reported one.
    pub handle: Option<String>,
    /// Successful facet results.
    pub facets: BTreeMap<Facet, Value>,
    /// Oracle generation that produced the artifact.
    pub generation: u64,
}

impl Artifact {
    fn size_estimate(&self) -> usize {
        self.facets
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum::<usize>()
            + self.handle.as_ref().map_or(0, String::len)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
    /// Approximate bytes of cached facet data.
    pub bytes: usize,
}

struct Entry {
    version: DocumentVersion,
    artifact: Arc<Artifact>,
    last_access: u64,
    size_estimate: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Url, Entry>,
    tick: u64,
    generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

pub struct CompilationCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl CompilationCache {
    /// Capacity is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Artifact>> {
        let mut state = self.state.lock().recover_poison("CompilationCache::get");
        let tick = state.next_tick();
        let hit = match state.entries.get_mut(&key.uri) {
            Some(entry) if entry.version == key.version => {
                entry.last_access = tick;
                Some(Arc::clone(&entry.artifact))
            }
            _ => None,
        };
        if hit.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        hit
    }

    /// Store an artifact. Returns false when it was produced by an older
    /// oracle generation and therefore dropped.
    pub fn put(&self, key: CacheKey, artifact: Artifact) -> bool {
        let mut state = self.state.lock().recover_poison("CompilationCache::put");
        if artifact.generation != state.generation {
            debug!(
                target: LOG_TARGET,
                "Dropping artifact for {} from generation {} (current {})",
                key.uri,
                artifact.generation,
                state.generation
            );
            return false;
        }

        let replacing = state.entries.contains_key(&key.uri);
        if !replacing && state.entries.len() >= self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(uri, _)| uri.clone());
            if let Some(uri) = oldest {
                state.entries.remove(&uri);
                state.evictions += 1;
                debug!(target: LOG_TARGET, "Evicted compiled artifact for {}", uri);
            }
        }

        let tick = state.next_tick();
        let size_estimate = artifact.size_estimate();
        state.entries.insert(
            key.uri,
            Entry {
                version: key.version,
                artifact: Arc::new(artifact),
                last_access: tick,
                size_estimate,
            },
        );
        true
    }

    /// Drop every version of a document.
    pub fn invalidate(&self, uri: &Url) -> bool {
        self.state
            .lock()
            .recover_poison("CompilationCache::invalidate")
            .entries
            .remove(uri)
            .is_some()
    }

    /// Reset only if `generation` is newer than the cache's. Returns whether
    /// a reset happened.
    pub fn advance_generation(&self, generation: u64) -> bool {
        if generation <= self.generation() {
            return false;
        }
        let mut state = self
            .state
            .lock()
            .recover_poison("CompilationCache::advance_generation");
        if generation <= state.generation {
            return false;
        }
        let dropped = state.entries.len();
        state.entries.clear();
        state.generation = generation;
        debug!(
            target: LOG_TARGET,
            "Compilation cache advanced to generation {} ({} artifact(s) dropped)",
            generation,
            dropped
        );
        true
    }

    pub fn generation(&self) -> u64 {
        self.state
            .lock()
            .recover_poison("CompilationCache::generation")
            .generation
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().recover_poison("CompilationCache::stats");
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
            capacity: self.capacity,
            bytes: state.entries.values().map(|e| e.size_estimate).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///src/{}.pike", name)).unwrap()
    }

    fn key(name: &str, version: i64) -> CacheKey {
        CacheKey::new(uri(name), DocumentVersion::Version(version))
    }

    fn artifact(tag: &str) -> Artifact {
        Artifact {
            handle: Some(tag.to_string()),
            facets: BTreeMap::from([(Facet::Parse, json!({"tag": tag}))]),
            generation: 0,
        }
    }

    #[test]
    fn hit_requires_matching_version() {
        let cache = CompilationCache::new(4);
        cache.put(key("a", 1), artifact("a1"));

        assert_eq!(cache.get(&key("a", 1)).unwrap().handle.as_deref(), Some("a1"));
        assert!(cache.get(&key("a", 2)).is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let cache = CompilationCache::new(3);
        cache.put(key("a", 1), artifact("a"));
        cache.put(key("b", 1), artifact("b"));
        cache.put(key("c", 1), artifact("c"));

        // Touch `a` so `b` becomes the oldest.
        assert!(cache.get(&key("a", 1)).is_some());
        cache.put(key("d", 1), artifact("d"));

        assert!(cache.get(&key("b", 1)).is_none());
        assert!(cache.get(&key("a", 1)).is_some());
        assert!(cache.get(&key("c", 1)).is_some());
        assert!(cache.get(&key("d", 1)).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().size, 3);
    }

    #[test]
    fn new_version_replaces_old_without_eviction() {
        let cache = CompilationCache::new(2);
        cache.put(key("a", 1), artifact("a1"));
        cache.put(key("b", 1), artifact("b1"));
        cache.put(key("a", 2), artifact("a2"));

        assert!(cache.get(&key("a", 1)).is_none());
        assert_eq!(cache.get(&key("a", 2)).unwrap().handle.as_deref(), Some("a2"));
        assert!(cache.get(&key("b", 1)).is_some());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn invalidate_drops_document() {
        let cache = CompilationCache::new(4);
        cache.put(key("a", 1), artifact("a"));
        assert!(cache.invalidate(&uri("a")));
        assert!(!cache.invalidate(&uri("a")));
        assert!(cache.get(&key("a", 1)).is_none());
    }

    #[test]
    fn new_generation_empties_and_rejects_stale_artifacts() {
        let cache = CompilationCache::new(4);
        cache.put(key("a", 1), artifact("a"));

        assert!(cache.advance_generation(1));
        assert_eq!(cache.stats().size, 0);

        // Produced by generation 0, which is gone.
        assert!(!cache.put(key("b", 1), artifact("b")));
        assert!(cache.get(&key("b", 1)).is_none());

        let fresh = Artifact {
            generation: 1,
            ..artifact("b")
        };
        assert!(cache.put(key("b", 1), fresh));
    }

    #[test]
    fn advance_generation_only_moves_forward() {
        let cache = CompilationCache::new(4);
        assert!(cache.advance_generation(1));
        cache.put(key("a", 1), Artifact { generation: 1, ..artifact("a") });

        assert!(!cache.advance_generation(1));
        assert!(!cache.advance_generation(0));
        assert_eq!(cache.stats().size, 1);

        assert!(cache.advance_generation(2));
        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn content_hash_versions_compare_by_content() {
        assert_eq!(
            DocumentVersion::for_content("int x;"),
            DocumentVersion::for_content("int x;")
        );
        assert_ne!(
            DocumentVersion::for_content("int x;"),
            DocumentVersion::for_content("int y;")
        );
        assert_eq!(fnv1a_hash(""), 0xcbf29ce484222325);
    }

    #[test]
    fn fingerprint_tracks_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.pike");
        std::fs::write(&path, "int x;").unwrap();

        let first = DocumentVersion::fingerprint(&path).unwrap();
        assert_eq!(first, DocumentVersion::fingerprint(&path).unwrap());

        std::fs::write(&path, "int x; int y;").unwrap();
        assert_ne!(first, DocumentVersion::fingerprint(&path).unwrap());
    }
}
