//! Identity gallery: enrolled employees and their reference embeddings.
//!
//! Reads are lock-free snapshots (`Arc` of an immutable map). Writes are
//! serialized by the store mutex and follow write-then-acknowledge: the next
//! identity value is persisted through the [`GalleryStore`] first and only
//! published to memory once the store accepted it.

use crate::types::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MAX_EMBEDDINGS_PER_IDENTITY: usize = 50;
const MAX_NAME_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("an identity named '{0}' already exists")]
    DuplicateIdentity(String),
    #[error("no identity with id {0}")]
    UnknownIdentity(IdentityId),
    #[error("invalid identity name: {0}")]
    InvalidName(String),
    #[error("embedding dimension mismatch: gallery holds {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("enrollment carried no embeddings")]
    NoEmbeddings,
    #[error("gallery backend is inconsistent: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stable identity identifier (UUID v4 text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What to do when enrollment targets a name that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReenrollPolicy {
    /// Swap the whole reference set for the new samples.
    #[default]
    Replace,
    /// Add the new samples, keeping the newest up to the per-identity cap.
    Append,
}

impl FromStr for ReenrollPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            other => Err(format!("unknown re-enrollment policy '{other}' (expected replace|append)")),
        }
    }
}

/// A gallery-owned embedding. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEmbedding {
    identity_id: IdentityId,
    embedding: Embedding,
    captured_at: DateTime<Utc>,
    quality: Option<f32>,
}

impl ReferenceEmbedding {
    pub fn new(
        identity_id: IdentityId,
        embedding: Embedding,
        captured_at: DateTime<Utc>,
        quality: Option<f32>,
    ) -> Self {
        Self { identity_id, embedding, captured_at, quality }
    }

    pub fn identity_id(&self) -> &IdentityId {
        &self.identity_id
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn quality(&self) -> Option<f32> {
        self.quality
    }
}

/// An embedding produced by enrollment, not yet owned by any identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEmbedding {
    pub embedding: Embedding,
    pub quality: f32,
    pub captured_at: DateTime<Utc>,
}

/// One enrolled employee.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    id: IdentityId,
    name: String,
    embeddings: Vec<ReferenceEmbedding>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Identity {
    /// Rebuild an identity from persisted parts. Used by store backends.
    pub fn restore(
        id: IdentityId,
        name: String,
        embeddings: Vec<ReferenceEmbedding>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self { id, name, embeddings, created_at, updated_at }
    }

    fn new(name: String, now: DateTime<Utc>) -> Self {
        Self {
            id: IdentityId::generate(),
            name,
            embeddings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &IdentityId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn embeddings(&self) -> &[ReferenceEmbedding] {
        &self.embeddings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            embedding_count: self.embeddings.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Keep only the newest `max` embeddings (capture order is insertion order).
    fn truncate_oldest(&mut self, max: usize) {
        if self.embeddings.len() > max {
            let excess = self.embeddings.len() - max;
            self.embeddings.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub name: String,
    pub embedding_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GalleryStats {
    pub identities: usize,
    pub embeddings: usize,
    pub avg_embeddings_per_identity: f32,
}

/// Persistence backend for the gallery.
///
/// `save` must replace the stored identity atomically (all of its embeddings
/// or none of them).
pub trait GalleryStore: Send {
    fn load_all(&mut self) -> Result<Vec<Identity>, StoreError>;
    fn save(&mut self, identity: &Identity) -> Result<(), StoreError>;
    fn delete(&mut self, id: &IdentityId) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryRows {
    rows: BTreeMap<IdentityId, Identity>,
    fail_writes: bool,
    writes: usize,
}

/// In-process store. Clones share the same rows, so a caller can keep a
/// handle to inspect what the gallery persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryRows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for identity in identities {
                inner.rows.insert(identity.id.clone(), identity);
            }
        }
        store
    }

    /// Make every following `save`/`delete` fail until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Copy of the persisted rows.
    pub fn rows(&self) -> BTreeMap<IdentityId, Identity> {
        self.lock().rows.clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRows> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GalleryStore for MemoryStore {
    fn load_all(&mut self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.lock().rows.values().cloned().collect())
    }

    fn save(&mut self, identity: &Identity) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Unavailable("memory store write failure injected".into()));
        }
        inner.rows.insert(identity.id.clone(), identity.clone());
        inner.writes += 1;
        Ok(())
    }

    fn delete(&mut self, id: &IdentityId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Unavailable("memory store write failure injected".into()));
        }
        inner.rows.remove(id);
        inner.writes += 1;
        Ok(())
    }
}

type IdentityMap = BTreeMap<IdentityId, Arc<Identity>>;

/// Immutable view of the gallery at one instant.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    identities: Arc<IdentityMap>,
}

impl GallerySnapshot {
    /// Every reference embedding with its owning identity id.
    pub fn iter(&self) -> impl Iterator<Item = (&IdentityId, &ReferenceEmbedding)> + '_ {
        self.identities
            .values()
            .flat_map(|identity| identity.embeddings.iter().map(move |e| (&identity.id, e)))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> + '_ {
        self.identities.values().map(|i| i.as_ref())
    }

    pub fn get(&self, id: &IdentityId) -> Option<&Identity> {
        self.identities.get(id).map(|i| i.as_ref())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn embedding_count(&self) -> usize {
        self.identities.values().map(|i| i.embeddings.len()).sum()
    }

    fn find_by_name(&self, name: &str) -> Option<&Arc<Identity>> {
        let key = normalize_name(name);
        self.identities.values().find(|i| normalize_name(&i.name) == key)
    }

    fn dimension(&self) -> Option<usize> {
        self.iter().next().map(|(_, e)| e.embedding.dimension())
    }
}

/// Names compare case-insensitively after trimming.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn validate_name(name: &str) -> Result<String, GalleryError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GalleryError::InvalidName("name is empty".into()));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(GalleryError::InvalidName(format!("name exceeds {MAX_NAME_LEN} characters")));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(GalleryError::InvalidName("name contains control characters".into()));
    }
    Ok(trimmed.to_string())
}

pub struct Gallery {
    store: Mutex<Box<dyn GalleryStore>>,
    current: RwLock<GallerySnapshot>,
    max_embeddings: usize,
}

impl Gallery {
    /// Load every identity from `store`. Duplicate ids or names, or embeddings
    /// tagged with a foreign identity, are rejected.
    pub fn open(store: impl GalleryStore + 'static) -> Result<Self, GalleryError> {
        let mut store: Box<dyn GalleryStore> = Box::new(store);
        let loaded = store.load_all()?;

        let mut map = IdentityMap::new();
        let mut names = HashSet::new();
        for identity in loaded {
            if !names.insert(normalize_name(&identity.name)) {
                return Err(GalleryError::Inconsistent(format!(
                    "duplicate identity name '{}'",
                    identity.name
                )));
            }
            if let Some(orphan) = identity.embeddings.iter().find(|e| e.identity_id != identity.id) {
                return Err(GalleryError::Inconsistent(format!(
                    "identity {} holds an embedding owned by {}",
                    identity.id, orphan.identity_id
                )));
            }
            let id = identity.id.clone();
            if map.insert(id.clone(), Arc::new(identity)).is_some() {
                return Err(GalleryError::Inconsistent(format!("duplicate identity id {id}")));
            }
        }

        let snapshot = GallerySnapshot { identities: Arc::new(map) };
        tracing::info!(
            identities = snapshot.len(),
            embeddings = snapshot.embedding_count(),
            "gallery loaded"
        );

        Ok(Self {
            store: Mutex::new(store),
            current: RwLock::new(snapshot),
            max_embeddings: DEFAULT_MAX_EMBEDDINGS_PER_IDENTITY,
        })
    }

    /// Cap the number of reference embeddings kept per identity (minimum 1).
    pub fn with_max_embeddings(mut self, max: usize) -> Self {
        self.max_embeddings = max.max(1);
        self
    }

    /// Current immutable snapshot of all reference embeddings.
    pub fn all_embeddings(&self) -> GallerySnapshot {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, id: &IdentityId) -> Option<Identity> {
        self.all_embeddings().get(id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Identity> {
        self.all_embeddings().find_by_name(name).map(|i| i.as_ref().clone())
    }

    pub fn list(&self) -> Vec<IdentitySummary> {
        let mut out: Vec<_> = self.all_embeddings().identities().map(Identity::summary).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn stats(&self) -> GalleryStats {
        let snapshot = self.all_embeddings();
        let identities = snapshot.len();
        let embeddings = snapshot.embedding_count();
        GalleryStats {
            identities,
            embeddings,
            avg_embeddings_per_identity: if identities == 0 {
                0.0
            } else {
                embeddings as f32 / identities as f32
            },
        }
    }

    /// Create an identity with no embeddings.
    pub fn add_identity(&self, name: &str) -> Result<Identity, GalleryError> {
        let name = validate_name(name)?;
        let mut store = self.lock_store();
        let current = self.all_embeddings();
        if current.find_by_name(&name).is_some() {
            return Err(GalleryError::DuplicateIdentity(name));
        }

        let identity = Identity::new(name, Utc::now());
        store.save(&identity)?;
        self.publish(&current, identity.clone());
        tracing::info!(id = %identity.id, name = %identity.name, "identity added");
        Ok(identity)
    }

    /// Append one embedding to an existing identity.
    pub fn add_embedding(
        &self,
        id: &IdentityId,
        embedding: Embedding,
    ) -> Result<ReferenceEmbedding, GalleryError> {
        let mut store = self.lock_store();
        let current = self.all_embeddings();
        let existing = current
            .get(id)
            .ok_or_else(|| GalleryError::UnknownIdentity(id.clone()))?;
        check_dimension(&current, embedding.dimension())?;

        let now = Utc::now();
        let reference = ReferenceEmbedding::new(id.clone(), embedding, now, None);
        let mut next = existing.clone();
        next.embeddings.push(reference.clone());
        next.truncate_oldest(self.max_embeddings);
        next.updated_at = now;

        store.save(&next)?;
        self.publish(&current, next);
        tracing::debug!(id = %id, "embedding added");
        Ok(reference)
    }

    /// Delete an identity and every embedding it owns.
    pub fn remove_identity(&self, id: &IdentityId) -> Result<Identity, GalleryError> {
        let mut store = self.lock_store();
        let current = self.all_embeddings();
        let removed = current
            .get(id)
            .cloned()
            .ok_or_else(|| GalleryError::UnknownIdentity(id.clone()))?;

        store.delete(id)?;
        let mut map = (*current.identities).clone();
        map.remove(id);
        self.replace(GallerySnapshot { identities: Arc::new(map) });
        tracing::info!(id = %id, name = %removed.name, "identity removed");
        Ok(removed)
    }

    /// Persist the outcome of an enrollment session in a single store write.
    ///
    /// A new name creates an identity; an existing name is re-enrolled per
    /// `policy`. Either all candidates become visible or none do.
    pub fn commit_enrollment(
        &self,
        name: &str,
        candidates: Vec<CandidateEmbedding>,
        policy: ReenrollPolicy,
    ) -> Result<Identity, GalleryError> {
        let name = validate_name(name)?;
        if candidates.is_empty() {
            return Err(GalleryError::NoEmbeddings);
        }

        let mut store = self.lock_store();
        let current = self.all_embeddings();
        let now = Utc::now();

        let (mut next, reenrolled) = match current.find_by_name(&name) {
            Some(existing) => {
                let mut next = existing.as_ref().clone();
                if policy == ReenrollPolicy::Replace {
                    next.embeddings.clear();
                }
                next.updated_at = now;
                (next, true)
            }
            None => (Identity::new(name, now), false),
        };

        // Embeddings that survive this commit fix the dimension.
        let expected = next
            .embeddings
            .first()
            .map(|e| e.embedding.dimension())
            .or_else(|| {
                current
                    .iter()
                    .find(|(id, _)| **id != next.id)
                    .map(|(_, e)| e.embedding.dimension())
            })
            .unwrap_or_else(|| candidates[0].embedding.dimension());
        if let Some(bad) = candidates.iter().find(|c| c.embedding.dimension() != expected) {
            return Err(GalleryError::DimensionMismatch {
                expected,
                got: bad.embedding.dimension(),
            });
        }

        next.embeddings.extend(candidates.into_iter().map(|c| {
            ReferenceEmbedding::new(next.id.clone(), c.embedding, c.captured_at, Some(c.quality))
        }));
        next.truncate_oldest(self.max_embeddings);

        store.save(&next)?;
        self.publish(&current, next.clone());
        tracing::info!(
            id = %next.id,
            name = %next.name,
            embeddings = next.embeddings.len(),
            reenrolled,
            ?policy,
            "enrollment committed"
        );
        Ok(next)
    }

    fn lock_store(&self) -> MutexGuard<'_, Box<dyn GalleryStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `identity` on top of `base`. Caller holds the store lock.
    fn publish(&self, base: &GallerySnapshot, identity: Identity) {
        let mut map = (*base.identities).clone();
        map.insert(identity.id.clone(), Arc::new(identity));
        self.replace(GallerySnapshot { identities: Arc::new(map) });
    }

    fn replace(&self, snapshot: GallerySnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

fn check_dimension(snapshot: &GallerySnapshot, got: usize) -> Result<(), GalleryError> {
    match snapshot.dimension() {
        Some(expected) if expected != got => Err(GalleryError::DimensionMismatch { expected, got }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn candidate(values: &[f32]) -> CandidateEmbedding {
        CandidateEmbedding { embedding: emb(values), quality: 0.9, captured_at: Utc::now() }
    }

    fn gallery() -> (Gallery, MemoryStore) {
        let store = MemoryStore::new();
        let gallery = Gallery::open(store.clone()).expect("empty store opens");
        (gallery, store)
    }

    #[test]
    fn test_add_identity_persists_before_publishing() {
        let (gallery, store) = gallery();
        let alice = gallery.add_identity("  Alice ").unwrap();
        assert_eq!(alice.name(), "Alice");
        assert!(alice.embeddings().is_empty());
        assert!(store.rows().contains_key(alice.id()));
        assert_eq!(gallery.get(alice.id()), Some(alice));
    }

    #[test]
    fn test_duplicate_name_rejected_case_insensitively() {
        let (gallery, _) = gallery();
        gallery.add_identity("Alice").unwrap();
        assert!(matches!(
            gallery.add_identity("ALICE "),
            Err(GalleryError::DuplicateIdentity(_))
        ));
    }

    #[test]
    fn test_blank_name_rejected() {
        let (gallery, _) = gallery();
        assert!(matches!(gallery.add_identity("   "), Err(GalleryError::InvalidName(_))));
        assert!(matches!(gallery.add_identity("a\nb"), Err(GalleryError::InvalidName(_))));
    }

    #[test]
    fn test_add_embedding_unknown_identity() {
        let (gallery, _) = gallery();
        let ghost = IdentityId::generate();
        assert!(matches!(
            gallery.add_embedding(&ghost, emb(&[1.0, 0.0])),
            Err(GalleryError::UnknownIdentity(id)) if id == ghost
        ));
    }

    #[test]
    fn test_add_embedding_dimension_mismatch() {
        let (gallery, _) = gallery();
        let alice = gallery.add_identity("alice").unwrap();
        gallery.add_embedding(alice.id(), emb(&[1.0, 0.0])).unwrap();
        assert!(matches!(
            gallery.add_embedding(alice.id(), emb(&[1.0, 0.0, 0.0])),
            Err(GalleryError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_remove_identity_removes_all_embeddings() {
        let (gallery, store) = gallery();
        let alice = gallery.commit_enrollment("alice", vec![candidate(&[1.0, 0.0]); 3], ReenrollPolicy::Replace).unwrap();
        let bob = gallery.commit_enrollment("bob", vec![candidate(&[0.0, 1.0])], ReenrollPolicy::Replace).unwrap();

        gallery.remove_identity(alice.id()).unwrap();

        let snapshot = gallery.all_embeddings();
        assert!(snapshot.iter().all(|(id, _)| id == bob.id()));
        assert_eq!(snapshot.embedding_count(), 1);
        assert!(!store.rows().contains_key(alice.id()));
        assert!(matches!(
            gallery.remove_identity(alice.id()),
            Err(GalleryError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_snapshot_unaffected_by_later_writes() {
        let (gallery, _) = gallery();
        let alice = gallery.commit_enrollment("alice", vec![candidate(&[1.0, 0.0])], ReenrollPolicy::Replace).unwrap();
        let before = gallery.all_embeddings();

        gallery.remove_identity(alice.id()).unwrap();
        gallery.add_identity("carol").unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before.iter().count(), 1);
        assert!(gallery.all_embeddings().get(alice.id()).is_none());
    }

    #[test]
    fn test_store_failure_leaves_memory_untouched() {
        let (gallery, store) = gallery();
        let alice = gallery.commit_enrollment("alice", vec![candidate(&[1.0, 0.0])], ReenrollPolicy::Replace).unwrap();
        let rows_before = store.rows();
        store.fail_writes(true);

        assert!(matches!(gallery.add_identity("bob"), Err(GalleryError::Store(_))));
        assert!(matches!(gallery.remove_identity(alice.id()), Err(GalleryError::Store(_))));
        assert!(matches!(
            gallery.commit_enrollment("alice", vec![candidate(&[0.0, 1.0])], ReenrollPolicy::Replace),
            Err(GalleryError::Store(_))
        ));

        assert!(gallery.find_by_name("bob").is_none());
        assert_eq!(gallery.get(alice.id()).map(|a| a.embeddings().len()), Some(1));
        assert_eq!(store.rows(), rows_before);
    }

    #[test]
    fn test_reenroll_replace_swaps_reference_set() {
        let (gallery, _) = gallery();
        let first = gallery.commit_enrollment("alice", vec![candidate(&[1.0, 0.0]); 3], ReenrollPolicy::Replace).unwrap();
        let second = gallery.commit_enrollment("Alice", vec![candidate(&[0.6, 0.8]); 2], ReenrollPolicy::Replace).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.embeddings().len(), 2);
        assert!(second.embeddings().iter().all(|e| e.embedding().values == vec![0.6, 0.8]));
        assert_eq!(gallery.stats().identities, 1);
    }

    #[test]
    fn test_reenroll_append_caps_at_newest() {
        let store = MemoryStore::new();
        let gallery = Gallery::open(store).unwrap().with_max_embeddings(4);
        gallery.commit_enrollment("alice", vec![candidate(&[1.0, 0.0]); 3], ReenrollPolicy::Append).unwrap();
        let alice = gallery.commit_enrollment("alice", vec![candidate(&[0.0, 1.0]); 3], ReenrollPolicy::Append).unwrap();

        let values: Vec<_> = alice.embeddings().iter().map(|e| e.embedding().values.clone()).collect();
        assert_eq!(values.len(), 4);
        assert_eq!(values[0], vec![1.0, 0.0]);
        assert!(values[1..].iter().all(|v| v == &vec![0.0, 1.0]));
    }

    #[test]
    fn test_commit_enrollment_without_embeddings() {
        let (gallery, store) = gallery();
        assert!(matches!(
            gallery.commit_enrollment("alice", Vec::new(), ReenrollPolicy::Replace),
            Err(GalleryError::NoEmbeddings)
        ));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_open_rejects_duplicate_names() {
        let now = Utc::now();
        let a = Identity::restore(IdentityId::generate(), "Alice".into(), vec![], now, now);
        let b = Identity::restore(IdentityId::generate(), "alice".into(), vec![], now, now);
        let store = MemoryStore::with_identities([a, b]);
        assert!(matches!(Gallery::open(store), Err(GalleryError::Inconsistent(_))));
    }

    #[test]
    fn test_open_rejects_orphan_embeddings() {
        let now = Utc::now();
        let owner = IdentityId::generate();
        let stray = ReferenceEmbedding::new(IdentityId::generate(), emb(&[1.0]), now, None);
        let a = Identity::restore(owner, "alice".into(), vec![stray], now, now);
        assert!(matches!(
            Gallery::open(MemoryStore::with_identities([a])),
            Err(GalleryError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_stats_and_list() {
        let (gallery, _) = gallery();
        assert_eq!(gallery.stats().avg_embeddings_per_identity, 0.0);
        gallery.commit_enrollment("bob", vec![candidate(&[1.0, 0.0]); 2], ReenrollPolicy::Replace).unwrap();
        gallery.commit_enrollment("alice", vec![candidate(&[0.0, 1.0]); 4], ReenrollPolicy::Replace).unwrap();

        let stats = gallery.stats();
        assert_eq!(stats.identities, 2);
        assert_eq!(stats.embeddings, 6);
        assert!((stats.avg_embeddings_per_identity - 3.0).abs() < 1e-6);

        let names: Vec<_> = gallery.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn test_reenroll_policy_from_str() {
        assert_eq!("Append".parse::<ReenrollPolicy>(), Ok(ReenrollPolicy::Append));
        assert_eq!(" replace".parse::<ReenrollPolicy>(), Ok(ReenrollPolicy::Replace));
        assert!("merge".parse::<ReenrollPolicy>().is_err());
    }
}
