//! SQLite persistence for the identity gallery.
//!
//! Schema is versioned through `PRAGMA user_version`; each step lives in
//! `schemas/schema_vN.sql`. Embeddings are stored as little-endian `f32`
//! blobs and cascade with their identity.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use facegate_core::{Embedding, GalleryStore, Identity, IdentityId, ReferenceEmbedding, StoreError};
use rusqlite::{params, Connection, Transaction};
use std::path::Path;
use std::time::Duration;

const CURRENT_SCHEMA_VERSION: i32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) the database at `path` and bring its schema
/// up to date.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL mode")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({}) is newer than supported schema ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    tracing::info!(version = CURRENT_SCHEMA_VERSION, "database schema migrated");
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => {
            tx.execute_batch(include_str!("schemas/schema_v1.sql"))
                .context("failed to execute schema_v1.sql")?;
            Ok(())
        }
        _ => bail!("no migration defined for version {version}"),
    }
}

pub(crate) fn parse_datetime(value: &str, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("invalid {column} '{value}': {err}")))
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    if blob.len() != dimension * 4 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob is {} bytes, expected {} for dimension {dimension}",
            blob.len(),
            dimension * 4
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Gallery store backed by one SQLite connection.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: open_connection(path)? })
    }

    fn load_embeddings(&self, id: &IdentityId) -> Result<Vec<ReferenceEmbedding>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT dimension, vector, model_version, quality, captured_at
                 FROM embeddings WHERE identity_id = ?1 ORDER BY id ASC",
            )
            .map_err(StoreError::backend)?;
        let mut rows = stmt.query(params![id.as_str()]).map_err(StoreError::backend)?;

        let mut embeddings = Vec::new();
        while let Some(row) = rows.next().map_err(StoreError::backend)? {
            let dimension: i64 = row.get(0).map_err(StoreError::backend)?;
            let blob: Vec<u8> = row.get(1).map_err(StoreError::backend)?;
            let model_version: Option<String> = row.get(2).map_err(StoreError::backend)?;
            let quality: Option<f64> = row.get(3).map_err(StoreError::backend)?;
            let captured_at: String = row.get(4).map_err(StoreError::backend)?;

            let dimension = usize::try_from(dimension)
                .map_err(|_| StoreError::Corrupt(format!("negative dimension {dimension}")))?;
            let embedding = Embedding {
                values: decode_vector(&blob, dimension)?,
                model_version,
            };
            embeddings.push(ReferenceEmbedding::new(
                id.clone(),
                embedding,
                parse_datetime(&captured_at, "captured_at")?,
                quality.map(|q| q as f32),
            ));
        }
        Ok(embeddings)
    }
}

impl GalleryStore for SqliteStore {
    fn load_all(&mut self) -> Result<Vec<Identity>, StoreError> {
        let heads: Vec<(String, String, String, String)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, name, created_at, updated_at FROM identities ORDER BY created_at ASC")
                .map_err(StoreError::backend)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
                .map_err(StoreError::backend)?;
            rows.collect::<Result<_, _>>().map_err(StoreError::backend)?
        };

        let mut identities = Vec::with_capacity(heads.len());
        for (id, name, created_at, updated_at) in heads {
            let id = IdentityId::from(id);
            let embeddings = self.load_embeddings(&id)?;
            identities.push(Identity::restore(
                id,
                name,
                embeddings,
                parse_datetime(&created_at, "created_at")?,
                parse_datetime(&updated_at, "updated_at")?,
            ));
        }
        tracing::debug!(identities = identities.len(), "loaded gallery from sqlite");
        Ok(identities)
    }

    fn save(&mut self, identity: &Identity) -> Result<(), StoreError> {
        let tx = self.conn.transaction().map_err(StoreError::backend)?;
        tx.execute(
            "INSERT INTO identities (id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
            params![
                identity.id().as_str(),
                identity.name(),
                identity.created_at().to_rfc3339(),
                identity.updated_at().to_rfc3339(),
            ],
        )
        .map_err(StoreError::backend)?;
        tx.execute(
            "DELETE FROM embeddings WHERE identity_id = ?1",
            params![identity.id().as_str()],
        )
        .map_err(StoreError::backend)?;
        {
            let mut insert = tx
                .prepare_cached(
                    "INSERT INTO embeddings (identity_id, dimension, vector, model_version, quality, captured_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(StoreError::backend)?;
            for reference in identity.embeddings() {
                let embedding = reference.embedding();
                insert
                    .execute(params![
                        identity.id().as_str(),
                        embedding.dimension() as i64,
                        encode_vector(&embedding.values),
                        embedding.model_version,
                        reference.quality().map(f64::from),
                        reference.captured_at().to_rfc3339(),
                    ])
                    .map_err(StoreError::backend)?;
            }
        }
        tx.commit().map_err(StoreError::backend)?;
        Ok(())
    }

    fn delete(&mut self, id: &IdentityId) -> Result<(), StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id.as_str()])
            .map_err(StoreError::backend)?;
        if removed == 0 {
            tracing::warn!(identity = %id, "delete of identity with no stored row");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{CandidateEmbedding, Gallery, ReenrollPolicy};
    use tempfile::TempDir;

    fn candidates(seed: f32, n: usize) -> Vec<CandidateEmbedding> {
        (0..n)
            .map(|i| {
                let mut embedding = Embedding::new(vec![1.0, seed, i as f32 * 0.01, 0.5]);
                embedding.l2_normalize();
                CandidateEmbedding {
                    embedding,
                    quality: 0.8,
                    captured_at: Utc::now(),
                }
            })
            .collect()
    }

    fn count(path: &Path, table: &str) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_gallery_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facegate.db");

        let (alice, bob) = {
            let gallery = Gallery::open(SqliteStore::open(&path).unwrap()).unwrap();
            let alice = gallery
                .commit_enrollment("alice", candidates(0.1, 3), ReenrollPolicy::Replace)
                .unwrap();
            let bob = gallery
                .commit_enrollment("bob", candidates(-0.4, 2), ReenrollPolicy::Replace)
                .unwrap();
            (alice, bob)
        };

        let reopened = Gallery::open(SqliteStore::open(&path).unwrap()).unwrap();
        let restored = reopened.get(alice.id()).unwrap();
        assert_eq!(restored.name(), "alice");
        assert_eq!(restored.embeddings(), alice.embeddings());
        assert_eq!(reopened.get(bob.id()).unwrap().embeddings().len(), 2);
        assert_eq!(reopened.stats().embeddings, 5);
    }

    #[test]
    fn test_reenroll_replaces_stored_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facegate.db");
        let gallery = Gallery::open(SqliteStore::open(&path).unwrap()).unwrap();

        let first = gallery
            .commit_enrollment("alice", candidates(0.1, 4), ReenrollPolicy::Replace)
            .unwrap();
        let second = gallery
            .commit_enrollment("alice", candidates(0.2, 2), ReenrollPolicy::Replace)
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(count(&path, "identities"), 1);
        assert_eq!(count(&path, "embeddings"), 2);
    }

    #[test]
    fn test_remove_cascades_to_embeddings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facegate.db");
        let gallery = Gallery::open(SqliteStore::open(&path).unwrap()).unwrap();

        let alice = gallery
            .commit_enrollment("alice", candidates(0.1, 3), ReenrollPolicy::Replace)
            .unwrap();
        gallery
            .commit_enrollment("bob", candidates(-0.4, 2), ReenrollPolicy::Replace)
            .unwrap();
        gallery.remove_identity(alice.id()).unwrap();

        assert_eq!(count(&path, "identities"), 1);
        assert_eq!(count(&path, "embeddings"), 2);
    }

    #[test]
    fn test_truncated_blob_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facegate.db");
        let mut store = SqliteStore::open(&path).unwrap();
        let now = Utc::now().to_rfc3339();
        store
            .conn
            .execute(
                "INSERT INTO identities (id, name, created_at, updated_at) VALUES ('x', 'x', ?1, ?1)",
                params![now],
            )
            .unwrap();
        store
            .conn
            .execute(
                "INSERT INTO embeddings (identity_id, dimension, vector, captured_at)
                 VALUES ('x', 4, ?1, ?2)",
                params![vec![0u8; 10], now],
            )
            .unwrap();

        assert!(matches!(store.load_all(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("facegate.db");
        drop(SqliteStore::open(&path).unwrap());
        Connection::open(&path)
            .unwrap()
            .pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1)
            .unwrap();

        assert!(SqliteStore::open(&path).is_err());
    }

    #[test]
    fn test_vector_encoding_is_little_endian() {
        assert_eq!(encode_vector(&[1.0]), vec![0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(decode_vector(&[0x00, 0x00, 0x80, 0x3f], 1).unwrap(), vec![1.0]);
    }
}
