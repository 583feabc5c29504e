use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::chunk::{ChunkingConfig, TextSpan};
use crate::error::IndexError;

/// Identifies one embedding of one document. Any change to the text, the
/// embedder or the chunking parameters produces a different key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub source: String,
    pub text_hash: String,
    pub embedder: String,
    pub chunk_size: usize,
    pub overlap: usize,
}

impl CacheKey {
    pub fn new(source: &str, text: &str, embedder: &str, chunking: &ChunkingConfig) -> Self {
        Self {
            source: source.to_string(),
            text_hash: hex_sha256(text),
            embedder: embedder.to_string(),
            chunk_size: chunking.max_chars(),
            overlap: chunking.overlap(),
        }
    }
}

/// Chunks and vectors of indexed documents, persisted in SQLite.
///
/// A regenerable cache: deleting the file only costs re-embedding.
pub struct IndexCache {
    conn: Mutex<Connection>,
}

impl IndexCache {
    /// Open (or create) the cache database.
    pub fn new(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IndexError::load(db_path.display().to_string(), e))?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, IndexError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                hash TEXT NOT NULL,
                embedder TEXT NOT NULL,
                chunk_size INTEGER NOT NULL,
                overlap INTEGER NOT NULL,
                indexed_at INTEGER NOT NULL,
                UNIQUE (source, hash, embedder, chunk_size, overlap)
            );

            CREATE TABLE IF NOT EXISTS chunks (
                document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                text TEXT NOT NULL,
                vector BLOB NOT NULL,
                PRIMARY KEY (document_id, position)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, IndexError> {
        self.conn.lock().map_err(|_| IndexError::CacheLock)
    }

    /// Cached chunks for `key`, in position order, or `None` on a miss.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<Vec<(TextSpan, Vec<f32>)>>, IndexError> {
        let conn = self.lock_conn()?;

        let document_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM documents
                 WHERE source = ?1 AND hash = ?2 AND embedder = ?3
                   AND chunk_size = ?4 AND overlap = ?5",
                params![
                    key.source,
                    key.text_hash,
                    key.embedder,
                    key.chunk_size as i64,
                    key.overlap as i64
                ],
                |row| row.get(0),
            )
            .ok();

        let Some(document_id) = document_id else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT start_byte, end_byte, start_line, end_line, text, vector
             FROM chunks WHERE document_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map([document_id], |row| {
                let blob: Vec<u8> = row.get(5)?;
                Ok((
                    TextSpan {
                        start_byte: row.get::<_, i64>(0)? as usize,
                        end_byte: row.get::<_, i64>(1)? as usize,
                        start_line: row.get::<_, i64>(2)? as usize,
                        end_line: row.get::<_, i64>(3)? as usize,
                        text: row.get(4)?,
                    },
                    decode_vector(&blob),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Index cache hit for {} ({} chunks)", key.source, rows.len());
        Ok(Some(rows))
    }

    /// Store the chunks of one document, replacing older entries for the
    /// same source.
    pub fn store(&self, key: &CacheKey, chunks: &[(TextSpan, Vec<f32>)]) -> Result<(), IndexError> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        // Stale versions of this source are never looked up again
        tx.execute(
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE source = ?1)",
            [&key.source],
        )?;
        tx.execute("DELETE FROM documents WHERE source = ?1", [&key.source])?;

        tx.execute(
            "INSERT INTO documents (source, hash, embedder, chunk_size, overlap, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.source,
                key.text_hash,
                key.embedder,
                key.chunk_size as i64,
                key.overlap as i64,
                chrono::Utc::now().timestamp()
            ],
        )?;
        let document_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (document_id, position, start_byte, end_byte, start_line, end_line, text, vector)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (position, (span, vector)) in chunks.iter().enumerate() {
                stmt.execute(params![
                    document_id,
                    position as i64,
                    span.start_byte as i64,
                    span.end_byte as i64,
                    span.start_line as i64,
                    span.end_line as i64,
                    span.text,
                    encode_vector(vector),
                ])?;
            }
        }

        tx.commit()?;
        debug!("Cached {} chunks for {}", chunks.len(), key.source);
        Ok(())
    }
}

pub(crate) fn hex_sha256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(text: &str, line: usize) -> TextSpan {
        TextSpan {
            text: text.to_string(),
            start_byte: 0,
            end_byte: text.len(),
            start_line: line,
            end_line: line,
        }
    }

    #[test]
    fn store_then_lookup() {
        let cache = IndexCache::in_memory().unwrap();
        let key = CacheKey::new("rome.md", "full text", "hashing-v1-4", &ChunkingConfig::default());
        assert!(cache.lookup(&key).unwrap().is_none());

        let chunks = vec![
            (span("Colosseum", 1), vec![0.5, -0.5, 0.25, 0.0]),
            (span("Pantheon", 2), vec![1.0, 0.0, 0.0, 0.0]),
        ];
        cache.store(&key, &chunks).unwrap();

        let cached = cache.lookup(&key).unwrap().unwrap();
        assert_eq!(cached, chunks);
    }

    #[test]
    fn changed_text_or_params_miss() {
        let cache = IndexCache::in_memory().unwrap();
        let cfg = ChunkingConfig::default();
        let key = CacheKey::new("rome.md", "v1", "hashing-v1-4", &cfg);
        cache.store(&key, &[(span("a", 1), vec![1.0])]).unwrap();

        let edited = CacheKey::new("rome.md", "v2", "hashing-v1-4", &cfg);
        assert!(cache.lookup(&edited).unwrap().is_none());

        let rechunked = CacheKey::new(
            "rome.md",
            "v1",
            "hashing-v1-4",
            &ChunkingConfig::new(500, 50).unwrap(),
        );
        assert!(cache.lookup(&rechunked).unwrap().is_none());

        let other_embedder = CacheKey::new("rome.md", "v1", "rig-text-embedding-3-small", &cfg);
        assert!(cache.lookup(&other_embedder).unwrap().is_none());
    }

    #[test]
    fn restore_replaces_old_version() {
        let cache = IndexCache::in_memory().unwrap();
        let cfg = ChunkingConfig::default();
        let old = CacheKey::new("rome.md", "v1", "h", &cfg);
        let new = CacheKey::new("rome.md", "v2", "h", &cfg);
        cache.store(&old, &[(span("old", 1), vec![1.0])]).unwrap();
        cache.store(&new, &[(span("new", 1), vec![1.0])]).unwrap();

        assert!(cache.lookup(&old).unwrap().is_none());
        assert_eq!(cache.lookup(&new).unwrap().unwrap()[0].0.text, "new");
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("index.sqlite");
        let key = CacheKey::new("guide.txt", "text", "h", &ChunkingConfig::default());
        {
            let cache = IndexCache::new(&path).unwrap();
            cache.store(&key, &[(span("text", 1), vec![0.1, 0.2])]).unwrap();
        }
        let cache = IndexCache::new(&path).unwrap();
        let cached = cache.lookup(&key).unwrap().unwrap();
        assert_eq!(cached[0].1, vec![0.1, 0.2]);
    }

    #[test]
    fn sha256_hex() {
        assert_eq!(
            hex_sha256("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
