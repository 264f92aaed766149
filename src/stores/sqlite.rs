//! SQLite backend with vector search via `sqlite-vec`.
//!
//! One connection serves all tables: chunks + embeddings (vector search),
//! slide-source links (staleness reads), and the image pool with its usage
//! records (transactional serves). Cosine distance comes from
//! `vec_distance_cosine`; similarity is reported as `1.0 - distance`.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, OptionalExtension, ffi};

use super::{ChunkRecord, VectorBackend};
use crate::pool::{ImagePoolEntry, ImageUsageRecord, PoolBackend};
use crate::staleness::{SlideLink, SlideLinkSource};
use crate::types::KbError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    id             TEXT PRIMARY KEY,
    document_id    TEXT NOT NULL,
    document_title TEXT NOT NULL DEFAULT '',
    heading        TEXT,
    chunk_index    INTEGER NOT NULL,
    content        TEXT NOT NULL,
    metadata       TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

CREATE TABLE IF NOT EXISTS chunk_embeddings (
    id         TEXT PRIMARY KEY,
    dim        INTEGER NOT NULL,
    embedding  BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS slide_sources (
    slide_id        TEXT NOT NULL,
    chunk_id        TEXT NOT NULL,
    presentation_id TEXT NOT NULL,
    slide_title     TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (slide_id, chunk_id)
);

CREATE TABLE IF NOT EXISTS image_pool (
    id          TEXT PRIMARY KEY,
    category    TEXT NOT NULL,
    storage_key TEXT NOT NULL,
    prompt      TEXT NOT NULL,
    width       INTEGER NOT NULL,
    height      INTEGER NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_image_pool_category ON image_pool(category);

CREATE TABLE IF NOT EXISTS image_usage (
    user_id       TEXT NOT NULL,
    image_pool_id TEXT NOT NULL,
    slide_id      TEXT,
    served_at     TEXT NOT NULL,
    UNIQUE (user_id, image_pool_id)
);
";

type RawChunkRow = (
    String,
    String,
    String,
    Option<String>,
    i64,
    String,
    String,
);

#[derive(Clone)]
pub struct SqliteKbStore {
    conn: Connection,
}

impl SqliteKbStore {
    /// Opens (creating if needed) a store at `path` and prepares the
    /// schema. Registers the `sqlite-vec` extension process-wide on first
    /// use.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KbError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path.as_ref().to_path_buf())
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;
        conn.call(|conn| {
            conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0))
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|err| KbError::Storage(err.to_string()))?;
        Ok(Self { conn })
    }

    /// In-memory store, used by tests and short-lived pipelines.
    pub async fn open_in_memory() -> Result<Self, KbError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open_in_memory()
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|err| KbError::Storage(err.to_string()))?;
        Ok(Self { conn })
    }

    fn register_sqlite_vec() -> Result<(), KbError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *const c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!(
                        "failed to register sqlite-vec extension (code {rc})"
                    ))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(KbError::Storage)
    }

    /// Underlying connection, for queries not covered by the traits.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Records a chunk→slide link on behalf of the external slide
    /// generation workflow. The staleness path itself never writes links.
    pub async fn record_slide_link(
        &self,
        slide_id: &str,
        chunk_id: &str,
        presentation_id: &str,
        slide_title: &str,
    ) -> Result<(), KbError> {
        let (slide_id, chunk_id, presentation_id, slide_title) = (
            slide_id.to_string(),
            chunk_id.to_string(),
            presentation_id.to_string(),
            slide_title.to_string(),
        );
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO slide_sources \
                     (slide_id, chunk_id, presentation_id, slide_title) VALUES (?1, ?2, ?3, ?4)",
                    (&slide_id, &chunk_id, &presentation_id, &slide_title),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Usage records referencing a pool entry, oldest first. The entry's
    /// `usage_count` always equals the number of rows returned here.
    pub async fn usage_records_for_entry(
        &self,
        entry_id: &str,
    ) -> Result<Vec<ImageUsageRecord>, KbError> {
        let entry_id = entry_id.to_string();
        let rows: Vec<(String, String, Option<String>, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT user_id, image_pool_id, slide_id, served_at \
                         FROM image_usage WHERE image_pool_id = ?1 ORDER BY rowid ASC",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&entry_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;

        rows.into_iter()
            .map(|(user_id, image_pool_id, slide_id, served_at)| {
                let served_at = DateTime::parse_from_rfc3339(&served_at)
                    .map_err(|err| KbError::Storage(format!("bad served_at timestamp: {err}")))?
                    .with_timezone(&Utc);
                Ok(ImageUsageRecord {
                    user_id,
                    image_pool_id,
                    slide_id,
                    served_at,
                })
            })
            .collect()
    }

    /// Embedding dimension of the store, `None` while empty.
    pub async fn embedding_dimension(&self) -> Result<Option<usize>, KbError> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT dim FROM chunk_embeddings LIMIT 1", [], |row| {
                    row.get::<_, i64>(0)
                })
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map(|dim| dim.map(|d| d as usize))
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Rejects batches that mix dimensions or disagree with the store's
    /// fixed dimension before anything is written.
    async fn check_batch_dimension(&self, chunks: &[ChunkRecord]) -> Result<(), KbError> {
        let mut batch_dim: Option<usize> = None;
        for record in chunks {
            if let Some(embedding) = &record.embedding {
                match batch_dim {
                    None => batch_dim = Some(embedding.len()),
                    Some(dim) if dim != embedding.len() => {
                        return Err(KbError::Storage(format!(
                            "mixed embedding dimensions in batch: {dim} vs {}",
                            embedding.len()
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        if let (Some(batch), Some(store)) = (batch_dim, self.embedding_dimension().await?) {
            if batch != store {
                return Err(KbError::Storage(format!(
                    "embedding dimension {batch} does not match store dimension {store}"
                )));
            }
        }
        Ok(())
    }
}

fn chunk_from_row(row: RawChunkRow) -> ChunkRecord {
    let (id, document_id, document_title, heading, chunk_index, content, metadata) = row;
    ChunkRecord {
        id,
        document_id,
        document_title,
        heading,
        chunk_index: usize::try_from(chunk_index).unwrap_or(0),
        content,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        embedding: None,
    }
}

#[async_trait]
impl VectorBackend for SqliteKbStore {
    async fn insert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), KbError> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.check_batch_dimension(&chunks).await?;

        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                for record in &chunks {
                    tx.execute(
                        "INSERT INTO chunks \
                         (id, document_id, document_title, heading, chunk_index, content, metadata) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        (
                            &record.id,
                            &record.document_id,
                            &record.document_title,
                            &record.heading,
                            record.chunk_index as i64,
                            &record.content,
                            record.metadata.to_string(),
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                    if let Some(embedding) = &record.embedding {
                        let vector_json = serde_json::to_string(embedding)
                            .expect("vector of floats serializes");
                        tx.execute(
                            "INSERT INTO chunk_embeddings (id, dim, embedding, created_at) \
                             VALUES (?1, ?2, vec_f32(?3), ?4)",
                            (&record.id, embedding.len() as i64, &vector_json, &now),
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    }
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    async fn get_chunks_by_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<ChunkRecord>, KbError> {
        let document_id = document_id.to_string();
        let rows: Vec<RawChunkRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, document_id, document_title, heading, chunk_index, content, metadata \
                         FROM chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&document_id], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;
        Ok(rows.into_iter().map(chunk_from_row).collect())
    }

    async fn delete_chunks_by_document(&self, document_id: &str) -> Result<usize, KbError> {
        let document_id = document_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "DELETE FROM chunk_embeddings WHERE id IN \
                     (SELECT id FROM chunks WHERE document_id = ?1)",
                    [&document_id],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let deleted = tx
                    .execute("DELETE FROM chunks WHERE document_id = ?1", [&document_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(deleted)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    async fn replace_document_chunks(
        &self,
        document_id: &str,
        chunks: Vec<ChunkRecord>,
    ) -> Result<(), KbError> {
        // Dimension problems must surface before the old set is touched.
        self.check_batch_dimension(&chunks).await?;

        let document_id = document_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "DELETE FROM chunk_embeddings WHERE id IN \
                     (SELECT id FROM chunks WHERE document_id = ?1)",
                    [&document_id],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM chunks WHERE document_id = ?1", [&document_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                for record in &chunks {
                    tx.execute(
                        "INSERT INTO chunks \
                         (id, document_id, document_title, heading, chunk_index, content, metadata) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        (
                            &record.id,
                            &record.document_id,
                            &record.document_title,
                            &record.heading,
                            record.chunk_index as i64,
                            &record.content,
                            record.metadata.to_string(),
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                    if let Some(embedding) = &record.embedding {
                        let vector_json = serde_json::to_string(embedding)
                            .expect("vector of floats serializes");
                        tx.execute(
                            "INSERT INTO chunk_embeddings (id, dim, embedding, created_at) \
                             VALUES (?1, ?2, vec_f32(?3), ?4)",
                            (&record.id, embedding.len() as i64, &vector_json, &now),
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    }
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    async fn search_similar(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<(ChunkRecord, f32)>, KbError> {
        if query_embedding.is_empty() {
            return Err(KbError::InvalidInput("query embedding is empty".into()));
        }
        match self.embedding_dimension().await? {
            // Empty index: no matches rather than an error.
            None => return Ok(Vec::new()),
            Some(dim) if dim != query_embedding.len() => {
                return Err(KbError::Storage(format!(
                    "query dimension {} does not match store dimension {dim}",
                    query_embedding.len()
                )));
            }
            Some(_) => {}
        }

        let embedding_json =
            serde_json::to_string(query_embedding).map_err(|err| KbError::Storage(err.to_string()))?;
        let rows: Vec<(RawChunkRow, f32)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT c.id, c.document_id, c.document_title, c.heading, c.chunk_index, \
                         c.content, c.metadata, \
                         vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance \
                         FROM chunks c \
                         JOIN chunk_embeddings e ON c.id = e.id \
                         ORDER BY distance ASC, e.rowid ASC \
                         LIMIT {top_k}"
                    ))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&embedding_json], |row| {
                        let raw: RawChunkRow = (
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        );
                        let distance: f32 = row.get(7)?;
                        Ok((raw, distance))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(raw, distance)| (chunk_from_row(raw), 1.0 - distance))
            .collect())
    }

    async fn count(&self) -> Result<usize, KbError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(count as usize)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }
}

#[async_trait]
impl SlideLinkSource for SqliteKbStore {
    async fn slide_links_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<SlideLink>, KbError> {
        let document_id = document_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT s.chunk_id, s.slide_id, s.presentation_id, s.slide_title \
                         FROM slide_sources s \
                         JOIN chunks c ON c.id = s.chunk_id \
                         WHERE c.document_id = ?1 \
                         ORDER BY s.rowid ASC",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&document_id], |row| {
                        Ok(SlideLink {
                            chunk_id: row.get(0)?,
                            slide_id: row.get(1)?,
                            presentation_id: row.get(2)?,
                            slide_title: row.get(3)?,
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }
}

type RawPoolRow = (String, String, String, String, i64, i64, i64, String);

fn pool_entry_from_row(row: RawPoolRow) -> Result<ImagePoolEntry, KbError> {
    let (id, category, storage_key, prompt, width, height, usage_count, created_at) = row;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|err| KbError::Storage(format!("bad created_at timestamp: {err}")))?
        .with_timezone(&Utc);
    Ok(ImagePoolEntry {
        id,
        category,
        storage_key,
        prompt,
        width: width as u32,
        height: height as u32,
        usage_count: usage_count as u64,
        created_at,
    })
}

#[async_trait]
impl PoolBackend for SqliteKbStore {
    async fn find_available_entry(
        &self,
        category: &str,
        user_id: &str,
    ) -> Result<Option<ImagePoolEntry>, KbError> {
        let (category, user_id) = (category.to_string(), user_id.to_string());
        let row: Option<RawPoolRow> = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT p.id, p.category, p.storage_key, p.prompt, p.width, p.height, \
                     p.usage_count, p.created_at \
                     FROM image_pool p \
                     WHERE p.category = ?1 \
                     AND NOT EXISTS (SELECT 1 FROM image_usage u \
                                     WHERE u.image_pool_id = p.id AND u.user_id = ?2) \
                     ORDER BY p.usage_count ASC, p.created_at ASC, p.rowid ASC \
                     LIMIT 1",
                    (&category, &user_id),
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;
        row.map(pool_entry_from_row).transpose()
    }

    async fn insert_entry(&self, entry: &ImagePoolEntry) -> Result<(), KbError> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO image_pool \
                     (id, category, storage_key, prompt, width, height, usage_count, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    (
                        &entry.id,
                        &entry.category,
                        &entry.storage_key,
                        &entry.prompt,
                        entry.width as i64,
                        entry.height as i64,
                        entry.usage_count as i64,
                        entry.created_at.to_rfc3339(),
                    ),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    async fn record_usage(
        &self,
        user_id: &str,
        entry_id: &str,
        slide_id: Option<&str>,
    ) -> Result<(), KbError> {
        let (user_id, entry_id) = (user_id.to_string(), entry_id.to_string());
        let slide_id = slide_id.map(str::to_string);
        let served_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let updated = tx
                    .execute(
                        "UPDATE image_pool SET usage_count = usage_count + 1 WHERE id = ?1",
                        [&entry_id],
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                if updated == 0 {
                    // Dropping the transaction rolls the increment back.
                    return Ok(Err(KbError::Storage(format!(
                        "unknown image pool entry {entry_id}"
                    ))));
                }
                // A duplicate (user, entry) pair violates the unique
                // constraint, failing the whole transaction: the increment
                // above is rolled back with it.
                tx.execute(
                    "INSERT INTO image_usage (user_id, image_pool_id, slide_id, served_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    (&user_id, &entry_id, &slide_id, &served_at),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(Ok(()))
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?
    }
}
