use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::embedding::{EmbedderConfig, decode_embedding_blob, encode_embedding_blob};
use crate::util::{ensure_directory, now_utc_string};

/// Descriptor to persist: `(file name, content sha256, vector)`.
pub type PendingDescriptor = (String, String, Vec<f32>);

/// SQLite cache of database descriptors keyed by file name, content hash and
/// model id.
pub struct DescriptorStore {
    connection: Connection,
}

impl DescriptorStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open descriptor cache: {}", path.display()))?;
        Self::from_connection(connection)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory descriptor cache")?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal_mode=WAL for descriptor cache")?;
        connection
            .pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous=NORMAL for descriptor cache")?;
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn ensure_model(&self, model: &EmbedderConfig) -> Result<()> {
        let config_json = serde_json::to_string(model).context("failed to serialize model config")?;
        self.connection.execute(
            "
            INSERT INTO embedding_models(model_id, backend, dimensions, normalization, created_at, config_json)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(model_id) DO UPDATE SET
              backend=excluded.backend,
              dimensions=excluded.dimensions,
              normalization=excluded.normalization,
              config_json=excluded.config_json
            ",
            params![
                model.model_id,
                model.backend,
                model.dimensions as i64,
                model.normalization,
                now_utc_string(),
                config_json,
            ],
        )?;
        Ok(())
    }

    /// Cached vector for this exact content, if its dimension still matches.
    pub fn lookup(
        &self,
        file_name: &str,
        content_hash: &str,
        model: &EmbedderConfig,
    ) -> Result<Option<Vec<f32>>> {
        let blob = self
            .connection
            .query_row(
                "
                SELECT embedding
                FROM image_descriptors
                WHERE file_name = ?1 AND model_id = ?2 AND content_hash = ?3 AND embedding_dim = ?4
                LIMIT 1
                ",
                params![file_name, model.model_id, content_hash, model.dimensions as i64],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read cached descriptor for {file_name}"))?;

        Ok(blob.and_then(|blob| decode_embedding_blob(&blob, model.dimensions)))
    }

    pub fn upsert_batch(
        &mut self,
        model: &EmbedderConfig,
        pending: &[PendingDescriptor],
    ) -> Result<usize> {
        if pending.is_empty() {
            return Ok(0);
        }

        let tx = self.connection.transaction()?;
        let generated_at = now_utc_string();
        for (file_name, content_hash, vector) in pending {
            tx.execute(
                "
                INSERT INTO image_descriptors(file_name, model_id, content_hash, embedding, embedding_dim, generated_at)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(file_name, model_id) DO UPDATE SET
                  content_hash=excluded.content_hash,
                  embedding=excluded.embedding,
                  embedding_dim=excluded.embedding_dim,
                  generated_at=excluded.generated_at
                ",
                params![
                    file_name,
                    model.model_id,
                    content_hash,
                    encode_embedding_blob(vector),
                    vector.len() as i64,
                    generated_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(pending.len())
    }

    pub fn count(&self, model_id: Option<&str>) -> Result<usize> {
        let count = match model_id {
            Some(model_id) => self.connection.query_row(
                "SELECT COUNT(*) FROM image_descriptors WHERE model_id = ?1",
                params![model_id],
                |row| row.get::<_, i64>(0),
            )?,
            None => self.connection.query_row(
                "SELECT COUNT(*) FROM image_descriptors",
                [],
                |row| row.get::<_, i64>(0),
            )?,
        };
        Ok(count.max(0) as usize)
    }
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS embedding_models (
              model_id TEXT PRIMARY KEY,
              backend TEXT NOT NULL,
              dimensions INTEGER NOT NULL,
              normalization TEXT NOT NULL,
              created_at TEXT NOT NULL,
              config_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS image_descriptors (
              file_name TEXT NOT NULL,
              model_id TEXT NOT NULL,
              content_hash TEXT NOT NULL,
              embedding BLOB NOT NULL,
              embedding_dim INTEGER NOT NULL,
              generated_at TEXT NOT NULL,
              PRIMARY KEY (file_name, model_id),
              FOREIGN KEY (model_id) REFERENCES embedding_models(model_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_image_descriptors_model ON image_descriptors(model_id);
            ",
        )
        .context("failed to create descriptor cache schema")?;
    Ok(())
}
