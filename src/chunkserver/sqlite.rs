use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use super::NodeClient;
use crate::error::{FsError, Result};

pub const DB_FILE_NAME: &str = "chunks.db";

/// Key-value chunkserver persisted in a SQLite database in the node's data directory.
pub struct SqliteChunkserver {
    pub id: String,
    db_path: PathBuf,
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteChunkserver {
    pub fn open(id: impl Into<String>, data_dir: impl AsRef<Path>) -> Result<SqliteChunkserver> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join(DB_FILE_NAME);

        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(500))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chunks (
              k TEXT PRIMARY KEY,
              v BLOB NOT NULL
            );
            ",
        )?;

        Ok(SqliteChunkserver {
            id: id.into(),
            db_path,
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| FsError::Internal("sqlite connection lock poisoned".to_string()))?;
            op(&conn)
        })
        .await
        .map_err(|e| FsError::Internal(e.to_string()))?
    }

    fn missing(&self, key: &str) -> FsError {
        FsError::NotFound(format!("{key} on {}", self.id))
    }
}

#[async_trait]
impl NodeClient for SqliteChunkserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        let owned = key.to_string();
        let len = data.len();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chunks(k, v) VALUES (?1, ?2) ON CONFLICT(k) DO UPDATE SET v=excluded.v",
                params![owned, &data[..]],
            )?;
            Ok(())
        })
        .await?;
        debug!("{} stored {} ({} bytes)", self.id, key, len);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let owned = key.to_string();
        let value = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row("SELECT v FROM chunks WHERE k=?1", params![owned], |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()?)
            })
            .await?;
        value.map(Bytes::from).ok_or_else(|| self.missing(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let owned = key.to_string();
        let affected = self
            .with_conn(move |conn| Ok(conn.execute("DELETE FROM chunks WHERE k=?1", params![owned])?))
            .await?;
        if affected == 0 {
            return Err(self.missing(key));
        }
        debug!("{} deleted {}", self.id, key);
        Ok(())
    }

    async fn list(&self) -> Result<BTreeSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT k FROM chunks ORDER BY k ASC")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<BTreeSet<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}
