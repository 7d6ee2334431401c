use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, types::Type};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::StoreConfig,
    models::{DEFAULT_CODE, DEFAULT_LANGUAGE, HistoryEntry, Language, Session},
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id    TEXT PRIMARY KEY NOT NULL,
    code          TEXT NOT NULL DEFAULT '',
    language      TEXT NOT NULL DEFAULT 'javascript',
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS code_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT NOT NULL,
    code          TEXT NOT NULL,
    language      TEXT NOT NULL,
    changed_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS code_history_session_idx ON code_history (session_id, id);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store operation exceeded {0}s")]
    Timeout(u64),
    #[error("store worker failed: {0}")]
    Worker(String),
}

/// Durable session records backed by SQLite.
///
/// Every operation runs on a blocking worker against one of a small set of
/// connections. A session id always hashes onto the same connection, so
/// writes to one session are serialized while unrelated sessions proceed on
/// other connections.
#[derive(Clone)]
pub struct SessionStore {
    connections: Arc<Vec<Mutex<Connection>>>,
    op_timeout: Duration,
}

impl SessionStore {
    /// Opens the database and applies the schema, retrying the whole step up
    /// to `connect_attempts` times.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let path = config.database_path.clone();
            let pool_size = config.pool_size;
            let busy_timeout = config.op_timeout;
            let opened =
                tokio::task::spawn_blocking(move || open_pool(&path, pool_size, busy_timeout))
                    .await
                    .map_err(|e| StoreError::Worker(e.to_string()))
                    .and_then(|res| res);

            match opened {
                Ok(connections) => {
                    tracing::info!(
                        path = %config.database_path.display(),
                        pool_size,
                        "session store ready"
                    );
                    return Ok(Self {
                        connections: Arc::new(connections),
                        op_timeout: config.op_timeout,
                    });
                }
                Err(err) if attempt < config.connect_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = config.connect_attempts,
                        retry_in_secs = config.connect_retry_delay.as_secs(),
                        error = %err,
                        "session store connection failed, retrying"
                    );
                    tokio::time::sleep(config.connect_retry_delay).await;
                }
                Err(err) => {
                    tracing::error!(attempts = attempt, error = %err, "session store unreachable");
                    return Err(err);
                }
            }
        }
    }

    pub async fn create(&self) -> Result<String, StoreError> {
        let session_id = Uuid::new_v4().to_string();
        let key = session_id.clone();
        self.run(&key, move |conn| {
            let now = now_ms();
            conn.execute(
                "INSERT INTO sessions (session_id, code, language, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![session_id, DEFAULT_CODE, DEFAULT_LANGUAGE.as_str(), now],
            )?;
            Ok(session_id)
        })
        .await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let id = session_id.to_string();
        self.run(session_id, move |conn| select_session(conn, &id)).await
    }

    /// Inserts a default record under the caller's id when none exists; an
    /// existing record is returned untouched.
    pub async fn get_or_create(&self, session_id: &str) -> Result<Session, StoreError> {
        let id = session_id.to_string();
        self.run(session_id, move |conn| {
            let tx = conn.transaction()?;
            let now = now_ms();
            tx.execute(
                "INSERT INTO sessions (session_id, code, language, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(session_id) DO NOTHING",
                params![id, DEFAULT_CODE, DEFAULT_LANGUAGE.as_str(), now],
            )?;
            let session = select_session(&tx, &id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    /// Returns `false` when no record exists; nothing is created in that case.
    pub async fn update_code(&self, session_id: &str, code: &str) -> Result<bool, StoreError> {
        let id = session_id.to_string();
        let code = code.to_string();
        self.run(session_id, move |conn| {
            let tx = conn.transaction()?;
            let now = now_ms();
            let changed = tx.execute(
                "UPDATE sessions SET code = ?2, updated_at_ms = MAX(updated_at_ms, ?3)
                 WHERE session_id = ?1",
                params![id, code, now],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            append_history(&tx, &id, now)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    pub async fn update_language(
        &self,
        session_id: &str,
        language: Language,
    ) -> Result<bool, StoreError> {
        let id = session_id.to_string();
        self.run(session_id, move |conn| {
            let tx = conn.transaction()?;
            let now = now_ms();
            let changed = tx.execute(
                "UPDATE sessions SET language = ?2, updated_at_ms = MAX(updated_at_ms, ?3)
                 WHERE session_id = ?1",
                params![id, language.as_str(), now],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            append_history(&tx, &id, now)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Most recent history rows first.
    pub async fn history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let id = session_id.to_string();
        let limit = limit as i64;
        self.run(session_id, move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT code, language, changed_at_ms FROM code_history
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![id, limit], |row| {
                Ok(HistoryEntry {
                    code: row.get(0)?,
                    language: language_column(row, 1)?,
                    changed_at: from_ms(row.get(2)?),
                })
            })?;
            let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    /// The deadline covers waiting for the session's connection. Once the
    /// operation starts it runs to completion and its real outcome is
    /// returned, with SQLite's busy handler bounded by the time left.
    async fn run<T, F>(&self, key: &str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let connections = self.connections.clone();
        let slot = slot_for(key, connections.len());
        let op_timeout = self.op_timeout;
        let deadline = Instant::now() + op_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = connections[slot]
                .lock()
                .map_err(|_| StoreError::Worker("connection mutex poisoned".to_string()))?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::Timeout(op_timeout.as_secs()));
            }
            conn.busy_timeout(remaining)?;
            op(&mut conn).map_err(StoreError::from)
        });

        task.await
            .map_err(|err| StoreError::Worker(err.to_string()))?
    }

    #[cfg(test)]
    pub(crate) fn stall(&self, session_id: &str, hold: Duration) -> std::thread::JoinHandle<()> {
        let connections = self.connections.clone();
        let slot = slot_for(session_id, connections.len());
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _conn = connections[slot].lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(hold);
        });
        locked_rx.recv().unwrap();
        holder
    }
}

fn open_pool(
    path: &Path,
    size: usize,
    busy_timeout: Duration,
) -> Result<Vec<Mutex<Connection>>, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut connections = Vec::with_capacity(size.max(1));
    for idx in 0..size.max(1) {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        if idx == 0 {
            conn.execute_batch(SCHEMA)?;
        }
        connections.push(Mutex::new(conn));
    }
    Ok(connections)
}

fn select_session(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        "SELECT session_id, code, language, created_at_ms, updated_at_ms
         FROM sessions WHERE session_id = ?1",
        params![session_id],
        |row| {
            Ok(Session {
                session_id: row.get(0)?,
                code: row.get(1)?,
                language: language_column(row, 2)?,
                created_at: from_ms(row.get(3)?),
                updated_at: from_ms(row.get(4)?),
            })
        },
    )
    .optional()
}

fn append_history(conn: &Connection, session_id: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO code_history (session_id, code, language, changed_at_ms)
         SELECT session_id, code, language, ?2 FROM sessions WHERE session_id = ?1",
        params![session_id, now],
    )?;
    Ok(())
}

fn language_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Language> {
    let raw: String = row.get(idx)?;
    raw.parse::<Language>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn slot_for(key: &str, slots: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % slots.max(1) as u64) as usize
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
