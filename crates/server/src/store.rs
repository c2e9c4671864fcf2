//! Chat store - durable message history on SQLite.
//!
//! One table keyed by message id; each value is the JSON encoding of a
//! `ChatMessage`. WAL mode gives readers a consistent snapshot that never
//! waits on a commit. Writes go through a single connection behind a mutex.
//! Reads use pooled read-only connections. The outer `RwLock` is taken
//! exclusively only by `compact()` and `close()`.
//!
//! A handle holds an exclusive file lock on `<dir>.lock` for its whole life,
//! so a second process (say, an offline `compact`) cannot open the same store
//! while a server is running.
//!
//! All methods block; async callers go through `spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use fs4::fs_std::FileExt;
use ring::rand::{SecureRandom, SystemRandom};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use svakla_protocol::ChatMessage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const DB_FILE: &str = "chat.db";
const PAGE_SIZE: u64 = 4096;
/// Upper bound on the table file (10 GiB).
const MAX_DB_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const MAX_IDLE_READERS: usize = 8;
const MESSAGE_ID_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to initialize chat store at {path}: {reason}")]
    Init { path: PathBuf, reason: String },

    #[error("chat store is closed")]
    Closed,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record encoding error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("system random source failed")]
    Random,
}

/// Open connections for one on-disk database.
struct Environment {
    db_path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl Environment {
    fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        let writer = Connection::open(db_path)?;
        writer.execute_batch(&format!(
            "PRAGMA page_size = {PAGE_SIZE};
             PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA max_page_count = {max_pages};
             CREATE TABLE IF NOT EXISTS messages (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 id TEXT NOT NULL UNIQUE,
                 record TEXT NOT NULL
             );",
            max_pages = MAX_DB_BYTES / PAGE_SIZE,
        ))?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
        })
    }

    fn open_reader(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }
}

pub struct ChatStore {
    dir: PathBuf,
    env: RwLock<Option<Environment>>,
    /// Released when the handle is dropped.
    _lock: File,
}

impl ChatStore {
    /// Open (or create) the store in `dir`, creating the directory if absent.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let init_err = |reason: String| StoreError::Init {
            path: dir.clone(),
            reason,
        };

        let lock = acquire_lock(&side_path(&dir, ".lock")).map_err(init_err)?;
        recover_interrupted_swap(&dir).map_err(|e| init_err(e.to_string()))?;
        fs::create_dir_all(&dir).map_err(|e| init_err(e.to_string()))?;
        let env = Environment::open(&dir.join(DB_FILE)).map_err(|e| init_err(e.to_string()))?;

        info!(
            component = "store",
            event = "store.opened",
            path = %dir.display(),
            "Chat store opened"
        );

        Ok(Self {
            dir,
            env: RwLock::new(Some(env)),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn shared(&self) -> Result<RwLockReadGuard<'_, Option<Environment>>, StoreError> {
        let guard = self.env.read().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            return Err(StoreError::Closed);
        }
        Ok(guard)
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.shared()?;
        let env = guard.as_ref().ok_or(StoreError::Closed)?;
        let mut conn = lock(&env.writer);
        f(&mut conn)
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.shared()?;
        let env = guard.as_ref().ok_or(StoreError::Closed)?;

        let pooled = lock(&env.readers).pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => env.open_reader()?,
        };
        let result = f(&mut conn);

        let mut idle = lock(&env.readers);
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
        result
    }

    /// Write one message under its id. A duplicate id overwrites the
    /// previous record in place.
    pub fn put(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let record = serde_json::to_string(message)?;
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, record) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET record = excluded.record",
                params![message.id, record],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        debug!(
            component = "store",
            event = "store.put",
            message_id = %message.id,
            sender = %message.sender,
        );
        Ok(())
    }

    /// Exact-key lookup. Absence is `Ok(None)`.
    pub fn get(&self, id: &str) -> Result<Option<ChatMessage>, StoreError> {
        self.with_reader(|conn| {
            let tx = conn.transaction()?;
            let record: Option<String> = tx
                .query_row(
                    "SELECT record FROM messages WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match record {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
    }

    /// Every message whose id starts with `prefix`, in insertion order.
    ///
    /// Walks the whole table on every call.
    pub fn scan(&self, prefix: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.with_reader(|conn| {
            let tx = conn.transaction()?;
            let mut messages = Vec::new();
            {
                let mut stmt = tx.prepare("SELECT id, record FROM messages ORDER BY seq")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    if !id.starts_with(prefix) {
                        continue;
                    }
                    let raw: String = row.get(1)?;
                    match serde_json::from_str::<ChatMessage>(&raw) {
                        Ok(message) => messages.push(message),
                        Err(e) => {
                            warn!(
                                component = "store",
                                event = "store.scan.bad_record",
                                message_id = %id,
                                error = %e,
                                "Skipping undecodable record"
                            );
                        }
                    }
                }
            }
            Ok(messages)
        })
    }

    /// Number of stored messages.
    pub fn count(&self) -> Result<u64, StoreError> {
        self.with_reader(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }

    /// Drop every entry unless `keep_logs` is set, in which case nothing changes.
    pub fn clear(&self, keep_logs: bool) -> Result<(), StoreError> {
        if keep_logs {
            drop(self.shared()?);
            info!(
                component = "store",
                event = "store.clear.skipped",
                "Clear requested with keep_logs; history retained"
            );
            return Ok(());
        }

        let removed = self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM messages", [])?;
            tx.commit()?;
            Ok(removed)
        })?;

        info!(
            component = "store",
            event = "store.cleared",
            removed = removed,
            "Chat store cleared"
        );
        Ok(())
    }

    /// Rewrite the database into a defragmented copy and swap it in.
    ///
    /// Holds the store exclusively for the whole run. If the copy cannot be
    /// built the live store is left as it was.
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut guard = self.env.write().unwrap_or_else(|e| e.into_inner());
        let env = guard.as_ref().ok_or(StoreError::Closed)?;

        let side_dir = side_path(&self.dir, ".compact");
        if side_dir.exists() {
            fs::remove_dir_all(&side_dir)?;
        }
        fs::create_dir_all(&side_dir)?;
        let side_db = side_dir.join(DB_FILE);

        let copied = {
            let conn = lock(&env.writer);
            conn.execute(
                "VACUUM INTO ?1",
                params![side_db.to_string_lossy().into_owned()],
            )
        };
        if let Err(e) = copied {
            let _ = fs::remove_dir_all(&side_dir);
            warn!(
                component = "store",
                event = "store.compact.copy_failed",
                error = %e,
                "Compaction copy failed; live store untouched"
            );
            return Err(e.into());
        }

        // Close every connection before touching the directory.
        drop(guard.take());

        let swapped = self.swap_in(&side_dir);
        if let Err(e) = &swapped {
            error!(
                component = "store",
                event = "store.compact.swap_failed",
                error = %e,
                "Failed to swap compacted copy into place"
            );
            // Put the original back if the restore rename inside swap_in failed too.
            if let Err(e) = recover_interrupted_swap(&self.dir) {
                error!(
                    component = "store",
                    event = "store.compact.restore_failed",
                    error = %e,
                );
            }
        }

        let env = Environment::open(&self.dir.join(DB_FILE)).map_err(|e| StoreError::Init {
            path: self.dir.clone(),
            reason: e.to_string(),
        })?;
        *guard = Some(env);
        swapped?;

        info!(
            component = "store",
            event = "store.compacted",
            path = %self.dir.display(),
            "Chat store compacted"
        );
        Ok(())
    }

    /// Move the live directory aside, move the copy into place, then remove
    /// the old directory. Restores the original if the second move fails.
    fn swap_in(&self, side_dir: &Path) -> Result<(), StoreError> {
        let old_dir = side_path(&self.dir, ".old");
        if old_dir.exists() {
            fs::remove_dir_all(&old_dir)?;
        }
        fs::rename(&self.dir, &old_dir)?;
        if let Err(e) = fs::rename(side_dir, &self.dir) {
            fs::rename(&old_dir, &self.dir)?;
            let _ = fs::remove_dir_all(side_dir);
            return Err(e.into());
        }
        fs::remove_dir_all(&old_dir)?;
        Ok(())
    }

    /// Close the environment. Later calls fail with `StoreError::Closed`.
    pub fn close(&self) {
        let mut guard = self.env.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!(
                component = "store",
                event = "store.closed",
                path = %self.dir.display(),
                "Chat store closed"
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.env
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Bytes used on disk by the store directory.
    pub fn disk_usage(&self) -> u64 {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// Sibling of `dir` named `<dir name><suffix>`.
fn side_path(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "chat".into());
    name.push(suffix);
    dir.with_file_name(name)
}

/// Take the exclusive store lock without waiting.
fn acquire_lock(path: &Path) -> Result<File, String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| e.to_string())?;
    FileExt::try_lock_exclusive(&file)
        .map_err(|e| format!("store in use by another process ({}): {e}", path.display()))?;
    Ok(file)
}

/// A crash between the two renames of a compaction swap leaves the history
/// only in `<dir>.old`. Move it back before opening.
fn recover_interrupted_swap(dir: &Path) -> std::io::Result<()> {
    let old_dir = side_path(dir, ".old");
    if dir.join(DB_FILE).exists() || !old_dir.join(DB_FILE).exists() {
        return Ok(());
    }
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::rename(&old_dir, dir)?;
    warn!(
        component = "store",
        event = "store.recovered",
        path = %dir.display(),
        "Restored chat store left behind by an interrupted compaction"
    );
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Random fixed-length hex id. Collisions are unlikely, not impossible.
pub fn generate_message_id() -> Result<String, StoreError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; MESSAGE_ID_BYTES];
    rng.fill(&mut bytes).map_err(|_| StoreError::Random)?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

/// Leading id substring shared by every message of a session's conversation.
///
/// The trailing separator keeps session `X-1` from matching `X-10`.
pub fn conversation_prefix(session_id: &str) -> String {
    format!("{session_id}:")
}

/// Fresh message id inside a session's conversation.
pub fn conversation_message_id(session_id: &str) -> Result<String, StoreError> {
    Ok(format!(
        "{}{}",
        conversation_prefix(session_id),
        generate_message_id()?
    ))
}
