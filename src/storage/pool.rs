//! A tiny concurrent-read/single-writer connection pool over `rusqlite`.
//!
//! SQLite in WAL mode allows one writer and many concurrent readers against
//! the same file. We model that directly with a dedicated writer connection
//! behind a [`parking_lot::Mutex`] and a small round-robin pool of read-only
//! reader connections, rather than serializing everything through one
//! connection, using `parking_lot` mutexes rather than pulling in a heavier
//! pooling crate for a handful of `rusqlite::Connection`s.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rusqlite::Connection;

const READER_POOL_SIZE: usize = 4;

/// Owns one writer connection and a small pool of reader connections to the
/// same SQLite file, all configured per §6.4 (WAL, `synchronous=NORMAL`,
/// 64 MiB cache, foreign keys on).
pub struct Pool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Pool {
    /// Opens (creating if needed) the database at `path` and applies the
    /// pragmas and schema from §4.4/§6.4.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let writer = Connection::open(path)?;
        configure(&writer)?;
        super::schema::apply(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let reader = Connection::open(path)?;
            configure(&reader)?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self { writer: Mutex::new(writer), readers, next_reader: AtomicUsize::new(0) })
    }

    /// Opens an in-memory pool, for tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let writer = Connection::open_in_memory()?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        super::schema::apply(&writer)?;
        // in-memory DBs are not shared across connections, so reuse the writer
        // connection for "reads" too; correctness, not throughput, matters in tests.
        Ok(Self { writer: Mutex::new(writer), readers: Vec::new(), next_reader: AtomicUsize::new(0) })
    }

    /// Runs `f` with exclusive access to the writer connection.
    pub fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let mut conn = self.writer.lock();
        f(&mut conn)
    }

    /// Runs `f` with a reader connection, falling back to the writer
    /// connection when no reader pool was configured (in-memory mode).
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        if self.readers.is_empty() {
            let conn = self.writer.lock();
            return f(&conn);
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].lock();
        f(&conn)
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -65536i64)?; // 64 MiB, negative = KiB
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}
