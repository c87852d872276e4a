//! Index file store: one SQLite database per (repository, commit).
//!
//! Layout:
//! - `meta`: a single row (`id = 0`) holding the commit the file reflects.
//! - `symbols`: one row per symbol. `name_lower` is the lowercased name that
//!   case-insensitive substring searches filter on; `name` is indexed for the
//!   exact and prefix fast paths.
//!
//! The default rollback journal is kept (no WAL) so an index is always a
//! single self-contained file that can be copied and renamed as a unit.
//! Every function takes a `&Connection`, so it works equally on a
//! [`rusqlite::Transaction`].

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::Result;
use crate::Symbol;

/// Open (creating if needed) an index file for writing.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(conn)
}

/// Open an existing index file read-only.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

// ─── Schema ─────────────────────────────────────────────────────────

pub fn create_meta_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            id        INTEGER PRIMARY KEY CHECK (id = 0),
            commit_id TEXT NOT NULL
        );",
    )?;
    Ok(())
}

pub fn create_symbols_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS symbols (
            id         INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            name_lower TEXT NOT NULL,
            path       TEXT NOT NULL,
            line       INTEGER NOT NULL,
            kind       TEXT NOT NULL,
            parent     TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Created after the bulk insert of a full build.
pub fn create_symbol_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
         CREATE INDEX IF NOT EXISTS idx_symbols_path_line ON symbols(path, line);",
    )?;
    Ok(())
}

// ─── Meta ───────────────────────────────────────────────────────────

pub fn insert_meta(conn: &Connection, commit: &str) -> Result<()> {
    conn.execute("INSERT INTO meta (id, commit_id) VALUES (0, ?1)", params![commit])?;
    Ok(())
}

pub fn update_meta(conn: &Connection, commit: &str) -> Result<()> {
    conn.execute("UPDATE meta SET commit_id = ?1 WHERE id = 0", params![commit])?;
    Ok(())
}

/// Commit recorded in the meta row, `None` when the row is missing.
pub fn get_commit(conn: &Connection) -> Result<Option<String>> {
    let commit = conn
        .query_row("SELECT commit_id FROM meta WHERE id = 0", [], |row| row.get(0))
        .optional()?;
    Ok(commit)
}

/// Layout version, kept in SQLite's `user_version` header field.
pub fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

// ─── Symbols ────────────────────────────────────────────────────────

/// Remove every symbol belonging to one of `paths`.
pub fn delete_paths(conn: &Connection, paths: &[String]) -> Result<usize> {
    let mut stmt = conn.prepare_cached("DELETE FROM symbols WHERE path = ?1")?;
    let mut deleted = 0;
    for path in paths {
        deleted += stmt.execute(params![path])?;
    }
    Ok(deleted)
}

/// Insert symbols until the source is exhausted. The first `Err` from the
/// source aborts the write and is returned as is.
pub fn write_symbols(conn: &Connection, symbols: impl IntoIterator<Item = Result<Symbol>>) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO symbols (name, name_lower, path, line, kind, parent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut written = 0;
    for symbol in symbols {
        let symbol = symbol?;
        stmt.execute(params![
            symbol.name,
            symbol.name.to_lowercase(),
            symbol.path,
            symbol.line,
            symbol.kind,
            symbol.parent,
        ])?;
        written += 1;
    }
    Ok(written)
}

pub fn count_symbols(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Every symbol with its row id, in `(path, line, id)` order.
pub fn all_symbols(conn: &Connection) -> Result<Vec<(i64, Symbol)>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, path, line, kind, parent FROM symbols ORDER BY path, line, id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get(0)?,
            Symbol {
                name: row.get(1)?,
                path: row.get(2)?,
                line: row.get(3)?,
                kind: row.get(4)?,
                parent: row.get(5)?,
            },
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
