//! # Index Store
//!
//! The relational half of an archive: a single SQLite database file named
//! `<base>-sqlite-index` mapping paths to blob locations and carrying the
//! per-directory aggregates. One connection per session; every hot
//! statement goes through the prepared-statement cache.
//!
//! The schema and the aggregate triggers live in [`schema`]. This module
//! owns the connection, the query surface used by the session layer
//! (lookup, listing, walking, glob candidates, gap discovery) and the
//! mutation primitives (insert, rename, delete, metadata updates).
//!
//! ## Transactions
//!
//! Mutation primitives here are transaction-free; the caller brackets a
//! logical operation with [`Index::with_tx`] so that multi-statement
//! mutations (ancestor creation + file insert, subtree renames) commit or
//! roll back as one unit. Statements issued outside a bracket autocommit,
//! which is fine for single-statement updates like `chmod`.
//!
//! ## Aggregates
//!
//! The triggers keep invariants automatic while `config.use_triggers` is
//! set. Bulk loads clear the flag, insert at full speed, and call
//! [`Index::rebuild_aggregates`] for a one-pass recount over the parent
//! relation. [`Index::verify_aggregates`] runs the same recount without
//! writing and reports divergent directories.

pub mod schema;

use std::collections::VecDeque;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::error::BarecatError;
use crate::info::{DirInfo, FileInfo, Metadata, Order};
use crate::paths;
use schema::{SCHEMA, SCHEMA_VERSION_MAJOR};

const FILE_COLS: &str = "path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns";
const DIR_COLS: &str = "path, num_subdirs, num_files, num_files_tree, size_tree, \
                        mode, uid, gid, mtime_ns";

#[derive(Debug)]
pub struct Index {
    conn: Connection,
    readonly: bool,
}

impl Index {
    /// Opens an existing index file.
    pub fn open(path: &Path, readonly: bool) -> Result<Self> {
        let flags = if readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        let conn = Connection::open_with_flags(path, flags)
            .wrap_err_with(|| format!("failed to open index '{}'", path.display()))?;
        let index = Self { conn, readonly };
        index.configure()?;
        index.check_schema_version()?;
        Ok(index)
    }

    /// Creates a fresh index file with the full schema applied.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("failed to create index '{}'", path.display()))?;
        conn.execute_batch(SCHEMA)
            .wrap_err("failed to apply index schema")?;
        let index = Self {
            conn,
            readonly: false,
        };
        index.configure()?;
        Ok(index)
    }

    fn configure(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .wrap_err("failed to set busy timeout")?;
        // The dir_propagate trigger re-fires itself up the ancestor chain.
        self.conn
            .pragma_update(None, "recursive_triggers", true)
            .wrap_err("failed to enable recursive triggers")?;
        Ok(())
    }

    fn check_schema_version(&self) -> Result<()> {
        let major = self
            .config_int("schema_version_major")
            .wrap_err("index has no config table")
            .map_err(|e| BarecatError::CorruptIndex(format!("{e:#}")))?;
        match major {
            Some(v) if v == SCHEMA_VERSION_MAJOR => Ok(()),
            Some(v) => Err(BarecatError::CorruptIndex(format!(
                "unsupported schema version {v} (supported: {SCHEMA_VERSION_MAJOR})"
            ))
            .into()),
            None => Err(
                BarecatError::CorruptIndex("missing schema_version_major".to_string()).into(),
            ),
        }
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Runs `f` inside one transaction; rolls back if it fails.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit().wrap_err("failed to commit index transaction")?;
        Ok(out)
    }

    /// Flushes statistics back to SQLite and closes the connection.
    pub fn close(self) -> Result<()> {
        if !self.readonly {
            self.conn
                .execute_batch("PRAGMA optimize")
                .wrap_err("failed to optimize index on close")?;
        }
        self.conn
            .close()
            .map_err(|(_, e)| eyre::Report::new(e).wrap_err("failed to close index"))
    }

    // ---- config -----------------------------------------------------------

    pub fn config_int(&self, key: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value_int FROM config WHERE key = ?1")?;
        Ok(stmt
            .query_row(params![key], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten())
    }

    pub fn set_config_int(&self, key: &str, value: i64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO config (key, value_int) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value_int = excluded.value_int",
        )?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    pub fn shard_size_limit(&self) -> Result<u64> {
        let limit = self
            .config_int("shard_size_limit")?
            .ok_or_else(|| BarecatError::CorruptIndex("missing shard_size_limit".into()))?;
        Ok(limit as u64)
    }

    /// Sets the rollover threshold. Shrinking below the largest existing
    /// logical shard end is rejected; the data would have to be re-sharded
    /// first.
    pub fn set_shard_size_limit(&self, value: u64) -> Result<()> {
        if value < self.shard_size_limit()? {
            let largest: i64 = self.conn.query_row(
                "SELECT COALESCE(MAX(offset + size), 0) FROM files",
                [],
                |row| row.get(0),
            )?;
            ensure!(
                value >= largest as u64,
                "shard size limit {value} is below the largest existing shard end {largest}"
            );
        }
        self.set_config_int("shard_size_limit", value as i64)
    }

    pub fn triggers_enabled(&self) -> Result<bool> {
        Ok(self.config_int("use_triggers")? == Some(1))
    }

    pub fn set_triggers_enabled(&self, enabled: bool) -> Result<()> {
        self.set_config_int("use_triggers", i64::from(enabled))
    }

    // ---- lookups ----------------------------------------------------------

    pub fn try_lookup_file(&self, path: &str) -> Result<Option<FileInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {FILE_COLS} FROM files WHERE path = ?1"))?;
        Ok(stmt.query_row(params![path], file_from_row).optional()?)
    }

    pub fn lookup_file(&self, path: &str) -> Result<FileInfo> {
        self.try_lookup_file(path)?
            .ok_or_else(|| BarecatError::NotFound(path.to_string()).into())
    }

    pub fn try_lookup_dir(&self, path: &str) -> Result<Option<DirInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {DIR_COLS} FROM dirs WHERE path = ?1"))?;
        Ok(stmt.query_row(params![path], dir_from_row).optional()?)
    }

    pub fn lookup_dir(&self, path: &str) -> Result<DirInfo> {
        self.try_lookup_dir(path)?
            .ok_or_else(|| BarecatError::NotFound(path.to_string()).into())
    }

    pub fn isfile(&self, path: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM files WHERE path = ?1")?;
        Ok(stmt.exists(params![path])?)
    }

    pub fn isdir(&self, path: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM dirs WHERE path = ?1")?;
        Ok(stmt.exists(params![path])?)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.isfile(path)? || self.isdir(path)?)
    }

    /// Finds the file stored at an exact (shard, offset) address.
    pub fn reverse_lookup(&self, shard: u32, offset: u64) -> Result<FileInfo> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {FILE_COLS} FROM files WHERE shard = ?1 AND offset = ?2"
        ))?;
        stmt.query_row(params![shard as i64, offset as i64], file_from_row)
            .optional()?
            .ok_or_else(|| {
                BarecatError::NotFound(format!("file at shard {shard} offset {offset}")).into()
            })
    }

    /// Highest-addressed file, or `None` for an empty archive.
    pub fn last_file(&self) -> Result<Option<FileInfo>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {FILE_COLS} FROM files ORDER BY shard DESC, offset DESC LIMIT 1"
        ))?;
        Ok(stmt.query_row([], file_from_row).optional()?)
    }

    pub fn num_files(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT num_files_tree FROM dirs WHERE path = ''",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn num_dirs(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dirs", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn total_size(&self) -> Result<u64> {
        let n: i64 =
            self.conn
                .query_row("SELECT size_tree FROM dirs WHERE path = ''", [], |row| {
                    row.get(0)
                })?;
        Ok(n as u64)
    }

    /// Number of shards holding at least one file (trailing logically
    /// empty shards are not counted).
    pub fn num_used_shards(&self) -> Result<u32> {
        let n: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(shard), -1) + 1 FROM files",
            [],
            |row| row.get(0),
        )?;
        Ok(n as u32)
    }

    /// End of the last referenced byte in a shard; 0 for an empty shard.
    pub fn logical_shard_end(&self, shard: u32) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT COALESCE(MAX(offset + size), 0) FROM files WHERE shard = ?1",
        )?;
        let end: i64 = stmt.query_row(params![shard as i64], |row| row.get(0))?;
        Ok(end as u64)
    }

    // ---- listing ----------------------------------------------------------

    pub fn list_subdirs(&self, parent: &str) -> Result<Vec<DirInfo>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {DIR_COLS} FROM dirs WHERE parent = ?1 ORDER BY path"
        ))?;
        let rows = stmt.query_map(params![parent], dir_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn list_files(&self, parent: &str) -> Result<Vec<FileInfo>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {FILE_COLS} FROM files WHERE parent = ?1 ORDER BY path"
        ))?;
        let rows = stmt.query_map(params![parent], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn all_files(&self, order: Order) -> Result<Vec<FileInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {FILE_COLS} FROM files{}", order.as_sql()))?;
        let rows = stmt.query_map([], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn all_dirs(&self, order: Order) -> Result<Vec<DirInfo>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {DIR_COLS} FROM dirs{}", order.as_sql()))?;
        let rows = stmt.query_map([], dir_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Pre-order walk rooted at `path`, listing each directory lazily as
    /// the iterator is advanced.
    pub fn walk(&self, path: &str) -> Result<Walk<'_>> {
        let root = self.lookup_dir(path)?;
        let mut queue = VecDeque::new();
        queue.push_back(root);
        Ok(Walk { index: self, queue })
    }

    /// File paths matching a glob pattern, in path order. The candidate
    /// set is bounded by a primary-key range scan over the pattern's
    /// literal prefix; only the translated regex runs per candidate.
    pub fn glob_files(&self, pattern: &str) -> Result<Vec<String>> {
        if !pattern.contains(['*', '?', '[']) {
            // No metacharacters: plain lookup.
            return Ok(if self.isfile(pattern)? {
                vec![pattern.to_string()]
            } else {
                vec![]
            });
        }
        if pattern == "**" {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT path FROM files ORDER BY path")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            return rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(Into::into);
        }

        let re = paths::glob_to_regex(pattern)?;
        let prefix = paths::literal_prefix(pattern);
        let candidates: Vec<String> = if prefix.is_empty() {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT path FROM files ORDER BY path")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        } else if let Some(upper) = paths::prefix_upper_bound(prefix) {
            let mut stmt = self.conn.prepare_cached(
                "SELECT path FROM files WHERE path >= ?1 AND path < ?2 ORDER BY path",
            )?;
            let rows = stmt.query_map(params![prefix, upper], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        } else {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT path FROM files WHERE path >= ?1 ORDER BY path")?;
            let rows = stmt.query_map(params![prefix], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        Ok(candidates
            .into_iter()
            .filter(|path| re.is_match(path))
            .collect())
    }

    // ---- mutation ---------------------------------------------------------

    pub fn add_file(&self, fi: &FileInfo) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO files (path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        stmt.execute(params![
            fi.path,
            fi.shard as i64,
            fi.offset as i64,
            fi.size as i64,
            fi.crc32c.map(|v| v as i64),
            fi.mode.map(i64::from),
            fi.uid.map(i64::from),
            fi.gid.map(i64::from),
            fi.mtime_ns,
        ])
        .map_err(|e| constraint_to_exists(&fi.path, e))?;
        Ok(())
    }

    pub fn add_dir(&self, path: &str, meta: &Metadata, exist_ok: bool) -> Result<()> {
        if path.is_empty() {
            // The root row always exists; only its metadata can change.
            if !exist_ok {
                return Err(BarecatError::AlreadyExists(String::new()).into());
            }
            return self.update_dir_meta(path, meta);
        }
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO dirs (path, mode, uid, gid, mtime_ns) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let res = stmt.execute(params![
            path,
            meta.mode.map(i64::from),
            meta.uid.map(i64::from),
            meta.gid.map(i64::from),
            meta.mtime_ns,
        ]);
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_constraint(&e) && exist_ok => self.update_dir_meta(path, meta),
            Err(e) => Err(constraint_to_exists(path, e)),
        }
    }

    fn update_dir_meta(&self, path: &str, meta: &Metadata) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE dirs SET mode = COALESCE(?2, mode), uid = COALESCE(?3, uid),
                             gid = COALESCE(?4, gid), mtime_ns = COALESCE(?5, mtime_ns)
             WHERE path = ?1",
        )?;
        stmt.execute(params![
            path,
            meta.mode.map(i64::from),
            meta.uid.map(i64::from),
            meta.gid.map(i64::from),
            meta.mtime_ns,
        ])?;
        Ok(())
    }

    /// Inserts every missing ancestor directory of `path`, top-down so
    /// each insert trigger finds its parent row already present. An
    /// ancestor name already taken by a file is *not-a-directory*.
    pub fn ensure_ancestors(&self, path: &str) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT OR IGNORE INTO dirs (path) VALUES (?1)")?;
        for ancestor in paths::ancestors(path) {
            if ancestor.is_empty() {
                continue;
            }
            if self.isfile(ancestor)? {
                return Err(BarecatError::NotADirectory(ancestor.to_string()).into());
            }
            stmt.execute(params![ancestor])?;
        }
        Ok(())
    }

    /// Rewrites a file's storage address; used by defragmentation.
    pub fn move_file(&self, path: &str, shard: u32, offset: u64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE files SET shard = ?2, offset = ?3 WHERE path = ?1")?;
        let n = stmt.execute(params![path, shard as i64, offset as i64])?;
        ensure!(n == 1, "no file row for '{path}' during relocation");
        Ok(())
    }

    pub fn rename_file(&self, old: &str, new: &str) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE files SET path = ?2 WHERE path = ?1")?;
        let n = stmt
            .execute(params![old, new])
            .map_err(|e| constraint_to_exists(new, e))?;
        if n == 0 {
            return Err(BarecatError::NotFound(old.to_string()).into());
        }
        Ok(())
    }

    /// Renames a directory and every descendant. Must run inside a
    /// [`Index::with_tx`] bracket: the subtree root's UPDATE fires the
    /// move trigger (carrying the whole subtree's aggregates between the
    /// two parent chains), then the interior rows are rewritten with
    /// triggers suppressed since nothing about them changes upward.
    pub fn rename_dir(&self, old: &str, new: &str) -> Result<()> {
        let n = self
            .conn
            .prepare_cached("UPDATE dirs SET path = ?2 WHERE path = ?1")?
            .execute(params![old, new])
            .map_err(|e| constraint_to_exists(new, e))?;
        if n == 0 {
            return Err(BarecatError::NotFound(old.to_string()).into());
        }

        let prev = self.triggers_enabled()?;
        self.set_triggers_enabled(false)?;
        let subtree_glob = format!("{}/*", paths::escape_sql_glob(old));
        self.conn
            .prepare_cached(
                "UPDATE files SET path = ?1 || substr(path, length(?2) + 1)
                 WHERE path GLOB ?3",
            )?
            .execute(params![new, old, subtree_glob])?;
        self.conn
            .prepare_cached(
                "UPDATE dirs SET path = ?1 || substr(path, length(?2) + 1)
                 WHERE path GLOB ?3",
            )?
            .execute(params![new, old, subtree_glob])?;
        self.set_triggers_enabled(prev)?;
        Ok(())
    }

    /// Deletes a file row and returns what was removed.
    pub fn remove_file(&self, path: &str) -> Result<FileInfo> {
        let fi = self.lookup_file(path)?;
        self.conn
            .prepare_cached("DELETE FROM files WHERE path = ?1")?
            .execute(params![path])?;
        Ok(fi)
    }

    pub fn remove_empty_dir(&self, path: &str) -> Result<()> {
        let dinfo = self.lookup_dir(path)?;
        if dinfo.num_entries() != 0 {
            return Err(BarecatError::DirectoryNotEmpty(path.to_string()).into());
        }
        self.conn
            .prepare_cached("DELETE FROM dirs WHERE path = ?1")?
            .execute(params![path])?;
        Ok(())
    }

    /// Deletes a directory and its whole subtree. Must run inside a
    /// [`Index::with_tx`] bracket. Interior rows go with triggers
    /// suppressed; the final delete of the subtree root propagates the
    /// aggregate reduction to the ancestors in one step.
    pub fn remove_recursively(&self, path: &str) -> Result<()> {
        let prev = self.triggers_enabled()?;
        self.set_triggers_enabled(false)?;
        let subtree_glob = format!("{}/*", paths::escape_sql_glob(path));
        self.conn
            .prepare_cached("DELETE FROM files WHERE path GLOB ?1")?
            .execute(params![subtree_glob])?;
        self.conn
            .prepare_cached("DELETE FROM dirs WHERE path GLOB ?1")?
            .execute(params![subtree_glob])?;
        self.set_triggers_enabled(prev)?;
        let n = self
            .conn
            .prepare_cached("DELETE FROM dirs WHERE path = ?1")?
            .execute(params![path])?;
        ensure!(n == 1, "directory row '{path}' vanished during removal");
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.update_both_tables(path, "mode = ?2", params![path, i64::from(mode)])
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.update_both_tables(
            path,
            "uid = ?2, gid = ?3",
            params![path, i64::from(uid), i64::from(gid)],
        )
    }

    pub fn set_mtime(&self, path: &str, mtime_ns: i64) -> Result<()> {
        self.update_both_tables(path, "mtime_ns = ?2", params![path, mtime_ns])
    }

    fn update_both_tables(
        &self,
        path: &str,
        set_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<()> {
        let n = self
            .conn
            .prepare_cached(&format!("UPDATE files SET {set_clause} WHERE path = ?1"))?
            .execute(params)?;
        if n > 0 {
            return Ok(());
        }
        let n = self
            .conn
            .prepare_cached(&format!("UPDATE dirs SET {set_clause} WHERE path = ?1"))?
            .execute(params)?;
        if n == 0 {
            return Err(BarecatError::NotFound(path.to_string()).into());
        }
        Ok(())
    }

    /// Updates a file's size and checksum in place; fires the resize
    /// trigger, which propagates the size delta up the ancestor chain.
    pub fn set_file_size(&self, path: &str, size: u64, crc32c: Option<u32>) -> Result<()> {
        let n = self
            .conn
            .prepare_cached("UPDATE files SET size = ?2, crc32c = ?3 WHERE path = ?1")?
            .execute(params![path, size as i64, crc32c.map(|v| v as i64)])?;
        if n == 0 {
            return Err(BarecatError::NotFound(path.to_string()).into());
        }
        Ok(())
    }

    // ---- aggregates -------------------------------------------------------

    /// Recomputes every directory aggregate from the file and directory
    /// rows in one pass, with the triggers switched off for the duration.
    /// This is the companion of bulk loading with `use_triggers = 0`.
    pub fn rebuild_aggregates(&self) -> Result<()> {
        self.with_tx(|ix| {
            let prev = ix.triggers_enabled()?;
            ix.set_triggers_enabled(false)?;
            ix.conn
                .execute_batch(REBUILD_AGGREGATES_SQL)
                .wrap_err("failed to rebuild directory aggregates")?;
            ix.set_triggers_enabled(prev)?;
            Ok(())
        })
    }

    /// Recounts aggregates without writing and returns the paths of
    /// directories whose stored values diverge from the ground truth.
    pub fn verify_aggregates(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(VERIFY_AGGREGATES_SQL)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    // ---- fragmentation ----------------------------------------------------

    /// Unreferenced regions inferred from the file rows, ordered by
    /// (shard, offset): the space before each shard's first blob and the
    /// space between/after blobs up to the shard size limit. Shards with
    /// no rows at all are not reported here; the defragmenter adds those
    /// from the physical shard list.
    pub fn gap_rows(&self) -> Result<Vec<(u32, u64, u64)>> {
        let mut stmt = self.conn.prepare_cached(
            "WITH lim AS (
                 SELECT value_int AS cap FROM config WHERE key = 'shard_size_limit'
             ),
             head_gaps AS (
                 SELECT shard, 0 AS offset, MIN(offset) AS size
                 FROM files GROUP BY shard
             ),
             tail_gaps AS (
                 SELECT f.shard,
                        f.offset + f.size AS offset,
                        COALESCE(
                            LEAD(f.offset) OVER (PARTITION BY f.shard ORDER BY f.offset),
                            lim.cap
                        ) - (f.offset + f.size) AS size
                 FROM files f, lim
             ),
             all_gaps AS (SELECT * FROM head_gaps UNION ALL SELECT * FROM tail_gaps)
             SELECT shard, offset, size FROM all_gaps
             WHERE size > 0 ORDER BY shard, offset",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)? as u32,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }
}

/// Lazy pre-order directory traversal.
pub struct Walk<'a> {
    index: &'a Index,
    queue: VecDeque<DirInfo>,
}

impl std::fmt::Debug for Walk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Walk").field("queue", &self.queue).finish()
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<(DirInfo, Vec<DirInfo>, Vec<FileInfo>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let dir = self.queue.pop_front()?;
        let subdirs = match self.index.list_subdirs(&dir.path) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let files = match self.index.list_files(&dir.path) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        for sub in subdirs.iter().rev() {
            self.queue.push_front(sub.clone());
        }
        Some(Ok((dir, subdirs, files)))
    }
}

// Each file row feeds one count/size unit to every ancestor, root
// included; grouping the expanded chain gives the recursive aggregates.
const REBUILD_AGGREGATES_SQL: &str = "
UPDATE dirs SET
    num_subdirs = (SELECT COUNT(*) FROM dirs c WHERE c.parent = dirs.path),
    num_files   = (SELECT COUNT(*) FROM files f WHERE f.parent = dirs.path);

WITH RECURSIVE chain(dir, sz) AS (
    SELECT parent, size FROM files
    UNION ALL
    SELECT rtrim(rtrim(dir, replace(dir, '/', '')), '/'), sz
    FROM chain WHERE dir <> ''
),
sums AS (SELECT dir, COUNT(*) AS nft, SUM(sz) AS st FROM chain GROUP BY dir)
UPDATE dirs SET
    num_files_tree = COALESCE((SELECT nft FROM sums WHERE sums.dir = dirs.path), 0),
    size_tree      = COALESCE((SELECT st  FROM sums WHERE sums.dir = dirs.path), 0);
";

const VERIFY_AGGREGATES_SQL: &str = "
WITH RECURSIVE chain(dir, sz) AS (
    SELECT parent, size FROM files
    UNION ALL
    SELECT rtrim(rtrim(dir, replace(dir, '/', '')), '/'), sz
    FROM chain WHERE dir <> ''
),
sums AS (SELECT dir, COUNT(*) AS nft, SUM(sz) AS st FROM chain GROUP BY dir)
SELECT d.path FROM dirs d
LEFT JOIN sums s ON s.dir = d.path
WHERE d.num_subdirs <> (SELECT COUNT(*) FROM dirs c WHERE c.parent = d.path)
   OR d.num_files <> (SELECT COUNT(*) FROM files f WHERE f.parent = d.path)
   OR d.num_files_tree <> COALESCE(s.nft, 0)
   OR d.size_tree <> COALESCE(s.st, 0)
ORDER BY d.path
";

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileInfo> {
    Ok(FileInfo {
        path: row.get(0)?,
        shard: row.get::<_, i64>(1)? as u32,
        offset: row.get::<_, i64>(2)? as u64,
        size: row.get::<_, i64>(3)? as u64,
        crc32c: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
        mode: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        uid: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        gid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        mtime_ns: row.get(8)?,
    })
}

fn dir_from_row(row: &Row<'_>) -> rusqlite::Result<DirInfo> {
    Ok(DirInfo {
        path: row.get(0)?,
        num_subdirs: row.get::<_, i64>(1)? as u64,
        num_files: row.get::<_, i64>(2)? as u64,
        num_files_tree: row.get::<_, i64>(3)? as u64,
        size_tree: row.get::<_, i64>(4)? as u64,
        mode: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        uid: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        gid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        mtime_ns: row.get(8)?,
    })
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn constraint_to_exists(path: &str, e: rusqlite::Error) -> eyre::Report {
    if is_constraint(&e) {
        BarecatError::AlreadyExists(path.to_string()).into()
    } else {
        eyre::Report::new(e)
    }
}
