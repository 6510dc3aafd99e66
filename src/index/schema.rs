//! # Index Schema
//!
//! DDL for a freshly created archive index. Three tables:
//!
//! - `files`: one row per blob, keyed by path, locating the bytes as
//!   (shard, offset, size) with optional crc32c and POSIX attributes.
//! - `dirs`: one row per directory, keyed by path (`''` is the root),
//!   carrying direct child counts and recursive subtree aggregates.
//! - `config`: key/value settings, including the shard size limit and the
//!   `use_triggers` switch.
//!
//! ## Derived parents
//!
//! `parent` is a generated column on both tables, never stored
//! independently: the path with its final `/`-separated segment stripped,
//! `''` for single-segment paths, NULL for the root row. The expression
//! `rtrim(rtrim(path, replace(path, '/', '')), '/')` strips exactly the
//! final segment: every character after the last `/` appears in the
//! slash-free copy of the path, `/` itself never does, so the inner rtrim
//! stops precisely at the last `/`.
//!
//! ## Aggregate triggers
//!
//! The triggers keep the `dirs` aggregates correct on every mutation, and
//! propagate strictly upward. The chain works in two stages: a child-row
//! change updates its parent's row directly, and `dir_propagate` forwards
//! any resulting `num_files_tree`/`size_tree` delta to the grandparent,
//! recursing until the root (whose parent is NULL, matching no row).
//! `PRAGMA recursive_triggers = ON` is required on every writing
//! connection for the second stage to re-fire itself.
//!
//! Nothing cascades downward: renaming a directory rewrites descendant
//! paths explicitly in the mutation layer, with `config.use_triggers`
//! cleared for the interior rows (every trigger checks the flag in its
//! WHEN clause, so bulk loads can switch the machinery off and rebuild
//! aggregates in one pass afterwards).

/// Effectively unbounded: the default shard size limit.
pub const SHARD_SIZE_UNLIMITED: u64 = i64::MAX as u64;

pub const SCHEMA_VERSION_MAJOR: i64 = 1;
pub const SCHEMA_VERSION_MINOR: i64 = 0;

pub const SCHEMA: &str = "
CREATE TABLE config (
    key TEXT PRIMARY KEY,
    value_text TEXT,
    value_int INTEGER
);

INSERT INTO config (key, value_int) VALUES
    ('use_triggers', 1),
    ('shard_size_limit', 9223372036854775807),
    ('schema_version_major', 1),
    ('schema_version_minor', 0);

CREATE TABLE dirs (
    path TEXT PRIMARY KEY,
    parent TEXT GENERATED ALWAYS AS (
        CASE WHEN path = '' THEN NULL
             ELSE rtrim(rtrim(path, replace(path, '/', '')), '/')
        END) VIRTUAL,
    num_subdirs INTEGER NOT NULL DEFAULT 0,
    num_files INTEGER NOT NULL DEFAULT 0,
    num_files_tree INTEGER NOT NULL DEFAULT 0,
    size_tree INTEGER NOT NULL DEFAULT 0,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER,
    CHECK (path NOT LIKE '/%' AND path NOT LIKE '%/')
);

CREATE TABLE files (
    path TEXT PRIMARY KEY,
    parent TEXT GENERATED ALWAYS AS (
        rtrim(rtrim(path, replace(path, '/', '')), '/')) VIRTUAL,
    shard INTEGER NOT NULL,
    offset INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    crc32c INTEGER,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER,
    CHECK (path <> '' AND path NOT LIKE '/%' AND path NOT LIKE '%/')
);

CREATE INDEX idx_dirs_parent ON dirs (parent);
CREATE INDEX idx_files_parent ON files (parent);
CREATE INDEX idx_files_address ON files (shard, offset);

INSERT INTO dirs (path) VALUES ('');

CREATE TRIGGER file_insert AFTER INSERT ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
BEGIN
    UPDATE dirs SET
        num_files = num_files + 1,
        num_files_tree = num_files_tree + 1,
        size_tree = size_tree + NEW.size
    WHERE path = NEW.parent;
END;

CREATE TRIGGER file_delete AFTER DELETE ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
BEGIN
    UPDATE dirs SET
        num_files = num_files - 1,
        num_files_tree = num_files_tree - 1,
        size_tree = size_tree - OLD.size
    WHERE path = OLD.parent;
END;

CREATE TRIGGER file_move AFTER UPDATE OF path ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.parent <> OLD.parent
BEGIN
    UPDATE dirs SET
        num_files = num_files - 1,
        num_files_tree = num_files_tree - 1,
        size_tree = size_tree - OLD.size
    WHERE path = OLD.parent;
    UPDATE dirs SET
        num_files = num_files + 1,
        num_files_tree = num_files_tree + 1,
        size_tree = size_tree + NEW.size
    WHERE path = NEW.parent;
END;

CREATE TRIGGER file_resize AFTER UPDATE OF size ON files
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.parent = OLD.parent
     AND NEW.size <> OLD.size
BEGIN
    UPDATE dirs SET
        size_tree = size_tree + NEW.size - OLD.size
    WHERE path = NEW.parent;
END;

CREATE TRIGGER dir_insert AFTER INSERT ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.path <> ''
BEGIN
    UPDATE dirs SET
        num_subdirs = num_subdirs + 1,
        num_files_tree = num_files_tree + NEW.num_files_tree,
        size_tree = size_tree + NEW.size_tree
    WHERE path = NEW.parent;
END;

CREATE TRIGGER dir_delete AFTER DELETE ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND OLD.path <> ''
BEGIN
    UPDATE dirs SET
        num_subdirs = num_subdirs - 1,
        num_files_tree = num_files_tree - OLD.num_files_tree,
        size_tree = size_tree - OLD.size_tree
    WHERE path = OLD.parent;
END;

CREATE TRIGGER dir_move AFTER UPDATE OF path ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND OLD.parent IS NOT NEW.parent
BEGIN
    UPDATE dirs SET
        num_subdirs = num_subdirs - 1,
        num_files_tree = num_files_tree - OLD.num_files_tree,
        size_tree = size_tree - OLD.size_tree
    WHERE path = OLD.parent;
    UPDATE dirs SET
        num_subdirs = num_subdirs + 1,
        num_files_tree = num_files_tree + NEW.num_files_tree,
        size_tree = size_tree + NEW.size_tree
    WHERE path = NEW.parent;
END;

CREATE TRIGGER dir_propagate AFTER UPDATE OF num_files_tree, size_tree ON dirs
WHEN (SELECT value_int FROM config WHERE key = 'use_triggers') = 1
     AND NEW.parent IS OLD.parent
     AND (NEW.num_files_tree <> OLD.num_files_tree
          OR NEW.size_tree <> OLD.size_tree)
BEGIN
    UPDATE dirs SET
        num_files_tree = num_files_tree + NEW.num_files_tree - OLD.num_files_tree,
        size_tree = size_tree + NEW.size_tree - OLD.size_tree
    WHERE path = NEW.parent;
END;
";
