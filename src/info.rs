//! Entry metadata types shared between the index and the session API.

/// Optional POSIX-style attributes supplied at write/mkdir time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metadata {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

/// One file row: where the blob lives and what we know about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Normalized path; unique within the archive, never empty.
    pub path: String,
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
    pub crc32c: Option<u32>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

impl FileInfo {
    /// Exclusive end of the blob's region within its shard.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// One directory row, with trigger-maintained aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirInfo {
    /// Normalized path; `""` is the root.
    pub path: String,
    /// Direct subdirectory count.
    pub num_subdirs: u64,
    /// Direct file count.
    pub num_files: u64,
    /// File count over the whole subtree, this directory included.
    pub num_files_tree: u64,
    /// Sum of file sizes over the whole subtree.
    pub size_tree: u64,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

impl DirInfo {
    pub fn num_entries(&self) -> u64 {
        self.num_subdirs + self.num_files
    }
}

/// A stat result: either kind of entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryInfo {
    File(FileInfo),
    Dir(DirInfo),
}

impl EntryInfo {
    pub fn path(&self) -> &str {
        match self {
            EntryInfo::File(f) => &f.path,
            EntryInfo::Dir(d) => &d.path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, EntryInfo::Dir(_))
    }
}

/// Row ordering for bulk enumeration queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Whatever order the storage produces; cheapest.
    Any,
    /// By (shard, offset): physical layout order.
    Address,
    /// By (shard, offset) descending; the quick-defrag scan order.
    AddressDesc,
    /// Lexicographic by path.
    Path,
    PathDesc,
}

impl Order {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Order::Any => "",
            Order::Address => " ORDER BY shard, offset",
            Order::AddressDesc => " ORDER BY shard DESC, offset DESC",
            Order::Path => " ORDER BY path",
            Order::PathDesc => " ORDER BY path DESC",
        }
    }
}
