//! End-to-end archive scenarios: writing, reading, sharding, renaming,
//! metadata and session exclusivity, all against real temp-dir archives.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tempfile::tempdir;

use barecat::{
    Barecat, BarecatError, EntryInfo, Metadata, OpenMode, RenameMode,
};

fn create(base: &Path, shard_size_limit: Option<u64>) -> Barecat {
    let mut builder = Barecat::builder(base).mode(OpenMode::CreateNew);
    if let Some(limit) = shard_size_limit {
        builder = builder.shard_size_limit(limit);
    }
    builder.open().unwrap()
}

fn shard_len(base: &Path, index: u32) -> u64 {
    fs::metadata(shard_file(base, index)).unwrap().len()
}

fn shard_file(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-shard-{index:05}"));
    PathBuf::from(name)
}

fn dir_stat(archive: &Barecat, path: &str) -> barecat::DirInfo {
    match archive.stat(path).unwrap() {
        EntryInfo::Dir(d) => d,
        EntryInfo::File(f) => panic!("expected directory, got file {}", f.path),
    }
}

#[test]
fn writes_roll_over_at_shard_size_limit() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, Some(100));

    archive.write("a/x", &[0x41; 60]).unwrap();
    archive.write("a/y", &[0x42; 60]).unwrap();

    assert_eq!(shard_len(&base, 0), 60);
    assert_eq!(shard_len(&base, 1), 60);

    let root = dir_stat(&archive, "");
    assert_eq!(root.num_files_tree, 2);
    assert_eq!(root.size_tree, 120);

    assert_eq!(archive.read("a/x").unwrap(), vec![0x41; 60]);
    assert_eq!(archive.read("a/y").unwrap(), vec![0x42; 60]);
    archive.close().unwrap();
}

#[test]
fn delete_leaves_shard_length_alone() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, Some(100));
    archive.write("a/x", &[0x41; 60]).unwrap();
    archive.write("a/y", &[0x42; 60]).unwrap();

    archive.delete("a/x").unwrap();

    assert_eq!(shard_len(&base, 0), 60);
    let a = dir_stat(&archive, "a");
    assert_eq!(a.num_files, 1);
    assert_eq!(a.size_tree, 60);
    assert!(matches!(
        archive.read("a/x").unwrap_err().downcast_ref::<BarecatError>(),
        Some(BarecatError::NotFound(_))
    ));
    archive.close().unwrap();
}

#[test]
fn thousand_files_in_one_directory() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    for i in 0..1000 {
        archive.write(&format!("d/{i:04}"), &[i as u8; 10]).unwrap();
    }

    let (subdirs, files) = archive.listdir("d").unwrap();
    assert!(subdirs.is_empty());
    assert_eq!(files.len(), 1000);
    assert_eq!(files[0], "0000");
    assert_eq!(files[999], "0999");

    let d = dir_stat(&archive, "d");
    assert_eq!(d.num_files, 1000);
    assert_eq!(d.num_files_tree, 1000);
    assert_eq!(d.size_tree, 10_000);
    archive.close().unwrap();
}

#[test]
fn directory_rename_preserves_aggregates_and_descendants() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    for i in 0..50 {
        archive.write(&format!("d/{i:04}"), &[1u8; 10]).unwrap();
    }
    archive.write("other/file", b"keep").unwrap();
    let root_subdirs_before = dir_stat(&archive, "").num_subdirs;

    archive.rename("d", "e", RenameMode::NoReplace).unwrap();

    assert!(!archive.isdir("d").unwrap());
    let e = dir_stat(&archive, "e");
    assert_eq!(e.num_files, 50);
    assert_eq!(e.num_files_tree, 50);
    assert_eq!(e.size_tree, 500);
    for i in 0..50 {
        assert_eq!(archive.read(&format!("e/{i:04}")).unwrap(), vec![1u8; 10]);
    }
    assert_eq!(dir_stat(&archive, "").num_subdirs, root_subdirs_before);
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn round_trip_of_varied_blobs() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, Some(1 << 16));

    let blobs: Vec<(String, Vec<u8>)> = (0u64..40)
        .map(|i| {
            let path = format!("set{}/item{:03}", i % 4, i);
            let data: Vec<u8> = (0..(i * 37) % 2000).map(|j| (i + j) as u8).collect();
            (path, data)
        })
        .collect();
    for (path, data) in &blobs {
        archive.write(path, data).unwrap();
    }
    archive.close().unwrap();

    let archive = Barecat::open(&base).unwrap();
    for (path, data) in &blobs {
        assert_eq!(&archive.read(path).unwrap(), data, "mismatch for {path}");
    }
    assert_eq!(archive.num_files().unwrap(), 40);
    archive.close().unwrap();
}

#[test]
fn empty_blobs_are_stored_and_read_back() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("empty1", b"").unwrap();
    archive.write("empty2", b"").unwrap();
    archive.write("full", b"data").unwrap();

    assert_eq!(archive.read("empty1").unwrap(), Vec::<u8>::new());
    assert_eq!(archive.read("empty2").unwrap(), Vec::<u8>::new());
    assert_eq!(archive.total_size().unwrap(), 4);
    archive.close().unwrap();
}

#[test]
fn duplicate_write_fails_and_leaves_no_orphan() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("a/x", b"first").unwrap();

    let err = archive.write("a/x", b"second").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::AlreadyExists(_))
    ));
    // The rejected append was cut back off the shard.
    assert_eq!(shard_len(&base, 0), 5);
    assert_eq!(archive.read("a/x").unwrap(), b"first");
    archive.close().unwrap();
}

#[test]
fn blob_too_large_for_any_shard() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, Some(100));
    let err = archive.write("big", &[0u8; 101]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::BlobTooLarge { size: 101, limit: 100 })
    ));
    archive.close().unwrap();
}

#[test]
fn mkdir_is_not_idempotent_and_keeps_aggregates() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.mkdir("d", Metadata::default()).unwrap();
    archive.write("d/x", b"abc").unwrap();
    let before = dir_stat(&archive, "");

    let err = archive.mkdir("d", Metadata::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::AlreadyExists(_))
    ));
    let after = dir_stat(&archive, "");
    assert_eq!(before, after);
    archive.close().unwrap();
}

#[test]
fn delete_of_nonempty_directory_is_refused() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("d/x", b"abc").unwrap();

    let err = archive.delete("d").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::DirectoryNotEmpty(_))
    ));

    archive.delete("d/x").unwrap();
    archive.delete("d").unwrap();
    assert!(!archive.isdir("d").unwrap());
    archive.close().unwrap();
}

#[test]
fn remove_recursively_clears_subtree() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("d/a/x", b"1").unwrap();
    archive.write("d/a/y", b"22").unwrap();
    archive.write("d/b/z", b"333").unwrap();
    archive.write("keep", b"4").unwrap();

    archive.remove_recursively("d").unwrap();

    assert!(!archive.exists("d").unwrap());
    assert!(!archive.exists("d/a/x").unwrap());
    let root = dir_stat(&archive, "");
    assert_eq!(root.num_files_tree, 1);
    assert_eq!(root.size_tree, 1);
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn rename_file_modes() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("a", b"aaa").unwrap();
    archive.write("b", b"bb").unwrap();

    // no-replace onto an existing target
    let err = archive.rename("a", "b", RenameMode::NoReplace).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::AlreadyExists(_))
    ));

    // replace drops the target
    archive.rename("a", "b", RenameMode::Replace).unwrap();
    assert!(!archive.isfile("a").unwrap());
    assert_eq!(archive.read("b").unwrap(), b"aaa");
    assert_eq!(archive.total_size().unwrap(), 3);
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn rename_exchange_swaps_entries() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("one/f", b"one").unwrap();
    archive.write("two/g", b"twotwo").unwrap();

    archive.rename("one", "two", RenameMode::Exchange).unwrap();

    assert_eq!(archive.read("one/g").unwrap(), b"twotwo");
    assert_eq!(archive.read("two/f").unwrap(), b"one");
    let one = dir_stat(&archive, "one");
    assert_eq!(one.size_tree, 6);
    let two = dir_stat(&archive, "two");
    assert_eq!(two.size_tree, 3);
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn rename_into_own_subtree_is_rejected() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("d/x", b"1").unwrap();
    let err = archive
        .rename("d", "d/sub", RenameMode::NoReplace)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::InvalidPath(_))
    ));
    archive.close().unwrap();
}

#[test]
fn metadata_updates_and_stat() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive
        .write_with(
            "f",
            b"data",
            Metadata {
                mode: Some(0o644),
                uid: Some(1000),
                gid: Some(1000),
                mtime_ns: Some(1_700_000_000_000_000_000),
            },
        )
        .unwrap();

    archive.chmod("f", 0o600).unwrap();
    archive.chown("f", 2000, 2000).unwrap();
    archive.utime("f", 1_800_000_000_000_000_000).unwrap();

    match archive.stat("f").unwrap() {
        EntryInfo::File(fi) => {
            assert_eq!(fi.mode, Some(0o600));
            assert_eq!(fi.uid, Some(2000));
            assert_eq!(fi.gid, Some(2000));
            assert_eq!(fi.mtime_ns, Some(1_800_000_000_000_000_000));
            assert_eq!(fi.size, 4);
        }
        EntryInfo::Dir(_) => panic!("expected file"),
    }

    let err = archive.chmod("missing", 0o600).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::NotFound(_))
    ));
    archive.close().unwrap();
}

#[test]
fn truncate_shrinks_in_place_and_grows_by_reappend() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    let data: Vec<u8> = (0..100u8).collect();
    archive.write("f", &data).unwrap();
    archive.write("after", b"x").unwrap();

    archive.truncate("f", 40).unwrap();
    assert_eq!(archive.read("f").unwrap(), &data[..40]);
    assert_eq!(archive.total_size().unwrap(), 41);
    // The blob did not move; the tail is now a gap.
    assert_eq!(shard_len(&base, 0), 101);

    archive.truncate("f", 150).unwrap();
    let grown = archive.read("f").unwrap();
    assert_eq!(&grown[..40], &data[..40]);
    assert!(grown[40..].iter().all(|&b| b == 0));
    assert_eq!(grown.len(), 150);
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn streams_are_seekable_and_bounded() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("pad", b"..........").unwrap();
    let data: Vec<u8> = (0..200u8).collect();
    archive.write("f", &data).unwrap();

    let mut stream = archive.open_stream("f").unwrap();
    assert_eq!(stream.size(), 200);

    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    assert_eq!(all, data);

    stream.seek(SeekFrom::Start(190)).unwrap();
    let mut tail = Vec::new();
    stream.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &data[190..]);

    stream.seek(SeekFrom::End(-10)).unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, data[190..194]);
    archive.close().unwrap();
}

#[test]
fn streaming_writes_record_size_and_checksum() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);

    let data = vec![9u8; 5000];
    let mut src: &[u8] = &data;
    let stored = archive
        .write_from_reader("streamed", &mut src, Some(5000), Metadata::default())
        .unwrap();
    assert_eq!(stored, 5000);
    assert_eq!(archive.read("streamed").unwrap(), data);
    archive.close().unwrap();
}

#[test]
fn mapped_reads_match_buffered_reads() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, Some(100));
    // Three shards' worth of blobs.
    for i in 0..5u8 {
        archive.write(&format!("f{i}"), &[i; 50]).unwrap();
    }
    assert_eq!(archive.num_shards(), 3);
    archive.close().unwrap();

    let reader = Barecat::builder(&base).mmap(true).open().unwrap();
    for i in 0..5u8 {
        let path = format!("f{i}");
        assert_eq!(reader.read_mapped(&path).unwrap(), &[i; 50][..]);
        assert_eq!(reader.read(&path).unwrap(), vec![i; 50]);
    }
    reader.close().unwrap();
}

#[test]
fn concurrent_reader_sessions_see_identical_bytes() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, Some(100));
    for i in 0..5u8 {
        archive.write(&format!("f{i}"), &[i ^ 0x5a; 50]).unwrap();
    }
    archive.close().unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let base = base.clone();
            std::thread::spawn(move || {
                let reader = Barecat::builder(&base).mmap(true).open().unwrap();
                for _ in 0..1000 {
                    for i in 0..5u8 {
                        let bytes = reader.read_mapped(&format!("f{i}")).unwrap();
                        assert_eq!(bytes, &[i ^ 0x5a; 50][..]);
                    }
                }
                reader.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn second_writer_is_locked_out() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let archive = create(&base, None);

    let err = Barecat::builder(&base)
        .mode(OpenMode::ReadWrite)
        .open()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::ConcurrentWriter)
    ));
    archive.close().unwrap();

    // The lock dies with the session.
    let again = Barecat::builder(&base)
        .mode(OpenMode::ReadWrite)
        .open()
        .unwrap();
    again.close().unwrap();
}

#[test]
fn open_modes_enforce_existence_rules() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");

    // Read-only open of nothing fails.
    assert!(matches!(
        Barecat::open(&base).unwrap_err().downcast_ref::<BarecatError>(),
        Some(BarecatError::NotFound(_))
    ));

    let mut archive = create(&base, None);
    archive.write("x", b"1").unwrap();
    archive.close().unwrap();

    // CreateNew refuses to clobber.
    assert!(matches!(
        Barecat::builder(&base)
            .mode(OpenMode::CreateNew)
            .open()
            .unwrap_err()
            .downcast_ref::<BarecatError>(),
        Some(BarecatError::AlreadyExists(_))
    ));

    // Overwrite starts from scratch.
    let archive = Barecat::builder(&base)
        .mode(OpenMode::Overwrite)
        .open()
        .unwrap();
    assert_eq!(archive.num_files().unwrap(), 0);
    archive.close().unwrap();
}

#[test]
fn readonly_and_append_sessions_reject_mutation() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    archive.write("x", b"1").unwrap();
    archive.close().unwrap();

    let mut reader = Barecat::open(&base).unwrap();
    assert_eq!(reader.read("x").unwrap(), b"1");
    let err = reader.write("y", b"2").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::ReadOnlyArchive)
    ));
    reader.close().unwrap();

    let mut appender = Barecat::builder(&base).mode(OpenMode::Append).open().unwrap();
    appender.write("y", b"2").unwrap();
    let err = appender.delete("x").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::AppendOnlyArchive)
    ));
    let err = appender.rename("x", "z", RenameMode::NoReplace).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BarecatError>(),
        Some(BarecatError::AppendOnlyArchive)
    ));
    appender.close().unwrap();
}

#[test]
fn invalid_paths_are_rejected() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, None);
    for bad in ["../escape", "a/../b", "a/./b"] {
        let err = archive.write(bad, b"x").unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<BarecatError>(),
                Some(BarecatError::InvalidPath(_))
            ),
            "expected invalid-path for {bad:?}"
        );
    }
    // Leading slashes and duplicate slashes normalize away instead.
    archive.write("/a//b", b"x").unwrap();
    assert!(archive.isfile("a/b").unwrap());
    archive.close().unwrap();
}
