//! Fragmentation and compaction behavior: gap accounting, the exhaustive
//! forward pack, the quick first-fit pass and corruption detection.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::tempdir;

use barecat::{Barecat, DefragMode, OpenMode, VerifyIssue};

fn create(base: &Path, shard_size_limit: u64) -> Barecat {
    Barecat::builder(base)
        .mode(OpenMode::CreateNew)
        .shard_size_limit(shard_size_limit)
        .open()
        .unwrap()
}

fn shard_file(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-shard-{index:05}"));
    PathBuf::from(name)
}

fn shard_len(base: &Path, index: u32) -> u64 {
    fs::metadata(shard_file(base, index)).unwrap().len()
}

/// Physical bytes minus referenced bytes: the archive's total gap volume.
fn gap_bytes(archive: &Barecat) -> u64 {
    archive.total_physical_size().unwrap() - archive.total_size().unwrap()
}

#[test]
fn full_defrag_packs_across_shards() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, 100);
    archive.write("a/x", &[0x41; 60]).unwrap();
    archive.write("a/y", &[0x42; 60]).unwrap();
    archive.delete("a/x").unwrap();

    let freed = archive.defrag(DefragMode::Full).unwrap();
    assert_eq!(freed, 60);

    // "a/y" now sits at the front of shard 0; shard 1 is gone.
    assert_eq!(shard_len(&base, 0), 60);
    assert!(!shard_file(&base, 1).exists());
    assert_eq!(archive.read("a/y").unwrap(), vec![0x42; 60]);
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn full_defrag_leaves_no_gaps() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, 1000);
    let blobs: Vec<(String, Vec<u8>)> = (0u64..30)
        .map(|i| {
            let data: Vec<u8> = (0..(17 + i * 13) % 200).map(|j| (i * 7 + j) as u8).collect();
            (format!("f/{i:02}"), data)
        })
        .collect();
    for (path, data) in &blobs {
        archive.write(path, data).unwrap();
    }
    // Punch holes: every third blob goes away.
    for (i, (path, _)) in blobs.iter().enumerate() {
        if i % 3 == 0 {
            archive.delete(path).unwrap();
        }
    }
    assert!(gap_bytes(&archive) > 0);

    archive.defrag(DefragMode::Full).unwrap();

    assert_eq!(gap_bytes(&archive), 0);
    for (i, (path, data)) in blobs.iter().enumerate() {
        if i % 3 != 0 {
            assert_eq!(&archive.read(path).unwrap(), data, "mismatch for {path}");
        }
    }
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn quick_defrag_never_increases_gap_volume() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, 500);
    for i in 0u64..40 {
        let data = vec![i as u8; 20 + (i % 5) as usize * 10];
        archive.write(&format!("f/{i:02}"), &data).unwrap();
    }
    for i in (0u64..40).step_by(2) {
        archive.delete(&format!("f/{i:02}")).unwrap();
    }
    let before = gap_bytes(&archive);
    assert!(before > 0);

    archive.defrag(DefragMode::Quick).unwrap();

    assert!(gap_bytes(&archive) <= before);
    for i in (1u64..40).step_by(2) {
        let expected = vec![i as u8; 20 + (i % 5) as usize * 10];
        assert_eq!(archive.read(&format!("f/{i:02}")).unwrap(), expected);
    }
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn quick_defrag_reclaims_a_simple_head_gap() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, 1000);
    archive.write("a", &[1u8; 100]).unwrap();
    archive.write("b", &[2u8; 50]).unwrap();
    archive.delete("a").unwrap();

    let freed = archive.defrag(DefragMode::Quick).unwrap();
    // "b" slid into the head gap; the tail was truncated away.
    assert_eq!(freed, 100);
    assert_eq!(shard_len(&base, 0), 50);
    assert_eq!(archive.read("b").unwrap(), vec![2u8; 50]);
    archive.close().unwrap();
}

#[test]
fn truncate_tail_becomes_gap_and_defrag_reclaims_it() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, 1000);
    archive.write("f", &[7u8; 200]).unwrap();
    archive.write("g", &[8u8; 100]).unwrap();

    archive.truncate("f", 50).unwrap();
    assert_eq!(gap_bytes(&archive), 150);

    archive.defrag(DefragMode::Full).unwrap();
    assert_eq!(gap_bytes(&archive), 0);
    assert_eq!(shard_len(&base, 0), 150);
    assert_eq!(archive.read("f").unwrap(), vec![7u8; 50]);
    assert_eq!(archive.read("g").unwrap(), vec![8u8; 100]);
    archive.close().unwrap();
}

#[test]
fn interrupted_style_partial_state_stays_consistent() {
    // A quick pass after a full pass must find nothing left to do.
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, 300);
    for i in 0u64..20 {
        archive.write(&format!("f/{i:02}"), &vec![i as u8; 40]).unwrap();
    }
    for i in (0u64..20).step_by(3) {
        archive.delete(&format!("f/{i:02}")).unwrap();
    }
    archive.defrag(DefragMode::Full).unwrap();
    let freed_again = archive.defrag(DefragMode::Quick).unwrap();
    assert_eq!(freed_again, 0);
    assert!(archive.verify(None).unwrap().is_empty());
    archive.close().unwrap();
}

#[test]
fn verify_reports_flipped_bytes() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("arch");
    let mut archive = create(&base, 1000);
    archive.write("good", &[1u8; 64]).unwrap();
    archive.write("bad", &[2u8; 64]).unwrap();
    archive.close().unwrap();

    // Flip one byte inside the second blob.
    let mut f = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(shard_file(&base, 0))
        .unwrap();
    f.seek(SeekFrom::Start(80)).unwrap();
    let mut b = [0u8; 1];
    f.read_exact(&mut b).unwrap();
    f.seek(SeekFrom::Start(80)).unwrap();
    f.write_all(&[b[0] ^ 0xff]).unwrap();
    drop(f);

    let archive = Barecat::open(&base).unwrap();
    let issues = archive.verify(None).unwrap();
    assert_eq!(issues.len(), 1);
    assert!(matches!(
        &issues[0],
        VerifyIssue::ChecksumMismatch { path, .. } if path == "bad"
    ));
    assert!(archive.verify(Some("good")).unwrap().is_empty());
    archive.close().unwrap();
}
