//! Tests for MuxFile, MuxWriter and MuxFileReader
//!
//! These tests verify:
//! - Append/read round trips across several append sessions
//! - The single append handle rule
//! - Commit visibility (flush/close) and reader snapshots
//! - Logical offsets, including across segment boundaries
//! - Per-segment decompression
//! - Binary records of live files

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use muxstore::{DirectoryConfig, FileRecord, MuxDirectory, MuxError, WriteState};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("mux");
    (temp_dir, path)
}

fn test_config() -> DirectoryConfig {
    DirectoryConfig::builder()
        .write_close_grace(Duration::from_millis(100))
        .exit_closure_timeout(Duration::from_secs(5))
        .build()
}

/// Sessions stay open for the whole test
fn long_grace_config() -> DirectoryConfig {
    DirectoryConfig::builder()
        .write_close_grace(Duration::from_secs(30))
        .build()
}

fn read_from(file: &muxstore::MuxFile, offset: u64, decompress: bool) -> Vec<u8> {
    let mut out = Vec::new();
    file.read(offset, decompress)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    out
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_append_then_read() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let data: Vec<u8> = (0..100u8).collect();
    let mut writer = file.append().unwrap();
    writer.write_all(&data).unwrap();
    writer.close().unwrap();

    assert_eq!(file.length(), 100);
    assert_eq!(file.read_all().unwrap(), data);
    assert!(file.last_modified() > 0);
}

#[test]
fn test_empty_file_reads_nothing() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("empty", true).unwrap();

    assert_eq!(file.length(), 0);
    assert!(file.read_all().unwrap().is_empty());
    assert!(file.stream_ids().is_empty());
}

#[test]
fn test_successive_sessions_concatenate() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("log", true).unwrap();

    let mut expected = Vec::new();
    for round in 0..3u8 {
        let chunk = vec![round; 50];
        let mut writer = file.append().unwrap();
        writer.write_all(&chunk).unwrap();
        writer.close().unwrap();
        expected.extend_from_slice(&chunk);

        // Let the session close so the next append opens a new segment
        dir.wait_for_write_closure().unwrap();
    }

    assert_eq!(file.stream_ids().len(), 3);
    assert_eq!(file.read_all().unwrap(), expected);
}

#[test]
fn test_append_continues_idle_segment() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, long_grace_config()).unwrap();
    let file = dir.open_file("log", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(b"first ").unwrap();
    writer.close().unwrap();
    assert_eq!(file.write_state(), WriteState::Idle);

    let mut writer = file.append().unwrap();
    writer.write_all(b"second").unwrap();
    writer.close().unwrap();

    assert_eq!(file.stream_ids().len(), 1);
    assert_eq!(file.read_all().unwrap(), b"first second");
}

#[test]
fn test_large_append_spans_blocks() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("big", true).unwrap();

    let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let mut writer = file.append().unwrap();
    for chunk in data.chunks(10_000) {
        writer.write_all(chunk).unwrap();
    }
    writer.close().unwrap();

    assert_eq!(file.length(), data.len() as u64);
    assert_eq!(file.read_all().unwrap(), data);
}

// =============================================================================
// Single Writer Tests
// =============================================================================

#[test]
fn test_second_append_conflicts() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut first = file.append().unwrap();
    first.write_all(b"one").unwrap();

    let err = file.append().unwrap_err();
    assert!(matches!(err, MuxError::AppendConflict(_)));

    // A second handle to the same file shares the rule
    let again = dir.open_file("a", false).unwrap();
    assert!(matches!(again.append(), Err(MuxError::AppendConflict(_))));

    first.close().unwrap();
    assert!(file.append().is_ok());
}

#[test]
fn test_dropped_writer_releases_claim() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    {
        let mut writer = file.append().unwrap();
        writer.write_all(b"dropped").unwrap();
    }

    assert_eq!(file.length(), 7);
    assert!(file.append().is_ok());
}

// =============================================================================
// Visibility Tests
// =============================================================================

#[test]
fn test_uncommitted_bytes_invisible() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, long_grace_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(b"pending").unwrap();
    assert_eq!(file.length(), 0);
    assert!(file.read_all().unwrap().is_empty());

    writer.flush().unwrap();
    assert_eq!(file.length(), 7);
    assert_eq!(file.read_all().unwrap(), b"pending");
    writer.close().unwrap();
}

#[test]
fn test_reader_snapshot_ignores_later_appends() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, long_grace_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(b"before").unwrap();
    writer.flush().unwrap();

    let mut reader = file.read(0, false).unwrap();

    writer.write_all(b" after").unwrap();
    writer.close().unwrap();

    let mut seen = Vec::new();
    reader.read_to_end(&mut seen).unwrap();
    assert_eq!(seen, b"before");
    assert_eq!(file.read_all().unwrap(), b"before after");
}

// =============================================================================
// Offset Tests
// =============================================================================

#[test]
fn test_offset_within_first_segment() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(b"0123456789").unwrap();
    writer.close().unwrap();

    assert_eq!(read_from(&file, 0, false), b"0123456789");
    assert_eq!(read_from(&file, 4, false), b"456789");
    assert!(read_from(&file, 10, false).is_empty());
    assert!(read_from(&file, 1000, false).is_empty());
}

#[test]
fn test_offset_across_segments() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    for part in [&b"abc"[..], b"defg", b"hij"] {
        let mut writer = file.append().unwrap();
        writer.write_all(part).unwrap();
        writer.close().unwrap();
        dir.wait_for_write_closure().unwrap();
    }

    assert_eq!(file.stream_ids().len(), 3);
    assert_eq!(read_from(&file, 5, false), b"fghij");
}

// =============================================================================
// Compression Tests
// =============================================================================

#[test]
fn test_compressed_segments_decompress_independently() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("z", true).unwrap();

    let first = vec![b'a'; 10_000];
    let second = b"second segment".repeat(100);

    for part in [&first, &second] {
        let mut writer = file.append_compressed().unwrap();
        writer.write_all(part).unwrap();
        writer.close().unwrap();
    }

    // Compressed sessions close with their handle
    assert_eq!(file.write_state(), WriteState::Closed);
    assert_eq!(file.stream_ids().len(), 2);
    assert!(file.length() < (first.len() + second.len()) as u64);

    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(read_from(&file, 0, true), expected);

    let mut tail = Vec::new();
    file.read_decompressed(9_990)
        .unwrap()
        .read_to_end(&mut tail)
        .unwrap();
    assert_eq!(tail, expected[9_990..].to_vec());
}

#[test]
fn test_compressed_segment_read_raw_is_not_plain() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("z", true).unwrap();

    let mut writer = file.append_compressed().unwrap();
    writer.write_all(&[7u8; 4096]).unwrap();
    writer.close().unwrap();

    let raw = read_from(&file, 0, false);
    assert_eq!(raw.len() as u64, file.length());
    assert_ne!(raw, vec![7u8; 4096]);
}

// =============================================================================
// Record Tests
// =============================================================================

#[test]
fn test_write_record_matches_metadata() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("rec", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(b"12345").unwrap();
    writer.close().unwrap();

    let mut buf = Vec::new();
    file.write_record(&mut buf);

    let mut slice = &buf[..];
    let record = FileRecord::read_from(&mut slice).unwrap();
    assert_eq!(record.file_id, file.file_id());
    assert_eq!(record.name, "rec");
    assert_eq!(record.length, 5);
    assert_eq!(record.stream_ids, file.stream_ids());
    assert_eq!(record, file.to_record());
}

#[test]
fn test_stream_ids_known_to_manager() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();

    for name in ["a", "b", "c"] {
        let file = dir.open_file(name, true).unwrap();
        let mut writer = file.append().unwrap();
        writer.write_all(name.as_bytes()).unwrap();
        writer.close().unwrap();
    }

    for file in dir.list_files().unwrap() {
        for id in file.stream_ids() {
            assert!(dir.stream_manager().find_stream(id).is_ok());
        }
    }
}
