//! Tests for MuxDirectory
//!
//! These tests verify:
//! - Grace-period closure without an explicit close
//! - Delete semantics (NotFound, new identity, busy files)
//! - Compaction after deletes
//! - Exit-closure timeout in forced and unforced mode
//! - Append handles held across closure
//! - Persistence (reopen and rediscover files)
//! - Read-only directories
//! - Events published to the sink

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use muxstore::directory::FILE_TABLE_FILENAME;
use muxstore::{DirectoryConfig, EventSink, MuxDirectory, MuxError, MuxEvent, WriteState};
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

fn write_file(dir: &MuxDirectory, name: &str, data: &[u8]) {
    let file = dir.open_file(name, true).unwrap();
    let mut writer = file.append().unwrap();
    writer.write_all(data).unwrap();
    writer.close().unwrap();
}

// =============================================================================
// Write Closure Tests
// =============================================================================

#[test]
fn test_grace_period_closes_without_explicit_close() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(&[1u8; 64]).unwrap();
    assert_eq!(writer.state(), WriteState::Open);
    assert_eq!(dir.open_write_count(), 1);

    thread::sleep(Duration::from_millis(400));

    assert_eq!(file.write_state(), WriteState::Closed);
    assert_eq!(dir.open_write_count(), 0);
    assert_eq!(dir.attached_writer_count(), 0);
    // Closure commits what was buffered
    assert_eq!(file.length(), 64);
    assert!(dir.stream_manager().open_streams().is_empty());

    // The handle is still usable: the next write opens a new segment
    writer.write_all(&[2u8; 16]).unwrap();
    writer.close().unwrap();
    assert_eq!(file.stream_ids().len(), 2);
    assert_eq!(file.length(), 80);
}

#[test]
fn test_writes_push_out_the_deadline() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut writer = file.append().unwrap();
    for _ in 0..8 {
        writer.write_all(b"tick").unwrap();
        thread::sleep(Duration::from_millis(30));
    }
    writer.write_all(b"tock").unwrap();

    // Never quiet for a full grace interval
    assert_eq!(writer.state(), WriteState::Open);
    writer.close().unwrap();
    assert_eq!(file.stream_ids().len(), 1);
}

#[test]
fn test_wait_for_write_closure_returns_after_grace() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();

    write_file(&dir, "a", b"one");
    write_file(&dir, "b", b"two");
    assert_eq!(dir.write_state("a"), Some(WriteState::Idle));

    dir.wait_for_write_closure().unwrap();

    assert_eq!(dir.open_write_count(), 0);
    assert_eq!(dir.write_state("a"), Some(WriteState::Closed));
    assert_eq!(dir.write_state("missing"), None);
}

#[test]
fn test_unforced_timeout_reports_failure() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_secs(30))
        .exit_closure_timeout(Duration::from_millis(100))
        .exit_closure_force(false)
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();

    write_file(&dir, "a", b"still open");

    let err = dir.wait_for_write_closure().unwrap_err();
    assert!(matches!(err, MuxError::CloseTimeout { open: 1, .. }));
    // The directory stays usable
    assert!(!dir.is_closed());
    assert_eq!(dir.open_write_count(), 1);
}

#[test]
fn test_forced_timeout_closes_sessions() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_secs(30))
        .exit_closure_timeout(Duration::from_millis(100))
        .exit_closure_force(true)
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();

    write_file(&dir, "a", b"forced");

    dir.wait_for_write_closure().unwrap();
    assert_eq!(dir.open_write_count(), 0);
    assert_eq!(dir.open_file("a", false).unwrap().read_all().unwrap(), b"forced");
}

#[test]
fn test_idle_after_half_grace_without_writes() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_millis(400))
        .exit_closure_timeout(Duration::from_secs(5))
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(b"quiet").unwrap();
    assert_eq!(writer.state(), WriteState::Open);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(writer.state(), WriteState::Idle);
    // Nothing committed yet
    assert_eq!(file.length(), 0);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(writer.state(), WriteState::Closed);
    assert_eq!(file.length(), 5);
}

// =============================================================================
// Held Handle Tests
// =============================================================================

#[test]
fn test_held_writer_released_by_grace_closure() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut held = file.append().unwrap();
    held.write_all(b"hello").unwrap();
    assert_eq!(dir.attached_writer_count(), 1);

    dir.wait_for_write_closure().unwrap();

    assert_eq!(dir.open_write_count(), 0);
    assert_eq!(dir.attached_writer_count(), 0);
    assert_eq!(file.read_all().unwrap(), b"hello");

    // The claim went with the segment
    let mut next = file.append().unwrap();
    assert!(held.write_all(b"late").is_err());
    next.write_all(b" world").unwrap();
    next.close().unwrap();
    held.close().unwrap();

    assert_eq!(file.read_all().unwrap(), b"hello world");
}

#[test]
fn test_forced_closure_releases_held_writers() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_secs(30))
        .exit_closure_timeout(Duration::from_millis(100))
        .exit_closure_force(true)
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();

    let file = dir.open_file("a", true).unwrap();
    let mut held = file.append().unwrap();
    held.write_all(b"hello").unwrap();
    // Attached but never written
    let _silent = dir.open_file("b", true).unwrap().append().unwrap();
    assert_eq!(dir.attached_writer_count(), 2);

    dir.wait_for_write_closure().unwrap();

    assert_eq!(dir.open_write_count(), 0);
    assert_eq!(dir.attached_writer_count(), 0);
    assert_eq!(file.read_all().unwrap(), b"hello");

    // A plain handle picks up again on a new segment
    held.write_all(b" again").unwrap();
    held.close().unwrap();
    assert_eq!(file.read_all().unwrap(), b"hello again");
    assert_eq!(file.stream_ids().len(), 2);
}

#[test]
fn test_unforced_timeout_counts_held_writers() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_secs(30))
        .exit_closure_timeout(Duration::from_millis(100))
        .exit_closure_force(false)
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();

    let writer = dir.open_file("a", true).unwrap().append().unwrap();

    let err = dir.wait_for_write_closure().unwrap_err();
    assert!(matches!(err, MuxError::CloseTimeout { open: 1, .. }));
    assert_eq!(dir.attached_writer_count(), 1);

    writer.close().unwrap();
    dir.wait_for_write_closure().unwrap();
}

#[test]
fn test_compressed_handle_closed_by_forced_closure() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_secs(30))
        .exit_closure_timeout(Duration::from_millis(100))
        .exit_closure_force(true)
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();
    let file = dir.open_file("z", true).unwrap();

    let mut writer = file.append_compressed().unwrap();
    writer.write_all(&[7u8; 256]).unwrap();

    dir.wait_for_write_closure().unwrap();
    assert_eq!(dir.attached_writer_count(), 0);

    // The rest of the frame has no segment to go to
    assert!(writer.close().is_err());
    assert_eq!(file.length(), 0);
    assert!(file.append_compressed().is_ok());
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_makes_name_not_found() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    write_file(&dir, "a", b"doomed");

    let file = dir.open_file("a", false).unwrap();
    file.delete().unwrap();

    assert!(file.is_deleted());
    assert!(matches!(dir.open_file("a", false), Err(MuxError::FileNotFound(_))));
    assert!(matches!(file.read(0, false), Err(MuxError::FileNotFound(_))));
    assert!(matches!(file.append(), Err(MuxError::FileNotFound(_))));
    assert!(matches!(file.delete(), Err(MuxError::FileNotFound(_))));
    assert_eq!(dir.file_count(), 0);
}

#[test]
fn test_reader_in_progress_survives_delete() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    write_file(&dir, "a", b"still readable");

    let file = dir.open_file("a", false).unwrap();
    let mut reader = file.read(0, false).unwrap();
    file.delete().unwrap();

    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"still readable");
}

#[test]
fn test_create_after_delete_is_new_identity() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    write_file(&dir, "a", b"old contents");

    let old = dir.open_file("a", false).unwrap();
    let old_id = old.file_id();
    old.delete().unwrap();

    let new = dir.open_file("a", true).unwrap();
    assert_ne!(new.file_id(), old_id);
    assert_eq!(new.length(), 0);
    assert!(new.stream_ids().is_empty());

    write_file(&dir, "a", b"new");
    assert_eq!(new.read_all().unwrap(), b"new");
}

#[test]
fn test_delete_with_open_writer_is_busy() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    let file = dir.open_file("a", true).unwrap();

    let mut writer = file.append().unwrap();
    writer.write_all(b"x").unwrap();

    assert!(matches!(file.delete(), Err(MuxError::FileBusy(_))));

    writer.close().unwrap();
    file.delete().unwrap();
}

#[test]
fn test_delete_closes_lingering_session() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_secs(30))
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();
    write_file(&dir, "a", b"idle segment");
    assert_eq!(dir.open_write_count(), 1);

    dir.open_file("a", false).unwrap().delete().unwrap();

    assert_eq!(dir.open_write_count(), 0);
    assert_eq!(dir.stream_count(), 0);
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_delete_all_then_compact_empties_active_files() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();

    for i in 0..10 {
        write_file(&dir, &format!("file-{}", i), &vec![i as u8; 1000]);
    }
    dir.wait_for_write_closure().unwrap();
    assert!(!dir.stream_manager().get_active_files().is_empty());

    for file in dir.list_files().unwrap() {
        file.delete().unwrap();
    }
    let stats = dir.compact().unwrap();

    assert!(stats.files_removed >= 1);
    assert!(dir.stream_manager().get_active_files().is_empty());
    assert_eq!(dir.stream_manager().data_file_count(), 0);
}

#[test]
fn test_compact_keeps_live_files_readable() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_millis(50))
        .max_data_file_size(4096)
        .compact_live_ratio(0.9)
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();

    for i in 0..12 {
        write_file(&dir, &format!("f{}", i), &vec![i as u8; 1500]);
    }
    dir.wait_for_write_closure().unwrap();

    for i in (0..12).step_by(2) {
        dir.open_file(&format!("f{}", i), false).unwrap().delete().unwrap();
    }
    let stats = dir.compact().unwrap();
    assert!(stats.files_removed + stats.files_rewritten > 0);

    for i in (1..12).step_by(2) {
        let file = dir.open_file(&format!("f{}", i), false).unwrap();
        assert_eq!(file.read_all().unwrap(), vec![i as u8; 1500]);
    }
}

#[test]
fn test_open_reader_survives_compaction() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_millis(50))
        .max_data_file_size(4096)
        .compact_live_ratio(0.9)
        .build();
    let dir = MuxDirectory::open(&path, config).unwrap();

    // Data file 1 holds f0..f2, data file 2 holds f3..f5
    for i in 0..6 {
        write_file(&dir, &format!("f{}", i), &vec![i as u8; 1500]);
    }
    dir.wait_for_write_closure().unwrap();

    let survivor = dir.open_file("f1", false).unwrap();
    let mut reader = survivor.read(0, false).unwrap();

    for i in (0..6).step_by(2) {
        dir.open_file(&format!("f{}", i), false).unwrap().delete().unwrap();
    }
    let stats = dir.compact().unwrap();
    assert_eq!(stats.files_rewritten, 1);
    assert!(!dir.stream_manager().data_file_path(1).exists());

    let mut seen = Vec::new();
    reader.read_to_end(&mut seen).unwrap();
    assert_eq!(seen, vec![1u8; 1500]);

    // New readers follow the relocated block
    assert_eq!(survivor.read_all().unwrap(), vec![1u8; 1500]);
}

#[test]
fn test_garbage_threshold_emits_log_compact() {
    let (_temp, path) = setup_temp_dir();
    let config = DirectoryConfig::builder()
        .write_close_grace(Duration::from_millis(50))
        .compact_threshold_bytes(2000)
        .build();
    let (sink, events) = EventSink::channel();
    let dir = MuxDirectory::open_with(&path, config, sink).unwrap();

    write_file(&dir, "a", &[0u8; 1500]);
    write_file(&dir, "b", &[0u8; 1500]);

    dir.open_file("a", false).unwrap().delete().unwrap();
    assert!(!events.try_iter().any(|e| matches!(e, MuxEvent::LogCompact { .. })));

    dir.open_file("b", false).unwrap().delete().unwrap();
    let compacts: Vec<MuxEvent> = events
        .try_iter()
        .filter(|e| matches!(e, MuxEvent::LogCompact { .. }))
        .collect();
    assert_eq!(compacts, vec![MuxEvent::LogCompact { dir: path.clone() }]);
}

// =============================================================================
// Event Tests
// =============================================================================

#[test]
fn test_read_and_write_events() {
    let (_temp, path) = setup_temp_dir();
    let (sink, events) = EventSink::channel();
    let dir = MuxDirectory::open_with(&path, test_config(), sink).unwrap();

    write_file(&dir, "a", b"12345");
    let file = dir.open_file("a", false).unwrap();
    let _reader = file.read(0, false).unwrap();

    let seen: Vec<MuxEvent> = events.try_iter().collect();
    assert!(seen.contains(&MuxEvent::StreamsReported { streams: 1 }));
    assert!(seen.contains(&MuxEvent::WriteReported { bytes: 5 }));
    assert!(seen.contains(&MuxEvent::FileRead {
        dir: path.clone(),
        file: "a".to_string()
    }));
}

#[test]
fn test_callback_may_reenter_directory() {
    let (_temp, path) = setup_temp_dir();
    let slot: Arc<Mutex<Option<MuxDirectory>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = {
        let slot = slot.clone();
        let seen = seen.clone();
        EventSink::callback(move |event| {
            if let MuxEvent::WriteReported { .. } = event {
                if let Some(dir) = slot.lock().unwrap().as_ref() {
                    seen.lock().unwrap().push(dir.write_state("a"));
                }
            }
        })
    };
    let dir = MuxDirectory::open_with(&path, test_config(), sink).unwrap();
    *slot.lock().unwrap() = Some(dir.clone());

    write_file(&dir, "a", b"reentrant");

    assert_eq!(*seen.lock().unwrap(), vec![Some(WriteState::Idle)]);
    slot.lock().unwrap().take();
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_restores_files() {
    let (_temp, path) = setup_temp_dir();
    {
        let dir = MuxDirectory::open(&path, test_config()).unwrap();
        write_file(&dir, "a", b"alpha");
        write_file(&dir, "b", b"beta");
        write_file(&dir, "gone", b"deleted");
        dir.open_file("gone", false).unwrap().delete().unwrap();
        dir.close().unwrap();
    }
    assert!(path.join(FILE_TABLE_FILENAME).exists());

    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    assert_eq!(dir.file_count(), 2);
    assert_eq!(dir.open_file("a", false).unwrap().read_all().unwrap(), b"alpha");
    assert_eq!(dir.open_file("b", false).unwrap().read_all().unwrap(), b"beta");
    assert!(dir.open_file("gone", false).is_err());

    // IDs keep increasing across restarts
    let c = dir.open_file("c", true).unwrap();
    assert!(c.file_id() > dir.open_file("b", false).unwrap().file_id());
}

#[test]
fn test_drop_without_close_persists() {
    let (_temp, path) = setup_temp_dir();
    {
        let config = DirectoryConfig::builder()
            .write_close_grace(Duration::from_secs(30))
            .build();
        let dir = MuxDirectory::open(&path, config).unwrap();
        write_file(&dir, "a", b"kept on drop");
    }

    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    assert_eq!(dir.open_file("a", false).unwrap().read_all().unwrap(), b"kept on drop");
    assert!(dir.stream_manager().open_streams().is_empty());
}

#[test]
fn test_closed_directory_rejects_operations() {
    let (_temp, path) = setup_temp_dir();
    let dir = MuxDirectory::open(&path, test_config()).unwrap();
    write_file(&dir, "a", b"x");
    let file = dir.open_file("a", false).unwrap();

    dir.close().unwrap();

    assert!(dir.is_closed());
    assert!(matches!(dir.open_file("a", false), Err(MuxError::DirectoryClosed(_))));
    assert!(matches!(file.read(0, false), Err(MuxError::DirectoryClosed(_))));
    assert!(matches!(file.append(), Err(MuxError::DirectoryClosed(_))));
}

// =============================================================================
// Read-Only Tests
// =============================================================================

#[test]
fn test_read_only_directory() {
    let (_temp, path) = setup_temp_dir();
    {
        let dir = MuxDirectory::open(&path, test_config()).unwrap();
        write_file(&dir, "a", b"read me");
        dir.close().unwrap();
    }

    let dir = MuxDirectory::open_read_only(&path).unwrap();
    assert!(!dir.is_writable());

    let file = dir.open_file("a", false).unwrap();
    assert_eq!(file.read_all().unwrap(), b"read me");

    assert!(matches!(file.append(), Err(MuxError::ReadOnly(_))));
    assert!(matches!(file.delete(), Err(MuxError::ReadOnly(_))));
    assert!(matches!(dir.open_file("new", true), Err(MuxError::ReadOnly(_))));
    assert!(matches!(dir.compact(), Err(MuxError::ReadOnly(_))));
}

#[test]
fn test_read_only_missing_directory() {
    let (_temp, path) = setup_temp_dir();
    assert!(MuxDirectory::open_read_only(&path).is_err());
}
