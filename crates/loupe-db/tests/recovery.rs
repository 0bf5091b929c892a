//! Crash-safety: a damaged primary file falls back to the previous generation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use loupe_core::task::*;
use loupe_db::artifact_store::PNG_SIGNATURE;
use loupe_db::queue_store::{BACKUP_FILE, DocumentSource, QUEUE_FILE, QueueStore};

fn page_task(note: &str) -> NewTask {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(note.as_bytes());
    NewTask::new(
        TaskKind::Page,
        note,
        STANDARD.encode(bytes),
        PageInfo {
            url: "http://localhost:3000/".into(),
            ..PageInfo::default()
        },
    )
}

#[test]
fn corrupt_primary_recovers_previous_generation() {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(dir.path()).unwrap();
    let first = store.add(page_task("one")).unwrap();
    store.add(page_task("two")).unwrap();

    // Simulate a torn write of the newest generation
    std::fs::write(dir.path().join(QUEUE_FILE), b"{\"version\": \"1.0\", \"tas").unwrap();

    let loaded = store.load();
    assert_eq!(loaded.source, DocumentSource::RecoveredFromBackup);
    let ids: Vec<_> = loaded.document.tasks.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids, vec![first.id.clone()]);

    // Primary is repaired from the backup
    let repaired = std::fs::read_to_string(dir.path().join(QUEUE_FILE)).unwrap();
    assert!(repaired.contains(first.id.as_str()));
    assert_eq!(store.load().source, DocumentSource::Primary);
}

#[test]
fn both_files_corrupt_yields_empty_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(dir.path()).unwrap();
    store.add(page_task("one")).unwrap();
    store.add(page_task("two")).unwrap();

    std::fs::write(dir.path().join(QUEUE_FILE), b"not json").unwrap();
    std::fs::write(dir.path().join(BACKUP_FILE), b"[1, 2").unwrap();

    let loaded = store.load();
    assert_eq!(loaded.source, DocumentSource::Empty);
    assert!(loaded.document.tasks.is_empty());
    assert!(store.list().is_empty());
}

#[test]
fn missing_primary_with_backup_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(dir.path()).unwrap();
    let first = store.add(page_task("one")).unwrap();
    store.add(page_task("two")).unwrap();

    std::fs::remove_file(dir.path().join(QUEUE_FILE)).unwrap();
    let tasks = store.list();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, first.id);
}

#[test]
fn writes_after_recovery_continue_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = QueueStore::open(dir.path()).unwrap();
    store.add(page_task("one")).unwrap();
    store.add(page_task("two")).unwrap();
    std::fs::write(dir.path().join(QUEUE_FILE), b"").unwrap();

    store.add(page_task("three")).unwrap();
    let notes: Vec<_> = store.list().into_iter().map(|t| t.note).collect();
    assert_eq!(notes, vec!["one".to_string(), "three".to_string()]);
}

#[test]
fn reopening_sees_persisted_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store = QueueStore::open(dir.path()).unwrap();
        store.add(page_task("durable")).unwrap().id
    };
    let store = QueueStore::open(dir.path()).unwrap();
    assert_eq!(store.get(&id).unwrap().note, "durable");
}
