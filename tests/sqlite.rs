//! SQLite store, ledger and broker against a temporary database.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde_json::{json, Map};
use sqlx::SqlitePool;
use tempfile::TempDir;

use notesync::app::Engine;
use notesync::config::Config;
use notesync::sqlite_broker::SqliteBroker;
use notesync::sqlite_store::{SqliteHashLedger, SqliteNoteStore};
use notesync::{db, migrate};
use notesync_core::broker::MessageBroker;
use notesync_core::models::HashLedgerEntry;
use notesync_core::search::memory::InMemorySearchIndex;
use notesync_core::store::{HashLedger, ModifiedKey, NoteStore};
use notesync_core::{
    compute_hash, Cadence, IndexKind, NoteSnapshot, NoteStatus, SyncWindow, WindowPolicy,
};

fn config(tmp: &TempDir) -> Config {
    let raw = format!(
        r#"
[db]
path = "{}/data/notesync.sqlite"

[search]
url = "http://127.0.0.1:7700"
"#,
        tmp.path().display()
    );
    toml::from_str(&raw).unwrap()
}

async fn pool(tmp: &TempDir) -> (Config, SqlitePool) {
    let cfg = config(tmp);
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    (cfg, pool)
}

fn utc_at(h: u32, m: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2024, 3, 1, h, m, 0)
        .unwrap()
}

fn ids(keys: &[ModifiedKey]) -> Vec<&str> {
    keys.iter().map(|k| k.id.as_str()).collect()
}

fn note(id: &str, owner: &str, modified: DateTime<FixedOffset>) -> NoteSnapshot {
    let mut fields = Map::new();
    fields.insert("priority".to_string(), json!(2));
    NoteSnapshot {
        id: id.to_string(),
        owner_id: owner.to_string(),
        template_id: Some("t1".to_string()),
        title: format!("title {}", id),
        body: "body".to_string(),
        tags: vec!["b".to_string(), "a".to_string()],
        fields,
        status: NoteStatus::Active,
        created_at: Some(utc_at(8, 0)),
        modified_at: modified,
    }
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(&tmp);
    migrate::run_migrations(&cfg).await.unwrap();
    migrate::run_migrations(&cfg).await.unwrap();
    assert!(tmp.path().join("data/notesync.sqlite").exists());
}

#[tokio::test]
async fn test_note_store_round_trip_and_windows() {
    let tmp = TempDir::new().unwrap();
    let (_, pool) = pool(&tmp).await;
    let store = SqliteNoteStore::new(pool);

    // A +09:00 instant that is 08:55 UTC.
    let tokyo = FixedOffset::east_opt(9 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 3, 1, 17, 55, 0)
        .unwrap();
    store.upsert(&note("a", "u1", utc_at(8, 50))).await.unwrap();
    store.upsert(&note("b", "u1", tokyo)).await.unwrap();
    store.upsert(&note("c", "u2", utc_at(9, 50))).await.unwrap();
    store.upsert(&note("d", "u2", utc_at(7, 0))).await.unwrap();

    let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 0).unwrap();
    let minor = SyncWindow::minor(now, &WindowPolicy::default());
    // [08:50, 09:50): start inclusive, end exclusive.
    let keys = store.list_modified(&minor, None, 10).await.unwrap();
    assert_eq!(ids(&keys), vec!["a", "b"]);
    assert_eq!(keys[1].modified_at, tokyo.with_timezone(&Utc));

    let page = store.list_modified(&minor, Some(&keys[0]), 1).await.unwrap();
    assert_eq!(ids(&page), vec!["b"]);
    assert!(store
        .list_modified(&minor, Some(&keys[1]), 10)
        .await
        .unwrap()
        .is_empty());

    let major = SyncWindow::major(now, &WindowPolicy::default());
    // (-inf, 07:50]
    assert_eq!(ids(&store.list_modified(&major, None, 10).await.unwrap()), vec!["d"]);

    let fetched = store
        .fetch(&["b".to_string(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(fetched.len(), 1);
    let b = &fetched[0];
    assert_eq!(b.tags, vec!["b", "a"]);
    assert_eq!(b.fields["priority"], 2);
    assert_eq!(b.template_id.as_deref(), Some("t1"));
    assert_eq!(b.modified_at_utc(), tokyo.with_timezone(&Utc));
    assert_eq!(
        compute_hash(b).unwrap(),
        compute_hash(&note("b", "u1", tokyo)).unwrap()
    );

    assert_eq!(store.delete_by_owner("u2").await.unwrap(), 2);
    assert_eq!(store.list_modified(&major, None, 10).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_keyset_paging_breaks_ties_by_id() {
    let tmp = TempDir::new().unwrap();
    let (_, pool) = pool(&tmp).await;
    let store = SqliteNoteStore::new(pool.clone());

    for id in ["c", "a", "b", "d"] {
        store.upsert(&note(id, "u1", utc_at(9, 0))).await.unwrap();
    }
    store.upsert(&note("e", "u2", utc_at(9, 1))).await.unwrap();
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 0).unwrap();
    let minor = SyncWindow::minor(now, &WindowPolicy::default());

    let first = store.list_modified(&minor, None, 2).await.unwrap();
    assert_eq!(ids(&first), vec!["a", "b"]);

    // Rows removed behind the cursor do not shift the next page.
    sqlx::query("DELETE FROM notes WHERE id IN ('a', 'b')")
        .execute(&pool)
        .await
        .unwrap();
    let second = store.list_modified(&minor, first.last(), 2).await.unwrap();
    assert_eq!(ids(&second), vec!["c", "d"]);
    let third = store.list_modified(&minor, second.last(), 2).await.unwrap();
    assert_eq!(ids(&third), vec!["e"]);
}

#[tokio::test]
async fn test_fetch_spans_chunks() {
    let tmp = TempDir::new().unwrap();
    let (_, pool) = pool(&tmp).await;
    let store = SqliteNoteStore::new(pool);

    let mut ids = Vec::new();
    for i in 0..1200 {
        let id = format!("n{:04}", i);
        store.upsert(&note(&id, "u1", utc_at(9, 0))).await.unwrap();
        ids.push(id);
    }
    assert_eq!(store.fetch(&ids).await.unwrap().len(), 1200);
}

#[tokio::test]
async fn test_hash_ledger_is_per_index() {
    let tmp = TempDir::new().unwrap();
    let (_, pool) = pool(&tmp).await;
    let ledger = SqliteHashLedger::new(pool);

    let n = note("n1", "u1", utc_at(9, 0));
    let entry = HashLedgerEntry {
        document_id: n.id.clone(),
        owner_id: n.owner_id.clone(),
        last_known_hash: compute_hash(&n).unwrap(),
        last_synced_at: Utc::now(),
        last_known_status: NoteStatus::Active,
    };
    ledger.put(IndexKind::Note, &entry).await.unwrap();
    assert!(ledger.get(IndexKind::Field, "n1").await.unwrap().is_none());

    let stored = ledger.get(IndexKind::Note, "n1").await.unwrap().unwrap();
    assert_eq!(stored.last_known_hash, entry.last_known_hash);
    assert_eq!(stored.last_known_status, NoteStatus::Active);

    ledger.put(IndexKind::Field, &entry).await.unwrap();
    let withdrawn_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    assert_eq!(
        ledger
            .tombstone_by_owner(IndexKind::Note, "u1", withdrawn_at)
            .await
            .unwrap(),
        1
    );
    let tombstone = ledger.get(IndexKind::Note, "n1").await.unwrap().unwrap();
    assert!(tombstone.is_tombstone());
    assert_eq!(tombstone.last_known_hash, entry.last_known_hash);
    assert!(tombstone.last_synced_at >= withdrawn_at);
    assert!(!ledger
        .get(IndexKind::Field, "n1")
        .await
        .unwrap()
        .unwrap()
        .is_tombstone());

    let mut other = entry.clone();
    other.document_id = "n0".to_string();
    ledger.put(IndexKind::Note, &other).await.unwrap();
    let page = ledger.list_after(IndexKind::Note, None, 1).await.unwrap();
    assert_eq!(page[0].document_id, "n0");
    let page = ledger.list_after(IndexKind::Note, Some("n0"), 10).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].document_id, "n1");

    assert!(ledger.remove(IndexKind::Field, "n1").await.unwrap());
    assert!(!ledger.remove(IndexKind::Field, "n1").await.unwrap());
}

#[tokio::test]
async fn test_broker_offsets_per_group() {
    let tmp = TempDir::new().unwrap();
    let (_, pool) = pool(&tmp).await;
    let broker = SqliteBroker::new(pool);

    for p in ["one", "two", "three"] {
        broker.publish("t", Some("k"), p.as_bytes()).await.unwrap();
    }
    assert_eq!(broker.publish("other", None, b"x").await.unwrap(), 0);

    let batch = broker.poll("t", "g1", 2).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].payload, b"one");
    assert_eq!(batch[0].key.as_deref(), Some("k"));
    // Polling does not advance the group.
    assert_eq!(broker.poll("t", "g1", 2).await.unwrap()[0].offset, 0);

    broker.ack("g1", &batch[1]).await.unwrap();
    assert_eq!(broker.committed("t", "g1").await.unwrap(), 2);
    // Acking an older message never rewinds.
    broker.ack("g1", &batch[0]).await.unwrap();
    assert_eq!(broker.committed("t", "g1").await.unwrap(), 2);

    let rest = broker.poll("t", "g1", 10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].payload, b"three");
    assert_eq!(broker.poll("t", "g2", 10).await.unwrap().len(), 3);

    let tail = broker.read_topic("t", 1, 10).await.unwrap();
    assert_eq!(tail.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn test_sweep_over_sqlite_store() {
    let tmp = TempDir::new().unwrap();
    let (cfg, pool) = pool(&tmp).await;
    let notes = Arc::new(SqliteNoteStore::new(pool.clone()));
    let ledger = Arc::new(SqliteHashLedger::new(pool.clone()));
    let search = Arc::new(InMemorySearchIndex::new());
    let engine = Engine::with_collaborators(
        cfg,
        notes.clone(),
        ledger.clone(),
        search.clone(),
        Arc::new(SqliteBroker::new(pool)),
    )
    .unwrap();

    for i in 0..7 {
        notes
            .upsert(&note(&format!("n{}", i), "u1", utc_at(9, i)))
            .await
            .unwrap();
    }
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 7, 0).unwrap();
    let report = engine
        .sweeper()
        .sweep(Cadence::Minor, IndexKind::Field, now, 3, None)
        .await
        .unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.totals.candidates, 7);
    assert_eq!(report.totals.written, 7);
    assert_eq!(search.count("note-fields"), 7);
    assert_eq!(search.count("notes"), 0);

    let again = engine
        .sweeper()
        .sweep(Cadence::Minor, IndexKind::Field, now, 3, None)
        .await
        .unwrap();
    assert_eq!(again.totals.unchanged, 7);
    assert_eq!(again.totals.written, 0);
}
