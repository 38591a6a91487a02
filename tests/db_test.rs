//! Database integration tests: sharding, splits, duplicates, erasure and
//! crash-tail recovery.

use raddi::db::{Access, Db, DbRow, DbSettings, Root};
use raddi::proof::Proof;
use raddi::types::{Eid, Iid};
use raddi::{entry, now};
use std::path::PathBuf;

fn temp_db(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("raddi-dbtest-{}-{}", tag, std::process::id()));
    std::fs::remove_dir_all(&path).ok();
    path
}

fn eid(timestamp: u32, nonce: u32) -> Eid {
    Eid {
        timestamp,
        identity: Iid {
            timestamp: timestamp.saturating_sub(1),
            nonce,
        },
    }
}

/// A structurally valid entry frame with a synthetic proof. Signature and
/// proof verification are not exercised here; insert does not verify.
fn frame(id: Eid, parent: Eid, content: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; entry::HEADER_SIZE];
    id.write_to(&mut bytes[0..12]);
    parent.write_to(&mut bytes[12..24]);
    bytes[24..88].fill(0xEE); // signature placeholder
    bytes.extend_from_slice(content);
    let proof = Proof {
        complexity: 26,
        cycle: (0..12u64).collect(),
    };
    bytes.extend_from_slice(&proof.to_bytes().unwrap());
    bytes
}

fn ordinary_root(id: Eid) -> Root {
    // thread differs from id so the entry routes into the data table
    Root {
        channel: eid(1, 100),
        thread: eid(2, 100 + id.identity.nonce),
    }
}

fn settings(max_shard: usize) -> DbSettings {
    DbSettings {
        maximum_shard_size: max_shard,
        skip_proof_verification: true,
        ..DbSettings::default()
    }
}

#[test]
fn test_insert_get_roundtrip() {
    let path = temp_db("roundtrip");
    let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();

    let id = eid(1000, 7);
    let parent = eid(900, 8);
    let bytes = frame(id, parent, b"hello world");

    let mut exists = false;
    assert!(db.insert(&bytes, &ordinary_root(id), &mut exists).unwrap());
    assert!(!exists);

    let restored = db.get(&id).expect("entry must be retrievable");
    assert_eq!(restored, bytes);
    assert_eq!(entry::id(&restored), id);
    assert_eq!(entry::parent(&restored), parent);

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}

#[test]
fn test_duplicate_insert_reports_exists() {
    let path = temp_db("dup");
    let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();

    let id = eid(5000, 1);
    let bytes = frame(id, eid(4000, 2), b"once");
    let top = ordinary_root(id);

    let mut exists = false;
    assert!(db.insert(&bytes, &top, &mut exists).unwrap());
    assert!(!exists);

    let rows_before = db.stats().rows;
    assert!(db.insert(&bytes, &top, &mut exists).unwrap());
    assert!(exists);
    assert_eq!(db.stats().rows, rows_before);

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}

/// The spec scenario: max shard of 4 rows, inserts at 10, 20, 30, 40 and
/// then 25 split the shard into bases {10, 25} with row counts {2, 3}.
#[test]
fn test_shard_split_at_incoming_timestamp() {
    let path = temp_db("split");
    let db = Db::open(Access::ReadWrite, &path, settings(4)).unwrap();

    for (i, timestamp) in [10u32, 20, 30, 40].into_iter().enumerate() {
        let id = eid(timestamp, i as u32);
        let mut exists = false;
        db.insert(&frame(id, eid(5, 99), b"x"), &ordinary_root(id), &mut exists)
            .unwrap();
    }

    let id = eid(25, 50);
    let mut exists = false;
    db.insert(&frame(id, eid(5, 99), b"x"), &ordinary_root(id), &mut exists)
        .unwrap();

    let mut shards = Vec::new();
    db.data.enumerate_shard_info(|base, rows| {
        shards.push((base, rows));
        true
    });
    assert_eq!(shards, vec![(10, 2), (25, 3)]);

    // all five entries still retrievable after the split
    for (i, timestamp) in [10u32, 20, 30, 40].into_iter().enumerate() {
        assert!(db.get(&eid(timestamp, i as u32)).is_some());
    }
    assert!(db.get(&eid(25, 50)).is_some());

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}

#[test]
fn test_erase_hides_entry_but_keeps_order() {
    let path = temp_db("erase");
    let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();

    let victims: Vec<Eid> = (0..5).map(|i| eid(100 + i, i)).collect();
    for id in &victims {
        let mut exists = false;
        db.insert(&frame(*id, eid(50, 9), b"data"), &ordinary_root(*id), &mut exists)
            .unwrap();
    }

    assert!(db.erase(&victims[2], true).unwrap());
    assert!(db.get(&victims[2]).is_none());

    // the others are still found through binary search
    for (i, id) in victims.iter().enumerate() {
        if i != 2 {
            assert!(db.get(id).is_some(), "entry {i} lost after erase");
        }
    }
    // double erase reports nothing to do
    assert!(!db.erase(&victims[2], false).unwrap());

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}

#[test]
fn test_persistence_across_reopen() {
    let path = temp_db("reopen");
    let id = eid(7777, 3);
    let bytes = frame(id, eid(7000, 4), b"durable");

    {
        let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();
        let mut exists = false;
        db.insert(&bytes, &ordinary_root(id), &mut exists).unwrap();
        db.flush();
    }

    let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();
    assert_eq!(db.get(&id), Some(bytes));

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}

/// A row whose content record never made it to disk must be dropped at
/// load instead of pointing past the end of the content file.
#[test]
fn test_crash_tail_row_ignored() {
    let path = temp_db("crash");
    let id = eid(3000, 1);
    {
        let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();
        let mut exists = false;
        db.insert(&frame(id, eid(2900, 2), b"good"), &ordinary_root(id), &mut exists)
            .unwrap();
        db.flush();
    }

    // simulate the torn write: append an index row addressing content
    // far beyond the end of the data file
    let index_path = path.join("data").join("3000.idx");
    let mut torn = raddi::db::Row {
        id: eid(3001, 9),
        parent: eid(2900, 2),
        ..Default::default()
    };
    assert!(torn.locate(1 << 30, 100));
    let mut buffer = vec![0u8; raddi::db::Row::SIZE];
    torn.write_to(&mut buffer);
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&index_path)
            .unwrap();
        file.write_all(&buffer).unwrap();
    }

    let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();
    assert!(db.get(&id).is_some(), "good row must survive");
    assert!(db.get(&eid(3001, 9)).is_none(), "torn row must be dropped");

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}

#[test]
fn test_second_writer_locked_out() {
    let path = temp_db("lock");
    let first = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();
    assert!(matches!(
        Db::open(Access::ReadWrite, &path, settings(8192)),
        Err(raddi::DbError::Locked)
    ));
    // readers are always welcome
    assert!(Db::open(Access::ReadOnly, &path, settings(8192)).is_ok());

    drop(first);
    std::fs::remove_dir_all(&path).ok();
}

#[test]
fn test_select_range_and_count() {
    let path = temp_db("select");
    let db = Db::open(Access::ReadWrite, &path, settings(8192)).unwrap();

    for i in 0..10u32 {
        let id = eid(1000 + 10 * i, i);
        let mut exists = false;
        db.insert(&frame(id, eid(900, 77), b"row"), &ordinary_root(id), &mut exists)
            .unwrap();
    }

    assert_eq!(db.data.count(1000, 1090), 10);
    assert_eq!(db.data.count(1020, 1050), 4);
    assert_eq!(db.data.count(2000, 3000), 0);

    let mut seen = 0;
    db.data.select(
        1020,
        1050,
        |_| true,
        |_| true,
        |row, bytes| {
            assert_eq!(entry::id(bytes).timestamp, row.timestamp());
            seen += 1;
            true
        },
    );
    assert_eq!(seen, 4);

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}

#[test]
fn test_optimize_closes_idle_shards() {
    let path = temp_db("optimize");
    let db = Db::open(
        Access::ReadWrite,
        &path,
        DbSettings {
            maximum_shard_size: 2,
            // immediate trimming: anything already accessed is stale
            shard_trimming_threshold: 0,
            skip_proof_verification: true,
            ..DbSettings::default()
        },
    )
    .unwrap();

    let t = now();
    for i in 0..6u32 {
        let id = eid(t.wrapping_add(i * 100), i);
        let mut exists = false;
        db.insert(&frame(id, eid(t, 9), b"x"), &ordinary_root(id), &mut exists)
            .unwrap();
    }
    assert!(db.stats().shards_active > 0);

    // prune everything down to the minimum
    let closed = db.data.prune(0);
    assert!(closed > 0);
    assert_eq!(db.stats().shards_active, 0);

    drop(db);
    std::fs::remove_dir_all(&path).ok();
}
