//! End-to-end network tests: two nodes handshaking over localhost,
//! propagating entries, synchronizing history and reordering orphans.

use raddi::db::{Access, Db, DbSettings};
use raddi::net::protocol::MAGIC;
use raddi::proof::Proof;
use raddi::types::Eid;
use raddi::{Coordinator, CoordinatorSettings, entry, now};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn temp_db(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("raddi-nettest-{}-{}", tag, std::process::id()));
    std::fs::remove_dir_all(&path).ok();
    path
}

fn node(tag: &str) -> Arc<Coordinator> {
    let db = Db::open(
        Access::ReadWrite,
        &temp_db(tag),
        DbSettings {
            // synthetic proofs in tests; consensus solving is far too slow
            skip_proof_verification: true,
            ..DbSettings::default()
        },
    )
    .unwrap();
    Coordinator::new(Arc::new(db), CoordinatorSettings::default())
}

fn synthetic_proof(complexity: u32) -> Vec<u8> {
    Proof {
        complexity,
        cycle: (5..17u64).collect(),
    }
    .to_bytes()
    .unwrap()
}

/// New identity announcement frame with a valid nonce and signature.
fn identity_frame(timestamp: u32, name: &[u8]) -> (raddi::crypto::SigningKey, Vec<u8>) {
    let (key, iid) = entry::new_identity(MAGIC, timestamp);
    let announcement = Eid::announcement(iid);

    let mut content = key.verifying_key().as_bytes().to_vec();
    content.extend_from_slice(name);

    let bytes = entry::sign_with_proof(
        &announcement,
        &announcement,
        &content,
        &[],
        &synthetic_proof(27),
        &key,
    )
    .unwrap();
    (key, bytes)
}

fn ordinary_frame(
    key: &raddi::crypto::SigningKey,
    id: Eid,
    parent: Eid,
    parent_bytes: &[u8],
    content: &[u8],
) -> Vec<u8> {
    entry::sign_with_proof(&id, &parent, content, parent_bytes, &synthetic_proof(26), key)
        .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Drive both coordinators' scheduling loops faster than the production
/// 1 Hz so tests converge quickly.
fn drive(coordinators: &[Arc<Coordinator>]) -> tokio::task::JoinHandle<()> {
    let coordinators: Vec<_> = coordinators.to_vec();
    tokio::spawn(async move {
        loop {
            for coordinator in &coordinators {
                coordinator.tick().await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_connect_and_propagate() {
    let a = node("prop-a");
    let b = node("prop-b");

    let port = a.listen(0).await.unwrap();
    b.connect(format!("127.0.0.1:{port}").parse().unwrap());

    let driver = drive(&[a.clone(), b.clone()]);

    wait_for(|| a.active() == 1 && b.active() == 1, "both links secured").await;

    // an identity announced on B propagates to A
    let t = now();
    let (_key, frame) = identity_frame(t, b"mallory");
    let id = entry::id(&frame);
    assert!(b.submit(&frame).await);

    wait_for(
        || a.database.identities.get(id.identity).is_some(),
        "identity propagated to A",
    )
    .await;

    // duplicates are noticed and not re-broadcast: the entry already sits
    // in B's recent cache
    assert!(b.recent.count(&id));

    driver.abort();
    a.terminate().await;
    b.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_history_sync_backfills_new_node() {
    let a = node("sync-a");
    let b = node("sync-b");

    // A already carries a few identities before B ever shows up
    let t = now();
    let mut ids = Vec::new();
    for i in 0..3u32 {
        let (_key, frame) = identity_frame(t - 1000 + i, b"old-timer");
        ids.push(entry::id(&frame));
        assert!(a.submit(&frame).await);
    }

    let port = a.listen(0).await.unwrap();
    b.connect(format!("127.0.0.1:{port}").parse().unwrap());
    let driver = drive(&[a.clone(), b.clone()]);

    // B reports an empty digest; A must stream the whole identities table
    wait_for(
        || {
            ids.iter()
                .all(|id| b.database.identities.get(id.identity).is_some())
        },
        "identities backfilled to B",
    )
    .await;

    driver.abort();
    a.terminate().await;
    b.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orphan_reorder_through_detached() {
    let coordinator = node("orphan");

    let t = now();
    let (key, identity_bytes) = identity_frame(t - 100, b"author");
    let author = entry::id(&identity_bytes).identity;

    // B is a channel of the author, C a thread inside it
    let channel = entry::new_channel(author, t - 50);
    let channel_bytes = entry::sign_with_proof(
        &channel,
        &channel,
        b"lounge",
        &[],
        &synthetic_proof(27),
        &key,
    )
    .unwrap();

    let comment_id = Eid {
        timestamp: t,
        identity: author,
    };
    let comment_bytes = ordinary_frame(&key, comment_id, channel, &channel_bytes, b"first!");

    // feed newest first: C before B before A
    assert!(coordinator.submit(&comment_bytes).await);
    assert_eq!(coordinator.detached.size(), 1);
    assert!(coordinator.database.get(&comment_id).is_none());

    assert!(coordinator.submit(&channel_bytes).await);
    assert_eq!(coordinator.detached.size(), 2);

    assert!(coordinator.submit(&identity_bytes).await);

    // identity pulled the channel in, the channel pulled the comment
    assert!(coordinator.database.identities.get(author).is_some());
    assert!(coordinator.database.get(&channel).is_some());
    assert!(coordinator.database.get(&comment_id).is_some());
    assert_eq!(coordinator.detached.size(), 0);

    coordinator.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_parent_discards_descendants() {
    let coordinator = node("reject");

    let t = now();
    let (key, identity_bytes) = identity_frame(t - 100, b"author");
    let author = entry::id(&identity_bytes).identity;
    assert!(coordinator.submit(&identity_bytes).await);

    let channel = entry::new_channel(author, t - 50);
    let channel_bytes = entry::sign_with_proof(
        &channel,
        &channel,
        b"room",
        &[],
        &synthetic_proof(27),
        &key,
    )
    .unwrap();

    // tamper the channel so its signature fails; the waiting comment must
    // disappear with it
    let mut bad_channel = channel_bytes.clone();
    bad_channel[entry::HEADER_SIZE] ^= 0x01;

    let comment_id = Eid {
        timestamp: t,
        identity: author,
    };
    let comment = ordinary_frame(&key, comment_id, channel, &channel_bytes, b"orphan");

    coordinator.submit(&comment).await;
    assert_eq!(coordinator.detached.size(), 1);

    coordinator.submit(&bad_channel).await;
    assert_eq!(coordinator.detached.size(), 0, "descendant not discarded");
    assert!(coordinator.database.get(&comment_id).is_none());
    assert!(coordinator.refused.count(&channel));

    coordinator.terminate().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscription_routing_of_broadcasts() {
    // leaf nodes only relay what the peer subscribed to; announcements go
    // to everyone regardless
    let a = node("route-a");
    let b = node("route-b");

    let port = a.listen(0).await.unwrap();
    b.connect(format!("127.0.0.1:{port}").parse().unwrap());
    let driver = drive(&[a.clone(), b.clone()]);
    wait_for(|| a.active() == 1 && b.active() == 1, "links secured").await;

    let t = now();
    let (_key, frame) = identity_frame(t, b"announcer");
    let id = entry::id(&frame);

    // announcements always cross the link
    assert!(a.submit(&frame).await);
    wait_for(
        || b.database.identities.get(id.identity).is_some(),
        "announcement crossed",
    )
    .await;

    driver.abort();
    a.terminate().await;
    b.terminate().await;
}
