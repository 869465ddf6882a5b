//! End-to-end behavior of the engine over a memory remote.
//!
//! Covers read-through delivery counts, dual-write bookkeeping, listener
//! idempotency, subscription faults and durability across restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use proptest::prelude::*;

use replica::core::{CachedRecord, JsonCodec, RecordCodec, RemoteError, RemoteEvent};
use replica::store::{LocalStore, MemoryStore, SqliteStore};
use replica::sync::{Faults, MemoryRemote};
use replica::{Engine, EngineConfig, EngineError, FaultKind, Keyed, RecordKey, SyncError, SyncState};
use replica_testkit::fixtures::{announcement, announcements_path, Announcement, ChatMessage};
use replica_testkit::generators::{apply_script, remote_script};
use replica_testkit::{init_tracing, FailingStore, TestFixture};

fn offline() -> RemoteError {
    RemoteError::Unavailable("offline".into())
}

#[tokio::test]
async fn read_through_empty_cache_delivers_once() -> Result<()> {
    init_tracing();
    let fx = TestFixture::new();
    fx.seed_remote_announcements(&[announcement("a1", "Term starts Monday")]);

    let announcements = fx.announcements().await;
    let deliveries = announcements.read().collect_all().await?;

    assert_eq!(deliveries, vec![vec![announcement("a1", "Term starts Monday")]]);
    assert_eq!(announcements.state(), SyncState::Active);
    Ok(())
}

#[tokio::test]
async fn read_through_stale_cache_delivers_twice() -> Result<()> {
    init_tracing();
    let fx = TestFixture::new();
    fx.seed_cached_announcements(&[announcement("b1", "v1")], 1).await;
    fx.seed_remote_announcements(&[announcement("b1", "v2")]);

    let announcements = fx.announcements().await;
    let mut read = announcements.read();

    assert_eq!(read.next().await.transpose()?, Some(vec![announcement("b1", "v1")]));
    assert_eq!(read.next().await.transpose()?, Some(vec![announcement("b1", "v2")]));
    assert!(read.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn read_through_prunes_rows_deleted_while_offline() -> Result<()> {
    let fx = TestFixture::new();
    fx.seed_cached_announcements(&[announcement("old", "gone"), announcement("kept", "k")], 1)
        .await;
    fx.seed_remote_announcements(&[announcement("kept", "k")]);

    let deliveries = fx.announcements().await.read().collect_all().await?;
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1], vec![announcement("kept", "k")]);
    Ok(())
}

#[tokio::test]
async fn write_is_visible_immediately() -> Result<()> {
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;

    announcements.write(&announcement("c1", "Sports day")).await?;

    let cached = announcements.get(&RecordKey::from("c1")).await?;
    assert_eq!(cached, Some(announcement("c1", "Sports day")));
    assert_eq!(fx.remote_announcements(), vec![announcement("c1", "Sports day")]);
    Ok(())
}

#[tokio::test]
async fn failed_remote_write_stays_dirty_until_confirmed() -> Result<()> {
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;
    fx.remote.set_faults(Faults {
        write: Some(offline()),
        ..Faults::default()
    });

    let err = announcements.write(&announcement("c1", "draft")).await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteWriteFailed { ref key, .. } if key.as_str() == "c1"));

    // Optimistic row is visible and flagged.
    assert_eq!(announcements.snapshot().await?, vec![announcement("c1", "draft")]);
    assert_eq!(announcements.unsynced().await?, vec![announcement("c1", "draft")]);
    assert!(fx.remote_announcements().is_empty());

    fx.remote.heal();
    announcements.write(&announcement("c1", "published")).await?;
    assert!(announcements.unsynced().await?.is_empty());
    assert_eq!(fx.remote_announcements(), vec![announcement("c1", "published")]);
    Ok(())
}

#[tokio::test]
async fn failed_remote_delete_keeps_local_delete() -> Result<()> {
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;
    announcements.write(&announcement("d1", "to remove")).await?;

    fx.remote.set_faults(Faults {
        delete: Some(RemoteError::PermissionDenied("read-only".into())),
        ..Faults::default()
    });
    let err = announcements.delete(&RecordKey::from("d1")).await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteDeleteFailed { .. }));

    assert!(announcements.get(&RecordKey::from("d1")).await?.is_none());
    assert_eq!(fx.remote_announcements().len(), 1);
    Ok(())
}

#[tokio::test]
async fn remote_removal_beats_pending_local_write() -> Result<()> {
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;
    announcements.ensure_subscribed().await?;
    fx.remote.set_faults(Faults {
        write: Some(offline()),
        ..Faults::default()
    });
    let _ = announcements.write(&announcement("r1", "mine")).await;
    assert_eq!(announcements.unsynced().await?.len(), 1);

    // Another client deleted it.
    let mut changes = announcements.changes();
    fx.remote.emit(&announcements_path(), RemoteEvent::Removed(RecordKey::from("r1")));
    changes.changed().await?;

    assert!(announcements.get(&RecordKey::from("r1")).await?.is_none());
    assert!(announcements.unsynced().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn subscribing_twice_creates_one_listener() -> Result<()> {
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;

    announcements.ensure_subscribed().await?;
    announcements.read().collect_all().await?;
    fx.announcements().await.ensure_subscribed().await?;

    assert_eq!(fx.remote.listener_count(&announcements_path()), 1);
    assert_eq!(fx.engine.registry().len().await, 1);
    Ok(())
}

#[tokio::test]
async fn cancellation_degrades_and_notifies() -> Result<()> {
    init_tracing();
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;
    let mut faults = announcements.faults();
    let mut states = announcements.state_changes();
    announcements.ensure_subscribed().await?;

    fx.remote.cancel(&announcements_path(), RemoteError::PermissionDenied("revoked".into()));

    let fault = faults.recv().await?;
    assert_eq!(fault.path, announcements_path());
    assert!(matches!(fault.kind, FaultKind::SubscriptionCancelled(_)));
    states.wait_for(|s| *s == SyncState::Degraded).await?;

    // No automatic resubscription.
    announcements.read().collect_all().await?;
    assert_eq!(announcements.state(), SyncState::Degraded);
    assert_eq!(fx.remote.listener_count(&announcements_path()), 0);

    let err = announcements.subscribe_remote().await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteSubscriptionCancelled { .. }));

    // Releasing allows a fresh subscription.
    assert!(fx.engine.release(&announcements_path()).await);
    announcements.subscribe_remote().await?;
    assert_eq!(announcements.state(), SyncState::Active);
    assert_eq!(fx.remote.listener_count(&announcements_path()), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_payloads_are_skipped_and_reported() -> Result<()> {
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;
    let mut faults = announcements.faults();
    let mut live = announcements.subscribe().await?;
    assert!(live.next().await?.is_empty());

    fx.remote.emit(
        &announcements_path(),
        RemoteEvent::Added(b"{\"title\":\"no id\"}".to_vec().into()),
    );
    fx.seed_remote_announcements(&[announcement("ok", "valid")]);

    assert!(matches!(faults.recv().await?.kind, FaultKind::MalformedRecord(_)));
    assert_eq!(live.next().await?, vec![announcement("ok", "valid")]);
    assert_eq!(announcements.stats().malformed, 1);
    assert_eq!(announcements.state(), SyncState::Active);
    Ok(())
}

#[tokio::test]
async fn collections_are_independent() -> Result<()> {
    let fx = TestFixture::new();
    let maths = fx.chat("maths").await;
    let art = fx.chat("art").await;

    let message = ChatMessage {
        id: "m1".into(),
        author: "teacher-7".into(),
        text: "Homework is on page 12".into(),
        sent_at: 1_700_000_000_000,
    };
    maths.write(&message).await?;

    assert_eq!(maths.snapshot().await?, vec![message]);
    assert!(art.snapshot().await?.is_empty());
    assert_eq!(fx.engine.collections().await.len(), 2);

    let err = fx
        .engine
        .collection(maths.path(), JsonCodec::<Announcement>::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::CodecMismatch { .. }));
    Ok(())
}

#[tokio::test]
async fn storage_failure_surfaces_to_caller() -> Result<()> {
    let store = Arc::new(FailingStore::new(MemoryStore::new()));
    let engine = Engine::with_shared_store(
        Arc::clone(&store),
        Arc::new(MemoryRemote::new()),
        EngineConfig::default(),
    );
    let announcements = engine
        .collection(&announcements_path(), JsonCodec::<Announcement>::new())
        .await?;

    store.fail_writes(true);
    let err = announcements.write(&announcement("s1", "x")).await.unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));

    store.fail_writes(false);
    store.fail_reads(true);
    assert!(matches!(
        announcements.snapshot().await,
        Err(SyncError::StorageUnavailable(_))
    ));
    Ok(())
}

#[tokio::test]
async fn read_through_reports_storage_failure() -> Result<()> {
    let store = Arc::new(FailingStore::new(MemoryStore::new()));
    let remote = MemoryRemote::new();
    let engine = Engine::with_shared_store(Arc::clone(&store), Arc::new(remote.clone()), EngineConfig::default());
    let announcements = engine
        .collection(&announcements_path(), JsonCodec::<Announcement>::new())
        .await?;
    announcements.write(&announcement("s1", "cached")).await?;

    // The cache read itself fails.
    store.fail_reads(true);
    let err = announcements.read().collect_all().await.unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable(_)));

    // The cache is readable but the refreshed snapshot cannot be stored.
    store.fail_reads(false);
    let newer = JsonCodec::<Announcement>::new().encode(&announcement("s1", "remote"))?;
    remote.put(&announcements_path(), &RecordKey::from("s1"), newer);
    store.fail_writes(true);

    let mut read = announcements.read();
    assert_eq!(read.next().await.transpose()?, Some(vec![announcement("s1", "cached")]));
    assert!(matches!(read.next().await, Some(Err(SyncError::StorageUnavailable(_)))));
    assert!(read.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn slow_fetch_does_not_hold_up_live_events() -> Result<()> {
    init_tracing();
    let fx = TestFixture::new();
    let announcements = fx.announcements().await;
    announcements.ensure_subscribed().await?;
    fx.remote.set_faults(Faults {
        fetch_delay: Some(Duration::from_millis(800)),
        ..Faults::default()
    });

    let mut changes = announcements.changes();
    let refreshing = tokio::spawn({
        let announcements = announcements.clone();
        async move { announcements.refresh().await }
    });
    while fx.remote.fetch_count() == 0 {
        tokio::task::yield_now().await;
    }

    fx.seed_remote_announcements(&[announcement("n1", "live")]);
    tokio::time::timeout(Duration::from_millis(300), changes.changed()).await??;
    assert_eq!(
        announcements.get(&RecordKey::from("n1")).await?,
        Some(announcement("n1", "live"))
    );
    assert!(!refreshing.is_finished());

    // The snapshot predates the live event, so the row is left alone.
    let summary = refreshing.await??;
    assert_eq!(summary.skipped, 1);
    assert_eq!(announcements.snapshot().await?, vec![announcement("n1", "live")]);
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_held_handles() -> Result<()> {
    init_tracing();
    let fx = TestFixture::new();
    let stale = fx.announcements().await;
    stale.ensure_subscribed().await?;
    fx.engine.shutdown().await;

    // A held handle still reads the cache but cannot resubscribe.
    assert_eq!(stale.read().collect_all().await?, vec![Vec::<Announcement>::new()]);
    assert!(matches!(stale.ensure_subscribed().await, Err(SyncError::Closed(_))));
    assert_eq!(fx.remote.listener_count(&announcements_path()), 0);
    assert!(fx.engine.registry().is_empty().await);

    let fresh = fx.announcements().await;
    let mut live = fresh.subscribe().await?;
    assert!(live.next().await?.is_empty());

    fx.seed_remote_announcements(&[announcement("n1", "after shutdown")]);
    let snapshot = tokio::time::timeout(Duration::from_secs(1), live.next()).await??;
    assert_eq!(snapshot, vec![announcement("n1", "after shutdown")]);
    assert_eq!(fx.remote.listener_count(&announcements_path()), 1);
    Ok(())
}

#[tokio::test]
async fn remote_timeout_reports_timed_out() -> Result<()> {
    let config = EngineConfig::default().with_coordinator(
        replica::CoordinatorConfig::default().with_remote_timeout(Duration::from_millis(25)),
    );
    let fx = TestFixture::with_config(config);
    fx.seed_cached_announcements(&[announcement("t1", "cached")], 1).await;
    fx.remote.set_faults(Faults {
        fetch_delay: Some(Duration::from_secs(5)),
        ..Faults::default()
    });

    let announcements = fx.announcements().await;
    let err = announcements.refresh().await.unwrap_err();
    assert!(matches!(err, SyncError::RemoteFetchFailed(RemoteError::TimedOut)));

    // Read-through still serves the cache.
    let deliveries = announcements.read().collect_all().await?;
    assert_eq!(deliveries, vec![vec![announcement("t1", "cached")]]);
    Ok(())
}

#[tokio::test]
async fn sqlite_cache_survives_restart() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("replica.db");
    let remote = MemoryRemote::new();
    remote.set_faults(Faults {
        write: Some(offline()),
        ..Faults::default()
    });

    let last_seq = {
        let engine = Engine::new(SqliteStore::open(&db)?, Arc::new(remote.clone()), EngineConfig::default());
        let announcements = engine
            .collection(&announcements_path(), JsonCodec::<Announcement>::new())
            .await?;
        announcements.write(&announcement("p1", "persisted")).await.unwrap_err();
        announcements.write(&announcement("p2", "also persisted")).await.unwrap_err();
        engine.shutdown().await;
        announcements.last_seq()
    };

    remote.heal();
    let store = Arc::new(SqliteStore::open(&db)?);
    let engine = Engine::with_shared_store(Arc::clone(&store), Arc::new(remote.clone()), EngineConfig::default());
    let announcements = engine
        .collection(&announcements_path(), JsonCodec::<Announcement>::new())
        .await?;

    assert_eq!(announcements.last_seq(), last_seq);
    assert_eq!(
        announcements.unsynced().await?,
        vec![announcement("p1", "persisted"), announcement("p2", "also persisted")]
    );

    announcements.write(&announcement("p1", "persisted")).await?;
    let rows: Vec<CachedRecord> = store.dirty(&announcements_path()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.as_str(), "p2");
    assert!(rows[0].last_applied_seq <= last_seq);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn live_cache_converges_with_remote(script in remote_script(25)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fx = TestFixture::new();
            let announcements = fx.announcements().await;
            announcements.ensure_subscribed().await.unwrap();

            apply_script(&fx.remote, &script);

            // Writes queue behind every event already delivered.
            let sentinel = announcement("zz-sentinel", "barrier");
            announcements.write(&sentinel).await.unwrap();

            let cached: Vec<Announcement> = announcements
                .snapshot()
                .await
                .unwrap()
                .into_iter()
                .filter(|a| a.record_key() != sentinel.record_key())
                .collect();
            let remote: Vec<Announcement> = fx
                .remote_announcements()
                .into_iter()
                .filter(|a| a.record_key() != sentinel.record_key())
                .collect();
            assert_eq!(cached, remote);
        });
    }
}

#[test]
fn codec_round_trips_fixture_record() {
    let codec = JsonCodec::<Announcement>::new();
    let record = announcement("x", "y");
    let (key, decoded) = codec.decode_keyed(&codec.encode(&record).unwrap()).unwrap();
    assert_eq!(key, RecordKey::from("x"));
    assert_eq!(decoded, record);
}
