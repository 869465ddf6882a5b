//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

use replica::{Engine, EngineConfig};
use replica_core::{CachedRecord, CollectionPath, JsonCodec, Keyed, RecordCodec, RecordKey, Seq};
use replica_store::{LocalStore, MemoryStore};
use replica_sync::{Coordinator, MemoryRemote};

/// Install a fmt subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

/// A school announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub pinned: bool,
}

impl Keyed for Announcement {
    fn record_key(&self) -> RecordKey {
        RecordKey::new(self.id.clone())
    }
}

/// Build an unpinned announcement.
pub fn announcement(id: &str, title: &str) -> Announcement {
    Announcement {
        id: id.to_string(),
        title: title.to_string(),
        pinned: false,
    }
}

/// A chat message in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub text: String,
    pub sent_at: i64,
}

impl Keyed for ChatMessage {
    fn record_key(&self) -> RecordKey {
        RecordKey::new(self.id.clone())
    }
}

/// Path of the announcements collection used by the fixture.
pub fn announcements_path() -> CollectionPath {
    CollectionPath::from_segments(["school-42", "Announcements"]).expect("valid fixture path")
}

/// Path of one chat room's messages.
pub fn chat_path(room: &str) -> CollectionPath {
    CollectionPath::from_segments(["school-42", "Chats", room]).expect("valid fixture path")
}

/// A memory store, a memory remote and an engine over both.
pub struct TestFixture {
    pub store: Arc<MemoryStore>,
    pub remote: MemoryRemote,
    pub engine: Engine<MemoryStore>,
}

impl TestFixture {
    /// Create a fixture with the default engine configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = MemoryRemote::new();
        let engine = Engine::with_shared_store(Arc::clone(&store), Arc::new(remote.clone()), config);
        Self {
            store,
            remote,
            engine,
        }
    }

    /// The announcements collection.
    pub async fn announcements(&self) -> Coordinator<JsonCodec<Announcement>> {
        self.engine
            .collection(&announcements_path(), JsonCodec::new())
            .await
            .expect("open announcements")
    }

    /// The messages of one chat room.
    pub async fn chat(&self, room: &str) -> Coordinator<JsonCodec<ChatMessage>> {
        self.engine
            .collection(&chat_path(room), JsonCodec::new())
            .await
            .expect("open chat")
    }

    /// Put announcements on the remote as another client would.
    pub fn seed_remote_announcements(&self, records: &[Announcement]) {
        let codec = JsonCodec::<Announcement>::new();
        for record in records {
            let payload = codec.encode(record).expect("encode fixture");
            self.remote.put(&announcements_path(), &record.record_key(), payload);
        }
    }

    /// Put clean announcement rows straight into the cache, stamped `seq`.
    pub async fn seed_cached_announcements(&self, records: &[Announcement], seq: Seq) {
        let codec = JsonCodec::<Announcement>::new();
        let rows: Vec<CachedRecord> = records
            .iter()
            .map(|r| CachedRecord::clean(r.record_key(), codec.encode(r).expect("encode fixture"), seq))
            .collect();
        self.store
            .upsert_many(&announcements_path(), &rows)
            .await
            .expect("seed cache");
    }

    /// Announcements currently stored on the remote, ordered by key.
    pub fn remote_announcements(&self) -> Vec<Announcement> {
        let codec = JsonCodec::<Announcement>::new();
        self.remote
            .records(&announcements_path())
            .into_iter()
            .map(|(_, payload)| codec.decode(&payload).expect("decode remote fixture"))
            .collect()
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
