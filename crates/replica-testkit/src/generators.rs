//! Proptest generators for Replica types.

use proptest::prelude::*;

use replica_core::{CollectionPath, RecordKey};
use replica_sync::MemoryRemote;

use crate::fixtures::{announcements_path, Announcement};

/// Generate a record key from a small alphabet, so scripts revisit keys.
pub fn record_key() -> impl Strategy<Value = RecordKey> {
    "[a-e]".prop_map(RecordKey::new)
}

/// Generate a collection path of one to three segments.
pub fn collection_path() -> impl Strategy<Value = CollectionPath> {
    prop::collection::vec("[a-z][a-z0-9-]{0,7}", 1..=3).prop_map(|segments| {
        CollectionPath::from_segments(segments).expect("generated segments are valid")
    })
}

/// Generate an announcement whose id comes from [`record_key`].
pub fn announcement() -> impl Strategy<Value = Announcement> {
    (record_key(), "[A-Za-z ]{1,20}", any::<bool>()).prop_map(|(key, title, pinned)| Announcement {
        id: key.as_str().to_string(),
        title,
        pinned,
    })
}

/// One change another client makes on the remote.
#[derive(Debug, Clone)]
pub enum RemoteStep {
    Put(Announcement),
    Remove(RecordKey),
}

/// Generate a remote change script of up to `max_len` steps.
pub fn remote_script(max_len: usize) -> impl Strategy<Value = Vec<RemoteStep>> {
    let step = prop_oneof![
        3 => announcement().prop_map(RemoteStep::Put),
        1 => record_key().prop_map(RemoteStep::Remove),
    ];
    prop::collection::vec(step, 0..=max_len)
}

/// Play a script against the announcements collection of a remote.
pub fn apply_script(remote: &MemoryRemote, script: &[RemoteStep]) {
    use replica_core::{JsonCodec, Keyed, RecordCodec};

    let codec = JsonCodec::<Announcement>::new();
    let path = announcements_path();
    for step in script {
        match step {
            RemoteStep::Put(record) => {
                let payload = codec.encode(record).expect("encode generated record");
                remote.put(&path, &record.record_key(), payload);
            }
            RemoteStep::Remove(key) => remote.remove(&path, key),
        }
    }
}
