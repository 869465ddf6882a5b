//! Coordinator lifecycle states.

use std::fmt;

/// Lifecycle state of one collection's coordinator.
///
/// ```text
/// Idle ──subscribe──▶ Subscribing ──ok──▶ Active ──Cancelled──▶ Degraded
///   ▲                     │                 │                      │
///   └──────failed─────────┘                 └──────release─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncState {
    /// No subscription; the cache may serve stale data.
    #[default]
    Idle,
    /// A registration is in flight. Reads are not blocked.
    Subscribing,
    /// The subscription is confirmed and every event is applied.
    Active,
    /// The remote cancelled the subscription. Events are no longer applied
    /// and nothing resubscribes until the collection is released.
    Degraded,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Subscribing => "subscribing",
            SyncState::Active => "active",
            SyncState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}
