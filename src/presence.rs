use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// How long an online record stays fresh without renewal.
pub const ONLINE_TTL: Duration = Duration::from_secs(300);
/// How long an offline record (and its last-seen timestamp) is kept around.
pub const OFFLINE_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
struct PresenceRecord {
    status: Status,
    last_seen_ms: i64,
    deadline: Instant,
}

/// Per-user online/offline status with TTL-based expiry. Presence is
/// independent of conversation membership: a user can be online while
/// belonging to zero conversations.
///
/// Each write replaces the whole per-user record under a single map entry,
/// so readers never observe a half-updated status. Expiry is lazy: stale
/// records are dropped on the read path.
pub struct PresenceStore {
    records: DashMap<String, PresenceRecord>,
    online_ttl: Duration,
    offline_ttl: Duration,
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::with_ttls(ONLINE_TTL, OFFLINE_TTL)
    }
}

impl PresenceStore {
    pub fn with_ttls(online_ttl: Duration, offline_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            online_ttl,
            offline_ttl,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Mark a user online, refreshing the short TTL.
    pub fn set_online(&self, user_id: &str) {
        self.records.insert(
            user_id.to_string(),
            PresenceRecord {
                status: Status::Online,
                last_seen_ms: Self::now_ms(),
                deadline: Instant::now() + self.online_ttl,
            },
        );
        tracing::debug!(user_id, "presence online");
    }

    /// Mark a user offline. The record survives for the long TTL so
    /// last-seen stays queryable, then is forgotten entirely.
    pub fn set_offline(&self, user_id: &str) {
        self.records.insert(
            user_id.to_string(),
            PresenceRecord {
                status: Status::Offline,
                last_seen_ms: Self::now_ms(),
                deadline: Instant::now() + self.offline_ttl,
            },
        );
        tracing::debug!(user_id, "presence offline");
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        matches!(self.status(user_id), Some(Status::Online))
    }

    /// Current status, dropping the record if its TTL has lapsed.
    pub fn status(&self, user_id: &str) -> Option<Status> {
        let expired = match self.records.get(user_id) {
            Some(record) => {
                if record.deadline > Instant::now() {
                    return Some(record.status);
                }
                true
            }
            None => false,
        };
        if expired {
            self.purge_if_stale(user_id);
        }
        None
    }

    /// Drop a record only if it is still past its deadline. A refresh that
    /// landed between a read observing expiry and this cleanup survives.
    fn purge_if_stale(&self, user_id: &str) {
        self.records
            .remove_if(user_id, |_, record| record.deadline <= Instant::now());
    }

    /// Milliseconds since epoch of the last presence-affecting event,
    /// if the record has not expired.
    pub fn last_seen(&self, user_id: &str) -> Option<i64> {
        self.status(user_id)?;
        self.records.get(user_id).map(|r| r.last_seen_ms)
    }

    /// All users whose online record is still fresh. Purges stale records
    /// as a side effect.
    pub fn online_users(&self) -> Vec<String> {
        let now = Instant::now();
        self.records.retain(|_, record| record.deadline > now);
        self.records
            .iter()
            .filter(|entry| entry.status == Status::Online)
            .map(|entry| entry.key().clone())
            .collect()
    }
}
