use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use sluice_common::config::CacheTierSettings;
use sluice_common::lob::LobStore;
use sluice_common::models::Determinism;
use sluice_error::Result;
use tracing::{debug, warn};

use super::CacheId;

/// A value that can live in a [`SessionAwareCache`].
///
/// Values bound for the shared tier pass through `prepare` (externalize large
/// payloads into the LOB store) and come back through `restore`.
pub trait Cachable: Clone + Send + Sync + 'static {
    fn prepare(&self, _store: &dyn LobStore) -> Result<Self> {
        Ok(self.clone())
    }

    fn restore(&self, _store: &dyn LobStore) -> Result<Self> {
        Ok(self.clone())
    }
}

struct Entry<T> {
    value: T,
    determinism: Determinism,
    /// Overrides the tier's time to live.
    ttl: Option<Duration>,
}

/// Expires each entry after its own TTL, or the tier default.
struct EntryExpiry {
    default_ttl: Duration,
}

impl<T> Expiry<CacheId, Arc<Entry<T>>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheId,
        entry: &Arc<Entry<T>>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl.unwrap_or(self.default_ttl))
    }

    fn expire_after_update(
        &self,
        _key: &CacheId,
        entry: &Arc<Entry<T>>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl.unwrap_or(self.default_ttl))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub skipped: u64,
    pub prepare_failures: u64,
    pub restore_failures: u64,
    pub local_entries: u64,
    pub shared_entries: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    skipped: AtomicU64,
    prepare_failures: AtomicU64,
    restore_failures: AtomicU64,
}

/// Two-tier cache keyed by determinism-normalized [`CacheId`]s.
///
/// Session-scoped values stay in the local tier under their exact key. User
/// and fully deterministic values go through `prepare` into the shared tier,
/// where any session (or any user) can find them.
pub struct SessionAwareCache<T: Cachable> {
    name: &'static str,
    enabled: bool,
    local: Cache<CacheId, Arc<Entry<T>>>,
    shared: Cache<CacheId, Arc<Entry<T>>>,
    store: Arc<dyn LobStore>,
    counters: Counters,
}

impl<T: Cachable> SessionAwareCache<T> {
    pub fn new(name: &'static str, settings: &CacheTierSettings, store: Arc<dyn LobStore>) -> Self {
        let build = || -> Cache<CacheId, Arc<Entry<T>>> {
            Cache::builder()
                .max_capacity(settings.max_entries)
                .expire_after(EntryExpiry {
                    default_ttl: Duration::from_secs(settings.ttl_seconds),
                })
                .build()
        };
        debug!(
            target: "cache",
            cache = name,
            enabled = settings.enabled,
            max_entries = settings.max_entries,
            "Cache created"
        );
        Self {
            name,
            enabled: settings.enabled,
            local: build(),
            shared: build(),
            store,
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, id: &CacheId) -> Option<T> {
        if !self.enabled {
            return None;
        }
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.local.get(id) {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            debug!(target: "cache", cache = self.name, key = %id.fingerprint(), "Local hit");
            return Some(entry.value.clone());
        }

        for key in [id.without_session(), id.without_session_and_user()] {
            let Some(entry) = self.shared.get(&key) else {
                continue;
            };
            match entry.value.restore(self.store.as_ref()) {
                Ok(value) => {
                    self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target: "cache",
                        cache = self.name,
                        key = %key.fingerprint(),
                        determinism = ?entry.determinism,
                        "Shared hit"
                    );
                    return Some(value);
                }
                Err(e) => {
                    self.counters.restore_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "cache",
                        cache = self.name,
                        key = %key.fingerprint(),
                        error = %e,
                        "Failed to restore cached value, treating as miss"
                    );
                    self.shared.invalidate(&key);
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `value` under `id` normalized for `determinism`.
    ///
    /// Returns false when the value was not stored: caching disabled, a
    /// nondeterministic value, or a failed prepare step.
    pub fn put(&self, id: &CacheId, determinism: Determinism, value: T, ttl: Option<Duration>) -> bool {
        if !self.enabled || !determinism.is_cacheable() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let key = id.normalize(determinism);

        if determinism > Determinism::Session {
            let prepared = match value.prepare(self.store.as_ref()) {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.counters.prepare_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "cache",
                        cache = self.name,
                        key = %key.fingerprint(),
                        error = %e,
                        "Failed to prepare value, not cached"
                    );
                    return false;
                }
            };
            self.shared.insert(
                key,
                Arc::new(Entry {
                    value: prepared,
                    determinism,
                    ttl,
                }),
            );
        } else {
            self.local.insert(
                key,
                Arc::new(Entry {
                    value,
                    determinism,
                    ttl,
                }),
            );
        }
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn clear_all(&self) {
        self.local.invalidate_all();
        self.shared.invalidate_all();
        debug!(target: "cache", cache = self.name, "Cleared");
    }

    /// Drops every entry of one VDB version. Returns how many were removed.
    pub fn clear_for_vdb(&self, vdb_name: &str, vdb_version: u32) -> usize {
        let mut removed = 0;
        for tier in [&self.local, &self.shared] {
            let keys: Vec<Arc<CacheId>> = tier
                .iter()
                .filter(|(key, _)| key.vdb_name == vdb_name && key.vdb_version == vdb_version)
                .map(|(key, _)| key)
                .collect();
            for key in keys {
                tier.invalidate(key.as_ref());
                removed += 1;
            }
        }
        debug!(target: "cache", cache = self.name, vdb = vdb_name, vdb_version, removed, "Cleared VDB entries");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        let local_hits = c.local_hits.load(Ordering::Relaxed);
        let shared_hits = c.shared_hits.load(Ordering::Relaxed);
        CacheStats {
            requests: c.requests.load(Ordering::Relaxed),
            hits: local_hits + shared_hits,
            local_hits,
            shared_hits,
            misses: c.misses.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            prepare_failures: c.prepare_failures.load(Ordering::Relaxed),
            restore_failures: c.restore_failures.load(Ordering::Relaxed),
            local_entries: self.local.entry_count(),
            shared_entries: self.shared.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_common::lob::MemoryLobStore;
    use sluice_common::models::SessionInfo;
    use sluice_error::{ErrorCode, SluiceError};
    use std::sync::atomic::AtomicBool;

    #[derive(Clone, Debug)]
    struct Payload {
        value: String,
        fail_prepare: bool,
        fail_restore: Arc<AtomicBool>,
    }

    impl Payload {
        fn new(value: &str) -> Self {
            Self {
                value: value.to_string(),
                fail_prepare: false,
                fail_restore: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Cachable for Payload {
        fn prepare(&self, _store: &dyn LobStore) -> Result<Self> {
            if self.fail_prepare {
                return Err(SluiceError::new(ErrorCode::CacheStoreFailed, "prepare failed"));
            }
            Ok(self.clone())
        }

        fn restore(&self, _store: &dyn LobStore) -> Result<Self> {
            if self.fail_restore.load(Ordering::SeqCst) {
                return Err(SluiceError::new(ErrorCode::CacheStoreFailed, "restore failed"));
            }
            Ok(self.clone())
        }
    }

    fn cache() -> SessionAwareCache<Payload> {
        SessionAwareCache::new(
            "test",
            &CacheTierSettings::default(),
            Arc::new(MemoryLobStore::new()),
        )
    }

    fn id(session: &str, user: &str) -> CacheId {
        CacheId::new("SELECT 1", "", &SessionInfo::new(session, user, "vdb", 1))
    }

    #[test]
    fn test_user_deterministic_is_shared_across_sessions_not_users() {
        let cache = cache();
        assert!(cache.put(&id("S1", "U1"), Determinism::User, Payload::new("r"), None));

        assert_eq!(cache.get(&id("S2", "U1")).map(|p| p.value), Some("r".to_string()));
        assert!(cache.get(&id("S2", "U2")).is_none());
    }

    #[test]
    fn test_session_deterministic_stays_in_session() {
        let cache = cache();
        cache.put(&id("S1", "U1"), Determinism::Session, Payload::new("r"), None);

        assert!(cache.get(&id("S1", "U1")).is_some());
        assert!(cache.get(&id("S2", "U1")).is_none());
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[test]
    fn test_deterministic_is_shared_by_everyone() {
        let cache = cache();
        cache.put(&id("S1", "U1"), Determinism::Deterministic, Payload::new("r"), None);
        assert!(cache.get(&id("S9", "U9")).is_some());
    }

    #[test]
    fn test_nondeterministic_is_never_stored() {
        let cache = cache();
        assert!(!cache.put(&id("S1", "U1"), Determinism::Nondeterministic, Payload::new("r"), None));
        assert!(cache.get(&id("S1", "U1")).is_none());
        assert_eq!(cache.stats().skipped, 1);
    }

    #[test]
    fn test_prepare_failure_skips_insert() {
        let cache = cache();
        let mut payload = Payload::new("r");
        payload.fail_prepare = true;
        assert!(!cache.put(&id("S1", "U1"), Determinism::Deterministic, payload, None));
        assert!(cache.get(&id("S1", "U1")).is_none());
        assert_eq!(cache.stats().prepare_failures, 1);
    }

    #[test]
    fn test_restore_failure_is_a_miss() {
        let cache = cache();
        let payload = Payload::new("r");
        let flag = payload.fail_restore.clone();
        cache.put(&id("S1", "U1"), Determinism::User, payload, None);
        flag.store(true, Ordering::SeqCst);

        assert!(cache.get(&id("S1", "U1")).is_none());
        let stats = cache.stats();
        assert_eq!((stats.restore_failures, stats.misses), (1, 1));
    }

    #[test]
    fn test_entry_ttl_expires() {
        let cache = cache();
        cache.put(
            &id("S1", "U1"),
            Determinism::Session,
            Payload::new("r"),
            Some(Duration::from_millis(1)),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&id("S1", "U1")).is_none());
    }

    #[test]
    fn test_expired_entries_leave_the_tier_without_lookups() {
        let cache = cache();
        for n in 0..4 {
            cache.put(
                &CacheId::new(format!("SELECT {}", n), "", &SessionInfo::new("S1", "U1", "vdb", 1)),
                Determinism::Deterministic,
                Payload::new("r"),
                Some(Duration::from_millis(1)),
            );
        }
        cache.put(&id("S1", "U1"), Determinism::Deterministic, Payload::new("kept"), None);
        std::thread::sleep(Duration::from_millis(20));

        cache.shared.run_pending_tasks();
        assert_eq!(cache.stats().shared_entries, 1);
        assert_eq!(cache.stats().requests, 0);
        assert_eq!(cache.get(&id("S2", "U2")).map(|p| p.value), Some("kept".to_string()));
    }

    #[test]
    fn test_clear_for_vdb_only_touches_that_version() {
        let cache = cache();
        let other = CacheId::new("SELECT 1", "", &SessionInfo::new("S1", "U1", "vdb", 2));
        cache.put(&id("S1", "U1"), Determinism::Deterministic, Payload::new("v1"), None);
        cache.put(&other, Determinism::Deterministic, Payload::new("v2"), None);

        assert_eq!(cache.clear_for_vdb("vdb", 1), 1);
        assert!(cache.get(&id("S1", "U1")).is_none());
        assert!(cache.get(&other).is_some());

        cache.clear_all();
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let settings = CacheTierSettings {
            enabled: false,
            ..Default::default()
        };
        let cache: SessionAwareCache<Payload> =
            SessionAwareCache::new("off", &settings, Arc::new(MemoryLobStore::new()));
        assert!(!cache.put(&id("S1", "U1"), Determinism::Deterministic, Payload::new("r"), None));
        assert!(cache.get(&id("S1", "U1")).is_none());
        assert_eq!(cache.stats().requests, 0);
    }
}
