use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, instrument, trace, warn};

use crate::error::{ConfigError, LockError, StoreError};

/// Shared key-value store with expiring entries.
///
/// Any store offering these primitives atomically can back a `LockProvider`.
/// Every `LockProvider` that shares a store instance (or the underlying shared
/// medium) is mutually excluded on the same keys.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short name used in logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Set `key` to `value` with the given TTL if the key is absent or expired.
    /// Returns `true` if the entry was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete `key` only if its current value equals `value`.
    /// Returns `true` if an entry was removed.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Remaining TTL of `key`, or `None` if absent or expired.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Whether `key` currently holds a live entry.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Tuning for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a lock entry survives if its holder never releases it.
    pub ttl: Duration,
    /// First retry delay on contention.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling retry delay.
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl LockConfig {
    /// A zero TTL would let every entry expire as it is written.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::ZeroBackoff);
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::BackoffBounds {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        Ok(())
    }
}

/// A held lock. Valid between a successful `acquire` and `release` or expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    token: String,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque owner token, unique per acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Doubling retry delay bounded by a deadline.
struct Backoff {
    started: Instant,
    deadline: Instant,
    delay: Duration,
    max: Duration,
}

impl Backoff {
    fn new(config: &LockConfig, max_wait: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + max_wait,
            delay: config.initial_backoff,
            max: config.max_backoff,
        }
    }

    fn waited(&self) -> Duration {
        self.started.elapsed()
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Sleep before the next attempt. Returns `false` once the deadline has
    /// passed, without sleeping.
    async fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let sleep_for = (self.delay + Duration::from_millis(jitter_ms()))
            .min(self.deadline - now);
        tokio::time::sleep(sleep_for).await;
        self.delay = (self.delay * 2).min(self.max);
        true
    }
}

/// Distributed mutual exclusion over a `KvStore`.
pub struct LockProvider {
    store: Arc<dyn KvStore>,
    config: LockConfig,
    /// Handles issued by this provider and not yet released: token -> key.
    held: DashMap<String, String>,
}

impl LockProvider {
    pub fn new(store: Arc<dyn KvStore>, config: LockConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            held: DashMap::new(),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the lock for `key`, retrying with backoff until `max_wait`
    /// elapses. At least one attempt is made even when `max_wait` is zero.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, key: &str, max_wait: Duration) -> Result<LockHandle, LockError> {
        let token = uuid::Uuid::new_v4().to_string();
        let mut backoff = Backoff::new(&self.config, max_wait);
        let mut attempt: u32 = 0;

        loop {
            let acquired = self
                .store
                .set_if_absent(key, &token, self.config.ttl)
                .await
                .map_err(|source| LockError::Unavailable {
                    key: key.to_string(),
                    source,
                })?;

            if acquired {
                debug!(key, attempt, "lock acquired");
                self.held.insert(token.clone(), key.to_string());
                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                    acquired_at: Utc::now(),
                    ttl: self.config.ttl,
                });
            }

            trace!(key, attempt, "lock contended, backing off");
            if !backoff.wait().await {
                debug!(key, attempt, "lock wait budget exhausted");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: backoff.waited(),
                });
            }
            attempt += 1;
        }
    }

    /// Acquire `key`, treating a live `blocker` entry as contention: while
    /// `blocker` is held the freshly taken `key` is given back and the
    /// attempt is retried within `max_wait`.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_unless_held(
        &self,
        key: &str,
        blocker: &str,
        max_wait: Duration,
    ) -> Result<LockHandle, LockError> {
        let mut backoff = Backoff::new(&self.config, max_wait);

        loop {
            let handle = self
                .acquire(key, backoff.remaining())
                .await
                .map_err(|err| match err {
                    LockError::Timeout { key, .. } => LockError::Timeout {
                        key,
                        waited: backoff.waited(),
                    },
                    other => other,
                })?;

            match self.store.exists(blocker).await {
                Ok(false) => return Ok(handle),
                Ok(true) => {
                    trace!(key, blocker, "blocking lock is held, yielding");
                    self.release(&handle).await;
                }
                Err(source) => {
                    self.release(&handle).await;
                    return Err(LockError::Unavailable {
                        key: blocker.to_string(),
                        source,
                    });
                }
            }

            if !backoff.wait().await {
                return Err(LockError::Timeout {
                    key: blocker.to_string(),
                    waited: backoff.waited(),
                });
            }
        }
    }

    /// Wait until none of `keys` is held, up to `max_wait`.
    #[instrument(skip(self), level = "debug")]
    pub async fn wait_until_free(
        &self,
        keys: &[String],
        max_wait: Duration,
    ) -> Result<(), LockError> {
        let mut backoff = Backoff::new(&self.config, max_wait);

        for key in keys {
            loop {
                let held = self
                    .store
                    .exists(key)
                    .await
                    .map_err(|source| LockError::Unavailable {
                        key: key.clone(),
                        source,
                    })?;
                if !held {
                    break;
                }
                if !backoff.wait().await {
                    return Err(LockError::Timeout {
                        key: key.clone(),
                        waited: backoff.waited(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Release a handle. Safe to call more than once and after expiry; the
    /// entry is only removed while it still carries this handle's token.
    /// Returns `true` if an entry was removed. If the store cannot be
    /// reached the handle stays tracked so `release_all` can retry it.
    #[instrument(skip(self, handle), level = "debug", fields(key = %handle.key))]
    pub async fn release(&self, handle: &LockHandle) -> bool {
        match self.store.delete_if_equals(&handle.key, &handle.token).await {
            Ok(removed) => {
                self.held.remove(&handle.token);
                if !removed {
                    debug!("lock already expired or taken over");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "failed to release lock, entry will expire by TTL");
                false
            }
        }
    }

    /// Best-effort check whether `key` is held by anyone.
    pub async fn is_locked(&self, key: &str) -> Result<bool, StoreError> {
        self.store.exists(key).await
    }

    /// Best-effort remaining TTL for `key`.
    pub async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.store.remaining_ttl(key).await
    }

    /// Number of handles issued by this provider and not yet released.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Release every handle this provider still tracks. Handles whose
    /// release fails stay tracked.
    pub async fn release_all(&self) -> usize {
        let outstanding: Vec<(String, String)> = self
            .held
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut released = 0;
        for (token, key) in outstanding {
            match self.store.delete_if_equals(&key, &token).await {
                Ok(removed) => {
                    self.held.remove(&token);
                    if removed {
                        released += 1;
                    }
                }
                Err(e) => warn!(key, error = %e, "failed to release lock during cleanup"),
            }
        }
        released
    }
}

/// Simple jitter: 0..10ms derived from timestamp nanos.
fn jitter_ms() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 10)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Minimal store without expiry, with a switch to simulate an outage.
    #[derive(Default)]
    struct TestStore {
        entries: Mutex<HashMap<String, String>>,
        down: AtomicBool,
    }

    impl TestStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KvStore for TestStore {
        fn backend_name(&self) -> &'static str {
            "test"
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            _ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.check()?;
            let mut map = self.entries.lock().unwrap();
            if map.contains_key(key) {
                return Ok(false);
            }
            map.insert(key.to_string(), value.to_string());
            Ok(true)
        }

        async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
            self.check()?;
            let mut map = self.entries.lock().unwrap();
            if map.get(key).map(String::as_str) == Some(value) {
                map.remove(key);
                return Ok(true);
            }
            Ok(false)
        }

        async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
            self.check()?;
            Ok(self.entries.lock().unwrap().get(key).map(|_| Duration::from_secs(30)))
        }

        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.check()?;
            Ok(self.entries.lock().unwrap().contains_key(key))
        }
    }

    fn provider() -> (LockProvider, Arc<TestStore>) {
        let store = Arc::new(TestStore::default());
        let provider = LockProvider::new(store.clone(), LockConfig::default()).unwrap();
        (provider, store)
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (provider, _store) = provider();

        let handle = provider
            .acquire("doc:ws:a", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(handle.key(), "doc:ws:a");
        assert!(provider.is_locked("doc:ws:a").await.unwrap());
        assert_eq!(provider.held_count(), 1);

        assert!(provider.release(&handle).await);
        assert!(!provider.is_locked("doc:ws:a").await.unwrap());
        assert_eq!(provider.held_count(), 0);
    }

    #[tokio::test]
    async fn test_release_twice_is_noop() {
        let (provider, _store) = provider();

        let handle = provider.acquire("k", Duration::ZERO).await.unwrap();
        assert!(provider.release(&handle).await);
        assert!(!provider.release(&handle).await);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_new_holder() {
        let (provider, store) = provider();

        let first = provider.acquire("k", Duration::ZERO).await.unwrap();
        // Simulate expiry followed by another holder taking the key.
        store.entries.lock().unwrap().insert("k".into(), "other-owner".into());

        assert!(!provider.release(&first).await);
        assert!(provider.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_when_held() {
        let (provider, _store) = provider();

        let _held = provider.acquire("k", Duration::ZERO).await.unwrap();
        let started = Instant::now();
        let err = provider
            .acquire("k", Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_closed() {
        let (provider, store) = provider();
        store.down.store(true, Ordering::SeqCst);

        let err = provider
            .acquire("k", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }));
        assert_eq!(provider.held_count(), 0);
    }

    #[tokio::test]
    async fn test_release_all() {
        let (provider, _store) = provider();

        provider.acquire("a", Duration::ZERO).await.unwrap();
        provider.acquire("b", Duration::ZERO).await.unwrap();

        assert_eq!(provider.release_all().await, 2);
        assert_eq!(provider.held_count(), 0);
        assert!(!provider.is_locked("a").await.unwrap());
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let store = Arc::new(TestStore::default());
        let config = LockConfig {
            ttl: Duration::ZERO,
            ..LockConfig::default()
        };
        assert_eq!(
            LockProvider::new(store, config).err(),
            Some(ConfigError::ZeroTtl)
        );
    }

    #[test]
    fn test_backoff_bounds_are_validated() {
        let config = LockConfig {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(10),
            ..LockConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackoffBounds { .. })
        ));
        assert!(LockConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_failed_release_stays_tracked_for_release_all() {
        let (provider, store) = provider();
        let handle = provider.acquire("k", Duration::ZERO).await.unwrap();

        store.down.store(true, Ordering::SeqCst);
        assert!(!provider.release(&handle).await);
        assert_eq!(provider.held_count(), 1);
        assert_eq!(provider.release_all().await, 0);
        assert_eq!(provider.held_count(), 1);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(provider.release_all().await, 1);
        assert_eq!(provider.held_count(), 0);
        assert!(!provider.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_unless_held_yields_to_blocker() {
        let (provider, _store) = provider();
        let blocker = provider.acquire("workspace:ws", Duration::ZERO).await.unwrap();

        let err = provider
            .acquire_unless_held("doc:ws:a", "workspace:ws", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        // The document key was given back after each attempt.
        assert!(!provider.is_locked("doc:ws:a").await.unwrap());

        provider.release(&blocker).await;
        let handle = provider
            .acquire_unless_held("doc:ws:a", "workspace:ws", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(handle.key(), "doc:ws:a");
        assert_eq!(provider.held_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_until_free() {
        let (provider, _store) = provider();
        let keys = vec!["doc:ws:a".to_string(), "doc:ws:b".to_string()];
        provider.wait_until_free(&keys, Duration::ZERO).await.unwrap();

        let _held = provider.acquire("doc:ws:b", Duration::ZERO).await.unwrap();
        let err = provider
            .wait_until_free(&keys, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            LockError::Timeout { key, .. } => assert_eq!(key, "doc:ws:b"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
