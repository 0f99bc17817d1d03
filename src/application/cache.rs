use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// A single-value time-bounded cache with an injected notion of "now".
///
/// Owned explicitly by whoever needs it and passed by reference; there are no
/// process-global caches.
pub struct TtlCache<T> {
    slot: Mutex<Option<(T, SystemTime)>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            ttl,
        }
    }

    /// The cached value, unless it is absent or older than the TTL.
    pub fn get(&self, now: SystemTime) -> Option<T> {
        let slot = self.slot.lock().expect("cache lock poisoned");
        slot.as_ref().and_then(|(value, stored_at)| {
            let age = now.duration_since(*stored_at).unwrap_or_default();
            (age < self.ttl).then(|| value.clone())
        })
    }

    pub fn put(&self, value: T, now: SystemTime) {
        let mut slot = self.slot.lock().expect("cache lock poisoned");
        *slot = Some((value, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        cache.put(42u32, t0);

        assert_eq!(cache.get(t0), Some(42));
        assert_eq!(cache.get(t0 + Duration::from_secs(59)), Some(42));
        assert_eq!(cache.get(t0 + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_put_refreshes() {
        let cache = TtlCache::new(Duration::from_secs(10));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        cache.put(1u32, t0);
        cache.put(2u32, t0 + Duration::from_secs(9));
        assert_eq!(cache.get(t0 + Duration::from_secs(15)), Some(2));
    }

    #[test]
    fn test_empty() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(10));
        assert_eq!(cache.get(SystemTime::now()), None);
    }
}
