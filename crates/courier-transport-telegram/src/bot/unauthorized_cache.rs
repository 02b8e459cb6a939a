//! Unauthorized access flood protection
//!
//! Strangers who poke the relay get "Access denied" at most once per cooldown
//! window, so a noisy chat cannot push the bot into Telegram's rate limits
//! while a relay run is sharing the same token.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cooldown tracker for "Access denied" replies
///
/// Every attempt is counted; only the first one per cooldown window is
/// answered.
#[derive(Clone)]
pub struct UnauthorizedCache {
    /// user_id -> () with the cooldown as time-to-live
    cache: Cache<i64, ()>,
    cooldown: Duration,
    silenced_count: Arc<AtomicU64>,
}

impl UnauthorizedCache {
    /// Creates a new `UnauthorizedCache`
    ///
    /// * `cooldown_secs` - Seconds between replies to the same user
    /// * `idle_ttl_secs` - Entries untouched for this long are dropped early
    /// * `max_capacity` - Maximum number of tracked users
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_transport_telegram::bot::UnauthorizedCache;
    ///
    /// let cache = UnauthorizedCache::new(1200, 7200, 10_000);
    /// assert_eq!(cache.cooldown().as_secs(), 1200);
    /// ```
    #[must_use]
    pub fn new(cooldown_secs: u64, idle_ttl_secs: u64, max_capacity: u64) -> Self {
        let cooldown = Duration::from_secs(cooldown_secs);
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(cooldown)
            .time_to_idle(Duration::from_secs(idle_ttl_secs.max(1)))
            .build();

        Self {
            cache,
            cooldown,
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether a denial should be sent to `user_id` now.
    ///
    /// Only every 100th silenced attempt is logged.
    pub async fn should_send(&self, user_id: i64, user_name: &str) -> bool {
        if self.cache.get(&user_id).await.is_none() {
            return true;
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(100) {
            debug!(
                silenced = count,
                user_id, user_name, "Silenced unauthorized control attempts"
            );
        }

        false
    }

    /// Start the cooldown for `user_id` after a denial was delivered.
    pub async fn mark_sent(&self, user_id: i64) {
        self.cache.insert(user_id, ()).await;
    }

    /// Total number of silenced attempts.
    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }

    /// Configured cooldown.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
