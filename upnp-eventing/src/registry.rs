//! Thread-safe table of live subscriptions keyed by SID
//!
//! The registry is the only shared mutable state of the subscription server.
//! The outbound client inserts and re-keys entries, the NOTIFY listener looks
//! them up, and the renewal scheduler and reaper remove them. All mutations go
//! through one `parking_lot::RwLock`, so a renewal that changes both the SID
//! and the expiry is observed as a single step.

use callback_server::DeliveryError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{Result, SubscriptionError};
use crate::subscription::{expiry_after, NotifyEvent, Subscription};

/// Thread-safe registry of subscriptions
///
/// Lookups clone the record out of the lock; only [`dispatch`](Self::dispatch)
/// runs caller code while a lock is held.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a subscription by its ID
    ///
    /// Replacing is allowed only for the same device/subscriber pair.
    pub fn put(&self, subscription: Subscription) -> Result<()> {
        let mut entries = self.entries.write();

        if let Some(existing) = entries.get(&subscription.id) {
            if !existing.is_owned_by(&subscription.event_url, &subscription.subscriber) {
                return Err(SubscriptionError::DuplicateId(subscription.id));
            }
        }

        entries.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    /// Look up a subscription by ID
    pub fn get(&self, id: &str) -> Result<Subscription> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))
    }

    /// Whether an entry exists for `id`, expired or not
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Atomically move the entry at `old_id` to `new_id`
    pub fn rekey(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut entries = self.entries.write();
        Self::rekey_locked(&mut entries, old_id, new_id)?;
        Ok(())
    }

    /// Apply a renewal grant: re-key if the SID changed and refresh the expiry
    ///
    /// Both changes happen under one write lock. Returns the updated record.
    pub fn apply_renewal(
        &self,
        old_id: &str,
        new_id: &str,
        timeout_seconds: u32,
        granted_at: SystemTime,
    ) -> Result<Subscription> {
        let mut entries = self.entries.write();
        let entry = Self::rekey_locked(&mut entries, old_id, new_id)?;
        entry.timeout_seconds = timeout_seconds;
        entry.expires_at = expiry_after(granted_at, timeout_seconds);
        Ok(entry.clone())
    }

    /// Record whether the renewal scheduler manages subscription `id`
    ///
    /// Returns the updated record.
    pub fn set_auto_renew(&self, id: &str, auto_renew: bool) -> Result<Subscription> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SubscriptionError::NotFound(id.to_string()))?;
        entry.auto_renew = auto_renew;
        Ok(entry.clone())
    }

    fn rekey_locked<'a>(
        entries: &'a mut HashMap<String, Subscription>,
        old_id: &str,
        new_id: &str,
    ) -> Result<&'a mut Subscription> {
        if !entries.contains_key(old_id) {
            return Err(SubscriptionError::NotFound(old_id.to_string()));
        }

        if old_id != new_id {
            if entries.contains_key(new_id) {
                return Err(SubscriptionError::DuplicateId(new_id.to_string()));
            }
            if let Some(mut entry) = entries.remove(old_id) {
                entry.id = new_id.to_string();
                entries.insert(new_id.to_string(), entry);
            }
        }

        entries
            .get_mut(new_id)
            .ok_or_else(|| SubscriptionError::NotFound(old_id.to_string()))
    }

    /// Remove a subscription; returns whether it existed
    pub fn remove(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    /// Remove a subscription and return it
    pub fn take(&self, id: &str) -> Option<Subscription> {
        self.entries.write().remove(id)
    }

    /// Snapshot of the subscriptions still active at `now`
    pub fn list_active(&self, now: SystemTime) -> ActiveSubscriptions {
        let snapshot: Vec<Subscription> = self
            .entries
            .read()
            .values()
            .filter(|sub| sub.is_active(now))
            .cloned()
            .collect();
        ActiveSubscriptions::new(snapshot)
    }

    /// Hand a NOTIFY body to the subscriber registered under `id`
    ///
    /// The subscriber runs while the read lock is held, so once
    /// [`remove`](Self::remove) has returned no further dispatch reaches it.
    pub fn dispatch(
        &self,
        id: &str,
        now: SystemTime,
        body: String,
    ) -> std::result::Result<(), DeliveryError> {
        let entries = self.entries.read();
        let sub = entries
            .get(id)
            .ok_or_else(|| DeliveryError::UnknownSubscription(id.to_string()))?;

        if !sub.is_active(now) {
            return Err(DeliveryError::Expired(id.to_string()));
        }

        sub.subscriber.notify(NotifyEvent {
            subscription_id: id.to_string(),
            body,
        });
        Ok(())
    }

    /// Remove every subscription matching `predicate` and return them
    pub fn remove_where<F>(&self, mut predicate: F) -> Vec<Subscription>
    where
        F: FnMut(&Subscription) -> bool,
    {
        let mut entries = self.entries.write();
        let ids: Vec<String> = entries
            .values()
            .filter(|sub| predicate(sub))
            .map(|sub| sub.id.clone())
            .collect();
        ids.iter().filter_map(|id| entries.remove(id)).collect()
    }

    /// Remove expired subscriptions that are not auto-renewed
    ///
    /// Auto-renewed entries are left to the renewal scheduler, which
    /// removes them itself once it gives up.
    pub fn purge_expired(&self, now: SystemTime) -> Vec<Subscription> {
        self.remove_where(|sub| !sub.auto_renew && !sub.is_active(now))
    }

    /// Number of registered subscriptions, expired or not
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every subscription
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Snapshot of active subscriptions.
///
/// Iterating does not hold the registry lock. Cloning yields an independent
/// cursor over the same snapshot; [`restart`](Self::restart) rewinds this one.
#[derive(Debug, Clone)]
pub struct ActiveSubscriptions {
    snapshot: Arc<[Subscription]>,
    position: usize,
}

impl ActiveSubscriptions {
    fn new(snapshot: Vec<Subscription>) -> Self {
        Self {
            snapshot: snapshot.into(),
            position: 0,
        }
    }

    /// Rewind to the first subscription of the snapshot
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for ActiveSubscriptions {
    type Item = Subscription;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.snapshot.get(self.position)?.clone();
        self.position += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ActiveSubscriptions {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Subscriber;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSubscriber {
        events: Mutex<Vec<NotifyEvent>>,
    }

    impl Subscriber for RecordingSubscriber {
        fn notify(&self, event: NotifyEvent) {
            self.events.lock().push(event);
        }
    }

    const EVENT_URL: &str = "http://127.0.0.1:9005/upnp/event/basicevent1";

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(10_000)
    }

    fn sub(id: &str, subscriber: Arc<dyn Subscriber>, timeout: u32) -> Subscription {
        Subscription::new(id, EVENT_URL, "http://127.0.0.1:9004", timeout, false, subscriber, t0())
    }

    #[test]
    fn test_put_and_get() {
        let registry = SubscriptionRegistry::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());

        registry.put(sub("1", subscriber.clone(), 50)).unwrap();

        let stored = registry.get("1").unwrap();
        assert_eq!(stored.id, "1");
        assert_eq!(stored.expires_at, t0() + Duration::from_secs(50));
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.get("2"), Err(SubscriptionError::NotFound(id)) if id == "2"));
    }

    #[test]
    fn test_put_replaces_for_same_owner_only() {
        let registry = SubscriptionRegistry::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());
        let stranger: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());

        registry.put(sub("1", subscriber.clone(), 50)).unwrap();
        registry.put(sub("1", subscriber.clone(), 300)).unwrap();
        assert_eq!(registry.get("1").unwrap().timeout_seconds, 300);

        let result = registry.put(sub("1", stranger, 50));
        assert_eq!(result, Err(SubscriptionError::DuplicateId("1".to_string())));
        assert_eq!(registry.get("1").unwrap().timeout_seconds, 300);
    }

    #[test]
    fn test_rekey() {
        let registry = SubscriptionRegistry::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());
        registry.put(sub("1", subscriber.clone(), 50)).unwrap();
        registry.put(sub("3", subscriber.clone(), 50)).unwrap();

        registry.rekey("1", "2").unwrap();
        assert!(registry.get("1").is_err());
        assert_eq!(registry.get("2").unwrap().id, "2");

        // Same ID is a no-op
        registry.rekey("2", "2").unwrap();

        assert_eq!(
            registry.rekey("missing", "4"),
            Err(SubscriptionError::NotFound("missing".to_string()))
        );
        assert_eq!(
            registry.rekey("2", "3"),
            Err(SubscriptionError::DuplicateId("3".to_string()))
        );
        assert!(registry.contains("2"));
    }

    #[test]
    fn test_apply_renewal_updates_id_and_expiry() {
        let registry = SubscriptionRegistry::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());
        registry.put(sub("1", subscriber, 50)).unwrap();

        let renewed_at = t0() + Duration::from_secs(45);
        let renewed = registry.apply_renewal("1", "7", 120, renewed_at).unwrap();

        assert_eq!(renewed.id, "7");
        assert_eq!(renewed.timeout_seconds, 120);
        assert_eq!(renewed.expires_at, renewed_at + Duration::from_secs(120));
        assert!(registry.get("1").is_err());
        assert_eq!(registry.get("7").unwrap().expires_at, renewed.expires_at);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        registry
            .put(sub("1", Arc::new(RecordingSubscriber::default()), 50))
            .unwrap();

        assert!(registry.remove("1"));
        assert!(!registry.remove("1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_active_filters_and_restarts() {
        let registry = SubscriptionRegistry::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());
        registry.put(sub("short", subscriber.clone(), 10)).unwrap();
        registry.put(sub("long", subscriber.clone(), 100)).unwrap();

        let now = t0() + Duration::from_secs(20);
        let mut active = registry.list_active(now);
        let replay = active.clone();
        assert_eq!(active.len(), 1);

        let ids: Vec<String> = active.by_ref().map(|s| s.id).collect();
        assert_eq!(ids, vec!["long".to_string()]);
        assert_eq!(active.next().map(|s| s.id), None);

        active.restart();
        assert_eq!(active.next().map(|s| s.id), Some("long".to_string()));
        assert_eq!(replay.count(), 1);

        // The snapshot does not see later changes
        registry.clear();
        active.restart();
        assert_eq!(active.count(), 1);
    }

    #[test]
    fn test_dispatch() {
        let registry = SubscriptionRegistry::new();
        let recorder = Arc::new(RecordingSubscriber::default());
        registry.put(sub("1", recorder.clone(), 50)).unwrap();

        registry
            .dispatch("1", t0(), "this is a test".to_string())
            .unwrap();
        assert_eq!(
            recorder.events.lock().as_slice(),
            &[NotifyEvent {
                subscription_id: "1".to_string(),
                body: "this is a test".to_string(),
            }]
        );

        assert_eq!(
            registry.dispatch("2", t0(), "x".to_string()),
            Err(DeliveryError::UnknownSubscription("2".to_string()))
        );
        assert_eq!(
            registry.dispatch("1", t0() + Duration::from_secs(50), "x".to_string()),
            Err(DeliveryError::Expired("1".to_string()))
        );

        registry.remove("1");
        assert!(registry.dispatch("1", t0(), "x".to_string()).is_err());
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn test_purge_expired_skips_auto_renew() {
        let registry = SubscriptionRegistry::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());
        registry.put(sub("manual", subscriber.clone(), 10)).unwrap();
        let mut renewing = sub("renewing", subscriber.clone(), 10);
        renewing.auto_renew = true;
        registry.put(renewing).unwrap();
        registry.put(sub("fresh", subscriber, 100)).unwrap();

        let purged = registry.purge_expired(t0() + Duration::from_secs(30));
        let ids: Vec<&str> = purged.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["manual"]);
        assert!(registry.contains("renewing"));
        assert!(registry.contains("fresh"));
    }

    #[test]
    fn test_cleared_auto_renew_makes_entry_purgeable() {
        let registry = SubscriptionRegistry::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(RecordingSubscriber::default());
        let mut renewing = sub("renewing", subscriber, 10);
        renewing.auto_renew = true;
        registry.put(renewing).unwrap();

        let later = t0() + Duration::from_secs(30);
        assert!(registry.purge_expired(later).is_empty());

        let updated = registry.set_auto_renew("renewing", false).unwrap();
        assert!(!updated.auto_renew);
        assert_eq!(registry.purge_expired(later).len(), 1);
        assert!(registry.is_empty());

        assert!(matches!(
            registry.set_auto_renew("renewing", true),
            Err(SubscriptionError::NotFound(_))
        ));
    }
}
