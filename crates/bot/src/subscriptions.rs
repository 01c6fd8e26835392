//! Per-(room, user) stream-alarm subscriptions and their reverse
//! indexes in the KV store.
//!
//! The user's own set is the source of truth. The reverse indexes
//! (channel → subscribers, the global channel registry, and the global
//! user registry) are maintained best-effort: a failed secondary write
//! is logged and absorbed, and the scheduler's tick-time GC reconciles
//! any orphans left behind.

use tracing::warn;

use apis::{errors::Error, kv::KvStore};

pub const CHANNEL_REGISTRY_KEY: &str = "alarm:channel_registry";
pub const REGISTRY_KEY: &str = "alarm:registry";
pub const CHANNEL_NAMES_KEY: &str = "alarm:channel_names";

#[must_use]
pub fn user_key(room_id: &str, user_id: &str) -> String {
    format!("alarm:{room_id}:{user_id}")
}

#[must_use]
pub fn subscribers_key(channel_id: &str) -> String {
    format!("alarm:channel_subscribers:{channel_id}")
}

#[must_use]
pub fn subscriber_entry(room_id: &str, user_id: &str) -> String {
    format!("{room_id}:{user_id}")
}

/// Splits a `room:user` reverse-index entry.
#[must_use]
pub fn split_subscriber_entry(entry: &str) -> Option<(&str, &str)> {
    entry.split_once(':')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotSubscribed,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    kv: KvStore,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Subscribes a user to a channel. Idempotent: a second add reports
    /// [`AddOutcome::AlreadyPresent`].
    pub async fn add(
        &self,
        room_id: &str,
        user_id: &str,
        channel_id: &str,
        display_name: &str,
    ) -> Result<AddOutcome, Error> {
        let added = self.kv.sadd(&user_key(room_id, user_id), channel_id).await?;

        if !added {
            return Ok(AddOutcome::AlreadyPresent);
        }

        let entry = subscriber_entry(room_id, user_id);

        log_secondary(
            self.kv.sadd(&subscribers_key(channel_id), &entry).await,
            "channel subscribers",
        );
        log_secondary(
            self.kv.sadd(CHANNEL_REGISTRY_KEY, channel_id).await,
            "channel registry",
        );
        log_secondary(self.kv.sadd(REGISTRY_KEY, &entry).await, "user registry");
        log_secondary(
            self.kv
                .hset(CHANNEL_NAMES_KEY, channel_id, display_name)
                .await,
            "channel names",
        );

        Ok(AddOutcome::Added)
    }

    /// Unsubscribes a user from a channel and prunes the reverse
    /// indexes that became empty.
    pub async fn remove(
        &self,
        room_id: &str,
        user_id: &str,
        channel_id: &str,
    ) -> Result<RemoveOutcome, Error> {
        let removed = self.kv.srem(&user_key(room_id, user_id), channel_id).await?;

        let entry = subscriber_entry(room_id, user_id);

        log_secondary(
            self.kv.srem(&subscribers_key(channel_id), &entry).await,
            "channel subscribers",
        );

        match self.kv.smembers(&subscribers_key(channel_id)).await {
            Ok(subscribers) if subscribers.is_empty() => {
                log_secondary(
                    self.kv.srem(CHANNEL_REGISTRY_KEY, channel_id).await,
                    "channel registry",
                );
                log_secondary(self.kv.del(&subscribers_key(channel_id)).await, "subscriber set");
                log_secondary(
                    self.kv.hdel(CHANNEL_NAMES_KEY, channel_id).await,
                    "channel names",
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Skipping subscriber-set pruning."),
        }

        match self.kv.smembers(&user_key(room_id, user_id)).await {
            Ok(channels) if channels.is_empty() => {
                log_secondary(self.kv.srem(REGISTRY_KEY, &entry).await, "user registry");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Skipping user-registry pruning."),
        }

        if removed {
            Ok(RemoveOutcome::Removed)
        } else {
            Ok(RemoveOutcome::NotSubscribed)
        }
    }

    /// The user's subscriptions as (channel id, display name), sorted by
    /// display name.
    pub async fn list(&self, room_id: &str, user_id: &str) -> Result<Vec<(String, String)>, Error> {
        let channels = self.kv.smembers(&user_key(room_id, user_id)).await?;
        let mut subscriptions = Vec::with_capacity(channels.len());

        for channel_id in channels {
            let display_name = match self.kv.hget(CHANNEL_NAMES_KEY, &channel_id).await {
                Ok(Some(name)) => name,
                Ok(None) => channel_id.clone(),
                Err(e) => {
                    warn!(error = %e, "Channel-name lookup failed.");
                    channel_id.clone()
                }
            };

            subscriptions.push((channel_id, display_name));
        }

        subscriptions.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(subscriptions)
    }

    /// Removes every subscription of the user; returns how many were
    /// removed.
    pub async fn clear(&self, room_id: &str, user_id: &str) -> Result<usize, Error> {
        let channels = self.kv.smembers(&user_key(room_id, user_id)).await?;
        let mut removed = 0;

        for channel_id in &channels {
            if self.remove(room_id, user_id, channel_id).await? == RemoveOutcome::Removed {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn log_secondary<T>(result: Result<T, Error>, index: &'static str) {
    if let Err(e) = result {
        warn!(%index, error = %e, "Secondary index write failed, continuing.");
    }
}
