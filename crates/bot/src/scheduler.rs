//! Periodic notification scheduler.
//!
//! Each tick reads the channel registry, fans out bounded schedule
//! probes, opportunistically refreshes the per-channel next-stream
//! summaries, and selects the streams whose lead-time matches the
//! configured fallback chain. Dedup markers are keyed by stream id and
//! carry the schedule version: a reschedule invalidates suppression.
//!
//! The marker is written by the delivery driver only after the
//! transport confirms the send, giving at-most-once per
//! (stream, schedule-version) per room even across restarts between
//! building and sending a notification.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use apis::{errors::Error, kv::KvStore, schedule_service::ScheduleService};
use utility::streams::{Channel, NextStream, Notification, Stream, StreamStatus};

use crate::subscriptions::{
    split_subscriber_entry, subscribers_key, user_key, CHANNEL_REGISTRY_KEY,
};

/// How long a dedup marker suppresses re-notification.
pub const DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Lifetime of a next-stream summary.
pub const NEXT_STREAM_TTL: Duration = Duration::from_secs(60 * 60);
/// How far ahead each channel probe looks.
const PROBE_HOURS: u32 = 24;

#[must_use]
pub fn dedup_key(stream_id: &str) -> String {
    format!("notified:{stream_id}")
}

#[must_use]
pub fn next_stream_key(channel_id: &str) -> String {
    format!("alarm:next_stream:{channel_id}")
}

/// Suppression record for one (stream, schedule-version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupMarker {
    pub start_scheduled: DateTime<Utc>,
    pub notified_at: DateTime<Utc>,
    pub minutes_until: i64,
}

/// The slice of the schedule service the scheduler depends on.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn channel_schedule(
        &self,
        channel_id: &str,
        hours: u32,
        include_live: bool,
    ) -> Result<Vec<Stream>, Error>;

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, Error>;
}

#[async_trait]
impl ScheduleSource for ScheduleService {
    async fn channel_schedule(
        &self,
        channel_id: &str,
        hours: u32,
        include_live: bool,
    ) -> Result<Vec<Stream>, Error> {
        Self::channel_schedule(self, channel_id, hours, include_live).await
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, Error> {
        Self::get_channel(self, channel_id).await
    }
}

pub struct NotificationScheduler {
    kv: KvStore,
    source: Arc<dyn ScheduleSource>,
    target_minutes: Vec<i64>,
    check_interval: Duration,
    concurrency: usize,
}

impl NotificationScheduler {
    #[must_use]
    pub fn new(
        kv: KvStore,
        source: Arc<dyn ScheduleSource>,
        target_minutes: Vec<i64>,
        check_interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            kv,
            source,
            target_minutes,
            check_interval,
            concurrency: concurrency.max(1),
        }
    }

    /// Tick loop. Built notifications are posted to `notify_tx`; the
    /// receiving driver delivers them and calls [`Self::mark_notified`]
    /// on success.
    pub async fn run(
        self: Arc<Self>,
        notify_tx: mpsc::Sender<Notification>,
        mut exit_receiver: watch::Receiver<bool>,
    ) {
        info!(targets = ?self.target_minutes, "Notification scheduler running.");

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.check_interval) => {}
                res = exit_receiver.changed() => {
                    if res.is_err() || *exit_receiver.borrow() {
                        info!(task = "Notification scheduler", "Shutting down.");
                        return;
                    }

                    continue;
                }
            }

            match self.tick().await {
                Ok(notifications) => {
                    for notification in notifications {
                        if notify_tx.send(notification).await.is_err() {
                            info!("Notification channel closed, stopping scheduler.");
                            return;
                        }
                    }
                }
                Err(e) => error!(error = %e, "Scheduler tick failed."),
            }
        }
    }

    /// One scheduler pass. Transient per-channel failures are absorbed;
    /// the pass continues with the channels that succeeded.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<Vec<Notification>, Error> {
        let channels = self.kv.smembers(CHANNEL_REGISTRY_KEY).await?;

        if channels.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();

        let probes: Vec<(String, Vec<String>, Vec<Stream>)> = stream::iter(channels)
            .map(|channel_id| async move {
                self.probe_channel(channel_id).await
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|result| async move { result })
            .collect()
            .await;

        let mut notifications = Vec::new();

        for (channel_id, subscribers, streams) in probes {
            self.refresh_next_stream(&channel_id, &streams, now).await;

            for stream in &streams {
                let Some(minutes) = firing_minutes(stream, now, &self.target_minutes) else {
                    continue;
                };

                if self.is_suppressed(stream).await {
                    debug!(stream = %stream.id, "Already notified for this schedule version.");
                    continue;
                }

                let confirmed = self.confirm_subscribers(&channel_id, &subscribers).await;

                if confirmed.is_empty() {
                    continue;
                }

                let channel = match self.source.get_channel(&channel_id).await {
                    Ok(Some(channel)) => channel,
                    Ok(None) => {
                        warn!(%channel_id, "Subscribed channel no longer exists upstream.");
                        continue;
                    }
                    Err(e) => {
                        warn!(%channel_id, error = %e, "Channel info fetch failed.");
                        continue;
                    }
                };

                for (room_id, users) in group_by_room(confirmed) {
                    notifications.push(Notification {
                        room_id,
                        channel: channel.clone(),
                        stream: stream.clone(),
                        minutes_until: minutes,
                        users,
                    });
                }
            }
        }

        Ok(notifications)
    }

    /// Reads one channel's subscribers and schedule. Empty subscriber
    /// sets are garbage-collected out of the registry instead of
    /// probed; probe failures are logged and absorbed.
    async fn probe_channel(
        &self,
        channel_id: String,
    ) -> Option<(String, Vec<String>, Vec<Stream>)> {
        let subscribers = match self.kv.smembers(&subscribers_key(&channel_id)).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                warn!(%channel_id, error = %e, "Subscriber read failed, skipping channel.");
                return None;
            }
        };

        if subscribers.is_empty() {
            debug!(%channel_id, "No subscribers left, removing from registry.");

            if let Err(e) = self.kv.srem(CHANNEL_REGISTRY_KEY, &channel_id).await {
                warn!(error = %e, "Registry GC failed.");
            }
            if let Err(e) = self.kv.del(&subscribers_key(&channel_id)).await {
                warn!(error = %e, "Subscriber-set GC failed.");
            }

            return None;
        }

        match self
            .source
            .channel_schedule(&channel_id, PROBE_HOURS, true)
            .await
        {
            Ok(streams) => Some((channel_id, subscribers, dedup_streams(streams))),
            Err(e) => {
                warn!(%channel_id, error = %e, "Channel probe failed, continuing with others.");
                None
            }
        }
    }

    /// Verifies each reverse-index entry against the user's own set and
    /// evicts the stale ones.
    async fn confirm_subscribers(
        &self,
        channel_id: &str,
        subscribers: &[String],
    ) -> Vec<(String, String)> {
        let mut confirmed = Vec::new();
        let mut stale = Vec::new();

        for entry in subscribers {
            let Some((room_id, user_id)) = split_subscriber_entry(entry) else {
                stale.push(entry.clone());
                continue;
            };

            match self
                .kv
                .sismember(&user_key(room_id, user_id), channel_id)
                .await
            {
                Ok(true) => confirmed.push((room_id.to_owned(), user_id.to_owned())),
                Ok(false) => stale.push(entry.clone()),
                Err(e) => {
                    // Neither confirmed nor evicted; better to miss one
                    // notification than to drop the subscription.
                    warn!(error = %e, "Subscriber verification failed.");
                }
            }
        }

        if !stale.is_empty() {
            info!(%channel_id, count = stale.len(), "Evicting stale subscriber entries.");

            for entry in stale {
                if let Err(e) = self.kv.srem(&subscribers_key(channel_id), &entry).await {
                    warn!(error = %e, "Stale-entry eviction failed.");
                }
            }
        }

        confirmed
    }

    /// Whether a dedup marker with the stream's current schedule version
    /// exists. A marker for a different `start_scheduled` does not
    /// suppress.
    pub async fn is_suppressed(&self, stream: &Stream) -> bool {
        let marker = match self.kv.get::<DedupMarker>(&dedup_key(&stream.id)).await {
            Ok(marker) => marker,
            Err(e) => {
                warn!(stream = %stream.id, error = %e, "Dedup read failed, treating as unset.");
                None
            }
        };

        match (marker, stream.start_scheduled()) {
            (Some(marker), Some(scheduled)) => marker.start_scheduled == scheduled,
            _ => false,
        }
    }

    /// Records a successful delivery. Called by the delivery driver,
    /// never by the tick itself.
    pub async fn mark_notified(&self, stream: &Stream, minutes_until: i64) {
        let Some(start_scheduled) = stream.start_scheduled() else {
            return;
        };

        let marker = DedupMarker {
            start_scheduled,
            notified_at: Utc::now(),
            minutes_until,
        };

        if let Err(e) = self
            .kv
            .set(&dedup_key(&stream.id), &marker, Some(DEDUP_TTL))
            .await
        {
            warn!(stream = %stream.id, error = %e, "Dedup marker write failed.");
        }
    }

    /// Refreshes `alarm:next_stream:{channel}`. When the incoming data
    /// still contains the cached upcoming stream but without its start
    /// time, the existing summary is retained with a fresh TTL; upstream
    /// drops the field transiently often enough that overwriting would
    /// flap the summary.
    async fn refresh_next_stream(&self, channel_id: &str, streams: &[Stream], now: DateTime<Utc>) {
        let key = next_stream_key(channel_id);
        let fresh = next_stream_summary(streams, now);

        if matches!(fresh, NextStream::TimeUnknown) {
            let existing = self.kv.get::<NextStream>(&key).await.ok().flatten();

            if let Some(existing @ NextStream::Upcoming { .. }) = existing {
                let cached_id = match &existing {
                    NextStream::Upcoming { video_id, .. } => video_id.clone(),
                    _ => String::new(),
                };

                let still_pending = streams.iter().any(|s| {
                    s.id == cached_id
                        && s.status() == StreamStatus::Upcoming
                        && s.start_scheduled().is_none()
                });

                if still_pending {
                    if let Err(e) = self.kv.set(&key, &existing, Some(NEXT_STREAM_TTL)).await {
                        warn!(%channel_id, error = %e, "Next-stream refresh failed.");
                    }

                    return;
                }
            }
        }

        if let Err(e) = self.kv.set(&key, &fresh, Some(NEXT_STREAM_TTL)).await {
            warn!(%channel_id, error = %e, "Next-stream write failed.");
        }
    }
}

/// The lead-time in whole minutes at which this stream fires, when it
/// matches the fallback chain. Streams already started, without a
/// schedule, or off the chain yield `None`.
#[must_use]
pub fn firing_minutes(stream: &Stream, now: DateTime<Utc>, targets: &[i64]) -> Option<i64> {
    if stream.status() != StreamStatus::Upcoming {
        return None;
    }

    let seconds_until = stream.seconds_until_start(now)?;

    if seconds_until <= 0 {
        return None;
    }

    let minutes = seconds_until / 60;
    targets.contains(&minutes).then_some(minutes)
}

/// The single most relevant stream as a summary: live wins, then the
/// soonest upcoming with a known start, then time-unknown or no-upcoming.
#[must_use]
pub fn next_stream_summary(streams: &[Stream], now: DateTime<Utc>) -> NextStream {
    if let Some(live) = streams.iter().find(|s| s.status() == StreamStatus::Live) {
        return NextStream::Live {
            title: live.title.clone(),
            video_id: live.id.clone(),
        };
    }

    let upcoming: Vec<&Stream> = streams
        .iter()
        .filter(|s| s.status() == StreamStatus::Upcoming)
        .collect();

    if upcoming.is_empty() {
        return NextStream::NoUpcoming;
    }

    let soonest = upcoming
        .iter()
        .filter_map(|s| s.start_scheduled().map(|at| (at, *s)))
        .filter(|(at, _)| *at > now - utility::streams::upcoming_grace())
        .min_by_key(|(at, _)| *at);

    match soonest {
        Some((at, stream)) => NextStream::Upcoming {
            title: stream.title.clone(),
            video_id: stream.id.clone(),
            start_scheduled: at,
        },
        None => NextStream::TimeUnknown,
    }
}

fn group_by_room(confirmed: Vec<(String, String)>) -> BTreeMap<String, Vec<String>> {
    let mut by_room: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (room_id, user_id) in confirmed {
        by_room.entry(room_id).or_default().push(user_id);
    }

    for users in by_room.values_mut() {
        users.sort();
        users.dedup();
    }

    by_room
}

/// Streams seen per tick are unique by id; duplicated ids from the
/// live+upcoming double-fetch are collapsed keeping the first.
#[must_use]
pub fn dedup_streams(streams: Vec<Stream>) -> Vec<Stream> {
    let mut seen = HashSet::new();

    streams
        .into_iter()
        .filter(|s| seen.insert(s.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use utility::streams::StreamTiming;

    use crate::subscriptions::SubscriptionRegistry;

    enum StubOutcome {
        Streams(Vec<Stream>),
        CircuitOpen,
    }

    struct StubSource {
        schedules: std::collections::HashMap<String, StubOutcome>,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                schedules: std::collections::HashMap::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with(mut self, channel_id: &str, outcome: StubOutcome) -> Self {
            self.schedules.insert(channel_id.to_owned(), outcome);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScheduleSource for StubSource {
        async fn channel_schedule(
            &self,
            channel_id: &str,
            _hours: u32,
            _include_live: bool,
        ) -> Result<Vec<Stream>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            match self.schedules.get(channel_id) {
                Some(StubOutcome::Streams(streams)) => Ok(streams.clone()),
                Some(StubOutcome::CircuitOpen) => Err(Error::CircuitOpen {
                    next_retry: Utc::now(),
                }),
                None => Ok(Vec::new()),
            }
        }

        async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, Error> {
            Ok(Some(Channel::skeletal(channel_id, channel_id)))
        }
    }

    fn upcoming(id: &str, channel_id: &str, start: Option<DateTime<Utc>>) -> Stream {
        Stream {
            id: id.into(),
            title: format!("{id} title"),
            channel_id: channel_id.into(),
            channel_name: channel_id.into(),
            timing: StreamTiming::Upcoming {
                scheduled_for: start,
            },
            duration: None,
            link: None,
            thumbnail: None,
            channel: None,
        }
    }

    fn live(id: &str, channel_id: &str, started: DateTime<Utc>) -> Stream {
        Stream {
            timing: StreamTiming::Live {
                started_at: started,
                scheduled_for: Some(started),
            },
            ..upcoming(id, channel_id, None)
        }
    }

    fn scheduler(kv: &KvStore, source: Arc<dyn ScheduleSource>) -> NotificationScheduler {
        NotificationScheduler::new(
            kv.clone(),
            source,
            vec![5, 3, 1],
            Duration::from_secs(60),
            15,
        )
    }

    #[tokio::test]
    async fn empty_registry_returns_without_probing() {
        let kv = KvStore::in_memory();
        let source = Arc::new(StubSource::new());
        let scheduler = scheduler(&kv, Arc::clone(&source) as Arc<dyn ScheduleSource>);

        let notifications = scheduler.tick().await.unwrap();

        assert!(notifications.is_empty());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn subscribed_stream_fires_once_per_schedule_version() {
        let kv = KvStore::in_memory();
        let registry = SubscriptionRegistry::new(kv.clone());
        registry.add("r1", "u1", "UC_pekora", "Pekora").await.unwrap();

        // 5½ minutes out: lead-time floors to 5, the primary chance.
        let start = Utc::now() + chrono::Duration::seconds(330);
        let source = Arc::new(StubSource::new().with(
            "UC_pekora",
            StubOutcome::Streams(vec![upcoming("v1", "UC_pekora", Some(start))]),
        ));
        let scheduler = scheduler(&kv, Arc::clone(&source) as Arc<dyn ScheduleSource>);

        let notifications = scheduler.tick().await.unwrap();
        assert_eq!(notifications.len(), 1);

        let notification = &notifications[0];
        assert_eq!(notification.room_id, "r1");
        assert_eq!(notification.users, vec!["u1"]);
        assert_eq!(notification.minutes_until, 5);

        // The tick itself must not write the marker.
        assert!(!scheduler.is_suppressed(&notification.stream).await);

        // Delivery succeeded: the driver records the marker.
        scheduler
            .mark_notified(&notification.stream, notification.minutes_until)
            .await;

        let again = scheduler.tick().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn reschedule_invalidates_the_dedup_marker() {
        let kv = KvStore::in_memory();
        let registry = SubscriptionRegistry::new(kv.clone());
        registry.add("r1", "u1", "UC_pekora", "Pekora").await.unwrap();

        let original = Utc::now() + chrono::Duration::seconds(330);
        let scheduler_stub = Arc::new(StubSource::new().with(
            "UC_pekora",
            StubOutcome::Streams(vec![upcoming("v1", "UC_pekora", Some(original))]),
        ));
        let sched = scheduler(&kv, Arc::clone(&scheduler_stub) as Arc<dyn ScheduleSource>);

        let first = sched.tick().await.unwrap();
        assert_eq!(first.len(), 1);
        sched.mark_notified(&first[0].stream, first[0].minutes_until).await;

        // Upstream slips the start time; same stream id.
        let revised = Utc::now() + chrono::Duration::seconds(200);
        let source = Arc::new(StubSource::new().with(
            "UC_pekora",
            StubOutcome::Streams(vec![upcoming("v1", "UC_pekora", Some(revised))]),
        ));
        let sched = scheduler(&kv, Arc::clone(&source) as Arc<dyn ScheduleSource>);

        let second = sched.tick().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].minutes_until, 3);
    }

    #[tokio::test]
    async fn stale_reverse_index_entries_are_evicted() {
        let kv = KvStore::in_memory();
        let registry = SubscriptionRegistry::new(kv.clone());
        registry.add("r1", "u1", "UC_pekora", "Pekora").await.unwrap();

        // A leftover entry whose primary-index subscription is gone.
        kv.sadd(&subscribers_key("UC_pekora"), "r1:ghost")
            .await
            .unwrap();

        let start = Utc::now() + chrono::Duration::seconds(330);
        let source = Arc::new(StubSource::new().with(
            "UC_pekora",
            StubOutcome::Streams(vec![upcoming("v1", "UC_pekora", Some(start))]),
        ));
        let scheduler = scheduler(&kv, source);

        let notifications = scheduler.tick().await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].users, vec!["u1"]);

        assert!(!kv
            .sismember(&subscribers_key("UC_pekora"), "r1:ghost")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn probe_failures_do_not_lose_other_channels() {
        let kv = KvStore::in_memory();
        let registry = SubscriptionRegistry::new(kv.clone());
        registry.add("r1", "u1", "UC_pekora", "Pekora").await.unwrap();
        registry.add("r1", "u1", "UC_aqua", "Aqua").await.unwrap();

        let start = Utc::now() + chrono::Duration::seconds(330);
        let source = Arc::new(
            StubSource::new()
                .with("UC_pekora", StubOutcome::CircuitOpen)
                .with(
                    "UC_aqua",
                    StubOutcome::Streams(vec![upcoming("v2", "UC_aqua", Some(start))]),
                ),
        );
        let scheduler = scheduler(&kv, source);

        let notifications = scheduler.tick().await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].stream.id, "v2");
    }

    #[tokio::test]
    async fn channels_without_subscribers_are_garbage_collected() {
        let kv = KvStore::in_memory();
        kv.sadd(CHANNEL_REGISTRY_KEY, "UC_orphan").await.unwrap();

        let source = Arc::new(StubSource::new());
        let scheduler = scheduler(&kv, Arc::clone(&source) as Arc<dyn ScheduleSource>);

        let notifications = scheduler.tick().await.unwrap();

        assert!(notifications.is_empty());
        assert_eq!(source.calls(), 0);
        assert!(!kv.sismember(CHANNEL_REGISTRY_KEY, "UC_orphan").await.unwrap());
    }

    #[tokio::test]
    async fn empty_schedule_writes_a_no_upcoming_summary() {
        let kv = KvStore::in_memory();
        let registry = SubscriptionRegistry::new(kv.clone());
        registry.add("r1", "u1", "UC_pekora", "Pekora").await.unwrap();

        let source = Arc::new(
            StubSource::new().with("UC_pekora", StubOutcome::Streams(Vec::new())),
        );
        let scheduler = scheduler(&kv, source);

        scheduler.tick().await.unwrap();

        let summary: NextStream = kv
            .get(&next_stream_key("UC_pekora"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, NextStream::NoUpcoming);
    }

    #[tokio::test]
    async fn summary_preserved_when_schedule_field_drops_out() {
        let kv = KvStore::in_memory();
        let registry = SubscriptionRegistry::new(kv.clone());
        registry.add("r1", "u1", "UC_pekora", "Pekora").await.unwrap();

        let start = Utc::now() + chrono::Duration::hours(2);
        let cached = NextStream::Upcoming {
            title: "v1 title".into(),
            video_id: "v1".into(),
            start_scheduled: start,
        };
        kv.set(&next_stream_key("UC_pekora"), &cached, Some(NEXT_STREAM_TTL))
            .await
            .unwrap();

        // Same stream still present, start time transiently missing.
        let source = Arc::new(StubSource::new().with(
            "UC_pekora",
            StubOutcome::Streams(vec![upcoming("v1", "UC_pekora", None)]),
        ));
        scheduler(&kv, source).tick().await.unwrap();

        let summary: NextStream = kv
            .get(&next_stream_key("UC_pekora"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, cached);

        // A different schedule-less stream does not inherit the cache.
        let source = Arc::new(StubSource::new().with(
            "UC_pekora",
            StubOutcome::Streams(vec![upcoming("v9", "UC_pekora", None)]),
        ));
        scheduler(&kv, source).tick().await.unwrap();

        let summary: NextStream = kv
            .get(&next_stream_key("UC_pekora"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, NextStream::TimeUnknown);
    }

    #[test]
    fn firing_minutes_matches_the_fallback_chain_only() {
        let now = Utc::now();
        let targets = vec![5, 3, 1];

        let at = |secs: i64| upcoming("v", "UC", Some(now + chrono::Duration::seconds(secs)));

        assert_eq!(firing_minutes(&at(330), now, &targets), Some(5));
        assert_eq!(firing_minutes(&at(300), now, &targets), Some(5));
        assert_eq!(firing_minutes(&at(299), now, &targets), None);
        assert_eq!(firing_minutes(&at(190), now, &targets), Some(3));
        assert_eq!(firing_minutes(&at(61), now, &targets), Some(1));
        assert_eq!(firing_minutes(&at(0), now, &targets), None);
        assert_eq!(firing_minutes(&at(-60), now, &targets), None);

        // Streams without a schedule or already live never fire.
        assert_eq!(
            firing_minutes(&upcoming("v", "UC", None), now, &targets),
            None
        );
        assert_eq!(firing_minutes(&live("v", "UC", now), now, &targets), None);
    }

    #[test]
    fn summary_prefers_live_then_soonest_upcoming() {
        let now = Utc::now();
        let soon = now + chrono::Duration::hours(1);
        let later = now + chrono::Duration::hours(3);

        let summary = next_stream_summary(
            &[
                upcoming("u2", "UC", Some(later)),
                upcoming("u1", "UC", Some(soon)),
            ],
            now,
        );
        assert_eq!(
            summary,
            NextStream::Upcoming {
                title: "u1 title".into(),
                video_id: "u1".into(),
                start_scheduled: soon,
            }
        );

        let summary = next_stream_summary(
            &[
                upcoming("u1", "UC", Some(soon)),
                live("l1", "UC", now - chrono::Duration::minutes(10)),
            ],
            now,
        );
        assert!(matches!(summary, NextStream::Live { .. }));

        assert_eq!(next_stream_summary(&[], now), NextStream::NoUpcoming);
        assert_eq!(
            next_stream_summary(&[upcoming("u1", "UC", None)], now),
            NextStream::TimeUnknown
        );
    }

    #[test]
    fn duplicate_stream_ids_collapse() {
        let now = Utc::now();
        let streams = vec![
            upcoming("v1", "UC", Some(now)),
            upcoming("v1", "UC", Some(now)),
            upcoming("v2", "UC", Some(now)),
        ];

        assert_eq!(dedup_streams(streams).len(), 2);
    }
}
