//! Schedule orchestration over the primary API, the scraper fallback,
//! and the quota-gated secondary source.
//!
//! Every query is cached in the KV store under its own key and TTL.
//! Cached reads deserialize a fresh copy per call, so callers can never
//! alias the cache's internal state. Cache failures are transient: the
//! service logs them and proceeds as if the entry were unset.

use std::{collections::HashMap, sync::Arc, time::Duration};

use itertools::Itertools;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{instrument, warn};

use utility::{
    members::MemberDirectory,
    streams::{Channel, Stream},
};

use crate::{
    errors::Error,
    kv::KvStore,
    schedule_api::RotatingClient,
    schedule_scraper::ScheduleScraper,
    types::{RawChannel, RawVideo},
    youtube_api::{ChannelStats, YoutubeClient},
};

pub const LIVE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const UPCOMING_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const CHANNEL_SCHEDULE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const CHANNEL_INFO_CACHE_TTL: Duration = Duration::from_secs(20 * 60);
pub const SEARCH_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
pub const SCRAPER_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Ceiling accepted by the upstream's `max_upcoming_hours`.
pub const MAX_UPCOMING_HOURS: u32 = 168;

pub struct ScheduleService {
    client: Arc<RotatingClient>,
    scraper: Arc<ScheduleScraper>,
    youtube: Option<Arc<YoutubeClient>>,
    kv: KvStore,
    directory: Arc<MemberDirectory>,
    org: String,
    exclude: Vec<String>,
}

impl ScheduleService {
    #[must_use]
    pub fn new(
        client: Arc<RotatingClient>,
        scraper: Arc<ScheduleScraper>,
        youtube: Option<Arc<YoutubeClient>>,
        kv: KvStore,
        directory: Arc<MemberDirectory>,
        org: String,
        exclude: Vec<String>,
    ) -> Self {
        Self {
            client,
            scraper,
            youtube,
            kv,
            directory,
            org,
            exclude: exclude.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    /// All currently live streams of the tracked organization.
    #[instrument(skip(self))]
    pub async fn live(&self) -> Result<Vec<Stream>, Error> {
        let key = "cache:live";

        if let Some(cached) = self.cache_get::<Vec<Stream>>(key).await {
            return Ok(cached);
        }

        let raw: Vec<RawVideo> = self
            .client
            .get_json(
                "/live",
                &[
                    ("org", self.org.clone()),
                    ("status", "live".to_owned()),
                    ("type", "stream".to_owned()),
                ],
            )
            .await?;

        let streams = self.map_and_filter(raw);
        self.cache_set(key, &streams, LIVE_CACHE_TTL).await;

        Ok(streams)
    }

    /// Streams scheduled within the next `hours` hours, ascending.
    #[instrument(skip(self))]
    pub async fn upcoming(&self, hours: u32) -> Result<Vec<Stream>, Error> {
        let hours = hours.min(MAX_UPCOMING_HOURS);
        let key = format!("cache:upcoming:{hours}");

        if let Some(cached) = self.cache_get::<Vec<Stream>>(&key).await {
            return Ok(cached);
        }

        let raw: Vec<RawVideo> = self
            .client
            .get_json(
                "/live",
                &[
                    ("org", self.org.clone()),
                    ("status", "upcoming".to_owned()),
                    ("type", "stream".to_owned()),
                    ("max_upcoming_hours", hours.to_string()),
                    ("order", "asc".to_owned()),
                    ("orderby", "start_scheduled".to_owned()),
                ],
            )
            .await?;

        let mut streams = self.map_and_filter(raw);
        streams.sort_by_key(Stream::schedule_sort_key);
        self.cache_set(&key, &streams, UPCOMING_CACHE_TTL).await;

        Ok(streams)
    }

    /// One channel's schedule, substituting the scraper and then the
    /// secondary source when the primary path is down.
    #[instrument(skip(self))]
    pub async fn channel_schedule(
        &self,
        channel_id: &str,
        hours: u32,
        include_live: bool,
    ) -> Result<Vec<Stream>, Error> {
        let hours = hours.min(MAX_UPCOMING_HOURS);
        let key = format!("cache:channel_schedule:{channel_id}:{hours}:{include_live}");

        if let Some(cached) = self.cache_get::<Vec<Stream>>(&key).await {
            return Ok(cached);
        }

        match self.channel_schedule_api(channel_id, hours, include_live).await {
            Ok(streams) => {
                self.cache_set(&key, &streams, CHANNEL_SCHEDULE_CACHE_TTL).await;
                Ok(streams)
            }
            Err(e) if e.warrants_fallback() => {
                warn!(%channel_id, error = %e, "Primary schedule failed, substituting scraper.");
                self.channel_schedule_fallback(channel_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn channel_schedule_api(
        &self,
        channel_id: &str,
        hours: u32,
        include_live: bool,
    ) -> Result<Vec<Stream>, Error> {
        let statuses: &[&str] = if include_live {
            &["live", "upcoming"]
        } else {
            &["upcoming"]
        };

        let mut streams = Vec::new();

        for status in statuses {
            let raw: Vec<RawVideo> = self
                .client
                .get_json(
                    "/live",
                    &[
                        ("channel_id", channel_id.to_owned()),
                        ("status", (*status).to_owned()),
                        ("type", "stream".to_owned()),
                        ("max_upcoming_hours", hours.to_string()),
                        ("order", "asc".to_owned()),
                        ("orderby", "start_scheduled".to_owned()),
                    ],
                )
                .await?;

            streams.extend(raw.into_iter().filter_map(RawVideo::into_stream));
        }

        streams.sort_by_key(Stream::schedule_sort_key);
        Ok(streams)
    }

    async fn channel_schedule_fallback(&self, channel_id: &str) -> Result<Vec<Stream>, Error> {
        let key = format!("cache:scraper:{channel_id}");

        if let Some(cached) = self.cache_get::<Vec<Stream>>(&key).await {
            return Ok(cached);
        }

        match self.scraper.fetch(&self.directory).await {
            Ok(all) => {
                let mut for_channel = Vec::new();

                // Cache a slice per channel found on the page, so a tick
                // fanning out over many channels scrapes at most once.
                let by_channel = all
                    .into_iter()
                    .filter(|s| !s.channel_id.is_empty())
                    .into_group_map_by(|s| s.channel_id.clone());

                for (id, mut slice) in by_channel {
                    slice.sort_by_key(Stream::schedule_sort_key);

                    self.cache_set(
                        &format!("cache:scraper:{id}"),
                        &slice,
                        SCRAPER_CACHE_TTL,
                    )
                    .await;

                    if id == channel_id {
                        for_channel = slice;
                    }
                }

                Ok(for_channel)
            }
            Err(scrape_error) => {
                warn!(error = %scrape_error, "Scraper substitution failed.");
                self.channel_schedule_secondary(channel_id, scrape_error).await
            }
        }
    }

    async fn channel_schedule_secondary(
        &self,
        channel_id: &str,
        scrape_error: Error,
    ) -> Result<Vec<Stream>, Error> {
        let Some(youtube) = &self.youtube else {
            return Err(scrape_error);
        };

        match youtube.upcoming_for_channel(channel_id).await {
            Ok(streams) => Ok(streams),
            Err(e) => {
                warn!(error = %e, "Secondary source substitution failed.");
                Err(scrape_error)
            }
        }
    }

    /// Channels of the tracked organization matching `query` by name.
    #[instrument(skip(self))]
    pub async fn search_channels(&self, query: &str) -> Result<Vec<Channel>, Error> {
        let normalized = MemberDirectory::normalize(query);

        if normalized.is_empty() {
            return Err(Error::Validation {
                field: "query",
                value: query.to_owned(),
            });
        }

        let key = format!("cache:search:{normalized}");

        if let Some(cached) = self.cache_get::<Vec<Channel>>(&key).await {
            return Ok(cached);
        }

        let raw: Vec<RawChannel> = self
            .client
            .get_json(
                "/channels",
                &[
                    ("org", self.org.clone()),
                    ("name", normalized.clone()),
                    ("limit", "50".to_owned()),
                ],
            )
            .await?;

        let channels: Vec<Channel> = raw
            .into_iter()
            .filter_map(RawChannel::into_channel)
            .filter(|c| passes_filters(&self.org, &self.exclude, c))
            .collect();

        self.cache_set(&key, &channels, SEARCH_CACHE_TTL).await;

        Ok(channels)
    }

    /// Channel info by id. A 404 yields absent, not an error.
    #[instrument(skip(self))]
    pub async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, Error> {
        let key = format!("cache:channel_info:{channel_id}");

        if let Some(cached) = self.cache_get::<Channel>(&key).await {
            return Ok(Some(cached));
        }

        let raw: Result<RawChannel, Error> = self
            .client
            .get_json(&format!("/channels/{channel_id}"), &[])
            .await;

        match raw {
            Ok(raw) => {
                let channel = raw.into_channel();

                if let Some(channel) = &channel {
                    self.cache_set(&key, channel, CHANNEL_INFO_CACHE_TTL).await;
                }

                Ok(channel)
            }
            Err(Error::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Channel statistics through the secondary source; empty when it is
    /// disabled or refuses.
    pub async fn channel_stats(
        &self,
        channel_ids: &[String],
    ) -> Result<HashMap<String, ChannelStats>, Error> {
        match &self.youtube {
            Some(youtube) => youtube.channel_stats(channel_ids).await,
            None => Ok(HashMap::new()),
        }
    }

    fn map_and_filter(&self, raw: Vec<RawVideo>) -> Vec<Stream> {
        raw.into_iter()
            .filter_map(RawVideo::into_stream)
            .filter(|stream| {
                stream
                    .channel
                    .as_ref()
                    .is_some_and(|c| passes_filters(&self.org, &self.exclude, c))
            })
            .collect()
    }

    async fn cache_get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        match self.kv.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, error = %e, "Cache read failed, continuing without.");
                None
            }
        }
    }

    async fn cache_set<T>(&self, key: &str, value: &T, ttl: Duration)
    where
        T: Serialize + Sync,
    {
        if let Err(e) = self.kv.set(key, value, Some(ttl)).await {
            warn!(%key, error = %e, "Cache write failed, continuing.");
        }
    }
}

/// Organization and exclusion filter. Channels outside the configured
/// org, without an org at all, or whose suborg/name match an excluded
/// substring, are dropped.
#[must_use]
pub fn passes_filters(org: &str, exclude: &[String], channel: &Channel) -> bool {
    let Some(channel_org) = &channel.org else {
        return false;
    };

    if !channel_org.eq_ignore_ascii_case(org) {
        return false;
    }

    let haystacks = [
        channel.suborg.as_deref().unwrap_or_default().to_lowercase(),
        channel.name.to_lowercase(),
        channel
            .english_name
            .as_deref()
            .unwrap_or_default()
            .to_lowercase(),
    ];

    !exclude
        .iter()
        .any(|needle| haystacks.iter().any(|hay| hay.contains(needle)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(org: Option<&str>, suborg: Option<&str>, name: &str) -> Channel {
        Channel {
            id: "UC1".into(),
            name: name.into(),
            org: org.map(str::to_owned),
            suborg: suborg.map(str::to_owned),
            ..Channel::default()
        }
    }

    #[test]
    fn org_mismatch_and_missing_org_are_dropped() {
        let exclude = vec!["holostars".to_owned()];

        assert!(passes_filters(
            "Hololive",
            &exclude,
            &channel(Some("Hololive"), None, "Pekora")
        ));
        assert!(!passes_filters(
            "Hololive",
            &exclude,
            &channel(Some("Nijisanji"), None, "someone")
        ));
        assert!(!passes_filters(
            "Hololive",
            &exclude,
            &channel(None, None, "orgless")
        ));
    }

    #[test]
    fn excluded_substrings_match_suborg_and_names() {
        let exclude = vec!["holostars".to_owned(), "uproar".to_owned()];

        assert!(!passes_filters(
            "Hololive",
            &exclude,
            &channel(Some("Hololive"), Some("HOLOSTARS English"), "someone")
        ));
        assert!(!passes_filters(
            "Hololive",
            &exclude,
            &channel(Some("Hololive"), None, "Uproar!! Member")
        ));
        assert!(passes_filters(
            "Hololive",
            &exclude,
            &channel(Some("Hololive"), Some("hololive English"), "someone")
        ));
    }

    #[test]
    fn org_comparison_is_case_insensitive() {
        assert!(passes_filters(
            "Hololive",
            &[],
            &channel(Some("hololive"), None, "Pekora")
        ));
    }
}
