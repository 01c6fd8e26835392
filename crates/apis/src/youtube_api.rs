//! Quota-gated secondary schedule and statistics source.
//!
//! Every call is priced before it is issued; the in-process ledger
//! refuses outright when the day's budget (minus a safety margin) would
//! be exceeded. The ledger rolls over at midnight in the provider's
//! billing timezone.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use futures::{stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{instrument, warn};

use utility::streams::{Stream, StreamTiming};

use crate::errors::Error;

/// Quota units charged per search call.
pub const SEARCH_COST: u32 = 100;
/// Quota units charged per channel in a statistics call.
pub const STATS_COST_PER_CHANNEL: u32 = 1;
/// Channel ids accepted by one statistics call.
const STATS_BATCH_SIZE: usize = 50;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// In-process accounting of the per-day call budget.
#[derive(Debug)]
pub struct QuotaLedger {
    used: u32,
    reset_at: DateTime<Utc>,
    limit: u32,
    safety_margin: u32,
    timezone: Tz,
}

impl QuotaLedger {
    #[must_use]
    pub fn new(limit: u32, safety_margin: u32, timezone: Tz, now: DateTime<Utc>) -> Self {
        Self {
            used: 0,
            reset_at: next_reset(now, timezone),
            limit,
            safety_margin,
            timezone,
        }
    }

    /// Refuses when `used + cost` would cross the gated budget. Rolls
    /// the ledger over first when the reset instant has passed.
    pub fn check(&mut self, cost: u32, now: DateTime<Utc>) -> Result<(), Error> {
        if now >= self.reset_at {
            self.used = 0;
            self.reset_at = next_reset(now, self.timezone);
        }

        let budget = self.limit.saturating_sub(self.safety_margin);

        if self.used.saturating_add(cost) > budget {
            return Err(Error::QuotaExceeded {
                used: self.used,
                limit: self.limit,
                requested: cost,
                reset_time: self.reset_at,
            });
        }

        Ok(())
    }

    /// Records cost actually spent, after a successful call.
    pub fn commit(&mut self, cost: u32) {
        self.used = self.used.saturating_add(cost);
    }

    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Next midnight in the billing timezone, as an instant.
fn next_reset(now: DateTime<Utc>, timezone: Tz) -> DateTime<Utc> {
    let local_now = now.with_timezone(&timezone);
    let next_midnight = (local_now.date_naive() + chrono::Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();

    timezone
        .from_local_datetime(&next_midnight)
        .earliest()
        .map_or_else(
            || now + chrono::Duration::days(1),
            |local| local.with_timezone(&Utc),
        )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub channel_id: String,
    pub subscriber_count: Option<u64>,
    pub video_count: Option<u64>,
}

pub struct YoutubeClient {
    http: reqwest::Client,
    key: String,
    ledger: Mutex<QuotaLedger>,
    semaphore: Arc<Semaphore>,
}

impl YoutubeClient {
    pub fn new(
        key: impl Into<String>,
        daily_quota: u32,
        safety_margin: u32,
        concurrency: usize,
    ) -> Result<Self, Error> {
        let key = key.into();

        if key.is_empty() {
            return Err(Error::Validation {
                field: "secondary_api.key",
                value: "empty".to_owned(),
            });
        }

        let http = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http {
                context: "secondary client construction".to_owned(),
                source: e,
            })?;

        Ok(Self {
            http,
            key,
            ledger: Mutex::new(QuotaLedger::new(
                daily_quota,
                safety_margin,
                chrono_tz::America::Los_Angeles,
                Utc::now(),
            )),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    /// Upcoming videos for one channel via the search endpoint. The
    /// search schema carries no start time; streams come back with an
    /// unknown schedule.
    #[instrument(skip(self))]
    pub async fn upcoming_for_channel(&self, channel_id: &str) -> Result<Vec<Stream>, Error> {
        self.ledger.lock().await.check(SEARCH_COST, Utc::now())?;

        let _permit = self.semaphore.acquire().await.map_err(|e| Error::Service {
            service: "youtube",
            operation: "acquire",
            source: Some(Box::new(e)),
        })?;

        let response: SearchResponse = self
            .get_json(
                "/search",
                &[
                    ("part", "snippet".to_owned()),
                    ("channelId", channel_id.to_owned()),
                    ("eventType", "upcoming".to_owned()),
                    ("type", "video".to_owned()),
                    ("maxResults", "10".to_owned()),
                ],
            )
            .await?;

        self.ledger.lock().await.commit(SEARCH_COST);

        Ok(response
            .items
            .into_iter()
            .filter_map(|item| {
                let video_id = item.id.video_id?;
                let snippet = item.snippet?;

                Some(Stream {
                    id: video_id.clone(),
                    title: snippet.title,
                    channel_id: snippet.channel_id?,
                    channel_name: snippet.channel_title.unwrap_or_default(),
                    timing: StreamTiming::Upcoming {
                        scheduled_for: None,
                    },
                    duration: None,
                    link: url::Url::parse(&format!(
                        "https://www.youtube.com/watch?v={video_id}"
                    ))
                    .ok(),
                    thumbnail: None,
                    channel: None,
                })
            })
            .collect())
    }

    /// Statistics for up to [`STATS_BATCH_SIZE`] channels per underlying
    /// call. Failed batches are logged and skipped; the successful
    /// subset is returned. Errors out only when nothing succeeded.
    #[instrument(skip(self, channel_ids))]
    pub async fn channel_stats(
        &self,
        channel_ids: &[String],
    ) -> Result<HashMap<String, ChannelStats>, Error> {
        if channel_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let batches: Vec<&[String]> = channel_ids.chunks(STATS_BATCH_SIZE).collect();
        let total_batches = batches.len();

        // The semaphore inside each batch bounds real concurrency.
        let results: Vec<Result<Vec<ChannelStats>, Error>> = stream::iter(batches)
            .map(|batch| self.stats_batch(batch))
            .buffer_unordered(total_batches.max(1))
            .collect()
            .await;

        let mut stats = HashMap::new();
        let mut failures = 0_usize;
        let mut last_error = None;

        for result in results {
            match result {
                Ok(batch) => {
                    for entry in batch {
                        stats.insert(entry.channel_id.clone(), entry);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Statistics batch failed.");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if stats.is_empty() => Err(e),
            _ => {
                if failures > 0 {
                    warn!(failures, total_batches, "Partial statistics result.");
                }
                Ok(stats)
            }
        }
    }

    async fn stats_batch(&self, batch: &[String]) -> Result<Vec<ChannelStats>, Error> {
        let cost = u32::try_from(batch.len()).unwrap_or(u32::MAX) * STATS_COST_PER_CHANNEL;
        self.ledger.lock().await.check(cost, Utc::now())?;

        let _permit = self.semaphore.acquire().await.map_err(|e| Error::Service {
            service: "youtube",
            operation: "acquire",
            source: Some(Box::new(e)),
        })?;

        let response: ChannelsResponse = self
            .get_json(
                "/channels",
                &[
                    ("part", "statistics".to_owned()),
                    ("id", batch.join(",")),
                    ("maxResults", "50".to_owned()),
                ],
            )
            .await?;

        self.ledger.lock().await.commit(cost);

        Ok(response
            .items
            .into_iter()
            .map(|item| {
                let statistics = item.statistics.unwrap_or_default();

                ChannelStats {
                    channel_id: item.id,
                    subscriber_count: statistics
                        .subscriber_count
                        .and_then(|s| s.parse().ok()),
                    video_count: statistics.video_count.and_then(|s| s.parse().ok()),
                }
            })
            .collect())
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, Error>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{API_BASE}{path}");

        let response = self
            .http
            .get(&url)
            .query(query)
            .query(&[("key", self.key.as_str())])
            .send()
            .await
            .map_err(|e| Error::Http {
                context: url.clone(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                context: path.to_owned(),
                retry_after: None,
            });
        }

        let bytes = response.bytes().await.map_err(|e| Error::Http {
            context: url,
            source: e,
        })?;

        utility::functions::validate_json_bytes(&bytes).map_err(|e| Error::Service {
            service: "youtube",
            operation: "deserialize",
            source: Some(e.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    #[serde(default)]
    snippet: Option<SearchSnippet>,
}

#[derive(Debug, Deserialize)]
struct SearchItemId {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchSnippet {
    #[serde(default)]
    title: String,
    #[serde(rename = "channelId")]
    channel_id: Option<String>,
    #[serde(rename = "channelTitle")]
    channel_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    id: String,
    statistics: Option<ChannelStatistics>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelStatistics {
    #[serde(rename = "subscriberCount")]
    subscriber_count: Option<String>,
    #[serde(rename = "videoCount")]
    video_count: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LA: Tz = chrono_tz::America::Los_Angeles;

    fn utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn gate_refuses_before_the_call_is_issued() {
        let now = utc(2024, 5, 1, 12);
        let mut ledger = QuotaLedger::new(10_000, 2_000, LA, now);

        ledger.commit(7_900);
        assert!(ledger.check(100, now).is_ok());

        ledger.commit(100);

        // Budget is limit minus margin: 8_000, fully used by now.
        let err = ledger.check(2_000, now).unwrap_err();
        match err {
            Error::QuotaExceeded {
                used,
                limit,
                requested,
                ..
            } => {
                assert_eq!(used, 8_000);
                assert_eq!(limit, 10_000);
                assert_eq!(requested, 2_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ledger_rolls_over_at_provider_midnight() {
        let now = utc(2024, 5, 1, 12);
        let mut ledger = QuotaLedger::new(1_000, 0, LA, now);

        ledger.commit(999);
        assert!(ledger.check(100, now).is_err());

        // 2024-05-02 00:00 PDT is 07:00 UTC.
        let after_reset = utc(2024, 5, 2, 8);
        assert!(ledger.check(100, after_reset).is_ok());
        assert_eq!(ledger.used(), 0);
    }

    #[test]
    fn reset_instant_is_next_local_midnight() {
        // 2024-05-01 12:00 UTC is 05:00 PDT; next midnight PDT is
        // 2024-05-02 00:00 PDT = 07:00 UTC.
        let reset = next_reset(utc(2024, 5, 1, 12), LA);
        assert_eq!(reset, utc(2024, 5, 2, 7));
    }

    #[test]
    fn search_response_maps_to_unknown_schedule_streams() {
        let raw = r#"{
            "items": [
                {"id": {"videoId": "v1"},
                 "snippet": {"title": "stream", "channelId": "UC1", "channelTitle": "Pekora"}},
                {"id": {}, "snippet": {"title": "no id", "channelId": "UC1"}}
            ]
        }"#;

        let response: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.items.len(), 2);
        assert_eq!(response.items[0].id.video_id.as_deref(), Some("v1"));
        assert!(response.items[1].id.video_id.is_none());
    }

    #[test]
    fn statistics_strings_parse_to_counts() {
        let raw = r#"{"items": [{"id": "UC1", "statistics":
            {"subscriberCount": "2340000", "videoCount": "1500"}}]}"#;

        let response: ChannelsResponse = serde_json::from_str(raw).unwrap();
        let stats = response.items[0].statistics.as_ref().unwrap();
        assert_eq!(stats.subscriber_count.as_deref(), Some("2340000"));
    }
}
