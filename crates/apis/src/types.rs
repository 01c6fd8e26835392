//! Raw upstream schemas and their mapping into the domain model.
//!
//! The mapping is where the "no channel id, no record" invariant lives:
//! any upstream record lacking a channel id at both the top level and
//! the embedded channel is unusable and dropped here.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use tracing::debug;
use url::Url;

use utility::streams::{Channel, Stream, StreamTiming};

/// Upstream count fields arrive as either numbers or decimal strings;
/// `PickFirst` accepts both shapes.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawChannel {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub english_name: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub suborg: Option<String>,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub subscriber_count: Option<u64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub video_count: Option<u64>,
}

impl RawChannel {
    /// `None` when the record has no id.
    #[must_use]
    pub fn into_channel(self) -> Option<Channel> {
        let id = self.id?;

        Some(Channel {
            id,
            name: self.name.unwrap_or_default(),
            english_name: self.english_name,
            org: self.org,
            suborg: self.suborg,
            subscriber_count: self.subscriber_count,
            video_count: self.video_count,
            photo: self.photo,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVideo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub start_scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_actual: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub channel: Option<RawChannel>,
}

impl RawVideo {
    /// Maps the nullable upstream record into the tagged domain model.
    /// Records without a usable channel id, and "live" records without
    /// any start time at all, are dropped.
    #[must_use]
    pub fn into_stream(self) -> Option<Stream> {
        let channel = self.channel.and_then(RawChannel::into_channel);

        let channel_id = self
            .channel_id
            .filter(|id| !id.is_empty())
            .or_else(|| channel.as_ref().map(|c| c.id.clone()))?;

        let timing = match self.status.as_deref() {
            Some("live") => {
                let started_at = self.start_actual.or(self.start_scheduled)?;
                StreamTiming::Live {
                    started_at,
                    scheduled_for: self.start_scheduled,
                }
            }
            Some("upcoming") => StreamTiming::Upcoming {
                scheduled_for: self.start_scheduled,
            },
            Some("past") | Some("missing") | Some("new") | None | Some(_) => StreamTiming::Past {
                started_at: self.start_actual,
                scheduled_for: self.start_scheduled,
            },
        };

        let channel_name = channel
            .as_ref()
            .map(|c| c.display_name().to_owned())
            .unwrap_or_default();

        let link = Url::parse(&format!("https://www.youtube.com/watch?v={}", self.id)).ok();

        if channel_name.is_empty() {
            debug!(video = %self.id, "Mapped stream has no channel name.");
        }

        Some(Stream {
            id: self.id,
            title: self.title,
            channel_id,
            channel_name,
            timing,
            duration: self.duration,
            link,
            thumbnail: self.thumbnail,
            channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utility::streams::StreamStatus;

    #[test]
    fn records_without_any_channel_id_are_dropped() {
        let raw: RawVideo = serde_json::from_str(
            r#"{"id": "v1", "title": "t", "status": "upcoming", "channel": {"name": "someone"}}"#,
        )
        .unwrap();

        assert!(raw.into_stream().is_none());
    }

    #[test]
    fn embedded_channel_id_is_enough() {
        let raw: RawVideo = serde_json::from_str(
            r#"{"id": "v1", "title": "t", "status": "upcoming",
                "channel": {"id": "UC1", "name": "someone", "org": "Hololive"}}"#,
        )
        .unwrap();

        let stream = raw.into_stream().unwrap();
        assert_eq!(stream.channel_id, "UC1");
        assert_eq!(stream.status(), StreamStatus::Upcoming);
        assert_eq!(stream.channel.as_ref().unwrap().org.as_deref(), Some("Hololive"));
    }

    #[test]
    fn live_without_start_actual_falls_back_to_schedule() {
        let raw: RawVideo = serde_json::from_str(
            r#"{"id": "v1", "title": "t", "status": "live", "channel_id": "UC1",
                "start_scheduled": "2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();

        let stream = raw.into_stream().unwrap();
        assert_eq!(stream.status(), StreamStatus::Live);
        assert!(stream.start_actual().is_some());
    }

    #[test]
    fn live_without_any_start_time_is_dropped() {
        let raw: RawVideo = serde_json::from_str(
            r#"{"id": "v1", "title": "t", "status": "live", "channel_id": "UC1"}"#,
        )
        .unwrap();

        assert!(raw.into_stream().is_none());
    }

    #[test]
    fn string_counts_parse() {
        let raw: RawChannel = serde_json::from_str(
            r#"{"id": "UC1", "name": "n", "subscriber_count": "123000", "video_count": 42}"#,
        )
        .unwrap();

        let channel = raw.into_channel().unwrap();
        assert_eq!(channel.subscriber_count, Some(123_000));
        assert_eq!(channel.video_count, Some(42));
    }
}
