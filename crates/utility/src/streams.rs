use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};
use url::Url;

/// A streaming identity on the upstream platform. Primary join key is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub english_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suborg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
}

impl Channel {
    /// A minimal channel carrying only its identity, used when hydration
    /// against the upstream fails but the id is already known.
    pub fn skeletal(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.english_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, EnumDisplay, EnumString, Deserialize, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Live,
    Upcoming,
    Past,
}

/// Timing data for a stream, carried per status so that fields mandatory
/// for a status cannot be absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamTiming {
    Live {
        started_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_for: Option<DateTime<Utc>>,
    },
    Upcoming {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_for: Option<DateTime<Utc>>,
    },
    Past {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_for: Option<DateTime<Utc>>,
    },
}

impl StreamTiming {
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        match self {
            Self::Live { .. } => StreamStatus::Live,
            Self::Upcoming { .. } => StreamStatus::Upcoming,
            Self::Past { .. } => StreamStatus::Past,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Stream {
    pub id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_name: String,
    #[serde(flatten)]
    pub timing: StreamTiming,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl Stream {
    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.timing.status()
    }

    #[must_use]
    pub fn start_scheduled(&self) -> Option<DateTime<Utc>> {
        match &self.timing {
            StreamTiming::Live { scheduled_for, .. }
            | StreamTiming::Upcoming { scheduled_for }
            | StreamTiming::Past { scheduled_for, .. } => *scheduled_for,
        }
    }

    #[must_use]
    pub fn start_actual(&self) -> Option<DateTime<Utc>> {
        match &self.timing {
            StreamTiming::Live { started_at, .. } => Some(*started_at),
            StreamTiming::Upcoming { .. } => None,
            StreamTiming::Past { started_at, .. } => *started_at,
        }
    }

    /// Seconds from `now` until the scheduled start. `None` when the
    /// schedule is unknown.
    #[must_use]
    pub fn seconds_until_start(&self, now: DateTime<Utc>) -> Option<i64> {
        self.start_scheduled()
            .map(|start| (start - now).num_seconds())
    }

    /// Best-effort sort key for ascending schedule ordering; unknown
    /// schedules sort last.
    #[must_use]
    pub fn schedule_sort_key(&self) -> DateTime<Utc> {
        self.start_scheduled().unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}][{}] {} by {}",
            self.id,
            self.status(),
            self.title,
            self.channel_name
        )
    }
}

/// One pre-stream alert for a single room.
#[derive(Debug, Clone)]
pub struct Notification {
    pub room_id: String,
    pub channel: Channel,
    pub stream: Stream,
    pub minutes_until: i64,
    pub users: Vec<String>,
}

/// Cached summary of the single most relevant stream per channel
/// (live wins over soonest upcoming), used for fast command replies.
///
/// An `upcoming` summary always carries title, video id, and start time;
/// a summary that fails to deserialize is treated as no info.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextStream {
    Live {
        title: String,
        video_id: String,
    },
    Upcoming {
        title: String,
        video_id: String,
        start_scheduled: DateTime<Utc>,
    },
    NoUpcoming,
    TimeUnknown,
}

/// Grace window within which an upcoming stream whose scheduled time has
/// already passed is still considered pending rather than stale.
#[must_use]
pub fn upcoming_grace() -> Duration {
    Duration::minutes(10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn timing_variant_determines_status_and_fields() {
        let live = StreamTiming::Live {
            started_at: at(0),
            scheduled_for: Some(at(-60)),
        };
        assert_eq!(live.status(), StreamStatus::Live);

        let upcoming = Stream {
            id: "v1".into(),
            title: "t".into(),
            channel_id: "UC1".into(),
            channel_name: "n".into(),
            timing: StreamTiming::Upcoming {
                scheduled_for: Some(at(300)),
            },
            duration: None,
            link: None,
            thumbnail: None,
            channel: None,
        };
        assert_eq!(upcoming.status(), StreamStatus::Upcoming);
        assert_eq!(upcoming.start_actual(), None);
        assert_eq!(upcoming.seconds_until_start(at(0)), Some(300));
    }

    #[test]
    fn stream_serializes_with_flattened_status_tag() {
        let stream = Stream {
            id: "v1".into(),
            title: "t".into(),
            channel_id: "UC1".into(),
            channel_name: "n".into(),
            timing: StreamTiming::Upcoming {
                scheduled_for: Some(at(0)),
            },
            duration: None,
            link: None,
            thumbnail: None,
            channel: None,
        };

        let value = serde_json::to_value(&stream).unwrap();
        assert_eq!(value["status"], "upcoming");
        assert!(value["scheduled_for"].is_string());

        let back: Stream = serde_json::from_value(value).unwrap();
        assert_eq!(back, stream);
    }

    #[test]
    fn unknown_schedule_sorts_last() {
        let known = Stream {
            id: "a".into(),
            title: "t".into(),
            channel_id: "UC1".into(),
            channel_name: "n".into(),
            timing: StreamTiming::Upcoming {
                scheduled_for: Some(at(100)),
            },
            duration: None,
            link: None,
            thumbnail: None,
            channel: None,
        };
        let unknown = Stream {
            timing: StreamTiming::Upcoming {
                scheduled_for: None,
            },
            id: "b".into(),
            ..known.clone()
        };

        let mut streams = vec![unknown.clone(), known.clone()];
        streams.sort_by_key(Stream::schedule_sort_key);
        assert_eq!(streams[0].id, "a");
        assert_eq!(streams[1].id, "b");
    }

    #[test]
    fn malformed_next_stream_summary_is_rejected() {
        // An upcoming summary without a start time must not deserialize.
        let raw = r#"{"status":"upcoming","title":"t","video_id":"v"}"#;
        assert!(serde_json::from_str::<NextStream>(raw).is_err());

        let ok = r#"{"status":"no_upcoming"}"#;
        assert_eq!(
            serde_json::from_str::<NextStream>(ok).unwrap(),
            NextStream::NoUpcoming
        );
    }
}
