//! Plain-text rendering of replies and notifications.

use chrono::{DateTime, Utc};
use chrono_humanize::{Accuracy, HumanTime, Tense};
use chrono_tz::Tz;

use apis::{database::MemberRecord, youtube_api::ChannelStats};
use utility::streams::{Channel, NextStream, Notification, Stream, StreamStatus};

/// Timezone used for user-facing clock times.
const DISPLAY_TZ: Tz = chrono_tz::Asia::Seoul;

#[must_use]
pub fn notification(notification: &Notification) -> String {
    let mut lines = vec![format!(
        "🔔 {} goes live in {} minute{}!",
        notification.channel.display_name(),
        notification.minutes_until,
        if notification.minutes_until == 1 { "" } else { "s" },
    )];

    lines.push(notification.stream.title.clone());

    if let Some(link) = &notification.stream.link {
        lines.push(link.to_string());
    }

    if !notification.users.is_empty() {
        lines.push(format!("→ {}", notification.users.join(", ")));
    }

    lines.join("\n")
}

#[must_use]
pub fn stream_line(stream: &Stream) -> String {
    let when = match stream.status() {
        StreamStatus::Live => "LIVE".to_owned(),
        StreamStatus::Upcoming | StreamStatus::Past => stream
            .start_scheduled()
            .map_or_else(|| "time unknown".to_owned(), relative_time),
    };

    format!("[{}] {} — {}", when, stream.channel_name, stream.title)
}

#[must_use]
pub fn stream_list(header: &str, streams: &[Stream]) -> String {
    if streams.is_empty() {
        return format!("{header}\nNothing found.");
    }

    let mut lines = vec![header.to_owned()];
    lines.extend(streams.iter().map(stream_line));
    lines.join("\n")
}

#[must_use]
pub fn next_stream(channel_name: &str, summary: &NextStream) -> String {
    match summary {
        NextStream::Live { title, video_id } => format!(
            "{channel_name} is live now!\n{title}\nhttps://www.youtube.com/watch?v={video_id}"
        ),
        NextStream::Upcoming {
            title,
            video_id,
            start_scheduled,
        } => format!(
            "{channel_name}: next stream {} ({})\n{title}\nhttps://www.youtube.com/watch?v={video_id}",
            relative_time(*start_scheduled),
            clock_time(*start_scheduled),
        ),
        NextStream::NoUpcoming => format!("{channel_name} has no scheduled stream."),
        NextStream::TimeUnknown => {
            format!("{channel_name} has a stream planned, but no start time yet.")
        }
    }
}

#[must_use]
pub fn channel_info(
    channel: &Channel,
    member: Option<&MemberRecord>,
    stats: Option<&ChannelStats>,
) -> String {
    let mut lines = vec![channel.display_name().to_owned()];

    if let Some(member) = member {
        if let Some(japanese) = &member.japanese_name {
            lines.push(japanese.clone());
        }

        if member.is_graduated {
            lines.push("(graduated)".to_owned());
        }
    }

    let subscriber_count = stats
        .and_then(|s| s.subscriber_count)
        .or(channel.subscriber_count);

    if let Some(count) = subscriber_count {
        lines.push(format!("Subscribers: {}", group_digits(count)));
    }

    let video_count = stats.and_then(|s| s.video_count).or(channel.video_count);

    if let Some(count) = video_count {
        lines.push(format!("Videos: {}", group_digits(count)));
    }

    lines.push(format!("https://www.youtube.com/channel/{}", channel.id));
    lines.join("\n")
}

#[must_use]
pub fn alarm_list(subscriptions: &[(String, String)]) -> String {
    if subscriptions.is_empty() {
        return "No stream alarms set. Try: alarm add <member>".to_owned();
    }

    let mut lines = vec![format!("Stream alarms ({}):", subscriptions.len())];
    lines.extend(
        subscriptions
            .iter()
            .map(|(_, name)| format!("• {name}")),
    );
    lines.join("\n")
}

/// User-facing banner for a breaker refusal.
#[must_use]
pub fn degraded(next_retry: DateTime<Utc>) -> String {
    format!(
        "Service temporarily degraded. Try again around {}.",
        clock_time(next_retry),
    )
}

#[must_use]
pub fn relative_time(at: DateTime<Utc>) -> String {
    HumanTime::from(at - Utc::now()).to_text_en(Accuracy::Rough, Tense::Future)
}

#[must_use]
pub fn clock_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&DISPLAY_TZ).format("%H:%M").to_string()
}

fn group_digits(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);

    for (index, c) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use utility::streams::StreamTiming;

    #[test]
    fn notification_text_names_channel_lead_time_and_users() {
        let text = notification(&Notification {
            room_id: "r1".into(),
            channel: Channel::skeletal("UC_pekora", "Usada Pekora"),
            stream: Stream {
                id: "v1".into(),
                title: "Minecraft".into(),
                channel_id: "UC_pekora".into(),
                channel_name: "Usada Pekora".into(),
                timing: StreamTiming::Upcoming {
                    scheduled_for: Some(Utc::now()),
                },
                duration: None,
                link: None,
                thumbnail: None,
                channel: None,
            },
            minutes_until: 5,
            users: vec!["u1".into(), "u2".into()],
        });

        assert!(text.contains("Usada Pekora"));
        assert!(text.contains("5 minutes"));
        assert!(text.contains("Minecraft"));
        assert!(text.contains("u1, u2"));
    }

    #[test]
    fn digits_group_in_threes() {
        assert_eq!(group_digits(999), "999");
        assert_eq!(group_digits(1_234), "1,234");
        assert_eq!(group_digits(2_340_000), "2,340,000");
    }

    #[test]
    fn empty_lists_render_placeholders() {
        assert!(stream_list("Live now:", &[]).contains("Nothing found."));
        assert!(alarm_list(&[]).contains("No stream alarms"));
    }
}
