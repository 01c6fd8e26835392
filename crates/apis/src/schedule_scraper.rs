//! Fallback parser for the official HTML schedule page.
//!
//! Used when the primary API is unreachable. Extraction is scoped to the
//! page's stable container selectors and fails loudly when the layout no
//! longer matches, instead of silently returning an empty schedule.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{info, instrument, warn};
use url::Url;

use utility::{
    members::MemberDirectory,
    streams::{Stream, StreamTiming},
};

use crate::errors::Error;

/// Schedule entries this far in the past are read as next year's.
const YEAR_ROLLOVER_DAYS: i64 = 90;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// `MM/DD` in a day-section header.
static DATE_HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2})/(\d{1,2})").unwrap());
/// `HH:MM` inside a card's datetime element.
static CLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2}):(\d{2})").unwrap());
/// The video id in a card's watch link.
static VIDEO_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"watch\?v=([A-Za-z0-9_-]+)").unwrap());
/// The JSON blob embedded in a card's onclick handler.
static ONCLICK_JSON_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

macro_rules! selector {
    ($sel:literal) => {{
        static SEL: ::once_cell::sync::OnceCell<Selector> = ::once_cell::sync::OnceCell::new();
        SEL.get_or_init(|| Selector::parse($sel).unwrap())
    }};
}

pub struct ScheduleScraper {
    http: reqwest::Client,
    page_url: String,
    timezone: Tz,
}

impl ScheduleScraper {
    pub fn new(page_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http {
                context: "scraper client construction".to_owned(),
                source: e,
            })?;

        Ok(Self {
            http,
            page_url: page_url.into(),
            timezone: chrono_tz::Asia::Tokyo,
        })
    }

    /// Fetches and parses the whole schedule page.
    #[instrument(skip(self, directory))]
    pub async fn fetch(&self, directory: &MemberDirectory) -> Result<Vec<Stream>, Error> {
        let response = self
            .http
            .get(&self.page_url)
            .send()
            .await
            .map_err(|e| Error::Http {
                context: self.page_url.clone(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                context: self.page_url.clone(),
                retry_after: None,
            });
        }

        let body = response.text().await.map_err(|e| Error::Http {
            context: self.page_url.clone(),
            source: e,
        })?;

        let now = Utc::now().with_timezone(&self.timezone);
        parse_schedule(&body, now, directory)
    }
}

/// Parses the schedule page body. `now` anchors year inference and the
/// live/upcoming split.
pub fn parse_schedule(
    body: &str,
    now: DateTime<Tz>,
    directory: &MemberDirectory,
) -> Result<Vec<Stream>, Error> {
    let document = Html::parse_document(body);

    let mut streams = Vec::new();
    let mut parse_errors = Vec::new();
    let mut candidates = 0_usize;
    let mut current_date: Option<(u32, u32)> = None;

    for section in document.select(selector!(".container .col-12")) {
        if let Some(header) = section.select(selector!(".navbar-text")).next() {
            let text = element_text(&header);

            match parse_date_header(&text) {
                Some(date) => current_date = Some(date),
                None => parse_errors.push(format!("unparseable date header: {text}")),
            }
        }

        for card in section.select(selector!("a.thumbnail")) {
            candidates += 1;

            match parse_card(&card, current_date, now, directory) {
                Ok(stream) => streams.push(stream),
                Err(e) => parse_errors.push(e),
            }
        }
    }

    // Zero parsed cards, or errors on more than half of the candidates,
    // means the layout changed under us.
    if streams.is_empty() || parse_errors.len() * 2 > candidates {
        return Err(Error::StructureChanged {
            parsed: streams.len(),
            parse_errors,
        });
    }

    if !parse_errors.is_empty() {
        warn!(
            errors = parse_errors.len(),
            parsed = streams.len(),
            "Schedule page parsed with errors."
        );
    }

    Ok(streams)
}

fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_owned()
}

fn parse_date_header(text: &str) -> Option<(u32, u32)> {
    let captures = DATE_HEADER_RE.captures(text)?;
    let month: u32 = captures.get(1)?.as_str().parse().ok()?;
    let day: u32 = captures.get(2)?.as_str().parse().ok()?;

    ((1..=12).contains(&month) && (1..=31).contains(&day)).then_some((month, day))
}

fn parse_card(
    card: &ElementRef<'_>,
    date: Option<(u32, u32)>,
    now: DateTime<Tz>,
    directory: &MemberDirectory,
) -> Result<Stream, String> {
    let (month, day) = date.ok_or_else(|| "stream card before any date header".to_owned())?;

    let href = card
        .value()
        .attr("href")
        .ok_or_else(|| "card without href".to_owned())?;

    let video_id = VIDEO_ID_RE
        .captures(href)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .ok_or_else(|| format!("href without video id: {href}"))?;

    let time_text = card
        .select(selector!(".datetime"))
        .next()
        .map(|e| element_text(&e))
        .ok_or_else(|| format!("card {video_id} without datetime"))?;

    let time_captures = CLOCK_RE
        .captures(&time_text)
        .ok_or_else(|| format!("card {video_id} with unparseable time: {time_text}"))?;

    let hour: u32 = time_captures[1].parse().map_err(|_| "bad hour".to_owned())?;
    let minute: u32 = time_captures[2]
        .parse()
        .map_err(|_| "bad minute".to_owned())?;

    let scheduled = compose_instant(now, month, day, hour, minute)
        .ok_or_else(|| format!("card {video_id} with invalid date {month}/{day} {hour}:{minute}"))?;

    let display_name = card
        .value()
        .attr("onclick")
        .and_then(onclick_member_name)
        .or_else(|| {
            card.select(selector!(".name"))
                .next()
                .or_else(|| card.select(selector!(".text")).next())
                .map(|e| element_text(&e))
        })
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("card {video_id} without a member name"))?;

    let channel_id = match match_member(directory, &display_name) {
        Some(id) => id,
        None => {
            info!(name = %display_name, video = %video_id, "Scraped stream with unknown member.");
            String::new()
        }
    };

    let title = card
        .select(selector!(".text"))
        .next()
        .map(|e| element_text(&e))
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| display_name.clone());

    let timing = if scheduled <= now.with_timezone(&Utc) {
        StreamTiming::Live {
            started_at: scheduled,
            scheduled_for: Some(scheduled),
        }
    } else {
        StreamTiming::Upcoming {
            scheduled_for: Some(scheduled),
        }
    };

    let thumbnail = card
        .select(selector!("img"))
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(str::to_owned);

    Ok(Stream {
        id: video_id.clone(),
        title,
        channel_id,
        channel_name: display_name,
        timing,
        duration: None,
        link: Url::parse(&format!("https://www.youtube.com/watch?v={video_id}")).ok(),
        thumbnail,
        channel: None,
    })
}

/// The card's onclick handler embeds a JSON blob whose `name` field is
/// the member's display name.
fn onclick_member_name(onclick: &str) -> Option<String> {
    let blob = ONCLICK_JSON_RE.find(onclick)?;
    let value: serde_json::Value = serde_json::from_str(blob.as_str()).ok()?;

    value
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::to_owned)
}

/// Exact lower-case match against the directory first, containment after.
fn match_member(directory: &MemberDirectory, display_name: &str) -> Option<String> {
    let needle = MemberDirectory::normalize(display_name);

    let exact = directory.get_all_members().iter().find(|m| {
        MemberDirectory::normalize(&m.name) == needle
            || MemberDirectory::normalize(&m.name_ja) == needle
            || MemberDirectory::normalize(&m.name_ko) == needle
    });

    if let Some(member) = exact {
        return Some(member.channel_id.clone());
    }

    directory
        .get_all_members()
        .iter()
        .find(|m| {
            [&m.name, &m.name_ja, &m.name_ko]
                .into_iter()
                .filter(|n| !n.is_empty())
                .map(|n| MemberDirectory::normalize(n))
                .any(|n| n.contains(&needle) || needle.contains(&n))
        })
        .map(|m| m.channel_id.clone())
}

/// Composes a page date and time into an instant in the page timezone.
/// Hours past 24 spill into the next day; a date more than
/// [`YEAR_ROLLOVER_DAYS`] in the past is read as next year's.
fn compose_instant(
    now: DateTime<Tz>,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    let extra_days = i64::from(hour / 24);
    let hour = hour % 24;

    let build = |year: i32| -> Option<DateTime<Utc>> {
        let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?
            + chrono::Duration::days(extra_days);

        now.timezone()
            .from_local_datetime(&naive)
            .single()
            .map(|local| local.with_timezone(&Utc))
    };

    let candidate = build(now.year())?;

    if (now.with_timezone(&Utc) - candidate).num_days() > YEAR_ROLLOVER_DAYS {
        build(now.year() + 1)
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utility::members::Member;

    fn directory() -> MemberDirectory {
        MemberDirectory::new(
            vec![
                Member {
                    name: "Usada Pekora".into(),
                    name_ja: "兎田ぺこら".into(),
                    channel_id: "UC_pekora".into(),
                    ..Member::default()
                },
                Member {
                    name: "Shirakami Fubuki".into(),
                    name_ja: "白上フブキ".into(),
                    channel_id: "UC_fubuki".into(),
                    ..Member::default()
                },
            ],
            Vec::new(),
        )
        .unwrap()
    }

    fn jst(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        chrono_tz::Asia::Tokyo
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
    }

    const PAGE: &str = r##"
    <html><body><div class="container">
      <div class="row">
        <div class="col-12">
          <div class="holodule navbar-text">05/27 (月)</div>
          <a class="thumbnail" href="https://www.youtube.com/watch?v=abc123"
             onclick="posting('{&quot;name&quot;:&quot;兎田ぺこら&quot;}')">
            <div class="datetime">21:00</div>
            <div class="name">兎田ぺこら</div>
            <div class="text">ぺこらのゲーム配信</div>
          </a>
          <a class="thumbnail" href="https://www.youtube.com/watch?v=def456">
            <div class="datetime">23:30</div>
            <div class="name">白上フブキ</div>
          </a>
        </div>
        <div class="col-12">
          <div class="holodule navbar-text">05/28 (火)</div>
          <a class="thumbnail" href="https://www.youtube.com/watch?v=ghi789">
            <div class="datetime">12:00</div>
            <div class="name">謎のメンバー</div>
          </a>
        </div>
      </div>
    </div></body></html>
    "##;

    #[test]
    fn parses_cards_into_streams() {
        let now = jst(2024, 5, 27, 12, 0);
        let streams = parse_schedule(PAGE, now, &directory()).unwrap();

        assert_eq!(streams.len(), 3);

        let pekora = &streams[0];
        assert_eq!(pekora.id, "abc123");
        assert_eq!(pekora.channel_id, "UC_pekora");
        assert_eq!(pekora.title, "ぺこらのゲーム配信");
        assert_eq!(
            pekora.start_scheduled().unwrap(),
            jst(2024, 5, 27, 21, 0).with_timezone(&Utc)
        );

        let fubuki = &streams[1];
        assert_eq!(fubuki.channel_id, "UC_fubuki");

        // Unknown members are kept, with an empty channel id.
        let unknown = &streams[2];
        assert_eq!(unknown.channel_id, "");
        assert_eq!(
            unknown.start_scheduled().unwrap(),
            jst(2024, 5, 28, 12, 0).with_timezone(&Utc)
        );
    }

    #[test]
    fn unknown_layout_is_a_hard_failure() {
        let now = jst(2024, 5, 27, 12, 0);
        let result = parse_schedule("<html><body><p>maintenance</p></body></html>", now, &directory());

        assert!(matches!(result, Err(Error::StructureChanged { .. })));
    }

    #[test]
    fn broken_cards_beyond_half_fail_the_parse() {
        let page = r##"
        <div class="container"><div class="col-12">
          <div class="navbar-text">05/27</div>
          <a class="thumbnail" href="https://www.youtube.com/watch?v=ok1">
            <div class="datetime">10:00</div><div class="name">兎田ぺこら</div>
          </a>
          <a class="thumbnail" href="bogus"><div class="datetime">11:00</div></a>
          <a class="thumbnail" href="bogus2"><div class="datetime">12:00</div></a>
        </div></div>
        "##;

        let now = jst(2024, 5, 27, 9, 0);
        let result = parse_schedule(page, now, &directory());
        assert!(matches!(
            result,
            Err(Error::StructureChanged { parsed: 1, .. })
        ));
    }

    #[test]
    fn year_rolls_over_for_dates_far_in_the_past() {
        // Early January, page still showing December entries is normal;
        // but a late-December "01/05" entry belongs to next year.
        let now = jst(2024, 12, 28, 10, 0);
        let composed = compose_instant(now, 1, 5, 20, 0).unwrap();
        assert_eq!(composed, jst(2025, 1, 5, 20, 0).with_timezone(&Utc));

        // Recent past dates stay in the current year.
        let composed = compose_instant(now, 12, 27, 20, 0).unwrap();
        assert_eq!(composed, jst(2024, 12, 27, 20, 0).with_timezone(&Utc));
    }

    #[test]
    fn hours_past_midnight_spill_into_the_next_day() {
        let now = jst(2024, 5, 27, 12, 0);
        let composed = compose_instant(now, 5, 27, 25, 30).unwrap();
        assert_eq!(composed, jst(2024, 5, 28, 1, 30).with_timezone(&Utc));
    }

    #[test]
    fn onclick_json_supplies_the_member_name() {
        assert_eq!(
            onclick_member_name(r#"posting('{"name":"Usada Pekora","id":3}')"#),
            Some("Usada Pekora".to_owned())
        );
        assert_eq!(onclick_member_name("posting()"), None);
    }
}
