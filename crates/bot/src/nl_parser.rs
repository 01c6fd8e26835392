//! Natural-language intent parsing and ambiguous-channel selection.
//!
//! Both prompts are rendered from versioned templates over the full
//! normalized member directory. Responses are tagged JSON: a single
//! intent object or an array of them for multi-step requests. Parsed
//! intents are cached briefly in one TTL-bearing map that is reaped
//! opportunistically on access.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use strum::{Display, EnumString};
use tracing::{debug, instrument, warn};

use apis::{
    ai_api::{AiFacade, SamplingOverrides, SamplingPreset},
    errors::Error,
};
use utility::{members::MemberDirectory, streams::Channel};

use crate::resolver::ChannelSelector;

pub const PARSE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Queries are clipped to this many characters before prompting.
pub const MAX_QUERY_CHARS: usize = 500;
/// Selections and intents below this confidence are discarded.
pub const MIN_CONFIDENCE: f32 = 0.7;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Live,
    Upcoming,
    Schedule,
    MemberInfo,
    AlarmList,
    AlarmAdd,
    AlarmRemove,
    Help,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedIntent {
    pub command: CommandKind,
    pub member: Option<String>,
    pub hours: Option<i64>,
    pub days: Option<i64>,
    pub confidence: f32,
    pub reasoning: String,
}

const INTENT_PROMPT: &str = r#"# intent-parser v2

Map this chat message to bot commands, using the member directory from
your instructions.

Reply with JSON: a single object or an array of objects for multi-step
requests, each shaped as
{"command": "...", "params": {"member": "...", "hours": 0, "days": 0},
 "confidence": 0.0, "reasoning": "..."}.

Message: {query}
"#;

const SELECTOR_PROMPT: &str = r#"# channel-selector v1

A user looked for a VTuber channel. Pick the single best match for the
query from the numbered candidates, or -1 when none fits.

Query: {query}

Candidates:
{candidates}

Reply with JSON shaped as
{"selected_index": -1, "confidence": 0.0, "reasoning": "..."}.
"#;

/// Strips control characters, collapses whitespace runs, and clips to
/// [`MAX_QUERY_CHARS`].
#[must_use]
pub fn sanitize(text: &str) -> String {
    let cleaned: String = text.chars().filter(|c| !c.is_control()).collect();

    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    collapsed.chars().take(MAX_QUERY_CHARS).collect()
}

/// The full member directory, one normalized line per member.
#[must_use]
pub fn directory_dump(directory: &MemberDirectory) -> String {
    directory
        .get_all_members()
        .iter()
        .map(|member| {
            let aliases = member
                .aliases_ko
                .iter()
                .chain(member.aliases_ja.iter())
                .chain(std::iter::once(&member.name_ja).filter(|s| !s.is_empty()))
                .chain(std::iter::once(&member.name_ko).filter(|s| !s.is_empty()))
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",");

            format!("{} | {} | {}", member.name, aliases, member.channel_id)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// System prompt for the AI facade: the stable instructions plus the
/// directory dump, large enough to be worth context-caching upstream.
#[must_use]
pub fn system_prompt(directory: &MemberDirectory) -> String {
    format!(
        "You are the intent parser of a VTuber stream-alarm chat bot.\n\
         \n\
         Commands and their parameters:\n\
         - live: no parameters\n\
         - upcoming: hours (1-168) or days (1-30)\n\
         - schedule: member\n\
         - member_info: member\n\
         - alarm_list: no parameters\n\
         - alarm_add: member\n\
         - alarm_remove: member\n\
         - help: no parameters\n\
         - unknown: anything else\n\
         \n\
         Known members (name | aliases | channel id):\n{}",
        directory_dump(directory),
    )
}

pub struct NlParser {
    ai: Arc<AiFacade>,
    cache: RwLock<HashMap<String, (Vec<ParsedIntent>, DateTime<Utc>)>>,
}

impl NlParser {
    #[must_use]
    pub fn new(ai: Arc<AiFacade>) -> Self {
        Self {
            ai,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Parses a free-text message into one or more intents.
    #[instrument(skip(self))]
    pub async fn parse_intent(&self, query: &str) -> Result<Vec<ParsedIntent>, Error> {
        let query = sanitize(query);

        if query.is_empty() {
            return Ok(Vec::new());
        }

        let cache_key = MemberDirectory::normalize(&query);

        if let Some(cached) = self.cache_lookup(&cache_key) {
            debug!("Intent served from parse cache.");
            return Ok(cached);
        }

        let prompt = INTENT_PROMPT.replace("{query}", &query);

        let (value, metadata) = self
            .ai
            .generate_json::<Value>(&prompt, SamplingPreset::Precise, SamplingOverrides::default())
            .await?;

        let intents = parse_intent_response(&value);

        debug!(
            provider = metadata.provider,
            count = intents.len(),
            "Intent parsed."
        );

        self.cache_insert(cache_key, intents.clone());

        Ok(intents)
    }

    fn cache_lookup(&self, key: &str) -> Option<Vec<ParsedIntent>> {
        let now = Utc::now();
        let cache = self.cache.read().unwrap();

        cache
            .get(key)
            .filter(|(_, expires_at)| now < *expires_at)
            .map(|(intents, _)| intents.clone())
    }

    fn cache_insert(&self, key: String, intents: Vec<ParsedIntent>) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(PARSE_CACHE_TTL)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let mut cache = self.cache.write().unwrap();

        // Reap everything stale while we hold the write lock anyway;
        // one map with TTLs instead of a deletion task per entry.
        cache.retain(|_, (_, expires_at)| now < *expires_at);
        cache.insert(key, (intents, now + ttl));
    }
}

#[async_trait]
impl ChannelSelector for NlParser {
    #[instrument(skip(self, candidates))]
    async fn select_channel(
        &self,
        query: &str,
        candidates: &[Channel],
    ) -> Result<Option<usize>, Error> {
        let listing = candidates
            .iter()
            .enumerate()
            .map(|(index, channel)| {
                format!(
                    "{index}: {} ({})",
                    channel.display_name(),
                    channel.suborg.as_deref().unwrap_or("-"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = SELECTOR_PROMPT
            .replace("{query}", &sanitize(query))
            .replace("{candidates}", &listing);

        let (selection, _) = self
            .ai
            .generate_json::<Selection>(
                &prompt,
                SamplingPreset::Precise,
                SamplingOverrides::default(),
            )
            .await?;

        Ok(gate_selection(&selection, candidates.len()))
    }
}

#[derive(Debug, Deserialize)]
pub struct Selection {
    #[serde(alias = "selectedIndex")]
    pub selected_index: i64,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
}

/// `-1`, an out-of-range index, or low confidence mean "no confident
/// match".
#[must_use]
pub fn gate_selection(selection: &Selection, candidate_count: usize) -> Option<usize> {
    if selection.confidence < MIN_CONFIDENCE {
        return None;
    }

    usize::try_from(selection.selected_index)
        .ok()
        .filter(|&index| index < candidate_count)
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    #[serde(default)]
    command: String,
    #[serde(default)]
    params: RawParams,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawParams {
    #[serde(default)]
    member: Option<String>,
    #[serde(default)]
    hours: Option<i64>,
    #[serde(default)]
    days: Option<i64>,
}

/// Accepts a single intent object or an array of them. Entries that are
/// not objects, or name a command we do not know, degrade to `unknown`
/// rather than failing the whole response.
#[must_use]
pub fn parse_intent_response(value: &Value) -> Vec<ParsedIntent> {
    let raw_values: Vec<&Value> = match value {
        Value::Array(values) => values.iter().collect(),
        other => vec![other],
    };

    raw_values
        .into_iter()
        .filter_map(|raw| {
            let raw: RawIntent = serde_json::from_value(raw.clone())
                .map_err(|e| warn!(error = %e, "Discarding malformed intent."))
                .ok()?;

            let command = raw.command.parse().unwrap_or(CommandKind::Unknown);

            Some(ParsedIntent {
                command,
                member: raw.params.member,
                hours: raw.params.hours,
                days: raw.params.days,
                confidence: raw.confidence,
                reasoning: raw.reasoning,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use utility::members::Member;

    #[test]
    fn system_prompt_carries_the_directory_and_command_set() {
        let directory = MemberDirectory::new(
            vec![Member {
                name: "Usada Pekora".into(),
                name_ja: "兎田ぺこら".into(),
                channel_id: "UC_pekora".into(),
                aliases_ko: vec!["페코라".into()],
                ..Member::default()
            }],
            Vec::new(),
        )
        .unwrap();

        let dump = directory_dump(&directory);
        assert!(dump.contains("Usada Pekora |"));
        assert!(dump.contains("페코라"));
        assert!(dump.contains("UC_pekora"));

        let prompt = system_prompt(&directory);
        assert!(prompt.contains("alarm_add"));
        assert!(prompt.contains(&dump));
    }

    #[test]
    fn sanitize_strips_controls_collapses_and_clips() {
        assert_eq!(sanitize("  live\u{0} \t now\r\n please "), "live now please");

        let long = "a".repeat(2 * MAX_QUERY_CHARS);
        assert_eq!(sanitize(&long).chars().count(), MAX_QUERY_CHARS);
    }

    #[test]
    fn single_intent_object_parses() {
        let value = json!({
            "command": "alarm_add",
            "params": { "member": "pekora" },
            "confidence": 0.93,
            "reasoning": "wants an alarm"
        });

        let intents = parse_intent_response(&value);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].command, CommandKind::AlarmAdd);
        assert_eq!(intents[0].member.as_deref(), Some("pekora"));
    }

    #[test]
    fn multi_step_arrays_parse_in_order() {
        let value = json!([
            { "command": "live", "confidence": 0.9 },
            { "command": "upcoming", "params": { "hours": 12 }, "confidence": 0.8 },
        ]);

        let intents = parse_intent_response(&value);
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].command, CommandKind::Live);
        assert_eq!(intents[1].hours, Some(12));
    }

    #[test]
    fn unknown_commands_degrade_instead_of_failing() {
        let value = json!({ "command": "summon_meteor", "confidence": 0.9 });

        let intents = parse_intent_response(&value);
        assert_eq!(intents[0].command, CommandKind::Unknown);

        // Non-object entries are dropped, the rest survive.
        let value = json!([42, { "command": "help", "confidence": 1.0 }]);
        let intents = parse_intent_response(&value);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].command, CommandKind::Help);
    }

    #[test]
    fn selection_gate_enforces_confidence_and_range() {
        let select = |index: i64, confidence: f32| Selection {
            selected_index: index,
            confidence,
            reasoning: String::new(),
        };

        assert_eq!(gate_selection(&select(1, 0.9), 3), Some(1));
        assert_eq!(gate_selection(&select(1, 0.55), 3), None);
        assert_eq!(gate_selection(&select(-1, 0.99), 3), None);
        assert_eq!(gate_selection(&select(3, 0.99), 3), None);
    }
}
