//! Command parsing and dispatch.
//!
//! A room message either carries the configured prefix and a known
//! keyword (Korean or English), or gets handed to the NL intent parser.
//! Multi-step intents execute sequentially and halt on the first hard
//! error. Failures always surface as text to the originating room.

mod alarm;
mod help;
mod live;
mod member_info;
mod schedule;
mod upcoming;

use std::sync::Arc;

use tracing::{error, instrument, warn};

use apis::{errors::Error, kv::KvStore, schedule_service::ScheduleService};
use utility::config::{CommandKeywords, Config};

use crate::{
    format,
    nl_parser::{sanitize, CommandKind, NlParser, ParsedIntent, MIN_CONFIDENCE},
    profile_cache::ProfileCache,
    resolver::MemberResolver,
    subscriptions::SubscriptionRegistry,
    transport::IncomingMessage,
};

pub const MIN_HOURS: i64 = 1;
pub const MAX_HOURS: i64 = 168;
pub const MIN_DAYS: i64 = 1;
pub const MAX_DAYS: i64 = 30;

const DEFAULT_UPCOMING_HOURS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Live,
    Upcoming { hours: u32 },
    Schedule { member: String },
    MemberInfo { member: String },
    AlarmAdd { member: String },
    AlarmRemove { member: String },
    AlarmList,
    AlarmClear,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not addressed to the bot at all.
    NotForUs,
    Command(Command),
    /// Prefixed, but the keyword is not one of ours; candidate for the
    /// NL parser.
    Unrecognized(String),
}

#[must_use]
pub fn clamp_hours(hours: i64) -> u32 {
    u32::try_from(hours.clamp(MIN_HOURS, MAX_HOURS)).unwrap_or(1)
}

#[must_use]
pub fn clamp_days(days: i64) -> u32 {
    u32::try_from(days.clamp(MIN_DAYS, MAX_DAYS)).unwrap_or(1)
}

fn keyword_in(list: &[String], token: &str) -> bool {
    list.iter().any(|k| k.to_lowercase() == token)
}

/// Splits a prefixed message into a command. The keyword sets per
/// command come from configuration.
#[must_use]
pub fn parse_command(keywords: &CommandKeywords, prefix: &str, text: &str) -> ParseOutcome {
    let Some(stripped) = text.trim_start().strip_prefix(prefix) else {
        return ParseOutcome::NotForUs;
    };

    let stripped = stripped.trim();
    let mut tokens = stripped.split_whitespace();

    let Some(keyword) = tokens.next() else {
        return ParseOutcome::NotForUs;
    };

    let token = keyword.to_lowercase();

    if keyword_in(&keywords.live, &token) {
        return ParseOutcome::Command(Command::Live);
    }

    if keyword_in(&keywords.upcoming, &token) {
        let hours = tokens
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .map_or(DEFAULT_UPCOMING_HOURS, clamp_hours);

        return ParseOutcome::Command(Command::Upcoming { hours });
    }

    if keyword_in(&keywords.schedule, &token) {
        return ParseOutcome::Command(Command::Schedule {
            member: tokens.collect::<Vec<_>>().join(" "),
        });
    }

    if keyword_in(&keywords.member_info, &token) {
        return ParseOutcome::Command(Command::MemberInfo {
            member: tokens.collect::<Vec<_>>().join(" "),
        });
    }

    if keyword_in(&keywords.help, &token) {
        return ParseOutcome::Command(Command::Help);
    }

    if keyword_in(&keywords.alarm, &token) {
        let Some(sub) = tokens.next() else {
            return ParseOutcome::Command(Command::AlarmList);
        };

        let sub_token = sub.to_lowercase();
        let member = tokens.collect::<Vec<_>>().join(" ");

        if keyword_in(&keywords.alarm_add, &sub_token) {
            return ParseOutcome::Command(Command::AlarmAdd { member });
        }
        if keyword_in(&keywords.alarm_remove, &sub_token) {
            return ParseOutcome::Command(Command::AlarmRemove { member });
        }
        if keyword_in(&keywords.alarm_list, &sub_token) {
            return ParseOutcome::Command(Command::AlarmList);
        }
        if keyword_in(&keywords.alarm_clear, &sub_token) {
            return ParseOutcome::Command(Command::AlarmClear);
        }

        return ParseOutcome::Unrecognized(stripped.to_owned());
    }

    ParseOutcome::Unrecognized(stripped.to_owned())
}

/// Maps a parsed NL intent onto a command; `None` for unknown intents
/// and intents missing their member parameter.
#[must_use]
pub fn command_from_intent(intent: &ParsedIntent) -> Option<Command> {
    let member = || intent.member.clone().filter(|m| !m.trim().is_empty());

    match intent.command {
        CommandKind::Live => Some(Command::Live),
        CommandKind::Upcoming => {
            let hours = intent
                .hours
                .map(clamp_hours)
                .or_else(|| intent.days.map(|d| clamp_days(d) * 24))
                .unwrap_or(DEFAULT_UPCOMING_HOURS);

            Some(Command::Upcoming {
                hours: hours.min(u32::try_from(MAX_HOURS).unwrap_or(168)),
            })
        }
        CommandKind::Schedule => Some(Command::Schedule { member: member()? }),
        CommandKind::MemberInfo => Some(Command::MemberInfo { member: member()? }),
        CommandKind::AlarmAdd => Some(Command::AlarmAdd { member: member()? }),
        CommandKind::AlarmRemove => Some(Command::AlarmRemove { member: member()? }),
        CommandKind::AlarmList => Some(Command::AlarmList),
        CommandKind::Help => Some(Command::Help),
        CommandKind::Unknown => None,
    }
}

/// Shared handler dependencies.
pub struct CommandContext {
    pub registry: SubscriptionRegistry,
    pub resolver: Arc<MemberResolver>,
    pub schedule: Arc<ScheduleService>,
    pub profiles: Arc<ProfileCache>,
    pub kv: KvStore,
}

pub struct CommandPipeline {
    config: Arc<Config>,
    ctx: CommandContext,
    nl: Option<Arc<NlParser>>,
}

impl CommandPipeline {
    #[must_use]
    pub fn new(config: Arc<Config>, ctx: CommandContext, nl: Option<Arc<NlParser>>) -> Self {
        Self { config, ctx, nl }
    }

    /// Turns one incoming message into at most one reply.
    #[instrument(skip(self, message), fields(room = %message.room_id))]
    pub async fn handle(&self, message: &IncomingMessage) -> Option<String> {
        let _ = message;
        None
        /*
        let rooms = &self.config.chat.rooms;

        if !rooms.is_empty() && !rooms.contains(&message.room_id) {
            return None;
        }

        match parse_command(
            &self.config.chat.keywords,
            &self.config.chat.prefix,
            &message.text,
        ) {
            ParseOutcome::NotForUs => None,
            ParseOutcome::Command(command) => Some(self.execute(message, command).await),
            ParseOutcome::Unrecognized(text) => {
                if sanitize(&text).is_empty() {
                    return None;
                }

                match &self.nl {
                    Some(nl) => Some(self.execute_inferred(message, Arc::clone(nl), &text).await),
                    None => Some(help::text(&self.config.chat.prefix)),
                }
            }
        }
        */
    }

    async fn execute(&self, message: &IncomingMessage, command: Command) -> String {
        match self.run(message, command).await {
            Ok(reply) => reply,
            Err(e) => error_reply(&e),
        }
    }

    async fn run(&self, message: &IncomingMessage, command: Command) -> Result<String, Error> {
        match command {
            Command::Live => live::run(&self.ctx).await,
            Command::Upcoming { hours } => upcoming::run(&self.ctx, hours).await,
            Command::Schedule { member } => schedule::run(&self.ctx, &member).await,
            Command::MemberInfo { member } => member_info::run(&self.ctx, &member).await,
            Command::AlarmAdd { member } => {
                alarm::add(&self.ctx, &message.room_id, &message.sender_id, &member).await
            }
            Command::AlarmRemove { member } => {
                alarm::remove(&self.ctx, &message.room_id, &message.sender_id, &member).await
            }
            Command::AlarmList => {
                alarm::list(&self.ctx, &message.room_id, &message.sender_id).await
            }
            Command::AlarmClear => {
                alarm::clear(&self.ctx, &message.room_id, &message.sender_id).await
            }
            Command::Help => Ok(help::text(&self.config.chat.prefix)),
        }
    }

    /// Runs intents inferred by the NL parser, sequentially, halting on
    /// the first hard error.
    async fn execute_inferred(
        &self,
        message: &IncomingMessage,
        nl: Arc<NlParser>,
        text: &str,
    ) -> String {
        let intents = match nl.parse_intent(text).await {
            Ok(intents) => intents,
            Err(e) => return error_reply(&e),
        };

        let mut replies = Vec::new();

        for intent in &intents {
            if intent.confidence < MIN_CONFIDENCE {
                warn!(
                    confidence = intent.confidence,
                    reasoning = %intent.reasoning,
                    "Low-confidence intent skipped."
                );
                continue;
            }

            let Some(command) = command_from_intent(intent) else {
                continue;
            };

            match self.run(message, command).await {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    replies.push(error_reply(&e));
                    break;
                }
            }
        }

        if replies.is_empty() {
            return format!(
                "Sorry, I did not understand that. {}",
                help::hint(&self.config.chat.prefix)
            );
        }

        replies.join("\n\n")
    }
}

fn error_reply(error: &Error) -> String {
    match error {
        Error::CircuitOpen { next_retry } => format::degraded(*next_retry),
        Error::Validation { field, value } => {
            if value.is_empty() {
                format!("Missing {field}.")
            } else {
                format!("Invalid {field}: {value}")
            }
        }
        other => {
            error!(error = %other, "Command failed.");
            "Something went wrong. Please try again later.".to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords() -> CommandKeywords {
        CommandKeywords::default()
    }

    #[test]
    fn unprefixed_messages_are_ignored() {
        assert_eq!(
            parse_command(&keywords(), "!", "hello there"),
            ParseOutcome::NotForUs
        );
        assert_eq!(parse_command(&keywords(), "!", "!"), ParseOutcome::NotForUs);
    }

    #[test]
    fn english_and_korean_keywords_both_parse() {
        assert_eq!(
            parse_command(&keywords(), "!", "!live"),
            ParseOutcome::Command(Command::Live)
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!라이브"),
            ParseOutcome::Command(Command::Live)
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!스케줄 페코라"),
            ParseOutcome::Command(Command::Schedule {
                member: "페코라".into()
            })
        );
    }

    #[test]
    fn upcoming_hours_parse_and_clamp() {
        assert_eq!(
            parse_command(&keywords(), "!", "!upcoming"),
            ParseOutcome::Command(Command::Upcoming { hours: 24 })
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!upcoming 12"),
            ParseOutcome::Command(Command::Upcoming { hours: 12 })
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!upcoming 9999"),
            ParseOutcome::Command(Command::Upcoming { hours: 168 })
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!upcoming -5"),
            ParseOutcome::Command(Command::Upcoming { hours: 1 })
        );
    }

    #[test]
    fn alarm_subcommands_parse() {
        assert_eq!(
            parse_command(&keywords(), "!", "!alarm add pekora"),
            ParseOutcome::Command(Command::AlarmAdd {
                member: "pekora".into()
            })
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!알람 추가 페코라"),
            ParseOutcome::Command(Command::AlarmAdd {
                member: "페코라".into()
            })
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!alarm remove usada pekora"),
            ParseOutcome::Command(Command::AlarmRemove {
                member: "usada pekora".into()
            })
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!alarm"),
            ParseOutcome::Command(Command::AlarmList)
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!alarm list"),
            ParseOutcome::Command(Command::AlarmList)
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!alarm clear"),
            ParseOutcome::Command(Command::AlarmClear)
        );
    }

    #[test]
    fn unknown_keywords_fall_through_to_the_nl_parser() {
        assert_eq!(
            parse_command(&keywords(), "!", "!when is pekora streaming"),
            ParseOutcome::Unrecognized("when is pekora streaming".into())
        );
        assert_eq!(
            parse_command(&keywords(), "!", "!alarm banana pekora"),
            ParseOutcome::Unrecognized("alarm banana pekora".into())
        );
    }

    #[test]
    fn intents_map_to_commands_with_clamps() {
        let intent = |command, member: Option<&str>, hours, days| ParsedIntent {
            command,
            member: member.map(str::to_owned),
            hours,
            days,
            confidence: 0.9,
            reasoning: String::new(),
        };

        assert_eq!(
            command_from_intent(&intent(CommandKind::Live, None, None, None)),
            Some(Command::Live)
        );
        assert_eq!(
            command_from_intent(&intent(CommandKind::Upcoming, None, Some(500), None)),
            Some(Command::Upcoming { hours: 168 })
        );
        assert_eq!(
            command_from_intent(&intent(CommandKind::Upcoming, None, None, Some(2))),
            Some(Command::Upcoming { hours: 48 })
        );
        assert_eq!(
            command_from_intent(&intent(CommandKind::AlarmAdd, Some("pekora"), None, None)),
            Some(Command::AlarmAdd {
                member: "pekora".into()
            })
        );

        // A member-taking intent without a member cannot run.
        assert_eq!(
            command_from_intent(&intent(CommandKind::AlarmAdd, None, None, None)),
            None
        );
        assert_eq!(
            command_from_intent(&intent(CommandKind::Unknown, None, None, None)),
            None
        );
    }

    #[test]
    fn day_counts_cap_at_the_hour_ceiling() {
        let intent = ParsedIntent {
            command: CommandKind::Upcoming,
            member: None,
            hours: None,
            days: Some(30),
            confidence: 0.9,
            reasoning: String::new(),
        };

        assert_eq!(
            command_from_intent(&intent),
            Some(Command::Upcoming { hours: 168 })
        );
    }
}
