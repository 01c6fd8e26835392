use std::{fs, io::ErrorKind, path::Path, sync::Arc};

use anyhow::{bail, Context};
use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{error, instrument, warn};

use crate::members::Member;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub primary_api: PrimaryApiConfig,

    #[serde(default)]
    pub secondary_api: SecondaryApiConfig,

    #[serde(default)]
    pub kv: KvConfig,

    #[serde(default)]
    pub durable: DurableConfig,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub notification: NotificationConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(skip)]
    pub members: Vec<Member>,
}

impl Config {
    #[instrument]
    pub fn load(folder: &Path) -> anyhow::Result<Arc<Self>> {
        let config_path = folder.join("config.toml");
        let members_path = folder.join("members.toml");

        let mut config: Config = match load_toml_or_write_default(&config_path) {
            Ok(c) => c,
            Err(e) => {
                error!(?e, "Failed to open config file!");
                return Err(e);
            }
        };

        let members: MemberFile = match load_toml_or_write_default(&members_path) {
            Ok(m) => m,
            Err(e) => {
                error!(?e, "Failed to open members file!");
                return Err(e);
            }
        };
        config.members = members.members;

        config.validate()?;

        Ok(Arc::new(config))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.primary_api.keys.is_empty() {
            bail!("no primary API keys configured");
        }

        if self.notification.advance_minutes.is_empty() {
            bail!("notification.advance_minutes must not be empty");
        }

        if self
            .notification
            .advance_minutes
            .iter()
            .any(|&m| !(1..=120).contains(&m))
        {
            bail!("notification.advance_minutes entries must be within 1..=120");
        }

        if self.secondary_api.enabled && self.secondary_api.key.is_empty() {
            bail!("secondary API enabled without a key");
        }

        if self.ai.fallback.enabled && self.ai.fallback.api_key.is_empty() {
            bail!("AI fallback enabled without a key");
        }

        Ok(())
    }
}

/// Reads a TOML file into `T`. A missing file is not an error: the
/// defaults are written out for the operator to fill in and returned,
/// with a warning. Anything else — unreadable file, malformed TOML —
/// is fatal to startup.
fn load_toml_or_write_default<T>(path: &Path) -> anyhow::Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    match fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text)
            .with_context(|| format!("malformed config file at {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let defaults = T::default();
            let rendered = toml::to_string_pretty(&defaults)
                .context("default configuration failed to render")?;

            fs::write(path, rendered)
                .with_context(|| format!("could not write defaults to {}", path.display()))?;

            warn!(
                "Config file not found! Creating a default file at {}.",
                path.display()
            );

            Ok(defaults)
        }
        Err(e) => {
            Err(e).with_context(|| format!("could not open config file at {}", path.display()))
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub(crate) struct MemberFile {
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatConfig {
    pub prefix: String,
    /// Rooms the bot responds in. Empty means every room.
    pub rooms: Vec<String>,
    pub keywords: CommandKeywords,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            prefix: "!".to_owned(),
            rooms: Vec::new(),
            keywords: CommandKeywords::default(),
        }
    }
}

/// Recognized keyword variants per command, Korean and English mixed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandKeywords {
    pub live: Vec<String>,
    pub upcoming: Vec<String>,
    pub schedule: Vec<String>,
    pub member_info: Vec<String>,
    pub alarm: Vec<String>,
    pub alarm_add: Vec<String>,
    pub alarm_remove: Vec<String>,
    pub alarm_list: Vec<String>,
    pub alarm_clear: Vec<String>,
    pub help: Vec<String>,
}

fn keywords(words: &[&str]) -> Vec<String> {
    words.iter().map(|&w| w.to_owned()).collect()
}

impl Default for CommandKeywords {
    fn default() -> Self {
        Self {
            live: keywords(&["live", "라이브", "생방송", "방송"]),
            upcoming: keywords(&["upcoming", "예정", "예정방송"]),
            schedule: keywords(&["schedule", "스케줄", "일정"]),
            member_info: keywords(&["who", "info", "멤버", "누구"]),
            alarm: keywords(&["alarm", "알람", "알림"]),
            alarm_add: keywords(&["add", "추가", "등록"]),
            alarm_remove: keywords(&["remove", "delete", "삭제", "제거", "해제"]),
            alarm_list: keywords(&["list", "목록"]),
            alarm_clear: keywords(&["clear", "전체삭제", "초기화"]),
            help: keywords(&["help", "도움말", "도움"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrimaryApiConfig {
    pub keys: Vec<String>,
    pub base_url: String,
    /// Only channels belonging to this organization pass the filter.
    pub org: String,
    /// Case-insensitive substrings matched against suborg and channel
    /// names; matching channels are filtered out.
    pub exclude: Vec<String>,
}

impl Default for PrimaryApiConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            base_url: "https://holodex.net/api/v2".to_owned(),
            org: "Hololive".to_owned(),
            exclude: keywords(&["holostars", "uproar"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecondaryApiConfig {
    pub key: String,
    pub enabled: bool,
    pub daily_quota: u32,
    pub safety_margin: u32,
    pub concurrency: usize,
}

impl Default for SecondaryApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            enabled: false,
            daily_quota: 10_000,
            safety_margin: 2_000,
            concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: u8,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 6379,
            password: String::new(),
            db: 0,
        }
    }
}

impl KvConfig {
    /// Empty host selects the in-process backend.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !self.host.is_empty()
    }

    #[must_use]
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DurableConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            db: String::new(),
        }
    }
}

impl DurableConfig {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.db.is_empty()
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.db
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AiConfig {
    pub primary: AiPrimaryConfig,
    pub fallback: AiFallbackConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AiPrimaryConfig {
    pub api_key: String,
    pub default_model: String,
}

impl Default for AiPrimaryConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            default_model: "gemini-2.0-flash".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AiFallbackConfig {
    pub api_key: String,
    pub enabled: bool,
    pub model: String,
}

impl Default for AiFallbackConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            enabled: false,
            model: "gpt-4o-mini".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Lead-times in minutes; the head is the primary alert distance.
    pub advance_minutes: Vec<i64>,
    pub check_interval_secs: u64,
    /// Concurrent channel probes per scheduler tick.
    pub concurrency: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            advance_minutes: vec![5],
            check_interval_secs: 60,
            concurrency: 15,
        }
    }
}

impl NotificationConfig {
    /// The fallback chain of lead-times: the configured minutes plus two
    /// derived retry chances from the primary, deduplicated, descending.
    /// `[5]` becomes `[5, 3, 1]`.
    #[must_use]
    pub fn target_minutes(&self) -> Vec<i64> {
        let primary = self.advance_minutes.first().copied().unwrap_or(5);

        self.advance_minutes
            .iter()
            .copied()
            .chain([std::cmp::max(1, primary - 2), 1])
            .unique()
            .sorted_by_key(|&m| std::cmp::Reverse(m))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Honorific/affectionate suffixes stripped during normalization.
    pub honorific_suffixes: Vec<String>,
    pub memo_ttl_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            honorific_suffixes: keywords(&[
                "쨩", "짱", "땅", "찡", "님", "양", "씨", "ちゃん", "さん", "くん", "様", "たん",
            ]),
            memo_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Directory receiving the daily-rolled log file. Empty disables
    /// file output.
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            file: "logs".to_owned(),
        }
    }
}
