//! Free-text member resolution.
//!
//! Seven strategies are tried in order; the first producing a candidate
//! wins: exact alias, exact dynamic-map entry, canonical-name substring,
//! dynamic-map substring, alias substring, remote channel search, and an
//! AI tie-break when the remote search is ambiguous. The winning
//! candidate is hydrated through the schedule service; hydration failure
//! degrades to a skeletal channel, never to absent.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strum::Display;
use tracing::{debug, instrument, warn};

use apis::{errors::Error, kv::KvStore, schedule_service::ScheduleService};
use utility::{members::MemberDirectory, streams::Channel};

/// KV hash of dynamically registered members: display name → channel id.
pub const DYNAMIC_MEMBERS_KEY: &str = "members:dynamic";

/// Substring strategies ignore queries shorter than this many chars.
const MIN_SUBSTRING_QUERY: usize = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionSource {
    AliasExact,
    DynamicExact,
    NameSubstring,
    DynamicSubstring,
    AliasSubstring,
    RemoteSearch,
    AiSelection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCandidate {
    pub channel_id: String,
    pub display_name: String,
    pub source: ResolutionSource,
}

/// Remote lookup surface the resolver needs from the schedule layer.
#[async_trait]
pub trait RemoteSearch: Send + Sync {
    async fn search_channels(&self, query: &str) -> Result<Vec<Channel>, Error>;
    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, Error>;
}

#[async_trait]
impl RemoteSearch for ScheduleService {
    async fn search_channels(&self, query: &str) -> Result<Vec<Channel>, Error> {
        Self::search_channels(self, query).await
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>, Error> {
        Self::get_channel(self, channel_id).await
    }
}

/// Picks one channel out of an ambiguous candidate list, or none when
/// not confident enough.
#[async_trait]
pub trait ChannelSelector: Send + Sync {
    async fn select_channel(
        &self,
        query: &str,
        candidates: &[Channel],
    ) -> Result<Option<usize>, Error>;
}

struct MemoEntry {
    candidate: Option<ResolvedCandidate>,
    expires_at: DateTime<Utc>,
}

pub struct MemberResolver {
    directory: Arc<MemberDirectory>,
    kv: KvStore,
    remote: Arc<dyn RemoteSearch>,
    selector: Option<Arc<dyn ChannelSelector>>,
    memo_ttl: Duration,
    memo: RwLock<HashMap<String, MemoEntry>>,
    last_cleanup: Mutex<DateTime<Utc>>,
}

impl MemberResolver {
    #[must_use]
    pub fn new(
        directory: Arc<MemberDirectory>,
        kv: KvStore,
        remote: Arc<dyn RemoteSearch>,
        selector: Option<Arc<dyn ChannelSelector>>,
        memo_ttl: Duration,
    ) -> Self {
        Self {
            directory,
            kv,
            remote,
            selector,
            memo_ttl,
            memo: RwLock::new(HashMap::new()),
            last_cleanup: Mutex::new(Utc::now()),
        }
    }

    /// Resolves free text into a hydrated channel, or absent when no
    /// strategy produced a confident candidate.
    #[instrument(skip(self))]
    pub async fn resolve(&self, query: &str) -> Result<Option<Channel>, Error> {
        let memo_key = self.directory.normalize_suffix(query);

        if memo_key.is_empty() {
            return Ok(None);
        }

        if let Some(candidate) = self.memo_lookup(&memo_key) {
            return match candidate {
                Some(candidate) => Ok(Some(self.hydrate(candidate).await)),
                None => Ok(None),
            };
        }

        let candidate = self.find_candidate(query).await?;
        self.memo_insert(memo_key, candidate.clone());
        self.maybe_cleanup();

        match candidate {
            Some(candidate) => {
                debug!(source = %candidate.source, channel = %candidate.channel_id, "Resolved.");
                Ok(Some(self.hydrate(candidate).await))
            }
            None => Ok(None),
        }
    }

    async fn find_candidate(&self, query: &str) -> Result<Option<ResolvedCandidate>, Error> {
        let dynamic = match self.kv.hgetall(DYNAMIC_MEMBERS_KEY).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "Dynamic member map unavailable.");
                HashMap::new()
            }
        };

        if let Some(candidate) = resolve_static(&self.directory, &dynamic, query) {
            return Ok(Some(candidate));
        }

        let candidates = match self.remote.search_channels(query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Remote channel search failed.");
                return Ok(None);
            }
        };

        match candidates.len() {
            0 => Ok(None),
            1 => {
                let only = &candidates[0];

                Ok(Some(ResolvedCandidate {
                    channel_id: only.id.clone(),
                    display_name: only.display_name().to_owned(),
                    source: ResolutionSource::RemoteSearch,
                }))
            }
            _ => self.tie_break(query, &candidates).await,
        }
    }

    async fn tie_break(
        &self,
        query: &str,
        candidates: &[Channel],
    ) -> Result<Option<ResolvedCandidate>, Error> {
        let Some(selector) = &self.selector else {
            debug!("Ambiguous result and no selector available.");
            return Ok(None);
        };

        let selected = match selector.select_channel(query, candidates).await {
            Ok(selected) => selected,
            Err(e) => {
                warn!(error = %e, "Channel selection failed.");
                None
            }
        };

        Ok(selected.and_then(|index| candidates.get(index)).map(|channel| {
            ResolvedCandidate {
                channel_id: channel.id.clone(),
                display_name: channel.display_name().to_owned(),
                source: ResolutionSource::AiSelection,
            }
        }))
    }

    /// Fills in the full channel record; a failed or empty lookup keeps
    /// the resolution result with a skeletal channel.
    async fn hydrate(&self, candidate: ResolvedCandidate) -> Channel {
        match self.remote.get_channel(&candidate.channel_id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => Channel::skeletal(candidate.channel_id, candidate.display_name),
            Err(e) => {
                warn!(channel = %candidate.channel_id, error = %e, "Hydration failed.");
                Channel::skeletal(candidate.channel_id, candidate.display_name)
            }
        }
    }

    fn memo_lookup(&self, key: &str) -> Option<Option<ResolvedCandidate>> {
        let memo = self.memo.read().unwrap();
        let entry = memo.get(key)?;

        (Utc::now() < entry.expires_at).then(|| entry.candidate.clone())
    }

    fn memo_insert(&self, key: String, candidate: Option<ResolvedCandidate>) {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.memo_ttl).unwrap_or_else(|_| {
                chrono::Duration::seconds(60)
            });

        self.memo
            .write()
            .unwrap()
            .insert(key, MemoEntry {
                candidate,
                expires_at,
            });
    }

    /// Drops expired memo entries, at most once per TTL period.
    fn maybe_cleanup(&self) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.memo_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        {
            let mut last = self.last_cleanup.lock().unwrap();

            if now - *last < ttl {
                return;
            }

            *last = now;
        }

        self.memo
            .write()
            .unwrap()
            .retain(|_, entry| now < entry.expires_at);
    }
}

/// Strategies 1 through 5, in order, over the static directory and the
/// dynamic member map.
#[must_use]
pub fn resolve_static(
    directory: &MemberDirectory,
    dynamic: &HashMap<String, String>,
    query: &str,
) -> Option<ResolvedCandidate> {
    // 1. Exact alias.
    if let Some(member) = directory.find_by_alias(query) {
        return Some(ResolvedCandidate {
            channel_id: member.channel_id.clone(),
            display_name: member.name.clone(),
            source: ResolutionSource::AliasExact,
        });
    }

    let normalized = MemberDirectory::normalize(query);

    // 2. Exact dynamic-map entry.
    let mut dynamic_sorted: Vec<(&String, &String)> = dynamic.iter().collect();
    dynamic_sorted.sort();

    for (name, channel_id) in &dynamic_sorted {
        if MemberDirectory::normalize(name) == normalized {
            return Some(ResolvedCandidate {
                channel_id: (*channel_id).clone(),
                display_name: (*name).clone(),
                source: ResolutionSource::DynamicExact,
            });
        }
    }

    let key = MemberDirectory::normalize_key(query);

    if key.chars().count() < MIN_SUBSTRING_QUERY {
        return None;
    }

    let matches = |other: &str| -> bool {
        let other = MemberDirectory::normalize_key(other);
        !other.is_empty() && (other.contains(&key) || key.contains(&other))
    };

    // 3. Canonical-name substring, both directions.
    for member in directory.get_all_members() {
        if matches(&member.name) {
            return Some(ResolvedCandidate {
                channel_id: member.channel_id.clone(),
                display_name: member.name.clone(),
                source: ResolutionSource::NameSubstring,
            });
        }
    }

    // 4. Dynamic-map substring.
    for (name, channel_id) in &dynamic_sorted {
        if matches(name) {
            return Some(ResolvedCandidate {
                channel_id: (*channel_id).clone(),
                display_name: (*name).clone(),
                source: ResolutionSource::DynamicSubstring,
            });
        }
    }

    // 5. Alias substring over every language.
    let mut aliases: Vec<(&str, &str)> = directory.aliases().collect();
    aliases.sort();

    for (alias, canonical) in aliases {
        if matches(alias) {
            let member = directory.find_by_name(canonical)?;

            return Some(ResolvedCandidate {
                channel_id: member.channel_id.clone(),
                display_name: member.name.clone(),
                source: ResolutionSource::AliasSubstring,
            });
        }
    }

    None
}
