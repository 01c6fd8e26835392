//! Multi-tier member profile lookup.
//!
//! Reads go in-process map → KV → durable store, writing back through
//! the upper two tiers on the way out. A startup warm-up loads every
//! member into tiers one and two so command replies rarely touch the
//! relational store at all.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tracing::{info, instrument, warn};

use apis::{
    database::{MemberProfile, MemberRecord, MemberStore},
    errors::Error,
    kv::KvStore,
};
use utility::members::MemberDirectory;

pub const PROFILE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[must_use]
pub fn member_kv_key(slug: &str) -> String {
    format!("member:{slug}")
}

#[must_use]
pub fn profile_kv_key(member_id: i64, language: &str) -> String {
    format!("member_profile:{member_id}:{language}")
}

pub struct ProfileCache {
    local: DashMap<String, MemberRecord>,
    channel_index: DashMap<String, String>,
    name_index: DashMap<String, String>,
    alias_index: DashMap<String, String>,
    kv: KvStore,
    store: Option<Arc<MemberStore>>,
}

impl ProfileCache {
    #[must_use]
    pub fn new(kv: KvStore, store: Option<Arc<MemberStore>>) -> Self {
        Self {
            local: DashMap::new(),
            channel_index: DashMap::new(),
            name_index: DashMap::new(),
            alias_index: DashMap::new(),
            kv,
            store,
        }
    }

    /// Loads every member into tiers one and two. Returns how many were
    /// loaded; zero when no durable store is configured.
    #[instrument(skip(self))]
    pub async fn warm_up(&self) -> Result<usize, Error> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let records = store.fetch_all_members().await?;
        let count = records.len();

        for record in records {
            self.write_through(&record).await;
        }

        info!(count, "Profile cache warmed up.");
        Ok(count)
    }

    pub async fn by_slug(&self, slug: &str) -> Result<Option<MemberRecord>, Error> {
        if let Some(record) = self.local.get(slug) {
            return Ok(Some(record.clone()));
        }

        match self.kv.get::<MemberRecord>(&member_kv_key(slug)).await {
            Ok(Some(record)) => {
                self.index(&record);
                return Ok(Some(record));
            }
            Ok(None) => {}
            Err(e) => warn!(%slug, error = %e, "Profile KV read failed."),
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };

        match store.find_by_slug(slug).await? {
            Some(record) => {
                self.write_through(&record).await;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn by_channel_id(&self, channel_id: &str) -> Result<Option<MemberRecord>, Error> {
        if let Some(slug) = self.channel_index.get(channel_id) {
            let slug = slug.clone();
            return self.by_slug(&slug).await;
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };

        match store.find_by_channel_id(channel_id).await? {
            Some(record) => {
                self.write_through(&record).await;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub async fn by_name(&self, name: &str) -> Result<Option<MemberRecord>, Error> {
        if let Some(slug) = self.name_index.get(&MemberDirectory::normalize(name)) {
            let slug = slug.clone();
            return self.by_slug(&slug).await;
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };

        match store.find_by_name(name).await? {
            Some(record) => {
                self.write_through(&record).await;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Alias lookups are served from the in-process index only; it is
    /// populated by warm-up and by every record passing through.
    pub async fn by_alias(&self, alias: &str) -> Result<Option<MemberRecord>, Error> {
        let key = MemberDirectory::normalize_key(alias);

        let Some(slug) = self.alias_index.get(&key) else {
            return Ok(None);
        };

        let slug = slug.clone();
        self.by_slug(&slug).await
    }

    /// Localized profile, cached in the KV tier.
    pub async fn profile(
        &self,
        member_id: i64,
        language: &str,
    ) -> Result<Option<MemberProfile>, Error> {
        let key = profile_kv_key(member_id, language);

        match self.kv.get::<MemberProfile>(&key).await {
            Ok(Some(profile)) => return Ok(Some(profile)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Profile KV read failed."),
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };

        match store.profile(member_id, language).await? {
            Some(profile) => {
                if let Err(e) = self.kv.set(&key, &profile, Some(PROFILE_CACHE_TTL)).await {
                    warn!(error = %e, "Profile KV write failed.");
                }

                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    /// Drops tiers one and two entirely. The durable store is the
    /// source of truth and is left alone.
    #[instrument(skip(self))]
    pub async fn invalidate_all(&self) -> Result<usize, Error> {
        self.local.clear();
        self.channel_index.clear();
        self.name_index.clear();
        self.alias_index.clear();

        let keys = self.kv.keys("member:*").await?;
        let count = keys.len();

        for key in keys {
            if let Err(e) = self.kv.del(&key).await {
                warn!(%key, error = %e, "Cache invalidation delete failed.");
            }
        }

        info!(count, "Profile cache invalidated.");
        Ok(count)
    }

    async fn write_through(&self, record: &MemberRecord) {
        self.index(record);

        if let Err(e) = self
            .kv
            .set(
                &member_kv_key(&record.slug),
                record,
                Some(PROFILE_CACHE_TTL),
            )
            .await
        {
            warn!(slug = %record.slug, error = %e, "Profile KV write failed.");
        }
    }

    fn index(&self, record: &MemberRecord) {
        if let Some(channel_id) = &record.channel_id {
            self.channel_index
                .insert(channel_id.clone(), record.slug.clone());
        }

        for name in [
            record.english_name.as_deref(),
            record.japanese_name.as_deref(),
            record.korean_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            self.name_index
                .insert(MemberDirectory::normalize(name), record.slug.clone());
        }

        for alias in record.alias_strings() {
            self.alias_index
                .insert(MemberDirectory::normalize_key(&alias), record.slug.clone());
        }

        self.local.insert(record.slug.clone(), record.clone());
    }
}
