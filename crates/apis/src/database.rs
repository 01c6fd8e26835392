//! Durable member records in the relational store.
//!
//! The KV store holds all transient state; this is the source of truth
//! behind the profile cache's bottom tier.

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;

use utility::config::DurableConfig;

use crate::errors::Error;

const MEMBERS_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS members (
    id              BIGSERIAL PRIMARY KEY,
    slug            TEXT NOT NULL UNIQUE,
    channel_id      TEXT UNIQUE,
    english_name    TEXT,
    japanese_name   TEXT,
    korean_name     TEXT,
    status          TEXT,
    is_graduated    BOOLEAN NOT NULL DEFAULT FALSE,
    official_link   TEXT,
    aliases         JSONB NOT NULL DEFAULT '[]'::jsonb
)";

const PROFILES_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS member_profiles (
    member_id       BIGINT NOT NULL REFERENCES members (id),
    language        TEXT NOT NULL,
    display_name    TEXT,
    catchphrase     TEXT,
    description     TEXT,
    highlights      JSONB NOT NULL DEFAULT '[]'::jsonb,
    profile_data    JSONB NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (member_id, language)
)";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MemberRecord {
    pub id: i64,
    pub slug: String,
    pub channel_id: Option<String>,
    pub english_name: Option<String>,
    pub japanese_name: Option<String>,
    pub korean_name: Option<String>,
    pub status: Option<String>,
    pub is_graduated: bool,
    pub official_link: Option<String>,
    pub aliases: serde_json::Value,
}

impl MemberRecord {
    /// Aliases as plain strings, whatever shape the column holds.
    #[must_use]
    pub fn alias_strings(&self) -> Vec<String> {
        match &self.aliases {
            serde_json::Value::Array(values) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MemberProfile {
    pub member_id: i64,
    pub language: String,
    pub display_name: Option<String>,
    pub catchphrase: Option<String>,
    pub description: Option<String>,
    pub highlights: serde_json::Value,
    pub profile_data: serde_json::Value,
}

pub struct MemberStore {
    pool: PgPool,
}

impl MemberStore {
    #[instrument(skip(config))]
    pub async fn connect(config: &DurableConfig) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(&config.url())
            .await
            .map_err(|e| Error::Database {
                operation: "connect",
                source: e,
            })?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        for schema in [MEMBERS_SCHEMA, PROFILES_SCHEMA] {
            sqlx::query(schema)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database {
                    operation: "ensure_schema",
                    source: e,
                })?;
        }

        Ok(())
    }

    pub async fn fetch_all_members(&self) -> Result<Vec<MemberRecord>, Error> {
        sqlx::query_as::<_, MemberRecord>("SELECT * FROM members ORDER BY slug")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database {
                operation: "fetch_all_members",
                source: e,
            })
    }

    pub async fn find_by_slug(&self, slug: &str) -> Result<Option<MemberRecord>, Error> {
        sqlx::query_as::<_, MemberRecord>("SELECT * FROM members WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database {
                operation: "find_by_slug",
                source: e,
            })
    }

    pub async fn find_by_channel_id(
        &self,
        channel_id: &str,
    ) -> Result<Option<MemberRecord>, Error> {
        sqlx::query_as::<_, MemberRecord>("SELECT * FROM members WHERE channel_id = $1")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database {
                operation: "find_by_channel_id",
                source: e,
            })
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<MemberRecord>, Error> {
        sqlx::query_as::<_, MemberRecord>(
            "SELECT * FROM members
             WHERE LOWER(english_name) = LOWER($1)
                OR japanese_name = $1
                OR korean_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database {
            operation: "find_by_name",
            source: e,
        })
    }

    pub async fn profile(
        &self,
        member_id: i64,
        language: &str,
    ) -> Result<Option<MemberProfile>, Error> {
        sqlx::query_as::<_, MemberProfile>(
            "SELECT * FROM member_profiles WHERE member_id = $1 AND language = $2",
        )
        .bind(member_id)
        .bind(language)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database {
            operation: "profile",
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_column_tolerates_non_array_shapes() {
        let mut record = MemberRecord {
            id: 1,
            slug: "pekora".into(),
            channel_id: Some("UC_pekora".into()),
            english_name: Some("Usada Pekora".into()),
            japanese_name: None,
            korean_name: None,
            status: None,
            is_graduated: false,
            official_link: None,
            aliases: serde_json::json!(["peko", "pekora"]),
        };

        assert_eq!(record.alias_strings(), vec!["peko", "pekora"]);

        record.aliases = serde_json::json!({"not": "an array"});
        assert!(record.alias_strings().is_empty());
    }
}
