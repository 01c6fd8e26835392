//! Primary/fallback JSON generation facade over two completion
//! providers, guarded by a circuit breaker.
//!
//! The primary provider supports an opaque context-cache handle for the
//! system prompt; the handle ages out after a day and is refreshed
//! roughly an hour before expiry. The fallback provider gets the system
//! prompt inline, prefixed with a strict-JSON instruction.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use utility::config::AiConfig;

use crate::{
    circuit_breaker::{CircuitBreaker, RATE_LIMIT_RESET_TIMEOUT, RESET_TIMEOUT},
    errors::Error,
};

const PRIMARY_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const FALLBACK_API_BASE: &str = "https://api.openai.com/v1";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

const AI_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifetime requested for the cached system-prompt context.
const CONTEXT_CACHE_TTL: chrono::Duration = chrono::Duration::hours(24);
/// The handle is refreshed when it has less than this left to live.
const CONTEXT_REFRESH_MARGIN: chrono::Duration = chrono::Duration::hours(1);

const STRICT_JSON_INSTRUCTION: &str =
    "Respond with a single valid JSON value and nothing else. No prose, no code fences.";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SamplingPreset {
    Creative,
    Precise,
    Balanced,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl SamplingPreset {
    #[must_use]
    pub fn config(self) -> SamplingConfig {
        match self {
            Self::Creative => SamplingConfig {
                temperature: 0.9,
                top_p: 0.95,
                top_k: 40,
                max_output_tokens: 1024,
            },
            Self::Precise => SamplingConfig {
                temperature: 0.1,
                top_p: 0.8,
                top_k: 20,
                max_output_tokens: 1024,
            },
            Self::Balanced => SamplingConfig {
                temperature: 0.5,
                top_p: 0.9,
                top_k: 32,
                max_output_tokens: 1024,
            },
        }
    }
}

/// Caller overrides applied on top of a preset.
#[derive(Debug, Copy, Clone, Default)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
}

impl SamplingOverrides {
    #[must_use]
    pub fn apply(self, base: SamplingConfig) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.unwrap_or(base.top_p),
            top_k: self.top_k.unwrap_or(base.top_k),
            max_output_tokens: self.max_output_tokens.unwrap_or(base.max_output_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationMetadata {
    pub provider: &'static str,
    pub model: String,
    pub used_fallback: bool,
}

#[derive(Debug, Clone)]
struct CachedContext {
    name: String,
    expires_at: DateTime<Utc>,
}

struct FallbackProvider {
    key: String,
    model: String,
}

pub struct AiFacade {
    http: reqwest::Client,
    primary_key: String,
    primary_model: String,
    fallback: Option<FallbackProvider>,
    breaker: Arc<CircuitBreaker>,
    system_prompt: String,
    cached_context: RwLock<Option<CachedContext>>,
}

impl AiFacade {
    pub fn new(
        config: &AiConfig,
        system_prompt: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, Error> {
        if config.primary.api_key.is_empty() {
            return Err(Error::Validation {
                field: "ai.primary.api_key",
                value: "empty".to_owned(),
            });
        }

        let http = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(AI_TIMEOUT)
            .build()
            .map_err(|e| Error::Http {
                context: "AI client construction".to_owned(),
                source: e,
            })?;

        let fallback = (config.fallback.enabled && !config.fallback.api_key.is_empty()).then(|| {
            FallbackProvider {
                key: config.fallback.api_key.clone(),
                model: config.fallback.model.clone(),
            }
        });

        Ok(Self {
            http,
            primary_key: config.primary.api_key.clone(),
            primary_model: config.primary.default_model.clone(),
            fallback,
            breaker,
            system_prompt: system_prompt.into(),
            cached_context: RwLock::new(None),
        })
    }

    /// Generates a JSON value matching `T` from the prompt. Tries the
    /// primary provider, then the fallback when enabled; both failing
    /// records a service failure against the breaker, with the longer
    /// reset when the failure class was a rate limit.
    #[instrument(skip(self, prompt, overrides))]
    pub async fn generate_json<T>(
        &self,
        prompt: &str,
        preset: SamplingPreset,
        overrides: SamplingOverrides,
    ) -> Result<(T, GenerationMetadata), Error>
    where
        T: DeserializeOwned,
    {
        self.breaker.can_execute()?;

        let sampling = overrides.apply(preset.config());

        let primary_error = match self.generate_primary(prompt, &sampling).await {
            Ok(text) => {
                self.breaker.record_success();

                return Ok((
                    parse_payload(&text)?,
                    GenerationMetadata {
                        provider: "primary",
                        model: self.primary_model.clone(),
                        used_fallback: false,
                    },
                ));
            }
            Err(e) => e,
        };

        if let Some(fallback) = &self.fallback {
            warn!(error = %primary_error, "Primary AI provider failed, trying fallback.");

            match self.generate_fallback(fallback, prompt, &sampling).await {
                Ok(text) => {
                    self.breaker.record_success();

                    return Ok((
                        parse_payload(&text)?,
                        GenerationMetadata {
                            provider: "fallback",
                            model: fallback.model.clone(),
                            used_fallback: true,
                        },
                    ));
                }
                Err(fallback_error) => {
                    warn!(error = %fallback_error, "Fallback AI provider failed.");
                    self.record_service_failure(&primary_error, &fallback_error);
                    return Err(fallback_error);
                }
            }
        }

        self.record_service_failure(&primary_error, &primary_error);
        Err(primary_error)
    }

    fn record_service_failure(&self, primary: &Error, secondary: &Error) {
        let reset = if primary.is_rate_limit() || secondary.is_rate_limit() {
            RATE_LIMIT_RESET_TIMEOUT
        } else {
            RESET_TIMEOUT
        };

        self.breaker.record_failure(reset);
    }

    async fn generate_primary(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<String, Error> {
        let cached_content = self.ensure_cached_context().await;

        let mut body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": {
                "temperature": sampling.temperature,
                "topP": sampling.top_p,
                "topK": sampling.top_k,
                "maxOutputTokens": sampling.max_output_tokens,
                "responseMimeType": "application/json",
            },
        });

        match cached_content {
            Some(name) => {
                body["cachedContent"] = Value::String(name);
            }
            None => {
                body["systemInstruction"] = json!({
                    "parts": [{ "text": self.system_prompt }],
                });
            }
        }

        let url = format!(
            "{PRIMARY_API_BASE}/models/{}:generateContent",
            self.primary_model
        );

        let value = self
            .post_json(&url, &[("key", self.primary_key.as_str())], &body, "primary")
            .await?;

        extract_primary_text(&value).ok_or_else(|| Error::Service {
            service: "ai-primary",
            operation: "extract",
            source: None,
        })
    }

    async fn generate_fallback(
        &self,
        fallback: &FallbackProvider,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> Result<String, Error> {
        let body = json!({
            "model": fallback.model,
            "messages": [
                {
                    "role": "system",
                    "content": format!("{STRICT_JSON_INSTRUCTION}\n\n{}", self.system_prompt),
                },
                { "role": "user", "content": prompt },
            ],
            "temperature": sampling.temperature,
            "top_p": sampling.top_p,
            "max_tokens": sampling.max_output_tokens,
            "response_format": { "type": "json_object" },
        });

        let url = format!("{FALLBACK_API_BASE}/chat/completions");

        let value = self
            .post_json_bearer(&url, &fallback.key, &body, "fallback")
            .await?;

        extract_fallback_text(&value).ok_or_else(|| Error::Service {
            service: "ai-fallback",
            operation: "extract",
            source: None,
        })
    }

    /// Returns the current context-cache handle, creating or refreshing
    /// it when absent or close to expiry. Failures degrade to inline
    /// system prompts rather than failing the call.
    async fn ensure_cached_context(&self) -> Option<String> {
        let now = Utc::now();

        {
            let cached = self.cached_context.read().await;

            if let Some(context) = cached.as_ref() {
                if !needs_refresh(context.expires_at, now) {
                    return Some(context.name.clone());
                }
            }
        }

        let body = json!({
            "model": format!("models/{}", self.primary_model),
            "systemInstruction": {
                "parts": [{ "text": self.system_prompt }],
            },
            "ttl": format!("{}s", CONTEXT_CACHE_TTL.num_seconds()),
        });

        let url = format!("{PRIMARY_API_BASE}/cachedContents");

        match self
            .post_json(&url, &[("key", self.primary_key.as_str())], &body, "primary")
            .await
        {
            Ok(value) => {
                let name = value.get("name")?.as_str()?.to_owned();

                let expires_at = value
                    .get("expireTime")
                    .and_then(Value::as_str)
                    .and_then(|t| t.parse::<DateTime<Utc>>().ok())
                    .unwrap_or(now + CONTEXT_CACHE_TTL);

                info!(%name, %expires_at, "Refreshed AI context cache.");

                let mut cached = self.cached_context.write().await;
                *cached = Some(CachedContext {
                    name: name.clone(),
                    expires_at,
                });

                Some(name)
            }
            Err(e) => {
                warn!(error = %e, "Context cache refresh failed, sending prompt inline.");
                let mut cached = self.cached_context.write().await;
                *cached = None;
                None
            }
        }
    }

    async fn post_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &Value,
        context: &'static str,
    ) -> Result<Value, Error> {
        let response = self
            .http
            .post(url)
            .query(query)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http {
                context: context.to_owned(),
                source: e,
            })?;

        Self::read_value(response, context).await
    }

    async fn post_json_bearer(
        &self,
        url: &str,
        key: &str,
        body: &Value,
        context: &'static str,
    ) -> Result<Value, Error> {
        let response = self
            .http
            .post(url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http {
                context: context.to_owned(),
                source: e,
            })?;

        Self::read_value(response, context).await
    }

    async fn read_value(response: reqwest::Response, context: &'static str) -> Result<Value, Error> {
        let status = response.status();

        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                context: context.to_owned(),
                retry_after: None,
            });
        }

        response.json().await.map_err(|e| Error::Http {
            context: context.to_owned(),
            source: e,
        })
    }
}

fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - now < CONTEXT_REFRESH_MARGIN
}

fn extract_primary_text(value: &Value) -> Option<String> {
    let parts = value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    (!text.is_empty()).then_some(text)
}

fn extract_fallback_text(value: &Value) -> Option<String> {
    value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_owned)
}

/// Strips optional markdown code fences around a JSON payload.
#[must_use]
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();

    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };

    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);

    inner.trim()
}

fn parse_payload<T>(text: &str) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    serde_json::from_str(strip_code_fences(text)).map_err(|e| Error::Service {
        service: "ai",
        operation: "parse",
        source: Some(Box::new(e)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_map_to_sampling_configs() {
        let creative = SamplingPreset::Creative.config();
        let precise = SamplingPreset::Precise.config();

        assert!(creative.temperature > precise.temperature);
        assert_eq!("precise".parse::<SamplingPreset>().unwrap(), SamplingPreset::Precise);
    }

    #[test]
    fn overrides_replace_only_the_given_fields() {
        let overridden = SamplingOverrides {
            temperature: Some(0.0),
            ..SamplingOverrides::default()
        }
        .apply(SamplingPreset::Balanced.config());

        assert_eq!(overridden.temperature, 0.0);
        assert_eq!(overridden.top_k, SamplingPreset::Balanced.config().top_k);
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn primary_response_text_is_joined_from_parts() {
        let value = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "{\"a\":" }, { "text": "1}" }] }
            }]
        });

        assert_eq!(extract_primary_text(&value).unwrap(), "{\"a\":1}");
        assert_eq!(extract_primary_text(&json!({})), None);
    }

    #[test]
    fn fallback_response_text_comes_from_the_first_choice() {
        let value = json!({
            "choices": [{ "message": { "content": "{\"a\":1}" } }]
        });

        assert_eq!(extract_fallback_text(&value).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn refresh_happens_inside_the_margin() {
        let now = Utc::now();

        assert!(needs_refresh(now + chrono::Duration::minutes(30), now));
        assert!(needs_refresh(now - chrono::Duration::minutes(1), now));
        assert!(!needs_refresh(now + chrono::Duration::hours(2), now));
    }

    #[test]
    fn payloads_parse_through_fences() {
        #[derive(serde::Deserialize)]
        struct P {
            a: i32,
        }

        let parsed: P = parse_payload("```json\n{\"a\": 3}\n```").unwrap();
        assert_eq!(parsed.a, 3);
        assert!(parse_payload::<P>("not json").is_err());
    }
}
