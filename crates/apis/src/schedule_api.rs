//! Rotating-key client for the primary schedule API.
//!
//! Keys are tried round-robin. Rate limits rotate to the next key
//! immediately; transport errors and 5xx back off exponentially with
//! jitter and feed the circuit breaker; other 4xx are terminal.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use rand::Rng;
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::{
    circuit_breaker::{CircuitBreaker, RATE_LIMIT_RESET_TIMEOUT, RESET_TIMEOUT},
    errors::Error,
};

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_JITTER_MS: u64 = 250;
const MAX_ATTEMPT_CAP: usize = 10;

const API_KEY_HEADER: &str = "X-APIKEY";
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

pub struct RotatingClient {
    http: reqwest::Client,
    base_url: String,
    keys: Vec<String>,
    cursor: Mutex<usize>,
    breaker: Arc<CircuitBreaker>,
}

impl RotatingClient {
    pub fn new(
        base_url: impl Into<String>,
        keys: Vec<String>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, Error> {
        if keys.is_empty() {
            return Err(Error::Validation {
                field: "primary_api.keys",
                value: "empty".to_owned(),
            });
        }

        let http = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Http {
                context: "client construction".to_owned(),
                source: e,
            })?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            keys,
            cursor: Mutex::new(0),
            breaker,
        })
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn max_attempts(&self) -> usize {
        (self.keys.len() * 2).min(MAX_ATTEMPT_CAP)
    }

    fn next_key(&self) -> String {
        let mut cursor = self.cursor.lock().unwrap();
        let key = self.keys[*cursor % self.keys.len()].clone();
        *cursor = cursor.wrapping_add(1);
        key
    }

    fn backoff_delay(attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX).min(6);
        let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);

        BACKOFF_BASE * 2u32.pow(exponent) + Duration::from_millis(jitter)
    }

    /// Executes a GET against the schedule API, returning the raw body.
    #[instrument(skip(self, query))]
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Bytes, Error> {
        let url = format!("{}{}", self.base_url, path);
        let mut rate_limited_keys = 0_usize;
        let mut last_rate_limit_status = StatusCode::TOO_MANY_REQUESTS;

        for attempt in 0..self.max_attempts() {
            self.breaker.can_execute()?;

            let key = self.next_key();

            let mut auth = header::HeaderValue::from_str(&key).map_err(|_| Error::Validation {
                field: "primary_api.keys",
                value: "invalid characters".to_owned(),
            })?;
            auth.set_sensitive(true);

            let response = self
                .http
                .get(&url)
                .header(API_KEY_HEADER, auth)
                .query(query)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(%url, attempt, error = %e, "Transport error.");
                    self.breaker.record_failure(RESET_TIMEOUT);

                    if self.breaker.can_execute().is_err() {
                        return Err(Error::Http {
                            context: url,
                            source: e,
                        });
                    }

                    tokio::time::sleep(Self::backoff_delay(attempt)).await;
                    continue;
                }
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
                warn!(%url, attempt, %status, "Rate-limited, rotating key.");
                rate_limited_keys += 1;
                last_rate_limit_status = status;

                if rate_limited_keys >= self.keys.len() {
                    self.breaker.record_failure(RATE_LIMIT_RESET_TIMEOUT);

                    return Err(Error::KeyRotation {
                        status: last_rate_limit_status.as_u16(),
                        keys_tried: self.keys.len(),
                    });
                }

                // Next key immediately, no backoff.
                continue;
            }

            if status.is_server_error() {
                warn!(%url, attempt, %status, "Server error.");
                rate_limited_keys = 0;
                self.breaker.record_failure(RESET_TIMEOUT);

                if self.breaker.can_execute().is_err() {
                    return Err(Error::Api {
                        status: status.as_u16(),
                        context: path.to_owned(),
                        retry_after: retry_after(&response),
                    });
                }

                tokio::time::sleep(Self::backoff_delay(attempt)).await;
                continue;
            }

            if status.is_client_error() {
                return Err(Error::Api {
                    status: status.as_u16(),
                    context: path.to_owned(),
                    retry_after: retry_after(&response),
                });
            }

            self.breaker.record_success();
            debug!(%url, attempt, "Request succeeded.");

            return response.bytes().await.map_err(|e| Error::Http {
                context: url,
                source: e,
            });
        }

        Err(Error::Api {
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            context: format!("{path}: retry attempts exhausted"),
            retry_after: None,
        })
    }

    /// GET plus JSON deserialization into `T`.
    pub async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let bytes = self.get(path, query).await?;

        utility::functions::validate_json_bytes(&bytes).map_err(|e| Error::Service {
            service: "schedule-api",
            operation: "deserialize",
            source: Some(e.into()),
        })
    }

    /// Breaker-bypassing liveness probe used by the health-check loop.
    pub async fn probe_health(&self) -> bool {
        let url = format!("{}/live", self.base_url);

        match self.http.get(&url).query(&[("limit", "1")]).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;

    fn client(keys: &[&str]) -> RotatingClient {
        RotatingClient::new(
            "https://example.invalid/api/v2",
            keys.iter().map(|&k| k.to_owned()).collect(),
            Arc::new(CircuitBreaker::new("test")),
        )
        .unwrap()
    }

    #[test]
    fn empty_key_set_is_rejected() {
        let result = RotatingClient::new(
            "https://example.invalid",
            Vec::new(),
            Arc::new(CircuitBreaker::new("test")),
        );
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[test]
    fn keys_rotate_round_robin() {
        let client = client(&["a", "b", "c"]);

        assert_eq!(client.next_key(), "a");
        assert_eq!(client.next_key(), "b");
        assert_eq!(client.next_key(), "c");
        assert_eq!(client.next_key(), "a");
    }

    #[test]
    fn attempt_count_is_twice_the_keys_capped_at_ten() {
        assert_eq!(client(&["a"]).max_attempts(), 2);
        assert_eq!(client(&["a", "b", "c"]).max_attempts(), 6);
        assert_eq!(
            client(&["a", "b", "c", "d", "e", "f"]).max_attempts(),
            10
        );
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        for attempt in 0..4 {
            let base = BACKOFF_BASE * 2u32.pow(attempt);
            let delay = RotatingClient::backoff_delay(attempt as usize);

            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(BACKOFF_JITTER_MS));
        }
    }
}
