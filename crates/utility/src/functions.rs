use reqwest::Response;
use serde::de::DeserializeOwned;
use tracing::{error, instrument};

/// Validates a response and deserializes its body, logging the
/// deserialization path on failure.
#[instrument(skip(response))]
pub async fn validate_response<T>(response: Response) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    let status_error = response.error_for_status_ref().err();
    let bytes = response.bytes().await?;

    match validate_json_bytes(&bytes) {
        Ok(data) => Ok(data),
        Err(parse_error) => match status_error {
            Some(e) => Err(e.into()),
            None => Err(parse_error),
        },
    }
}

#[instrument(skip(bytes))]
pub fn validate_json_bytes<T>(bytes: &[u8]) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    let deserializer = &mut serde_json::Deserializer::from_slice(bytes);
    let data: Result<T, _> = serde_path_to_error::deserialize(deserializer);

    match data {
        Ok(data) => Ok(data),
        Err(e) => {
            error!(
                path = %e.path(),
                body = %truncated_body(bytes),
                "Deserialization error.",
            );

            Err(e.into())
        }
    }
}

fn truncated_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut clipped: String = text.chars().take(1024).collect();

    if clipped.len() < text.len() {
        clipped.push('…');
    }

    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        id: String,
        count: u32,
    }

    #[test]
    fn valid_json_deserializes() {
        let data: Payload = validate_json_bytes(br#"{"id":"a","count":3}"#).unwrap();
        assert_eq!(
            data,
            Payload {
                id: "a".into(),
                count: 3
            }
        );
    }

    #[test]
    fn invalid_json_reports_the_failing_path() {
        let err = validate_json_bytes::<Payload>(br#"{"id":"a","count":"x"}"#).unwrap_err();
        assert!(err.to_string().contains("count"));
    }
}
