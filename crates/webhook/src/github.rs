//! GitHub webhook adapter: push triggers builds, ping is acknowledged.

use axum::body::Bytes;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use klaxon_apis::{GitHubEventName, WhenType};

use crate::provider::{BuildSelector, ProviderError, RequestPayload, WebhookProvider};

/// Secret key holding the shared signing token, unless configured otherwise.
pub const GITHUB_SECRET_KEY_NAME: &str = "github-token";

const EVENT_TYPE_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Default, Clone, Copy)]
pub struct GitHubWebhook;

impl GitHubWebhook {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref", default)]
    git_ref: String,
    repository: Option<PushRepository>,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    full_name: String,
}

impl WebhookProvider for GitHubWebhook {
    fn extract_payload(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<RequestPayload, ProviderError> {
        let event_type = headers
            .get(EVENT_TYPE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if event_type.is_empty() {
            return Err(ProviderError::UnknownEventType);
        }
        Ok(RequestPayload {
            event_type: event_type.to_string(),
            signature: headers
                .get(SIGNATURE_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            body: body.to_vec(),
        })
    }

    fn extract_build_selector(
        &self,
        payload: &RequestPayload,
    ) -> Result<BuildSelector, ProviderError> {
        match payload.event_type.as_str() {
            "ping" => {
                debug!("received a ping event");
                Ok(BuildSelector::default())
            }
            "push" => {
                let event: PushEvent = serde_json::from_slice(&payload.body)
                    .map_err(|err| ProviderError::ParsingEvent(err.to_string()))?;
                let repository = event
                    .repository
                    .ok_or_else(|| ProviderError::IncompleteEvent("'repository' is missing".into()))?;
                let revision =
                    event.git_ref.strip_prefix("refs/heads/").unwrap_or(&event.git_ref);
                debug!(repository = %repository.full_name, revision, "received a push event");
                Ok(BuildSelector {
                    when_type: WhenType::GitHub,
                    repo_url: repository.html_url,
                    repo_full_name: repository.full_name,
                    revision: revision.to_string(),
                    event: Some(GitHubEventName::Push),
                })
            }
            other => Err(ProviderError::UnsupportedEventType(other.to_string())),
        }
    }

    fn validate_signature(
        &self,
        payload: &RequestPayload,
        secret: &[u8],
    ) -> Result<(), ProviderError> {
        let signature = payload.signature.strip_prefix("sha256=").unwrap_or(&payload.signature);
        let signature = hex::decode(signature)
            .map_err(|_| ProviderError::InvalidSignature("malformed signature header".into()))?;
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| ProviderError::InvalidSignature(err.to_string()))?;
        mac.update(&payload.body);
        mac.verify_slice(&signature)
            .map_err(|_| ProviderError::InvalidSignature("signature mismatch".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in pairs {
            headers.insert(
                axum::http::header::HeaderName::from_bytes(key.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    fn push_body() -> Bytes {
        Bytes::from(
            serde_json::json!({
                "ref": "refs/heads/main",
                "repository": {
                    "html_url": "https://github.com/u/r",
                    "full_name": "u/r",
                },
            })
            .to_string(),
        )
    }

    #[test]
    fn payload_extraction_requires_the_event_header() {
        let github = GitHubWebhook::new();
        let err = github.extract_payload(&HeaderMap::new(), &push_body()).unwrap_err();
        assert!(matches!(err, ProviderError::UnknownEventType));
    }

    #[test]
    fn payload_extraction_reads_event_and_signature() {
        let github = GitHubWebhook::new();
        let payload = github
            .extract_payload(
                &headers(&[("x-github-event", "push"), ("x-hub-signature-256", "sha256=ab")]),
                &push_body(),
            )
            .unwrap();
        assert_eq!(payload.event_type, "push");
        assert_eq!(payload.signature, "sha256=ab");
        assert_eq!(payload.body, push_body().to_vec());
    }

    #[test]
    fn ping_yields_an_empty_selector() {
        let github = GitHubWebhook::new();
        let payload = RequestPayload {
            event_type: "ping".to_string(),
            signature: String::new(),
            body: b"{}".to_vec(),
        };
        let selector = github.extract_build_selector(&payload).unwrap();
        assert!(selector.is_empty());
    }

    #[test]
    fn push_fills_the_selector_from_the_repository() {
        let github = GitHubWebhook::new();
        let payload = RequestPayload {
            event_type: "push".to_string(),
            signature: String::new(),
            body: push_body().to_vec(),
        };
        let selector = github.extract_build_selector(&payload).unwrap();
        assert_eq!(selector.when_type, WhenType::GitHub);
        assert_eq!(selector.repo_url, "https://github.com/u/r");
        assert_eq!(selector.repo_full_name, "u/r");
        assert_eq!(selector.revision, "main");
    }

    #[test]
    fn push_without_repository_is_incomplete() {
        let github = GitHubWebhook::new();
        let payload = RequestPayload {
            event_type: "push".to_string(),
            signature: String::new(),
            body: b"{\"ref\": \"refs/heads/main\"}".to_vec(),
        };
        assert!(matches!(
            github.extract_build_selector(&payload),
            Err(ProviderError::IncompleteEvent(_))
        ));
    }

    #[test]
    fn pull_request_events_are_unsupported() {
        let github = GitHubWebhook::new();
        let payload = RequestPayload {
            event_type: "pull_request".to_string(),
            signature: String::new(),
            body: b"{}".to_vec(),
        };
        assert!(matches!(
            github.extract_build_selector(&payload),
            Err(ProviderError::UnsupportedEventType(_))
        ));
    }

    #[test]
    fn signatures_validate_against_the_shared_secret() {
        let github = GitHubWebhook::new();
        let secret = b"such-a-secret";
        let body = push_body().to_vec();

        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(&body);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        let payload = RequestPayload {
            event_type: "push".to_string(),
            signature,
            body,
        };
        assert!(github.validate_signature(&payload, secret).is_ok());
        assert!(github.validate_signature(&payload, b"wrong-secret").is_err());

        let unsigned = RequestPayload { signature: String::new(), ..payload };
        assert!(github.validate_signature(&unsigned, secret).is_err());
    }
}
