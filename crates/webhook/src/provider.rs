//! The contract an SCM provider adapter fulfills for the ingress endpoint.

use axum::body::Bytes;
use axum::http::HeaderMap;

use klaxon_apis::{GitHubEventName, WhenType};

/// Request details extracted before any event parsing takes place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPayload {
    pub event_type: String,
    pub signature: String,
    pub body: Vec<u8>,
}

/// Search parameters selecting the Builds a payload applies to. An empty
/// repository URL means the event carries nothing to dispatch (e.g. ping).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSelector {
    pub when_type: WhenType,
    pub repo_url: String,
    pub repo_full_name: String,
    pub revision: String,
    pub event: Option<GitHubEventName>,
}

impl BuildSelector {
    pub fn is_empty(&self) -> bool {
        self.repo_url.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("event type is not known")]
    UnknownEventType,
    #[error("event type {0:?} is not supported")]
    UnsupportedEventType(String),
    #[error("unable to parse event payload: {0}")]
    ParsingEvent(String),
    #[error("incomplete event: {0}")]
    IncompleteEvent(String),
    #[error("signature validation failed: {0}")]
    InvalidSignature(String),
}

/// Provider-specific handling of webhook requests.
pub trait WebhookProvider {
    /// Read the event type, signature and raw body off the request.
    fn extract_payload(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<RequestPayload, ProviderError>;

    /// Parse the payload into the inventory search parameters.
    fn extract_build_selector(&self, payload: &RequestPayload)
        -> Result<BuildSelector, ProviderError>;

    /// Verify the payload against the shared signing key.
    fn validate_signature(
        &self,
        payload: &RequestPayload,
        secret: &[u8],
    ) -> Result<(), ProviderError>;
}
