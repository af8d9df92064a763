//! Webhook ingress: turns SCM events into inventory queries and BuildRuns.
//!
//! One endpoint, `POST /`, replies `200 {}` when dispatch went through (even
//! with zero matched Builds) and `500 {"error": …}` otherwise. Builds whose
//! trigger carries a secret reference get their payload signature validated
//! against that secret before any BuildRun is created.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use k8s_openapi::api::core::v1::Secret;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use klaxon_apis::{BuildRef, BuildRun, BuildRunSpec, NamespacedName};
use klaxon_inventory::Inventory;

mod github;
mod provider;

pub use github::{GitHubWebhook, GITHUB_SECRET_KEY_NAME};
pub use provider::{BuildSelector, ProviderError, RequestPayload, WebhookProvider};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("secret {secret} has no {key:?} entry")]
    MissingSecretKey { secret: String, key: String },
    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Everything a request needs: the trigger inventory, the API client and the
/// provider adapter for the configured SCM.
#[derive(Clone)]
pub struct WebhookState {
    inventory: Arc<Inventory>,
    client: Client,
    provider: Arc<dyn WebhookProvider + Send + Sync>,
    secret_key_name: String,
}

impl WebhookState {
    pub fn new(
        inventory: Arc<Inventory>,
        client: Client,
        provider: Arc<dyn WebhookProvider + Send + Sync>,
        secret_key_name: impl Into<String>,
    ) -> Self {
        Self { inventory, client, provider, secret_key_name: secret_key_name.into() }
    }
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/", post(handle_event)).with_state(state)
}

/// Bind and serve the ingress until the root cancellation signal fires.
pub async fn serve(
    addr: SocketAddr,
    state: WebhookState,
    token: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "webhook endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
}

async fn handle_event(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    counter!("webhook_requests_total", 1u64);
    respond(process_event(&state, &headers, &body).await)
}

fn respond(outcome: Result<(), WebhookError>) -> (StatusCode, Json<serde_json::Value>) {
    match outcome {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({}))),
        Err(err) => {
            warn!(error = %err, "webhook request failed");
            counter!("webhook_errors_total", 1u64);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
        }
    }
}

async fn process_event(
    state: &WebhookState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(), WebhookError> {
    let payload = state.provider.extract_payload(headers, body)?;
    let selector = state.provider.extract_build_selector(&payload)?;
    if selector.is_empty() {
        debug!(event = %payload.event_type, "nothing to dispatch for this event");
        return Ok(());
    }

    info!(
        repository = %selector.repo_url,
        revision = %selector.revision,
        "searching Builds for the webhook event"
    );
    let matches =
        state.inventory.search_for_git(selector.when_type, &selector.repo_url, &selector.revision);
    for result in &matches {
        if let Some(secret_name) = &result.secret_name {
            debug!(build = %result.build_name, secret = %secret_name, "validating payload signature");
            let token = secret_token(state, secret_name).await?;
            state.provider.validate_signature(&payload, &token)?;
        }
        create_build_run(state, &result.build_name).await?;
    }
    Ok(())
}

async fn secret_token(
    state: &WebhookState,
    name: &NamespacedName,
) -> Result<Vec<u8>, WebhookError> {
    let api: Api<Secret> = Api::namespaced(state.client.clone(), &name.namespace);
    let secret = api.get(&name.name).await?;
    secret
        .data
        .unwrap_or_default()
        .get(&state.secret_key_name)
        .map(|token| token.0.clone())
        .ok_or_else(|| WebhookError::MissingSecretKey {
            secret: name.to_string(),
            key: state.secret_key_name.clone(),
        })
}

async fn create_build_run(
    state: &WebhookState,
    build_name: &NamespacedName,
) -> Result<(), WebhookError> {
    let api: Api<BuildRun> = Api::namespaced(state.client.clone(), &build_name.namespace);
    let build_run = BuildRun {
        metadata: kube::core::ObjectMeta {
            generate_name: Some(format!("{}-", build_name.name)),
            ..Default::default()
        },
        spec: BuildRunSpec {
            build_ref: BuildRef { name: build_name.name.clone(), api_version: None },
            param_values: Vec::new(),
        },
        status: None,
    };
    let created = api.create(&PostParams::default(), &build_run).await?;
    info!(build = %build_name, build_run = %created.name_any(), "BuildRun created");
    counter!("buildruns_created_total", 1u64, "trigger" => "webhook");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_replies_empty_json_object() {
        let (status, Json(body)) = respond(Ok(()));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({}));
    }

    #[test]
    fn failures_reply_500_with_the_error_message() {
        let (status, Json(body)) = respond(Err(ProviderError::UnknownEventType.into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, serde_json::json!({ "error": "event type is not known" }));
    }
}
