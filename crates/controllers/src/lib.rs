//! Event-processor loops bridging cluster events to BuildRun creation.
//!
//! Each controller follows the same shape: a watch stream feeds a reflector
//! store (the local cache) and an event pump that enqueues `namespace/name`
//! keys onto a de-duplicating work queue; a sync function drains the queue
//! against the store and writes through the API client.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Client, ResourceExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use klaxon_inventory::Inventory;

mod build;
mod filter;
mod pipelinerun;
mod run;
mod workqueue;

pub use build::BuildController;
pub use filter::{build_run_owned_by_run, pipeline_run_eligible, run_references_build};
pub use pipelinerun::{
    parse_pipeline_run_status, pipeline_run_to_object_ref, PipelineRunController, UnknownStatus,
};
pub use run::{mirror_build_run_status, translate_params, ExtraFields, RunController};
pub use workqueue::WorkQueue;

/// Prefix of every label klaxon stamps on upstream objects.
pub const LABEL_KEY_PREFIX: &str = "trigger.shipwright.io";
/// BuildRun owned by the custom-task Run with the given name.
pub const OWNED_BY_RUN_KEY: &str = "trigger.shipwright.io/owned-by-run";
/// BuildRun owned by the PipelineRun with the given name.
pub const OWNED_BY_PIPELINE_RUN_KEY: &str = "trigger.shipwright.io/owned-by-pipelinerun";
/// PipelineRun label enumerating the BuildRuns created for it.
pub const BUILD_RUNS_CREATED_KEY: &str = "trigger.shipwright.io/buildrun-names";
/// PipelineRun label carrying its own name, the already-processed sentinel.
pub const PIPELINE_RUN_NAME_KEY: &str = "trigger.shipwright.io/pipelinerun-name";

/// How a sync failure is handled by the queue layer.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Retried with rate limiting.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
    /// Logged and forgotten; retrying would fail the same way.
    #[error("{0}")]
    Invalid(String),
}

/// The three controllers wired to one inventory and one API client.
pub struct ControllerSet {
    build: BuildController,
    pipeline_run: PipelineRunController,
    run: RunController,
}

impl ControllerSet {
    pub fn new(
        client: Client,
        namespace: Option<&str>,
        inventory: Arc<Inventory>,
        token: &CancellationToken,
    ) -> Self {
        Self {
            build: BuildController::new(client.clone(), namespace, Arc::clone(&inventory), token),
            pipeline_run: PipelineRunController::new(
                client.clone(),
                namespace,
                Arc::clone(&inventory),
                token,
            ),
            run: RunController::new(client, namespace, token),
        }
    }

    /// Block until every cache is synced; cancellation during startup fails.
    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        self.build.start(token).await?;
        self.pipeline_run.start(token).await?;
        self.run.start(token).await?;
        info!("all caches synced");
        Ok(())
    }

    /// Drive the processor loops until the token fires; the first loop error
    /// tears the set down.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let Self { build, pipeline_run, run } = self;
        tokio::try_join!(
            build.run(token.clone()),
            pipeline_run.run(token.clone()),
            run.run(token),
        )?;
        Ok(())
    }
}

/// `namespace/name` key of a namespaced object, the work-queue currency.
pub(crate) fn resource_key(obj: &impl ResourceExt) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

pub(crate) fn owner_reference(
    api_version: &str,
    kind: &str,
    owner: &impl ResourceExt,
) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        ..OwnerReference::default()
    }
}

/// Drain the queue through the sync function, retrying transient failures
/// and dropping unprocessable items. Returns once the queue is shut down,
/// which happens when the token fires.
pub(crate) async fn process_queue<S, Fut>(
    name: &'static str,
    queue: &Arc<WorkQueue>,
    token: &CancellationToken,
    sync: S,
) -> Result<()>
where
    S: Fn(String) -> Fut,
    Fut: Future<Output = Result<(), SyncError>>,
{
    let stopper = tokio::spawn({
        let queue = Arc::clone(queue);
        let token = token.clone();
        async move {
            token.cancelled().await;
            queue.shutdown();
        }
    });

    info!(controller = name, "event processor running");
    while let Some(key) = queue.get().await {
        match sync(key.clone()).await {
            Ok(()) => queue.forget(&key),
            Err(SyncError::Invalid(reason)) => {
                warn!(controller = name, key = %key, reason = %reason, "dropping unprocessable item");
                queue.forget(&key);
            }
            Err(SyncError::Transient(err)) => {
                warn!(controller = name, key = %key, error = %err, "sync failed, requeueing");
                counter!("sync_errors_total", 1u64, "controller" => name);
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
    stopper.abort();
    info!(controller = name, "event processor stopped");
    Ok(())
}
