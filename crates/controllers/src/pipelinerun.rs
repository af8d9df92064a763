//! Fans out PipelineRun state changes into BuildRuns for matching Builds.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::api::PostParams;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use klaxon_apis::{
    BuildRef, BuildRun, BuildRunSpec, InvalidKey, NamespacedName, PipelineRun, PipelineRunStatus,
    WhenObjectRef, WhenType, TEKTON_API_V1BETA1,
};
use klaxon_inventory::{Inventory, SearchResult};

use crate::workqueue::WorkQueue;
use crate::{
    filter, owner_reference, process_queue, resource_key, SyncError, BUILD_RUNS_CREATED_KEY,
    LABEL_KEY_PREFIX, PIPELINE_RUN_NAME_KEY,
};

/// Watches PipelineRun completions and creates BuildRuns for the Builds whose
/// object-ref trigger rules match.
pub struct PipelineRunController {
    store: Store<PipelineRun>,
    queue: Arc<WorkQueue>,
    inventory: Arc<Inventory>,
    client: Client,
}

impl PipelineRunController {
    pub fn new(
        client: Client,
        namespace: Option<&str>,
        inventory: Arc<Inventory>,
        token: &CancellationToken,
    ) -> Self {
        let api: Api<PipelineRun> = match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let writer = Writer::default();
        let store = writer.as_reader();
        let queue = Arc::new(WorkQueue::new("pipelineruns"));
        tokio::spawn(pump(api, writer, Arc::clone(&queue), token.clone()));
        Self { store, queue, inventory, client }
    }

    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        info!("waiting for PipelineRun cache synchronization");
        tokio::select! {
            ready = self.store.wait_until_ready() => ready.context("PipelineRun cache did not sync"),
            _ = token.cancelled() => anyhow::bail!("cancelled while waiting for PipelineRun cache"),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        process_queue("pipelinerun", &self.queue, &token, |key| self.sync(key)).await
    }

    async fn sync(&self, key: String) -> Result<(), SyncError> {
        let name: NamespacedName =
            key.parse().map_err(|err: InvalidKey| SyncError::Invalid(err.to_string()))?;
        debug!(pipeline_run = %name, "syncing PipelineRun");

        let Some(pipeline_run) = self.store.get(&ObjectRef::new(&name.name).within(&name.namespace))
        else {
            return Ok(());
        };
        if pipeline_run.spec.pipeline_ref.is_none() {
            debug!(pipeline_run = %name, "no pipeline reference, skipping");
            return Ok(());
        }
        if filter::pipeline_run_name_matches_label(&pipeline_run) {
            debug!(pipeline_run = %name, "already fanned out, skipping");
            return Ok(());
        }

        let object_ref = pipeline_run_to_object_ref(&pipeline_run)
            .map_err(|err| SyncError::Invalid(err.to_string()))?;
        debug!(
            name = %object_ref.name,
            status = ?object_ref.status,
            selector = ?object_ref.selector,
            "searching for Builds matching the PipelineRun"
        );
        let matches = self.inventory.search_for_object_ref(WhenType::Pipeline, &object_ref);
        if matches.is_empty() {
            return Ok(());
        }
        self.trigger_builds(&pipeline_run, &matches).await
    }

    /// Create one BuildRun per matched Build, then stamp the PipelineRun with
    /// the created names and the already-processed sentinel.
    async fn trigger_builds(
        &self,
        pipeline_run: &PipelineRun,
        matches: &[SearchResult],
    ) -> Result<(), SyncError> {
        let namespace = pipeline_run.namespace().unwrap_or_default();
        let pr_name = pipeline_run.name_any();
        let api: Api<BuildRun> = Api::namespaced(self.client.clone(), &namespace);

        let mut created = Vec::new();
        for result in matches {
            let build_run = build_run_for(pipeline_run, &result.build_name.name);
            let build_run = api
                .create(&PostParams::default(), &build_run)
                .await
                .with_context(|| format!("creating BuildRun for Build {}", result.build_name))?;
            counter!("buildruns_created_total", 1u64, "trigger" => "pipelinerun");
            created.push(build_run.name_any());
        }
        if created.is_empty() {
            return Err(anyhow!("no BuildRuns created for PipelineRun {namespace}/{pr_name}").into());
        }
        info!(pipeline_run = %pr_name, build_runs = ?created, "BuildRuns created");

        let mut updated = pipeline_run.clone();
        let labels = updated.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(BUILD_RUNS_CREATED_KEY.to_string(), created.join(", "));
        labels.insert(PIPELINE_RUN_NAME_KEY.to_string(), pr_name.clone());

        let pr_api: Api<PipelineRun> = Api::namespaced(self.client.clone(), &namespace);
        pr_api
            .replace(&pr_name, &PostParams::default(), &updated)
            .await
            .context("stamping PipelineRun labels")?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot determine status of PipelineRun {0}")]
pub struct UnknownStatus(pub String);

/// Map the observed PipelineRun state onto the status string used by
/// object-ref trigger rules.
pub fn parse_pipeline_run_status(pipeline_run: &PipelineRun) -> Result<&'static str, UnknownStatus> {
    if pipeline_run.is_done() {
        if pipeline_run.is_succeeded() {
            Ok("Succeeded")
        } else {
            Ok("Failed")
        }
    } else if pipeline_run.is_cancelled() {
        Ok("Cancelled")
    } else if pipeline_run.is_timed_out() {
        Ok("TimedOut")
    } else if pipeline_run.has_started() {
        Ok("Started")
    } else {
        Err(UnknownStatus(resource_key(pipeline_run)))
    }
}

/// The inventory query describing a PipelineRun: its pipeline name, its
/// extracted status, and its labels minus the ones stamped by klaxon itself.
pub fn pipeline_run_to_object_ref(
    pipeline_run: &PipelineRun,
) -> Result<WhenObjectRef, UnknownStatus> {
    let status = parse_pipeline_run_status(pipeline_run)?;
    let selector = pipeline_run
        .labels()
        .iter()
        .filter(|(key, _)| !key.starts_with(LABEL_KEY_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(WhenObjectRef {
        name: pipeline_run
            .spec
            .pipeline_ref
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_default(),
        status: vec![status.to_string()],
        selector,
    })
}

fn build_run_for(pipeline_run: &PipelineRun, build_name: &str) -> BuildRun {
    BuildRun {
        metadata: kube::core::ObjectMeta {
            generate_name: Some(format!("{}-", pipeline_run.name_any())),
            labels: Some(BTreeMap::from([(
                crate::OWNED_BY_PIPELINE_RUN_KEY.to_string(),
                pipeline_run.name_any(),
            )])),
            owner_references: Some(vec![owner_reference(
                TEKTON_API_V1BETA1,
                "PipelineRun",
                pipeline_run,
            )]),
            ..Default::default()
        },
        spec: BuildRunSpec {
            build_ref: BuildRef { name: build_name.to_string(), api_version: None },
            param_values: Vec::new(),
        },
        status: None,
    }
}

/// Feeds the reflector store and enqueues eligible PipelineRuns whose status
/// changed.
async fn pump(
    api: Api<PipelineRun>,
    writer: Writer<PipelineRun>,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) {
    let mut seen: FxHashMap<String, Option<PipelineRunStatus>> = FxHashMap::default();
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()));
    futures::pin_mut!(stream);
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(Event::Applied(pipeline_run))) => observe(&mut seen, &queue, &pipeline_run),
            Ok(Some(Event::Deleted(pipeline_run))) => {
                let key = resource_key(&pipeline_run);
                seen.remove(&key);
                if filter::pipeline_run_eligible(&pipeline_run) {
                    queue.add(&key);
                }
            }
            Ok(Some(Event::Restarted(pipeline_runs))) => {
                for pipeline_run in &pipeline_runs {
                    observe(&mut seen, &queue, pipeline_run);
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "PipelineRun watch stream error");
                counter!("watch_errors_total", 1u64, "watch" => "pipelineruns");
            }
        }
    }
}

fn observe(
    seen: &mut FxHashMap<String, Option<PipelineRunStatus>>,
    queue: &WorkQueue,
    pipeline_run: &PipelineRun,
) {
    let key = resource_key(pipeline_run);
    if !filter::pipeline_run_eligible(pipeline_run) {
        seen.remove(&key);
        return;
    }
    let status = pipeline_run.status.clone();
    if seen.get(&key) == Some(&status) {
        return;
    }
    seen.insert(key.clone(), status);
    queue.add(&key);
}
