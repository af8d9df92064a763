//! Bridges custom-task Runs to BuildRuns and mirrors status back.
//!
//! Two input streams share one queue: Runs referencing a Build, and the
//! BuildRuns they own (enqueued under the owner Run's key). The sync side
//! creates the BuildRun once, records its name in the Run's opaque
//! extra-fields blob, and from then on only reflects BuildRun status onto
//! the Run so the orchestrator can observe completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::TryStreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::PostParams;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use klaxon_apis::{
    BuildRef, BuildRun, BuildRunSpec, BuildRunStatus, Condition, InvalidKey, NamespacedName, Param,
    ParamData, ParamValue, Run, RunSpec, RunStatus, SingleValue, CONDITION_SUCCEEDED,
    TEKTON_API_V1ALPHA1,
};

use crate::workqueue::WorkQueue;
use crate::{filter, owner_reference, process_queue, resource_key, SyncError, OWNED_BY_RUN_KEY};

/// Marker recorded in the Run's extra-fields blob once a BuildRun exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraFields {
    #[serde(default)]
    pub build_run_name: String,
}

impl ExtraFields {
    pub fn is_empty(&self) -> bool {
        self.build_run_name.is_empty()
    }
}

/// Watches Runs delegating to Builds, issuing one BuildRun per Run and
/// keeping the Run status in lockstep with it.
pub struct RunController {
    run_store: Store<Run>,
    build_run_store: Store<BuildRun>,
    queue: Arc<WorkQueue>,
    client: Client,
    /// Serializes status updates against the Run comparison path; a BuildRun
    /// status change and a Run spec change may race on the same object.
    gate: Arc<Mutex<()>>,
}

impl RunController {
    pub fn new(client: Client, namespace: Option<&str>, token: &CancellationToken) -> Self {
        let run_api: Api<Run> = match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let build_run_api: Api<BuildRun> = match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };

        let run_writer = Writer::default();
        let run_store = run_writer.as_reader();
        let build_run_writer = Writer::default();
        let build_run_store = build_run_writer.as_reader();
        let queue = Arc::new(WorkQueue::new("runs"));
        let gate = Arc::new(Mutex::new(()));

        tokio::spawn(run_pump(
            run_api,
            run_writer,
            Arc::clone(&queue),
            Arc::clone(&gate),
            token.clone(),
        ));
        tokio::spawn(build_run_pump(
            build_run_api,
            build_run_writer,
            run_store.clone(),
            Arc::clone(&queue),
            token.clone(),
        ));

        Self { run_store, build_run_store, queue, client, gate }
    }

    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        info!("waiting for Run and BuildRun cache synchronization");
        tokio::select! {
            ready = self.run_store.wait_until_ready() => ready.context("Run cache did not sync")?,
            _ = token.cancelled() => anyhow::bail!("cancelled while waiting for Run cache"),
        }
        tokio::select! {
            ready = self.build_run_store.wait_until_ready() => ready.context("BuildRun cache did not sync"),
            _ = token.cancelled() => anyhow::bail!("cancelled while waiting for BuildRun cache"),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        process_queue("run", &self.queue, &token, |key| self.sync(key)).await
    }

    async fn sync(&self, key: String) -> Result<(), SyncError> {
        let name: NamespacedName =
            key.parse().map_err(|err: InvalidKey| SyncError::Invalid(err.to_string()))?;
        debug!(run = %name, "syncing Run");
        let Some(run) = self.run_store.get(&ObjectRef::new(&name.name).within(&name.namespace))
        else {
            return Ok(());
        };
        self.manage_build_run(&name, &run).await
    }

    async fn manage_build_run(&self, name: &NamespacedName, run: &Run) -> Result<(), SyncError> {
        if run.is_done() {
            debug!(run = %name, successful = run.is_successful(), "Run already settled");
            return Ok(());
        }

        let fields: ExtraFields =
            run.decode_extra_fields().context("decoding Run extra fields")?;

        let mut updated = run.clone();
        let build_run = if fields.is_empty() {
            let build_run = self.create_build_run(run).await?;
            info!(run = %name, build_run = %build_run.name_any(), "BuildRun dispatched for Run");
            let status = updated.status.get_or_insert_with(RunStatus::default);
            status.extra_fields = Some(
                serde_json::to_value(ExtraFields { build_run_name: build_run.name_any() })
                    .context("encoding Run extra fields")?,
            );
            status.start_time = Some(Time(Utc::now()));
            build_run
        } else {
            let key = ObjectRef::new(&fields.build_run_name).within(&name.namespace);
            let Some(build_run) = self.build_run_store.get(&key) else {
                return Err(anyhow!(
                    "BuildRun {}/{} for Run {name} not in cache",
                    name.namespace,
                    fields.build_run_name
                )
                .into());
            };
            debug!(run = %name, build_run = %fields.build_run_name, "mirroring BuildRun status");
            (*build_run).clone()
        };

        self.update_run_status(&mut updated, &build_run).await
    }

    async fn create_build_run(&self, run: &Run) -> Result<BuildRun, SyncError> {
        let reference = run
            .spec
            .r#ref
            .as_ref()
            .ok_or_else(|| SyncError::Invalid(format!("Run {} has no ref", resource_key(run))))?;
        let build_run = BuildRun {
            metadata: kube::core::ObjectMeta {
                generate_name: Some(format!("{}-", run.name_any())),
                labels: Some(BTreeMap::from([(
                    OWNED_BY_RUN_KEY.to_string(),
                    run.name_any(),
                )])),
                owner_references: Some(vec![owner_reference(TEKTON_API_V1ALPHA1, "Run", run)]),
                ..Default::default()
            },
            spec: BuildRunSpec {
                build_ref: BuildRef {
                    name: reference.name.clone(),
                    api_version: Some(reference.api_version.clone()),
                },
                param_values: translate_params(&run.spec.params),
            },
            status: None,
        };
        let api: Api<BuildRun> =
            Api::namespaced(self.client.clone(), &run.namespace().unwrap_or_default());
        let build_run = api
            .create(&PostParams::default(), &build_run)
            .await
            .context("creating BuildRun for Run")?;
        counter!("buildruns_created_total", 1u64, "trigger" => "run");
        Ok(build_run)
    }

    async fn update_run_status(&self, run: &mut Run, build_run: &BuildRun) -> Result<(), SyncError> {
        let _guard = self.gate.lock().await;
        mirror_build_run_status(run, build_run);
        let api: Api<Run> =
            Api::namespaced(self.client.clone(), &run.namespace().unwrap_or_default());
        let body = serde_json::to_vec(run).context("serializing Run")?;
        api.replace_status(&run.name_any(), &PostParams::default(), body)
            .await
            .context("updating Run status")?;
        Ok(())
    }
}

/// Copy the BuildRun's completion time and condition list onto the Run,
/// replacing whatever conditions were there. Condition status `False` maps to
/// an error-severity condition; a BuildRun without conditions yields a single
/// `Succeeded=Unknown` placeholder.
pub fn mirror_build_run_status(run: &mut Run, build_run: &BuildRun) {
    let source = build_run.status.clone().unwrap_or_else(BuildRunStatus::default);
    let status = run.status.get_or_insert_with(RunStatus::default);
    status.completion_time = source.completion_time.clone();
    status.conditions = source
        .conditions
        .iter()
        .map(|condition| Condition {
            condition_type: condition.condition_type.clone(),
            status: condition.status.clone(),
            severity: Some(
                if condition.status == "False" { "Error" } else { "Info" }.to_string(),
            ),
            last_transition_time: condition.last_transition_time.clone(),
            reason: condition.reason.clone(),
            message: condition.message.clone(),
        })
        .collect();
    if status.conditions.is_empty() {
        status.conditions = vec![Condition {
            condition_type: CONDITION_SUCCEEDED.to_string(),
            status: "Unknown".to_string(),
            last_transition_time: Some(Time(Utc::now())),
            ..Condition::default()
        }];
    }
}

/// Translate orchestrator params into BuildRun param values; array payloads
/// become value lists, everything else a single value.
pub fn translate_params(params: &[Param]) -> Vec<ParamValue> {
    params
        .iter()
        .map(|param| match &param.value {
            ParamData::Array(values) => ParamValue {
                name: param.name.clone(),
                single_value: None,
                values: Some(
                    values.iter().map(|v| SingleValue { value: Some(v.clone()) }).collect(),
                ),
            },
            ParamData::String(value) => ParamValue {
                name: param.name.clone(),
                single_value: Some(SingleValue { value: Some(value.clone()) }),
                values: None,
            },
        })
        .collect()
}

/// Feeds the Run reflector store and enqueues Runs referencing a Build whose
/// spec or status changed. Comparison happens under the controller gate.
async fn run_pump(
    api: Api<Run>,
    writer: Writer<Run>,
    queue: Arc<WorkQueue>,
    gate: Arc<Mutex<()>>,
    token: CancellationToken,
) {
    let mut seen: FxHashMap<String, (RunSpec, Option<RunStatus>)> = FxHashMap::default();
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()));
    futures::pin_mut!(stream);
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(Event::Applied(run))) => {
                let _guard = gate.lock().await;
                observe_run(&mut seen, &queue, &run);
            }
            Ok(Some(Event::Deleted(run))) => {
                let key = resource_key(&run);
                seen.remove(&key);
                if filter::run_references_build(&run) {
                    queue.add(&key);
                }
            }
            Ok(Some(Event::Restarted(runs))) => {
                let _guard = gate.lock().await;
                for run in &runs {
                    observe_run(&mut seen, &queue, run);
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "Run watch stream error");
                counter!("watch_errors_total", 1u64, "watch" => "runs");
            }
        }
    }
}

fn observe_run(
    seen: &mut FxHashMap<String, (RunSpec, Option<RunStatus>)>,
    queue: &WorkQueue,
    run: &Run,
) {
    if !filter::run_references_build(run) {
        return;
    }
    let key = resource_key(run);
    let observed = (run.spec.clone(), run.status.clone());
    if seen.get(&key) == Some(&observed) {
        return;
    }
    seen.insert(key.clone(), observed);
    queue.add(&key);
}

/// Feeds the BuildRun reflector store; BuildRuns owned by a Run enqueue the
/// owner's key when their status changes, and only when the owner is known.
async fn build_run_pump(
    api: Api<BuildRun>,
    writer: Writer<BuildRun>,
    run_store: Store<Run>,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) {
    let mut seen: FxHashMap<String, Option<BuildRunStatus>> = FxHashMap::default();
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()));
    futures::pin_mut!(stream);
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(Event::Applied(build_run))) => {
                observe_build_run(&mut seen, &run_store, &queue, &build_run);
            }
            Ok(Some(Event::Deleted(build_run))) => {
                seen.remove(&resource_key(&build_run));
                if let Some(owner) = filter::build_run_owned_by_run(&build_run) {
                    enqueue_owner(&run_store, &queue, &owner);
                }
            }
            Ok(Some(Event::Restarted(build_runs))) => {
                for build_run in &build_runs {
                    observe_build_run(&mut seen, &run_store, &queue, build_run);
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "BuildRun watch stream error");
                counter!("watch_errors_total", 1u64, "watch" => "buildruns");
            }
        }
    }
}

fn observe_build_run(
    seen: &mut FxHashMap<String, Option<BuildRunStatus>>,
    run_store: &Store<Run>,
    queue: &WorkQueue,
    build_run: &BuildRun,
) {
    let Some(owner) = filter::build_run_owned_by_run(build_run) else {
        return;
    };
    let key = resource_key(build_run);
    let status = build_run.status.clone();
    if seen.get(&key) == Some(&status) {
        return;
    }
    seen.insert(key, status);
    enqueue_owner(run_store, queue, &owner);
}

fn enqueue_owner(run_store: &Store<Run>, queue: &WorkQueue, owner: &NamespacedName) {
    if run_store.get(&ObjectRef::new(&owner.name).within(&owner.namespace)).is_none() {
        debug!(run = %owner, "owner Run not in cache, not enqueueing");
        return;
    }
    queue.add(&owner.to_string());
}
