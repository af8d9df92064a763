//! Mirrors Build definitions into the trigger inventory.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use klaxon_apis::{Build, InvalidKey, NamespacedName, Source, Trigger};
use klaxon_inventory::Inventory;

use crate::workqueue::WorkQueue;
use crate::{process_queue, resource_key, SyncError};

/// Keeps the inventory in lockstep with Build objects on the cluster.
pub struct BuildController {
    store: Store<Build>,
    queue: Arc<WorkQueue>,
    inventory: Arc<Inventory>,
}

impl BuildController {
    pub fn new(
        client: Client,
        namespace: Option<&str>,
        inventory: Arc<Inventory>,
        token: &CancellationToken,
    ) -> Self {
        let api: Api<Build> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let writer = Writer::default();
        let store = writer.as_reader();
        let queue = Arc::new(WorkQueue::new("builds"));
        tokio::spawn(pump(api, writer, Arc::clone(&queue), token.clone()));
        Self { store, queue, inventory }
    }

    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        info!("waiting for Build cache synchronization");
        tokio::select! {
            ready = self.store.wait_until_ready() => ready.context("Build cache did not sync"),
            _ = token.cancelled() => anyhow::bail!("cancelled while waiting for Build cache"),
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        process_queue("build", &self.queue, &token, |key| self.sync(key)).await
    }

    async fn sync(&self, key: String) -> Result<(), SyncError> {
        let name: NamespacedName =
            key.parse().map_err(|err: InvalidKey| SyncError::Invalid(err.to_string()))?;
        match self.store.get(&ObjectRef::new(&name.name).within(&name.namespace)) {
            Some(build) => self.inventory.add(&build),
            None => self.inventory.remove(&name),
        }
        Ok(())
    }
}

/// Feeds the reflector store and enqueues keys whose source or trigger
/// changed; plain status churn is ignored.
async fn pump(
    api: Api<Build>,
    writer: Writer<Build>,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) {
    let mut seen: FxHashMap<String, (Source, Option<Trigger>)> = FxHashMap::default();
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()));
    futures::pin_mut!(stream);
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(Event::Applied(build))) => observe(&mut seen, &queue, &build),
            Ok(Some(Event::Deleted(build))) => {
                let key = resource_key(&build);
                seen.remove(&key);
                queue.add(&key);
            }
            Ok(Some(Event::Restarted(builds))) => {
                // relist: enqueue everything present and anything that
                // vanished while the watch was down
                let mut vanished: HashSet<String> = seen.keys().cloned().collect();
                for build in &builds {
                    vanished.remove(&resource_key(build));
                    observe(&mut seen, &queue, build);
                }
                for key in vanished {
                    seen.remove(&key);
                    queue.add(&key);
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "Build watch stream error");
                counter!("watch_errors_total", 1u64, "watch" => "builds");
            }
        }
    }
}

fn observe(
    seen: &mut FxHashMap<String, (Source, Option<Trigger>)>,
    queue: &WorkQueue,
    build: &Build,
) {
    let key = resource_key(build);
    let observed = (build.spec.source.clone(), build.spec.trigger.clone());
    if seen.get(&key) == Some(&observed) {
        return;
    }
    seen.insert(key.clone(), observed);
    queue.add(&key);
}
