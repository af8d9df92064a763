//! In-memory index of Build trigger rules, the authoritative cache events are
//! matched against. Matching never calls the cluster API.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use klaxon_apis::{Build, NamespacedName, Source, Trigger, WhenObjectRef, WhenType};

mod sanitize;

pub use sanitize::{sanitize_url, urls_match};

/// Source and trigger rules kept per Build instance.
#[derive(Debug, Clone)]
struct TriggerRules {
    source: Source,
    trigger: Trigger,
}

/// A Build matched by a search, with the secret to validate requests against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub build_name: NamespacedName,
    pub secret_name: Option<NamespacedName>,
}

/// Indexed store of trigger rules keyed by Build identity.
///
/// A single mutex guards the map; add, remove and both search modes take it
/// for their whole duration.
#[derive(Debug, Default)]
pub struct Inventory {
    cache: Mutex<FxHashMap<NamespacedName, TriggerRules>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the given Build. A Build without
    /// trigger rules is stored with an empty rule set.
    pub fn add(&self, build: &Build) {
        let key = NamespacedName::from_resource(build);
        info!(build = %key, "storing Build in the trigger inventory");
        let rules = TriggerRules {
            source: build.spec.source.clone(),
            trigger: build.spec.trigger.clone().unwrap_or_default(),
        };
        self.cache.lock().expect("inventory lock").insert(key, rules);
    }

    /// Drop the entry for the given key; absent keys are a no-op.
    pub fn remove(&self, key: &NamespacedName) {
        info!(build = %key, "removing Build from the trigger inventory");
        if self.cache.lock().expect("inventory lock").remove(key).is_none() {
            debug!(build = %key, "inventory entry not found, skipping removal");
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("inventory lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find Builds triggered by a repository event: the entry's source URL
    /// must match the repository and one clause of the requested type must
    /// list the branch verbatim.
    pub fn search_for_git(
        &self,
        when_type: WhenType,
        repo_url: &str,
        branch: &str,
    ) -> Vec<SearchResult> {
        counter!("inventory_git_searches_total", 1u64);
        let found = self.scan(when_type, |rules, when| {
            let Some(url) = rules.source.url.as_deref() else {
                return false;
            };
            urls_match(url, repo_url) && when.branches(when_type).iter().any(|b| b == branch)
        });
        debug!(
            repository = repo_url,
            branch,
            matches = found.len(),
            "searched inventory by repository"
        );
        found
    }

    /// Find Builds triggered by an observed object. Per clause, the query's
    /// first status must be listed when both sides constrain status; then the
    /// name must match exactly, or failing a name constraint, the clause
    /// selector must be satisfied by the query labels.
    pub fn search_for_object_ref(
        &self,
        when_type: WhenType,
        object_ref: &WhenObjectRef,
    ) -> Vec<SearchResult> {
        counter!("inventory_object_ref_searches_total", 1u64);
        let found = self.scan(when_type, |_, when| {
            let Some(clause) = when.object_ref.as_ref() else {
                return false;
            };
            if !clause.status.is_empty() && !object_ref.status.is_empty() {
                let status = &object_ref.status[0];
                if !clause.status.contains(status) {
                    return false;
                }
            }
            if !clause.name.is_empty() {
                object_ref.name == clause.name
            } else if !clause.selector.is_empty() {
                !object_ref.selector.is_empty()
                    && selector_matches(&clause.selector, &object_ref.selector)
            } else {
                false
            }
        });
        debug!(
            name = %object_ref.name,
            status = ?object_ref.status,
            matches = found.len(),
            "searched inventory by object reference"
        );
        found
    }

    /// Scan every entry for a clause of the requested type accepted by the
    /// predicate; the first accepting clause emits one result per entry.
    fn scan(
        &self,
        when_type: WhenType,
        accept: impl Fn(&TriggerRules, &klaxon_apis::TriggerWhen) -> bool,
    ) -> Vec<SearchResult> {
        let cache = self.cache.lock().expect("inventory lock");
        let mut found = Vec::new();
        for (key, rules) in cache.iter() {
            let hit = rules
                .trigger
                .when
                .iter()
                .filter(|when| when.when_type == when_type)
                .any(|when| accept(rules, when));
            if hit {
                counter!("inventory_search_hits_total", 1u64);
                found.push(SearchResult {
                    build_name: key.clone(),
                    secret_name: rules.trigger.secret_ref.as_ref().map(|secret| {
                        NamespacedName::new(key.namespace.clone(), secret.name.clone())
                    }),
                });
            }
        }
        found
    }
}

/// Match-labels semantics: every selector pair must be present in the labels.
fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
