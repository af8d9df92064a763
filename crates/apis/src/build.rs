//! Build resource: a declarative build definition carrying trigger rules.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec object for the `Build` resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "shipwright.io", version = "v1alpha1", kind = "Build", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Where the artifact sources come from.
    #[serde(default)]
    pub source: Source,
    /// Trigger rules; absent means the Build is never triggered by klaxon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Repository URL, compared against webhook payloads after sanitizing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// The `When` clauses; any accepting clause triggers the Build.
    #[serde(default)]
    pub when: Vec<TriggerWhen>,
    /// Secret in the Build's namespace holding the shared webhook signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LocalObjectRef {
    pub name: String,
}

/// A single trigger predicate. The sub-record matching `type` carries the
/// event-specific constraints.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerWhen {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub when_type: WhenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<WhenGitHub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<WhenImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<WhenObjectRef>,
}

impl TriggerWhen {
    /// Branch names constrained by this clause for the given trigger type.
    pub fn branches(&self, when_type: WhenType) -> &[String] {
        if when_type == WhenType::GitHub {
            if let Some(github) = &self.github {
                if let Some(branches) = &github.branches {
                    return branches;
                }
            }
        }
        &[]
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum WhenType {
    #[default]
    GitHub,
    Image,
    Pipeline,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WhenGitHub {
    /// Event names this clause reacts to.
    #[serde(default)]
    pub events: Vec<GitHubEventName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum GitHubEventName {
    Push,
    PullRequest,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WhenImage {
    #[serde(default)]
    pub names: Vec<String>,
}

/// Reference to an observed object, matched by name or by labels plus an
/// optional status constraint. Also the query shape for inventory searches.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WhenObjectRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Vec<String>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}
