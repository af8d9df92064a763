//! Typed declarations for the upstream resources klaxon watches and writes.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

mod build;
mod buildrun;
mod duration;
mod tekton;

pub use build::{
    Build, BuildSpec, GitHubEventName, LocalObjectRef, Source, Trigger, TriggerWhen, WhenGitHub,
    WhenImage, WhenObjectRef, WhenType,
};
pub use buildrun::{
    BuildRef, BuildRun, BuildRunCondition, BuildRunSpec, BuildRunStatus, ParamValue, SingleValue,
};
pub use duration::parse_go_duration;
pub use tekton::{
    Condition, Param, ParamData, PipelineRef, PipelineRun, PipelineRunSpec, PipelineRunStatus,
    PipelineSpec, PipelineTask, Run, RunSpec, RunStatus, TaskRef, CONDITION_SUCCEEDED,
};

/// API version of the Build/BuildRun group, as it appears in `apiVersion` fields.
pub const SHIPWRIGHT_API_VERSION: &str = "shipwright.io/v1alpha1";

/// API version of the custom-task Run resource.
pub const TEKTON_API_V1ALPHA1: &str = "tekton.dev/v1alpha1";

/// API version of the PipelineRun resource.
pub const TEKTON_API_V1BETA1: &str = "tekton.dev/v1beta1";

/// Namespace-qualified object identity, the key type used across the workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Identity of a namespaced object, `metadata.namespace` defaulting to empty.
    pub fn from_resource(obj: &impl ResourceExt) -> Self {
        Self { namespace: obj.namespace().unwrap_or_default(), name: obj.name_any() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid object key {0:?}, expected \"namespace/name\"")]
pub struct InvalidKey(pub String);

impl FromStr for NamespacedName {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidKey(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let nn = NamespacedName::new("default", "build-1");
        assert_eq!(nn.to_string(), "default/build-1");
        assert_eq!(nn.to_string().parse::<NamespacedName>().unwrap(), nn);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!("".parse::<NamespacedName>().is_err());
        assert!("noslash".parse::<NamespacedName>().is_err());
        assert!("a/b/c".parse::<NamespacedName>().is_err());
        assert!("ns/".parse::<NamespacedName>().is_err());
    }
}
