//! Pipeline-orchestrator resources: the custom-task `Run` and `PipelineRun`.
//!
//! Only the fields klaxon observes or mutates are declared; everything else
//! round-trips through the API server untouched by the controllers here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::duration::parse_go_duration;

/// Condition type marking overall completion on Run and PipelineRun statuses.
pub const CONDITION_SUCCEEDED: &str = "Succeeded";

/// Spec object for the custom-task `Run` resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "tekton.dev",
    version = "v1alpha1",
    kind = "Run",
    namespaced,
    status = "RunStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// Foreign object the orchestrator delegates this step to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<TaskRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    pub name: String,
    pub value: ParamData,
}

/// Parameter payload; serialized as either a bare string or a string list.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ParamData {
    String(String),
    Array(Vec<String>),
}

impl Default for ParamData {
    fn default() -> Self {
        ParamData::String(String::new())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    /// Opaque blob reserved for the foreign controller owning the Run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_fields: Option<serde_json::Value>,
}

/// Knative-shaped status condition, shared by Run and PipelineRun.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Run {
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// A Run is terminal once the Succeeded condition settled to True or False.
    pub fn is_done(&self) -> bool {
        matches!(self.condition(CONDITION_SUCCEEDED),
            Some(c) if c.status == "True" || c.status == "False")
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.condition(CONDITION_SUCCEEDED), Some(c) if c.status == "True")
    }

    /// Decode `status.extraFields` into the given shape; an absent blob
    /// decodes to the default value.
    pub fn decode_extra_fields<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned + Default,
    {
        match self.status.as_ref().and_then(|s| s.extra_fields.clone()) {
            Some(value) => serde_json::from_value(value),
            None => Ok(T::default()),
        }
    }
}

/// Spec object for the `PipelineRun` resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "tekton.dev",
    version = "v1beta1",
    kind = "PipelineRun",
    namespaced,
    status = "PipelineRunStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<PipelineRef>,
    /// Cancellation request; the orchestrator accepts a couple of spellings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Go-format duration string, e.g. "1h30m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    /// Resolved pipeline; nil until the orchestrator observed the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_spec: Option<PipelineSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<PipelineTask>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTask {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,
}

impl PipelineRun {
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.condition(CONDITION_SUCCEEDED),
            Some(c) if c.status == "True" || c.status == "False")
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.condition(CONDITION_SUCCEEDED), Some(c) if c.status == "True")
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.spec.status.as_deref(), Some("Cancelled") | Some("PipelineRunCancelled"))
    }

    pub fn has_started(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.start_time.is_some())
    }

    /// Whether the run exceeded its declared timeout. Without a parseable
    /// timeout or a start time there is nothing to exceed.
    pub fn is_timed_out(&self) -> bool {
        let Some(timeout) = self.spec.timeout.as_deref().and_then(|t| parse_go_duration(t).ok())
        else {
            return false;
        };
        let Some(start) = self.status.as_ref().and_then(|s| s.start_time.as_ref()) else {
            return false;
        };
        if timeout.is_zero() {
            return false;
        }
        let elapsed = chrono::Utc::now().signed_duration_since(start.0);
        elapsed.num_milliseconds() >= timeout.as_millis() as i64
    }
}
