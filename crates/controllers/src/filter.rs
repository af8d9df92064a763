//! Event pre-filters deciding which objects reach the work queues.

use kube::ResourceExt;

use klaxon_apis::{
    BuildRun, NamespacedName, PipelineRun, Run, SHIPWRIGHT_API_VERSION, TEKTON_API_V1ALPHA1,
};

use crate::PIPELINE_RUN_NAME_KEY;

/// Whether the Run delegates to a Build of ours.
pub fn run_references_build(run: &Run) -> bool {
    matches!(run.spec.r#ref.as_ref(),
        Some(r) if r.api_version == SHIPWRIGHT_API_VERSION && r.kind == "Build")
}

/// The Run owning this BuildRun, if any. BuildRuns created for custom tasks
/// carry an owner reference back to their Run.
pub fn build_run_owned_by_run(build_run: &BuildRun) -> Option<NamespacedName> {
    build_run
        .owner_references()
        .iter()
        .find(|owner| owner.api_version == TEKTON_API_V1ALPHA1 && owner.kind == "Run")
        .map(|owner| {
            NamespacedName::new(build_run.namespace().unwrap_or_default(), owner.name.clone())
        })
}

/// Whether a PipelineRun should be considered for fan-out: it must be
/// observable (resolved pipeline spec), must not be a custom-task carrier
/// (those belong to the Run loop), and must not bear the sentinel label of an
/// earlier fan-out.
pub fn pipeline_run_eligible(pipeline_run: &PipelineRun) -> bool {
    let Some(status) = pipeline_run.status.as_ref() else {
        return false;
    };
    if status.pipeline_spec.is_none() {
        return false;
    }
    if references_custom_task(pipeline_run) {
        return false;
    }
    !pipeline_run_name_matches_label(pipeline_run)
}

/// Whether any task of the resolved pipeline points at our API group.
fn references_custom_task(pipeline_run: &PipelineRun) -> bool {
    pipeline_run
        .status
        .as_ref()
        .and_then(|status| status.pipeline_spec.as_ref())
        .map(|spec| {
            spec.tasks.iter().any(|task| {
                matches!(task.task_ref.as_ref(), Some(r) if r.api_version == SHIPWRIGHT_API_VERSION)
            })
        })
        .unwrap_or(false)
}

/// Whether the sentinel label records this very object, meaning the fan-out
/// already happened.
pub(crate) fn pipeline_run_name_matches_label(pipeline_run: &PipelineRun) -> bool {
    pipeline_run.labels().get(PIPELINE_RUN_NAME_KEY) == Some(&pipeline_run.name_any())
}
