use std::collections::BTreeMap;

use klaxon_apis::{
    BuildRun, BuildRunSpec, NamespacedName, PipelineRun, PipelineRunSpec, PipelineRunStatus,
    PipelineSpec, PipelineTask, Run, RunSpec, TaskRef, SHIPWRIGHT_API_VERSION, TEKTON_API_V1ALPHA1,
};
use klaxon_controllers::{
    build_run_owned_by_run, pipeline_run_eligible, run_references_build, PIPELINE_RUN_NAME_KEY,
};

const NAMESPACE: &str = "namespace";

fn pipeline_run(name: &str) -> PipelineRun {
    let mut pr = PipelineRun::new(name, PipelineRunSpec::default());
    pr.metadata.namespace = Some(NAMESPACE.to_string());
    pr.status = Some(PipelineRunStatus {
        pipeline_spec: Some(PipelineSpec::default()),
        ..PipelineRunStatus::default()
    });
    pr
}

#[test]
fn pipeline_run_without_resolved_spec_is_filtered() {
    let mut pr = pipeline_run("complete");
    assert!(pipeline_run_eligible(&pr));

    pr.status.as_mut().unwrap().pipeline_spec = None;
    assert!(!pipeline_run_eligible(&pr));

    pr.status = None;
    assert!(!pipeline_run_eligible(&pr));
}

#[test]
fn pipeline_run_carrying_a_custom_task_is_filtered() {
    let mut pr = pipeline_run("custom-task");
    pr.status.as_mut().unwrap().pipeline_spec = Some(PipelineSpec {
        tasks: vec![PipelineTask {
            name: "shipwright".to_string(),
            task_ref: Some(TaskRef {
                api_version: SHIPWRIGHT_API_VERSION.to_string(),
                name: "name".to_string(),
                ..TaskRef::default()
            }),
        }],
    });
    assert!(!pipeline_run_eligible(&pr));

    // ordinary task references pass
    let mut ordinary = pipeline_run("ordinary");
    ordinary.status.as_mut().unwrap().pipeline_spec = Some(PipelineSpec {
        tasks: vec![PipelineTask { name: "task".to_string(), task_ref: None }],
    });
    assert!(pipeline_run_eligible(&ordinary));
}

#[test]
fn pipeline_run_with_self_sentinel_label_is_filtered() {
    let mut pr = pipeline_run("complete");
    pr.metadata.labels = Some(BTreeMap::from([(
        PIPELINE_RUN_NAME_KEY.to_string(),
        "complete".to_string(),
    )]));
    assert!(!pipeline_run_eligible(&pr));

    // a stale sentinel from a different object does not block processing
    pr.metadata.labels = Some(BTreeMap::from([(
        PIPELINE_RUN_NAME_KEY.to_string(),
        "other".to_string(),
    )]));
    assert!(pipeline_run_eligible(&pr));
}

#[test]
fn run_must_reference_a_build() {
    let mut run = Run::new("run", RunSpec::default());
    assert!(!run_references_build(&run));

    run.spec.r#ref = Some(TaskRef {
        api_version: SHIPWRIGHT_API_VERSION.to_string(),
        kind: "Build".to_string(),
        name: "name".to_string(),
    });
    assert!(run_references_build(&run));

    run.spec.r#ref.as_mut().unwrap().kind = "Task".to_string();
    assert!(!run_references_build(&run));

    run.spec.r#ref = Some(TaskRef {
        api_version: "tekton.dev/v1beta1".to_string(),
        kind: "Build".to_string(),
        name: "name".to_string(),
    });
    assert!(!run_references_build(&run));
}

#[test]
fn build_run_owner_is_extracted_from_owner_references() {
    let mut build_run = BuildRun::new("buildrun", BuildRunSpec::default());
    build_run.metadata.namespace = Some(NAMESPACE.to_string());
    assert_eq!(build_run_owned_by_run(&build_run), None);

    build_run.metadata.owner_references = Some(vec![
        k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "nope".to_string(),
            ..Default::default()
        },
        k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
            api_version: TEKTON_API_V1ALPHA1.to_string(),
            kind: "Run".to_string(),
            name: "run".to_string(),
            ..Default::default()
        },
    ]);
    assert_eq!(
        build_run_owned_by_run(&build_run),
        Some(NamespacedName::new(NAMESPACE, "run"))
    );
}
