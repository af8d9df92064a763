use std::collections::BTreeMap;

use klaxon_apis::{
    Build, BuildSpec, GitHubEventName, LocalObjectRef, NamespacedName, Source, Trigger,
    TriggerWhen, WhenGitHub, WhenObjectRef, WhenType,
};
use klaxon_inventory::Inventory;

const NAMESPACE: &str = "namespace";
const REPO_URL: &str = "https://github.com/u/r";

fn build(name: &str, triggers: Vec<TriggerWhen>) -> Build {
    let mut b = Build::new(
        name,
        BuildSpec {
            source: Source { url: Some(REPO_URL.to_string()) },
            trigger: Some(Trigger { when: triggers, secret_ref: None }),
        },
    );
    b.metadata.namespace = Some(NAMESPACE.to_string());
    b
}

fn push_to_main() -> TriggerWhen {
    TriggerWhen {
        when_type: WhenType::GitHub,
        github: Some(WhenGitHub {
            events: vec![GitHubEventName::Push],
            branches: Some(vec!["main".to_string()]),
        }),
        ..TriggerWhen::default()
    }
}

fn pipeline_succeeded() -> TriggerWhen {
    TriggerWhen {
        when_type: WhenType::Pipeline,
        object_ref: Some(WhenObjectRef {
            name: "pipeline".to_string(),
            status: vec!["Succeeded".to_string()],
            ..WhenObjectRef::default()
        }),
        ..TriggerWhen::default()
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn git_search_matches_branch_and_sanitized_url() {
    let inventory = Inventory::new();
    inventory.add(&build("name", vec![push_to_main()]));

    let found = inventory.search_for_git(WhenType::GitHub, "https://github.com/u/r.git", "main");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].build_name, NamespacedName::new(NAMESPACE, "name"));
    assert_eq!(found[0].secret_name, None);

    assert!(inventory.search_for_git(WhenType::GitHub, REPO_URL, "dev").is_empty());
    assert!(inventory.search_for_git(WhenType::GitHub, "https://github.com/u/other", "main").is_empty());
    assert!(inventory.search_for_git(WhenType::Pipeline, REPO_URL, "main").is_empty());
}

#[test]
fn git_search_carries_the_secret_reference() {
    let inventory = Inventory::new();
    let mut b = build("name", vec![push_to_main()]);
    b.spec.trigger.as_mut().unwrap().secret_ref = Some(LocalObjectRef { name: "webhook-secret".to_string() });
    inventory.add(&b);

    let found = inventory.search_for_git(WhenType::GitHub, REPO_URL, "main");
    assert_eq!(found.len(), 1);
    assert_eq!(
        found[0].secret_name,
        Some(NamespacedName::new(NAMESPACE, "webhook-secret"))
    );
}

#[test]
fn add_replaces_and_remove_deletes() {
    let inventory = Inventory::new();
    inventory.add(&build("name", vec![push_to_main()]));
    assert_eq!(inventory.len(), 1);

    // replacing with a trigger-less Build keeps the key but drops the rules
    inventory.add(&build("name", vec![]));
    assert_eq!(inventory.len(), 1);
    assert!(inventory.search_for_git(WhenType::GitHub, REPO_URL, "main").is_empty());

    inventory.remove(&NamespacedName::new(NAMESPACE, "name"));
    assert!(inventory.is_empty());
    // removing twice is fine
    inventory.remove(&NamespacedName::new(NAMESPACE, "name"));
}

#[test]
fn build_without_trigger_is_stored() {
    let inventory = Inventory::new();
    let mut b = build("name", vec![]);
    b.spec.trigger = None;
    inventory.add(&b);
    assert_eq!(inventory.len(), 1);
}

#[test]
fn object_ref_search_by_name() {
    let inventory = Inventory::new();
    inventory.add(&build("name", vec![pipeline_succeeded()]));

    let hit = WhenObjectRef {
        name: "pipeline".to_string(),
        status: vec!["Succeeded".to_string()],
        ..WhenObjectRef::default()
    };
    assert_eq!(inventory.search_for_object_ref(WhenType::Pipeline, &hit).len(), 1);

    let wrong_name = WhenObjectRef { name: "other".to_string(), ..hit.clone() };
    assert!(inventory.search_for_object_ref(WhenType::Pipeline, &wrong_name).is_empty());

    let wrong_status = WhenObjectRef { status: vec!["Failed".to_string()], ..hit };
    assert!(inventory.search_for_object_ref(WhenType::Pipeline, &wrong_status).is_empty());
}

#[test]
fn object_ref_search_by_selector() {
    let inventory = Inventory::new();
    inventory.add(&build(
        "name",
        vec![TriggerWhen {
            when_type: WhenType::Pipeline,
            object_ref: Some(WhenObjectRef {
                status: vec!["Succeeded".to_string()],
                selector: labels(&[("k", "v")]),
                ..WhenObjectRef::default()
            }),
            ..TriggerWhen::default()
        }],
    ));

    let hit = WhenObjectRef {
        status: vec!["Succeeded".to_string()],
        selector: labels(&[("k", "v"), ("extra", "ignored")]),
        ..WhenObjectRef::default()
    };
    assert_eq!(inventory.search_for_object_ref(WhenType::Pipeline, &hit).len(), 1);

    let miss = WhenObjectRef {
        status: vec!["Succeeded".to_string()],
        selector: labels(&[("wrong", "label")]),
        ..WhenObjectRef::default()
    };
    assert!(inventory.search_for_object_ref(WhenType::Pipeline, &miss).is_empty());

    // a clause with a selector never matches a query without labels
    let empty = WhenObjectRef { status: vec!["Succeeded".to_string()], ..WhenObjectRef::default() };
    assert!(inventory.search_for_object_ref(WhenType::Pipeline, &empty).is_empty());
}

#[test]
fn object_ref_clause_without_name_or_selector_never_matches() {
    let inventory = Inventory::new();
    inventory.add(&build(
        "name",
        vec![TriggerWhen {
            when_type: WhenType::Pipeline,
            object_ref: Some(WhenObjectRef {
                status: vec!["Succeeded".to_string()],
                ..WhenObjectRef::default()
            }),
            ..TriggerWhen::default()
        }],
    ));

    let query = WhenObjectRef {
        name: "pipeline".to_string(),
        status: vec!["Succeeded".to_string()],
        ..WhenObjectRef::default()
    };
    assert!(inventory.search_for_object_ref(WhenType::Pipeline, &query).is_empty());
}

#[test]
fn one_result_per_build_even_with_multiple_matching_clauses() {
    let inventory = Inventory::new();
    inventory.add(&build("name", vec![pipeline_succeeded(), pipeline_succeeded()]));

    let query = WhenObjectRef {
        name: "pipeline".to_string(),
        status: vec!["Succeeded".to_string()],
        ..WhenObjectRef::default()
    };
    assert_eq!(inventory.search_for_object_ref(WhenType::Pipeline, &query).len(), 1);
}
