use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use groundwork_core::addr::InstanceAddr;
use groundwork_core::value::{Path, Value};

use crate::config::{self, Config};
use crate::interrupt::InterruptState;
use crate::provider::ProviderPool;
use crate::state::State;
use crate::testing::{triggers, MockProvider, ReadBehavior};

use super::objects::{Action, ActionReason, CheckStatus, PlanMode};
use super::{plan, PlanOptions};

fn load(src: &str) -> Config {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.gw.hcl"), src).unwrap();
    let (config, diags) = config::load_dir(dir.path());
    assert!(!diags.has_errors(), "{:?}", diags);
    config
}

async fn pool_with_mock(mock: Arc<MockProvider>) -> ProviderPool {
    let pool = ProviderPool::new(HashMap::new(), Default::default());
    pool.insert("null", mock).await;
    pool
}

async fn plan_simple(
    config: &Config,
    variables: BTreeMap<String, Value>,
    prior: &State,
    mock: Arc<MockProvider>,
    options: PlanOptions,
) -> (super::objects::Plan, groundwork_core::diag::Diagnostics) {
    let pool = pool_with_mock(mock).await;
    plan(
        config,
        &variables,
        prior,
        &pool,
        &options,
        &InterruptState::new(),
    )
    .await
    .unwrap()
}

fn addr(s: &str) -> InstanceAddr {
    s.parse().unwrap()
}

const SIMPLE: &str = r#"
resource "null" "a" {
  triggers = { x = "1" }
}
"#;

#[tokio::test]
async fn create_from_empty_state() {
    let config = load(SIMPLE);
    let mock = Arc::new(MockProvider::new());
    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock,
        PlanOptions::default(),
    )
    .await;

    assert!(!diags.has_errors(), "{:?}", diags);
    assert!(!plan.errored);
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert_eq!(change.action, Action::Create);
    // The computed id is unknown until apply.
    let after = change.after_value().unwrap();
    assert!(after.value_at(&Path::attr("id")).unwrap().is_unknown());
    assert!(plan.has_changes());
}

#[tokio::test]
async fn replan_after_apply_is_no_op() {
    // Scenario: create, apply, re-plan; the second plan must be empty.
    let config = load(SIMPLE);
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;

    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let (second, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let change = second.change_for(&addr("null.a")).unwrap();
    assert_eq!(change.action, Action::NoOp, "{:?}", change);
    assert!(!second.has_changes());
}

#[tokio::test]
async fn changed_requires_replace_attribute_plans_replacement() {
    let config = load(r#"resource "null" "a" { triggers = { x = "2" } }"#);
    let mock = Arc::new(MockProvider::new());

    // Prior state has x = "1".
    let created = load(SIMPLE);
    let (first, _) = plan_simple(
        &created,
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert_eq!(change.action, Action::DeleteThenCreate);
    assert_eq!(
        change.action_reason,
        Some(ActionReason::ReplaceBecauseCannotUpdate)
    );
    assert_eq!(change.replace_paths, vec![Path::attr("triggers")]);
}

#[tokio::test]
async fn create_before_destroy_reverses_replace_order() {
    let src_v2 = r#"
    resource "null" "a" {
      triggers = { x = "2" }
      lifecycle { create_before_destroy = true }
    }
    "#;
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &load(SIMPLE),
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let (plan, _) = plan_simple(
        &load(src_v2),
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert_eq!(change.action, Action::CreateThenDelete);
}

#[tokio::test]
async fn sensitive_variable_propagates_to_after_sensitive() {
    let config = load(
        r#"
        variable "pw" {
          type      = string
          sensitive = true
        }
        resource "null" "y" {
          password = var.pw
        }
        "#,
    );
    let mock = Arc::new(MockProvider::new());
    let variables = [("pw".to_string(), Value::string("hunter2").mark_sensitive())]
        .into_iter()
        .collect();
    let (plan, diags) = plan_simple(
        &config,
        variables,
        &State::new(),
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);

    let change = plan.change_for(&addr("null.y")).unwrap();
    let json = change.to_json();
    assert_eq!(
        json["change"]["after_sensitive"]["password"],
        serde_json::json!(true)
    );
    // The raw value never appears unredacted in the external rendering of
    // sensitivity shapes.
    assert_eq!(
        json["change"]["after"]["password"],
        serde_json::json!("hunter2")
    );
}

#[tokio::test]
async fn unknown_count_defers_with_placeholder() {
    let config = load(
        r#"
        variable "n" { type = number }
        resource "null" "a" {
          count    = var.n
          triggers = { x = "1" }
        }
        "#,
    );
    let mock = Arc::new(MockProvider::new());
    let variables = [(
        "n".to_string(),
        Value::unknown(groundwork_core::types::Type::Number),
    )]
    .into_iter()
    .collect();
    let (plan, diags) = plan_simple(
        &config,
        variables,
        &State::new(),
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);

    assert_eq!(plan.resource_changes.len(), 1);
    let change = &plan.resource_changes[0];
    assert_eq!(
        change.action_reason,
        Some(ActionReason::ReadBecauseConfigUnknown)
    );
    assert!(change.deferred.is_some());
}

#[tokio::test]
async fn drift_is_detected_and_restored() {
    // State says x="1"; the provider reports x="bar"; config wants x="1".
    let config = load(SIMPLE);
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let drifted = {
        let applied = state.get(&addr("null.a"), None).unwrap();
        let mut v = applied.value(&groundwork_core::types::Type::Any);
        v.set_at(&Path::attr("triggers"), triggers(&[("x", "bar")]));
        v
    };
    mock.set_read_behavior(ReadBehavior::Drifted(drifted));

    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);

    // Drift recorded: bar is what the provider sees now.
    assert_eq!(plan.resource_drift.len(), 1);
    let drift = &plan.resource_drift[0];
    assert_eq!(drift.action, Action::Update);

    // And the change restores the configured value; triggers is a
    // requires-replace attribute so restoration is a replacement.
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert!(change.action.is_replace());
    let after = change.after_value().unwrap();
    assert_eq!(
        after
            .value_at(&Path(vec![
                groundwork_core::value::PathStep::Attr("triggers".into()),
                groundwork_core::value::PathStep::Attr("x".into()),
            ]))
            .unwrap()
            .as_str(),
        Some("1")
    );
}

#[tokio::test]
async fn refresh_only_produces_no_changes() {
    let config = load(SIMPLE);
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    mock.set_read_behavior(ReadBehavior::Gone);
    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions {
            mode: PlanMode::RefreshOnly,
            ..Default::default()
        },
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    assert!(plan.resource_changes.iter().all(|c| c.action.is_no_op()));
    assert_eq!(plan.resource_drift.len(), 1);
    assert_eq!(plan.resource_drift[0].action, Action::Delete);
    assert!(!plan.applyable());
}

#[tokio::test]
async fn destroy_mode_deletes_everything() {
    let config = load(SIMPLE);
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions {
            mode: PlanMode::Destroy,
            ..Default::default()
        },
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert_eq!(change.action, Action::Delete);
}

#[tokio::test]
async fn removed_config_plans_delete_with_reason() {
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &load(SIMPLE),
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    // New config no longer declares null.a.
    let config = load(r#"resource "null" "other" { triggers = { x = "1" } }"#);
    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let delete = plan
        .resource_changes
        .iter()
        .find(|c| c.address == addr("null.a"))
        .unwrap();
    assert_eq!(delete.action, Action::Delete);
    assert_eq!(
        delete.action_reason,
        Some(ActionReason::DeleteBecauseNoResourceConfig)
    );
}

#[tokio::test]
async fn count_shrink_deletes_high_indexes() {
    let mock = Arc::new(MockProvider::new());
    let big = load(r#"resource "null" "a" { count = 3 triggers = { x = "1" } }"#);
    let (first, diags) = plan_simple(
        &big,
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    assert_eq!(first.resource_changes.len(), 3);
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let small = load(r#"resource "null" "a" { count = 1 triggers = { x = "1" } }"#);
    let (plan, diags) = plan_simple(
        &small,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let deleted: Vec<String> = plan
        .resource_changes
        .iter()
        .filter(|c| c.action == Action::Delete)
        .map(|c| c.address.to_string())
        .collect();
    assert_eq!(deleted, vec!["null.a[1]", "null.a[2]"]);
    for c in plan.resource_changes.iter().filter(|c| c.action == Action::Delete) {
        assert_eq!(c.action_reason, Some(ActionReason::DeleteBecauseCountIndex));
    }
}

#[tokio::test]
async fn for_each_expansion_keys_instances() {
    let config = load(
        r#"
        resource "null" "a" {
          for_each = { alpha = "1", beta = "2" }
          triggers = { v = each.value }
        }
        "#,
    );
    let mock = Arc::new(MockProvider::new());
    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let addrs: Vec<String> = plan
        .resource_changes
        .iter()
        .map(|c| c.address.to_string())
        .collect();
    assert_eq!(addrs, vec![r#"null.a["alpha"]"#, r#"null.a["beta"]"#]);

    let alpha = plan.change_for(&addr(r#"null.a["alpha"]"#)).unwrap();
    let after = alpha.after_value().unwrap();
    assert_eq!(
        after
            .value_at(&Path(vec![
                groundwork_core::value::PathStep::Attr("triggers".into()),
                groundwork_core::value::PathStep::Attr("v".into()),
            ]))
            .unwrap()
            .as_str(),
        Some("1")
    );
}

#[tokio::test]
async fn tainted_instances_plan_replacement() {
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &load(SIMPLE),
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let mut tainted = state.get(&addr("null.a"), None).unwrap().clone();
    tainted.tainted = true;
    state.put(tainted);

    let (plan, _) = plan_simple(
        &load(SIMPLE),
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert!(change.action.is_replace());
    assert_eq!(
        change.action_reason,
        Some(ActionReason::ReplaceBecauseTainted)
    );
}

#[tokio::test]
async fn replace_by_request() {
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &load(SIMPLE),
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    let (plan, _) = plan_simple(
        &load(SIMPLE),
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions {
            replace: vec!["null.a".to_string()],
            ..Default::default()
        },
    )
    .await;
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert!(change.action.is_replace());
    assert_eq!(change.action_reason, Some(ActionReason::ReplaceByRequest));
}

#[tokio::test]
async fn ignore_changes_holds_prior_value() {
    let mock = Arc::new(MockProvider::new());
    let (first, _) = plan_simple(
        &load(SIMPLE),
        BTreeMap::new(),
        &State::new(),
        mock.clone(),
        PlanOptions::default(),
    )
    .await;
    let pool = pool_with_mock(mock.clone()).await;
    let mut state = State::new();
    crate::apply::apply(
        &first,
        &mut state,
        &pool,
        &crate::apply::ApplyOptions::default(),
        &InterruptState::new(),
    )
    .await
    .unwrap();

    // Config changes x but declares triggers ignored: no change planned.
    let config = load(
        r#"
        resource "null" "a" {
          triggers = { x = "changed" }
          lifecycle { ignore_changes = ["triggers"] }
        }
        "#,
    );
    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &state,
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let change = plan.change_for(&addr("null.a")).unwrap();
    assert_eq!(change.action, Action::NoOp, "{:?}", change);
}

#[tokio::test]
async fn variable_validation_failures_error_the_plan() {
    let config = load(
        r#"
        variable "env" {
          type = string
          validation {
            condition     = var.env == "prod"
            error_message = "env must be prod"
          }
        }
        resource "null" "a" { triggers = { e = var.env } }
        "#,
    );
    let mock = Arc::new(MockProvider::new());
    let variables = [("env".to_string(), Value::string("dev"))]
        .into_iter()
        .collect();
    let (plan, diags) = plan_simple(
        &config,
        variables,
        &State::new(),
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(diags.has_errors());
    assert!(plan.errored);
    assert!(plan
        .checks
        .iter()
        .any(|c| c.status == CheckStatus::Fail && c.problems.iter().any(|p| p.contains("prod"))));
}

#[tokio::test]
async fn undeclared_sensitive_output_fails() {
    let config = load(
        r#"
        variable "pw" {
          type      = string
          sensitive = true
        }
        output "leak" { value = var.pw }
        "#,
    );
    let mock = Arc::new(MockProvider::new());
    let variables = [("pw".to_string(), Value::string("s3cret").mark_sensitive())]
        .into_iter()
        .collect();
    let (plan, diags) = plan_simple(
        &config,
        variables,
        &State::new(),
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(diags.has_errors());
    assert!(plan.errored);
    assert!(diags
        .iter()
        .any(|d| d.summary.contains("must be declared sensitive")));
}

#[tokio::test]
async fn targets_prune_unrelated_changes() {
    let config = load(
        r#"
        resource "null" "a" { triggers = { x = "1" } }
        resource "null" "b" { triggers = { y = null.a.id } }
        resource "null" "c" { triggers = { z = "3" } }
        "#,
    );
    let mock = Arc::new(MockProvider::new());
    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock,
        PlanOptions {
            targets: vec!["null.b".to_string()],
            ..Default::default()
        },
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let addrs: Vec<String> = plan
        .resource_changes
        .iter()
        .map(|c| c.address.to_string())
        .collect();
    // b plus its dependency a; c pruned.
    assert_eq!(addrs, vec!["null.a", "null.b"]);
}

#[tokio::test]
async fn output_changes_track_prior_state() {
    let config = load(
        r#"
        resource "null" "a" { triggers = { x = "1" } }
        output "id" { value = null.a.id }
        "#,
    );
    let mock = Arc::new(MockProvider::new());
    let (plan, diags) = plan_simple(
        &config,
        BTreeMap::new(),
        &State::new(),
        mock,
        PlanOptions::default(),
    )
    .await;
    assert!(!diags.has_errors(), "{:?}", diags);
    let change = &plan.output_changes["id"];
    assert_eq!(change.action, Action::Create);
}
