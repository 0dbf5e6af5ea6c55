//! Budget checks against accumulated phase results and loaded configuration

use forgeflow::budget::check_budget;
use forgeflow::config::{BudgetConfig, EngineConfig};
use forgeflow_sdk::{PhaseResult, WorkflowState};
use std::path::Path;

fn result(agent_id: &str, cost_usd: f64, turns_used: u32) -> PhaseResult {
    PhaseResult {
        agent_id: agent_id.to_string(),
        success: true,
        output: serde_json::Value::Null,
        files_created: vec![],
        files_modified: vec![],
        commits: vec![],
        cost_usd,
        turns_used,
    }
}

#[test]
fn test_spend_accumulates_until_limit() {
    let config = BudgetConfig::new(1.0, 20).unwrap();
    let mut state = WorkflowState::new("s1", "feature", "Add login", "/tmp");

    state.record_phase_result(result("architect", 0.4, 3));
    let status = check_budget(&state, &config);
    assert!(status.within_budget);
    assert!((status.remaining_usd - 0.6).abs() < 1e-9);
    assert_eq!(status.remaining_turns, 20);

    state.record_phase_result(result("implementer", 0.6, 5));
    let status = check_budget(&state, &config);
    assert!(!status.within_budget);
    assert_eq!(status.remaining_usd, 0.0);
    assert_eq!(state.total_turns, 8);
}

#[test]
fn test_rerun_phase_still_counts_both_attempts() {
    let config = BudgetConfig::new(1.0, 10).unwrap();
    let mut state = WorkflowState::new("s1", "feature", "Add login", "/tmp");

    state.record_spend(0.5, 2);
    state.record_phase_result(result("implementer", 0.3, 2));
    assert_eq!(state.phase_results.len(), 1);
    assert!((state.total_cost_usd - 0.8).abs() < 1e-9);
    assert!(check_budget(&state, &config).within_budget);
}

#[test]
fn test_total_turn_cap_shrinks_remaining_turns() {
    let config = BudgetConfig::new(10.0, 30)
        .unwrap()
        .with_max_total_turns(40)
        .unwrap();
    let mut state = WorkflowState::new("s1", "bugfix", "Fix crash", "/tmp");
    state.record_phase_result(result("test-generator", 0.1, 25));

    let status = check_budget(&state, &config);
    assert!(status.within_budget);
    assert_eq!(status.remaining_turns, 15);

    state.record_phase_result(result("implementer", 0.1, 15));
    assert!(!check_budget(&state, &config).within_budget);
}

#[test]
fn test_budget_from_yaml_and_environment() {
    let yaml = "budget:\n  max_budget_usd: 2.5\n  max_turns_per_agent: 12\n";
    let mut config = EngineConfig::from_yaml_str(yaml, Path::new("config.yaml")).unwrap();
    assert_eq!(config.budget.max_budget_usd(), 2.5);
    assert_eq!(config.budget.max_turns_per_agent(), 12);

    config
        .apply_env(|key| match key {
            "FORGEFLOW_MAX_BUDGET_USD" => Some("0.75".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.budget.max_budget_usd(), 0.75);
    assert_eq!(config.budget.max_turns_per_agent(), 12);
}

#[test]
fn test_invalid_budgets_are_rejected() {
    assert!(BudgetConfig::new(0.0, 10).is_err());
    assert!(BudgetConfig::new(-1.0, 10).is_err());
    assert!(BudgetConfig::new(1.0, 0).is_err());

    let yaml = "budget:\n  max_budget_usd: 0\n";
    assert!(EngineConfig::from_yaml_str(yaml, Path::new("config.yaml")).is_err());
}
