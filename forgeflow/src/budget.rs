//! Budget and turn governor
//!
//! Pure accounting over a [`WorkflowState`]. Nothing here mutates state or
//! performs I/O; the orchestrator decides what to do with the verdict.

use forgeflow_sdk::WorkflowState;
use serde::Serialize;

use crate::config::BudgetConfig;

/// Verdict of a budget check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub within_budget: bool,
    /// Never negative
    pub remaining_usd: f64,
    /// Turns the next agent call may use
    pub remaining_turns: u32,
}

pub fn check_budget(state: &WorkflowState, config: &BudgetConfig) -> BudgetStatus {
    check_spend(state.total_cost_usd, state.total_turns, config)
}

/// Same verdict for an explicit running total, used while a phase is in flight
pub fn check_spend(total_cost_usd: f64, total_turns: u32, config: &BudgetConfig) -> BudgetStatus {
    let mut within_budget = total_cost_usd < config.max_budget_usd();
    let remaining_usd = (config.max_budget_usd() - total_cost_usd).max(0.0);

    let remaining_turns = match config.max_total_turns() {
        Some(max_total) => {
            let left = max_total.saturating_sub(total_turns);
            if left == 0 {
                within_budget = false;
            }
            left.min(config.max_turns_per_agent())
        }
        None => config.max_turns_per_agent(),
    };

    BudgetStatus {
        within_budget,
        remaining_usd,
        remaining_turns,
    }
}
