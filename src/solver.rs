//! Seam between the planner and an external constraint engine.
//!
//! The planner only produces a [`ProblemModel`] and consumes a
//! [`SolveOutcome`]; how the assignment is found is entirely up to the
//! engine behind the trait.

use std::time::Duration;

use crate::errors::PlanResult;
use crate::model::{Assignment, ProblemModel};

/// Resource limits handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveBudget {
    pub max_time: Option<Duration>,
    /// Stop once the objective is proven within this absolute gap.
    pub absolute_gap: Option<f64>,
    pub workers: Option<usize>,
}

impl Default for SolveBudget {
    fn default() -> Self {
        Self {
            max_time: Some(Duration::from_secs(2000)),
            absolute_gap: Some(0.99),
            workers: Some(16),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Best assignment proven optimal within the gap.
    Optimal,
    /// An assignment was found but optimality was not proven.
    Feasible,
    Infeasible,
    /// The budget ran out before any assignment was found.
    BudgetExhausted,
}

/// What an engine hands back: a status, the best assignment if one exists,
/// and its objective value.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    pub assignment: Option<Assignment>,
    pub objective: Option<i64>,
}

impl SolveOutcome {
    pub fn infeasible() -> Self {
        Self {
            status: SolveStatus::Infeasible,
            assignment: None,
            objective: None,
        }
    }

    pub fn budget_exhausted() -> Self {
        Self {
            status: SolveStatus::BudgetExhausted,
            assignment: None,
            objective: None,
        }
    }

    pub fn solved(status: SolveStatus, assignment: Assignment, objective: i64) -> Self {
        Self {
            status,
            assignment: Some(assignment),
            objective: Some(objective),
        }
    }
}

/// A constraint engine able to search the lowered model.
pub trait SolverEngine {
    fn solve(&self, model: &ProblemModel, budget: &SolveBudget) -> PlanResult<SolveOutcome>;
}
