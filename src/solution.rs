//! Readback of a solved assignment into mixing steps.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::errors::{PlanError, PlanResult};
use crate::model::{Assignment, OptimizationMode, ProblemModel};
use crate::sharing::{Provider, SharingPlan};
use crate::solver::{SolveBudget, SolveOutcome, SolveStatus};
use crate::tree::MixForest;

/// One droplet source of a mixing step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepInput {
    pub source: String,
    pub droplets: u64,
}

/// One executed mixing operation: where it sits, what flows in, and how
/// much of the output is never drawn again.
#[derive(Debug, Clone, Serialize)]
pub struct MixingStep {
    pub name: String,
    /// Index of the owning target, or -1 for a peer blend.
    pub target: i64,
    /// Tree level; peer blends sit between their members' levels.
    pub level: f64,
    pub composition: Vec<u64>,
    pub total_input: u64,
    pub waste: u64,
    pub inputs: Vec<StepInput>,
}

impl MixingStep {
    /// Recipe line, e.g. `2 x Reagent1 + 1 x mixer_t0_l2_k0`.
    pub fn recipe(&self) -> String {
        let parts: Vec<String> = self
            .inputs
            .iter()
            .map(|i| format!("{} x {}", i.droplets, i.source))
            .collect();
        parts.join(" + ")
    }
}

impl fmt::Display for MixingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (waste {})",
            self.name,
            self.recipe(),
            self.waste
        )
    }
}

/// A verified plan: every executed step plus the aggregate figures.
#[derive(Debug, Clone, Serialize)]
pub struct SolutionModel {
    pub mode: OptimizationMode,
    pub objective: i64,
    pub steps: Vec<MixingStep>,
    pub total_operations: u64,
    pub total_waste: u64,
    /// Raw droplets consumed, per reagent index.
    pub reagent_usage: Vec<u64>,
    pub total_reagent_droplets: u64,
}

impl SolutionModel {
    /// Build a solution from a raw assignment, verifying every constraint
    /// first.
    #[instrument(level = "debug", skip_all)]
    pub fn from_assignment(
        model: &ProblemModel,
        forest: &MixForest,
        plan: &SharingPlan,
        assignment: &Assignment,
    ) -> PlanResult<Self> {
        model.check(assignment)?;

        let mut steps = Vec::new();
        let mut total_waste = 0;
        let mut reagent_usage = vec![0u64; model.num_reagents()];

        for node in forest.iter_nodes() {
            let vars = match model.node_vars(node.id) {
                Some(v) => v,
                None => {
                    return Err(PlanError::ModelConstruction {
                        reason: format!("model is missing variables for {}", node.id),
                    })
                }
            };
            let total = assignment.value(vars.total_input) as u64;
            let waste = assignment.value(vars.waste) as u64;
            if !node.is_root() {
                total_waste += waste;
            }
            if total == 0 {
                continue;
            }

            let mut inputs = Vec::new();
            for (i, &r) in vars.reagents.iter().enumerate() {
                let n = assignment.value(r) as u64;
                if n > 0 {
                    reagent_usage[i] += n;
                    // 1-based, matching the wire format.
                    inputs.push(StepInput {
                        source: format!("Reagent{}", i + 1),
                        droplets: n,
                    });
                }
            }
            for &l in plan.inbound(node.id) {
                let flow = assignment.value(model.link_vars()[l].flow) as u64;
                if flow == 0 {
                    continue;
                }
                let source = match plan.links()[l].provider {
                    Provider::Node(id) => id.to_string(),
                    Provider::Peer(p) => model.peer_vars()[p].name.clone(),
                };
                inputs.push(StepInput {
                    source,
                    droplets: flow,
                });
            }

            steps.push(MixingStep {
                name: node.id.to_string(),
                target: node.id.target as i64,
                level: node.id.level as f64,
                composition: vars
                    .composition
                    .iter()
                    .map(|&c| assignment.value(c) as u64)
                    .collect(),
                total_input: total,
                waste,
                inputs,
            });
        }

        for (idx, peer) in model.peer_vars().iter().enumerate() {
            let total = assignment.value(peer.total_input) as u64;
            let waste = assignment.value(peer.waste) as u64;
            total_waste += waste;
            if total == 0 {
                continue;
            }

            let candidate = &plan.peers()[idx];
            steps.push(MixingStep {
                name: peer.name.clone(),
                target: -1,
                level: (candidate.a.level + candidate.b.level) as f64 / 2.0 - 0.5,
                composition: peer
                    .composition
                    .iter()
                    .map(|&c| assignment.value(c) as u64)
                    .collect(),
                total_input: total,
                waste,
                inputs: vec![
                    StepInput {
                        source: candidate.a.to_string(),
                        droplets: 1,
                    },
                    StepInput {
                        source: candidate.b.to_string(),
                        droplets: 1,
                    },
                ],
            });
        }

        steps.sort_by(|a, b| a.target.cmp(&b.target).then(a.level.total_cmp(&b.level)));

        let total_operations = steps.len() as u64;
        let total_reagent_droplets = reagent_usage.iter().sum();
        let solution = Self {
            mode: model.mode(),
            objective: model.objective_value(assignment),
            steps,
            total_operations,
            total_waste,
            reagent_usage,
            total_reagent_droplets,
        };
        debug!(
            operations = solution.total_operations,
            waste = solution.total_waste,
            reagents = solution.total_reagent_droplets,
            "solution assembled"
        );
        Ok(solution)
    }

    /// Interpret an engine outcome, turning non-answers into errors.
    pub fn from_outcome(
        model: &ProblemModel,
        forest: &MixForest,
        plan: &SharingPlan,
        outcome: &SolveOutcome,
        budget: &SolveBudget,
    ) -> PlanResult<Self> {
        match (outcome.status, &outcome.assignment) {
            (SolveStatus::Infeasible, _) => Err(PlanError::Infeasible {
                reason: "the engine proved the model has no solution".into(),
            }),
            (SolveStatus::BudgetExhausted, _) | (_, None) => Err(PlanError::BudgetExhausted {
                elapsed: budget.max_time.unwrap_or(Duration::ZERO),
            }),
            (_, Some(assignment)) => Self::from_assignment(model, forest, plan, assignment),
        }
    }
}
