//! End-to-end pipeline: trees, sharing candidates, constraint model, and a
//! hand-verified assignment read back as a solution.

use mixplan::model::{Assignment, OptimizationMode, ProblemModel};
use mixplan::sharing::{Provider, SharingPlan, SharingResolver};
use mixplan::solution::SolutionModel;
use mixplan::solver::{SolveBudget, SolveOutcome, SolveStatus, SolverEngine};
use mixplan::target::{NodeId, Target};
use mixplan::tree::{MixForest, TreeBuilder};
use mixplan::{ModelBuilder, PlanConfig, PlanError, PlanResult};

fn example_targets() -> Vec<Target> {
    vec![
        Target::new("A", vec![2, 11, 5], vec![3, 2, 3]),
        Target::new("B", vec![12, 5, 1], vec![3, 2, 3]),
    ]
}

fn pipeline(mode: OptimizationMode) -> (MixForest, SharingPlan, ProblemModel) {
    mixplan::util::testing::init_test_setup();
    let config = PlanConfig::default();
    let forest = TreeBuilder::new(config.max_mixer_size)
        .build(&example_targets())
        .expect("forest");
    let plan = SharingResolver::new(&config).resolve(&forest);
    let model = ModelBuilder::build(&forest, &plan, mode, &config).expect("model");
    (forest, plan, model)
}

fn set_node(
    model: &ProblemModel,
    a: &mut Assignment,
    id: NodeId,
    comp: [i64; 3],
    reagents: [i64; 3],
    total: i64,
    waste: i64,
) {
    let vars = model.node_vars(id).expect("node vars");
    for i in 0..3 {
        a.set(vars.composition[i], comp[i]);
        a.set(vars.reagents[i], reagents[i]);
    }
    a.set(vars.total_input, total);
    a.set(vars.active, i64::from(total > 0));
    a.set(vars.waste, waste);
}

fn set_flow(
    model: &ProblemModel,
    plan: &SharingPlan,
    a: &mut Assignment,
    consumer: NodeId,
    provider: NodeId,
    flow: i64,
) {
    let idx = plan
        .links()
        .iter()
        .position(|l| l.consumer == consumer && l.provider == Provider::Node(provider))
        .expect("candidate link");
    let link = &model.link_vars()[idx];
    a.set(link.flow, flow);
    a.set(link.selected, 1);

    let provider_vars = model.node_vars(provider).expect("provider vars");
    for i in 0..3 {
        let c = a.value(provider_vars.composition[i]);
        a.set(link.blended[i], c * flow);
    }
}

/// Assignment mixing two shared leaves, one shared mid-level blend, and two
/// half-used mid-level mixers. Total waste 2 across 7 operations.
fn shared_leaves_assignment(model: &ProblemModel, plan: &SharingPlan) -> Assignment {
    let mut a = Assignment::zeroed(model);

    let root0 = NodeId::new(0, 0, 0);
    let c_mix = NodeId::new(0, 1, 0);
    let x1 = NodeId::new(0, 2, 0);
    let x2 = NodeId::new(0, 2, 1);
    let root1 = NodeId::new(1, 0, 0);
    let c_p = NodeId::new(1, 1, 0);
    let c_p2 = NodeId::new(1, 1, 1);

    set_node(model, &mut a, root0, [2, 11, 5], [0, 0, 0], 3, 0);
    set_node(model, &mut a, c_mix, [2, 3, 1], [0, 0, 0], 2, 0);
    set_node(model, &mut a, x1, [0, 2, 1], [0, 2, 1], 3, 0);
    set_node(model, &mut a, x2, [2, 1, 0], [2, 1, 0], 3, 0);
    set_node(model, &mut a, root1, [12, 5, 1], [0, 0, 0], 3, 0);
    set_node(model, &mut a, c_p, [5, 1, 0], [1, 0, 0], 2, 1);
    set_node(model, &mut a, c_p2, [5, 1, 0], [1, 0, 0], 2, 1);

    // Providers' compositions are set above, so blended products line up.
    set_flow(model, plan, &mut a, root0, x1, 2);
    set_flow(model, plan, &mut a, root0, c_mix, 1);
    set_flow(model, plan, &mut a, c_mix, x1, 1);
    set_flow(model, plan, &mut a, c_mix, x2, 1);
    set_flow(model, plan, &mut a, c_p, x2, 1);
    set_flow(model, plan, &mut a, c_p2, x2, 1);
    set_flow(model, plan, &mut a, root1, c_p, 1);
    set_flow(model, plan, &mut a, root1, c_p2, 1);
    set_flow(model, plan, &mut a, root1, c_mix, 1);

    a
}

#[test]
fn given_shared_leaves_assignment_when_checking_then_feasible() {
    let (_forest, plan, model) = pipeline(OptimizationMode::Waste);
    let a = shared_leaves_assignment(&model, &plan);
    model.check(&a).expect("assignment satisfies the model");
    assert_eq!(model.objective_value(&a), 2);
}

#[test]
fn given_feasible_assignment_when_reading_solution_then_totals_match() {
    let (forest, plan, model) = pipeline(OptimizationMode::Waste);
    let a = shared_leaves_assignment(&model, &plan);

    let solution = SolutionModel::from_assignment(&model, &forest, &plan, &a).expect("solution");
    assert_eq!(solution.total_waste, 2);
    assert_eq!(solution.total_operations, 7);
    assert_eq!(solution.reagent_usage, vec![4, 3, 1]);
    assert_eq!(solution.total_reagent_droplets, 8);
    assert_eq!(solution.objective, 2);
}

#[test]
fn given_solution_when_reading_recipes_then_sources_listed_in_order() {
    let (forest, plan, model) = pipeline(OptimizationMode::Waste);
    let a = shared_leaves_assignment(&model, &plan);
    let solution = SolutionModel::from_assignment(&model, &forest, &plan, &a).expect("solution");

    let recipe_of = |name: &str| {
        solution
            .steps
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.recipe())
            .expect("step")
    };

    assert_eq!(
        recipe_of("mixer_t0_l2_k0"),
        "2 x Reagent2 + 1 x Reagent3"
    );
    assert_eq!(
        recipe_of("mixer_t0_l1_k0"),
        "1 x mixer_t0_l2_k0 + 1 x mixer_t0_l2_k1"
    );
    assert_eq!(
        recipe_of("mixer_t0_l0_k0"),
        "1 x mixer_t0_l1_k0 + 2 x mixer_t0_l2_k0"
    );
    assert_eq!(
        recipe_of("mixer_t1_l0_k0"),
        "1 x mixer_t1_l1_k0 + 1 x mixer_t1_l1_k1 + 1 x mixer_t0_l1_k0"
    );

    // Steps are ordered by target, then level.
    let order: Vec<(i64, f64)> = solution.steps.iter().map(|s| (s.target, s.level)).collect();
    let mut sorted = order.clone();
    sorted.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    assert_eq!(order, sorted);
}

#[test]
fn given_other_modes_when_checking_same_assignment_then_still_feasible() {
    // Switching the objective must never change the feasible region.
    for (mode, expected_objective) in [
        (OptimizationMode::Operations, 7),
        (OptimizationMode::Reagents, 8),
    ] {
        let (_forest, plan, model) = pipeline(mode);
        let a = shared_leaves_assignment(&model, &plan);
        model.check(&a).expect("assignment satisfies the model");
        assert_eq!(model.objective_value(&a), expected_objective);
    }
}

#[test]
fn given_tampered_assignment_when_reading_solution_then_infeasible() {
    let (forest, plan, model) = pipeline(OptimizationMode::Waste);
    let mut a = shared_leaves_assignment(&model, &plan);

    // Claim the half-used mixer produced no waste.
    let vars = model.node_vars(NodeId::new(1, 1, 0)).expect("vars");
    a.set(vars.waste, 0);

    let result = SolutionModel::from_assignment(&model, &forest, &plan, &a);
    assert!(matches!(result, Err(PlanError::Infeasible { .. })));
}

struct CannedEngine(SolveOutcome);

impl SolverEngine for CannedEngine {
    fn solve(&self, _model: &ProblemModel, _budget: &SolveBudget) -> PlanResult<SolveOutcome> {
        Ok(self.0.clone())
    }
}

#[test]
fn given_engine_outcomes_when_interpreting_then_statuses_map_to_results() {
    let (forest, plan, model) = pipeline(OptimizationMode::Waste);
    let budget = PlanConfig::default().budget();
    let a = shared_leaves_assignment(&model, &plan);

    let solved = CannedEngine(SolveOutcome::solved(SolveStatus::Optimal, a, 2))
        .solve(&model, &budget)
        .expect("outcome");
    let solution =
        SolutionModel::from_outcome(&model, &forest, &plan, &solved, &budget).expect("solution");
    assert_eq!(solution.total_waste, 2);

    let infeasible = CannedEngine(SolveOutcome::infeasible())
        .solve(&model, &budget)
        .expect("outcome");
    assert!(matches!(
        SolutionModel::from_outcome(&model, &forest, &plan, &infeasible, &budget),
        Err(PlanError::Infeasible { .. })
    ));

    let exhausted = CannedEngine(SolveOutcome::budget_exhausted())
        .solve(&model, &budget)
        .expect("outcome");
    assert!(matches!(
        SolutionModel::from_outcome(&model, &forest, &plan, &exhausted, &budget),
        Err(PlanError::BudgetExhausted { .. })
    ));
}
