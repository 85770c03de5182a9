//! Solver-agnostic constraint model.
//!
//! The planner emits variables and constraints in a small IR that any
//! CP-style engine can consume: bounded integers, booleans, linear
//! (in)equalities with optional enforcement literals, and product
//! equalities for the bilinear composition terms. The crate never searches;
//! `ProblemModel::check` only verifies a given assignment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{PlanError, PlanResult};
use crate::target::NodeId;

/// What the objective minimizes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    #[default]
    Waste,
    Operations,
    Reagents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Int { lo: i64, hi: i64 },
    Bool,
}

#[derive(Debug, Clone)]
pub struct VarDef {
    pub name: String,
    pub domain: Domain,
}

/// Linear expression `Σ coeff * var + constant`.
#[derive(Debug, Clone, Default)]
pub struct LinExpr {
    pub terms: Vec<(i64, VarId)>,
    pub constant: i64,
}

impl LinExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(coeff: i64, var: VarId) -> Self {
        Self {
            terms: vec![(coeff, var)],
            constant: 0,
        }
    }

    pub fn plus(mut self, coeff: i64, var: VarId) -> Self {
        self.terms.push((coeff, var));
        self
    }

    pub fn offset(mut self, constant: i64) -> Self {
        self.constant += constant;
        self
    }

    pub fn sum_of<I: IntoIterator<Item = VarId>>(vars: I) -> Self {
        Self {
            terms: vars.into_iter().map(|v| (1, v)).collect(),
            constant: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.constant == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Le,
    Ge,
}

/// A boolean variable required to take `value` for an enforced constraint
/// to apply.
#[derive(Debug, Clone, Copy)]
pub struct Literal {
    pub var: VarId,
    pub value: bool,
}

#[derive(Debug, Clone)]
pub enum Constraint {
    Linear {
        expr: LinExpr,
        op: CmpOp,
        rhs: i64,
        enforce_if: Option<Literal>,
    },
    /// `target == lhs * rhs`.
    ProductEq {
        target: VarId,
        lhs: VarId,
        rhs: VarId,
    },
}

/// Variable handles of one tree node.
#[derive(Debug, Clone)]
pub struct NodeVars {
    pub composition: Vec<VarId>,
    pub reagents: Vec<VarId>,
    pub total_input: VarId,
    pub active: VarId,
    pub waste: VarId,
}

/// Variable handles of one peer blend candidate.
#[derive(Debug, Clone)]
pub struct PeerVars {
    pub name: String,
    pub composition: Vec<VarId>,
    pub draw_a: VarId,
    pub draw_b: VarId,
    pub total_input: VarId,
    pub active: VarId,
    pub waste: VarId,
}

/// Variable handles of one candidate flow.
#[derive(Debug, Clone)]
pub struct LinkVars {
    pub flow: VarId,
    pub selected: VarId,
    /// `blended[i] == composition_provider[i] * flow`.
    pub blended: Vec<VarId>,
}

/// The lowered constraint model plus the bookkeeping needed to read an
/// assignment back in planning terms.
#[derive(Debug, Clone)]
pub struct ProblemModel {
    mode: OptimizationMode,
    vars: Vec<VarDef>,
    constraints: Vec<Constraint>,
    objective: LinExpr,
    pub(crate) node_vars: BTreeMap<NodeId, NodeVars>,
    pub(crate) peer_vars: Vec<PeerVars>,
    pub(crate) link_vars: Vec<LinkVars>,
    pub(crate) num_reagents: usize,
}

impl ProblemModel {
    pub(crate) fn new(mode: OptimizationMode, num_reagents: usize) -> Self {
        Self {
            mode,
            vars: Vec::new(),
            constraints: Vec::new(),
            objective: LinExpr::new(),
            node_vars: BTreeMap::new(),
            peer_vars: Vec::new(),
            link_vars: Vec::new(),
            num_reagents,
        }
    }

    pub(crate) fn add_int_var(&mut self, name: String, lo: i64, hi: i64) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(VarDef {
            name,
            domain: Domain::Int { lo, hi },
        });
        id
    }

    pub(crate) fn add_bool_var(&mut self, name: String) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(VarDef {
            name,
            domain: Domain::Bool,
        });
        id
    }

    pub(crate) fn add(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub(crate) fn set_objective(&mut self, objective: LinExpr) {
        self.objective = objective;
    }

    pub fn mode(&self) -> OptimizationMode {
        self.mode
    }

    pub fn vars(&self) -> &[VarDef] {
        &self.vars
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn objective(&self) -> &LinExpr {
        &self.objective
    }

    pub fn node_vars(&self, id: NodeId) -> Option<&NodeVars> {
        self.node_vars.get(&id)
    }

    pub fn peer_vars(&self) -> &[PeerVars] {
        &self.peer_vars
    }

    pub fn link_vars(&self) -> &[LinkVars] {
        &self.link_vars
    }

    pub fn num_reagents(&self) -> usize {
        self.num_reagents
    }

    pub fn eval(&self, expr: &LinExpr, assignment: &Assignment) -> i64 {
        expr.terms
            .iter()
            .map(|&(c, v)| c * assignment.value(v))
            .sum::<i64>()
            + expr.constant
    }

    pub fn objective_value(&self, assignment: &Assignment) -> i64 {
        self.eval(&self.objective, assignment)
    }

    /// Verify that an assignment respects every domain and constraint.
    pub fn check(&self, assignment: &Assignment) -> PlanResult<()> {
        let fail = |reason: String| PlanError::Infeasible { reason };

        if assignment.len() != self.vars.len() {
            return Err(fail(format!(
                "assignment has {} values, model has {} variables",
                assignment.len(),
                self.vars.len()
            )));
        }

        for (idx, def) in self.vars.iter().enumerate() {
            let v = assignment.value(VarId(idx));
            let ok = match def.domain {
                Domain::Int { lo, hi } => (lo..=hi).contains(&v),
                Domain::Bool => v == 0 || v == 1,
            };
            if !ok {
                return Err(fail(format!(
                    "variable '{}' = {v} outside its domain",
                    def.name
                )));
            }
        }

        for (idx, constraint) in self.constraints.iter().enumerate() {
            match constraint {
                Constraint::Linear {
                    expr,
                    op,
                    rhs,
                    enforce_if,
                } => {
                    if let Some(lit) = enforce_if {
                        let active = assignment.value(lit.var) == i64::from(lit.value);
                        if !active {
                            continue;
                        }
                    }
                    let lhs = self.eval(expr, assignment);
                    let ok = match op {
                        CmpOp::Eq => lhs == *rhs,
                        CmpOp::Le => lhs <= *rhs,
                        CmpOp::Ge => lhs >= *rhs,
                    };
                    if !ok {
                        return Err(fail(format!(
                            "linear constraint {idx} violated: {lhs} {op:?} {rhs}"
                        )));
                    }
                }
                Constraint::ProductEq { target, lhs, rhs } => {
                    let t = assignment.value(*target);
                    let product = assignment.value(*lhs) * assignment.value(*rhs);
                    if t != product {
                        return Err(fail(format!(
                            "product constraint {idx} violated: {t} != {product}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A complete variable assignment, indexed by `VarId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    values: Vec<i64>,
}

impl Assignment {
    /// All-zero assignment sized for the model.
    pub fn zeroed(model: &ProblemModel) -> Self {
        Self {
            values: vec![0; model.vars().len()],
        }
    }

    pub fn from_values(values: Vec<i64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, var: VarId) -> i64 {
        self.values.get(var.0).copied().unwrap_or(0)
    }

    pub fn set(&mut self, var: VarId, value: i64) {
        self.values[var.0] = value;
    }
}
