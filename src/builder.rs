//! Lowering of a forest and its sharing plan into the constraint model.

use tracing::{debug, instrument};

use crate::config::PlanConfig;
use crate::errors::{PlanError, PlanResult};
use crate::model::{
    CmpOp, Constraint, LinExpr, Literal, LinkVars, NodeVars, OptimizationMode, PeerVars,
    ProblemModel, VarId,
};
use crate::sharing::{Provider, SharingPlan};
use crate::tree::{MixForest, MixNode};

/// Penalty weight applied per unit above the soft reagent cap.
const REAGENT_CAP_PENALTY: i64 = 100_000;

pub struct ModelBuilder<'a> {
    forest: &'a MixForest,
    plan: &'a SharingPlan,
    config: &'a PlanConfig,
    model: ProblemModel,
}

impl<'a> ModelBuilder<'a> {
    #[instrument(level = "debug", skip(forest, plan, config))]
    pub fn build(
        forest: &'a MixForest,
        plan: &'a SharingPlan,
        mode: OptimizationMode,
        config: &'a PlanConfig,
    ) -> PlanResult<ProblemModel> {
        let mut builder = Self {
            forest,
            plan,
            config,
            model: ProblemModel::new(mode, forest.num_reagents()),
        };

        builder.define_node_vars()?;
        builder.define_peer_vars()?;
        builder.define_link_vars()?;

        builder.pin_roots()?;
        builder.set_conservation();
        builder.set_capacity()?;
        builder.set_composition_consistency()?;
        builder.set_leaf_grounding();
        builder.set_activation_and_waste();
        builder.set_sharing_gates()?;
        builder.set_peer_blending()?;
        builder.set_symmetry_breaking();
        builder.set_objective()?;

        debug!(
            vars = builder.model.vars().len(),
            constraints = builder.model.constraints().len(),
            "model lowered"
        );
        Ok(builder.model)
    }

    fn define_node_vars(&mut self) -> PlanResult<()> {
        for node in self.forest.iter_nodes() {
            let id = node.id;
            let alloc = as_i64(node.allocation)?;
            let f = as_i64(node.factor)?;

            let composition = (0..self.model.num_reagents())
                .map(|i| self.model.add_int_var(format!("r_{id}_{i}"), 0, alloc))
                .collect();
            let reagents = (0..self.model.num_reagents())
                .map(|i| {
                    self.model
                        .add_int_var(format!("w_reagent_{id}_{i}"), 0, f - 1)
                })
                .collect();
            let total_input = self.model.add_int_var(format!("total_{id}"), 0, f);
            let active = self.model.add_bool_var(format!("active_{id}"));
            let waste = self.model.add_int_var(format!("waste_{id}"), 0, f);

            self.model.node_vars.insert(
                id,
                NodeVars {
                    composition,
                    reagents,
                    total_input,
                    active,
                    waste,
                },
            );
        }
        Ok(())
    }

    fn define_peer_vars(&mut self) -> PlanResult<()> {
        for (idx, peer) in self.plan.peers().iter().enumerate() {
            let name = format!("R_idx{idx}");
            let alloc = as_i64(peer.allocation)?;

            let composition = (0..self.model.num_reagents())
                .map(|i| self.model.add_int_var(format!("r_{name}_{i}"), 0, alloc))
                .collect();
            let draw_a = self.model.add_int_var(format!("w_{name}_a"), 0, 1);
            let draw_b = self.model.add_int_var(format!("w_{name}_b"), 0, 1);
            let total_input = self.model.add_int_var(format!("total_{name}"), 0, 2);
            let active = self.model.add_bool_var(format!("active_{name}"));
            let waste = self.model.add_int_var(format!("waste_{name}"), 0, 2);

            self.model.peer_vars.push(PeerVars {
                name,
                composition,
                draw_a,
                draw_b,
                total_input,
                active,
                waste,
            });
        }
        Ok(())
    }

    fn define_link_vars(&mut self) -> PlanResult<()> {
        for link in self.plan.links() {
            let consumer = self.node(link.consumer)?;
            let key = link.key();
            let ub = as_i64(match self.config.max_sharing_volume {
                Some(cap) => consumer.factor.min(cap),
                None => consumer.factor,
            })?;

            let provider_comp: Vec<VarId> = match link.provider {
                Provider::Node(id) => self.vars_for(id)?.composition,
                Provider::Peer(p) => self.model.peer_vars[p].composition.clone(),
            };
            let provider_alloc = as_i64(match link.provider {
                Provider::Node(id) => self.node(id)?.allocation,
                Provider::Peer(p) => self.plan.peers()[p].allocation,
            })?;

            let flow = self
                .model
                .add_int_var(format!("w_{}_from_{key}", link.consumer), 0, ub);
            let selected = self
                .model
                .add_bool_var(format!("sel_{}_from_{key}", link.consumer));

            let mut blended = Vec::with_capacity(self.model.num_reagents());
            for (i, &comp) in provider_comp.iter().enumerate() {
                let b = self.model.add_int_var(
                    format!("blend_{}_from_{key}_{i}", link.consumer),
                    0,
                    provider_alloc * ub,
                );
                self.model.add(Constraint::ProductEq {
                    target: b,
                    lhs: comp,
                    rhs: flow,
                });
                blended.push(b);
            }

            self.model.link_vars.push(LinkVars {
                flow,
                selected,
                blended,
            });
        }
        Ok(())
    }

    /// Roots are pinned: composition equals the target ratio and the mixer
    /// is always full.
    fn pin_roots(&mut self) -> PlanResult<()> {
        for tree in self.forest.trees() {
            let root = tree.root();
            let vars = self.model.node_vars[&root.id].clone();

            for (i, &r) in tree.target.ratio.iter().enumerate() {
                self.eq(LinExpr::term(1, vars.composition[i]), as_i64(r)?);
            }
            self.eq(LinExpr::term(1, vars.total_input), as_i64(root.factor)?);
            self.eq(LinExpr::term(1, vars.active), 1);
        }
        Ok(())
    }

    fn set_conservation(&mut self) {
        for node in self.forest.iter_nodes() {
            let vars = self.model.node_vars[&node.id].clone();
            let mut expr = LinExpr::term(-1, vars.total_input);
            for &r in &vars.reagents {
                expr = expr.plus(1, r);
            }
            for &l in self.plan.inbound(node.id) {
                expr = expr.plus(1, self.model.link_vars[l].flow);
            }
            self.eq(expr, 0);
        }

        for peer in self.model.peer_vars.clone() {
            self.eq(
                LinExpr::term(-1, peer.total_input)
                    .plus(1, peer.draw_a)
                    .plus(1, peer.draw_b),
                0,
            );
        }
    }

    /// A mixer is either idle or completely full.
    fn set_capacity(&mut self) -> PlanResult<()> {
        for node in self.forest.iter_nodes() {
            if node.is_root() {
                continue; // pinned already
            }
            let vars = self.model.node_vars[&node.id].clone();
            let f = as_i64(node.factor)?;
            self.eq(
                LinExpr::term(1, vars.total_input).plus(-f, vars.active),
                0,
            );
        }
        for peer in self.model.peer_vars.clone() {
            self.eq(
                LinExpr::term(1, peer.total_input).plus(-2, peer.active),
                0,
            );
        }
        Ok(())
    }

    /// The reagent-level breakdown reconstructed from inbound flows must
    /// reproduce the node's composition exactly:
    /// `f * comp[i] == alloc * reagent[i] + Σ scale * comp_src[i] * flow`.
    fn set_composition_consistency(&mut self) -> PlanResult<()> {
        for node in self.forest.iter_nodes() {
            let vars = self.model.node_vars[&node.id].clone();
            let alloc = as_i64(node.allocation)?;
            let f = as_i64(node.factor)?;

            // Realized composition vanishes with the node.
            let mass = vars
                .composition
                .iter()
                .fold(LinExpr::new(), |e, &c| e.plus(1, c))
                .plus(-alloc, vars.active);
            self.eq(mass, 0);

            if node.is_leaf_grade() {
                continue; // grounded in raw reagents below
            }

            for i in 0..self.model.num_reagents() {
                let mut expr = LinExpr::term(f, vars.composition[i]).plus(-alloc, vars.reagents[i]);
                for &l in self.plan.inbound(node.id) {
                    let scale = as_i64(self.plan.links()[l].scale)?;
                    expr = expr.plus(-scale, self.model.link_vars[l].blended[i]);
                }
                self.eq(expr, 0);
            }
        }
        Ok(())
    }

    fn set_leaf_grounding(&mut self) {
        for node in self.forest.iter_nodes() {
            if !node.is_leaf_grade() {
                continue;
            }
            let vars = self.model.node_vars[&node.id].clone();
            for i in 0..self.model.num_reagents() {
                self.eq(
                    LinExpr::term(1, vars.composition[i]).plus(-1, vars.reagents[i]),
                    0,
                );
            }
        }
    }

    /// Outbound usage of a node: flows drawn from it plus peer draws.
    fn usage_expr(&self, node: &MixNode) -> LinExpr {
        let mut expr = LinExpr::new();
        for &l in self.plan.outbound(node.id) {
            expr = expr.plus(1, self.model.link_vars[l].flow);
        }
        for (peer_idx, is_side_a) in self.plan.peer_memberships(node.id) {
            let peer = &self.model.peer_vars[peer_idx];
            expr = expr.plus(1, if is_side_a { peer.draw_a } else { peer.draw_b });
        }
        expr
    }

    fn set_activation_and_waste(&mut self) {
        for node in self.forest.iter_nodes() {
            let vars = self.model.node_vars[&node.id].clone();
            let usage = self.usage_expr(node);

            if node.is_root() {
                self.eq(LinExpr::term(1, vars.waste), 0);
                continue;
            }

            self.model.add(Constraint::Linear {
                expr: usage.clone(),
                op: CmpOp::Ge,
                rhs: 1,
                enforce_if: Some(Literal {
                    var: vars.active,
                    value: true,
                }),
            });
            self.model.add(Constraint::Linear {
                expr: usage.clone(),
                op: CmpOp::Eq,
                rhs: 0,
                enforce_if: Some(Literal {
                    var: vars.active,
                    value: false,
                }),
            });

            let mut waste = LinExpr::term(1, vars.waste).plus(-1, vars.total_input);
            for (c, v) in usage.terms {
                waste = waste.plus(c, v);
            }
            self.eq(waste, 0);
        }

        for (idx, peer) in self.model.peer_vars.clone().into_iter().enumerate() {
            let mut usage = LinExpr::new();
            for &l in self.plan.peer_links(idx) {
                usage = usage.plus(1, self.model.link_vars[l].flow);
            }

            self.model.add(Constraint::Linear {
                expr: usage.clone(),
                op: CmpOp::Ge,
                rhs: 1,
                enforce_if: Some(Literal {
                    var: peer.active,
                    value: true,
                }),
            });
            self.model.add(Constraint::Linear {
                expr: usage.clone(),
                op: CmpOp::Eq,
                rhs: 0,
                enforce_if: Some(Literal {
                    var: peer.active,
                    value: false,
                }),
            });

            let mut waste = LinExpr::term(1, peer.waste).plus(-1, peer.total_input);
            for (c, v) in usage.terms {
                waste = waste.plus(c, v);
            }
            self.eq(waste, 0);
        }
    }

    /// A flow is nonzero exactly when its gate is selected; optionally cap
    /// the number of distinct inbound sources.
    fn set_sharing_gates(&mut self) -> PlanResult<()> {
        for (idx, link) in self.plan.links().iter().enumerate() {
            let vars = self.model.link_vars[idx].clone();
            let consumer = self.node(link.consumer)?;
            let ub = as_i64(match self.config.max_sharing_volume {
                Some(cap) => consumer.factor.min(cap),
                None => consumer.factor,
            })?;

            self.model.add(Constraint::Linear {
                expr: LinExpr::term(1, vars.flow).plus(-1, vars.selected),
                op: CmpOp::Ge,
                rhs: 0,
                enforce_if: None,
            });
            self.model.add(Constraint::Linear {
                expr: LinExpr::term(1, vars.flow).plus(-ub, vars.selected),
                op: CmpOp::Le,
                rhs: 0,
                enforce_if: None,
            });
        }

        if let Some(cap) = self.config.max_shared_inputs {
            let cap = as_i64(cap)?;
            for node in self.forest.iter_nodes() {
                let inbound = self.plan.inbound(node.id);
                if inbound.is_empty() {
                    continue;
                }
                let expr = inbound
                    .iter()
                    .fold(LinExpr::new(), |e, &l| e.plus(1, self.model.link_vars[l].selected));
                self.model.add(Constraint::Linear {
                    expr,
                    op: CmpOp::Le,
                    rhs: cap,
                    enforce_if: None,
                });
            }
        }
        Ok(())
    }

    /// An active peer draws exactly one droplet from each source and holds
    /// their equal-parts blend.
    fn set_peer_blending(&mut self) -> PlanResult<()> {
        for (idx, peer) in self.model.peer_vars.clone().into_iter().enumerate() {
            let candidate = &self.plan.peers()[idx];
            let alloc = as_i64(candidate.allocation)?;
            let a = self.vars_for(candidate.a)?;
            let b = self.vars_for(candidate.b)?;

            self.eq(LinExpr::term(1, peer.draw_a).plus(-1, peer.active), 0);
            self.eq(LinExpr::term(1, peer.draw_b).plus(-1, peer.active), 0);

            let mass = peer
                .composition
                .iter()
                .fold(LinExpr::new(), |e, &c| e.plus(1, c))
                .plus(-alloc, peer.active);
            self.eq(mass, 0);

            for i in 0..self.model.num_reagents() {
                self.model.add(Constraint::Linear {
                    expr: LinExpr::term(2, peer.composition[i])
                        .plus(-1, a.composition[i])
                        .plus(-1, b.composition[i]),
                    op: CmpOp::Eq,
                    rhs: 0,
                    enforce_if: Some(Literal {
                        var: peer.active,
                        value: true,
                    }),
                });
            }
        }
        Ok(())
    }

    /// Interchangeable slots are ordered to cut symmetric search space:
    /// within each (target, level), activity and fill are non-increasing in
    /// node index; likewise for peer blends of equal allocation.
    fn set_symmetry_breaking(&mut self) {
        for tree in self.forest.trees() {
            for level in 1..tree.depth() {
                let nodes = tree.level(level);
                for pair in nodes.windows(2) {
                    let a = self.model.node_vars[&pair[0].id].clone();
                    let b = self.model.node_vars[&pair[1].id].clone();
                    self.ge(LinExpr::term(1, a.active).plus(-1, b.active), 0);
                    self.ge(
                        LinExpr::term(1, a.total_input).plus(-1, b.total_input),
                        0,
                    );
                }
            }
        }

        let peers = self.plan.peers();
        for idx in 1..peers.len() {
            if peers[idx - 1].allocation != peers[idx].allocation {
                continue;
            }
            let a = self.model.peer_vars[idx - 1].clone();
            let b = self.model.peer_vars[idx].clone();
            self.ge(LinExpr::term(1, a.active).plus(-1, b.active), 0);
        }
    }

    fn set_objective(&mut self) -> PlanResult<()> {
        let mut objective = match self.model.mode() {
            OptimizationMode::Waste => {
                let mut expr = LinExpr::new();
                for node in self.forest.iter_nodes() {
                    if node.is_root() {
                        continue;
                    }
                    expr = expr.plus(1, self.model.node_vars[&node.id].waste);
                }
                for peer in &self.model.peer_vars {
                    expr = expr.plus(1, peer.waste);
                }
                expr
            }
            OptimizationMode::Operations => {
                let mut expr = LinExpr::new();
                for node in self.forest.iter_nodes() {
                    expr = expr.plus(1, self.model.node_vars[&node.id].active);
                }
                for peer in &self.model.peer_vars {
                    expr = expr.plus(1, peer.active);
                }
                expr
            }
            OptimizationMode::Reagents => {
                let mut expr = LinExpr::new();
                for node in self.forest.iter_nodes() {
                    for &r in &self.model.node_vars[&node.id].reagents {
                        expr = expr.plus(1, r);
                    }
                }
                expr
            }
        };

        if let Some(cap) = self.config.max_reagent_input_per_node {
            let cap = as_i64(cap)?;
            for node in self.forest.iter_nodes() {
                let vars = self.model.node_vars[&node.id].clone();
                let hi = as_i64(node.factor)? * self.model.num_reagents() as i64;
                let over = self
                    .model
                    .add_int_var(format!("over_reagent_cap_{}", node.id), 0, hi);

                let expr = vars
                    .reagents
                    .iter()
                    .fold(LinExpr::new(), |e, &r| e.plus(1, r))
                    .plus(-1, over);
                self.model.add(Constraint::Linear {
                    expr,
                    op: CmpOp::Le,
                    rhs: cap,
                    enforce_if: None,
                });
                objective = objective.plus(REAGENT_CAP_PENALTY, over);
            }
        }

        self.model.set_objective(objective);
        Ok(())
    }

    fn node(&self, id: crate::target::NodeId) -> PlanResult<&'a MixNode> {
        self.forest.node(id).ok_or_else(|| PlanError::ModelConstruction {
            reason: format!("sharing plan references unknown node {id}"),
        })
    }

    fn vars_for(&self, id: crate::target::NodeId) -> PlanResult<NodeVars> {
        self.model
            .node_vars
            .get(&id)
            .cloned()
            .ok_or_else(|| PlanError::ModelConstruction {
                reason: format!("sharing plan references unknown node {id}"),
            })
    }

    fn eq(&mut self, expr: LinExpr, rhs: i64) {
        self.model.add(Constraint::Linear {
            expr,
            op: CmpOp::Eq,
            rhs,
            enforce_if: None,
        });
    }

    fn ge(&mut self, expr: LinExpr, rhs: i64) {
        self.model.add(Constraint::Linear {
            expr,
            op: CmpOp::Ge,
            rhs,
            enforce_if: None,
        });
    }
}

fn as_i64(v: u64) -> PlanResult<i64> {
    i64::try_from(v).map_err(|_| PlanError::ModelConstruction {
        reason: format!("value {v} exceeds the solver integer range"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Assignment;
    use crate::sharing::SharingResolver;
    use crate::target::{NodeId, Target};
    use crate::tree::TreeBuilder;

    fn example() -> (MixForest, SharingPlan, PlanConfig) {
        let config = PlanConfig::default();
        let forest = TreeBuilder::new(config.max_mixer_size)
            .build(&[
                Target::new("A", vec![2, 11, 5], vec![3, 2, 3]),
                Target::new("B", vec![12, 5, 1], vec![3, 2, 3]),
            ])
            .expect("forest");
        let plan = SharingResolver::new(&config).resolve(&forest);
        (forest, plan, config)
    }

    #[test]
    fn given_example_when_lowering_then_every_node_has_vars() {
        let (forest, plan, config) = example();
        let model =
            ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config).expect("model");

        for node in forest.iter_nodes() {
            let vars = model.node_vars(node.id).expect("vars");
            assert_eq!(vars.composition.len(), 3);
            assert_eq!(vars.reagents.len(), 3);
        }
        assert_eq!(model.link_vars().len(), plan.links().len());
        assert_eq!(model.peer_vars().len(), plan.peers().len());
    }

    #[test]
    fn given_two_modes_when_lowering_then_only_objective_differs() {
        let (forest, plan, config) = example();
        let waste =
            ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config).expect("model");
        let ops = ModelBuilder::build(&forest, &plan, OptimizationMode::Operations, &config)
            .expect("model");

        assert_eq!(waste.vars().len(), ops.vars().len());
        assert_eq!(waste.constraints().len(), ops.constraints().len());
        assert_ne!(waste.objective().terms, ops.objective().terms);
    }

    #[test]
    fn given_same_input_when_lowering_twice_then_models_identical() {
        let (forest, plan, config) = example();
        let m1 =
            ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config).expect("model");
        let m2 =
            ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config).expect("model");

        assert_eq!(m1.vars().len(), m2.vars().len());
        for (a, b) in m1.vars().iter().zip(m2.vars()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.domain, b.domain);
        }
        assert_eq!(m1.constraints().len(), m2.constraints().len());
    }

    #[test]
    fn given_plan_from_other_forest_when_lowering_then_model_construction_error() {
        let (_forest_two, plan, config) = example();
        let forest_one = TreeBuilder::new(config.max_mixer_size)
            .build(&[Target::new("A", vec![2, 11, 5], vec![3, 2, 3])])
            .expect("forest");

        // The plan references second-target nodes absent from this forest.
        let result = ModelBuilder::build(&forest_one, &plan, OptimizationMode::Waste, &config);
        assert!(matches!(result, Err(PlanError::ModelConstruction { .. })));
    }

    #[test]
    fn given_single_level_target_when_lowering_then_direct_fill_checks() {
        let config = PlanConfig::default();
        let forest = TreeBuilder::new(config.max_mixer_size)
            .build(&[Target::new("s", vec![1, 2], vec![3])])
            .expect("forest");
        let plan = SharingResolver::new(&config).resolve(&forest);
        let model = ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config)
            .expect("model");
        assert!(plan.links().is_empty());
        assert!(plan.peers().is_empty());

        // Root is leaf-grade: pinned to the ratio and filled from reagents.
        let mut a = Assignment::zeroed(&model);
        let vars = model.node_vars(NodeId::new(0, 0, 0)).expect("vars");
        for (i, &r) in [1i64, 2].iter().enumerate() {
            a.set(vars.composition[i], r);
            a.set(vars.reagents[i], r);
        }
        a.set(vars.total_input, 3);
        a.set(vars.active, 1);

        model.check(&a).expect("direct reagent fill satisfies the model");
        assert_eq!(model.objective_value(&a), 0);
    }

    #[test]
    fn given_reagent_cap_when_lowering_then_penalty_vars_added() {
        let (forest, plan, mut config) = example();
        config.max_reagent_input_per_node = Some(2);
        let capped =
            ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config).expect("model");

        config.max_reagent_input_per_node = None;
        let plain =
            ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config).expect("model");

        assert!(capped.vars().len() > plain.vars().len());
        assert!(capped
            .objective()
            .terms
            .iter()
            .any(|&(c, _)| c == REAGENT_CAP_PENALTY));
    }
}
