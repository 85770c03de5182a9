//! Multi-stage liquid-mixing process planner.
//!
//! Given target mixtures as integer ratios and per-level mixer factors, the
//! crate builds leveled mixing trees, enumerates droplet-sharing candidates
//! between them, and lowers everything into a solver-agnostic constraint
//! model. An external engine implementing [`solver::SolverEngine`] searches
//! the model; [`solution::SolutionModel`] verifies and interprets the result.
//!
//! ```
//! use mixplan::builder::ModelBuilder;
//! use mixplan::config::PlanConfig;
//! use mixplan::model::OptimizationMode;
//! use mixplan::sharing::SharingResolver;
//! use mixplan::target::Target;
//! use mixplan::tree::TreeBuilder;
//!
//! # fn main() -> mixplan::errors::PlanResult<()> {
//! let config = PlanConfig::default();
//! let targets = vec![Target::new("sample", vec![2, 11, 5], vec![3, 2, 3])];
//!
//! let forest = TreeBuilder::new(config.max_mixer_size).build(&targets)?;
//! let plan = SharingResolver::new(&config).resolve(&forest);
//! let model = ModelBuilder::build(&forest, &plan, OptimizationMode::Waste, &config)?;
//! assert!(!model.vars().is_empty());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod errors;
pub mod model;
pub mod sharing;
pub mod solution;
pub mod solver;
pub mod target;
pub mod tree;
pub mod util;

pub use builder::ModelBuilder;
pub use config::{PeerLimit, PlanConfig};
pub use errors::{PlanError, PlanResult};
pub use model::{Assignment, OptimizationMode, ProblemModel};
pub use sharing::{SharingPlan, SharingResolver};
pub use solution::SolutionModel;
pub use solver::{SolveBudget, SolveOutcome, SolveStatus, SolverEngine};
pub use target::{NodeId, Target};
pub use tree::{MixForest, MixTree, TreeBuilder};
