use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Invalid factorization for target '{target}': {reason}")]
    InvalidFactorization { target: String, reason: String },

    #[error("Model construction failed: {reason}")]
    ModelConstruction { reason: String },

    #[error("No feasible assignment: {reason}")]
    Infeasible { reason: String },

    #[error("Solve budget exhausted after {elapsed:?}")]
    BudgetExhausted { elapsed: Duration },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

pub type PlanResult<T> = Result<T, PlanError>;
