use thiserror::Error;

use crate::dsl::expr::ExprSyntaxError;

pub type Result<T> = std::result::Result<T, PlannerError>;

/// Failures turning query text into an initial plan.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("in step {step}: {source}")]
    Expr {
        step: usize,
        #[source]
        source: ExprSyntaxError,
    },

    #[error("in step {step}: {message}")]
    Step { step: usize, message: String },

    #[error(transparent)]
    Plan(#[from] quarry_core::Error),
}
