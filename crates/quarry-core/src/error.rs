use thiserror::Error;

/// Canonical result for the optimizer crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Conditions that abort the optimization of a query.
///
/// Locally recoverable conditions (for example an expression that is too long
/// to stringify) have their own types and never become an `Error`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Planning error: {0}")]
    Plan(String),

    /// The user forced an index that cannot serve the query.
    #[error("Forced index '{index}' on collection '{collection}' cannot be used for this query")]
    ForcedIndexUnusable { collection: String, index: String },

    /// JSON encoding failed while hashing or exporting a plan.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A rule or a graph edit broke a plan invariant. Always a bug, never a
    /// property of the user's query.
    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
