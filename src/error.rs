use thiserror::Error;

/// Error kinds surfaced by the core (see spec section 7).
///
/// Every variant is deliberately narrow: component methods return the
/// specific kind they can produce, and the orchestrator is the only place
/// that needs to reason about all of them at once.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config: {0}")]
    Config(String),

    #[error("feed error: {0}")]
    Feed(String),

    #[error("quantization: {0}")]
    Quantization(&'static str),

    #[error("would cross: order at {price} would immediately match")]
    WouldCross { price: f64 },

    #[error("venue rejected order: {reason}")]
    Api { reason: String },

    #[error("risk denied: {reason}")]
    RiskDenied { reason: &'static str },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
