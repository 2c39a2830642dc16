use thiserror::Error;

use crate::types::TypeTag;

/// Compile-time failures. A graph that produces any of these is never built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No start step registered")]
    NoStartStep,

    #[error("Multiple start steps registered: {0:?}")]
    MultipleStartSteps(Vec<String>),

    #[error("Step already registered: {0}")]
    DuplicateStep(String),

    #[error("Step {from} routes to unknown step {to}")]
    UnknownTarget { from: String, to: String },

    #[error("Step {step} uses a dynamic route without declared targets")]
    UndeclaredDynamicTargets { step: String },

    #[error("Step {step} has a conditional route with no branches")]
    EmptyConditional { step: String },

    #[error("Type mismatch on edge {from} -> {to}: {from} produces {produced}, {to} expects {expected}")]
    TypeMismatch {
        from: String,
        to: String,
        produced: TypeTag,
        expected: TypeTag,
    },

    #[error("Nested cycles are not allowed: {inner:?} is nested inside {outer:?}")]
    NestedCycle {
        inner: Vec<String>,
        outer: Vec<String>,
    },

    #[error("Cycles are disabled but the graph contains {cycle:?}")]
    CyclesDisabled { cycle: Vec<String> },

    #[error("Map region starting at {fan_out} branches at step {step}")]
    BranchInMapRegion { fan_out: String, step: String },

    #[error("Map region starting at {fan_out} never reaches a fold step")]
    MissingFold { fan_out: String },

    #[error("Step {step} of the map region starting at {fan_out} lies on a cycle")]
    MapRegionInCycle { fan_out: String, step: String },

    #[error("Map region starting at {fan_out} uses fold step {fold} as its element step")]
    FoldAsElement { fan_out: String, fold: String },

    #[error("Fold step {fold} closes more than one map region ({first}, {second})")]
    SharedFold {
        fold: String,
        first: String,
        second: String,
    },

    #[error("Fold step {0} does not close any map region")]
    OrphanFold(String),

    #[error("Step {0} is unreachable from the start step")]
    UnreachableStep(String),
}

/// Failure raised by a user-authored step body or dynamic route resolver.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it reachable through `source()`.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    // Compile errors
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    // Run errors
    #[error("Routing failed at step {step}: {reason}")]
    Routing { step: String, reason: String },

    #[error("Step {step} failed: {source}")]
    Step { step: String, source: StepError },

    #[error("Type error at step {step}: {reason}")]
    Type { step: String, reason: String },

    #[error("Map region starting at {fan_out} expected {expected} element outputs, collected {actual}")]
    IterationMismatch {
        fan_out: String,
        expected: usize,
        actual: usize,
    },

    #[error("Run exceeded the step budget ({0} invocations)")]
    StepBudgetExhausted(usize),

    // Resume errors
    #[error("Cannot resume: {0}")]
    Resume(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn routing(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Routing {
            step: step.into(),
            reason: reason.into(),
        }
    }

    pub fn step(step: impl Into<String>, source: StepError) -> Self {
        Self::Step {
            step: step.into(),
            source,
        }
    }

    /// Name of the step the failure is attributed to, if any.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::Routing { step, .. } | Self::Step { step, .. } | Self::Type { step, .. } => {
                Some(step)
            }
            Self::IterationMismatch { fan_out, .. } => Some(fan_out),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
