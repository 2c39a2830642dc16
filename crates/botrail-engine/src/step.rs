//! The seam between the engine and user-authored step logic.

use std::collections::BTreeMap;

use botrail_core::{StepError, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of the current invocation inside a map region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMeta {
    pub fan_out_step: String,
    pub element_step: String,
    pub fold_step: String,
    /// Zero-based index of the element being processed.
    pub index: usize,
    /// Number of elements the fan-out produced.
    pub total: usize,
}

/// Read-only auxiliary data handed to every step invocation.
#[derive(Debug)]
pub struct StepContext<'a> {
    pub step: &'a str,
    pub run_id: Uuid,
    /// The value the run was started with.
    pub run_input: &'a Value,
    /// Most recent output of every step invoked so far.
    pub outputs: &'a BTreeMap<String, Value>,
    /// Innermost map region, if any.
    pub loop_meta: Option<LoopMeta>,
    /// Caller-supplied arguments passed through untouched.
    pub runtime_args: &'a serde_json::Map<String, Value>,
    /// True when this run segment was started from a snapshot.
    pub resumed: bool,
}

impl<'a> StepContext<'a> {
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.runtime_args.get(key)
    }
}

/// A step body. Implemented for any matching closure.
pub trait StepFn: Send + Sync {
    fn call(&self, input: Value, ctx: &StepContext<'_>) -> Result<Value, StepError>;
}

impl<F> StepFn for F
where
    F: Fn(Value, &StepContext<'_>) -> Result<Value, StepError> + Send + Sync,
{
    fn call(&self, input: Value, ctx: &StepContext<'_>) -> Result<Value, StepError> {
        self(input, ctx)
    }
}

/// Computes the next step name for a dynamic route.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, produced: &Value) -> Result<String, StepError>;
}

impl<F> RouteResolver for F
where
    F: Fn(&Value) -> Result<String, StepError> + Send + Sync,
{
    fn resolve(&self, produced: &Value) -> Result<String, StepError> {
        self(produced)
    }
}
