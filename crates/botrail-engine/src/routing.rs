use botrail_core::{EngineError, Result, Value};

use crate::graph::{Routing, StepDescriptor};

/// What the runtime does after a step produced output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Terminal,
    GoTo(String),
    /// Enter the map region whose element step is named.
    FanOut(String),
}

/// Key used to look a produced value up in a conditional mapping.
///
/// Strings map to themselves; booleans and numbers to their JSON text.
pub fn route_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn resolve_next(step: &StepDescriptor, produced: &Value) -> Result<NextAction> {
    match &step.routing {
        Routing::None => Ok(NextAction::Terminal),
        Routing::Static(target) => Ok(NextAction::GoTo(target.clone())),
        Routing::Conditional(map) => {
            let key = route_key(produced).ok_or_else(|| {
                EngineError::routing(
                    &step.name,
                    format!("cannot route on a {} value", kind_of(produced)),
                )
            })?;
            map.get(&key)
                .map(|target| NextAction::GoTo(target.clone()))
                .ok_or_else(|| {
                    EngineError::routing(&step.name, format!("no branch for route key '{}'", key))
                })
        }
        Routing::Dynamic { resolver, targets } => {
            let target = resolver
                .resolve(produced)
                .map_err(|e| EngineError::step(&step.name, e))?;
            if !targets.contains(&target) {
                return Err(EngineError::routing(
                    &step.name,
                    format!("resolver chose undeclared step '{}'", target),
                ));
            }
            Ok(NextAction::GoTo(target))
        }
        Routing::MapFanOut(element) => {
            if !produced.is_array() {
                return Err(EngineError::Type {
                    step: step.name.clone(),
                    reason: format!("fan-out needs an array, got a {}", kind_of(produced)),
                });
            }
            Ok(NextAction::FanOut(element.clone()))
        }
    }
}
