//! Map/fold loop controller.
//!
//! Frames live on the snapshot's loop stack (outermost first). The runtime
//! asks the controller what to invoke when a fan-out is taken and whenever an
//! element chain routes into the active frame's fold step.

use std::collections::VecDeque;

use botrail_core::{EngineError, Result, Value};
use serde::{Deserialize, Serialize};

use crate::graph::MapRegion;
use crate::step::LoopMeta;

/// One active map region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub fan_out_step: String,
    pub element_step: String,
    pub fold_step: String,
    /// Unconsumed input elements, in source order.
    pub remaining_elements: VecDeque<Value>,
    /// Per-element chain outputs, in source order.
    pub accumulated: Vec<Value>,
    /// Element count the fan-out produced.
    pub expected: usize,
}

impl LoopFrame {
    pub fn new(region: &MapRegion, elements: Vec<Value>) -> Self {
        Self {
            fan_out_step: region.fan_out_step.clone(),
            element_step: region.element_step.clone(),
            fold_step: region.fold_step.clone(),
            expected: elements.len(),
            remaining_elements: elements.into(),
            accumulated: Vec::new(),
        }
    }

    pub fn meta(&self) -> LoopMeta {
        LoopMeta {
            fan_out_step: self.fan_out_step.clone(),
            element_step: self.element_step.clone(),
            fold_step: self.fold_step.clone(),
            index: self.accumulated.len(),
            total: self.expected,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.remaining_elements.is_empty()
    }
}

/// An invocation requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub step: String,
    pub input: Value,
}

/// Push a frame for `region` over the fan-out's produced collection and
/// return the first invocation: the first element, or the fold when empty.
pub fn enter(stack: &mut Vec<LoopFrame>, region: &MapRegion, produced: Value) -> Result<Dispatch> {
    let elements = match produced {
        Value::Array(items) => items,
        _ => {
            return Err(EngineError::Type {
                step: region.fan_out_step.clone(),
                reason: "fan-out needs an array".to_string(),
            })
        }
    };
    let mut frame = LoopFrame::new(region, elements);
    let dispatch = next_dispatch(&mut frame)?;
    stack.push(frame);
    Ok(dispatch)
}

/// Record one element chain's output on the innermost frame and return the
/// next invocation.
pub fn complete_element(
    stack: &mut [LoopFrame],
    step: &str,
    output: Value,
) -> Result<Dispatch> {
    let frame = stack.last_mut().ok_or_else(|| {
        EngineError::routing(step, "element output with no active map region")
    })?;
    frame.accumulated.push(output);
    next_dispatch(frame)
}

/// Whether `step` is the fold of the innermost frame and that frame has
/// handed out every element.
pub fn closes_frame(stack: &[LoopFrame], step: &str) -> bool {
    stack
        .last()
        .map(|f| f.fold_step == step && f.is_drained())
        .unwrap_or(false)
}

/// Whether routing into `target` returns control to the innermost frame.
pub fn returns_to_controller(stack: &[LoopFrame], target: &str) -> bool {
    stack.last().map(|f| f.fold_step == target).unwrap_or(false)
}

fn next_dispatch(frame: &mut LoopFrame) -> Result<Dispatch> {
    if let Some(element) = frame.remaining_elements.pop_front() {
        return Ok(Dispatch {
            step: frame.element_step.clone(),
            input: element,
        });
    }
    if frame.accumulated.len() != frame.expected {
        return Err(EngineError::IterationMismatch {
            fan_out: frame.fan_out_step.clone(),
            expected: frame.expected,
            actual: frame.accumulated.len(),
        });
    }
    Ok(Dispatch {
        step: frame.fold_step.clone(),
        input: Value::Array(frame.accumulated.clone()),
    })
}
