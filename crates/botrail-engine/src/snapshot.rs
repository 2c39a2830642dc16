use std::collections::BTreeMap;

use botrail_core::{Result, Value};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::map::LoopFrame;

/// Final step and the value it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalState {
    pub step: String,
    pub value: Value,
}

/// The invocation that was about to run when a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInvocation {
    pub step: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Halted,
    Terminal,
    Failed,
}

/// Everything needed to resume a run. Owned by the caller between calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub run_id: Uuid,
    /// Value the run was started with.
    pub input: Value,
    pub halted_at_step: Option<String>,
    /// Most recent output per step.
    pub context: BTreeMap<String, Value>,
    /// Active map regions, outermost first.
    pub loop_stack: Vec<LoopFrame>,
    pub terminal: Option<TerminalState>,
    /// Invoked step names, in order.
    #[serde(default)]
    pub trail: Vec<String>,
    #[serde(default)]
    pub steps_taken: usize,
    #[serde(default)]
    pub pending: Option<PendingInvocation>,
}

impl ExecutionSnapshot {
    pub fn new(input: Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            input,
            halted_at_step: None,
            context: BTreeMap::new(),
            loop_stack: Vec::new(),
            terminal: None,
            trail: Vec::new(),
            steps_taken: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> RunState {
        if self.terminal.is_some() {
            RunState::Terminal
        } else if self.halted_at_step.is_some() {
            RunState::Halted
        } else if self.pending.is_some() {
            RunState::Failed
        } else {
            RunState::Running
        }
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.context.get(step)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
