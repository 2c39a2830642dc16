//! Step dispatch, approval halts, and resumption.
//!
//! The runtime walks a `ValidatedGraph` one invocation at a time. Each call
//! owns its `ExecutionSnapshot` and hands it back by value: completed, halted
//! at an approval gate, or failed with the last coherent state.

use std::sync::Arc;

use botrail_core::{EngineError, RuntimeConfig, TypeTag, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::graph::ValidatedGraph;
use crate::map::{self, LoopFrame};
use crate::routing::{self, NextAction};
use crate::snapshot::{ExecutionSnapshot, PendingInvocation, TerminalState};
use crate::step::StepContext;

/// Per-run options for a fresh run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Pass every approval gate without halting.
    pub auto_approve: bool,
    /// Exposed read-only to every step through its context.
    pub runtime_args: serde_json::Map<String, Value>,
}

/// Decision supplied when resuming a halted run.
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    /// Replaces the halted step's stored output before routing.
    pub output_override: Option<Value>,
    /// Pass every later approval gate in this run segment.
    pub approve_all: bool,
    pub runtime_args: serde_json::Map<String, Value>,
}

impl ResumeRequest {
    /// Approve the halted step's own output.
    pub fn approve() -> Self {
        Self::default()
    }

    pub fn with_override(output: Value) -> Self {
        Self {
            output_override: Some(output),
            ..Self::default()
        }
    }

    pub fn approving_all(mut self) -> Self {
        self.approve_all = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        value: Value,
        snapshot: ExecutionSnapshot,
    },
    Halted {
        snapshot: ExecutionSnapshot,
    },
}

impl RunOutcome {
    pub fn snapshot(&self) -> &ExecutionSnapshot {
        match self {
            RunOutcome::Completed { snapshot, .. } | RunOutcome::Halted { snapshot } => snapshot,
        }
    }

    pub fn into_snapshot(self) -> ExecutionSnapshot {
        match self {
            RunOutcome::Completed { snapshot, .. } | RunOutcome::Halted { snapshot } => snapshot,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            RunOutcome::Completed { value, .. } => Some(value),
            RunOutcome::Halted { .. } => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, RunOutcome::Halted { .. })
    }
}

/// A failed run: the error plus the last coherent snapshot.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: EngineError,
    pub snapshot: Box<ExecutionSnapshot>,
}

impl RunFailure {
    fn new(error: EngineError, snapshot: ExecutionSnapshot) -> Self {
        Self {
            error,
            snapshot: Box::new(snapshot),
        }
    }
}

pub type RunResult = std::result::Result<RunOutcome, RunFailure>;

enum Cursor {
    Invoke {
        step: String,
        input: Value,
    },
    Route {
        step: String,
        output: Value,
        undo: Option<Undo>,
    },
}

/// What one invocation changed. Applied when its output cannot be routed,
/// leaving the run in front of that invocation with it pending.
struct Undo {
    input: Value,
    previous_output: Option<Value>,
    loop_stack: Vec<LoopFrame>,
}

impl Undo {
    fn apply(self, snapshot: &mut ExecutionSnapshot, step: &str) {
        snapshot.steps_taken = snapshot.steps_taken.saturating_sub(1);
        snapshot.trail.pop();
        match self.previous_output {
            Some(previous) => {
                snapshot.context.insert(step.to_string(), previous);
            }
            None => {
                snapshot.context.remove(step);
            }
        }
        snapshot.loop_stack = self.loop_stack;
        snapshot.pending = Some(PendingInvocation {
            step: step.to_string(),
            input: self.input,
        });
    }
}

struct Session {
    approve_all: bool,
    runtime_args: serde_json::Map<String, Value>,
    resumed: bool,
}

/// Executes runs against one shared validated graph.
#[derive(Debug, Clone)]
pub struct Engine {
    graph: Arc<ValidatedGraph>,
    config: RuntimeConfig,
}

impl Engine {
    pub fn new(graph: Arc<ValidatedGraph>) -> Self {
        Self::with_config(graph, RuntimeConfig::default())
    }

    pub fn with_config(graph: Arc<ValidatedGraph>, config: RuntimeConfig) -> Self {
        Self { graph, config }
    }

    pub fn graph(&self) -> &ValidatedGraph {
        &self.graph
    }

    /// Start a fresh run at the start step.
    pub fn run(&self, input: Value) -> RunResult {
        self.run_with(
            input,
            RunOptions {
                auto_approve: self.config.auto_approve,
                ..RunOptions::default()
            },
        )
    }

    pub fn run_with(&self, input: Value, options: RunOptions) -> RunResult {
        let snapshot = ExecutionSnapshot::new(input.clone());
        info!(run_id = %snapshot.run_id, start = %self.graph.start(), "Starting run");
        let cursor = Cursor::Invoke {
            step: self.graph.start().to_string(),
            input,
        };
        self.drive(
            snapshot,
            cursor,
            Session {
                approve_all: options.auto_approve,
                runtime_args: options.runtime_args,
                resumed: false,
            },
        )
    }

    /// Continue a run halted at `step`. The halted step is not re-invoked;
    /// its stored output, or the override, is routed onward.
    pub fn resume_from(
        &self,
        mut snapshot: ExecutionSnapshot,
        step: &str,
        request: ResumeRequest,
    ) -> RunResult {
        if let Err(reason) = self.check_resume(&snapshot, step, request.output_override.as_ref()) {
            warn!(run_id = %snapshot.run_id, step = %step, reason = %reason, "Rejected resume");
            return Err(RunFailure::new(EngineError::Resume(reason), snapshot));
        }

        let original = snapshot.clone();
        if let Some(output) = request.output_override {
            snapshot.context.insert(step.to_string(), output);
        }
        let Some(output) = snapshot.context.get(step).cloned() else {
            return Err(RunFailure::new(
                EngineError::Resume(format!("no stored output for step {}", step)),
                original,
            ));
        };
        snapshot.halted_at_step = None;

        info!(run_id = %snapshot.run_id, step = %step, "Resuming run");
        let steps_before = original.steps_taken;
        let result = self.drive(
            snapshot,
            Cursor::Route {
                step: step.to_string(),
                output,
                undo: None,
            },
            Session {
                approve_all: request.approve_all,
                runtime_args: request.runtime_args,
                resumed: true,
            },
        );

        // Routing the halted step's own output failed: hand the halted snapshot back.
        match result {
            Err(failure)
                if failure.snapshot.steps_taken == steps_before
                    && failure.snapshot.pending.is_none() =>
            {
                Err(RunFailure::new(failure.error, original))
            }
            other => other,
        }
    }

    /// Re-invoke the pending invocation of a failure snapshot.
    pub fn retry(&self, mut snapshot: ExecutionSnapshot, options: RunOptions) -> RunResult {
        let Some(pending) = snapshot.pending.take() else {
            return Err(RunFailure::new(
                EngineError::Resume("snapshot has no pending invocation".to_string()),
                snapshot,
            ));
        };
        info!(run_id = %snapshot.run_id, step = %pending.step, "Retrying failed invocation");
        self.drive(
            snapshot,
            Cursor::Invoke {
                step: pending.step,
                input: pending.input,
            },
            Session {
                approve_all: options.auto_approve,
                runtime_args: options.runtime_args,
                resumed: true,
            },
        )
    }

    fn check_resume(
        &self,
        snapshot: &ExecutionSnapshot,
        step: &str,
        output_override: Option<&Value>,
    ) -> Result<(), String> {
        match snapshot.halted_at_step.as_deref() {
            None => return Err("run is not halted".to_string()),
            Some(halted) if halted != step => {
                return Err(format!("run is halted at {}, not {}", halted, step));
            }
            Some(_) => {}
        }
        let descriptor = self
            .graph
            .step(step)
            .ok_or_else(|| format!("unknown step {}", step))?;
        if let Some(value) = output_override {
            if descriptor.output_type == TypeTag::Never {
                return Err(format!(
                    "step {} declares no output and cannot be overridden",
                    step
                ));
            }
            // A fold hands its collected list onward.
            let produced = if descriptor.is_fold {
                TypeTag::list(descriptor.output_type.clone())
            } else {
                descriptor.output_type.clone()
            };
            if !produced.admits(value) {
                return Err(format!(
                    "override does not match {}'s output type {}",
                    step, produced
                ));
            }
        }
        Ok(())
    }

    fn drive(
        &self,
        mut snapshot: ExecutionSnapshot,
        mut cursor: Cursor,
        session: Session,
    ) -> RunResult {
        loop {
            cursor = match cursor {
                Cursor::Invoke { step, input } => {
                    if snapshot.steps_taken >= self.config.max_steps {
                        snapshot.pending = Some(PendingInvocation { step, input });
                        return Err(RunFailure::new(
                            EngineError::StepBudgetExhausted(self.config.max_steps),
                            snapshot,
                        ));
                    }
                    let Some(descriptor) = self.graph.step(&step) else {
                        return Err(RunFailure::new(
                            EngineError::routing(&step, "step is not part of the graph"),
                            snapshot,
                        ));
                    };

                    debug!(run_id = %snapshot.run_id, step = %step, "Invoking step");
                    let result = {
                        let ctx = StepContext {
                            step: &step,
                            run_id: snapshot.run_id,
                            run_input: &snapshot.input,
                            outputs: &snapshot.context,
                            loop_meta: snapshot.loop_stack.last().map(LoopFrame::meta),
                            runtime_args: &session.runtime_args,
                            resumed: session.resumed,
                        };
                        descriptor.body().call(input.clone(), &ctx)
                    };

                    let output = match result {
                        Ok(output) => output,
                        Err(e) => {
                            error!(run_id = %snapshot.run_id, step = %step, error = %e, "Step failed");
                            snapshot.pending = Some(PendingInvocation {
                                step: step.clone(),
                                input,
                            });
                            return Err(RunFailure::new(EngineError::step(step, e), snapshot));
                        }
                    };

                    snapshot.steps_taken += 1;
                    snapshot.trail.push(step.clone());
                    let previous_output = snapshot.context.insert(step.clone(), output.clone());

                    if descriptor.requires_approval && !session.approve_all {
                        info!(run_id = %snapshot.run_id, step = %step, "Run halted awaiting approval");
                        snapshot.halted_at_step = Some(step);
                        return Ok(RunOutcome::Halted { snapshot });
                    }
                    let undo = Undo {
                        input,
                        previous_output,
                        loop_stack: snapshot.loop_stack.clone(),
                    };
                    Cursor::Route {
                        step,
                        output,
                        undo: Some(undo),
                    }
                }
                Cursor::Route { step, output, undo } => {
                    match self.advance(&mut snapshot, &step, output) {
                        Ok(Some(next)) => next,
                        Ok(None) => {
                            let value = snapshot
                                .terminal
                                .as_ref()
                                .map(|t| t.value.clone())
                                .unwrap_or(Value::Null);
                            info!(
                                run_id = %snapshot.run_id,
                                step = %step,
                                steps = snapshot.steps_taken,
                                "Run completed"
                            );
                            return Ok(RunOutcome::Completed { value, snapshot });
                        }
                        Err(e) => {
                            error!(run_id = %snapshot.run_id, step = %step, error = %e, "Routing failed");
                            if let Some(undo) = undo {
                                undo.apply(&mut snapshot, &step);
                            }
                            return Err(RunFailure::new(e, snapshot));
                        }
                    }
                }
            };
        }
    }

    /// Decide what follows `step`'s output. `None` means the run is terminal.
    fn advance(
        &self,
        snapshot: &mut ExecutionSnapshot,
        step: &str,
        output: Value,
    ) -> Result<Option<Cursor>, EngineError> {
        let descriptor = self
            .graph
            .step(step)
            .ok_or_else(|| EngineError::routing(step, "step is not part of the graph"))?;

        let closing = map::closes_frame(&snapshot.loop_stack, step);
        let next = routing::resolve_next(descriptor, &output)?;
        if closing {
            snapshot.loop_stack.pop();
        }

        let cursor = match next {
            NextAction::Terminal => {
                snapshot.terminal = Some(TerminalState {
                    step: step.to_string(),
                    value: output,
                });
                return Ok(None);
            }
            NextAction::GoTo(target) => {
                if map::returns_to_controller(&snapshot.loop_stack, &target) {
                    let dispatch = map::complete_element(&mut snapshot.loop_stack, step, output)?;
                    Cursor::Invoke {
                        step: dispatch.step,
                        input: dispatch.input,
                    }
                } else {
                    Cursor::Invoke {
                        step: target,
                        input: output,
                    }
                }
            }
            NextAction::FanOut(_) => {
                let region = self.graph.region(step).ok_or_else(|| {
                    EngineError::routing(step, "fan-out step has no map region")
                })?;
                let dispatch = map::enter(&mut snapshot.loop_stack, region, output)?;
                debug!(
                    run_id = %snapshot.run_id,
                    fan_out = %step,
                    elements = snapshot.loop_stack.last().map(|f| f.expected).unwrap_or(0),
                    "Entered map region"
                );
                Cursor::Invoke {
                    step: dispatch.step,
                    input: dispatch.input,
                }
            }
        };
        Ok(Some(cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{compile, StepDescriptor, StepRegistry};
    use crate::snapshot::RunState;
    use botrail_core::StepError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn engine(steps: Vec<StepDescriptor>) -> Engine {
        let mut registry = StepRegistry::new();
        for s in steps {
            registry.register(s).unwrap();
        }
        Engine::new(Arc::new(compile(registry).unwrap()))
    }

    fn upper(name: &str) -> StepDescriptor {
        StepDescriptor::new(name, TypeTag::Str, TypeTag::Str, |v, _| {
            Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
        })
    }

    fn moderation(gate: bool) -> Engine {
        let review = StepDescriptor::new("review", TypeTag::Str, TypeTag::Str, |_, _| {
            Ok(json!("reject"))
        })
        .route_on([("approve", "publish"), ("reject", "end")]);
        let review = if gate { review.requires_approval() } else { review };
        engine(vec![
            StepDescriptor::new("classify", TypeTag::Str, TypeTag::Str, |v, _| {
                let text = v.as_str().unwrap_or_default();
                Ok(json!(if text.contains("spam") { "flagged" } else { "clean" }))
            })
            .start()
            .route_on([("flagged", "review"), ("clean", "publish")]),
            review,
            StepDescriptor::new("publish", TypeTag::Str, TypeTag::Str, |_, ctx| {
                Ok(json!(format!("published: {}", ctx.run_input.as_str().unwrap_or_default())))
            }),
            StepDescriptor::new("end", TypeTag::Str, TypeTag::Str, |_, _| Ok(json!("rejected"))),
        ])
    }

    #[test]
    fn clean_text_runs_to_completion() {
        let outcome = moderation(true).run(json!("hello")).unwrap();
        assert_eq!(outcome.value(), Some(&json!("published: hello")));
        let snap = outcome.snapshot();
        assert_eq!(snap.state(), RunState::Terminal);
        assert_eq!(snap.trail, vec!["classify".to_string(), "publish".to_string()]);
        assert_eq!(snap.steps_taken, 2);
        assert_eq!(snap.terminal.as_ref().unwrap().step, "publish");
    }

    #[test]
    fn gate_halts_with_output_stored() {
        let outcome = moderation(true).run(json!("buy spam")).unwrap();
        assert!(outcome.is_halted());
        let snap = outcome.into_snapshot();
        assert_eq!(snap.halted_at_step.as_deref(), Some("review"));
        assert_eq!(snap.output("review"), Some(&json!("reject")));
        assert!(snap.terminal.is_none());
    }

    #[test]
    fn resume_routes_stored_output_or_override() {
        let engine = moderation(true);
        let halted = engine.run(json!("buy spam")).unwrap().into_snapshot();

        let approved = engine
            .resume_from(halted.clone(), "review", ResumeRequest::approve())
            .unwrap();
        assert_eq!(approved.value(), Some(&json!("rejected")));

        let overridden = engine
            .resume_from(halted, "review", ResumeRequest::with_override(json!("approve")))
            .unwrap();
        assert_eq!(overridden.value(), Some(&json!("published: buy spam")));
        assert_eq!(overridden.snapshot().output("review"), Some(&json!("approve")));
        assert_eq!(
            overridden.snapshot().trail,
            vec!["classify".to_string(), "review".to_string(), "publish".to_string()]
        );
    }

    #[test]
    fn approval_round_trip_matches_ungated_run_with_override() {
        let gated = moderation(true);
        let halted = gated.run(json!("spam again")).unwrap().into_snapshot();
        let resumed = gated
            .resume_from(halted, "review", ResumeRequest::with_override(json!("approve")))
            .unwrap();

        // Same workflow without the gate, with review producing the override.
        let ungated = engine(vec![
            StepDescriptor::new("classify", TypeTag::Str, TypeTag::Str, |_, _| Ok(json!("flagged")))
                .start()
                .route_on([("flagged", "review"), ("clean", "publish")]),
            StepDescriptor::new("review", TypeTag::Str, TypeTag::Str, |_, _| Ok(json!("approve")))
                .route_on([("approve", "publish"), ("reject", "end")]),
            StepDescriptor::new("publish", TypeTag::Str, TypeTag::Str, |_, ctx| {
                Ok(json!(format!("published: {}", ctx.run_input.as_str().unwrap_or_default())))
            }),
            StepDescriptor::new("end", TypeTag::Str, TypeTag::Str, |_, _| Ok(json!("rejected"))),
        ]);
        let direct = ungated.run(json!("spam again")).unwrap();

        assert_eq!(resumed.value(), direct.value());
        assert_eq!(resumed.snapshot().context, direct.snapshot().context);
        assert_eq!(resumed.snapshot().trail, direct.snapshot().trail);
    }

    #[test]
    fn resume_rejections_hand_back_the_snapshot() {
        let engine = moderation(true);
        let halted = engine.run(json!("spam")).unwrap().into_snapshot();

        let wrong_step = engine
            .resume_from(halted.clone(), "classify", ResumeRequest::approve())
            .unwrap_err();
        assert!(matches!(wrong_step.error, EngineError::Resume(_)));
        assert_eq!(*wrong_step.snapshot, halted);

        let bad_type = engine
            .resume_from(halted.clone(), "review", ResumeRequest::with_override(json!(42)))
            .unwrap_err();
        assert!(matches!(bad_type.error, EngineError::Resume(_)));
        assert_eq!(*bad_type.snapshot, halted);

        let finished = engine.run(json!("fine")).unwrap().into_snapshot();
        let not_halted = engine
            .resume_from(finished, "review", ResumeRequest::approve())
            .unwrap_err();
        assert!(matches!(not_halted.error, EngineError::Resume(_)));
    }

    #[test]
    fn unroutable_override_keeps_run_halted() {
        let engine = moderation(true);
        let halted = engine.run(json!("spam")).unwrap().into_snapshot();
        let failure = engine
            .resume_from(halted.clone(), "review", ResumeRequest::with_override(json!("maybe")))
            .unwrap_err();
        assert!(matches!(failure.error, EngineError::Routing { .. }));
        assert_eq!(*failure.snapshot, halted);

        let retried = engine
            .resume_from(*failure.snapshot, "review", ResumeRequest::with_override(json!("approve")))
            .unwrap();
        assert_eq!(retried.value(), Some(&json!("published: spam")));
    }

    #[test]
    fn never_output_cannot_be_overridden() {
        let engine = engine(vec![
            StepDescriptor::new("explore", TypeTag::Int, TypeTag::Never, |_, _| Ok(json!("open")))
                .start()
                .requires_approval(),
        ]);
        let halted = engine.run(json!(1)).unwrap().into_snapshot();
        let err = engine
            .resume_from(halted.clone(), "explore", ResumeRequest::with_override(json!("x")))
            .unwrap_err();
        assert!(matches!(err.error, EngineError::Resume(_)));

        let done = engine
            .resume_from(halted, "explore", ResumeRequest::approve())
            .unwrap();
        assert_eq!(done.value(), Some(&json!("open")));
    }

    #[test]
    fn auto_approve_passes_every_gate() {
        let outcome = moderation(true)
            .run_with(
                json!("spam"),
                RunOptions {
                    auto_approve: true,
                    ..RunOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.value(), Some(&json!("rejected")));

        let config = RuntimeConfig {
            auto_approve: true,
            ..RuntimeConfig::default()
        };
        let gated = Engine::with_config(moderation(true).graph.clone(), config);
        assert!(!gated.run(json!("spam")).unwrap().is_halted());
    }

    #[test]
    fn approve_all_applies_to_later_gates() {
        let engine = engine(vec![
            StepDescriptor::new("first", TypeTag::Any, TypeTag::Any, |v, _| Ok(v))
                .start()
                .requires_approval()
                .route_to("second"),
            StepDescriptor::new("second", TypeTag::Any, TypeTag::Any, |v, _| Ok(v))
                .requires_approval(),
        ]);
        let halted = engine.run(json!(7)).unwrap().into_snapshot();

        let step_by_step = engine
            .resume_from(halted.clone(), "first", ResumeRequest::approve())
            .unwrap();
        assert_eq!(
            step_by_step.snapshot().halted_at_step.as_deref(),
            Some("second")
        );

        let all = engine
            .resume_from(halted, "first", ResumeRequest::approve().approving_all())
            .unwrap();
        assert_eq!(all.value(), Some(&json!(7)));
    }

    #[test]
    fn step_failure_keeps_state_before_the_step_and_retry_reinvokes() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let engine = engine(vec![
            StepDescriptor::new("load", TypeTag::Str, TypeTag::Str, |v, _| Ok(v))
                .start()
                .route_to("flaky"),
            StepDescriptor::new("flaky", TypeTag::Str, TypeTag::Str, move |v, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StepError::new("upstream unavailable"))
                } else {
                    Ok(json!(format!("{}!", v.as_str().unwrap_or_default())))
                }
            }),
        ]);

        let failure = engine.run(json!("hi")).unwrap_err();
        assert!(matches!(failure.error, EngineError::Step { ref step, .. } if step == "flaky"));
        let snap = *failure.snapshot;
        assert_eq!(snap.state(), RunState::Failed);
        assert!(snap.output("flaky").is_none());
        assert_eq!(snap.output("load"), Some(&json!("hi")));
        assert_eq!(
            snap.pending,
            Some(PendingInvocation {
                step: "flaky".into(),
                input: json!("hi")
            })
        );

        let retried = engine.retry(snap, RunOptions::default()).unwrap();
        assert_eq!(retried.value(), Some(&json!("hi!")));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(retried.snapshot().pending.is_none());
    }

    #[test]
    fn retry_without_pending_is_rejected() {
        let engine = moderation(false);
        let done = engine.run(json!("ok")).unwrap().into_snapshot();
        let err = engine.retry(done, RunOptions::default()).unwrap_err();
        assert!(matches!(err.error, EngineError::Resume(_)));
    }

    #[test]
    fn step_budget_stops_unbounded_loops() {
        let graph = {
            let mut registry = StepRegistry::new();
            registry
                .register(
                    StepDescriptor::new("tick", TypeTag::Any, TypeTag::Any, |_, _| Ok(json!("again")))
                        .start()
                        .route_on([("again", "tock"), ("stop", "done")]),
                )
                .unwrap();
            registry
                .register(StepDescriptor::new("tock", TypeTag::Any, TypeTag::Any, |v, _| Ok(v)).route_to("tick"))
                .unwrap();
            registry
                .register(StepDescriptor::new("done", TypeTag::Any, TypeTag::Any, |v, _| Ok(v)))
                .unwrap();
            Arc::new(compile(registry).unwrap())
        };
        let engine = Engine::with_config(
            graph,
            RuntimeConfig {
                max_steps: 25,
                ..RuntimeConfig::default()
            },
        );
        let failure = engine.run(json!(null)).unwrap_err();
        assert!(matches!(failure.error, EngineError::StepBudgetExhausted(25)));
        assert_eq!(failure.snapshot.steps_taken, 25);
        assert!(failure.snapshot.pending.is_some());
    }

    fn map_engine(seen: Arc<Mutex<Vec<Value>>>) -> Engine {
        engine(vec![
            StepDescriptor::new("split", TypeTag::Str, TypeTag::list(TypeTag::Str), |v, _| {
                let text = v.as_str().unwrap_or_default();
                Ok(json!(text
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()))
            })
            .start()
            .fan_out_to("upper"),
            upper("upper").route_to("collect"),
            StepDescriptor::new("collect", TypeTag::Str, TypeTag::Str, move |v, _| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push(v.clone());
                }
                Ok(v)
            })
            .fold()
            .route_to("report"),
            StepDescriptor::new("report", TypeTag::list(TypeTag::Str), TypeTag::Str, |v, _| {
                let items: Vec<&str> = v
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                Ok(json!(items.join("-")))
            }),
        ])
    }

    #[test]
    fn map_fold_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let outcome = map_engine(seen.clone()).run(json!("a,b,c")).unwrap();
        assert_eq!(outcome.value(), Some(&json!("A-B-C")));
        assert_eq!(*seen.lock().unwrap(), vec![json!(["A", "B", "C"])]);
        let snap = outcome.snapshot();
        assert!(snap.loop_stack.is_empty());
        assert_eq!(
            snap.trail,
            vec!["split", "upper", "upper", "upper", "collect", "report"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_collection_folds_once_with_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let outcome = map_engine(seen.clone()).run(json!("")).unwrap();
        assert_eq!(outcome.value(), Some(&json!("")));
        assert_eq!(*seen.lock().unwrap(), vec![json!([])]);
        assert!(!outcome.snapshot().trail.iter().any(|s| s == "upper"));
    }

    #[test]
    fn steps_in_a_region_see_loop_metadata() {
        let metas = Arc::new(Mutex::new(Vec::new()));
        let sink = metas.clone();
        let engine = engine(vec![
            StepDescriptor::new("split", TypeTag::Any, TypeTag::list(TypeTag::Any), |v, _| Ok(v))
                .start()
                .fan_out_to("visit"),
            StepDescriptor::new("visit", TypeTag::Any, TypeTag::Any, move |v, ctx| {
                if let (Some(meta), Ok(mut sink)) = (ctx.loop_meta.clone(), sink.lock()) {
                    sink.push((meta.index, meta.total));
                }
                Ok(v)
            })
            .route_to("collect"),
            StepDescriptor::new("collect", TypeTag::Any, TypeTag::Any, |v, ctx| {
                assert!(ctx.loop_meta.is_some());
                Ok(v)
            })
            .fold(),
        ]);
        engine.run(json!([10, 20])).unwrap();
        assert_eq!(*metas.lock().unwrap(), vec![(0, 2), (1, 2)]);
    }

    #[test]
    fn nested_regions_resolve_innermost_first() {
        let engine = engine(vec![
            StepDescriptor::new(
                "rows",
                TypeTag::Any,
                TypeTag::list(TypeTag::list(TypeTag::Int)),
                |v, _| Ok(v),
            )
            .start()
            .fan_out_to("cells"),
            StepDescriptor::new("cells", TypeTag::list(TypeTag::Int), TypeTag::list(TypeTag::Int), |v, _| Ok(v))
                .fan_out_to("double"),
            StepDescriptor::new("double", TypeTag::Int, TypeTag::Int, |v, _| {
                Ok(json!(v.as_i64().unwrap_or(0) * 2))
            })
            .route_to("row_sum"),
            StepDescriptor::new("row_sum", TypeTag::list(TypeTag::Int), TypeTag::Int, |v, _| {
                let sum: i64 = v
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(json!(sum))
            })
            .fold()
            .route_to("sums"),
            StepDescriptor::new("sums", TypeTag::list(TypeTag::Int), TypeTag::Int, |v, _| Ok(v))
                .fold(),
        ]);
        let outcome = engine.run(json!([[1, 2], [], [3]])).unwrap();
        assert_eq!(outcome.value(), Some(&json!([6, 0, 6])));
        assert!(outcome.snapshot().loop_stack.is_empty());
    }

    #[test]
    fn halting_inside_a_region_resumes_the_loop() {
        let engine = engine(vec![
            StepDescriptor::new("split", TypeTag::Any, TypeTag::list(TypeTag::Str), |v, _| Ok(v))
                .start()
                .fan_out_to("draft"),
            StepDescriptor::new("draft", TypeTag::Str, TypeTag::Str, |v, _| {
                Ok(json!(format!("draft of {}", v.as_str().unwrap_or_default())))
            })
            .requires_approval()
            .route_to("collect"),
            StepDescriptor::new("collect", TypeTag::Str, TypeTag::list(TypeTag::Str), |v, _| Ok(v))
                .fold(),
        ]);

        let halted = engine.run(json!(["x", "y"])).unwrap().into_snapshot();
        assert_eq!(halted.loop_stack.len(), 1);
        assert_eq!(halted.loop_stack[0].remaining_elements.len(), 1);

        // The snapshot survives serialization between halts.
        let restored = ExecutionSnapshot::from_json(&halted.to_json().unwrap()).unwrap();
        let second = engine
            .resume_from(restored, "draft", ResumeRequest::with_override(json!("edited x")))
            .unwrap()
            .into_snapshot();
        assert_eq!(second.halted_at_step.as_deref(), Some("draft"));
        assert_eq!(second.loop_stack[0].accumulated, vec![json!("edited x")]);

        let done = engine
            .resume_from(second, "draft", ResumeRequest::approve())
            .unwrap();
        assert_eq!(done.value(), Some(&json!(["edited x", "draft of y"])));
    }

    /// A step body that produces `first` on its first call and `then` afterwards.
    fn changes_its_mind(name: &str, first: Value, then: Value) -> (StepDescriptor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let step = StepDescriptor::new(name, TypeTag::Any, TypeTag::Any, move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(first.clone())
            } else {
                Ok(then.clone())
            }
        });
        (step, calls)
    }

    fn assert_failed_before(snap: &ExecutionSnapshot, step: &str, input: Value) {
        assert_eq!(snap.state(), RunState::Failed);
        assert!(snap.output(step).is_none());
        assert!(!snap.trail.iter().any(|s| s == step));
        assert_eq!(
            snap.pending,
            Some(PendingInvocation {
                step: step.into(),
                input
            })
        );
    }

    #[test]
    fn missing_branch_fails_before_the_step_and_retries() {
        let (classify, calls) = changes_its_mind("classify", json!("maybe"), json!("yes"));
        let engine = engine(vec![
            classify.start().route_on([("yes", "accept"), ("no", "decline")]),
            StepDescriptor::new("accept", TypeTag::Any, TypeTag::Any, |_, _| Ok(json!("accepted"))),
            StepDescriptor::new("decline", TypeTag::Any, TypeTag::Any, |_, _| Ok(json!("declined"))),
        ]);

        let failure = engine.run(json!("ticket")).unwrap_err();
        assert!(matches!(failure.error, EngineError::Routing { ref step, .. } if step == "classify"));
        let snap = *failure.snapshot;
        assert_failed_before(&snap, "classify", json!("ticket"));
        assert_eq!(snap.steps_taken, 0);

        let retried = engine.retry(snap, RunOptions::default()).unwrap();
        assert_eq!(retried.value(), Some(&json!("accepted")));
        assert_eq!(retried.snapshot().trail, vec!["classify".to_string(), "accept".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn dispatcher(first: Value) -> Engine {
        let (triage, _) = changes_its_mind("triage", first, json!("archive"));
        engine(vec![
            StepDescriptor::new("load", TypeTag::Any, TypeTag::Any, |v, _| Ok(v))
                .start()
                .route_to("triage"),
            triage.route_with(
                |v: &Value| -> Result<String, StepError> {
                    v.as_str()
                        .map(String::from)
                        .ok_or_else(|| StepError::new("triage produced no target"))
                },
                ["archive", "escalate"],
            ),
            StepDescriptor::new("archive", TypeTag::Any, TypeTag::Any, |_, ctx| {
                Ok(json!(format!("archived {}", ctx.run_input)))
            }),
            StepDescriptor::new("escalate", TypeTag::Any, TypeTag::Any, |_, _| Ok(json!("escalated"))),
        ])
    }

    #[test]
    fn dynamic_route_picks_a_declared_target() {
        let outcome = dispatcher(json!("escalate")).run(json!(7)).unwrap();
        assert_eq!(outcome.value(), Some(&json!("escalated")));
        assert_eq!(
            outcome.snapshot().trail,
            vec!["load".to_string(), "triage".to_string(), "escalate".to_string()]
        );
    }

    #[test]
    fn undeclared_dynamic_target_fails_before_the_step_and_retries() {
        let engine = dispatcher(json!("shred"));
        let failure = engine.run(json!(7)).unwrap_err();
        assert!(matches!(failure.error, EngineError::Routing { ref step, .. } if step == "triage"));
        let snap = *failure.snapshot;
        assert_failed_before(&snap, "triage", json!(7));
        assert_eq!(snap.output("load"), Some(&json!(7)));
        assert_eq!(snap.trail, vec!["load".to_string()]);

        let retried = engine.retry(snap, RunOptions::default()).unwrap();
        assert_eq!(retried.value(), Some(&json!("archived 7")));
    }

    #[test]
    fn failing_resolver_is_a_step_error_and_retries() {
        let engine = dispatcher(json!(null));
        let failure = engine.run(json!(7)).unwrap_err();
        assert!(matches!(failure.error, EngineError::Step { ref step, .. } if step == "triage"));
        assert_failed_before(&failure.snapshot, "triage", json!(7));

        let retried = engine.retry(*failure.snapshot, RunOptions::default()).unwrap();
        assert_eq!(retried.value(), Some(&json!("archived 7")));
    }

    #[test]
    fn fan_out_over_non_array_fails_before_the_step_and_retries() {
        let (split, _) = changes_its_mind("split", json!("oops"), json!(["a", "b"]));
        let engine = engine(vec![
            split.start().fan_out_to("work"),
            StepDescriptor::new("work", TypeTag::Any, TypeTag::Any, |v, _| Ok(v)).route_to("collect"),
            StepDescriptor::new("collect", TypeTag::Any, TypeTag::Any, |v, _| Ok(v)).fold(),
        ]);
        let failure = engine.run(json!(null)).unwrap_err();
        assert!(matches!(failure.error, EngineError::Type { ref step, .. } if step == "split"));
        assert!(failure.snapshot.loop_stack.is_empty());
        assert_failed_before(&failure.snapshot, "split", json!(null));

        let retried = engine.retry(*failure.snapshot, RunOptions::default()).unwrap();
        assert_eq!(retried.value(), Some(&json!(["a", "b"])));
    }

    fn gated_fold() -> Engine {
        engine(vec![
            StepDescriptor::new("split", TypeTag::Any, TypeTag::list(TypeTag::Str), |v, _| Ok(v))
                .start()
                .fan_out_to("upper"),
            upper("upper").route_to("collect"),
            StepDescriptor::new("collect", TypeTag::Str, TypeTag::Str, |v, _| Ok(v))
                .fold()
                .requires_approval()
                .route_to("report"),
            StepDescriptor::new("report", TypeTag::list(TypeTag::Str), TypeTag::Str, |v, _| {
                let items = v
                    .as_array()
                    .ok_or_else(|| StepError::new(format!("report got non-list {}", v)))?;
                Ok(json!(items.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" ")))
            }),
        ])
    }

    #[test]
    fn fold_override_is_checked_as_a_list() {
        let engine = gated_fold();
        let halted = engine.run(json!(["a", "b"])).unwrap().into_snapshot();
        assert_eq!(halted.halted_at_step.as_deref(), Some("collect"));
        assert_eq!(halted.output("collect"), Some(&json!(["A", "B"])));

        let single = engine
            .resume_from(halted.clone(), "collect", ResumeRequest::with_override(json!("X")))
            .unwrap_err();
        assert!(matches!(single.error, EngineError::Resume(_)));
        assert_eq!(*single.snapshot, halted);

        let listed = engine
            .resume_from(halted, "collect", ResumeRequest::with_override(json!(["X"])))
            .unwrap();
        assert_eq!(listed.value(), Some(&json!("X")));
        assert!(listed.snapshot().loop_stack.is_empty());
    }

    #[test]
    fn runtime_args_reach_steps() {
        let engine = engine(vec![StepDescriptor::new("greet", TypeTag::Str, TypeTag::Str, |v, ctx| {
            let greeting = ctx.arg("greeting").and_then(Value::as_str).unwrap_or("hello");
            Ok(json!(format!("{} {}", greeting, v.as_str().unwrap_or_default())))
        })
        .start()]);
        let mut args = serde_json::Map::new();
        args.insert("greeting".into(), json!("hi"));
        let outcome = engine
            .run_with(
                json!("there"),
                RunOptions {
                    runtime_args: args,
                    ..RunOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.value(), Some(&json!("hi there")));
    }
}
