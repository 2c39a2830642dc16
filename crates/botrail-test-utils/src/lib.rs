//! Shared fixtures for botrail tests: step helpers, a call log, and the two
//! reference workflows (content moderation and map/fold uppercase).

use std::sync::{Arc, Mutex};

use botrail_core::{StepError, TypeTag, Value};
use botrail_engine::{compile, StepDescriptor, StepRegistry, ValidatedGraph};
use serde_json::json;

/// Reviewer decision routed by the moderation workflow's review step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Reject => "reject",
        }
    }
}

impl From<Verdict> for Value {
    fn from(v: Verdict) -> Self {
        Value::String(v.as_str().to_string())
    }
}

/// Records step invocations in order. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, step: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(step.to_string());
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, step: &str) -> usize {
        self.calls().iter().filter(|c| *c == step).count()
    }
}

/// Passes its input through unchanged.
pub fn echo(name: &str) -> StepDescriptor {
    StepDescriptor::new(name, TypeTag::Any, TypeTag::Any, |v, _| Ok(v))
}

/// Ignores its input and produces `value`.
pub fn constant(name: &str, value: Value) -> StepDescriptor {
    StepDescriptor::new(name, TypeTag::Any, TypeTag::Any, move |_, _| Ok(value.clone()))
}

/// Always fails with `message`.
pub fn failing(name: &str, message: &'static str) -> StepDescriptor {
    StepDescriptor::new(name, TypeTag::Any, TypeTag::Any, move |_, _| {
        Err(StepError::new(message))
    })
}

/// Build a registry, panicking on duplicate names.
pub fn registry(steps: Vec<StepDescriptor>) -> StepRegistry {
    let mut registry = StepRegistry::new();
    for step in steps {
        if let Err(e) = registry.register(step) {
            panic!("fixture registry: {}", e);
        }
    }
    registry
}

fn compiled(registry: StepRegistry) -> ValidatedGraph {
    match compile(registry) {
        Ok(graph) => graph,
        Err(e) => panic!("fixture graph does not compile: {}", e),
    }
}

/// classify -> (flagged) review [gate] -> approve: publish / reject: end;
/// classify -> (clean) publish.
///
/// Text containing "spam" is flagged. The review step proposes `reject`
/// unless overridden on resume.
pub fn moderation_registry(log: CallLog) -> StepRegistry {
    let classify_log = log.clone();
    let review_log = log.clone();
    let publish_log = log.clone();
    let end_log = log;

    registry(vec![
        StepDescriptor::new("classify", TypeTag::Str, TypeTag::Str, move |v, _| {
            classify_log.record("classify");
            let text = v.as_str().unwrap_or_default();
            Ok(json!(if text.contains("spam") { "flagged" } else { "clean" }))
        })
        .start()
        .route_on([("flagged", "review"), ("clean", "publish")]),
        StepDescriptor::new("review", TypeTag::Str, TypeTag::Str, move |_, _| {
            review_log.record("review");
            Ok(Verdict::Reject.into())
        })
        .requires_approval()
        .route_on([
            (Verdict::Approve.as_str(), "publish"),
            (Verdict::Reject.as_str(), "end"),
        ]),
        StepDescriptor::new("publish", TypeTag::Str, TypeTag::Str, move |_, ctx| {
            publish_log.record("publish");
            Ok(json!(format!(
                "published: {}",
                ctx.run_input.as_str().unwrap_or_default()
            )))
        }),
        StepDescriptor::new("end", TypeTag::Str, TypeTag::Str, move |_, ctx| {
            end_log.record("end");
            Ok(json!(format!(
                "rejected: {}",
                ctx.run_input.as_str().unwrap_or_default()
            )))
        }),
    ])
}

pub fn moderation_graph() -> ValidatedGraph {
    compiled(moderation_registry(CallLog::new()))
}

/// split (comma separated) -> upper per element -> collect [fold] -> report.
pub fn uppercase_registry(log: CallLog) -> StepRegistry {
    let split_log = log.clone();
    let upper_log = log.clone();
    let collect_log = log.clone();
    let report_log = log;

    registry(vec![
        StepDescriptor::new("split", TypeTag::Str, TypeTag::list(TypeTag::Str), move |v, _| {
            split_log.record("split");
            let parts: Vec<&str> = v
                .as_str()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            Ok(json!(parts))
        })
        .start()
        .fan_out_to("upper"),
        StepDescriptor::new("upper", TypeTag::Str, TypeTag::Str, move |v, _| {
            upper_log.record("upper");
            Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
        })
        .route_to("collect"),
        StepDescriptor::new("collect", TypeTag::Str, TypeTag::Str, move |v, _| {
            collect_log.record("collect");
            Ok(v)
        })
        .fold()
        .route_to("report"),
        StepDescriptor::new(
            "report",
            TypeTag::list(TypeTag::Str),
            TypeTag::Str,
            move |v, _| {
                report_log.record("report");
                let items: Vec<&str> = v
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                Ok(json!(items.join(" ")))
            },
        ),
    ])
}

pub fn uppercase_graph() -> ValidatedGraph {
    compiled(uppercase_registry(CallLog::new()))
}
