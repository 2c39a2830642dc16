use std::sync::Arc;

use botrail_core::EngineError;
use botrail_engine::{compile, Engine, ResumeRequest, RunOptions, RunState};
use botrail_test_utils::{moderation_graph, moderation_registry, CallLog, Verdict};
use serde_json::json;

fn engine_with_log() -> (Engine, CallLog) {
    let log = CallLog::new();
    let graph = compile(moderation_registry(log.clone())).expect("moderation graph compiles");
    (Engine::new(Arc::new(graph)), log)
}

#[test]
fn clean_text_is_published_without_review() {
    let (engine, log) = engine_with_log();
    let outcome = engine.run(json!("a lovely day")).unwrap();

    assert_eq!(outcome.value(), Some(&json!("published: a lovely day")));
    assert_eq!(log.calls(), vec!["classify", "publish"]);
}

#[test]
fn flagged_text_halts_at_review() {
    let (engine, log) = engine_with_log();
    let outcome = engine.run(json!("buy spam now")).unwrap();

    assert!(outcome.is_halted());
    let snapshot = outcome.snapshot();
    assert_eq!(snapshot.state(), RunState::Halted);
    assert_eq!(snapshot.halted_at_step.as_deref(), Some("review"));
    assert_eq!(snapshot.output("classify"), Some(&json!("flagged")));
    assert_eq!(snapshot.output("review"), Some(&Verdict::Reject.into()));
    assert_eq!(log.calls(), vec!["classify", "review"]);
}

#[test]
fn approve_override_publishes() {
    let (engine, log) = engine_with_log();
    let halted = engine.run(json!("buy spam now")).unwrap().into_snapshot();

    let outcome = engine
        .resume_from(halted, "review", ResumeRequest::with_override(Verdict::Approve.into()))
        .unwrap();

    assert_eq!(outcome.value(), Some(&json!("published: buy spam now")));
    // The review step is not invoked again on resume.
    assert_eq!(log.count("review"), 1);
    assert_eq!(log.calls(), vec!["classify", "review", "publish"]);
}

#[test]
fn keeping_the_proposal_rejects() {
    let (engine, log) = engine_with_log();
    let halted = engine.run(json!("spam spam")).unwrap().into_snapshot();

    let outcome = engine
        .resume_from(halted, "review", ResumeRequest::approve())
        .unwrap();

    assert_eq!(outcome.value(), Some(&json!("rejected: spam spam")));
    assert_eq!(log.count("publish"), 0);
    assert_eq!(log.count("end"), 1);
}

#[test]
fn auto_approve_never_halts() {
    let engine = Engine::new(Arc::new(moderation_graph()));
    let outcome = engine
        .run_with(
            json!("spam"),
            RunOptions {
                auto_approve: true,
                ..RunOptions::default()
            },
        )
        .unwrap();
    assert!(!outcome.is_halted());
    assert_eq!(outcome.value(), Some(&json!("rejected: spam")));
}

#[test]
fn resuming_the_wrong_step_changes_nothing() {
    let engine = Engine::new(Arc::new(moderation_graph()));
    let halted = engine.run(json!("spam")).unwrap().into_snapshot();

    let failure = engine
        .resume_from(halted.clone(), "publish", ResumeRequest::approve())
        .unwrap_err();
    assert!(matches!(failure.error, EngineError::Resume(_)));
    assert_eq!(*failure.snapshot, halted);
}

#[test]
fn one_graph_serves_concurrent_runs() {
    let engine = Engine::new(Arc::new(moderation_graph()));
    let handles: Vec<_> = ["ok one", "spam two", "ok three"]
        .into_iter()
        .map(|text| {
            let engine = engine.clone();
            std::thread::spawn(move || engine.run(json!(text)).map(|o| o.is_halted()))
        })
        .collect();

    let halted: Vec<bool> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(halted, vec![false, true, false]);
}
