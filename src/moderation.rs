//! The content moderation workflow shipped with the CLI.
//!
//! classify -> clean: publish
//!          -> flagged: review [approval gate] -> approve: publish
//!                                             -> reject: reject

use botrail_core::{CompileConfig, StepError, TypeTag, Value};
use botrail_engine::{compile_with, StepContext, StepDescriptor, StepRegistry, ValidatedGraph};
use serde_json::json;

const BLOCKLIST: &[&str] = &["spam", "scam", "free money", "click here", "crypto giveaway"];

pub const REVIEW_STEP: &str = "review";

fn hits(text: &str) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    BLOCKLIST
        .iter()
        .copied()
        .filter(|term| lower.contains(term))
        .collect()
}

fn run_text<'a>(ctx: &'a StepContext<'_>) -> Result<&'a str, StepError> {
    ctx.run_input
        .as_str()
        .ok_or_else(|| StepError::new("moderation input must be a string"))
}

pub fn registry() -> Result<StepRegistry, botrail_core::ValidationError> {
    StepRegistry::new()
        .with(
            StepDescriptor::new("classify", TypeTag::Str, TypeTag::Str, |v: Value, _| {
                let text = v
                    .as_str()
                    .ok_or_else(|| StepError::new("moderation input must be a string"))?;
                let label = if hits(text).is_empty() { "clean" } else { "flagged" };
                Ok(json!(label))
            })
            .start()
            .with_description("Scan the text for blocklisted phrases")
            .route_on([("clean", "publish"), ("flagged", REVIEW_STEP)]),
        )?
        .with(
            StepDescriptor::new(REVIEW_STEP, TypeTag::Str, TypeTag::Str, |_, ctx| {
                // One stray hit is likely a false positive.
                let proposal = if hits(run_text(ctx)?).len() > 1 {
                    "reject"
                } else {
                    "approve"
                };
                Ok(json!(proposal))
            })
            .requires_approval()
            .with_description("Propose a verdict and wait for a moderator")
            .route_on([("approve", "publish"), ("reject", "reject")]),
        )?
        .with(
            StepDescriptor::new("publish", TypeTag::Str, TypeTag::Str, |_, ctx| {
                Ok(json!(format!("Published: {}", run_text(ctx)?)))
            })
            .with_description("Publish the text"),
        )?
        .with(
            StepDescriptor::new("reject", TypeTag::Str, TypeTag::Str, |_, ctx| {
                let text = run_text(ctx)?;
                Ok(json!(format!(
                    "Rejected ({}): {}",
                    hits(text).join(", "),
                    text
                )))
            })
            .with_description("Reject the text"),
        )
}

pub fn graph(config: &CompileConfig) -> anyhow::Result<ValidatedGraph> {
    Ok(compile_with(registry()?, config)?)
}
