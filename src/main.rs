mod moderation;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use botrail_core::{EngineConfig, Value};
use botrail_engine::{Engine, ResumeRequest, RunFailure, RunOptions, RunOutcome, ValidatedGraph};
use botrail_store::{SnapshotStore, SqliteSnapshotStore};

#[derive(Parser)]
#[command(name = "botrail", version, about = "Resumable workflow engine with approval gates")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "botrail.toml")]
    config: PathBuf,

    /// Snapshot database (overrides [store].path)
    #[arg(long, env = "BOTRAIL_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run text through the moderation workflow
    Moderate {
        /// Pass the review gate without halting
        #[arg(long)]
        auto_approve: bool,
        /// The text to moderate
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// Resume a run halted at the review gate
    Resume {
        /// Run id printed when the run halted
        run_id: Uuid,
        /// Moderator decision (prompted when omitted)
        #[arg(long, value_enum)]
        decision: Option<Decision>,
    },
    /// List runs waiting for a decision
    Pending,
    /// Print a stored snapshot as JSON
    Show { run_id: Uuid },
    /// Print the moderation graph
    Graph,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Decision {
    /// Keep the verdict the review step proposed
    Proposed,
    Approve,
    Reject,
}

impl Decision {
    fn into_request(self) -> ResumeRequest {
        match self {
            Decision::Proposed => ResumeRequest::approve(),
            Decision::Approve => ResumeRequest::with_override(Value::from("approve")),
            Decision::Reject => ResumeRequest::with_override(Value::from("reject")),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("botrail=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "botrail", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let graph = Arc::new(moderation::graph(&config.compile)?);
    let engine = Engine::with_config(graph.clone(), config.runtime.clone());

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph => print_graph(&graph),
        Commands::Moderate { auto_approve, text } => {
            let store = open_store(cli.store.as_deref(), &config)?;
            let options = RunOptions {
                auto_approve: auto_approve || config.runtime.auto_approve,
                ..RunOptions::default()
            };
            let result = engine.run_with(Value::from(text.join(" ")), options);
            report(store.as_ref(), result)?;
        }
        Commands::Resume { run_id, decision } => {
            let store = open_store(cli.store.as_deref(), &config)?;
            let snapshot = store
                .load(run_id)?
                .with_context(|| format!("No stored run {}", run_id))?;
            let halted_at = snapshot
                .halted_at_step
                .clone()
                .with_context(|| format!("Run {} is not waiting for a decision", run_id))?;

            let decision = match decision {
                Some(d) => d,
                None => prompt_decision(snapshot.output(&halted_at))?,
            };
            let result = engine.resume_from(snapshot, &halted_at, decision.into_request());
            report(store.as_ref(), result)?;
        }
        Commands::Pending => {
            let store = open_store(cli.store.as_deref(), &config)?;
            let runs = store.list_halted()?;
            if runs.is_empty() {
                println!("No runs waiting for a decision.");
            }
            for run in runs {
                let proposal = store
                    .load(run.run_id)?
                    .and_then(|s| s.output(moderation::REVIEW_STEP).cloned())
                    .unwrap_or(Value::Null);
                println!(
                    "{}  halted at {:<8} proposed {}  ({})",
                    run.run_id,
                    run.halted_at.unwrap_or_default(),
                    proposal,
                    run.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Show { run_id } => {
            let store = open_store(cli.store.as_deref(), &config)?;
            let snapshot = store
                .load(run_id)?
                .with_context(|| format!("No stored run {}", run_id))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        return Ok(EngineConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".botrail").join("config.toml"));
    match home_config {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(EngineConfig::load(&path)?)
        }
        _ => Ok(EngineConfig::default()),
    }
}

fn open_store(
    override_path: Option<&Path>,
    config: &EngineConfig,
) -> anyhow::Result<Box<dyn SnapshotStore>> {
    let path = override_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.store_path());
    let store = SqliteSnapshotStore::open(&path)
        .with_context(|| format!("Failed to open snapshot store at {}", path.display()))?;
    Ok(Box::new(store))
}

/// Persist the resulting snapshot and tell the user what happened.
fn report(
    store: &dyn SnapshotStore,
    result: Result<RunOutcome, RunFailure>,
) -> anyhow::Result<()> {
    match result {
        Ok(RunOutcome::Completed { value, snapshot }) => {
            store.delete(snapshot.run_id)?;
            println!("{}", value.as_str().map(String::from).unwrap_or_else(|| value.to_string()));
            Ok(())
        }
        Ok(RunOutcome::Halted { snapshot }) => {
            store.save(&snapshot)?;
            let step = snapshot.halted_at_step.as_deref().unwrap_or_default();
            let proposal = snapshot.output(step).cloned().unwrap_or(Value::Null);
            println!(
                "Run {} is waiting at '{}' (proposed {}).\nResume with: botrail resume {} --decision approve|reject|proposed",
                snapshot.run_id, step, proposal, snapshot.run_id
            );
            Ok(())
        }
        Err(failure) => {
            warn!(run_id = %failure.snapshot.run_id, "Run failed; snapshot kept for inspection");
            store.save(&failure.snapshot)?;
            Err(failure.into())
        }
    }
}

fn prompt_decision(proposal: Option<&Value>) -> anyhow::Result<Decision> {
    let proposal = proposal.map(|v| v.to_string()).unwrap_or_else(|| "nothing".into());
    let items = [
        format!("Keep proposal ({})", proposal),
        "Approve".to_string(),
        "Reject".to_string(),
    ];
    let choice = dialoguer::Select::new()
        .with_prompt("Moderator decision")
        .items(&items)
        .default(0)
        .interact()?;
    Ok(match choice {
        1 => Decision::Approve,
        2 => Decision::Reject,
        _ => Decision::Proposed,
    })
}

fn print_graph(graph: &ValidatedGraph) {
    println!("start: {}", graph.start());
    for step in graph.steps() {
        let mut flags = Vec::new();
        if step.requires_approval {
            flags.push("approval");
        }
        if step.is_fold {
            flags.push("fold");
        }
        println!(
            "  {} ({} -> {}){}{}",
            step.name,
            step.input_type,
            step.output_type,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            },
            step.description
                .as_deref()
                .map(|d| format!("  # {}", d))
                .unwrap_or_default()
        );
        for edge in graph.edges_from(&step.name) {
            println!("      -> {} {:?}", edge.to, edge.kind);
        }
    }
    for region in graph.regions() {
        println!(
            "map: {} => {} => {} (fold)",
            region.fan_out_step,
            region.members.join(" -> "),
            region.fold_step
        );
    }
    for cycle in graph.cycles() {
        println!("cycle: {}", cycle.join(" -> "));
    }
    for warning in graph.warnings() {
        println!("warning: {}", warning);
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
