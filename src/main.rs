//! Wonder CLI - workflow coordinator runner
//!
//! `run` resolves a workflow definition from a directory of documents,
//! drives it with the mock action executor, and streams events as
//! newline-delimited JSON on stdout. Diagnostics go to stderr so the
//! event stream stays machine-readable.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_stream::StreamExt;

use wonder::definition::DefinitionDocument;
use wonder::dispatch::SubscriptionFilter;
use wonder::{
    Coordinator, CoordinatorConfig, Event, FailureKind, FsResourceService, MockActionExecutor,
    StartOptions, Stream, WorkflowDef,
};

/// Exit codes for `run`: 0 completed, 1 failed, 2 cancelled, 3 usage error.
const EXIT_COMPLETED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CANCELLED: i32 = 2;
const EXIT_USAGE: i32 = 3;

#[derive(Parser)]
#[command(name = "wonder")]
#[command(about = "Wonder - workflow coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow and stream its events as NDJSON
    Run {
        /// Workflow reference to resolve
        reference: String,

        /// Run input as a JSON document
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Definition version (latest if omitted)
        #[arg(long)]
        version: Option<u32>,

        /// Directory scanned for definition documents
        #[arg(long, default_value = "definitions")]
        defs: String,

        /// Also stream trace events
        #[arg(long)]
        trace: bool,

        /// Overall run timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Seed for the mock action executor
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Load and validate a workflow document file
    Validate {
        /// Path to a .yaml/.json workflow document
        file: String,
    },
}

struct RunArgs {
    reference: String,
    input: String,
    version: Option<u32>,
    defs: String,
    trace: bool,
    timeout_ms: Option<u64>,
    seed: u64,
}

#[tokio::main]
async fn main() {
    // stdout carries the NDJSON event stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { reference, input, version, defs, trace, timeout_ms, seed } => {
            let args = RunArgs { reference, input, version, defs, trace, timeout_ms, seed };
            match run_workflow(args).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("{} {:#}", "Error:".red().bold(), e);
                    EXIT_USAGE
                }
            }
        }
        Commands::Validate { file } => match validate_document(&file) {
            Ok(()) => EXIT_COMPLETED,
            Err(e) => {
                eprintln!("{} {:#}", "Error:".red().bold(), e);
                EXIT_USAGE
            }
        },
    };
    std::process::exit(code);
}

async fn run_workflow(args: RunArgs) -> anyhow::Result<i32> {
    let input: serde_json::Value =
        serde_json::from_str(&args.input).context("--input is not valid JSON")?;

    let resource = Arc::new(FsResourceService::new(&args.defs));
    let coordinator = Coordinator::new(
        resource,
        Arc::new(MockActionExecutor::new(args.seed)),
        CoordinatorConfig::default(),
    );

    // Subscribe before starting so the first events are not missed.
    let events = coordinator.subscribe(Stream::Events, SubscriptionFilter::default());
    let trace_sub = args
        .trace
        .then(|| coordinator.subscribe(Stream::Trace, SubscriptionFilter::default()));
    let mut merged: Pin<Box<dyn tokio_stream::Stream<Item = Event> + Send>> = match trace_sub {
        Some(trace_sub) => Box::pin(events.into_stream().merge(trace_sub.into_stream())),
        None => Box::pin(events.into_stream()),
    };

    let options = StartOptions {
        enable_trace_events: args.trace,
        timeout_ms: args.timeout_ms,
        ..Default::default()
    };
    let run_id = coordinator
        .start_run(&args.reference, args.version, input, options)
        .await?;

    let mut exit = EXIT_FAILED;
    loop {
        let event = tokio::select! {
            event = merged.next() => event,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{} cancelling run {}", "→".cyan(), run_id);
                coordinator.cancel_run(&run_id);
                continue;
            }
        };
        let Some(event) = event else { break };
        print_event(&event);

        match event.event_type() {
            "workflow.completed" => {
                exit = EXIT_COMPLETED;
                break;
            }
            "workflow.failed" => {
                exit = match &event.payload {
                    wonder::EventPayload::WorkflowFailed { kind: FailureKind::Cancelled, .. } => {
                        EXIT_CANCELLED
                    }
                    _ => EXIT_FAILED,
                };
                break;
            }
            _ => {}
        }
    }

    // Drain trace output that is already in flight before exiting.
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), merged.next()).await
    {
        print_event(&event);
    }
    Ok(exit)
}

fn print_event(event: &Event) {
    if let Ok(line) = serde_json::to_string(event) {
        println!("{line}");
    }
}

fn validate_document(file: &str) -> anyhow::Result<()> {
    let text =
        std::fs::read_to_string(file).with_context(|| format!("cannot read '{file}'"))?;

    // Accept either a tagged document or a bare workflow graph.
    let def: WorkflowDef = match serde_yaml::from_str::<DefinitionDocument>(&text) {
        Ok(DefinitionDocument::Workflow(def)) => def,
        Ok(other) => {
            anyhow::bail!("'{file}' is a {} document, expected workflow", other.kind())
        }
        Err(_) => serde_yaml::from_str::<WorkflowDef>(&text)
            .with_context(|| format!("'{file}' does not parse as a workflow document"))?,
    };

    let reference = def.reference.clone();
    let nodes = def.nodes.len();
    let transitions = def.transitions.len();
    wonder::loader::freeze(def)?;

    println!("{} Workflow '{}' is valid", "✓".green(), reference);
    println!("  Nodes: {nodes}");
    println!("  Transitions: {transitions}");
    Ok(())
}
