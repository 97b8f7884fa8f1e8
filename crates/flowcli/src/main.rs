// crates/flowcli/src/main.rs

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use flowcore::{FlowConfig, FlowSpec, NodeSpec, RuntimeEvent};
use flowruntime::{FlowRuntime, NodeRegistry, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a flow file and run it until interrupted
    Run {
        /// Path to the flow JSON file
        #[arg(short, long)]
        flows: PathBuf,

        /// Path to a settings JSON file
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to the flow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flows.json")]
        output: PathBuf,
    },
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            flows,
            settings,
            verbose,
        } => {
            let default_level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
                .init();

            run_flows(flows, settings).await?;
        }

        Commands::Validate { file } => {
            validate_flows(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flows(output)?;
        }
    }

    Ok(())
}

fn read_flows(file: &PathBuf) -> Result<FlowConfig> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    FlowConfig::parse(&text).with_context(|| format!("parsing {}", file.display()))
}

async fn run_flows(file: PathBuf, settings: Option<PathBuf>) -> Result<()> {
    println!("🚀 Loading flows from: {}", file.display());
    let config = read_flows(&file)?;
    println!("   Flows: {}", config.tabs().count());
    println!("   Nodes: {}", config.nodes.len());
    println!();

    let settings = match settings {
        Some(path) => Settings::load(&path).await?,
        None => Settings::default(),
    };
    let runtime = FlowRuntime::with_registry(Arc::new(registry()), settings.runtime_config());

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RuntimeEvent::FlowsStarted { flow_ids, .. } => {
                    println!("▶️  Flows started: {}", flow_ids.join(", "));
                }
                RuntimeEvent::FlowsStopped { .. } => {
                    println!("⏹️  Flows stopped");
                }
                RuntimeEvent::NodeStatus { node_id, status, .. } => {
                    println!("  🔵 [{}] {}", node_id, status.text.unwrap_or_default());
                }
                RuntimeEvent::NodeError {
                    node_id,
                    message,
                    handled,
                    ..
                } => {
                    let note = if handled { " (caught)" } else { "" };
                    println!("  ❌ [{}] {}{}", node_id, message, note);
                }
                RuntimeEvent::NodeLog { record, .. } if record.node_type == "debug" => {
                    println!("  🐛 [{}] {}", record.name.as_deref().unwrap_or(&record.id), record.text());
                }
                _ => {}
            }
        }
    });

    runtime.load().await?;
    let summary = runtime.deploy(config).await?;
    for (id, reason) in &summary.failed {
        println!("  ⚠️  Node {} not started: {}", id, reason);
    }
    println!("✨ Running {} nodes. Press Ctrl-C to stop.", summary.added.len().saturating_sub(summary.failed.len()));

    tokio::signal::ctrl_c().await?;
    println!();
    tracing::info!("Shutting down");
    runtime.close().await?;

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();
    Ok(())
}

fn validate_flows(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flows: {}", file.display());

    let config = read_flows(&file)?;
    let registry = registry();

    println!("✅ Flow file is valid:");
    println!("   Flows: {}", config.tabs().count());
    println!("   Subflows: {}", config.flows.iter().filter(|f| f.is_subflow()).count());
    println!("   Nodes: {}", config.nodes.len());

    for (source, target) in config.dangling_wires() {
        println!("   ⚠️  {} is wired to unknown node {}", source, target);
    }
    for node in &config.nodes {
        if node.z.is_some() && !registry.contains(&node.node_type) {
            println!("   ⚠️  {} has unknown type {}", node.id, node.node_type);
        }
    }

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_flows(output: PathBuf) -> Result<()> {
    let config = FlowConfig::new()
        .with_flow(FlowSpec::tab("main"))
        .with_node(
            NodeSpec::new("tick", "inject")
                .in_flow("main")
                .with_name("Every 5 seconds")
                .with_property("payload", r#"{"temperature": 21.5}"#)
                .with_property("payloadType", "str")
                .with_property("repeat", "5")
                .with_property("once", true)
                .with_wires([["parse"]]),
        )
        .with_node(
            NodeSpec::new("parse", "json")
                .in_flow("main")
                .with_name("Parse reading")
                .with_wires([["show"]]),
        )
        .with_node(
            NodeSpec::new("show", "debug")
                .in_flow("main")
                .with_name("Show reading")
                .with_property("complete", "payload.temperature")
                .with_property("tostatus", true),
        )
        .with_node(
            NodeSpec::new("errors", "catch")
                .in_flow("main")
                .with_name("Catch errors")
                .with_wires([["show-errors"]]),
        )
        .with_node(
            NodeSpec::new("show-errors", "debug")
                .in_flow("main")
                .with_name("Show errors")
                .with_property("complete", "error"),
        );

    let json = serde_json::to_string_pretty(&config.to_value()?)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flows: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --flows {}", output.display());

    Ok(())
}
