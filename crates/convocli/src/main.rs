// crates/convocli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use convocore::services::WorkflowLoader;
use convocore::{ChatMessage, ExecutionEvent, NodeEvent, NodeSpec, WorkflowDefinition};
use convonodes::OpenAiCompatibleCaller;
use convoruntime::{
    DirectoryWorkflowLoader, NodeRegistry, RuntimeConfig, WorkflowManager, WorkflowRequest,
    WorkflowResponse,
};
use futures::StreamExt;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Conversation workflow engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow against a conversation
    Run {
        /// Workflow name (file stem inside --workflows)
        workflow: String,

        /// Directory holding <name>.json workflow files
        #[arg(short, long, default_value = "workflows")]
        workflows: PathBuf,

        /// JSON map of endpoint name to backend settings
        #[arg(short, long, default_value = "endpoints.json")]
        endpoints: PathBuf,

        /// Runtime configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// User message; repeat for several turns
        #[arg(short, long)]
        message: Vec<String>,

        /// JSON file with a list of {"role", "content"} messages
        #[arg(long)]
        conversation: Option<PathBuf>,

        #[arg(long)]
        discussion_id: Option<String>,

        /// Stream the answer as it is generated
        #[arg(short, long)]
        stream: bool,

        /// Print execution events
        #[arg(long)]
        events: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create example workflows and an endpoints file
    Init {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            workflow,
            workflows,
            endpoints,
            config,
            message,
            conversation,
            discussion_id,
            stream,
            events,
        } => {
            let mut messages = match conversation {
                Some(path) => read_conversation(&path).await?,
                None => Vec::new(),
            };
            messages.extend(message.into_iter().map(ChatMessage::user));
            if messages.is_empty() {
                bail!("Nothing to say: pass --message or --conversation");
            }

            let mut request = WorkflowRequest::new(workflow, messages);
            if let Some(id) = discussion_id {
                request = request.with_discussion_id(id);
            }
            if stream {
                request = request.streaming();
            }

            run_workflow(request, workflows, endpoints, config, events).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file).await?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { dir } => {
            create_example_workflows(dir).await?;
        }
    }

    Ok(())
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    convonodes::register_all(&mut registry);
    registry
}

async fn read_conversation(path: &Path) -> Result<Vec<ChatMessage>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&json)?)
}

async fn run_workflow(
    request: WorkflowRequest,
    workflows: PathBuf,
    endpoints: PathBuf,
    config: Option<PathBuf>,
    show_events: bool,
) -> Result<()> {
    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .await
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let llm = OpenAiCompatibleCaller::from_file(&endpoints)
        .await
        .with_context(|| format!("loading endpoints {}", endpoints.display()))?;

    let manager = WorkflowManager::new(
        Arc::new(registry()),
        Arc::new(DirectoryWorkflowLoader::new(workflows)),
        Arc::new(llm),
        config,
    );
    let purged = manager.initialize().await?;
    info!("Engine ready ({} stale locks purged)", purged);

    if show_events {
        let mut events = manager.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                print_event(&event);
            }
        });
    }

    match manager.run(request).await? {
        WorkflowResponse::Text(text) => println!("{}", text),
        WorkflowResponse::Stream(response) => {
            let mut tokens = response.tokens;
            let mut stdout = std::io::stdout();
            loop {
                tokio::select! {
                    chunk = tokens.next() => match chunk {
                        Some(Ok(text)) => {
                            print!("{}", text);
                            stdout.flush()?;
                        }
                        Some(Err(e)) => {
                            println!();
                            return Err(e.into());
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        manager.cancel(&response.request_id).await;
                        eprintln!("\n⏹  Cancelled");
                        break;
                    }
                }
            }
            println!();
            drop(tokens);
            // Nodes after the responder finish before the process exits.
            response.completion.await?;
        }
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted {
            workflow, depth, ..
        } => {
            eprintln!("▶️  {}{}", "  ".repeat(*depth), workflow);
        }
        ExecutionEvent::NodeStarted {
            position,
            node_type,
            responder,
            ..
        } => {
            let marker = if *responder { " (responder)" } else { "" };
            eprintln!("  ⚡ Node {}: {}{}", position, node_type, marker);
        }
        ExecutionEvent::NodeCompleted {
            position,
            duration_ms,
            ..
        } => {
            eprintln!("  ✅ Node {} completed in {}ms", position, duration_ms);
        }
        ExecutionEvent::NodeFailed {
            position, error, ..
        } => {
            eprintln!("  ❌ Node {} failed: {}", position, error);
        }
        ExecutionEvent::NodeEvent {
            position, event, ..
        } => match event {
            NodeEvent::Info { message } => eprintln!("     ℹ️  [{}] {}", position, message),
            NodeEvent::Warning { message } => eprintln!("     ⚠️  [{}] {}", position, message),
        },
        ExecutionEvent::StreamDrained {
            position, chunks, ..
        } => {
            eprintln!("  🌊 Node {} streamed {} chunks", position, chunks);
        }
        ExecutionEvent::ResponderElected { node, .. } => {
            eprintln!("  🎯 Responder: {}", node);
        }
        ExecutionEvent::WorkflowCompleted {
            workflow,
            status,
            duration_ms,
            ..
        } => {
            eprintln!("✨ {} {:?} in {}ms", workflow, status, duration_ms);
        }
    }
}

async fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let name = file
        .file_stem()
        .and_then(|s| s.to_str())
        .context("workflow file needs a name")?
        .to_string();
    let json = tokio::fs::read_to_string(&file).await?;
    let workflow = WorkflowDefinition::from_json(name, &json)?;

    registry().validate(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Static variables: {}", workflow.static_variables.len());

    // Sibling workflows referenced by name can be checked when present.
    if let Some(dir) = file.parent() {
        let loader = DirectoryWorkflowLoader::new(dir);
        let known = loader.list().await.unwrap_or_default();
        for spec in &workflow.nodes {
            if let Some(child) = spec.config.get("workflowName").and_then(|v| v.as_str()) {
                if !child.contains('{') && !known.iter().any(|k| k == child) {
                    println!("   ⚠️  '{}' not found next to this file", child);
                }
            }
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
            for field in &metadata.fields {
                let required = if field.required { ", required" } else { "" };
                println!(
                    "      - {} [{:?}{}] {}",
                    field.name, field.class, required, field.description
                );
            }
        } else {
            println!("  • {}", node_type);
        }
    }
}

async fn create_example_workflows(dir: PathBuf) -> Result<()> {
    let workflows = dir.join("workflows");
    tokio::fs::create_dir_all(&workflows).await?;

    let chat = json!({
        "staticVariables": {"endpoint": "local"},
        "nodes": [
            NodeSpec::new("llm.generate")
                .with_title("Answer")
                .with_config("endpoint", "{endpoint}")
                .with_config("systemPrompt", "You are a helpful assistant. Today is {todays_date_pretty}.")
                .with_config("prompt", "")
                .returning_to_user(),
            NodeSpec::new("workflow.call")
                .with_title("Remember")
                .with_config("workflowName", "remember")
                .with_config("scoped_variables", json!(["{agent1Output}", "{endpoint}"])),
        ]
    });

    let remember = json!({
        "nodes": [
            NodeSpec::new("workflow.lock").with_config("workflowLockId", "memory-writer"),
            NodeSpec::new("llm.generate")
                .with_title("Summarize")
                .with_config("endpoint", "{agent2Input}")
                .with_config("prompt", "Summarize for later: {agent1Input}"),
        ]
    });

    let endpoints = json!({
        "local": {
            "base_url": "http://localhost:8080/v1",
            "model": "local-model",
            "max_tokens": 800
        }
    });

    let files = [
        (workflows.join("chat.json"), chat),
        (workflows.join("remember.json"), remember),
        (dir.join("endpoints.json"), endpoints),
    ];
    for (path, value) in &files {
        tokio::fs::write(path, serde_json::to_string_pretty(value)?).await?;
        println!("✨ Created {}", path.display());
    }

    println!();
    println!("Run it with:");
    println!(
        "  convo run chat --workflows {} --endpoints {} -m 'Hello!' --stream",
        workflows.display(),
        dir.join("endpoints.json").display()
    );

    Ok(())
}
