//! branchchat CLI - inspect and edit the conversation forest from a terminal
//!
//! Usage: branchchat-cli [OPTIONS] <COMMAND>
//!
//! Supports JSON output for scripting.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use branchchat_lib::ai_client::GeminiClient;
use branchchat_lib::db::{Database, Folder, Node, NodeView};
use branchchat_lib::mutation::{DeleteMode, MutationEngine, NodeMove};
use branchchat_lib::resolver::TreeResolver;
use branchchat_lib::session::{GenerationRequest, GenerationSession, SessionEvent};
use branchchat_lib::{settings, utils};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "branchchat-cli")]
#[command(version, about = "Branching conversation CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path (default: auto-detect)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Owner id to act as (default: from settings)
    #[arg(long, global = true)]
    owner: Option<String>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the path from the root to a node
    Ancestors {
        id: String,
    },
    /// Print a node and everything below it
    Descendants {
        id: String,
        /// Include the number of direct children per node
        #[arg(long)]
        children_count: bool,
    },
    /// List conversation roots, newest first
    Roots {
        /// Only roots filed in this folder
        #[arg(long)]
        folder: Option<String>,
        #[arg(long, default_value = "100")]
        limit: u32,
    },
    /// Delete a node
    Delete {
        id: String,
        #[arg(long, value_enum, default_value = "single")]
        mode: DeleteModeArg,
    },
    /// Reparent or refile a node
    Move {
        id: String,
        /// New parent node
        #[arg(long, conflicts_with = "root")]
        parent: Option<String>,
        /// Detach into an independent conversation
        #[arg(long)]
        root: bool,
        /// New folder
        #[arg(long, conflicts_with = "unfile")]
        folder: Option<String>,
        /// Remove from its folder
        #[arg(long)]
        unfile: bool,
    },
    /// List folders
    Folders,
    /// Create a folder
    Mkdir {
        name: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Ask the model and store the turn
    Ask {
        prompt: String,
        /// Continue from this node
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        folder: Option<String>,
        /// Model name (default: from settings)
        #[arg(long)]
        model: Option<String>,
    },
    /// Settings
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Store the Gemini API key
    SetKey { key: String },
    /// Set the default generation model
    SetModel { model: String },
    /// Show current settings
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeleteModeArg {
    Single,
    Subtree,
}

impl From<DeleteModeArg> for DeleteMode {
    fn from(arg: DeleteModeArg) -> Self {
        match arg {
            DeleteModeArg::Single => DeleteMode::Single,
            DeleteModeArg::Subtree => DeleteMode::Subtree,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<(), String> {
    settings::init(settings::app_data_dir());

    // Commands that need no database
    match &cli.command {
        Commands::Completions { shell } => {
            generate(*shell, &mut Cli::command(), "branchchat-cli", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Config { cmd } => return handle_config(cmd, cli.json),
        _ => {}
    }

    let db_path = settings::find_database(cli.db.as_deref());
    tracing::debug!(path = %db_path.display(), "using database");
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let db = Arc::new(Database::new(&db_path).map_err(|e| format!("Failed to open database: {}", e))?);

    let owner = cli.owner.clone().unwrap_or_else(settings::get_default_owner);
    let resolver = Arc::new(TreeResolver::new(db.clone()));
    let json = cli.json;

    match cli.command {
        Commands::Ancestors { id } => {
            let chain = resolver.ancestors_of(&owner, &id).map_err(|e| e.to_string())?;
            print_nodes(&chain, json)
        }
        Commands::Descendants { id, children_count } => {
            let tree = resolver
                .descendants_of(&owner, &id, children_count)
                .map_err(|e| e.to_string())?;
            print_tree(&tree, &id, json)
        }
        Commands::Roots { folder, limit } => {
            let roots = db
                .list_nodes(&owner, folder.as_deref(), true, limit)
                .map_err(|e| e.to_string())?;
            print_nodes(&roots, json)
        }
        Commands::Delete { id, mode } => {
            let engine = MutationEngine::new(resolver);
            let outcome = engine.delete_node(&owner, &id, mode.into()).map_err(|e| e.to_string())?;
            if json {
                print_json(&outcome)
            } else {
                println!("Deleted {} node(s), reparented {}", outcome.deleted.len(), outcome.reparented.len());
                Ok(())
            }
        }
        Commands::Move { id, parent, root, folder, unfile } => {
            let change = NodeMove {
                parent_id: if root { Some(None) } else { parent.map(Some) },
                folder_id: if unfile { Some(None) } else { folder.map(Some) },
            };
            if change.parent_id.is_none() && change.folder_id.is_none() {
                return Err("Nothing to do: pass --parent, --root, --folder or --unfile".into());
            }
            let engine = MutationEngine::new(resolver);
            let node = engine.move_node(&owner, &id, change).map_err(|e| e.to_string())?;
            print_nodes(std::slice::from_ref(&node), json)
        }
        Commands::Folders => {
            let folders = db.list_folders(&owner).map_err(|e| e.to_string())?;
            print_folders(&folders, json)
        }
        Commands::Mkdir { name, parent } => {
            let engine = MutationEngine::new(resolver);
            let folder = engine
                .create_folder(&owner, &name, parent.as_deref())
                .map_err(|e| e.to_string())?;
            print_folders(std::slice::from_ref(&folder), json)
        }
        Commands::Ask { prompt, parent, folder, model } => {
            handle_ask(resolver, &owner, prompt, parent, folder, model, json).await
        }
        Commands::Completions { .. } | Commands::Config { .. } => Ok(()),
    }
}

fn handle_config(cmd: &ConfigCommands, json: bool) -> Result<(), String> {
    match cmd {
        ConfigCommands::SetKey { key } => {
            settings::set_api_key(key.clone())?;
            println!("API key saved");
            Ok(())
        }
        ConfigCommands::SetModel { model } => {
            settings::set_default_model(model.clone())?;
            println!("Default model set to {}", model);
            Ok(())
        }
        ConfigCommands::Show => {
            let current = settings::snapshot();
            let key = settings::get_masked_api_key().unwrap_or_else(|| "(not set)".to_string());
            let db_path = settings::find_database(None);
            if json {
                return print_json(&serde_json::json!({
                    "apiKey": key,
                    "defaultModel": settings::get_default_model(),
                    "summaryModel": settings::get_summary_model(),
                    "bindAddr": settings::get_bind_addr(),
                    "defaultOwner": current.default_owner,
                    "database": db_path.display().to_string(),
                }));
            }
            println!("API key:        {}", key);
            println!("Default model:  {}", settings::get_default_model());
            println!("Summary model:  {}", settings::get_summary_model());
            println!("Bind address:   {}", settings::get_bind_addr());
            println!("Default owner:  {}", current.default_owner);
            println!("Database:       {}", db_path.display());
            Ok(())
        }
    }
}

async fn handle_ask(
    resolver: Arc<TreeResolver>,
    owner: &str,
    prompt: String,
    parent: Option<String>,
    folder: Option<String>,
    model: Option<String>,
    json: bool,
) -> Result<(), String> {
    let client = Arc::new(GeminiClient::from_settings());
    let session = GenerationSession::new(resolver, client, settings::get_default_model());

    let mut metadata = serde_json::Map::new();
    if let Some(model) = model {
        metadata.insert("model".into(), serde_json::Value::String(model));
    }
    let request = GenerationRequest {
        user_prompt: prompt,
        parent_id: parent,
        folder_id: folder,
        model_metadata: serde_json::Value::Object(metadata),
        ..Default::default()
    };

    if json {
        let outcome = session.run_to_completion(owner, request).await.map_err(|e| e.to_string())?;
        print_json(&outcome.node)?;
        return match outcome.error {
            Some(reason) => Err(reason),
            None => Ok(()),
        };
    }

    let mut handle = session.start(owner, request).map_err(|e| e.to_string())?;
    let mut stdout = std::io::stdout();
    let mut failure = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            SessionEvent::Created { node_id, skipped_references } => {
                eprintln!("[{}]", utils::safe_truncate(&node_id, 8));
                for skipped in skipped_references {
                    eprintln!("Skipped missing {} reference {}", skipped.ref_type.as_str(), skipped.id);
                }
            }
            SessionEvent::Fragment(text) => {
                print!("{}", text);
                stdout.flush().ok();
            }
            SessionEvent::Done(node) => {
                println!();
                if let Some(summary) = node.summary {
                    eprintln!("Summary: {}", summary);
                }
            }
            SessionEvent::Error { reason } => {
                println!();
                failure = Some(reason);
            }
        }
    }

    handle.task.await.map_err(|e| e.to_string())?;
    match failure {
        Some(reason) => Err(reason),
        None => Ok(()),
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn node_line(node: &Node) -> String {
    let label = node
        .summary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|s| format!("  ({})", utils::preview(s, 40)))
        .unwrap_or_default();
    format!(
        "{}  {}{}",
        utils::safe_truncate(&node.id, 8),
        utils::preview(&node.user_prompt, 60),
        label
    )
}

fn print_nodes(nodes: &[Node], json: bool) -> Result<(), String> {
    if json {
        return print_json(&nodes);
    }
    if nodes.is_empty() {
        println!("(none)");
    }
    for node in nodes {
        println!("{}", node_line(node));
    }
    Ok(())
}

/// Indented tree view, children under their parents.
fn print_tree(views: &[NodeView], root_id: &str, json: bool) -> Result<(), String> {
    if json {
        return print_json(&views);
    }
    for line in tree_lines(views, root_id) {
        println!("{}", line);
    }
    Ok(())
}

/// Depth-first lines under `root_id`. Each node is printed at most once, so
/// a corrupted parent cycle cannot recurse forever.
fn tree_lines(views: &[NodeView], root_id: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut printed = HashSet::new();
    let mut stack: Vec<(&NodeView, usize)> = views
        .iter()
        .filter(|v| v.node.id == root_id)
        .take(1)
        .map(|v| (v, 0))
        .collect();

    while let Some((view, depth)) = stack.pop() {
        if !printed.insert(view.node.id.as_str()) {
            continue;
        }
        let count = view
            .children_count
            .map(|c| format!(" [{}]", c))
            .unwrap_or_default();
        lines.push(format!("{}{}{}", "  ".repeat(depth), node_line(&view.node), count));

        // Reverse so the earliest child is popped first
        let children: Vec<&NodeView> = views
            .iter()
            .filter(|v| v.node.parent_id.as_deref() == Some(view.node.id.as_str()))
            .collect();
        for child in children.into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    lines
}

fn print_folders(folders: &[Folder], json: bool) -> Result<(), String> {
    if json {
        return print_json(&folders);
    }
    if folders.is_empty() {
        println!("(none)");
    }
    for folder in folders {
        let parent = folder
            .parent_id
            .as_deref()
            .map(|p| format!("  in {}", utils::safe_truncate(p, 8)))
            .unwrap_or_default();
        println!("{}  {}{}", utils::safe_truncate(&folder.id, 8), folder.name, parent);
    }
    Ok(())
}
