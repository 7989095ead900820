//! treemerge command-line tool.
//!
//! Provides subcommands for three-way merging JSON trees, checking trees for
//! unresolved conflict markers, committing trees into the configured node
//! store, and generating / validating configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use treemerge_core::commit::ConflictValidator;
use treemerge_core::conflict::{merge_trees, ConflictReport, Outcome};
use treemerge_core::config::MergeConfig;
use treemerge_core::errors::CommitError;
use treemerge_core::store::HeadRef;
use treemerge_core::{MergeEngine, NodeStore, SnapshotTree, TreeModel};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// treemerge command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "treemerge",
    version,
    about = "Three-way merge and conflict checking for hierarchical content trees"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults to
    /// `<config dir>/treemerge/config.toml` when that file exists.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Merge two trees derived from a common base.
    Merge {
        /// Common ancestor tree (JSON).
        #[arg(long)]
        base: PathBuf,

        /// Local side (JSON).
        #[arg(long)]
        ours: PathBuf,

        /// Committed side (JSON).
        #[arg(long)]
        theirs: PathBuf,

        /// Write the merged tree here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a tree for unresolved conflicts.
    Check {
        /// Tree to check (JSON).
        tree: PathBuf,
    },

    /// Merge a tree into the head of the configured store.
    Commit {
        /// Tree to commit (JSON); replaces the head content it differs from.
        tree: PathBuf,
    },

    /// Print the head of the configured store.
    Show,

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./treemerge.toml")]
        output: PathBuf,
    },

    /// Validate the configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let loaded = load_config(config_path.as_deref());
    let level = match (&cli.log_level, &loaded) {
        (Some(level), _) => level.clone(),
        (None, Ok(config)) => config.logging.level.clone(),
        (None, Err(_)) => "warn".to_string(),
    };
    init_logging(&level);

    let config = match loaded {
        Ok(config) => config,
        // `init` and `validate` report on a broken config themselves.
        Err(_) if matches!(cli.command, Commands::Init { .. } | Commands::Validate) => {
            MergeConfig::default()
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli, config, config_path) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: Cli, config: MergeConfig, config_path: Option<PathBuf>) -> Result<ExitCode> {
    match cli.command {
        Commands::Merge {
            base,
            ours,
            theirs,
            output,
        } => cmd_merge(&config, &base, &ours, &theirs, output.as_deref()),
        Commands::Check { tree } => cmd_check(&tree),
        Commands::Commit { tree } => cmd_commit(&config, &tree),
        Commands::Show => cmd_show(&config),
        Commands::Init { output } => cmd_init(&output).map(|()| ExitCode::SUCCESS),
        Commands::Validate => cmd_validate(config_path.as_deref()).map(|()| ExitCode::SUCCESS),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    dirs::config_dir()
        .map(|dir| dir.join("treemerge").join("config.toml"))
        .filter(|path| path.exists())
}

fn load_config(path: Option<&Path>) -> Result<MergeConfig> {
    let Some(path) = path else {
        return Ok(MergeConfig::default());
    };
    MergeConfig::load_and_validate(path).context("failed to load configuration file")
}

fn read_tree(path: &Path) -> Result<SnapshotTree> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let model: TreeModel = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid tree", path.display()))?;
    model
        .to_snapshot()
        .with_context(|| format!("{} contains an invalid name", path.display()))
}

fn tree_json(tree: &SnapshotTree) -> Result<String> {
    let model = TreeModel::from_snapshot(tree).context("failed to read tree")?;
    serde_json::to_string_pretty(&model).context("failed to encode tree")
}

fn open_store(config: &MergeConfig) -> Result<Arc<NodeStore>> {
    debug!(backend = ?config.store.backend, "opening store");
    let substrate = config
        .store
        .open_substrate()
        .context("failed to open substrate")?;
    let store = NodeStore::open(substrate, &config.store).context("failed to open node store")?;
    Ok(Arc::new(store))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_merge(
    config: &MergeConfig,
    base: &Path,
    ours: &Path,
    theirs: &Path,
    output: Option<&Path>,
) -> Result<ExitCode> {
    let base = read_tree(base)?;
    let ours = read_tree(ours)?;
    let theirs = read_tree(theirs)?;
    let policies = config.policy_chain().context("invalid resolution rules")?;
    debug!(policies = ?policies.names(), "merging trees");

    let result = merge_trees(&base, &ours, &theirs, &policies).context("merge failed")?;
    print_conflicts(&result.conflicts);

    let json = tree_json(&result.tree)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).context("failed to write merged tree")?;
            eprintln!("Merged tree written to {}", path.display());
        }
        None => println!("{}", json),
    }

    gate(&result.tree)
}

fn cmd_check(tree: &Path) -> Result<ExitCode> {
    let tree = read_tree(tree)?;
    gate(&tree)
}

fn cmd_commit(config: &MergeConfig, tree: &Path) -> Result<ExitCode> {
    let target = read_tree(tree)?;
    let store = open_store(config)?;
    let engine = MergeEngine::from_config(store.clone(), config).context("invalid resolution rules")?;

    let head = store.head().context("failed to read head")?;
    let mut builder = head.root.builder();
    builder.apply_tree(&target).context("failed to stage tree")?;
    if !builder.is_modified() {
        println!("Nothing to commit; head is {}", head.revision);
        return Ok(ExitCode::SUCCESS);
    }

    match engine.merge(&builder) {
        Ok(outcome) => {
            print_conflicts(&outcome.conflicts);
            println!(
                "Committed {} after {} attempt(s)",
                outcome.head.revision, outcome.attempts
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(treemerge_core::errors::MergeError::Commit(CommitError::UnresolvedConflict { path })) => {
            eprintln!("Commit rejected: unresolved conflicts in {}", path);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("commit failed"),
    }
}

fn cmd_show(config: &MergeConfig) -> Result<ExitCode> {
    let store = open_store(config)?;
    let head = store.head().context("failed to read head")?;
    eprintln!(
        "Head {} committed at {}",
        head.revision,
        head.committed_at.to_rfc3339()
    );
    println!("{}", tree_json(&head.root)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# treemerge configuration
# See documentation for all available options.

[store]
page_limit = 100
max_merge_attempts = 5
backend = "memory"
# backend = "sqlite"
# database_path = "/var/lib/treemerge/store.db"

[logging]
level = "info"

[resolution]
text_merge = false

# Rules are tried in file order, before the text merge.
# [[resolution.rules]]
# name = "timestamps"
# pattern = "*:lastModified"
# conflict_types = ["changeChangedProperty"]
# decision = "theirs"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Choose a store backend and resolution rules");
    println!(
        "  2. Validate with: treemerge validate --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: Option<&Path>) -> Result<()> {
    let Some(config_path) = config_path else {
        anyhow::bail!("no configuration file given and none found in the config directory");
    };
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config =
        MergeConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All values are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let policies = config.policy_chain().context("invalid resolution rules")?;

    println!();
    println!("Configuration summary:");
    println!("  Backend        : {:?}", config.store.backend);
    if let Some(ref path) = config.store.database_path {
        println!("  Database       : {}", path.display());
    }
    println!("  Page limit     : {}", config.store.page_limit);
    println!("  Merge attempts : {}", config.store.max_merge_attempts);
    println!("  Log level      : {}", config.logging.level);
    println!(
        "  Policies       : {}",
        if policies.is_empty() {
            "none".to_string()
        } else {
            policies.names().join(", ")
        }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

/// Run the conflict gate; unresolved conflicts give a failing exit code.
fn gate(tree: &SnapshotTree) -> Result<ExitCode> {
    match ConflictValidator::check_tree(tree) {
        Ok(()) => {
            eprintln!("No unresolved conflicts.");
            Ok(ExitCode::SUCCESS)
        }
        Err(CommitError::UnresolvedConflict { path }) => {
            eprintln!("Unresolved conflicts in {}", path);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("conflict check failed"),
    }
}

fn print_conflicts(conflicts: &[ConflictReport]) {
    if conflicts.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Name", "Type", "Outcome"]);

    for c in conflicts {
        let outcome = match &c.outcome {
            Outcome::Unresolved => Cell::new("unresolved").fg(Color::Red),
            resolved => Cell::new(resolved.to_string()).fg(Color::Green),
        };
        table.add_row(vec![
            Cell::new(&c.path),
            Cell::new(&c.name),
            Cell::new(c.conflict_type.to_string()),
            outcome,
        ]);
    }

    eprintln!("{}", table);
}
