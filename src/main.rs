// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Swarmer main entry point - operator CLI and agent bootstrap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Map, Value};

use swarmer::agent::{AgentContext, AgentRuntime, WorkerRegistry};
use swarmer::bus::{Envelope, FsDelivery};
use swarmer::config::{self, CliOptions, ResolvedConfig};
use swarmer::heartbeat::{HeartbeatMonitor, Liveness};
use swarmer::orchestrator::{
    parse_injected, OrchestratorClient, TreeOps, DELETE_AGENT, INJECT, METRICS_REPORT,
    RELEASE_LOCK, RESUME_SUBTREE, SHUTDOWN_SUBTREE, UPDATE_AGENT,
};
use swarmer::reaper::{Reaper, ReaperMission};
use swarmer::spawn::{register_self, BootBundle};
use swarmer::telemetry::{init_telemetry, ProcessRole, TelemetryConfig};
use swarmer::tree::{AgentNode, SupervisionTree};

/// Swarmer version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Swarmer - supervise a self-healing tree of agent processes.
#[derive(Parser)]
#[command(name = "swarmer")]
#[command(author, version, about = "Supervise a self-healing tree of agent processes", long_about = None)]
struct Cli {
    /// Root of the per-agent comm channels
    #[arg(long, env = "SWARMER_COMM_ROOT", global = true)]
    comm_root: Option<PathBuf>,

    /// Root of the runtime instance pods
    #[arg(long, env = "SWARMER_POD_ROOT", global = true)]
    pod_root: Option<PathBuf>,

    /// Universe id injected into every agent
    #[arg(long, env = "SWARMER_UNIVERSE", global = true)]
    universe: Option<String>,

    /// Id of the tree root
    #[arg(long, global = true)]
    orchestrator_id: Option<String>,

    /// Reject a whole snapshot when any node is malformed
    #[arg(long, global = true)]
    strict_tree_load: bool,

    /// Show info-level logs
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn cli_options(&self) -> CliOptions {
        CliOptions {
            comm_root: self.comm_root.clone(),
            pod_root: self.pod_root.clone(),
            universe: self.universe.clone(),
            orchestrator_id: self.orchestrator_id.clone(),
            strict_tree_load: self.strict_tree_load.then_some(true),
        }
    }

    fn telemetry(&self) -> TelemetryConfig {
        let role = match &self.command {
            Commands::Agent => ProcessRole::Agent,
            Commands::Boot { .. } => ProcessRole::Orchestrator,
            _ => ProcessRole::Operator,
        };
        TelemetryConfig::for_role(role).with_verbosity(self.verbose, self.debug)
    }
}

/// Subcommands for swarmer.
#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Load a tree directive and run its root as the orchestrator
    Boot {
        /// Tree directive (JSON or YAML)
        directive: PathBuf,
        /// Keep an existing snapshot instead of replacing it with the directive
        #[arg(long)]
        keep_snapshot: bool,
    },

    /// Run as a spawned agent (reads the boot bundle from the environment)
    #[command(hide = true)]
    Agent,

    /// Insert a subtree into the running tree
    Inject {
        /// Subtree to insert (JSON or YAML)
        file: PathBuf,
        /// Parent id (defaults to the root)
        #[arg(long)]
        parent: Option<String>,
        #[command(flatten)]
        mode: DeliveryMode,
    },

    /// Stop an agent and its descendants, keeping them in the tree
    Kill {
        id: String,
        #[command(flatten)]
        mode: DeliveryMode,
    },

    /// Stop an agent and its descendants and remove them from the tree
    Delete {
        id: String,
        #[command(flatten)]
        mode: DeliveryMode,
    },

    /// Let a killed subtree be spawned again
    Resume {
        id: String,
        #[command(flatten)]
        mode: DeliveryMode,
    },

    /// Release termination locks left behind by a supervisor that died mid-operation
    Unlock {
        id: String,
        #[command(flatten)]
        mode: DeliveryMode,
    },

    /// Replace an agent's configuration
    Update {
        id: String,
        /// New configuration as a JSON object
        config: String,
        #[command(flatten)]
        mode: DeliveryMode,
    },

    /// Send a raw command to an agent's command inbox
    Send {
        /// Command type
        kind: String,
        /// Command content as JSON
        #[arg(long, default_value = "{}")]
        content: String,
        /// Target agent (defaults to the orchestrator)
        #[arg(long)]
        to: Option<String>,
        /// Wait for the command result
        #[arg(long)]
        wait: bool,
        /// Seconds to wait for the command result
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Inspect the supervision tree
    Tree {
        #[command(subcommand)]
        action: Option<TreeAction>,
    },

    /// Show liveness of every agent in the tree
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Include the orchestrator's metrics report
        #[arg(long)]
        metrics: bool,
    },

    /// Stop runtime instances directly, outside the tree
    Reap {
        /// Logical ids to reap
        #[arg(required = true)]
        ids: Vec<String>,
        /// Include every descendant of each id
        #[arg(long)]
        cascade: bool,
        /// Write do-not-resurrect markers
        #[arg(long)]
        tombstone: bool,
        /// Remove die markers once the instances are gone
        #[arg(long)]
        cleanup_die: bool,
        /// Seconds to wait for a graceful exit
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

/// Tree subcommand actions.
#[derive(Subcommand)]
enum TreeAction {
    /// Print the current snapshot
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// How a tree mutation reaches the snapshot.
#[derive(Args)]
struct DeliveryMode {
    /// Wait for the orchestrator's command result
    #[arg(long)]
    wait: bool,
    /// Seconds to wait for the command result
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// Apply to the snapshot from this process instead of messaging the orchestrator
    #[arg(long, conflicts_with = "wait")]
    direct: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let code = {
        let _telemetry = init_telemetry(&cli.telemetry())?;
        handle_command(cli).await?
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn workspace_root() -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    Ok(config::find_workspace_root(&cwd).unwrap_or(cwd))
}

fn load_settings(options: CliOptions) -> anyhow::Result<ResolvedConfig> {
    Ok(config::load_config(&workspace_root()?, options)?)
}

/// Run the command and return the process exit status.
async fn handle_command(cli: Cli) -> anyhow::Result<i32> {
    let options = cli.cli_options();
    match cli.command {
        Commands::Init => {
            let path = config::init_config(&workspace_root()?, None)?;
            println!("Created config file: {}", path.display());
        }
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let settings = load_settings(options)?;
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
        },
        Commands::Boot {
            directive,
            keep_snapshot,
        } => return boot(options, &directive, keep_snapshot).await,
        Commands::Agent => return run_agent().await,
        Commands::Inject { file, parent, mode } => {
            let settings = load_settings(options)?;
            let node = read_document(&file)?;
            if mode.direct {
                let (node, report) = parse_injected(&node, settings.load_policy())?;
                for pruned in &report.pruned {
                    eprintln!("{} pruned {}", "!".yellow(), pruned);
                }
                let inserted = direct_ops(&settings).inject(parent.as_deref(), node)?;
                println!("{} inserted {}", "✓".green(), inserted.join(", "));
            } else {
                let content = json!({ "parent_id": parent, "node": node });
                return dispatch(&settings, Envelope::new(INJECT, content), &mode).await;
            }
        }
        Commands::Kill { id, mode } => {
            let settings = load_settings(options)?;
            if mode.direct {
                let report = direct_ops(&settings).kill(&id).await?;
                println!("{} killed {}", "✓".green(), report.targets.join(", "));
            } else {
                let envelope = Envelope::new(SHUTDOWN_SUBTREE, json!({ "id": id }));
                return dispatch(&settings, envelope, &mode).await;
            }
        }
        Commands::Delete { id, mode } => {
            let settings = load_settings(options)?;
            if mode.direct {
                let report = direct_ops(&settings).delete(&id).await?;
                println!("{} deleted {}", "✓".green(), report.targets.join(", "));
            } else {
                let envelope = Envelope::new(DELETE_AGENT, json!({ "id": id }));
                return dispatch(&settings, envelope, &mode).await;
            }
        }
        Commands::Resume { id, mode } => {
            let settings = load_settings(options)?;
            if mode.direct {
                let revived = direct_ops(&settings).resume(&id)?;
                println!("{} resumed {}", "✓".green(), revived.join(", "));
            } else {
                let envelope = Envelope::new(RESUME_SUBTREE, json!({ "id": id }));
                return dispatch(&settings, envelope, &mode).await;
            }
        }
        Commands::Unlock { id, mode } => {
            let settings = load_settings(options)?;
            if mode.direct {
                let released = direct_ops(&settings).unlock(&id)?;
                if released.is_empty() {
                    println!("{} nothing locked under {}", "✓".green(), id);
                } else {
                    println!("{} unlocked {}", "✓".green(), released.join(", "));
                }
            } else {
                let envelope = Envelope::new(RELEASE_LOCK, json!({ "id": id }));
                return dispatch(&settings, envelope, &mode).await;
            }
        }
        Commands::Update { id, config, mode } => {
            let settings = load_settings(options)?;
            let config: Map<String, Value> =
                serde_json::from_str(&config).context("config must be a JSON object")?;
            if mode.direct {
                direct_ops(&settings).update_config(&id, config).await?;
                println!("{} updated {}", "✓".green(), id);
            } else {
                let envelope = Envelope::new(UPDATE_AGENT, json!({ "id": id, "config": config }));
                return dispatch(&settings, envelope, &mode).await;
            }
        }
        Commands::Send {
            kind,
            content,
            to,
            wait,
            timeout,
        } => {
            let settings = load_settings(options)?;
            let content: Value = serde_json::from_str(&content).context("content must be JSON")?;
            let mut client = OrchestratorClient::new(settings.layout());
            if let Some(target) = to {
                client = client.with_target(target);
            }
            let mode = DeliveryMode {
                wait,
                timeout,
                direct: false,
            };
            return send(&client, Envelope::new(kind, content), &mode).await;
        }
        Commands::Tree { action } => match action {
            Some(TreeAction::Show { json }) => show_tree(&load_settings(options)?, json)?,
            None => show_tree(&load_settings(options)?, false)?,
        },
        Commands::Status { json, metrics } => {
            status(&load_settings(options)?, json, metrics)?;
        }
        Commands::Reap {
            ids,
            cascade,
            tombstone,
            cleanup_die,
            timeout,
        } => {
            let settings = load_settings(options)?;
            let mission = if cascade {
                let tree = load_snapshot(&settings)?;
                ReaperMission::for_cascade("operator", &tree, &ids)?
            } else {
                ReaperMission::new("operator", ids)
            };
            let mut mission = mission
                .with_settings(&settings)
                .with_tombstones(tombstone, tombstone)
                .with_cleanup_die(cleanup_die);
            if let Some(secs) = timeout {
                mission = mission.with_timeout(Duration::from_secs(secs));
            }

            let report = Reaper::local(settings.layout()).run(&mission).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_complete() {
                eprintln!("{}", "Some instances survived SIGKILL".red());
                return Ok(1);
            }
        }
        Commands::Version => {
            println!("swarmer {}", VERSION);
        }
    }
    Ok(0)
}

/// Persist the directive as the snapshot and run its root in the foreground.
async fn boot(mut options: CliOptions, directive: &Path, keep_snapshot: bool) -> anyhow::Result<i32> {
    let policy = load_settings(options.clone())?.load_policy();
    let (tree, report) = SupervisionTree::load_file(directive, policy)
        .with_context(|| format!("failed to load directive {}", directive.display()))?;
    for id in &report.rejected_duplicates {
        eprintln!("{} duplicate id {} rejected", "!".yellow(), id);
    }
    for pruned in &report.pruned {
        eprintln!("{} pruned {}", "!".yellow(), pruned);
    }

    let root_id = tree.root_id().to_string();
    if let Some(configured) = &options.orchestrator_id {
        if configured != &root_id {
            bail!("directive root {} does not match --orchestrator-id {}", root_id, configured);
        }
    }
    options.orchestrator_id = Some(root_id.clone());
    let settings = load_settings(options)?;
    let layout = settings.layout();

    let root = tree
        .get(&root_id)
        .cloned()
        .context("directive has no root record")?;
    if root.agent_type != "orchestrator" {
        eprintln!(
            "{} root {} has type {}; tree commands are only served by an orchestrator",
            "!".yellow(),
            root_id,
            root.agent_type
        );
    }

    let ops = direct_ops(&settings);
    if keep_snapshot && layout.snapshot_path().is_file() {
        println!("Keeping snapshot {}", layout.snapshot_path().display());
    } else {
        ops.install(&tree)?;
        println!("Installed snapshot {} ({} agents)", layout.snapshot_path().display(), tree.len());
    }
    // A die marker left by an earlier kill of the root would stop this instance at once.
    layout.clear_die_marker(&root_id)?;

    let record = register_self(&layout, &root_id, &root.agent_type)?;
    let bundle = BootBundle {
        id: root_id,
        instance_id: record.instance_id,
        agent_type: root.agent_type,
        parent_id: None,
        universe: settings.universe.clone(),
        config: root.config,
        settings,
    };
    println!("{} {} booting as {}", "→".cyan(), bundle.id.bright_white(), bundle.instance_id);

    let runtime = AgentRuntime::new(AgentContext::new(bundle), WorkerRegistry::builtin())?;
    let reason = runtime.run().await?;
    println!("Stopped: {}", reason);
    Ok(reason.exit_code())
}

async fn run_agent() -> anyhow::Result<i32> {
    let bundle = BootBundle::from_env()?;
    let runtime = AgentRuntime::new(AgentContext::new(bundle), WorkerRegistry::builtin())?;
    let reason = runtime.run().await?;
    Ok(reason.exit_code())
}

fn direct_ops(settings: &ResolvedConfig) -> TreeOps {
    let layout = settings.layout();
    TreeOps::new(
        Arc::new(settings.clone()),
        Reaper::local(layout.clone()),
        Arc::new(FsDelivery::new(layout)),
    )
}

async fn dispatch(settings: &ResolvedConfig, envelope: Envelope, mode: &DeliveryMode) -> anyhow::Result<i32> {
    send(&OrchestratorClient::new(settings.layout()), envelope, mode).await
}

async fn send(client: &OrchestratorClient, envelope: Envelope, mode: &DeliveryMode) -> anyhow::Result<i32> {
    if !mode.wait {
        client.send(&envelope).await?;
        println!("{} {} queued for {}", "→".cyan(), envelope.kind, client.target());
        return Ok(0);
    }

    let result = client
        .request(envelope, Duration::from_secs(mode.timeout))
        .await?;
    if result.success {
        println!("{} {}", "✓".green(), result.command);
        if !result.result.is_null() {
            println!("{}", serde_json::to_string_pretty(&result.result)?);
        }
        Ok(0)
    } else {
        eprintln!(
            "{} {}: {}",
            "✗".red(),
            result.command,
            result.error.as_deref().unwrap_or("failed")
        );
        Ok(1)
    }
}

fn read_document(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&text)?
    } else {
        serde_json::from_str(&text)?
    };
    Ok(value)
}

fn load_snapshot(settings: &ResolvedConfig) -> anyhow::Result<SupervisionTree> {
    let path = settings.layout().snapshot_path();
    let (tree, _) = SupervisionTree::load_file(&path, settings.load_policy())
        .with_context(|| format!("no readable snapshot at {}", path.display()))?;
    Ok(tree)
}

fn show_tree(settings: &ResolvedConfig, as_json: bool) -> anyhow::Result<()> {
    let root = load_snapshot(settings)?.to_node();
    if as_json {
        println!("{}", serde_json::to_string_pretty(&root)?);
    } else {
        print_node(&root, 0);
    }
    Ok(())
}

fn print_node(node: &AgentNode, depth: usize) {
    let mut flags = Vec::new();
    if node.killed {
        flags.push("killed".red().to_string());
    }
    if node.operation_in_progress {
        flags.push("locked".yellow().to_string());
    }
    println!(
        "{}{} [{}]{}",
        "  ".repeat(depth),
        node.id.bright_white(),
        node.agent_type,
        if flags.is_empty() {
            String::new()
        } else {
            format!(" {}", flags.join(" "))
        }
    );
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

fn status(settings: &ResolvedConfig, as_json: bool, with_metrics: bool) -> anyhow::Result<()> {
    let layout = settings.layout();
    let tree = load_snapshot(settings)?;
    let monitor = HeartbeatMonitor::new(layout.clone());
    let table = monitor.liveness_table(tree.all_ids(), Utc::now());
    let phantoms = monitor.phantoms();
    let metrics_path = layout
        .logs_dir(layout.orchestrator_id())
        .join(METRICS_REPORT);
    let metrics = if with_metrics {
        std::fs::read_to_string(&metrics_path).ok()
    } else {
        None
    };

    if as_json {
        let rows: Vec<Value> = table
            .iter()
            .map(|row| {
                let record = tree.get(&row.id);
                json!({
                    "liveness": row,
                    "type": record.map(|r| r.agent_type.as_str()),
                    "killed": record.map(|r| r.killed),
                    "operation_in_progress": record.map(|r| r.operation_in_progress),
                })
            })
            .collect();
        let out = json!({ "agents": rows, "phantoms": phantoms, "metrics": metrics });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{}", format!("Universe {}", settings.universe).bright_blue().bold());
    for row in &table {
        let record = tree.get(&row.id);
        let state = match row.liveness {
            Some(Liveness::Alive) => "alive".green(),
            Some(Liveness::Stale) => "stale".yellow(),
            Some(Liveness::Expired) => "expired".red(),
            Some(Liveness::Dead) => "dead".dimmed(),
            None => "never seen".dimmed(),
        };
        let age = row
            .age
            .map(|a| format!("{}s", a.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        let killed = if record.map(|r| r.killed).unwrap_or(false) {
            " killed".red().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<24} {:<18} {:<12} {:>6}{}",
            row.id,
            record.map(|r| r.agent_type.as_str()).unwrap_or("?"),
            state,
            age,
            killed
        );
    }

    if !phantoms.is_empty() {
        println!("\n{}", "Phantom channels (no runtime instance on record):".yellow());
        for id in &phantoms {
            println!("  {}", id);
        }
    }

    if with_metrics {
        match metrics {
            Some(report) => println!("\n{}", report),
            None => println!(
                "\n{}",
                format!("No metrics published at {}", metrics_path.display()).dimmed()
            ),
        }
    }

    Ok(())
}
