//! modgate - command-line front end for the module promotion pipeline
//!
//! ## Commands
//!
//! - `run`: generate, inspect, sandbox-test and promote one module
//! - `inspect`: static inspection of a candidate directory or file
//! - `sandbox`: run one entry point of a candidate under resource limits
//! - `incident`: report a runtime failure and apply the repair policy
//! - `registry`, `snapshots`, `approvals`, `audit`: operator views and actions
//! - `config`: print the effective configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use modgate_core::pipeline::PipelineRequest;
use modgate_core::{
    init_tracing, level_for_verbosity, Incident, Inspector, InspectorConfig, ModgateConfig,
    ModuleStatus, PipelineManager, ProcessSandbox, SandboxInvocation, SandboxRunner,
    SourceGenerator, METRICS,
};

#[derive(Parser)]
#[command(name = "modgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect, sandbox and promote generated extension modules", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "MODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for one module
    Run {
        module_id: String,

        #[arg(long)]
        category: String,

        /// Driver name recorded in the module manifest
        #[arg(short, long, default_value = "template")]
        driver: String,

        /// Promote the files in this directory instead of generating from templates
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Statically inspect a candidate directory or a single file
    Inspect {
        path: PathBuf,

        /// Fail on medium-severity findings too
        #[arg(long)]
        strict: bool,
    },

    /// Execute one entry point of a candidate in the sandbox
    Sandbox {
        /// Candidate directory
        dir: PathBuf,

        #[arg(long)]
        entry_file: String,

        #[arg(long, default_value = "execute")]
        entry_point: String,

        /// JSON payload passed to the entry point
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Report a runtime incident for a live module
    Incident {
        module_id: String,

        /// Error message observed at runtime
        #[arg(short, long)]
        error: String,

        #[arg(long)]
        stacktrace: Option<String>,

        /// Explicit severity (0-10); derived from the error when omitted
        #[arg(short, long)]
        severity: Option<u8>,

        /// Runtime metric, repeatable: `--metric error_rate=0.4`
        #[arg(long = "metric", value_parser = parse_metric)]
        metrics: Vec<(String, f64)>,
    },

    /// Inspect and change registered modules
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// List and restore module snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Repairs waiting for operator approval
    Approvals {
        #[command(subcommand)]
        action: ApprovalAction,
    },

    /// Show the most recent audit records
    Audit {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum RegistryAction {
    /// List every registered module
    List,
    /// Show one registry entry
    Show { module_id: String },
    /// Mark a module active
    Enable { module_id: String },
    /// Mark a module disabled
    Disable { module_id: String },
    /// Check live files against the stored signature
    Verify { module_id: String },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List snapshots of a module, oldest first
    List { module_id: String },
    /// Restore a snapshot (default: the one taken before the current version)
    Restore {
        module_id: String,
        #[arg(long)]
        snapshot: Option<String>,
    },
}

#[derive(Subcommand)]
enum ApprovalAction {
    /// List pending repairs
    List,
    /// Execute a pending repair
    Approve { correlation_id: String },
    /// Discard a pending repair
    Reject { correlation_id: String },
}

fn parse_metric(raw: &str) -> std::result::Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("metric {name}: {e}"))?;
    Ok((name.trim().to_string(), value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for_verbosity(cli.verbose));

    let config = ModgateConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let outcome = dispatch(cli.command, &config).await;
    METRICS.flush();
    outcome
}

async fn open_manager(config: &ModgateConfig) -> Result<PipelineManager> {
    PipelineManager::from_config(config)
        .await
        .context("failed to start pipeline manager")
}

async fn dispatch(command: Commands, config: &ModgateConfig) -> Result<()> {
    match command {
        Commands::Run {
            module_id,
            category,
            driver,
            from,
        } => {
            let manager = open_manager(config).await?;
            cmd_run(&manager, &module_id, &category, &driver, from.as_deref()).await
        }
        Commands::Inspect { path, strict } => cmd_inspect(&path, strict, config),
        Commands::Sandbox {
            dir,
            entry_file,
            entry_point,
            payload,
        } => cmd_sandbox(config, &dir, &entry_file, &entry_point, &payload).await,
        Commands::Incident {
            module_id,
            error,
            stacktrace,
            severity,
            metrics,
        } => {
            let manager = open_manager(config).await?;
            cmd_incident(&manager, &module_id, &error, stacktrace, severity, metrics).await
        }
        Commands::Registry { action } => cmd_registry(&open_manager(config).await?, action).await,
        Commands::Snapshots { action } => {
            cmd_snapshots(&open_manager(config).await?, action).await
        }
        Commands::Approvals { action } => {
            cmd_approvals(&open_manager(config).await?, action).await
        }
        Commands::Audit { limit } => {
            let manager = open_manager(config).await?;
            for record in manager.audit_log().tail(limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
        Commands::Config => cmd_config(config),
    }
}

async fn cmd_registry(manager: &PipelineManager, action: RegistryAction) -> Result<()> {
    match action {
        RegistryAction::List => cmd_registry_list(manager).await,
        RegistryAction::Show { module_id } => {
            print_json(&manager.registry().require(&module_id).await?)
        }
        RegistryAction::Enable { module_id } => {
            cmd_set_status(manager, &module_id, ModuleStatus::Active).await
        }
        RegistryAction::Disable { module_id } => {
            cmd_set_status(manager, &module_id, ModuleStatus::Disabled).await
        }
        RegistryAction::Verify { module_id } => {
            let signature = manager.verify_module(&module_id).await?;
            println!("{module_id}: signature ok ({signature})");
            Ok(())
        }
    }
}

async fn cmd_snapshots(manager: &PipelineManager, action: SnapshotAction) -> Result<()> {
    match action {
        SnapshotAction::List { module_id } => {
            let snapshots = manager.snapshots().list(&module_id).await?;
            if snapshots.is_empty() {
                println!("No snapshots for '{module_id}'");
            }
            for s in snapshots {
                println!("{}  {} files  {}", s.snapshot_id, s.files.len(), s.created_at);
            }
            Ok(())
        }
        SnapshotAction::Restore {
            module_id,
            snapshot,
        } => {
            let (snapshot, entry) = manager.rollback(&module_id, snapshot.as_deref()).await?;
            println!(
                "Restored {} to snapshot {} (version {}, {})",
                module_id, snapshot.snapshot_id, entry.version, entry.status
            );
            Ok(())
        }
    }
}

async fn cmd_approvals(manager: &PipelineManager, action: ApprovalAction) -> Result<()> {
    match action {
        ApprovalAction::List => print_json(&manager.pending_approvals().await?),
        ApprovalAction::Approve { correlation_id } => {
            print_json(&manager.approve(&correlation_id).await?)
        }
        ApprovalAction::Reject { correlation_id } => {
            let pending = manager.reject(&correlation_id).await?;
            println!(
                "Rejected {} for {}",
                pending.action, pending.incident.module_id
            );
            Ok(())
        }
    }
}

async fn cmd_run(
    manager: &PipelineManager,
    module_id: &str,
    category: &str,
    driver: &str,
    from: Option<&Path>,
) -> Result<()> {
    let result = match from {
        Some(dir) => {
            let generator = SourceGenerator::from_dir(dir)
                .with_context(|| format!("failed to load sources from {}", dir.display()))?;
            manager
                .run_with(&generator, &PipelineRequest::new(module_id, category, driver))
                .await
        }
        None => manager.run_pipeline(module_id, category, driver).await,
    };
    print_json(&result)?;
    if !result.promoted {
        bail!(
            "{} was not promoted: {}",
            module_id,
            result.reason.as_deref().unwrap_or(result.outcome.label())
        );
    }
    info!(module_id = %module_id, version = ?result.version, "module promoted");
    Ok(())
}

fn cmd_inspect(path: &Path, strict: bool, config: &ModgateConfig) -> Result<()> {
    let inspector = Inspector::new(InspectorConfig {
        strict: strict || config.pipeline.strict_inspection,
        ..InspectorConfig::default()
    });
    let report = inspector
        .inspect(path)
        .with_context(|| format!("failed to inspect {}", path.display()))?;
    print_json(&report)?;
    if !report.ok {
        bail!("inspection failed with {} issue(s)", report.issues.len());
    }
    Ok(())
}

async fn cmd_sandbox(
    config: &ModgateConfig,
    dir: &Path,
    entry_file: &str,
    entry_point: &str,
    payload: &str,
) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(payload).context("payload is not JSON")?;
    let invocation = SandboxInvocation::new(dir, entry_file, entry_point)
        .with_payload(payload)
        .with_limits(config.sandbox.limits())
        .with_timeout(config.sandbox.timeout());
    let result = ProcessSandbox::new(config.sandbox.process_config())
        .run(invocation)
        .await?;
    print_json(&result)?;
    if !result.ok {
        bail!("sandbox run failed: {}", result.summary());
    }
    Ok(())
}

async fn cmd_incident(
    manager: &PipelineManager,
    module_id: &str,
    error: &str,
    stacktrace: Option<String>,
    severity: Option<u8>,
    metrics: Vec<(String, f64)>,
) -> Result<()> {
    let mut incident = Incident::new(module_id, error);
    if let Some(trace) = stacktrace {
        incident = incident.with_stacktrace(trace);
    }
    if let Some(severity) = severity {
        incident = incident.with_severity(severity);
    }
    for (name, value) in metrics {
        incident = incident.with_metric(name, value);
    }
    let result = manager.handle_incident(incident).await?;
    print_json(&result)?;
    if !result.success && !result.pending_approval {
        bail!("{} repair failed: {}", result.action, result.reason);
    }
    Ok(())
}

async fn cmd_registry_list(manager: &PipelineManager) -> Result<()> {
    let entries = manager.registry().list().await?;
    if entries.is_empty() {
        println!("No modules registered.");
        return Ok(());
    }
    for e in entries {
        println!(
            "{:<24} {:<12} v{:<4} {:<8} {} files",
            e.module_id,
            e.category,
            e.version,
            e.status,
            e.file_manifest.len()
        );
    }
    Ok(())
}

async fn cmd_set_status(manager: &PipelineManager, module_id: &str, status: ModuleStatus) -> Result<()> {
    let entry = manager.set_module_status(module_id, status).await?;
    println!("{} is now {} (version {})", module_id, entry.status, entry.version);
    Ok(())
}

fn cmd_config(config: &ModgateConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    print!("{rendered}");
    let limits: BTreeMap<_, _> = config
        .rate_limits
        .iter()
        .map(|(action, limit)| (action.as_str(), (limit.per_hour, limit.per_day)))
        .collect();
    info!(root = %config.paths.root.display(), rate_limits = ?limits, "effective configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::try_parse_from(["modgate", "run", "m1", "--category", "connector"]).unwrap();
        match cli.command {
            Commands::Run {
                module_id,
                category,
                driver,
                from,
            } => {
                assert_eq!(module_id, "m1");
                assert_eq!(category, "connector");
                assert_eq!(driver, "template");
                assert!(from.is_none());
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["modgate", "-vv", "config"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn parses_incident_metrics() {
        let cli = Cli::try_parse_from([
            "modgate",
            "incident",
            "m1",
            "--error",
            "timeout talking to device",
            "--metric",
            "error_rate=0.4",
            "--metric",
            "latency_ms=900",
        ])
        .unwrap();
        match cli.command {
            Commands::Incident {
                metrics, severity, ..
            } => {
                assert_eq!(severity, None);
                assert_eq!(
                    metrics,
                    vec![("error_rate".to_string(), 0.4), ("latency_ms".to_string(), 900.0)]
                );
            }
            _ => panic!("expected incident"),
        }
    }

    #[test]
    fn bad_metric_is_rejected() {
        assert!(parse_metric("error_rate").is_err());
        assert!(parse_metric("error_rate=high").is_err());
    }

    #[test]
    fn inspect_reports_failures_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.py");
        std::fs::write(&path, "import subprocess\n").unwrap();
        let err = cmd_inspect(&path, false, &ModgateConfig::default()).unwrap_err();
        assert!(err.to_string().contains("inspection failed"));
    }

    #[tokio::test]
    async fn run_and_list_against_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ModgateConfig::default();
        config.paths.root = dir.path().to_path_buf();
        config.store.backend = modgate_state::BackendChoice::File;
        config.snapshots.backend = modgate_core::SnapshotBackend::Files;
        config.sandbox.use_cgroups = false;
        config.sandbox.isolation = modgate_core::IsolationMode::BestEffort;
        let manager = PipelineManager::from_config(&config).await.unwrap();

        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(
            src.join("m1.py"),
            "def init():\n    pass\n\ndef execute(payload):\n    return payload\n\ndef cleanup():\n    pass\n",
        )
        .unwrap();
        let generator = SourceGenerator::from_dir(&src).unwrap();
        // The sandbox stage needs a real interpreter.
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return;
        }
        let result = manager
            .run_with(&generator, &PipelineRequest::new("m1", "connector", "local"))
            .await;
        assert!(result.promoted, "{:?}", result.reason);
        cmd_registry_list(&manager).await.unwrap();
        assert_eq!(manager.registry().list().await.unwrap().len(), 1);
    }
}
