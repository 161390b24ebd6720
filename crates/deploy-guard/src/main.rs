//! deploy-guard CLI
//!
//! Pre-deployment safeguards, rollout watches, rollbacks, remediation
//! reports and the remediation daemon.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use deploy_guard::telemetry::{init_tracing, LogFormat};
use deploy_guard::{
    DeployGuard, GuardConfig, GuardError, RollbackOutcome, RollbackTarget, RolloutOutcome,
    Severity,
};

/// Deployment safety engine - safeguards, automated remediation and rollback
#[derive(Parser)]
#[command(name = "deploy-guard")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (JSON or YAML); falls back to DEPLOY_GUARD_CONFIG, then deploy-guard.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pre-deployment safeguards; exits 2 when the deployment is blocked
    Gate,
    /// Gate, then watch the rollout of a configured target
    Monitor {
        /// Target name from the config file
        #[arg(long)]
        target: String,
    },
    /// Roll a deployment back to a stable revision
    Rollback {
        #[arg(long)]
        namespace: String,

        #[arg(long)]
        deployment: String,

        /// Revision to restore; the most recent stable one when omitted
        #[arg(long)]
        revision: Option<i64>,

        /// Accept an explicit revision that is not stable
        #[arg(long, requires = "revision")]
        force: bool,

        /// Pod selector used for verification (default: app=<deployment>)
        #[arg(long)]
        selector: Option<String>,

        /// Service checked during verification (default: <deployment>)
        #[arg(long)]
        service: Option<String>,
    },
    /// Summarize remediation activity
    Report {
        /// Trailing window in hours
        #[arg(long, default_value = "24")]
        hours: u32,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run the remediation loop until Ctrl-C; SIGHUP reloads targets and rules
    Run,
    /// Load and validate the configuration, then exit
    ValidateConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e:#}", "error:".red().bold());
        let code = e.downcast_ref::<GuardError>().map_or(1, GuardError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = GuardConfig::load(cli.config.as_deref())?;
    let _telemetry = init_tracing(&config.telemetry, cli.log_format, cli.verbose)?;

    if let Commands::ValidateConfig = cli.command {
        print_config_summary(&config);
        return Ok(());
    }

    let guard = DeployGuard::from_config(&config)?;
    let config_path = cli.config;

    match cli.command {
        Commands::Gate => gate(&guard).await,
        Commands::Monitor { target } => monitor(&guard, &target).await,
        Commands::Rollback {
            namespace,
            deployment,
            revision,
            force,
            selector,
            service,
        } => {
            let mut target = RollbackTarget::new(namespace, deployment).forced(force);
            if let Some(revision) = revision {
                target = target.with_revision(revision);
            }
            if let Some(selector) = selector {
                target.selector = selector;
            }
            if let Some(service) = service {
                target.service = service;
            }
            let outcome = guard.rollback(&target).await?;
            print_rollback(&outcome);
            Ok(())
        }
        Commands::Report { hours, json } => {
            let report = guard.report(hours).await;
            if json {
                println!("{}", report.render_json()?);
            } else {
                print!("{}", report.render_text()?);
            }
            Ok(())
        }
        Commands::Run => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C, shutting down");
                }
                signal.cancel();
            });
            tokio::join!(
                guard.run(shutdown.clone()),
                reload_on_hangup(&guard, config_path.as_deref(), &shutdown)
            );
            Ok(())
        }
        Commands::ValidateConfig => Ok(()),
    }
}

/// Re-read the config file on every SIGHUP and apply it to the running loop.
#[cfg(unix)]
async fn reload_on_hangup(guard: &DeployGuard, path: Option<&Path>, shutdown: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, configuration reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            Some(()) = hangups.recv() => {
                info!("SIGHUP received, reloading configuration");
                match GuardConfig::load(path) {
                    Ok(config) => {
                        if let Err(e) = guard.reconfigure(&config).await {
                            warn!(error = %e, "Reloaded configuration rejected");
                        }
                    }
                    Err(e) => warn!(error = %format!("{e:#}"), "Failed to reload configuration"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_guard: &DeployGuard, _path: Option<&Path>, shutdown: &CancellationToken) {
    shutdown.cancelled().await;
}

async fn gate(guard: &DeployGuard) -> Result<()> {
    match guard.gate().await {
        Ok(report) => {
            for result in &report.results {
                let mark = if result.passed {
                    "✓".green()
                } else {
                    "✗".yellow()
                };
                println!(
                    "  {mark} {:<18} {} ({}ms)",
                    result.name, result.description, result.duration_ms
                );
                if let Some(error) = &result.error {
                    println!("      {}", error.dimmed());
                }
            }
            if report.all_passed() {
                println!("{}", "All safeguards passed".green().bold());
            } else {
                println!(
                    "{}",
                    format!(
                        "Deployment allowed with {} warning(s)",
                        report.warnings().len()
                    )
                    .yellow()
                    .bold()
                );
            }
            Ok(())
        }
        Err(GuardError::DeploymentBlocked { reasons }) => {
            println!("{}", "Deployment blocked".red().bold());
            for reason in &reasons {
                println!("  {} {reason}", "✗".red());
            }
            Err(GuardError::DeploymentBlocked { reasons }.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn monitor(guard: &DeployGuard, name: &str) -> Result<()> {
    let target = guard.target(name)?;
    let handle = guard.start_monitored_deployment(target.clone()).await?;
    println!(
        "{}",
        format!("Watching rollout of {}", target.qualified()).cyan().bold()
    );

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, rollout watch stopped");
            return Ok(());
        }
    };

    match outcome {
        RolloutOutcome::Completed {
            samples,
            last_error_rate,
        } => {
            println!(
                "{}",
                format!(
                    "Rollout completed after {samples} sample(s), error rate {}",
                    last_error_rate.map_or_else(|| "n/a".to_string(), |r| format!("{r:.4}"))
                )
                .green()
            );
            Ok(())
        }
        RolloutOutcome::Failed {
            error_rate,
            rolled_back_to,
            rollback_error,
        } => {
            println!(
                "{}",
                format!("Rollout failed with error rate {error_rate:.4}").red().bold()
            );
            if let Some(revision) = rolled_back_to {
                println!("  Rolled back to revision {revision}");
            }
            if let Some(error) = rollback_error {
                println!("  Rollback failed: {error}");
            }
            bail!("rollout of {} failed", target.qualified())
        }
        RolloutOutcome::TimedOut { samples } => {
            bail!(
                "rollout of {} did not settle within the watch window ({samples} samples)",
                target.qualified()
            )
        }
        RolloutOutcome::Cancelled => Ok(()),
    }
}

fn print_rollback(outcome: &RollbackOutcome) {
    println!(
        "{}",
        format!(
            "Rolled back {} to revision {}",
            outcome.deployment, outcome.revision
        )
        .green()
        .bold()
    );
    let phases: Vec<String> = outcome.phases.iter().map(ToString::to_string).collect();
    println!("  phases:   {}", phases.join(" → "));
    println!("  snapshot: {}", outcome.snapshot_path.display());
    println!(
        "  pods:     {}/{} running, service {}",
        outcome.verification.pods_running,
        outcome.verification.pods_total,
        if outcome.verification.service_healthy {
            "healthy"
        } else {
            "unhealthy"
        }
    );
}

fn print_config_summary(config: &GuardConfig) {
    println!("{}", "Configuration is valid".green().bold());
    println!("  safeguard namespace: {}", config.safeguards.namespace);
    let critical = config
        .safeguards
        .severities
        .values()
        .filter(|s| **s == Severity::Critical)
        .count();
    if critical > 0 {
        println!("  severity overrides marking critical: {critical}");
    }
    for target in &config.targets {
        println!(
            "  target {} ({}): {} rule(s){}",
            target.name.bold(),
            target.namespace,
            target.rules.len(),
            if target.auto_rollback {
                ", auto-rollback"
            } else {
                ""
            }
        );
    }
}
