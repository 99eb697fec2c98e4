use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use handoff_core::config::HandoffConfig;
use handoff_core::state::{self, PipelineState};
use handoff_pipeline::{
    AutoGasPipelineSystem, InboxDelivery, PipelineDashboard, PipelineError, PipelineMonitor,
};

use crate::output::{format, OutputFormat};

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Args)]
pub struct PipelineArgs {
    #[command(subcommand)]
    pub command: PipelineCommand,
}

#[derive(Subcommand)]
pub enum PipelineCommand {
    /// Run the monitor in the foreground until `pipeline stop`
    Start {
        /// Seconds between ticks (default: pipeline.interval_secs from config)
        interval_secs: Option<u64>,

        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
    /// Ask a running monitor to stop
    Stop,
    /// Show the pipeline dashboard
    Status,
    /// Send a MANUAL_OVERRIDE hand-off now (every non-terminal agent if none given)
    ForceGas {
        agent: Option<String>,
    },
    /// Clear hand-off latches so thresholds can fire again (every agent if none given)
    Reset {
        agent: Option<String>,
    },
}

pub fn run(args: &PipelineArgs, config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = super::load_config(config_path)?;
    match &args.command {
        PipelineCommand::Start {
            interval_secs,
            once,
        } => start(&config, *interval_secs, *once, format),
        PipelineCommand::Stop => stop(&config),
        PipelineCommand::Status => status(&config, format),
        PipelineCommand::ForceGas { agent } => force_gas(&config, agent.as_deref()),
        PipelineCommand::Reset { agent } => reset(&config, agent.as_deref()),
    }
}

fn build_system(config: &HandoffConfig) -> AutoGasPipelineSystem {
    AutoGasPipelineSystem::new(
        &config.pipeline,
        Box::new(InboxDelivery::new(config.pipeline.inbox_root.clone())),
    )
}

/// System with latches carried over from the state file.
fn restored_system(config: &HandoffConfig) -> Result<AutoGasPipelineSystem> {
    let mut system = build_system(config);
    let path = config.pipeline_state_path();
    if let Some(saved) = state::load_locked::<PipelineState>(&path).context("Failed to read pipeline state")? {
        system.restore(&saved);
    }
    Ok(system)
}

fn save_system(config: &HandoffConfig, system: &AutoGasPipelineSystem) -> Result<()> {
    state::save_locked(&config.pipeline_state_path(), &system.snapshot()).context("Failed to save pipeline state")
}

fn start(config: &HandoffConfig, interval_secs: Option<u64>, once: bool, fmt: OutputFormat) -> Result<()> {
    if config.pipeline.agents.is_empty() {
        anyhow::bail!("No agents configured in pipeline.agents");
    }
    let interval_secs = interval_secs.unwrap_or(config.pipeline.interval_secs);
    if interval_secs == 0 {
        anyhow::bail!("Interval must be at least 1 second");
    }

    let mut monitor = PipelineMonitor::new(build_system(config), Duration::from_secs(interval_secs))
        .with_state_path(config.pipeline_state_path());

    if once {
        monitor.restore().context("Failed to restore pipeline state")?;
        let report = monitor.tick_now();
        tracing::info!(delivered = report.delivered(), failed = report.failed(), "Single tick complete");
        println!("{}", format::format_dashboard(&monitor.dashboard(), fmt));
        return Ok(());
    }

    let stop_path = config.pipeline_stop_path();
    state::remove(&stop_path);
    monitor.start().context("Failed to start pipeline monitor")?;
    eprintln!(
        "Pipeline running with {} agents, ticking every {interval_secs}s. Stop with `handoff pipeline stop`.",
        config.pipeline.agents.len()
    );

    while !stop_path.exists() {
        std::thread::sleep(SUPERVISE_INTERVAL);
    }
    let clean = monitor.stop();
    state::remove(&stop_path);
    if let Err(e) = monitor.persist() {
        tracing::warn!("Failed to persist final pipeline state: {e}");
    }
    if !clean {
        anyhow::bail!("Pipeline monitor exited abnormally");
    }
    println!("{}", format::format_dashboard(&monitor.dashboard(), fmt));
    Ok(())
}

fn stop(config: &HandoffConfig) -> Result<()> {
    state::touch(&config.pipeline_stop_path()).context("Failed to write stop request")?;
    println!("Stop requested; a running pipeline monitor exits within a second.");
    Ok(())
}

fn status(config: &HandoffConfig, fmt: OutputFormat) -> Result<()> {
    let saved = state::load_locked::<PipelineState>(&config.pipeline_state_path())
        .context("Failed to read pipeline state")?;
    let dashboard = match saved {
        Some(saved) => {
            let mut dashboard = PipelineDashboard::from_state(&saved);
            dashboard.interval_secs = Some(config.pipeline.interval_secs);
            dashboard
        }
        None => PipelineDashboard::from_agents(
            build_system(config).agents(),
            None,
            Some(config.pipeline.interval_secs),
            None,
        ),
    };
    println!("{}", format::format_dashboard(&dashboard, fmt));
    Ok(())
}

fn force_gas(config: &HandoffConfig, agent: Option<&str>) -> Result<()> {
    let mut system = restored_system(config)?;
    let targets: Vec<String> = match agent {
        Some(id) => vec![id.to_string()],
        None => system
            .agents()
            .iter()
            .filter(|a| !a.is_terminal())
            .map(|a| a.agent_id.clone())
            .collect(),
    };
    if targets.is_empty() {
        anyhow::bail!("No agent has a next agent to hand off to");
    }

    let mut failures = 0;
    for id in &targets {
        match system.force_gas(id) {
            Ok(message_id) => {
                let next = system
                    .agent(id)
                    .and_then(|a| a.next_agent.as_deref())
                    .unwrap_or("-");
                println!("Sent MANUAL_OVERRIDE hand-off {id} -> {next} ({message_id})");
            }
            Err(e @ (PipelineError::UnknownAgent(_) | PipelineError::Terminal(_))) => {
                return Err(e).context("Cannot force a hand-off");
            }
            Err(e) => {
                failures += 1;
                eprintln!("Hand-off from {id} failed: {e}");
            }
        }
    }
    save_system(config, &system)?;
    if failures > 0 {
        anyhow::bail!("{failures} hand-off(s) could not be delivered");
    }
    Ok(())
}

fn reset(config: &HandoffConfig, agent: Option<&str>) -> Result<()> {
    let mut system = restored_system(config)?;
    match agent {
        Some(id) => {
            system.reset_agent(id).context("Cannot reset agent")?;
            println!("Reset hand-off latches for {id}.");
        }
        None => {
            system.reset_all();
            println!("Reset hand-off latches for all {} agents.", system.agents().len());
        }
    }
    save_system(config, &system)?;
    eprintln!("A pipeline monitor that is already running keeps its own latches until restarted.");
    Ok(())
}
