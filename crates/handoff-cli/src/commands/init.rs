use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use handoff_core::config::HandoffConfig;

#[derive(Args)]
pub struct InitArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: &InitArgs, config_path: &Path) -> Result<()> {
    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite it.",
            config_path.display()
        );
    }

    HandoffConfig::default_init()
        .save(config_path)
        .context("Failed to write config")?;
    let config = super::load_config(config_path)?;

    // Response files must exist before `capture --start` to be watched
    for agent in &config.pipeline.agents {
        let workspace = config.capture.watch_root.join(&agent.agent_id);
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("Failed to create {}", workspace.display()))?;
        let response = workspace.join(&config.capture.response_filename);
        if !response.exists() {
            std::fs::write(&response, "").with_context(|| format!("Failed to create {}", response.display()))?;
        }
        std::fs::create_dir_all(config.pipeline.status_root.join(&agent.agent_id))?;
    }
    std::fs::create_dir_all(&config.state_dir).context("Failed to create state directory")?;

    println!("Wrote {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  handoff capture --start          Watch agent response files");
    println!("  handoff pipeline start           Run the auto-gas pipeline");
    println!("  handoff pipeline status          Show the pipeline dashboard");
    Ok(())
}
