//! CLI command handling.
//!
//! Provides subcommands for:
//! - Listing registered profiles (`profiles`)
//! - Building or rebuilding a profile image (`build`)
//! - Running one command in a throwaway sandbox (`run`)

mod run;

pub use run::{
    FileMapping, RunArgs, TIMEOUT_EXIT_CODE, exit_code_for, run_run_command, shell_command,
};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::SandboxConfig;
use crate::manager::SandboxManager;

#[derive(Parser, Debug)]
#[command(name = "agentic-sandbox")]
#[command(about = "Run generated code in short-lived, resource-bounded containers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// YAML file with additional profiles, loaded after SANDBOX_PROFILES_FILE
    #[arg(short, long, global = true)]
    pub profiles: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered profiles
    Profiles,

    /// Build the image for a profile
    Build {
        /// Profile name
        profile: String,

        /// Rebuild even if the image already exists
        #[arg(long)]
        force: bool,
    },

    /// Run a command in an ephemeral sandbox
    Run(RunArgs),
}

/// Load configuration and profiles for a CLI invocation.
pub fn load_config(cli: &Cli) -> anyhow::Result<SandboxConfig> {
    let mut config = SandboxConfig::from_env()?;
    if let Some(path) = &cli.profiles {
        config.load_profiles_file(path)?;
    }
    Ok(config)
}

/// Run the parsed command and return the process exit code.
pub async fn run_command(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    let mut manager = SandboxManager::connect(config)?;
    manager.register_default_profiles();

    if !matches!(cli.command, Command::Profiles) {
        manager
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Container daemon is not reachable: {}", e))?;
    }

    match cli.command {
        Command::Profiles => {
            list_profiles(&manager);
            Ok(0)
        }
        Command::Build { profile, force } => {
            let tag = manager
                .build(&profile, force)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to build image for '{}': {}", profile, e))?;
            println!("Image ready: {}", tag);
            Ok(0)
        }
        Command::Run(args) => run_run_command(&manager, args).await,
    }
}

fn list_profiles(manager: &SandboxManager) {
    let config = manager.config();
    let names = config.profile_names();

    println!("Profiles ({}):", names.len());
    println!();
    for name in names {
        let Ok(profile) = config.get_profile(name) else {
            continue;
        };
        let limits = profile.limits.resolve();
        println!("  {}", profile.name);
        println!("    Image: {} (from {})", profile.image, profile.base_image);
        println!("    User: {}", profile.user);
        println!(
            "    Network: {}",
            if profile.network_disabled { "disabled" } else { "enabled" }
        );
        println!(
            "    Memory: {} MiB, pids: {}",
            limits.memory_bytes / (1024 * 1024),
            limits.pids_limit
        );
        if let Some(wall_clock) = limits.wall_clock {
            println!("    Wall clock: {}s", wall_clock.as_secs());
        }
        if !profile.python_packages.is_empty() {
            println!("    Python packages: {}", profile.python_packages.join(", "));
        }
        println!();
    }
}
