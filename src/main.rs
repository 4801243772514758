//! twlinst - headless installer entry point

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use twlinst::cli::{Cli, Commands};
use twlinst::console::ConsoleRenderer;
use twlinst::profiles::ProfileCatalogue;
use twlinst::{
    InstallConfig, ProcessGuard, Run, RunEnv, RunOutcome, SystemTopology, byte_count_decimal,
    discover, process_guard, update_channel,
};

/// Log to stderr so diagnostics never interleave with the progress transcript.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_logging();
    info!("twlinst {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to install signal handlers: {}", e);
    }
    let guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    debug!("Parsed arguments: {:?}", cli);

    let result = match cli.command {
        Commands::Install {
            config,
            mount_root,
            profiles,
        } => install(&config, &mount_root, &profiles),
        Commands::Validate { config } => validate(&config),
        Commands::Disks => list_disks(),
        Commands::Profiles { file } => list_profiles(&file),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        drop(guard);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<InstallConfig> {
    let config = InstallConfig::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", path))?;
    Ok(config)
}

fn validate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("✓ Configuration file is valid: {:?}", config);
    Ok(())
}

fn install(config_path: &Path, mount_root: &Path, profiles: &Path) -> Result<()> {
    let mut config = load_config(config_path)?;
    if config.hardware_profile.is_some() {
        let catalogue = ProfileCatalogue::load(profiles)?;
        config.apply_profile(&catalogue)?;
    }
    let disks = discover(&SystemTopology).context("Reading disks")?;
    let settings = config.resolve(&disks)?;
    info!(
        "Installing onto {} ({})",
        settings.disk.path,
        byte_count_decimal(settings.disk.capacity_bytes())
    );

    let mut env = RunEnv::system();
    env.paths = env.paths.with_mount_root(mount_root);

    let (updates, rx) = update_channel();
    let handle = Run::configure(updates, settings, env)
        .start()
        .context("Install init failed")?;

    let stdout = std::io::stdout();
    let styled = stdout.is_terminal();
    let mut console = ConsoleRenderer::new(stdout.lock(), styled);
    if let Err(e) = console.consume(rx) {
        warn!("Lost console output: {}", e);
    }

    match handle.wait() {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Failed { step, error } => {
            anyhow::bail!("Installation failed during {}: {}", step.name(), error)
        }
        RunOutcome::Aborted { error } => anyhow::bail!("Installation aborted: {}", error),
    }
}

fn list_disks() -> Result<()> {
    let disks = discover(&SystemTopology).context("Reading disks")?;
    if disks.is_empty() {
        println!("No disks found.");
    }
    for disk in &disks {
        println!("{}", disk.summary());
    }
    Ok(())
}

fn list_profiles(path: &Path) -> Result<()> {
    let catalogue = ProfileCatalogue::load(path)?;
    for (vendor, profiles) in &catalogue.vendors {
        println!("{}", vendor);
        for profile in profiles {
            println!("  {:<32} {}", profile.model, profile.import);
        }
    }
    for profile in &catalogue.ungrouped {
        println!("{:<34} {}", profile.name, profile.import);
    }
    Ok(())
}
