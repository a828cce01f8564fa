pub mod build;
pub mod deploy;
pub mod output;
pub mod status;
pub mod targets;

use anyhow::{Context, Result};
use sitedeploy_builder::{CommandSiteBuilder, PagefindIndexer};
use sitedeploy_core::{
    BuildSettings, CommandRunner, ConfigSource, DEFAULT_CONFIG_FILE, MemoryConfig, ProcessRunner,
    TomlConfig,
};
use sitedeploy_deployer::DeploymentOrchestrator;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Load the configuration file. An explicit path must exist; a missing
/// default file means an empty configuration.
pub fn load_config(path: Option<&Path>) -> Result<Arc<dyn ConfigSource>> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_FILE), false),
    };

    if !path.exists() {
        if explicit {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        warn!(path = %path.display(), "No config file, using defaults");
        return Ok(Arc::new(MemoryConfig::new(serde_json::json!({}))));
    }

    debug!(path = %path.display(), "Loading config");
    let config = TomlConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(Arc::new(config))
}

/// Orchestrator wired to the real generator, indexer and built-in targets
pub fn load_orchestrator(config_path: Option<&Path>) -> Result<DeploymentOrchestrator> {
    let config = load_config(config_path)?;
    let settings = BuildSettings::from_config(config.as_ref()).context("Invalid [build] section")?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let builder = Arc::new(CommandSiteBuilder::new(runner.clone(), settings.clone()));
    let indexer = Arc::new(PagefindIndexer::new(runner.clone(), settings));

    let orchestrator = DeploymentOrchestrator::new(config, builder)?
        .with_indexer(indexer)
        .with_default_targets(runner);
    Ok(orchestrator)
}
