use super::output::print_outcome;
use anyhow::{Context, Result};
use sitedeploy_core::CancellationToken;
use sitedeploy_deployer::{DeployOptions, DeploymentOrchestrator};
use std::process::ExitCode;
use std::sync::Arc;

pub struct Options {
    pub target: Option<String>,
    pub all: bool,
    pub build: bool,
    pub message: Option<String>,
}

/// Deploy to one target, the active target or all configured targets
pub async fn run(
    orchestrator: DeploymentOrchestrator,
    options: Options,
    cancel: CancellationToken,
    json: bool,
) -> Result<ExitCode> {
    let deploy_options = DeployOptions {
        message: options.message,
        build: options.build,
        cancel,
    };

    if !json {
        let destination = match (&options.target, options.all) {
            (_, true) => "all configured targets".to_string(),
            (Some(id), _) => id.clone(),
            (None, false) => orchestrator
                .active_target_id()
                .unwrap_or_else(|| "(no deployment.method set)".to_string()),
        };
        println!("🚀 Deploying to {}...", destination);
        if options.build {
            println!("   Building first");
        }
        println!();
    }

    let outcome = if options.all {
        orchestrator.deploy_all(&deploy_options).await
    } else {
        let orchestrator = Arc::new(orchestrator);
        orchestrator
            .spawn_deploy(options.target, deploy_options)
            .await
            .context("Deploy task panicked")?
    };
    Ok(print_outcome(&outcome, json))
}
