use super::output::{format_status, print_outcome};
use anyhow::Result;
use sitedeploy_core::CancellationToken;
use sitedeploy_deployer::DeploymentOrchestrator;
use std::process::ExitCode;

/// Show the remote state of a target (the active one by default)
pub async fn run(
    orchestrator: &DeploymentOrchestrator,
    target: Option<String>,
    cancel: &CancellationToken,
    json: bool,
) -> Result<ExitCode> {
    let id = target_or_active(orchestrator, target)?;

    let Some(report) = orchestrator.status_of(&id, cancel).await else {
        eprintln!("⚠ Could not read the remote state of {}", id);
        return Ok(ExitCode::FAILURE);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_status(&report));
    }
    Ok(ExitCode::SUCCESS)
}

/// Check credentials and reachability of one target
pub async fn test(
    orchestrator: &DeploymentOrchestrator,
    target: Option<String>,
    cancel: &CancellationToken,
    json: bool,
) -> Result<ExitCode> {
    let id = target_or_active(orchestrator, target)?;
    if !json {
        println!("🔌 Testing connection to {}...", id);
    }
    let outcome = orchestrator.test_connection(&id, cancel).await;
    Ok(print_outcome(&outcome, json))
}

fn target_or_active(orchestrator: &DeploymentOrchestrator, target: Option<String>) -> Result<String> {
    let id = match target {
        Some(id) => id,
        None => orchestrator.resolve_active_target()?.id().to_string(),
    };
    if orchestrator.target(&id).is_none() {
        anyhow::bail!("Unknown deployment target '{}'", id);
    }
    Ok(id)
}
