use super::output::print_outcome;
use sitedeploy_core::CancellationToken;
use sitedeploy_deployer::{BuildRequest, DeploymentOrchestrator};
use std::process::ExitCode;

/// Build the site (and search index) without deploying
pub async fn run(
    orchestrator: &DeploymentOrchestrator,
    clean: bool,
    search_index: bool,
    base_url: Option<String>,
    cancel: &CancellationToken,
    json: bool,
) -> ExitCode {
    if !json {
        let settings = orchestrator.build_settings();
        println!("🔨 Building site...");
        println!("   Source: {}", settings.source_root.display());
        println!("   Output: {}", orchestrator.artifact_dir().display());
        println!();
    }

    let request = BuildRequest {
        clean,
        search_index,
        base_url,
    };
    let outcome = orchestrator.build(&request, cancel).await;
    print_outcome(&outcome, json)
}
