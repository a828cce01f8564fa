use anyhow::Result;
use sitedeploy_core::target_settings_path;
use sitedeploy_deployer::{DeploymentOrchestrator, TargetSummary};
use std::process::ExitCode;

pub fn run(orchestrator: &DeploymentOrchestrator, schema: bool, json: bool) -> Result<ExitCode> {
    let mut summaries = orchestrator.targets();
    if !schema {
        for summary in &mut summaries {
            summary.fields.clear();
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        print!("{}", format_targets(&summaries));
    }
    Ok(ExitCode::SUCCESS)
}

fn format_targets(summaries: &[TargetSummary]) -> String {
    let width = summaries.iter().map(|s| s.id.len()).max().unwrap_or(0);
    let mut out = String::new();
    for summary in summaries {
        let marker = if summary.active { "*" } else { " " };
        let state = if summary.configured { "configured" } else { "not configured" };
        out.push_str(&format!(
            "{} {:width$}  {} ({})\n",
            marker,
            summary.id,
            summary.description,
            state,
            width = width
        ));
        for field in &summary.fields {
            let required = if field.required { ", required" } else { "" };
            out.push_str(&format!(
                "    {}.{}  {}{}\n",
                target_settings_path(&summary.id),
                field.key,
                field.label,
                required
            ));
        }
    }
    out
}
