use serde_json::Value;
use sitedeploy_core::{DeployOutcome, OutcomeStatus};
use sitedeploy_deployer::StatusReport;
use std::process::ExitCode;

/// Pending counts as success: the backend accepted the work
pub fn exit_code(outcome: &DeployOutcome) -> ExitCode {
    if outcome.is_failure() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

pub fn format_outcome(outcome: &DeployOutcome) -> String {
    let icon = match outcome.status() {
        OutcomeStatus::Success => "✅",
        OutcomeStatus::Pending => "⏳",
        OutcomeStatus::Failure => "❌",
    };
    let mut out = format!("{} {}\n", icon, outcome.message());
    for (key, value) in outcome.data() {
        if key == "output" {
            continue;
        }
        out.push_str(&format!("   {}: {}\n", key, display_value(value)));
    }
    if let Some(log) = outcome.get("output").and_then(Value::as_str)
        && !log.trim().is_empty()
    {
        out.push('\n');
        out.push_str(log.trim_end());
        out.push('\n');
    }
    out
}

pub fn format_status(report: &StatusReport) -> String {
    let mut out = format!("{}: {}\n", report.target, report.state);
    for (key, value) in &report.details {
        out.push_str(&format!("   {}: {}\n", key, display_value(value)));
    }
    out
}

/// Print an outcome and map it to the process exit code
pub fn print_outcome(outcome: &DeployOutcome, json: bool) -> ExitCode {
    if json {
        match serde_json::to_string_pretty(outcome) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to serialize result: {}", e),
        }
    } else {
        print!("{}", format_outcome(outcome));
        if let Some(error) = outcome.error() {
            eprintln!();
            eprintln!("{}", error.trim_end());
        }
    }
    exit_code(outcome)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) if map.contains_key("succeeded") => {
            let ok = map.get("succeeded").and_then(Value::as_bool).unwrap_or(false);
            let message = map.get("message").and_then(Value::as_str).unwrap_or_default();
            format!("{} {}", if ok { "ok," } else { "failed," }, message)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitedeploy_core::SubOperation;

    #[test]
    fn test_exit_code_follows_status() {
        assert_eq!(exit_code(&DeployOutcome::success("ok")), ExitCode::SUCCESS);
        assert_eq!(exit_code(&DeployOutcome::pending("queued")), ExitCode::SUCCESS);
        assert_eq!(exit_code(&DeployOutcome::failure("no", None)), ExitCode::FAILURE);
    }

    #[test]
    fn test_format_outcome_lists_data() {
        let outcome = DeployOutcome::success("Deployed to Netlify")
            .with_data("url", "https://site.netlify.app")
            .with_data("files", 12)
            .with_data("output", "long build log");
        let text = format_outcome(&outcome);
        assert!(text.starts_with("✅ Deployed to Netlify\n"));
        assert!(text.contains("   url: https://site.netlify.app\n"));
        assert!(text.contains("   files: 12\n"));
        assert!(text.ends_with("\nlong build log\n"));
    }

    #[test]
    fn test_format_sub_operation() {
        let sub = SubOperation::failed("CloudFront invalidation failed", Some("AccessDenied".into()));
        let outcome = DeployOutcome::success("Synced").with_sub_operation("invalidation", &sub);
        let text = format_outcome(&outcome);
        assert!(text.contains("   invalidation: failed, CloudFront invalidation failed\n"));
    }

    #[test]
    fn test_format_status() {
        let report = StatusReport::new("git", "clean").with("branch", "main");
        assert_eq!(format_status(&report), "git: clean\n   branch: main\n");
    }
}
