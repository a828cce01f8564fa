//! The concrete deployment targets and the helpers they share

mod cloudflare;
mod git;
mod netlify;
mod rsync;
mod s3;
mod vercel;

pub use cloudflare::{CloudflareConfig, CloudflareTarget};
pub use git::{GitConfig, GitTarget, Pipeline};
pub use netlify::{NetlifyConfig, NetlifyTarget};
pub use rsync::{RsyncConfig, RsyncTarget};
pub use s3::{S3Config, S3Target};
pub use vercel::{VercelConfig, VercelTarget};

use crate::DeploymentTarget;
use crate::error::TransportError;
use crate::http;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sitedeploy_core::settings::typed_settings;
use sitedeploy_core::{CancellationToken, CommandRunner, DeployOutcome, ProcessError, Settings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default deadline for uploads and other long HTTP calls
pub(crate) const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Default deadline for subprocess transfers (push, rsync, aws s3 sync)
pub(crate) const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 30 * 60;

/// Deadline for `git ls-remote` and the SSH round trip
pub(crate) const CONNECT_TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Every built-in target, unconfigured
pub fn default_targets(runner: Arc<dyn CommandRunner>) -> Vec<Box<dyn DeploymentTarget>> {
    vec![
        Box::new(GitTarget::new(runner.clone())),
        Box::new(RsyncTarget::new(runner.clone())),
        Box::new(S3Target::new(runner)),
        Box::new(NetlifyTarget::new()),
        Box::new(VercelTarget::new()),
        Box::new(CloudflareTarget::new()),
    ]
}

/// Typed configuration shared shape: local checks only
pub(crate) trait TargetConfig: Serialize + DeserializeOwned + Default {
    fn problems(&self) -> Vec<String>;
}

/// Parse a candidate and list its problems, type errors included
pub(crate) fn validate<T: TargetConfig>(candidate: &Settings) -> Vec<String> {
    match typed_settings::<T>(candidate) {
        Ok(config) => config.problems(),
        Err(e) => vec![e.to_string()],
    }
}

pub(crate) fn not_configured(name: &str, problems: &[String]) -> DeployOutcome {
    DeployOutcome::failure(
        format!("{} is not configured", name),
        Some(problems.join("\n")),
    )
}

/// Failure for a build directory that does not exist yet
pub(crate) fn missing_artifact(dir: &Path) -> Option<DeployOutcome> {
    if dir.is_dir() {
        return None;
    }
    Some(DeployOutcome::failure(
        format!("Build directory not found: {}", dir.display()),
        Some("Run the site build first".to_string()),
    ))
}

/// Failure for a command that could not run to completion
pub(crate) fn process_failure(context: &str, err: &ProcessError) -> DeployOutcome {
    match err {
        ProcessError::Spawn { program, .. } if err.is_not_found() => {
            DeployOutcome::failure(format!("{} is not installed", program), Some(err.to_string()))
        }
        _ => DeployOutcome::failure(context, Some(err.to_string())),
    }
}

pub(crate) fn transport_failure(context: &str, err: &TransportError) -> DeployOutcome {
    DeployOutcome::failure(context, Some(err.diagnostic()))
}

/// Per-target HTTP client, or a failure outcome if the client can't be built
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, DeployOutcome> {
    http::client(Duration::from_secs(timeout_secs))
        .map_err(|e| transport_failure("Failed to create HTTP client", &e))
}

/// POST an empty body to a deploy hook. The platform builds asynchronously,
/// so an accepted hook is only ever Pending.
pub(crate) async fn trigger_hook(
    platform: &str,
    hook_url: &str,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> DeployOutcome {
    let client = match http_client(timeout_secs) {
        Ok(client) => client,
        Err(outcome) => return outcome,
    };
    match http::send_text(client.post(hook_url), cancel).await {
        Ok(_) => DeployOutcome::pending(format!(
            "{} build triggered; the site will publish when the build finishes",
            platform
        ))
        .with_data("mode", "hook"),
        Err(e) => transport_failure(&format!("{} deploy hook failed", platform), &e),
    }
}

/// Bearer-authenticated GET for status and connection checks, retried on
/// transient failures
pub(crate) async fn read_json<T: DeserializeOwned>(
    what: &str,
    client: &reqwest::Client,
    url: &str,
    token: &str,
    cancel: &CancellationToken,
) -> Result<T, TransportError> {
    http::with_read_retry(what, move || async move {
        let request = client.get(url).bearer_auth(token).timeout(http::READ_TIMEOUT);
        http::send_json::<T>(request, cancel).await
    })
    .await
}

/// Flag a set-but-malformed URL setting
pub(crate) fn check_url(problems: &mut Vec<String>, label: &str, value: &Option<String>) {
    if let Some(url) = non_blank(value)
        && reqwest::Url::parse(url).is_err()
    {
        problems.push(format!("{} is not a valid URL", label));
    }
}

/// Treat blank strings in optional settings as unset
pub(crate) fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitedeploy_core::testing::ScriptedRunner;
    use std::collections::HashSet;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_default_targets_have_unique_ids() {
        let targets = default_targets(Arc::new(ScriptedRunner::new()));
        let ids: HashSet<&str> = targets.iter().map(|t| t.id()).collect();
        assert_eq!(ids.len(), 6);
        for id in ["git", "rsync", "s3", "netlify", "vercel", "cloudflare"] {
            assert!(ids.contains(id), "missing {id}");
        }
    }

    #[test]
    fn test_check_url() {
        let mut problems = Vec::new();
        check_url(&mut problems, "Deploy hook", &Some("https://api.netlify.com/build_hooks/abc".into()));
        check_url(&mut problems, "Deploy hook", &None);
        assert!(problems.is_empty());
        check_url(&mut problems, "Deploy hook", &Some("not a url".into()));
        assert_eq!(problems, vec!["Deploy hook is not a valid URL"]);
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        assert!(missing_artifact(dir.path()).is_none());
        let outcome = missing_artifact(&dir.path().join("public")).unwrap();
        assert!(outcome.is_failure());
        assert!(outcome.message().starts_with("Build directory not found"));
    }

    #[test]
    fn test_process_failure_reports_missing_tool() {
        let err = ProcessError::Spawn {
            program: "aws".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(process_failure("sync failed", &err).message(), "aws is not installed");

        let err = ProcessError::Cancelled {
            program: "aws".into(),
        };
        assert_eq!(process_failure("sync failed", &err).message(), "sync failed");
    }

    #[tokio::test]
    async fn test_hook_accepted_is_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_string(""))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = trigger_hook(
            "Netlify",
            &format!("{}/hook", server.uri()),
            5,
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.is_pending());
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_hook_rejected_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("hook not found"))
            .mount(&server)
            .await;

        let outcome = trigger_hook("Vercel", &server.uri(), 5, &CancellationToken::new()).await;
        assert!(outcome.is_failure());
        assert_eq!(outcome.error(), Some("hook not found"));
    }
}
