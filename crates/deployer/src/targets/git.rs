//! Publish by committing and pushing a working copy, optionally kicking off
//! a CI pipeline that does the actual publishing.

use super::{
    CONNECT_TEST_TIMEOUT, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_TRANSFER_TIMEOUT_SECS,
    TargetConfig, http_client, non_blank, not_configured, process_failure, validate,
};
use crate::{DeployOptions, DeploymentTarget, StatusReport, http};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sitedeploy_core::settings::{require, typed_settings};
use sitedeploy_core::{
    CancellationToken, CommandOutput, CommandRunner, CommandSpec, DeployOutcome, FieldType,
    ProcessError, Result, Settings, SettingsField, SubOperation,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const FALLBACK_AUTHOR_NAME: &str = "sitedeploy";
const FALLBACK_AUTHOR_EMAIL: &str = "sitedeploy@localhost";
const GITLAB_API: &str = "https://gitlab.com/api/v4";
const GITHUB_API: &str = "https://api.github.com";

/// CI system to notify after a push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pipeline {
    #[default]
    #[serde(rename = "none")]
    Disabled,
    Gitlab,
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub repository: PathBuf,
    pub remote: String,
    pub branch: String,
    /// Supports `{action}`, `{date}` and `{time}`
    pub commit_message: String,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub pipeline: Pipeline,
    pub pipeline_token: Option<String>,
    /// GitLab project id/path or GitHub `owner/repo`
    pub project: Option<String>,
    pub workflow: String,
    pub api_base: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("."),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            commit_message: "Deploy: {action} {date} {time}".to_string(),
            author_name: None,
            author_email: None,
            pipeline: Pipeline::Disabled,
            pipeline_token: None,
            project: None,
            workflow: "deploy.yml".to_string(),
            api_base: None,
            timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
        }
    }
}

impl TargetConfig for GitConfig {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.repository.join(".git").exists() {
            problems.push(format!(
                "{} is not a git working copy",
                self.repository.display()
            ));
        }
        if self.remote.trim().is_empty() {
            problems.push("Remote is required".to_string());
        }
        if self.branch.trim().is_empty() {
            problems.push("Branch is required".to_string());
        }
        if self.pipeline != Pipeline::Disabled {
            require(
                &mut problems,
                &[
                    ("Pipeline token", &self.pipeline_token),
                    ("Project", &self.project),
                ],
            );
        }
        if self.pipeline == Pipeline::Github && self.workflow.trim().is_empty() {
            problems.push("Workflow is required".to_string());
        }
        problems
    }
}

/// Expand the commit message placeholders
pub fn render_message(template: &str, action: &str, now: DateTime<Local>) -> String {
    template
        .replace("{action}", action)
        .replace("{date}", &now.format("%Y-%m-%d").to_string())
        .replace("{time}", &now.format("%H:%M:%S").to_string())
}

pub struct GitTarget {
    runner: Arc<dyn CommandRunner>,
    config: GitConfig,
}

impl GitTarget {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            config: GitConfig::default(),
        }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    fn git<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("git")
            .args(args)
            .current_dir(&self.config.repository)
            .timeout(Duration::from_secs(self.config.timeout_secs))
    }

    async fn run(
        &self,
        spec: CommandSpec,
        cancel: &CancellationToken,
    ) -> std::result::Result<CommandOutput, ProcessError> {
        debug!(command = %spec.display(), "git");
        self.runner.run(&spec, cancel).await
    }

    /// Author for the deploy commit. An explicitly configured author always
    /// wins; without one, the repository's own identity is used and only
    /// when that is missing does the fallback kick in.
    async fn commit_identity(&self, cancel: &CancellationToken) -> Option<(String, String)> {
        if let (Some(name), Some(email)) = (
            non_blank(&self.config.author_name),
            non_blank(&self.config.author_email),
        ) {
            return Some((name.to_string(), email.to_string()));
        }

        let has_identity = matches!(
            self.run(self.git(["config", "user.email"]), cancel).await,
            Ok(output) if output.success && !output.stdout.trim().is_empty()
        );
        if has_identity {
            None
        } else {
            Some((
                non_blank(&self.config.author_name)
                    .unwrap_or(FALLBACK_AUTHOR_NAME)
                    .to_string(),
                FALLBACK_AUTHOR_EMAIL.to_string(),
            ))
        }
    }

    async fn trigger_pipeline(&self, cancel: &CancellationToken) -> Option<SubOperation> {
        if self.config.pipeline == Pipeline::Disabled {
            return None;
        }
        let (Some(token), Some(project)) = (
            non_blank(&self.config.pipeline_token),
            non_blank(&self.config.project),
        ) else {
            return Some(SubOperation::failed(
                "Pipeline trigger skipped",
                Some("pipeline token and project are required".to_string()),
            ));
        };

        let client = match http_client(DEFAULT_HTTP_TIMEOUT_SECS) {
            Ok(client) => client,
            Err(outcome) => {
                return Some(SubOperation::failed(
                    outcome.message(),
                    outcome.error().map(str::to_string),
                ));
            }
        };
        let api = non_blank(&self.config.api_base);

        match self.config.pipeline {
            Pipeline::Disabled => None,
            Pipeline::Gitlab => {
                let url = http::endpoint(
                    api.unwrap_or(GITLAB_API),
                    &format!(
                        "projects/{}/trigger/pipeline",
                        project.replace('/', "%2F")
                    ),
                );
                let request = client
                    .post(url)
                    .form(&[("token", token), ("ref", self.config.branch.as_str())]);
                Some(match http::send_json::<Value>(request, cancel).await {
                    Ok(body) => {
                        let mut sub = SubOperation::succeeded("GitLab pipeline triggered");
                        if let Some(id) = body.get("id") {
                            sub = sub.with_data("id", id.clone());
                        }
                        if let Some(url) = body.get("web_url") {
                            sub = sub.with_data("url", url.clone());
                        }
                        sub
                    }
                    Err(e) => SubOperation::failed("GitLab pipeline trigger failed", Some(e.diagnostic())),
                })
            }
            Pipeline::Github => {
                let url = http::endpoint(
                    api.unwrap_or(GITHUB_API),
                    &format!(
                        "repos/{}/actions/workflows/{}/dispatches",
                        project, self.config.workflow
                    ),
                );
                let request = client
                    .post(url)
                    .bearer_auth(token)
                    .header("Accept", "application/vnd.github+json")
                    .json(&json!({ "ref": self.config.branch }));
                Some(match http::send_text(request, cancel).await {
                    Ok(_) => SubOperation::succeeded("GitHub workflow dispatched")
                        .with_data("workflow", self.config.workflow.clone()),
                    Err(e) => SubOperation::failed("GitHub workflow dispatch failed", Some(e.diagnostic())),
                })
            }
        }
    }
}

#[async_trait]
impl DeploymentTarget for GitTarget {
    fn id(&self) -> &'static str {
        "git"
    }

    fn name(&self) -> &'static str {
        "Git"
    }

    fn description(&self) -> String {
        let mut description = format!(
            "Commit all changes in {} and push to {}/{}",
            self.config.repository.display(),
            self.config.remote,
            self.config.branch
        );
        match self.config.pipeline {
            Pipeline::Disabled => {}
            Pipeline::Gitlab => description.push_str(", then trigger a GitLab pipeline"),
            Pipeline::Github => description.push_str(", then dispatch a GitHub workflow"),
        }
        description
    }

    fn settings_fields(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::new("repository", FieldType::Text, "Repository path")
                .help("Working copy to commit and push")
                .default_value(".")
                .required(),
            SettingsField::new("remote", FieldType::Text, "Remote").default_value("origin").required(),
            SettingsField::new("branch", FieldType::Text, "Branch").default_value("main").required(),
            SettingsField::new("commit_message", FieldType::Text, "Commit message")
                .help("Placeholders: {action}, {date}, {time}")
                .default_value("Deploy: {action} {date} {time}"),
            SettingsField::new("author_name", FieldType::Text, "Author name"),
            SettingsField::new("author_email", FieldType::Text, "Author email"),
            SettingsField::new(
                "pipeline",
                FieldType::Select {
                    options: vec!["none".into(), "gitlab".into(), "github".into()],
                },
                "CI pipeline",
            )
            .default_value("none"),
            SettingsField::new("pipeline_token", FieldType::Password, "Pipeline token")
                .help("GitLab trigger token or GitHub token with actions:write"),
            SettingsField::new("project", FieldType::Text, "Project")
                .help("GitLab project id or GitHub owner/repo"),
            SettingsField::new("workflow", FieldType::Text, "GitHub workflow file")
                .default_value("deploy.yml"),
            SettingsField::new("api_base", FieldType::Url, "CI API base URL")
                .help("For self-hosted GitLab or GitHub Enterprise"),
            SettingsField::new("timeout_secs", FieldType::Number, "Push timeout (seconds)")
                .default_value(DEFAULT_TRANSFER_TIMEOUT_SECS),
        ]
    }

    fn is_configured(&self) -> bool {
        self.config.problems().is_empty()
    }

    fn validate_config(&self, candidate: &Settings) -> Vec<String> {
        validate::<GitConfig>(candidate)
    }

    fn configure(&mut self, settings: &Settings) -> Result<()> {
        self.config = typed_settings(settings)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = "git", branch = %self.config.branch))]
    async fn deploy(&self, source_dir: &Path, options: &DeployOptions) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }
        let cancel = &options.cancel;
        debug!(source = %source_dir.display(), "Publishing through git working copy");

        let identity = self.commit_identity(cancel).await;

        match self.run(self.git(["add", "-A"]), cancel).await {
            Ok(output) if output.success => {}
            Ok(output) => {
                return DeployOutcome::failure("Failed to stage changes", Some(output.combined()));
            }
            Err(e) => return process_failure("Failed to stage changes", &e),
        }

        // Exit code 1 means something is staged
        match self.run(self.git(["diff", "--cached", "--quiet"]), cancel).await {
            Ok(output) if output.success => {
                info!("Nothing staged");
                return DeployOutcome::success("no changes to deploy").with_data("changed", false);
            }
            Ok(output) if output.code == 1 => {}
            Ok(output) => {
                return DeployOutcome::failure(
                    "Failed to inspect staged changes",
                    Some(output.combined()),
                );
            }
            Err(e) => return process_failure("Failed to inspect staged changes", &e),
        }

        let message = match options.message.as_deref().map(str::trim) {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => render_message(&self.config.commit_message, "publish", Local::now()),
        };
        let mut commit = self.git(["commit", "-m", message.as_str()]);
        if let Some((name, email)) = &identity {
            commit = commit
                .env("GIT_AUTHOR_NAME", name.as_str())
                .env("GIT_AUTHOR_EMAIL", email.as_str())
                .env("GIT_COMMITTER_NAME", name.as_str())
                .env("GIT_COMMITTER_EMAIL", email.as_str());
        }
        match self.run(commit, cancel).await {
            Ok(output) if output.success => {}
            Ok(output) if output.combined().contains("nothing to commit") => {
                debug!("Nothing to commit, pushing anyway");
            }
            Ok(output) => {
                return DeployOutcome::failure("Commit failed", Some(output.combined()));
            }
            Err(e) => return process_failure("Commit failed", &e),
        }

        let push = self.git([
            "push",
            self.config.remote.as_str(),
            self.config.branch.as_str(),
        ]);
        match self.run(push, cancel).await {
            Ok(output) if output.success => {}
            Ok(output) => {
                return DeployOutcome::failure(
                    format!(
                        "Push to {}/{} failed",
                        self.config.remote, self.config.branch
                    ),
                    Some(output.combined()),
                );
            }
            Err(e) => return process_failure("Push failed", &e),
        }

        let commit_id = match self.run(self.git(["rev-parse", "--short", "HEAD"]), cancel).await {
            Ok(output) if output.success => Some(output.stdout.trim().to_string()),
            _ => None,
        };
        info!(commit = ?commit_id, "Pushed");

        let mut outcome = DeployOutcome::success(format!(
            "Pushed to {}/{}",
            self.config.remote, self.config.branch
        ))
        .with_data("changed", true)
        .with_data("remote", self.config.remote.clone())
        .with_data("branch", self.config.branch.clone())
        .with_data("message", message);
        if let Some(commit_id) = commit_id {
            outcome = outcome.with_data("commit", commit_id);
        }

        if let Some(pipeline) = self.trigger_pipeline(cancel).await {
            if !pipeline.succeeded {
                warn!(message = %pipeline.message, "Pipeline trigger failed");
            }
            outcome = outcome.with_sub_operation("pipeline", &pipeline);
        }
        outcome
    }

    async fn status(&self, cancel: &CancellationToken) -> Option<StatusReport> {
        if !self.is_configured() {
            return Some(StatusReport::unconfigured(self.id()));
        }

        let branch = self
            .run(self.git(["rev-parse", "--abbrev-ref", "HEAD"]), cancel)
            .await
            .ok()
            .filter(|o| o.success)?;
        let pending = self
            .run(self.git(["status", "--porcelain"]), cancel)
            .await
            .ok()
            .filter(|o| o.success)?
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();

        let mut report = StatusReport::new(self.id(), if pending == 0 { "clean" } else { "dirty" })
            .with("branch", branch.stdout.trim())
            .with("remote", self.config.remote.as_str())
            .with("pending_changes", pending);

        if let Ok(output) = self
            .run(self.git(["log", "-1", "--format=%h|%s|%cI"]), cancel)
            .await
            && output.success
        {
            let mut parts = output.stdout.trim().splitn(3, '|');
            if let (Some(hash), Some(subject), Some(date)) = (parts.next(), parts.next(), parts.next()) {
                report = report
                    .with("commit", hash)
                    .with("subject", subject)
                    .with("committed_at", date);
            }
        }
        Some(report)
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }

        let spec = self
            .git(["ls-remote", "--heads", self.config.remote.as_str()])
            .timeout(CONNECT_TEST_TIMEOUT);
        match self.run(spec, cancel).await {
            Ok(output) if output.success => {
                let heads = output.stdout.lines().filter(|l| !l.trim().is_empty()).count();
                DeployOutcome::success(format!("Remote '{}' is reachable", self.config.remote))
                    .with_data("heads", heads)
            }
            Ok(output) => DeployOutcome::failure(
                format!("Cannot reach remote '{}'", self.config.remote),
                Some(output.combined()),
            ),
            Err(e) => process_failure(&format!("Cannot reach remote '{}'", self.config.remote), &e),
        }
    }
}
