//! Sync the build directory into an S3 bucket with the AWS CLI, then
//! optionally invalidate a CloudFront distribution in front of it.

use super::{
    DEFAULT_TRANSFER_TIMEOUT_SECS, TargetConfig, missing_artifact, non_blank, not_configured,
    process_failure, validate,
};
use crate::{DeployOptions, DeploymentTarget, StatusReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sitedeploy_core::settings::{require, typed_settings};
use sitedeploy_core::{
    CancellationToken, CommandRunner, CommandSpec, DeployOutcome, FieldType, Result, Settings,
    SettingsField, SubOperation,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Deadline for listings and the invalidation request
const AWS_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub cloudfront_id: Option<String>,
    /// Remove objects that no longer exist locally
    pub delete: bool,
    pub cache_control: Option<String>,
    pub timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            prefix: None,
            access_key: None,
            secret_key: None,
            cloudfront_id: None,
            delete: false,
            cache_control: None,
            timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
        }
    }
}

impl TargetConfig for S3Config {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require(&mut problems, &[("Bucket", &self.bucket), ("Region", &self.region)]);
        if non_blank(&self.access_key).is_some() != non_blank(&self.secret_key).is_some() {
            problems.push("Access key and secret key must be set together".to_string());
        }
        problems
    }
}

impl S3Config {
    fn destination(&self) -> String {
        let bucket = non_blank(&self.bucket).unwrap_or_default();
        match non_blank(&self.prefix).map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("s3://{}/{}", bucket, prefix),
            _ => format!("s3://{}", bucket),
        }
    }

    fn region(&self) -> &str {
        non_blank(&self.region).unwrap_or_default()
    }
}

fn count_uploads(output: &str) -> usize {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("upload:"))
        .count()
}

/// `Total Objects` and `Total Size` from `aws s3 ls --summarize`
fn parse_summary(output: &str) -> (Option<u64>, Option<u64>) {
    let mut objects = None;
    let mut size = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Total Objects:") {
            objects = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("Total Size:") {
            size = rest.trim().parse().ok();
        }
    }
    (objects, size)
}

pub struct S3Target {
    runner: Arc<dyn CommandRunner>,
    config: S3Config,
}

impl S3Target {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            config: S3Config::default(),
        }
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// `aws` invocation with explicit credentials in the environment when
    /// configured; the CLI's own credential chain otherwise
    fn aws<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = CommandSpec::new("aws").args(args);
        if let (Some(key), Some(secret)) = (
            non_blank(&self.config.access_key),
            non_blank(&self.config.secret_key),
        ) {
            spec = spec
                .env("AWS_ACCESS_KEY_ID", key)
                .env("AWS_SECRET_ACCESS_KEY", secret);
        }
        spec
    }

    fn sync_command(&self, source_dir: &Path) -> CommandSpec {
        let mut spec = self
            .aws(["s3", "sync"])
            .arg(source_dir.display().to_string())
            .arg(self.config.destination())
            .args(["--region", self.config.region()]);
        if self.config.delete {
            spec = spec.arg("--delete");
        }
        if let Some(cache_control) = non_blank(&self.config.cache_control) {
            spec = spec.args(["--cache-control", cache_control]);
        }
        spec.timeout(Duration::from_secs(self.config.timeout_secs))
    }

    async fn invalidate(&self, distribution_id: &str, cancel: &CancellationToken) -> SubOperation {
        let spec = self
            .aws(["cloudfront", "create-invalidation"])
            .args(["--distribution-id", distribution_id, "--paths", "/*", "--output", "json"])
            .timeout(AWS_QUERY_TIMEOUT);

        match self.runner.run(&spec, cancel).await {
            Ok(output) if output.success => {
                let mut sub = SubOperation::succeeded("CloudFront invalidation created")
                    .with_data("distribution", distribution_id);
                let id = serde_json::from_str::<Value>(&output.stdout)
                    .ok()
                    .and_then(|v| v.pointer("/Invalidation/Id").cloned());
                if let Some(id) = id {
                    sub = sub.with_data("id", id);
                }
                sub
            }
            Ok(output) => SubOperation::failed("CloudFront invalidation failed", Some(output.combined())),
            Err(e) => SubOperation::failed("CloudFront invalidation failed", Some(e.to_string())),
        }
    }
}

#[async_trait]
impl DeploymentTarget for S3Target {
    fn id(&self) -> &'static str {
        "s3"
    }

    fn name(&self) -> &'static str {
        "Amazon S3"
    }

    fn description(&self) -> String {
        let mut description = format!("Sync the site to {}", self.config.destination());
        if self.config.delete {
            description.push_str(", deleting objects missing locally");
        }
        if non_blank(&self.config.cloudfront_id).is_some() {
            description.push_str(", then invalidate CloudFront");
        }
        description
    }

    fn settings_fields(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::new("bucket", FieldType::Text, "Bucket").required(),
            SettingsField::new("region", FieldType::Text, "Region")
                .help("e.g. us-east-1")
                .required(),
            SettingsField::new("prefix", FieldType::Text, "Key prefix"),
            SettingsField::new("access_key", FieldType::Text, "Access key ID")
                .help("Leave empty to use the AWS CLI's own credentials"),
            SettingsField::new("secret_key", FieldType::Password, "Secret access key"),
            SettingsField::new("cloudfront_id", FieldType::Text, "CloudFront distribution ID")
                .help("Invalidate /* after each sync"),
            SettingsField::new("delete", FieldType::Checkbox, "Delete objects missing locally")
                .default_value(false),
            SettingsField::new("cache_control", FieldType::Text, "Cache-Control header"),
            SettingsField::new("timeout_secs", FieldType::Number, "Sync timeout (seconds)")
                .default_value(DEFAULT_TRANSFER_TIMEOUT_SECS),
        ]
    }

    fn is_configured(&self) -> bool {
        self.config.problems().is_empty()
    }

    fn validate_config(&self, candidate: &Settings) -> Vec<String> {
        validate::<S3Config>(candidate)
    }

    fn configure(&mut self, settings: &Settings) -> Result<()> {
        self.config = typed_settings(settings)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = "s3", delete = self.config.delete))]
    async fn deploy(&self, source_dir: &Path, options: &DeployOptions) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }
        if let Some(outcome) = missing_artifact(source_dir) {
            return outcome;
        }
        let cancel = &options.cancel;

        if !self.runner.probe("aws", &["--version"], cancel).await {
            return DeployOutcome::failure("aws is not installed", None);
        }

        info!(destination = %self.config.destination(), "Syncing");
        let output = match self.runner.run(&self.sync_command(source_dir), cancel).await {
            Ok(output) if output.success => output,
            Ok(output) => {
                return DeployOutcome::failure(
                    format!("S3 sync failed (exit code {})", output.code),
                    Some(output.tail(20)),
                );
            }
            Err(e) => return process_failure("S3 sync failed", &e),
        };

        let uploaded = count_uploads(&output.stdout);
        let mut outcome = DeployOutcome::success(format!(
            "Synced {} file(s) to {}",
            uploaded,
            self.config.destination()
        ))
        .with_data("bucket", non_blank(&self.config.bucket).unwrap_or_default())
        .with_data("destination", self.config.destination())
        .with_data("uploaded", uploaded)
        .with_data("delete", self.config.delete);

        if let Some(distribution_id) = non_blank(&self.config.cloudfront_id) {
            let invalidation = self.invalidate(distribution_id, cancel).await;
            if !invalidation.succeeded {
                warn!(distribution = distribution_id, "CloudFront invalidation failed");
            }
            outcome = outcome.with_sub_operation("invalidation", &invalidation);
        }
        outcome
    }

    async fn status(&self, cancel: &CancellationToken) -> Option<StatusReport> {
        if !self.is_configured() {
            return Some(StatusReport::unconfigured(self.id()));
        }
        let spec = self
            .aws(["s3", "ls"])
            .arg(self.config.destination())
            .args(["--recursive", "--summarize", "--region", self.config.region()])
            .timeout(AWS_QUERY_TIMEOUT);
        let output = self.runner.run(&spec, cancel).await.ok().filter(|o| o.success)?;
        let (objects, size) = parse_summary(&output.stdout);

        Some(
            StatusReport::new(self.id(), if objects.unwrap_or(0) > 0 { "deployed" } else { "empty" })
                .with("destination", self.config.destination())
                .with("objects", objects)
                .with("total_size", size)
                .with("cloudfront_id", non_blank(&self.config.cloudfront_id)),
        )
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }
        let bucket = format!("s3://{}", non_blank(&self.config.bucket).unwrap_or_default());
        let spec = self
            .aws(["s3", "ls"])
            .arg(bucket.as_str())
            .args(["--region", self.config.region()])
            .timeout(AWS_QUERY_TIMEOUT);

        match self.runner.run(&spec, cancel).await {
            Ok(output) if output.success => DeployOutcome::success(format!("Bucket {} is accessible", bucket)),
            Ok(output) => DeployOutcome::failure(
                format!("Cannot access {}", bucket),
                Some(output.combined()),
            ),
            Err(e) => process_failure(&format!("Cannot access {}", bucket), &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sitedeploy_core::CommandOutput;
    use sitedeploy_core::testing::ScriptedRunner;

    const INVALIDATION_JSON: &str = r#"{
        "Location": "https://cloudfront.amazonaws.com/2020-05-31/distribution/E2EXAMPLE/invalidation/I3EXAMPLE",
        "Invalidation": { "Id": "I3EXAMPLE", "Status": "InProgress" }
    }"#;

    fn settings(value: Value) -> Settings {
        value.as_object().cloned().unwrap_or_default()
    }

    fn configured(runner: Arc<ScriptedRunner>, extra: Value) -> S3Target {
        let mut s = settings(json!({ "bucket": "my-site", "region": "eu-west-1" }));
        s.extend(settings(extra));
        let mut target = S3Target::new(runner);
        target.configure(&s).unwrap();
        target
    }

    fn syncing() -> ScriptedRunner {
        ScriptedRunner::new()
            .on(
                &["aws", "s3", "sync"],
                CommandOutput::ok("upload: public/index.html to s3://my-site/index.html\nupload: public/a.css to s3://my-site/a.css"),
            )
            .on(&["aws", "cloudfront"], CommandOutput::ok(INVALIDATION_JSON))
    }

    #[test]
    fn test_bucket_and_region_required() {
        let target = S3Target::new(Arc::new(ScriptedRunner::new()));
        assert!(!target.is_configured());
        assert_eq!(
            target.validate_config(&settings(json!({ "bucket": "b" }))),
            vec!["Region is required"]
        );
        assert_eq!(
            target.validate_config(&settings(json!({ "bucket": "b", "region": "r", "access_key": "AKIA" }))),
            vec!["Access key and secret key must be set together"]
        );
    }

    #[test]
    fn test_parse_summary() {
        let listing = "2024-03-09 14:05:07   1024 index.html\n\nTotal Objects: 42\n   Total Size: 123456";
        assert_eq!(parse_summary(listing), (Some(42), Some(123456)));
    }

    #[tokio::test]
    async fn test_invalidates_exactly_once_when_configured() {
        let site = tempfile::tempdir().unwrap();
        let runner = Arc::new(syncing());
        let target = configured(runner.clone(), json!({ "cloudfront_id": "E2EXAMPLE" }));

        let outcome = target.deploy(site.path(), &DeployOptions::default()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.get("uploaded"), Some(&json!(2)));
        assert_eq!(runner.count(&["aws", "cloudfront", "create-invalidation"]), 1);

        let invalidation = outcome.sub_operation("invalidation").unwrap();
        assert!(invalidation.succeeded);
        assert_eq!(invalidation.data["id"], "I3EXAMPLE");

        let call = runner.find(&["aws", "cloudfront"]).unwrap();
        assert!(call.args.windows(2).any(|w| w == ["--paths", "/*"]));
    }

    #[tokio::test]
    async fn test_no_invalidation_without_distribution() {
        let site = tempfile::tempdir().unwrap();
        let runner = Arc::new(syncing());
        let target = configured(runner.clone(), json!({}));

        let outcome = target.deploy(site.path(), &DeployOptions::default()).await;
        assert!(outcome.is_success());
        assert_eq!(runner.count(&["aws", "cloudfront"]), 0);
        assert!(outcome.sub_operation("invalidation").is_none());
    }

    #[tokio::test]
    async fn test_repeat_deploy_succeeds() {
        let site = tempfile::tempdir().unwrap();
        let runner = Arc::new(syncing());
        let target = configured(runner.clone(), json!({}));

        assert!(target.deploy(site.path(), &DeployOptions::default()).await.is_success());
        assert!(target.deploy(site.path(), &DeployOptions::default()).await.is_success());
        assert_eq!(runner.count(&["aws", "s3", "sync"]), 2);
    }

    #[tokio::test]
    async fn test_failed_invalidation_does_not_fail_deploy() {
        let site = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(&["aws", "cloudfront"], CommandOutput::failed(254, "AccessDenied"))
                .on(&["aws", "s3", "sync"], CommandOutput::ok("")),
        );
        let target = configured(runner, json!({ "cloudfront_id": "E2EXAMPLE" }));

        let outcome = target.deploy(site.path(), &DeployOptions::default()).await;
        assert!(outcome.is_success());
        let invalidation = outcome.sub_operation("invalidation").unwrap();
        assert!(!invalidation.succeeded);
        assert_eq!(invalidation.error.as_deref(), Some("AccessDenied"));
    }

    #[tokio::test]
    async fn test_sync_failure_skips_invalidation() {
        let site = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new().on(&["aws", "s3", "sync"], CommandOutput::failed(1, "NoSuchBucket")),
        );
        let target = configured(runner.clone(), json!({ "cloudfront_id": "E2EXAMPLE" }));

        let outcome = target.deploy(site.path(), &DeployOptions::default()).await;
        assert!(outcome.is_failure());
        assert_eq!(outcome.error(), Some("NoSuchBucket"));
        assert_eq!(runner.count(&["aws", "cloudfront"]), 0);
    }

    #[tokio::test]
    async fn test_sync_command_and_credentials() {
        let site = tempfile::tempdir().unwrap();
        let runner = Arc::new(syncing());
        let target = configured(
            runner.clone(),
            json!({
                "prefix": "/blog/",
                "delete": true,
                "cache_control": "max-age=300",
                "access_key": "AKIAEXAMPLE",
                "secret_key": "wJalrXUtnFEMI",
            }),
        );

        target.deploy(site.path(), &DeployOptions::default()).await;
        let call = runner.find(&["aws", "s3", "sync"]).unwrap();
        assert_eq!(
            call.args,
            vec![
                "s3".to_string(),
                "sync".to_string(),
                site.path().display().to_string(),
                "s3://my-site/blog".to_string(),
                "--region".to_string(),
                "eu-west-1".to_string(),
                "--delete".to_string(),
                "--cache-control".to_string(),
                "max-age=300".to_string(),
            ]
        );
        assert_eq!(call.env["AWS_ACCESS_KEY_ID"], "AKIAEXAMPLE");
        assert!(!call.display().contains("wJalrXUtnFEMI"));
    }

    #[tokio::test]
    async fn test_missing_cli() {
        let site = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().missing("aws"));
        let target = configured(runner, json!({}));
        let outcome = target.deploy(site.path(), &DeployOptions::default()).await;
        assert_eq!(outcome.message(), "aws is not installed");
    }
}
