use crate::{BuildOptions, SiteBuilder, count_files};
use async_trait::async_trait;
use sitedeploy_core::{
    BuildSettings, CancellationToken, CommandRunner, CommandSpec, DeployOutcome,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs an external static site generator (Hugo by default) from the
/// source root.
pub struct CommandSiteBuilder {
    runner: Arc<dyn CommandRunner>,
    settings: BuildSettings,
}

impl CommandSiteBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: BuildSettings) -> Self {
        Self { runner, settings }
    }

    fn command(&self, source_root: &Path, options: &BuildOptions) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.settings.command)
            .args(self.settings.args.iter().map(|a| self.settings.expand(a)))
            .current_dir(source_root)
            .timeout(Duration::from_secs(self.settings.timeout_secs));

        let base_url = options
            .base_url_override
            .as_ref()
            .or(self.settings.base_url.as_ref())
            .filter(|url| !url.trim().is_empty());
        if let Some(url) = base_url {
            spec = spec.arg(&self.settings.base_url_flag).arg(url);
        }
        spec
    }
}

#[async_trait]
impl SiteBuilder for CommandSiteBuilder {
    async fn build(
        &self,
        source_root: &Path,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> DeployOutcome {
        let spec = self.command(source_root, options);
        let public_dir = source_root.join(&self.settings.public_dir);
        info!(command = %spec.display(), clean = options.clean, "Building site");

        let output = match self.runner.run(&spec, cancel).await {
            Ok(output) => output,
            Err(e) if e.is_not_found() => {
                return DeployOutcome::failure(
                    format!("Site generator '{}' is not installed", self.settings.command),
                    Some(e.to_string()),
                );
            }
            Err(e) => return DeployOutcome::failure("Site build failed", Some(e.to_string())),
        };

        if !output.success {
            warn!(code = output.code, "Site generator exited with an error");
            return DeployOutcome::failure(
                format!("Site build failed (exit code {})", output.code),
                Some(output.combined()),
            )
            .with_data("output", output.combined());
        }

        let files = count_files(&public_dir);
        info!(files, public_dir = %public_dir.display(), "Site built");

        DeployOutcome::success(format!("Site built ({} files)", files))
            .with_data("publicDir", public_dir.to_string_lossy().to_string())
            .with_data("files", files)
            .with_data("output", output.combined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitedeploy_core::CommandOutput;
    use sitedeploy_core::testing::ScriptedRunner;
    use std::fs;
    use std::path::PathBuf;

    fn settings() -> BuildSettings {
        BuildSettings {
            base_url: Some("https://example.com/".to_string()),
            ..BuildSettings::default()
        }
    }

    #[tokio::test]
    async fn test_successful_build_reports_public_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("public")).unwrap();
        fs::write(dir.path().join("public/index.html"), "<html>").unwrap();

        let runner = Arc::new(ScriptedRunner::new().on(&["hugo"], CommandOutput::ok("Total in 42 ms")));
        let builder = CommandSiteBuilder::new(runner.clone(), settings());
        let outcome = builder
            .build(dir.path(), &BuildOptions::default(), &CancellationToken::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.get("files"), Some(&serde_json::json!(1)));
        assert_eq!(
            outcome.get("publicDir").and_then(|v| v.as_str()).map(PathBuf::from),
            Some(dir.path().join("public"))
        );

        let call = runner.find(&["hugo"]).unwrap();
        assert_eq!(call.current_dir.as_deref(), Some(dir.path()));
        assert_eq!(
            call.args,
            vec!["--destination", "public", "--baseURL", "https://example.com/"]
        );
    }

    #[tokio::test]
    async fn test_base_url_override_wins() {
        let runner = Arc::new(ScriptedRunner::new());
        let builder = CommandSiteBuilder::new(runner.clone(), settings());
        let options = BuildOptions {
            clean: false,
            base_url_override: Some("https://preview.example.com/".to_string()),
        };
        builder.build(Path::new("."), &options, &CancellationToken::new()).await;

        let call = runner.find(&["hugo"]).unwrap();
        assert!(call.args.contains(&"https://preview.example.com/".to_string()));
        assert!(!call.args.contains(&"https://example.com/".to_string()));
    }

    #[tokio::test]
    async fn test_failed_build_captures_output() {
        let runner = Arc::new(
            ScriptedRunner::new().on(&["hugo"], CommandOutput::failed(255, "Error: template not found")),
        );
        let builder = CommandSiteBuilder::new(runner, settings());
        let outcome = builder
            .build(Path::new("."), &BuildOptions::default(), &CancellationToken::new())
            .await;

        assert!(outcome.is_failure());
        assert!(outcome.message().contains("255"));
        assert!(outcome.error().unwrap().contains("template not found"));
    }

    #[tokio::test]
    async fn test_missing_generator() {
        let runner = Arc::new(ScriptedRunner::new().missing("hugo"));
        let builder = CommandSiteBuilder::new(runner, settings());
        let outcome = builder
            .build(Path::new("."), &BuildOptions::default(), &CancellationToken::new())
            .await;

        assert!(outcome.is_failure());
        assert!(outcome.message().contains("not installed"));
    }
}
