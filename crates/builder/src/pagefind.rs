use crate::SearchIndexer;
use async_trait::async_trait;
use sitedeploy_core::{
    BuildSettings, CancellationToken, CommandRunner, CommandSpec, DeployOutcome,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Builds a Pagefind search index over the generated site
pub struct PagefindIndexer {
    runner: Arc<dyn CommandRunner>,
    settings: BuildSettings,
}

impl PagefindIndexer {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: BuildSettings) -> Self {
        Self { runner, settings }
    }
}

#[async_trait]
impl SearchIndexer for PagefindIndexer {
    fn name(&self) -> &str {
        "pagefind"
    }

    async fn index(&self, public_dir: &Path, cancel: &CancellationToken) -> DeployOutcome {
        let mut spec = CommandSpec::new(&self.settings.index_command)
            .args(self.settings.index_args.iter().map(|a| self.settings.expand(a)))
            .timeout(Duration::from_secs(self.settings.timeout_secs));
        // Relative placeholders resolve against the source root
        if let Some(root) = public_dir
            .ancestors()
            .nth(self.settings.public_dir.components().count())
        {
            spec = spec.current_dir(root);
        }

        info!(command = %spec.display(), "Building search index");

        match self.runner.run(&spec, cancel).await {
            Ok(output) if output.success => DeployOutcome::success("Search index built")
                .with_data("output", output.combined()),
            Ok(output) => DeployOutcome::failure(
                format!("Search index build failed (exit code {})", output.code),
                Some(output.combined()),
            )
            .with_data("output", output.combined()),
            Err(e) if e.is_not_found() => DeployOutcome::failure(
                format!("'{}' is not installed", self.settings.index_command),
                Some(e.to_string()),
            ),
            Err(e) => DeployOutcome::failure("Search index build failed", Some(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitedeploy_core::CommandOutput;
    use sitedeploy_core::testing::ScriptedRunner;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_runs_from_source_root() {
        let runner = Arc::new(ScriptedRunner::new().on(&["npx"], CommandOutput::ok("Indexed 12 pages")));
        let indexer = PagefindIndexer::new(runner.clone(), BuildSettings::default());
        let outcome = indexer
            .index(Path::new("/srv/site/public"), &CancellationToken::new())
            .await;

        assert!(outcome.is_success());
        let call = runner.find(&["npx"]).unwrap();
        assert_eq!(call.args, vec!["-y", "pagefind", "--site", "public"]);
        assert_eq!(call.current_dir, Some(PathBuf::from("/srv/site")));
    }

    #[tokio::test]
    async fn test_failure_keeps_output() {
        let runner = Arc::new(ScriptedRunner::new().on(&["npx"], CommandOutput::failed(1, "no html files")));
        let indexer = PagefindIndexer::new(runner, BuildSettings::default());
        let outcome = indexer
            .index(Path::new("/srv/site/public"), &CancellationToken::new())
            .await;

        assert!(outcome.is_failure());
        assert_eq!(outcome.error(), Some("no html files"));
    }
}
