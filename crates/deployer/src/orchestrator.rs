//! Owns the target registry and sequences build and deploy.
//!
//! The artifact directory is guarded by a read/write lock: a build holds it
//! exclusively, deploys share it. Build-then-deploy downgrades the build's
//! write guard so no other build can slip in between.

use crate::targets::default_targets;
use crate::{DeployOptions, DeploymentTarget, StatusReport};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sitedeploy_builder::{BuildOptions, SearchIndexer, SiteBuilder, clean_dir};
use sitedeploy_core::{
    ACTIVE_METHOD_KEY, BuildSettings, CancellationToken, CommandRunner, ConfigSource,
    DeployOutcome, Error, OutcomeStatus, Result, Settings, SettingsField, target_settings_path,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// What a build run should do
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    /// Empty the artifact directory first
    pub clean: bool,
    /// Run the search indexer after a successful build
    pub search_index: bool,
    pub base_url: Option<String>,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            clean: false,
            search_index: true,
            base_url: None,
        }
    }
}

/// Listing entry for a registered target
#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub configured: bool,
    pub active: bool,
    pub fields: Vec<SettingsField>,
}

pub struct DeploymentOrchestrator {
    targets: Vec<Box<dyn DeploymentTarget>>,
    /// Targets whose settings failed to parse, with the parse error. They
    /// stay unusable until `configure_target` succeeds.
    rejected: HashMap<&'static str, String>,
    config: Arc<dyn ConfigSource>,
    builder: Arc<dyn SiteBuilder>,
    indexer: Option<Arc<dyn SearchIndexer>>,
    build_settings: BuildSettings,
    artifacts: RwLock<()>,
}

impl DeploymentOrchestrator {
    /// Fails only when the `[build]` section is invalid
    pub fn new(config: Arc<dyn ConfigSource>, builder: Arc<dyn SiteBuilder>) -> Result<Self> {
        let build_settings = BuildSettings::from_config(config.as_ref())?;
        Ok(Self {
            targets: Vec::new(),
            rejected: HashMap::new(),
            config,
            builder,
            indexer: None,
            build_settings,
            artifacts: RwLock::new(()),
        })
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn SearchIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    /// Register every built-in target, configured from `deployment.<id>`
    pub fn with_default_targets(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        for target in default_targets(runner) {
            self.register(target);
        }
        self
    }

    /// Configure `target` from its settings table and add it, replacing any
    /// target already registered under the same id. Settings that fail to
    /// parse leave the target unconfigured rather than on its defaults.
    pub fn register(&mut self, mut target: Box<dyn DeploymentTarget>) {
        let id = target.id();
        self.rejected.remove(id);
        let settings = self.config.settings(&target_settings_path(id));
        if !settings.is_empty() {
            for problem in target.validate_config(&settings) {
                warn!(target_id = id, %problem, "Invalid target settings");
            }
            if let Err(e) = target.configure(&settings) {
                warn!(target_id = id, error = %e, "Target left unconfigured");
                self.rejected.insert(id, e.to_string());
            }
        }

        self.targets.retain(|t| t.id() != id);
        self.targets.push(target);
    }

    pub fn build_settings(&self) -> &BuildSettings {
        &self.build_settings
    }

    /// Directory targets deploy from
    pub fn artifact_dir(&self) -> PathBuf {
        self.build_settings.artifact_dir()
    }

    pub fn target(&self, id: &str) -> Option<&dyn DeploymentTarget> {
        self.targets
            .iter()
            .find(|t| t.id() == id)
            .map(|t| t.as_ref())
    }

    /// Configured and not rejected at registration
    pub fn is_configured(&self, id: &str) -> bool {
        !self.rejected.contains_key(id) && self.target(id).is_some_and(|t| t.is_configured())
    }

    /// Id named by `deployment.method`, if any
    pub fn active_target_id(&self) -> Option<String> {
        self.config.get_str(ACTIVE_METHOD_KEY)
    }

    /// The target named by `deployment.method`
    pub fn resolve_active_target(&self) -> Result<&dyn DeploymentTarget> {
        let id = self.active_target_id().ok_or_else(|| {
            Error::ConfigParse(format!(
                "No deployment method set; add {} to the configuration",
                ACTIVE_METHOD_KEY
            ))
        })?;
        self.target(&id).ok_or(Error::UnknownTarget(id))
    }

    pub fn targets(&self) -> Vec<TargetSummary> {
        let active = self.active_target_id();
        self.targets
            .iter()
            .map(|t| TargetSummary {
                id: t.id().to_string(),
                name: t.name().to_string(),
                description: t.description(),
                configured: self.is_configured(t.id()),
                active: active.as_deref() == Some(t.id()),
                fields: t.settings_fields(),
            })
            .collect()
    }

    /// Validate `settings` and apply them only if acceptable. Returns the
    /// problems found; empty means the settings were applied.
    pub fn configure_target(&mut self, id: &str, settings: &Settings) -> Result<Vec<String>> {
        let target = self
            .targets
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| Error::UnknownTarget(id.to_string()))?;

        let problems = target.validate_config(settings);
        if !problems.is_empty() {
            return Ok(problems);
        }
        target.configure(settings)?;
        self.rejected.remove(id);
        info!(target_id = id, "Target configured");
        Ok(Vec::new())
    }

    /// Run the site build (and search index) with the artifact lock held
    #[instrument(skip_all, fields(clean = request.clean))]
    pub async fn build(&self, request: &BuildRequest, cancel: &CancellationToken) -> DeployOutcome {
        let _guard = tokio::select! {
            guard = self.artifacts.write() => guard,
            _ = cancel.cancelled() => return DeployOutcome::failure("Build cancelled", None),
        };
        self.build_locked(request, cancel).await
    }

    async fn build_locked(&self, request: &BuildRequest, cancel: &CancellationToken) -> DeployOutcome {
        let artifact_dir = self.artifact_dir();
        if request.clean {
            match clean_dir(&artifact_dir) {
                Ok(removed) => info!(removed, dir = %artifact_dir.display(), "Cleaned build directory"),
                Err(e) => {
                    return DeployOutcome::failure(
                        format!("Failed to clean {}", artifact_dir.display()),
                        Some(e.to_string()),
                    );
                }
            }
        }

        let options = BuildOptions {
            clean: request.clean,
            base_url_override: request.base_url.clone(),
        };
        let built = self
            .builder
            .build(&self.build_settings.source_root, &options, cancel)
            .await;
        if !built.is_success() {
            return built;
        }

        let indexer = match &self.indexer {
            Some(indexer) if request.search_index && self.build_settings.search_index => indexer,
            _ => return built,
        };

        let public_dir = built
            .get("publicDir")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or(artifact_dir);
        let indexed = indexer.index(&public_dir, cancel).await;

        let output = [built.get("output"), indexed.get("output")]
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let mut data = built.data().clone();
        data.insert("output".to_string(), json!(output));
        data.insert("searchIndex".to_string(), json!(indexed.is_success()));

        if indexed.is_success() {
            DeployOutcome::success(format!("{}; search index built", built.message()))
                .with_data_map(data)
        } else {
            warn!(indexer = indexer.name(), "Search index step failed");
            DeployOutcome::failure(
                indexed.message(),
                indexed.error().map(str::to_string),
            )
            .with_data_map(data)
        }
    }

    /// Deploy to the target named by `deployment.method`
    pub async fn deploy(&self, options: &DeployOptions) -> DeployOutcome {
        match self.resolve_active_target() {
            Ok(target) => self.deploy_to(target.id(), options).await,
            Err(e) => DeployOutcome::failure(e.to_string(), None),
        }
    }

    #[instrument(skip(self, options), fields(build = options.build))]
    pub async fn deploy_to(&self, target_id: &str, options: &DeployOptions) -> DeployOutcome {
        let target = match self.ready_target(target_id) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };

        let (_guard, build_output) = match self.lock_artifacts(options).await {
            Ok(locked) => locked,
            Err(outcome) => return outcome,
        };

        let mut outcome = self.deploy_locked(target, options).await;
        if let Some(build) = build_output {
            outcome = outcome.with_data("build", build);
        }
        outcome
    }

    /// Deploy to every configured target and aggregate: any failure fails
    /// the whole, otherwise any pending keeps it pending. One read guard
    /// covers every target, so no build runs between them.
    #[instrument(skip_all, fields(build = options.build))]
    pub async fn deploy_all(&self, options: &DeployOptions) -> DeployOutcome {
        let targets: Vec<&dyn DeploymentTarget> = self
            .targets
            .iter()
            .filter(|t| self.is_configured(t.id()))
            .map(|t| t.as_ref())
            .collect();
        if targets.is_empty() {
            return DeployOutcome::failure("No configured deployment targets", None);
        }

        let (_guard, build_output) = match self.lock_artifacts(options).await {
            Ok(locked) => locked,
            Err(outcome) => return outcome,
        };

        let mut results = Map::new();
        let mut failed = Vec::new();
        let mut pending = 0;
        for target in &targets {
            let outcome = self.deploy_locked(*target, options).await;
            match outcome.status() {
                OutcomeStatus::Failure => failed.push(target.id()),
                OutcomeStatus::Pending => pending += 1,
                OutcomeStatus::Success => {}
            }
            results.insert(target.id().to_string(), serde_json::to_value(&outcome).unwrap_or(Value::Null));
        }

        let total = targets.len();
        let mut outcome = if !failed.is_empty() {
            DeployOutcome::failure(
                format!("Deploy failed for {} of {} targets", failed.len(), total),
                Some(format!("Failed: {}", failed.join(", "))),
            )
        } else if pending > 0 {
            DeployOutcome::pending(format!("Deployed to {} targets ({} pending)", total, pending))
        } else {
            DeployOutcome::success(format!("Deployed to {} targets", total))
        };
        if let Some(build) = build_output {
            outcome = outcome.with_data("build", build);
        }
        outcome.with_data("targets", Value::Object(results))
    }

    /// A registered target that may be deployed or tested
    fn ready_target(&self, target_id: &str) -> std::result::Result<&dyn DeploymentTarget, DeployOutcome> {
        let Some(target) = self.target(target_id) else {
            return Err(DeployOutcome::failure(
                Error::UnknownTarget(target_id.to_string()).to_string(),
                None,
            ));
        };
        if let Some(reason) = self.rejected.get(target_id) {
            return Err(DeployOutcome::failure(
                format!("{} is not configured", target.name()),
                Some(format!(
                    "Invalid settings under [{}]: {}",
                    target_settings_path(target_id),
                    reason
                )),
            ));
        }
        if !target.is_configured() {
            return Err(DeployOutcome::failure(
                format!("{} is not configured", target.name()),
                Some(format!("Add settings under [{}]", target_settings_path(target_id))),
            ));
        }
        Ok(target)
    }

    /// Shared artifact guard for deploying. With `options.build` the site is
    /// built under the write guard first, which is then downgraded so no
    /// other build can run before the deploys finish.
    async fn lock_artifacts(
        &self,
        options: &DeployOptions,
    ) -> std::result::Result<(RwLockReadGuard<'_, ()>, Option<String>), DeployOutcome> {
        let cancel = &options.cancel;
        if !options.build {
            return tokio::select! {
                guard = self.artifacts.read() => Ok((guard, None)),
                _ = cancel.cancelled() => Err(DeployOutcome::failure("Deploy cancelled", None)),
            };
        }

        let write = tokio::select! {
            guard = self.artifacts.write() => guard,
            _ = cancel.cancelled() => return Err(DeployOutcome::failure("Deploy cancelled", None)),
        };
        let built = self.build_locked(&BuildRequest::default(), cancel).await;
        if !built.is_success() {
            return Err(built);
        }
        Ok((write.downgrade(), Some(built.message().to_string())))
    }

    /// Caller holds the artifact guard
    async fn deploy_locked(&self, target: &dyn DeploymentTarget, options: &DeployOptions) -> DeployOutcome {
        let target_id = target.id();
        info!(target_id, "Deploying");
        let outcome = target.deploy(&self.artifact_dir(), options).await;
        info!(target_id, status = %outcome.status(), message = outcome.message(), "Deploy finished");
        outcome.with_data("target", target_id)
    }

    /// Status of the active target
    pub async fn status(&self, cancel: &CancellationToken) -> Option<StatusReport> {
        let target = self.resolve_active_target().ok()?;
        target.status(cancel).await
    }

    pub async fn status_of(&self, target_id: &str, cancel: &CancellationToken) -> Option<StatusReport> {
        self.target(target_id)?.status(cancel).await
    }

    pub async fn test_connection(&self, target_id: &str, cancel: &CancellationToken) -> DeployOutcome {
        match self.ready_target(target_id) {
            Ok(target) => target.test_connection(cancel).await,
            Err(outcome) => outcome,
        }
    }

    /// Run a deploy on a worker task. `None` deploys to the active target.
    pub fn spawn_deploy(
        self: &Arc<Self>,
        target_id: Option<String>,
        options: DeployOptions,
    ) -> JoinHandle<DeployOutcome> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            match target_id {
                Some(id) => orchestrator.deploy_to(&id, &options).await,
                None => orchestrator.deploy(&options).await,
            }
        })
    }
}
