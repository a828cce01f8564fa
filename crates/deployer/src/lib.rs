// Deployment targets (git, rsync, s3, Netlify, Vercel, Cloudflare Pages)
// and the orchestrator that builds and ships the site through them

pub mod archive;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod targets;

pub use error::TransportError;
pub use orchestrator::{BuildRequest, DeploymentOrchestrator, TargetSummary};
pub use targets::{
    CloudflareTarget, GitTarget, NetlifyTarget, RsyncTarget, S3Target, VercelTarget,
    default_targets,
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sitedeploy_core::{
    CancellationToken, DeployOutcome, OutcomeData, Result, Settings, SettingsField,
};
use std::path::Path;

/// Per-call deploy options
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Overrides the target's commit/deploy message template
    pub message: Option<String>,
    /// Run the site build before deploying (orchestrator only)
    pub build: bool,
    /// Aborts in-flight commands and HTTP requests
    pub cancel: CancellationToken,
}

/// Best-effort snapshot of a target's remote state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub target: String,
    pub configured: bool,
    /// Backend-reported state ("ready", "building", "clean", ...)
    pub state: String,
    #[serde(skip_serializing_if = "OutcomeData::is_empty")]
    pub details: OutcomeData,
}

impl StatusReport {
    pub fn new(target: &str, state: impl Into<String>) -> Self {
        Self {
            target: target.to_string(),
            configured: true,
            state: state.into(),
            details: OutcomeData::new(),
        }
    }

    /// Sentinel for targets without enough settings to query anything
    pub fn unconfigured(target: &str) -> Self {
        Self {
            target: target.to_string(),
            configured: false,
            state: "unconfigured".to_string(),
            details: OutcomeData::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.details.insert(key.to_string(), value);
        }
        self
    }
}

/// A hosting backend the built site can be shipped to.
///
/// Configuration is local and typed per target: `is_configured` and
/// `validate_config` never touch the network or spawn processes. `deploy`,
/// `status` and `test_connection` report problems through their return
/// values instead of erroring.
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    /// Human description, including any destructive remote behaviour
    fn description(&self) -> String;

    /// Settings form schema
    fn settings_fields(&self) -> Vec<SettingsField>;

    fn is_configured(&self) -> bool;

    /// Problems with a proposed configuration; empty means acceptable
    fn validate_config(&self, candidate: &Settings) -> Vec<String>;

    /// Replace the held configuration, merging `settings` over defaults
    fn configure(&mut self, settings: &Settings) -> Result<()>;

    async fn deploy(&self, source_dir: &Path, options: &DeployOptions) -> DeployOutcome;

    /// `None` when the remote state could not be read
    async fn status(&self, cancel: &CancellationToken) -> Option<StatusReport>;

    /// Reachability and credential check; never mutates remote state
    async fn test_connection(&self, cancel: &CancellationToken) -> DeployOutcome;
}
