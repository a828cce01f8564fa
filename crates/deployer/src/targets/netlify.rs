//! Netlify: zip upload through the API, or a build hook for sites that
//! build on Netlify's side.

use super::{
    DEFAULT_HTTP_TIMEOUT_SECS, TargetConfig, check_url, http_client, missing_artifact,
    non_blank, not_configured, read_json, transport_failure, trigger_hook, validate,
};
use crate::{DeployOptions, DeploymentTarget, StatusReport, archive, http};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sitedeploy_core::settings::typed_settings;
use sitedeploy_core::{
    CancellationToken, DeployOutcome, FieldType, Result, Settings, SettingsField,
};
use std::path::Path;
use tracing::{info, instrument, warn};

const NETLIFY_API: &str = "https://api.netlify.com/api/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetlifyConfig {
    pub deploy_hook: Option<String>,
    pub api_token: Option<String>,
    pub site_id: Option<String>,
    pub api_base: String,
    pub timeout_secs: u64,
}

impl Default for NetlifyConfig {
    fn default() -> Self {
        Self {
            deploy_hook: None,
            api_token: None,
            site_id: None,
            api_base: NETLIFY_API.to_string(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl TargetConfig for NetlifyConfig {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.api().is_none() && non_blank(&self.deploy_hook).is_none() {
            problems.push("Either a deploy hook or an API token and site ID are required".to_string());
        }
        check_url(&mut problems, "Deploy hook", &self.deploy_hook);
        problems
    }
}

impl NetlifyConfig {
    /// Token and site id, when the API can be used
    fn api(&self) -> Option<(&str, &str)> {
        Some((non_blank(&self.api_token)?, non_blank(&self.site_id)?))
    }
}

/// The parts of a Netlify deploy object we report
#[derive(Debug, Deserialize)]
struct NetlifyDeploy {
    id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    ssl_url: Option<String>,
    #[serde(default)]
    deploy_ssl_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
}

impl NetlifyDeploy {
    fn best_url(&self) -> Option<&str> {
        self.ssl_url
            .as_deref()
            .or(self.deploy_ssl_url.as_deref())
            .or(self.url.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct NetlifySite {
    name: String,
    #[serde(default)]
    ssl_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Default)]
pub struct NetlifyTarget {
    config: NetlifyConfig,
}

impl NetlifyTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &NetlifyConfig {
        &self.config
    }

    async fn upload(
        &self,
        token: &str,
        site_id: &str,
        source_dir: &Path,
        cancel: &CancellationToken,
    ) -> DeployOutcome {
        let zip = match archive::zip_dir(source_dir) {
            Ok(bytes) => bytes,
            Err(e) => return DeployOutcome::failure("Failed to package site", Some(e.to_string())),
        };
        let client = match http_client(self.config.timeout_secs) {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };

        info!(bytes = zip.len(), "Uploading site archive to Netlify");
        let url = http::endpoint(&self.config.api_base, &format!("sites/{}/deploys", site_id));
        let request = client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/zip")
            .body(zip);

        match http::send_json::<NetlifyDeploy>(request, cancel).await {
            Ok(deploy) => {
                let mut outcome = DeployOutcome::success("Deployed to Netlify")
                    .with_data("mode", "api")
                    .with_data("id", deploy.id.clone());
                if let Some(url) = deploy.best_url() {
                    outcome = outcome.with_data("url", url);
                }
                if let Some(state) = deploy.state {
                    outcome = outcome.with_data("state", state);
                }
                outcome
            }
            Err(e) => transport_failure("Netlify upload failed", &e),
        }
    }
}

#[async_trait]
impl DeploymentTarget for NetlifyTarget {
    fn id(&self) -> &'static str {
        "netlify"
    }

    fn name(&self) -> &'static str {
        "Netlify"
    }

    fn description(&self) -> String {
        if self.config.api().is_some() {
            "Upload the built site to Netlify as a zip; replaces the published deploy".to_string()
        } else {
            "Trigger a Netlify build hook; Netlify builds and publishes the site".to_string()
        }
    }

    fn settings_fields(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::new("deploy_hook", FieldType::Url, "Build hook URL")
                .help("Used when no API token is set"),
            SettingsField::new("api_token", FieldType::Password, "Personal access token"),
            SettingsField::new("site_id", FieldType::Text, "Site ID"),
            SettingsField::new("api_base", FieldType::Url, "API base URL").default_value(NETLIFY_API),
            SettingsField::new("timeout_secs", FieldType::Number, "Upload timeout (seconds)")
                .default_value(DEFAULT_HTTP_TIMEOUT_SECS),
        ]
    }

    fn is_configured(&self) -> bool {
        self.config.problems().is_empty()
    }

    fn validate_config(&self, candidate: &Settings) -> Vec<String> {
        validate::<NetlifyConfig>(candidate)
    }

    fn configure(&mut self, settings: &Settings) -> Result<()> {
        self.config = typed_settings(settings)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = "netlify"))]
    async fn deploy(&self, source_dir: &Path, options: &DeployOptions) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }

        if let Some((token, site_id)) = self.config.api() {
            if let Some(outcome) = missing_artifact(source_dir) {
                return outcome;
            }
            return self.upload(token, site_id, source_dir, &options.cancel).await;
        }

        match non_blank(&self.config.deploy_hook) {
            Some(hook) => {
                info!("Triggering Netlify build hook");
                trigger_hook(self.name(), hook, self.config.timeout_secs, &options.cancel).await
            }
            None => not_configured(self.name(), &problems),
        }
    }

    async fn status(&self, cancel: &CancellationToken) -> Option<StatusReport> {
        if !self.is_configured() {
            return Some(StatusReport::unconfigured(self.id()));
        }
        let Some((token, site_id)) = self.config.api() else {
            return Some(StatusReport::new(self.id(), "unknown").with("mode", "hook"));
        };

        let client = http_client(self.config.timeout_secs).ok()?;
        let url = http::endpoint(
            &self.config.api_base,
            &format!("sites/{}/deploys?per_page=1", site_id),
        );
        let deploys: Vec<NetlifyDeploy> = match read_json("netlify status", &client, &url, token, cancel).await {
            Ok(deploys) => deploys,
            Err(e) => {
                warn!(error = %e, "Failed to read Netlify deploys");
                return None;
            }
        };

        let Some(latest) = deploys.into_iter().next() else {
            return Some(StatusReport::new(self.id(), "none"));
        };
        Some(
            StatusReport::new(self.id(), latest.state.clone().unwrap_or_else(|| "unknown".to_string()))
                .with("id", latest.id.as_str())
                .with("url", latest.best_url())
                .with("created_at", latest.created_at.clone())
                .with("published_at", latest.published_at.clone()),
        )
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }
        let Some((token, site_id)) = self.config.api() else {
            return DeployOutcome::success(
                "Build hook is set; it cannot be verified without triggering a build",
            )
            .with_data("verified", false);
        };

        let client = match http_client(self.config.timeout_secs) {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };
        let url = http::endpoint(&self.config.api_base, &format!("sites/{}", site_id));
        match read_json::<NetlifySite>("netlify site", &client, &url, token, cancel).await {
            Ok(site) => {
                let mut outcome = DeployOutcome::success(format!("Connected to Netlify site '{}'", site.name))
                    .with_data("verified", true);
                if let Some(url) = site.ssl_url.or(site.url) {
                    outcome = outcome.with_data("url", url);
                }
                outcome
            }
            Err(e) => transport_failure("Cannot reach Netlify site", &e),
        }
    }
}
