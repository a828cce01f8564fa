//! Cloudflare Pages: ensure the project exists, open a deployment, then
//! upload the site in bounded batches.

use super::{
    DEFAULT_HTTP_TIMEOUT_SECS, TargetConfig, check_url, http_client, missing_artifact,
    non_blank, not_configured, read_json, transport_failure, trigger_hook, validate,
};
use crate::archive::{self, SiteFile};
use crate::error::TransportError;
use crate::{DeployOptions, DeploymentTarget, StatusReport, http};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use sitedeploy_core::settings::typed_settings;
use sitedeploy_core::{CancellationToken, DeployOutcome, FieldType, Result, Settings, SettingsField};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    pub api_token: Option<String>,
    pub account_id: Option<String>,
    pub project_name: Option<String>,
    pub branch: String,
    /// Files per upload request
    pub batch_size: usize,
    /// Create the Pages project on first deploy if it does not exist
    pub create_project: bool,
    pub deploy_hook: Option<String>,
    pub api_base: String,
    pub timeout_secs: u64,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            account_id: None,
            project_name: None,
            branch: "main".to_string(),
            batch_size: 50,
            create_project: true,
            deploy_hook: None,
            api_base: CLOUDFLARE_API.to_string(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl TargetConfig for CloudflareConfig {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.api().is_none() && non_blank(&self.deploy_hook).is_none() {
            problems.push(
                "API token, account ID and project name are required unless a deploy hook is set"
                    .to_string(),
            );
        }
        check_url(&mut problems, "Deploy hook", &self.deploy_hook);
        if self.batch_size == 0 {
            problems.push("Batch size must be at least 1".to_string());
        }
        if self.branch.trim().is_empty() {
            problems.push("Branch is required".to_string());
        }
        problems
    }
}

/// Credentials and names needed for API calls
struct Api<'a> {
    token: &'a str,
    account_id: &'a str,
    project: &'a str,
}

impl CloudflareConfig {
    fn api(&self) -> Option<Api<'_>> {
        Some(Api {
            token: non_blank(&self.api_token)?,
            account_id: non_blank(&self.account_id)?,
            project: non_blank(&self.project_name)?,
        })
    }

    fn projects_url(&self, account_id: &str) -> String {
        http::endpoint(&self.api_base, &format!("accounts/{}/pages/projects", account_id))
    }

    fn project_url(&self, api: &Api<'_>) -> String {
        format!("{}/{}", self.projects_url(api.account_id), api.project)
    }
}

/// Cloudflare API response wrapper
#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    code: i32,
    message: String,
}

impl<T> CloudflareResponse<T> {
    fn into_result(self) -> std::result::Result<T, TransportError> {
        if !self.success {
            let message = match self.errors.first() {
                Some(error) => format!("Cloudflare API error {}: {}", error.code, error.message),
                None => "Unknown Cloudflare API error".to_string(),
            };
            return Err(TransportError::InvalidResponse(message));
        }
        self.result
            .ok_or_else(|| TransportError::InvalidResponse("No result returned from API".to_string()))
    }
}

/// Pages project info from API
#[derive(Debug, Deserialize)]
struct PagesProject {
    name: String,
    #[serde(default)]
    subdomain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PagesDeployment {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    created_on: Option<String>,
    #[serde(default)]
    latest_stage: Option<Stage>,
}

#[derive(Debug, Deserialize)]
struct Stage {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// One upload batch body
fn batch_payload(files: &[SiteFile]) -> Value {
    Value::Array(
        files
            .iter()
            .map(|f| {
                json!({
                    "key": f.path,
                    "value": STANDARD.encode(&f.bytes),
                    "metadata": { "contentType": f.content_type() },
                    "base64": true,
                })
            })
            .collect(),
    )
}

/// Stable digest of the uploaded file set, for comparing deployments
fn site_digest(files: &[SiteFile]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update([0]);
        hasher.update(&file.bytes);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

async fn send_envelope<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> std::result::Result<T, TransportError> {
    http::send_json::<CloudflareResponse<T>>(request, cancel)
        .await?
        .into_result()
}

/// Counts from the batch upload phase
#[derive(Debug, Default)]
struct UploadReport {
    uploaded: usize,
    failed: usize,
    total: usize,
    first_error: Option<String>,
}

#[derive(Default)]
pub struct CloudflareTarget {
    config: CloudflareConfig,
}

impl CloudflareTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &CloudflareConfig {
        &self.config
    }

    /// Get Pages project by name; `None` on 404
    async fn get_project(
        &self,
        client: &Client,
        api: &Api<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<PagesProject>, TransportError> {
        let request = client.get(self.config.project_url(api)).bearer_auth(api.token);
        match send_envelope::<PagesProject>(request, cancel).await {
            Ok(project) => Ok(Some(project)),
            Err(TransportError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_project(
        &self,
        client: &Client,
        api: &Api<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<PagesProject, TransportError> {
        #[derive(Serialize)]
        struct CreateProjectRequest<'a> {
            name: &'a str,
            production_branch: &'a str,
        }

        let request = client
            .post(self.config.projects_url(api.account_id))
            .bearer_auth(api.token)
            .json(&CreateProjectRequest {
                name: api.project,
                production_branch: &self.config.branch,
            });
        send_envelope(request, cancel).await
    }

    async fn ensure_project(
        &self,
        client: &Client,
        api: &Api<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<PagesProject, DeployOutcome> {
        match self.get_project(client, api, cancel).await {
            Ok(Some(project)) => Ok(project),
            Ok(None) if self.config.create_project => {
                info!(project = api.project, "Creating Pages project");
                self.create_project(client, api, cancel)
                    .await
                    .map_err(|e| transport_failure("Failed to create Pages project", &e))
            }
            Ok(None) => Err(DeployOutcome::failure(
                format!("Pages project '{}' does not exist", api.project),
                Some("Create it in the dashboard or enable create_project".to_string()),
            )),
            Err(e) => Err(transport_failure("Failed to look up Pages project", &e)),
        }
    }

    async fn create_deployment(
        &self,
        client: &Client,
        api: &Api<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<PagesDeployment, TransportError> {
        let form = reqwest::multipart::Form::new().text("branch", self.config.branch.clone());
        let request = client
            .post(format!("{}/deployments", self.config.project_url(api)))
            .bearer_auth(api.token)
            .multipart(form);
        send_envelope(request, cancel).await
    }

    /// Upload every batch. Batches are independent, so a failed batch does
    /// not stop the rest; cancellation does.
    async fn upload_batches(
        &self,
        client: &Client,
        api: &Api<'_>,
        deployment_id: &str,
        files: &[SiteFile],
        cancel: &CancellationToken,
    ) -> UploadReport {
        let url = format!(
            "{}/deployments/{}/files",
            self.config.project_url(api),
            deployment_id
        );
        let mut report = UploadReport {
            total: files.len().div_ceil(self.config.batch_size),
            ..Default::default()
        };

        for (index, batch) in files.chunks(self.config.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.first_error.get_or_insert_with(|| TransportError::Cancelled.to_string());
                break;
            }
            let request = client
                .post(&url)
                .bearer_auth(api.token)
                .json(&batch_payload(batch));
            match send_envelope::<Value>(request, cancel).await {
                Ok(_) => {
                    report.uploaded += 1;
                    debug!(batch = index + 1, of = report.total, "Batch uploaded");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(batch = index + 1, error = %e, "Batch upload failed");
                    report.first_error.get_or_insert_with(|| e.diagnostic());
                }
            }
        }
        report
    }

    async fn deploy_api(
        &self,
        api: Api<'_>,
        source_dir: &Path,
        cancel: &CancellationToken,
    ) -> DeployOutcome {
        let files = match archive::collect_files(source_dir) {
            Ok(files) => files,
            Err(e) => return DeployOutcome::failure("Failed to read build directory", Some(e.to_string())),
        };
        let client = match http_client(self.config.timeout_secs) {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };

        let project = match self.ensure_project(&client, &api, cancel).await {
            Ok(project) => project,
            Err(outcome) => return outcome,
        };

        let deployment = match self.create_deployment(&client, &api, cancel).await {
            Ok(deployment) => deployment,
            Err(e) => return transport_failure("Failed to create Pages deployment", &e),
        };
        info!(deployment = %deployment.id, files = files.len(), "Uploading to Pages");

        let report = self
            .upload_batches(&client, &api, &deployment.id, &files, cancel)
            .await;

        let url = deployment.url.clone().or_else(|| {
            project
                .subdomain
                .as_ref()
                .map(|subdomain| format!("https://{}", subdomain))
        });
        let mut data = serde_json::Map::new();
        data.insert("id".into(), json!(deployment.id));
        data.insert("project".into(), json!(project.name));
        data.insert("files".into(), json!(files.len()));
        data.insert("batches_total".into(), json!(report.total));
        data.insert("batches_uploaded".into(), json!(report.uploaded));
        data.insert("batches_failed".into(), json!(report.failed));
        data.insert("digest".into(), json!(site_digest(&files)));
        if let Some(url) = url {
            data.insert("url".into(), json!(url));
        }

        // Partial uploads leave a broken site, so anything short of every
        // batch is a failure
        if report.uploaded == report.total {
            DeployOutcome::success(format!(
                "Deployed {} file(s) to Cloudflare Pages",
                files.len()
            ))
            .with_data_map(data)
        } else {
            DeployOutcome::failure(
                format!(
                    "Uploaded {} of {} batches to Cloudflare Pages",
                    report.uploaded, report.total
                ),
                report.first_error,
            )
            .with_data_map(data)
        }
    }
}

#[async_trait]
impl DeploymentTarget for CloudflareTarget {
    fn id(&self) -> &'static str {
        "cloudflare"
    }

    fn name(&self) -> &'static str {
        "Cloudflare Pages"
    }

    fn description(&self) -> String {
        match self.config.api() {
            Some(api) => format!(
                "Upload the site to Cloudflare Pages project '{}' on branch {}",
                api.project, self.config.branch
            ),
            None => "Trigger a Cloudflare Pages deploy hook".to_string(),
        }
    }

    fn settings_fields(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::new("api_token", FieldType::Password, "API token")
                .help("Token with Cloudflare Pages edit permission; required unless deploy_hook is set"),
            SettingsField::new("account_id", FieldType::Text, "Account ID")
                .help("Required unless deploy_hook is set"),
            SettingsField::new("project_name", FieldType::Text, "Project name")
                .help("Required unless deploy_hook is set"),
            SettingsField::new("branch", FieldType::Text, "Branch").default_value("main"),
            SettingsField::new("batch_size", FieldType::Number, "Files per upload batch")
                .default_value(50),
            SettingsField::new("create_project", FieldType::Checkbox, "Create project if missing")
                .default_value(true),
            SettingsField::new("deploy_hook", FieldType::Url, "Deploy hook URL")
                .help("Used instead of the API when no token is set"),
            SettingsField::new("api_base", FieldType::Url, "API base URL").default_value(CLOUDFLARE_API),
            SettingsField::new("timeout_secs", FieldType::Number, "Request timeout (seconds)")
                .default_value(DEFAULT_HTTP_TIMEOUT_SECS),
        ]
    }

    fn is_configured(&self) -> bool {
        self.config.problems().is_empty()
    }

    fn validate_config(&self, candidate: &Settings) -> Vec<String> {
        validate::<CloudflareConfig>(candidate)
    }

    fn configure(&mut self, settings: &Settings) -> Result<()> {
        self.config = typed_settings(settings)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = "cloudflare"))]
    async fn deploy(&self, source_dir: &Path, options: &DeployOptions) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }

        if let Some(api) = self.config.api() {
            if let Some(outcome) = missing_artifact(source_dir) {
                return outcome;
            }
            return self.deploy_api(api, source_dir, &options.cancel).await;
        }

        match non_blank(&self.config.deploy_hook) {
            Some(hook) => trigger_hook(self.name(), hook, self.config.timeout_secs, &options.cancel).await,
            None => not_configured(self.name(), &problems),
        }
    }

    async fn status(&self, cancel: &CancellationToken) -> Option<StatusReport> {
        if !self.is_configured() {
            return Some(StatusReport::unconfigured(self.id()));
        }
        let Some(api) = self.config.api() else {
            return Some(StatusReport::new(self.id(), "unknown").with("mode", "hook"));
        };

        let client = http_client(self.config.timeout_secs).ok()?;
        let url = format!("{}/deployments?per_page=1", self.config.project_url(&api));
        let response: CloudflareResponse<Vec<PagesDeployment>> =
            match read_json("cloudflare status", &client, &url, api.token, cancel).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Failed to read Pages deployments");
                    return None;
                }
            };
        let deployments = match response.into_result() {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(error = %e, "Pages deployments request was rejected");
                return None;
            }
        };

        let Some(latest) = deployments.into_iter().next() else {
            return Some(StatusReport::new(self.id(), "none"));
        };
        let state = latest
            .latest_stage
            .as_ref()
            .map(|stage| {
                format!(
                    "{}:{}",
                    stage.name.as_deref().unwrap_or("unknown"),
                    stage.status.as_deref().unwrap_or("unknown")
                )
            })
            .unwrap_or_else(|| "unknown".to_string());
        Some(
            StatusReport::new(self.id(), state)
                .with("id", latest.id.as_str())
                .with("url", latest.url.clone())
                .with("environment", latest.environment.clone())
                .with("created_on", latest.created_on.clone()),
        )
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }
        let Some(api) = self.config.api() else {
            return DeployOutcome::success(
                "Deploy hook is set; it cannot be verified without triggering a build",
            )
            .with_data("verified", false);
        };

        let client = match http_client(self.config.timeout_secs) {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };
        let url = self.config.project_url(&api);
        let response = read_json::<CloudflareResponse<PagesProject>>(
            "cloudflare project",
            &client,
            &url,
            api.token,
            cancel,
        )
        .await
        .and_then(CloudflareResponse::into_result);

        match response {
            Ok(project) => DeployOutcome::success(format!("Connected to Pages project '{}'", project.name))
                .with_data("verified", true),
            Err(TransportError::Status { status: 404, .. }) if self.config.create_project => {
                DeployOutcome::success(format!(
                    "Credentials accepted; project '{}' will be created on first deploy",
                    api.project
                ))
                .with_data("verified", true)
            }
            Err(e) => transport_failure("Cannot reach Cloudflare Pages project", &e),
        }
    }
}
