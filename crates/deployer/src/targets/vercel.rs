//! Vercel: inline file-array deployment, or a deploy hook

use super::{
    DEFAULT_HTTP_TIMEOUT_SECS, TargetConfig, check_url, http_client, missing_artifact,
    non_blank, not_configured, read_json, transport_failure, trigger_hook, validate,
};
use crate::archive::{self, SiteFile};
use crate::{DeployOptions, DeploymentTarget, StatusReport, http};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sitedeploy_core::settings::typed_settings;
use sitedeploy_core::{CancellationToken, DeployOutcome, FieldType, Result, Settings, SettingsField};
use std::path::Path;
use tracing::{info, instrument, warn};

const VERCEL_API: &str = "https://api.vercel.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VercelConfig {
    pub api_token: Option<String>,
    /// Project name or id
    pub project: Option<String>,
    pub team_id: Option<String>,
    /// Deploy to production rather than a preview URL
    pub production: bool,
    pub deploy_hook: Option<String>,
    pub api_base: String,
    pub timeout_secs: u64,
}

impl Default for VercelConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            project: None,
            team_id: None,
            production: true,
            deploy_hook: None,
            api_base: VERCEL_API.to_string(),
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl TargetConfig for VercelConfig {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.api().is_none() && non_blank(&self.deploy_hook).is_none() {
            problems.push("Either a deploy hook or an API token and project are required".to_string());
        }
        check_url(&mut problems, "Deploy hook", &self.deploy_hook);
        problems
    }
}

impl VercelConfig {
    fn api(&self) -> Option<(&str, &str)> {
        Some((non_blank(&self.api_token)?, non_blank(&self.project)?))
    }

    /// `teamId` query parameter, joined with `sep`
    fn team_query(&self, sep: char) -> String {
        non_blank(&self.team_id)
            .map(|team| format!("{}teamId={}", sep, team))
            .unwrap_or_default()
    }
}

/// Deployment creation payload with every file inlined as base64
fn deployment_body(project: &str, production: bool, files: &[SiteFile]) -> Value {
    let files: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({
                "file": f.path,
                "data": STANDARD.encode(&f.bytes),
                "encoding": "base64",
            })
        })
        .collect();
    let mut body = json!({
        "name": project,
        "files": files,
        "projectSettings": { "framework": null },
    });
    if production {
        body["target"] = json!("production");
    }
    body
}

fn https(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

#[derive(Debug, Deserialize)]
struct CreatedDeployment {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "readyState")]
    ready_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentList {
    #[serde(default)]
    deployments: Vec<ListedDeployment>,
}

#[derive(Debug, Deserialize)]
struct ListedDeployment {
    uid: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    state: Option<String>,
    /// Milliseconds since the epoch
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct VercelProject {
    id: String,
    name: String,
}

#[derive(Default)]
pub struct VercelTarget {
    config: VercelConfig,
}

impl VercelTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &VercelConfig {
        &self.config
    }

    async fn upload(
        &self,
        token: &str,
        project: &str,
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

        info!(files = files.len(), production = self.config.production, "Creating Vercel deployment");
        let url = http::endpoint(
            &self.config.api_base,
            &format!("v13/deployments{}", self.config.team_query('?')),
        );
        let request = client
            .post(url)
            .bearer_auth(token)
            .json(&deployment_body(project, self.config.production, &files));

        match http::send_json::<CreatedDeployment>(request, cancel).await {
            Ok(deployment) => {
                let mut outcome = DeployOutcome::success("Deployment created on Vercel")
                    .with_data("mode", "api")
                    .with_data("id", deployment.id)
                    .with_data("files", files.len());
                if let Some(url) = deployment.url {
                    outcome = outcome.with_data("url", https(&url));
                }
                if let Some(state) = deployment.ready_state {
                    outcome = outcome.with_data("state", state);
                }
                outcome
            }
            Err(e) => transport_failure("Vercel deployment failed", &e),
        }
    }
}

#[async_trait]
impl DeploymentTarget for VercelTarget {
    fn id(&self) -> &'static str {
        "vercel"
    }

    fn name(&self) -> &'static str {
        "Vercel"
    }

    fn description(&self) -> String {
        match (self.config.api(), self.config.production) {
            (Some(_), true) => "Upload the built site to Vercel as a new production deployment".to_string(),
            (Some(_), false) => "Upload the built site to Vercel as a preview deployment".to_string(),
            (None, _) => "Trigger a Vercel deploy hook; Vercel builds and publishes the site".to_string(),
        }
    }

    fn settings_fields(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::new("api_token", FieldType::Password, "API token"),
            SettingsField::new("project", FieldType::Text, "Project").help("Project name or id"),
            SettingsField::new("team_id", FieldType::Text, "Team ID"),
            SettingsField::new("production", FieldType::Checkbox, "Production deployment")
                .default_value(true),
            SettingsField::new("deploy_hook", FieldType::Url, "Deploy hook URL")
                .help("Used when no API token is set"),
            SettingsField::new("api_base", FieldType::Url, "API base URL").default_value(VERCEL_API),
            SettingsField::new("timeout_secs", FieldType::Number, "Upload timeout (seconds)")
                .default_value(DEFAULT_HTTP_TIMEOUT_SECS),
        ]
    }

    fn is_configured(&self) -> bool {
        self.config.problems().is_empty()
    }

    fn validate_config(&self, candidate: &Settings) -> Vec<String> {
        validate::<VercelConfig>(candidate)
    }

    fn configure(&mut self, settings: &Settings) -> Result<()> {
        self.config = typed_settings(settings)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = "vercel"))]
    async fn deploy(&self, source_dir: &Path, options: &DeployOptions) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }

        if let Some((token, project)) = self.config.api() {
            if let Some(outcome) = missing_artifact(source_dir) {
                return outcome;
            }
            return self.upload(token, project, source_dir, &options.cancel).await;
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
        let Some((token, project)) = self.config.api() else {
            return Some(StatusReport::new(self.id(), "unknown").with("mode", "hook"));
        };

        let client = http_client(self.config.timeout_secs).ok()?;
        let url = http::endpoint(
            &self.config.api_base,
            &format!(
                "v6/deployments?projectId={}&limit=1{}",
                project,
                self.config.team_query('&')
            ),
        );
        let list: DeploymentList = match read_json("vercel status", &client, &url, token, cancel).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Failed to read Vercel deployments");
                return None;
            }
        };

        let Some(latest) = list.deployments.into_iter().next() else {
            return Some(StatusReport::new(self.id(), "none"));
        };
        let created_at = latest
            .created
            .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
            .map(|t| t.to_rfc3339());
        Some(
            StatusReport::new(
                self.id(),
                latest.state.map(|s| s.to_lowercase()).unwrap_or_else(|| "unknown".to_string()),
            )
            .with("id", latest.uid)
            .with("url", latest.url.as_deref().map(https))
            .with("created_at", created_at),
        )
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }
        let Some((token, project)) = self.config.api() else {
            return DeployOutcome::success(
                "Deploy hook is set; it cannot be verified without triggering a build",
            )
            .with_data("verified", false);
        };

        let client = match http_client(self.config.timeout_secs) {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };
        let url = http::endpoint(
            &self.config.api_base,
            &format!("v9/projects/{}{}", project, self.config.team_query('?')),
        );
        match read_json::<VercelProject>("vercel project", &client, &url, token, cancel).await {
            Ok(project) => DeployOutcome::success(format!("Connected to Vercel project '{}'", project.name))
                .with_data("verified", true)
                .with_data("project_id", project.id),
            Err(e) => transport_failure("Cannot reach Vercel project", &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(value: Value) -> Settings {
        value.as_object().cloned().unwrap_or_default()
    }

    fn target(value: Value) -> VercelTarget {
        let mut target = VercelTarget::new();
        target.configure(&settings(value)).unwrap();
        target
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("index.html"), "hi").unwrap();
        fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        dir
    }

    #[test]
    fn test_deployment_body_shape() {
        let files = vec![SiteFile {
            path: "index.html".into(),
            bytes: b"hi".to_vec(),
        }];
        let body = deployment_body("my-site", true, &files);
        assert_eq!(body["name"], "my-site");
        assert_eq!(body["target"], "production");
        assert_eq!(body["files"][0]["file"], "index.html");
        assert_eq!(body["files"][0]["data"], "aGk=");
        assert_eq!(body["files"][0]["encoding"], "base64");
        assert!(body["projectSettings"]["framework"].is_null());

        let preview = deployment_body("my-site", false, &files);
        assert!(preview.get("target").is_none());
    }

    #[test]
    fn test_validate_round_trip() {
        let candidate = settings(json!({ "api_token": "t", "project": "my-site" }));
        let mut target = VercelTarget::new();
        assert!(target.validate_config(&candidate).is_empty());
        target.configure(&candidate).unwrap();
        assert!(target.is_configured());
        assert!(!VercelTarget::new().is_configured());
    }

    #[tokio::test]
    async fn test_file_array_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v13/deployments"))
            .and(query_param("teamId", "team_1"))
            .and(header("authorization", "Bearer vc_token"))
            .and(body_partial_json(json!({
                "name": "my-site",
                "target": "production",
                "files": [
                    { "file": "css/site.css", "encoding": "base64" },
                    { "file": "index.html", "data": "aGk=", "encoding": "base64" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "dpl_123",
                "url": "my-site-abc.vercel.app",
                "readyState": "QUEUED",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let target = target(json!({
            "api_token": "vc_token",
            "project": "my-site",
            "team_id": "team_1",
            "api_base": server.uri(),
        }));
        let dir = site();
        let outcome = target.deploy(dir.path(), &DeployOptions::default()).await;
        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.get("id"), Some(&json!("dpl_123")));
        assert_eq!(outcome.get("url"), Some(&json!("https://my-site-abc.vercel.app")));
        assert_eq!(outcome.get("files"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_upload_error_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v13/deployments"))
            .respond_with(ResponseTemplate::new(403).set_body_string("{\"error\":{\"code\":\"forbidden\"}}"))
            .mount(&server)
            .await;

        let target = target(json!({ "api_token": "t", "project": "p", "api_base": server.uri() }));
        let dir = site();
        let outcome = target.deploy(dir.path(), &DeployOptions::default()).await;
        assert!(outcome.is_failure());
        assert!(outcome.error().unwrap().contains("forbidden"));
    }

    #[tokio::test]
    async fn test_hook_is_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "job": { "id": "j1" } })))
            .expect(1)
            .mount(&server)
            .await;

        let target = target(json!({ "deploy_hook": format!("{}/v1/integrations/deploy/prj/abc", server.uri()) }));
        let dir = site();
        let outcome = target.deploy(dir.path(), &DeployOptions::default()).await;
        assert!(outcome.is_pending());
    }

    #[tokio::test]
    async fn test_status_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v6/deployments"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v6/deployments"))
            .and(query_param("projectId", "my-site"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "deployments": [{
                    "uid": "dpl_9",
                    "url": "my-site-xyz.vercel.app",
                    "state": "READY",
                    "created": 1710000000000i64,
                }]
            })))
            .mount(&server)
            .await;

        let target = target(json!({ "api_token": "t", "project": "my-site", "api_base": server.uri() }));
        let report = target.status(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.state, "ready");
        assert_eq!(report.details["id"], "dpl_9");
        assert_eq!(report.details["url"], "https://my-site-xyz.vercel.app");
        assert!(report.details.contains_key("created_at"));
    }

    #[tokio::test]
    async fn test_status_gives_up_on_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let target = target(json!({ "api_token": "t", "project": "my-site", "api_base": server.uri() }));
        assert!(target.status(&CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_connection_reads_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v9/projects/my-site"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "prj_1", "name": "my-site" })))
            .expect(1)
            .mount(&server)
            .await;

        let target = target(json!({ "api_token": "t", "project": "my-site", "api_base": server.uri() }));
        let outcome = target.test_connection(&CancellationToken::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.get("project_id"), Some(&json!("prj_1")));
    }
}
