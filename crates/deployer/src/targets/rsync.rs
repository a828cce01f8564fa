//! Mirror the build directory to a server over SSH with rsync

use super::{
    CONNECT_TEST_TIMEOUT, DEFAULT_TRANSFER_TIMEOUT_SECS, TargetConfig, missing_artifact,
    non_blank, not_configured, process_failure, validate,
};
use crate::{DeployOptions, DeploymentTarget, StatusReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sitedeploy_core::settings::{require, typed_settings};
use sitedeploy_core::{
    CancellationToken, CommandRunner, CommandSpec, DeployOutcome, FieldType, Result, Settings,
    SettingsField,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Lines of rsync output kept on failure
const FAILURE_TAIL_LINES: usize = 20;

/// Lines of rsync output held in memory; the `--stats` block comes last
const CAPTURED_LINES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsyncConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub path: Option<String>,
    pub port: u16,
    pub key_file: Option<String>,
    /// Remove remote files that no longer exist locally
    pub delete: bool,
    pub exclude: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            path: None,
            port: 22,
            key_file: None,
            delete: false,
            exclude: vec![".git".to_string(), ".DS_Store".to_string()],
            timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
        }
    }
}

impl TargetConfig for RsyncConfig {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        require(
            &mut problems,
            &[
                ("Host", &self.host),
                ("User", &self.user),
                ("Remote path", &self.path),
            ],
        );
        if self.port == 0 {
            problems.push("Port must be between 1 and 65535".to_string());
        }
        if let Some(key) = non_blank(&self.key_file)
            && key.contains('\'')
            && key.contains('"')
        {
            problems.push("Key file path cannot contain both kinds of quote".to_string());
        }
        problems
    }
}

impl RsyncConfig {
    fn destination(&self) -> String {
        format!(
            "{}@{}:{}",
            non_blank(&self.user).unwrap_or_default(),
            non_blank(&self.host).unwrap_or_default(),
            non_blank(&self.path).unwrap_or_default()
        )
    }

    /// ssh arguments shared by the transfer and the connection test
    fn ssh_options(&self) -> Vec<String> {
        let mut options = vec!["-p".to_string(), self.port.to_string()];
        if let Some(key) = non_blank(&self.key_file) {
            options.push("-i".to_string());
            options.push(key.to_string());
        }
        options.extend(
            ["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]
                .iter()
                .map(|s| s.to_string()),
        );
        options
    }

    /// Remote shell handed to rsync via `-e`. rsync splits it on spaces and
    /// honours single and double quotes.
    fn remote_shell(&self) -> String {
        let mut shell = vec!["ssh".to_string()];
        shell.extend(self.ssh_options().iter().map(|arg| shell_word(arg)));
        shell.join(" ")
    }
}

fn shell_word(arg: &str) -> String {
    if !arg.contains(char::is_whitespace) && !arg.contains(['\'', '"']) {
        arg.to_string()
    } else if arg.contains('\'') {
        format!("\"{}\"", arg)
    } else {
        format!("'{}'", arg)
    }
}

/// Count of transferred files from `rsync --stats` output
fn transferred_files(stats: &str) -> Option<u64> {
    stats.lines().find_map(|line| {
        let line = line.trim();
        let rest = line
            .strip_prefix("Number of regular files transferred:")
            .or_else(|| line.strip_prefix("Number of files transferred:"))?;
        rest.trim().replace(',', "").parse().ok()
    })
}

/// Why an SSH round trip failed, judged from ssh's stderr
fn classify_ssh_failure(stderr: &str) -> &'static str {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication") {
        "Authentication failed"
    } else if lower.contains("could not resolve")
        || lower.contains("connection refused")
        || lower.contains("timed out")
        || lower.contains("no route to host")
        || lower.contains("network is unreachable")
    {
        "Host unreachable"
    } else if lower.contains("host key verification failed") {
        "Host key verification failed"
    } else {
        "SSH connection failed"
    }
}

pub struct RsyncTarget {
    runner: Arc<dyn CommandRunner>,
    config: RsyncConfig,
}

impl RsyncTarget {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            config: RsyncConfig::default(),
        }
    }

    pub fn config(&self) -> &RsyncConfig {
        &self.config
    }

    fn rsync_command(&self, source_dir: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new("rsync")
            .args(["-avz", "--stats", "-e"])
            .arg(self.config.remote_shell())
            .args(self.config.exclude.iter().map(|e| format!("--exclude={}", e)));
        if self.config.delete {
            spec = spec.arg("--delete");
        }
        // Trailing slash copies the directory contents rather than the directory
        spec.arg(format!("{}/", source_dir.display()))
            .arg(self.config.destination())
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .keep_last_lines(CAPTURED_LINES)
    }
}

#[async_trait]
impl DeploymentTarget for RsyncTarget {
    fn id(&self) -> &'static str {
        "rsync"
    }

    fn name(&self) -> &'static str {
        "rsync over SSH"
    }

    fn description(&self) -> String {
        let mode = if self.config.delete {
            "deletes remote files missing locally"
        } else {
            "never deletes remote files"
        };
        format!("Mirror the site to {} with rsync ({})", self.config.destination(), mode)
    }

    fn settings_fields(&self) -> Vec<SettingsField> {
        vec![
            SettingsField::new("host", FieldType::Text, "Host").required(),
            SettingsField::new("user", FieldType::Text, "User").required(),
            SettingsField::new("path", FieldType::Text, "Remote path")
                .help("Directory on the server, e.g. /var/www/site")
                .required(),
            SettingsField::new("port", FieldType::Number, "SSH port").default_value(22),
            SettingsField::new("key_file", FieldType::Text, "SSH key file"),
            SettingsField::new("delete", FieldType::Checkbox, "Delete remote files missing locally")
                .help("Passes --delete to rsync")
                .default_value(false),
            SettingsField::new("exclude", FieldType::List, "Exclude patterns")
                .default_value(vec![".git", ".DS_Store"]),
            SettingsField::new("timeout_secs", FieldType::Number, "Transfer timeout (seconds)")
                .default_value(DEFAULT_TRANSFER_TIMEOUT_SECS),
        ]
    }

    fn is_configured(&self) -> bool {
        self.config.problems().is_empty()
    }

    fn validate_config(&self, candidate: &Settings) -> Vec<String> {
        validate::<RsyncConfig>(candidate)
    }

    fn configure(&mut self, settings: &Settings) -> Result<()> {
        self.config = typed_settings(settings)?;
        Ok(())
    }

    #[instrument(skip_all, fields(id = "rsync", delete = self.config.delete))]
    async fn deploy(&self, source_dir: &Path, options: &DeployOptions) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }
        if let Some(outcome) = missing_artifact(source_dir) {
            return outcome;
        }
        let cancel = &options.cancel;

        for (program, args) in [("rsync", ["--version"]), ("ssh", ["-V"])] {
            if !self.runner.probe(program, &args, cancel).await {
                return DeployOutcome::failure(format!("{} is not installed", program), None);
            }
        }

        let spec = self.rsync_command(source_dir);
        info!(destination = %self.config.destination(), "Syncing");

        match self.runner.run(&spec, cancel).await {
            Ok(output) if output.success => {
                let mut outcome = DeployOutcome::success(format!(
                    "Synced to {}",
                    self.config.destination()
                ))
                .with_data("host", non_blank(&self.config.host).unwrap_or_default())
                .with_data("path", non_blank(&self.config.path).unwrap_or_default())
                .with_data("delete", self.config.delete);
                if let Some(count) = transferred_files(&output.stdout) {
                    outcome = outcome.with_data("transferred", count);
                }
                outcome
            }
            Ok(output) => DeployOutcome::failure(
                format!("rsync failed (exit code {})", output.code),
                Some(output.tail(FAILURE_TAIL_LINES)),
            ),
            Err(e) => process_failure("rsync failed", &e),
        }
    }

    async fn status(&self, _cancel: &CancellationToken) -> Option<StatusReport> {
        if !self.is_configured() {
            return Some(StatusReport::unconfigured(self.id()));
        }
        Some(
            StatusReport::new(self.id(), "configured")
                .with("destination", self.config.destination())
                .with("port", self.config.port)
                .with("delete", self.config.delete),
        )
    }

    async fn test_connection(&self, cancel: &CancellationToken) -> DeployOutcome {
        let problems = self.config.problems();
        if !problems.is_empty() {
            return not_configured(self.name(), &problems);
        }

        let login = format!(
            "{}@{}",
            non_blank(&self.config.user).unwrap_or_default(),
            non_blank(&self.config.host).unwrap_or_default()
        );
        let spec = CommandSpec::new("ssh")
            .args(self.config.ssh_options())
            .args(["-o", "ConnectTimeout=10"])
            .arg(login.as_str())
            .arg("exit")
            .timeout(CONNECT_TEST_TIMEOUT);

        match self.runner.run(&spec, cancel).await {
            Ok(output) if output.success => {
                DeployOutcome::success(format!("Connected to {}", login))
            }
            Ok(output) => DeployOutcome::failure(
                format!("{}: {}", classify_ssh_failure(&output.stderr), login),
                Some(output.combined()),
            ),
            Err(e) => process_failure("SSH connection failed", &e),
        }
    }
}
