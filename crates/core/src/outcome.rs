use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Structured payload carried by outcomes (deployment id, URL, counts, ...)
pub type OutcomeData = Map<String, Value>;

/// Completion state of a build or deploy attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    /// Accepted by the backend, which publishes asynchronously with no
    /// synchronous confirmation channel.
    Pending,
    Failure,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "success"),
            OutcomeStatus::Pending => write!(f, "pending"),
            OutcomeStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Result of a build, deploy or connection test.
///
/// Built through [`DeployOutcome::success`], [`DeployOutcome::pending`] or
/// [`DeployOutcome::failure`]; the `with_*` methods consume the value so an
/// outcome is finished before anyone else sees it. Diagnostic text only ever
/// lives on failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployOutcome {
    status: OutcomeStatus,
    message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    data: OutcomeData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl DeployOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            message: message.into(),
            data: Map::new(),
            error: None,
        }
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Pending,
            message: message.into(),
            data: Map::new(),
            error: None,
        }
    }

    /// Failure with optional raw diagnostics (command output, HTTP body).
    /// Blank diagnostics are dropped.
    pub fn failure(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            message: message.into(),
            data: Map::new(),
            error: error.filter(|e| !e.trim().is_empty()),
        }
    }

    /// Attach a payload entry
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Attach several payload entries at once
    pub fn with_data_map(mut self, data: OutcomeData) -> Self {
        self.data.extend(data);
        self
    }

    /// Record the result of a best-effort step under `key`
    pub fn with_sub_operation(self, key: &str, sub: &SubOperation) -> Self {
        let value = serde_json::to_value(sub).unwrap_or(Value::Null);
        self.with_data(key, value)
    }

    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> &OutcomeData {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutcomeStatus::Pending
    }

    pub fn is_failure(&self) -> bool {
        self.status == OutcomeStatus::Failure
    }

    /// Read back a best-effort step recorded with [`with_sub_operation`].
    /// `None` means the step was never attempted.
    ///
    /// [`with_sub_operation`]: DeployOutcome::with_sub_operation
    pub fn sub_operation(&self, key: &str) -> Option<SubOperation> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Outcome of an auxiliary step (CI trigger, CDN invalidation) whose failure
/// does not fail the parent deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubOperation {
    pub succeeded: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: OutcomeData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubOperation {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            message: message.into(),
            data: Map::new(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            succeeded: false,
            message: message.into(),
            data: Map::new(),
            error: error.filter(|e| !e.trim().is_empty()),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}
