use crate::error::{Error, Result};
use crate::settings::{Settings, typed_settings};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "sitedeploy.toml";

/// Key holding the id of the active deployment target
pub const ACTIVE_METHOD_KEY: &str = "deployment.method";

/// Dotted path under which a target's settings live
pub fn target_settings_path(target_id: &str) -> String {
    format!("deployment.{}", target_id)
}

/// Read-only view over the site configuration, addressed by dotted paths
/// such as `deployment.netlify.site_id`.
pub trait ConfigSource: Send + Sync {
    fn get(&self, path: &str) -> Option<Value>;

    fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).unwrap_or(default)
    }

    /// Non-blank string value
    fn get_str(&self, path: &str) -> Option<String> {
        self.get(path)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
    }

    fn get_bool(&self, path: &str, default: bool) -> bool {
        self.get(path).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Table at `path` as a settings map; empty when absent or not a table
    fn settings(&self, path: &str) -> Settings {
        match self.get(path) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |node, segment| node.get(segment))
}

/// Configuration loaded from a TOML file
#[derive(Debug, Clone)]
pub struct TomlConfig {
    root: Value,
}

impl TomlConfig {
    /// Parse a configuration file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a string (useful for testing)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let root = serde_json::to_value(table)?;
        Ok(Self { root })
    }
}

impl ConfigSource for TomlConfig {
    fn get(&self, path: &str) -> Option<Value> {
        lookup(&self.root, path).cloned()
    }
}

/// In-memory configuration, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryConfig {
    root: RwLock<Value>,
}

impl MemoryConfig {
    pub fn new(root: Value) -> Self {
        Self {
            root: RwLock::new(root),
        }
    }

    /// Set the value at a dotted path, creating intermediate tables
    pub fn set(&self, path: &str, value: Value) {
        let Ok(mut root) = self.root.write() else {
            return;
        };
        if !root.is_object() {
            *root = Value::Object(Map::new());
        }
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut node = &mut *root;
        for segment in parents {
            let Some(map) = node.as_object_mut() else {
                return;
            };
            let child = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            node = child;
        }
        if let Some(map) = node.as_object_mut() {
            map.insert(last.to_string(), value);
        }
    }
}

impl ConfigSource for MemoryConfig {
    fn get(&self, path: &str) -> Option<Value> {
        let root = self.root.read().ok()?;
        lookup(&root, path).cloned()
    }
}

/// `[build]` section: how the site generator and search indexer run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub source_root: PathBuf,
    /// Artifact directory, relative to `source_root`
    pub public_dir: PathBuf,
    pub command: String,
    /// Run from `source_root`; `{public_dir}` is substituted
    pub args: Vec<String>,
    pub base_url: Option<String>,
    /// Flag the generator takes a base URL override with
    pub base_url_flag: String,
    pub search_index: bool,
    pub index_command: String,
    /// Run from `source_root`; `{public_dir}` is substituted
    pub index_args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            public_dir: PathBuf::from("public"),
            command: "hugo".to_string(),
            args: vec!["--destination".to_string(), "{public_dir}".to_string()],
            base_url: None,
            base_url_flag: "--baseURL".to_string(),
            search_index: true,
            index_command: "npx".to_string(),
            index_args: vec![
                "-y".to_string(),
                "pagefind".to_string(),
                "--site".to_string(),
                "{public_dir}".to_string(),
            ],
            timeout_secs: 600,
        }
    }
}

impl BuildSettings {
    /// Load and validate the `[build]` section
    pub fn from_config(config: &dyn ConfigSource) -> Result<Self> {
        let settings: BuildSettings = typed_settings(&config.settings("build"))?;
        let public_dir = settings.public_dir.to_string_lossy().to_string();
        validate_path(&public_dir, "build.public_dir")?;
        if settings.command.trim().is_empty() {
            return Err(Error::ConfigParse(
                "build.command must name the site generator".to_string(),
            ));
        }
        Ok(settings)
    }

    /// Directory the generator writes into and targets deploy from
    pub fn artifact_dir(&self) -> PathBuf {
        self.source_root.join(&self.public_dir)
    }

    /// Substitute the `{public_dir}` placeholder. Commands run from
    /// `source_root`, so the relative form is used.
    pub fn expand(&self, arg: &str) -> String {
        arg.replace("{public_dir}", &self.public_dir.to_string_lossy())
    }
}

/// Validate a relative path taken from configuration.
///
/// The artifact directory gets emptied by clean builds, so it must stay
/// inside the source root:
/// - Absolute paths (starting with `/` or Windows drive letters) are rejected
/// - Parent directory references (`..`) are rejected
/// - Blank paths are rejected
///
/// ```text
/// validate_path("public", "build.public_dir")        → Ok(PathBuf)
/// validate_path("/var/www", "build.public_dir")      → Err("Absolute paths not allowed...")
/// validate_path("../site", "build.public_dir")       → Err("Parent directory references...")
/// ```
pub fn validate_path(path_str: &str, field_name: &str) -> Result<PathBuf> {
    if path_str.trim().is_empty() || path_str.trim() == "." {
        return Err(Error::ConfigParse(format!(
            "Empty path in '{}' field",
            field_name
        )));
    }

    let path = Path::new(path_str);

    if path.is_absolute() {
        return Err(Error::ConfigParse(format!(
            "Absolute paths not allowed in '{}': '{}'. Use relative paths only.",
            field_name, path_str
        )));
    }

    for component in path.components() {
        if component == std::path::Component::ParentDir {
            return Err(Error::ConfigParse(format!(
                "Parent directory references (..) not allowed in '{}': '{}'",
                field_name, path_str
            )));
        }
    }

    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
[build]
source_root = "site"
public_dir = "dist"
command = "zola"
args = ["build"]
search_index = false

[deployment]
method = "netlify"

[deployment.netlify]
api_token = "nf-token"
site_id = "abc123"

[deployment.rsync]
host = "example.com"
port = 2222
delete = true
"#;

    #[test]
    fn test_toml_dotted_lookup() {
        let config = TomlConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.get_str(ACTIVE_METHOD_KEY).as_deref(), Some("netlify"));
        assert_eq!(config.get("deployment.rsync.port"), Some(json!(2222)));
        assert!(config.get_bool("deployment.rsync.delete", false));
        assert!(config.get("deployment.s3.bucket").is_none());
        assert_eq!(config.get_or("deployment.s3.bucket", json!("none")), json!("none"));
    }

    #[test]
    fn test_settings_for_target() {
        let config = TomlConfig::from_toml_str(SAMPLE).unwrap();
        let settings = config.settings(&target_settings_path("netlify"));
        assert_eq!(settings["site_id"], "abc123");
        assert!(config.settings(&target_settings_path("vercel")).is_empty());
    }

    #[test]
    fn test_build_settings_from_config() {
        let config = TomlConfig::from_toml_str(SAMPLE).unwrap();
        let build = BuildSettings::from_config(&config).unwrap();
        assert_eq!(build.command, "zola");
        assert_eq!(build.args, vec!["build"]);
        assert!(!build.search_index);
        assert_eq!(build.artifact_dir(), PathBuf::from("site").join("dist"));
    }

    #[test]
    fn test_build_settings_defaults() {
        let config = MemoryConfig::default();
        let build = BuildSettings::from_config(&config).unwrap();
        assert_eq!(build, BuildSettings::default());
        assert_eq!(build.artifact_dir(), PathBuf::from(".").join("public"));
    }

    #[test]
    fn test_expand_placeholders() {
        let build = BuildSettings {
            source_root: PathBuf::from("site"),
            public_dir: PathBuf::from("dist"),
            ..BuildSettings::default()
        };
        assert_eq!(build.expand("{public_dir}"), "dist");
        assert_eq!(build.expand("--site={public_dir}"), "--site=dist");
        assert_eq!(build.expand("--minify"), "--minify");
    }

    #[test]
    fn test_build_settings_rejects_escaping_public_dir() {
        let config = MemoryConfig::new(json!({ "build": { "public_dir": "../www" } }));
        let err = BuildSettings::from_config(&config).unwrap_err().to_string();
        assert!(err.contains("Parent directory references"));
        assert!(err.contains("build.public_dir"));
    }

    #[test]
    fn test_memory_config_set_creates_tables() {
        let config = MemoryConfig::default();
        config.set("deployment.method", json!("git"));
        config.set("deployment.git.branch", json!("pages"));
        assert_eq!(config.get_str("deployment.method").as_deref(), Some("git"));
        assert_eq!(config.settings("deployment.git")["branch"], "pages");
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, SAMPLE).unwrap();
        let config = TomlConfig::load(&path).unwrap();
        assert_eq!(config.get_str("deployment.netlify.api_token").as_deref(), Some("nf-token"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = TomlConfig::from_toml_str("[deployment\nmethod = ").unwrap_err();
        assert!(err.to_string().contains("Configuration parse error"));
    }

    #[test]
    fn test_validate_path_valid_relative() {
        assert!(validate_path("public", "build.public_dir").is_ok());
        assert!(validate_path("build/site", "build.public_dir").is_ok());
    }

    #[test]
    fn test_validate_path_rejects_absolute_unix() {
        let result = validate_path("/etc", "build.public_dir");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Absolute paths not allowed")
        );
    }

    #[test]
    fn test_validate_path_rejects_parent_dir() {
        assert!(validate_path("../public", "build.public_dir").is_err());
        assert!(validate_path("public/../../etc", "build.public_dir").is_err());
    }

    #[test]
    fn test_validate_path_rejects_empty() {
        let result = validate_path("", "build.public_dir");
        assert!(result.unwrap_err().to_string().contains("Empty path"));
        assert!(validate_path("   ", "build.public_dir").is_err());
        assert!(validate_path(".", "build.public_dir").is_err());
    }
}
