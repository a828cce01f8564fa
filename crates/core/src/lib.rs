pub mod config;
pub mod error;
pub mod outcome;
pub mod process;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{
    ACTIVE_METHOD_KEY, BuildSettings, ConfigSource, DEFAULT_CONFIG_FILE, MemoryConfig,
    TomlConfig, target_settings_path,
};
pub use error::{Error, Result};
pub use outcome::{DeployOutcome, OutcomeData, OutcomeStatus, SubOperation};
pub use process::{CommandOutput, CommandRunner, CommandSpec, ProcessError, ProcessRunner};
pub use settings::{FieldType, Settings, SettingsField};
pub use tokio_util::sync::CancellationToken;
