use crate::errors::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailEvent {
    Abort,
    Begin,
    End,
}

impl MailEvent {
    pub fn flag(&self) -> char {
        match self {
            MailEvent::Abort => 'a',
            MailEvent::Begin => 'b',
            MailEvent::End => 'e',
        }
    }

    pub fn from_flag(c: char) -> Option<Self> {
        match c {
            'a' => Some(MailEvent::Abort),
            'b' => Some(MailEvent::Begin),
            'e' => Some(MailEvent::End),
            _ => None,
        }
    }
}

pub fn mail_flags(events: &[MailEvent]) -> String {
    events.iter().map(MailEvent::flag).collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MailEventsRepr {
    Flags(String),
    List(Vec<MailEvent>),
}

fn deserialize_mail_events<'de, D>(deserializer: D) -> Result<Vec<MailEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    match MailEventsRepr::deserialize(deserializer)? {
        MailEventsRepr::List(list) => Ok(list),
        MailEventsRepr::Flags(flags) => flags
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ',')
            .map(|c| {
                MailEvent::from_flag(c).ok_or_else(|| {
                    serde::de::Error::custom(format!("unknown mail option '{}'", c))
                })
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    Branch,
    AbortPipeline,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Branch => write!(f, "branch"),
            FailurePolicy::AbortPipeline => write!(f, "abort-pipeline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailurePolicyError(pub String);

impl fmt::Display for ParseFailurePolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid failure policy: '{}'. Valid values are: branch, abort-pipeline",
            self.0
        )
    }
}

impl std::error::Error for ParseFailurePolicyError {}

impl FromStr for FailurePolicy {
    type Err = ParseFailurePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch" => Ok(FailurePolicy::Branch),
            "abort-pipeline" => Ok(FailurePolicy::AbortPipeline),
            _ => Err(ParseFailurePolicyError(s.to_string())),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_dependency_type() -> String {
    "afterok".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_mail_on() -> Vec<MailEvent> {
    vec![MailEvent::Abort]
}

fn default_branch() -> FailurePolicy {
    FailurePolicy::Branch
}

fn default_abort_pipeline() -> FailurePolicy {
    FailurePolicy::AbortPipeline
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubmitConfig {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(
        default = "default_mail_on",
        deserialize_with = "deserialize_mail_events"
    )]
    pub mail_on: Vec<MailEvent>,
    #[serde(default = "default_true")]
    pub submit_with_hold: bool,
    #[serde(default = "default_dependency_type")]
    pub dependency_type: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub epilogue: Option<PathBuf>,
    #[serde(default = "default_branch")]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub directory_version: bool,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            queue: None,
            email: None,
            mail_on: default_mail_on(),
            submit_with_hold: true,
            dependency_type: default_dependency_type(),
            max_retries: default_max_retries(),
            epilogue: None,
            failure_policy: FailurePolicy::Branch,
            directory_version: false,
        }
    }
}

fn default_max_queued() -> usize {
    100
}

fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ManagedConfig {
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_abort_pipeline")]
    pub failure_policy: FailurePolicy,
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            max_queued: default_max_queued(),
            poll_interval_secs: default_poll_interval(),
            failure_policy: FailurePolicy::AbortPipeline,
        }
    }
}

fn default_validator() -> String {
    "validate-files".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_validator")]
    pub validator: String,
    #[serde(default)]
    pub manifest: Option<PathBuf>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            validator: default_validator(),
            manifest: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceDefaults {
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub walltime: Option<String>,
    #[serde(default)]
    pub mem: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub qsub_opts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRule {
    #[serde(default)]
    pub tool_glob: Option<String>,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub walltime: Option<String>,
    #[serde(default)]
    pub mem: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub qsub_opts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Resources {
    #[serde(default)]
    pub defaults: ResourceDefaults,
    #[serde(default)]
    pub rules: Vec<ResourceRule>,
}

fn default_max_files() -> usize {
    10
}

fn default_max_age_days() -> u64 {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_age_days: default_max_age_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub submit: SubmitConfig,
    #[serde(default)]
    pub managed: ManagedConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| ConfigError::General(format!("Failed to expand '{}': {}", raw, e)))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_paths()?;
        Ok(config)
    }

    fn expand_paths(&mut self) -> Result<(), ConfigError> {
        if let Some(epilogue) = &self.submit.epilogue {
            self.submit.epilogue = Some(expand_path(epilogue)?);
        }
        if let Some(manifest) = &self.validation.manifest {
            self.validation.manifest = Some(expand_path(manifest)?);
        }
        if self.managed.max_queued == 0 {
            return Err(ConfigError::General(
                "managed.max_queued must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn config_file_path() -> Option<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("pbsflow");
    xdg_dirs.find_config_file("config.toml")
}

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let content = fs_err::read_to_string(path).map_err(|e| ConfigError::PathIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    Config::from_toml_str(&content)
}

pub fn load_config() -> Result<Config, ConfigError> {
    match config_file_path() {
        Some(path) => {
            tracing::debug!("Loading configuration from {}", path.display());
            load_config_from(&path)
        }
        None => {
            tracing::debug!("No config.toml found, using built-in defaults");
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.submit.submit_with_hold);
        assert_eq!(config.submit.dependency_type, "afterok");
        assert_eq!(config.submit.mail_on, vec![MailEvent::Abort]);
        assert_eq!(config.submit.failure_policy, FailurePolicy::Branch);
        assert_eq!(config.managed.failure_policy, FailurePolicy::AbortPipeline);
        assert_eq!(config.managed.max_queued, 100);
    }

    #[test]
    fn test_mail_on_accepts_flag_string() {
        let config = Config::from_toml_str(
            r#"
[submit]
mail_on = "ae"
"#,
        )
        .unwrap();
        assert_eq!(config.submit.mail_on, vec![MailEvent::Abort, MailEvent::End]);
        assert_eq!(mail_flags(&config.submit.mail_on), "ae");
    }

    #[test]
    fn test_mail_on_accepts_list() {
        let config = Config::from_toml_str(
            r#"
[submit]
mail_on = ["begin", "abort"]
"#,
        )
        .unwrap();
        assert_eq!(config.submit.mail_on, vec![MailEvent::Begin, MailEvent::Abort]);
    }

    #[test]
    fn test_mail_on_rejects_unknown_flag() {
        let result = Config::from_toml_str(
            r#"
[submit]
mail_on = "az"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_section_rejected() {
        assert!(Config::from_toml_str("[bogus]\nx = 1\n").is_err());
    }

    #[test]
    fn test_zero_max_queued_rejected() {
        let result = Config::from_toml_str("[managed]\nmax_queued = 0\n");
        assert!(matches!(result, Err(ConfigError::General(_))));
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!(
            "abort-pipeline".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::AbortPipeline
        );
        assert!("whatever".parse::<FailurePolicy>().is_err());
    }
}
