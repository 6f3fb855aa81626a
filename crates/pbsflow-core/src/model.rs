use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    #[default]
    File,
    Dir,
    String,
    List,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::File => write!(f, "file"),
            FileKind::Dir => write!(f, "dir"),
            FileKind::String => write!(f, "string"),
            FileKind::List => write!(f, "list"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFileKindError(pub String);

impl fmt::Display for ParseFileKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid file kind: '{}'. Valid values are: file, dir, string, list",
            self.0
        )
    }
}

impl std::error::Error for ParseFileKindError {}

impl FromStr for FileKind {
    type Err = ParseFileKindError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(FileKind::File),
            "dir" => Ok(FileKind::Dir),
            "string" => Ok(FileKind::String),
            "list" => Ok(FileKind::List),
            _ => Err(ParseFileKindError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct JobRef(pub String);

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobRef {
    fn from(s: String) -> Self {
        JobRef(s)
    }
}

impl JobRef {
    /// The numeric part of a resource-manager id (`1234.server` -> `1234`).
    pub fn short_id(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDecl {
    pub id: String,
    #[serde(default)]
    pub kind: FileKind,
    pub path: Option<String>,
    pub value: Option<String>,
    pub parameter: Option<usize>,
    pub based_on: Option<String>,
    pub append: Option<String>,
    pub datestamp_prepend: Option<String>,
    pub datestamp_append: Option<String>,
    pub pattern: Option<String>,
    pub replace: Option<String>,
    pub in_dir: Option<String>,
    #[serde(default)]
    pub temp: bool,
    #[serde(default)]
    pub input: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub default_output: bool,
    pub delimiter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolRefDecl {
    pub definition: PathBuf,
    pub name: Option<String>,
    #[serde(default)]
    pub input: Vec<String>,
    #[serde(default)]
    pub output: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForEachFileDecl {
    pub id: String,
    pub pattern: String,
    pub replace: Option<String>,
    pub in_dir: Option<String>,
    #[serde(default)]
    pub input: bool,
    #[serde(default)]
    pub temp: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForEachDecl {
    pub dir: String,
    pub file: ForEachFileDecl,
    #[serde(default)]
    pub related: Vec<ForEachFileDecl>,
    #[serde(default)]
    pub step: Vec<StepDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDecl {
    pub name: String,
    #[serde(default)]
    pub tool: Vec<ToolRefDecl>,
    pub foreach: Option<ForEachDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDecl {
    pub name: String,
    #[serde(default)]
    pub path: Vec<PathBuf>,
    #[serde(default)]
    pub tool_search_path: Vec<PathBuf>,
    #[serde(default)]
    pub file: Vec<FileDecl>,
    #[serde(default)]
    pub step: Vec<StepDecl>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExitTestLogic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionDecl {
    pub name: String,
    pub command_text: Option<String>,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandDecl {
    pub program: String,
    #[serde(default)]
    pub args: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub version_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolDecl {
    pub name: String,
    pub description: Option<String>,
    pub threads: Option<u32>,
    pub walltime: Option<String>,
    pub mem: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub path: Vec<PathBuf>,
    #[serde(default)]
    pub error_strings: Vec<String>,
    #[serde(default)]
    pub exit_if_exists: Vec<String>,
    #[serde(default)]
    pub exit_test_logic: ExitTestLogic,
    #[serde(default)]
    pub validate: Vec<String>,
    #[serde(default)]
    pub file: Vec<FileDecl>,
    #[serde(default)]
    pub option: Vec<OptionDecl>,
    #[serde(default)]
    pub command: Vec<CommandDecl>,
}

fn parse_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs_err::read_to_string(path)?;
    toml::from_str(&content).map_err(|source| PipelineError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl PipelineDecl {
    pub fn from_path(path: &Path) -> Result<Self> {
        parse_toml(path)
    }
}

impl ToolDecl {
    pub fn from_path(path: &Path) -> Result<Self> {
        parse_toml(path)
    }
}
