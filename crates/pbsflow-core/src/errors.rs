use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize TOML configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("XDG Base Directory Error: {0}")]
    Xdg(#[from] xdg::BaseDirectoriesError),

    #[error("Invalid configuration: {0}")]
    General(String),

    #[error("Could not determine HOME directory.")]
    HomeDirectoryNotFound,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid declaration for '{id}': {reason}")]
    InvalidDeclaration { id: String, reason: String },

    #[error("File id '{0}' is declared more than once with incompatible attributes.")]
    DuplicateFile(String),

    #[error("Only one default output directory may be declared, found '{first}' and '{second}'.")]
    MultipleDefaultOutputs { first: String, second: String },

    #[error("Circular dependency while resolving files: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("File '{id}' requires parameter {index} but only {supplied} parameter(s) were supplied.")]
    TooFewParameters {
        id: String,
        index: usize,
        supplied: usize,
    },

    #[error("File '{id}' references unknown file '{reference}' (chain: {}).", chain.join(" -> "))]
    UnknownReference {
        id: String,
        reference: String,
        chain: Vec<String>,
    },

    #[error("File '{0}' was read before it was resolved.")]
    NotFixedUp(String),

    #[error("The output directory was accessed before it was resolved.")]
    OutputDirNotFixedUp,

    #[error("Resolution stack corrupted: expected '{expected}' on top, found '{found}'.")]
    StackMismatch { expected: String, found: String },

    #[error("Tool '{tool}': option '{name}' collides with a file id of the same name.")]
    NamespaceCollision { tool: String, name: String },

    #[error("Tool '{tool}': unknown token '{{{token}}}' in command '{command}'.")]
    UnknownToken {
        tool: String,
        token: String,
        command: String,
    },

    #[error("Tool '{tool}': unbalanced braces in command '{command}'.")]
    MalformedTemplate { tool: String, command: String },

    #[error("Tool definition '{0}' was not found in the tool search path.")]
    ToolNotFound(String),

    #[error("Tool '{tool}' binds {supplied} {direction}(s) but the pipeline gave {given}.")]
    BindingMismatch {
        tool: String,
        direction: &'static str,
        supplied: usize,
        given: usize,
    },

    #[error("Required input file(s) do not exist:\n  - {}", missing.join("\n  - "))]
    MissingInputs { missing: Vec<String> },

    #[error("Failed to list directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid regular expression '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidDeclaration {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Config(ConfigError::Io(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_chain() {
        let err = PipelineError::DependencyCycle {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "Circular dependency while resolving files: a -> b -> a"
        );
    }

    #[test]
    fn test_unknown_token_message() {
        let err = PipelineError::UnknownToken {
            tool: "bwa".into(),
            token: "nope".into(),
            command: "bwa {nope}".into(),
        };
        assert!(err.to_string().contains("'{nope}'"));
    }
}
