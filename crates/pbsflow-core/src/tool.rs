use crate::errors::{PipelineError, Result};
use crate::files::{FileEntity, FileRegistry, FixUpContext};
use crate::model::{ExitTestLogic, FileDecl, ToolDecl};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Token(String),
}

/// Splits a command template into literal text and `{token}` references.
/// `{{` and `}}` are literal braces.
pub fn parse_template(tool: &str, template: &str) -> Result<Vec<Segment>> {
    let malformed = || PipelineError::MalformedTemplate {
        tool: tool.to_string(),
        command: template.to_string(),
    };
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut token = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => return Err(malformed()),
                        Some(ch) => token.push(ch),
                    }
                }
                let token = token.trim().to_string();
                if token.is_empty() {
                    return Err(malformed());
                }
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Token(token));
            }
            '}' => return Err(malformed()),
            _ => text.push(c),
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

const THREADS_TOKEN: &str = "threads";

/// `in_3` -> `Some(("in", 3))`
fn binding_slot(id: &str) -> Option<(&'static str, usize)> {
    let (direction, rest) = if let Some(rest) = id.strip_prefix("in_") {
        ("input", rest)
    } else if let Some(rest) = id.strip_prefix("out_") {
        ("output", rest)
    } else {
        return None;
    };
    rest.parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .map(|n| (direction, n))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOption {
    pub name: String,
    pub command_text: Option<String>,
    pub value: String,
}

impl ToolOption {
    fn render(&self, value: &str) -> String {
        match (&self.command_text, value.is_empty()) {
            (Some(flag), true) => flag.clone(),
            (Some(flag), false) => format!("{} {}", flag, value),
            (None, _) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<Segment>,
    pub raw_args: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub version_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub source: PathBuf,
    pub threads: Option<u32>,
    pub walltime: Option<String>,
    pub mem: Option<String>,
    pub modules: Vec<String>,
    pub bin_path: Vec<PathBuf>,
    pub error_strings: Vec<String>,
    pub exit_if_exists: Vec<String>,
    pub exit_test_logic: ExitTestLogic,
    pub validate: Vec<String>,
    pub files: Vec<FileDecl>,
    pub options: BTreeMap<String, ToolOption>,
    pub commands: Vec<ToolCommand>,
    max_input: usize,
    max_output: usize,
}

impl ToolDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let decl = ToolDecl::from_path(path)?;
        Self::from_decl(decl, path)
    }

    pub fn from_decl(decl: ToolDecl, source: &Path) -> Result<Self> {
        let name = decl.name.clone();
        if name.is_empty() {
            return Err(PipelineError::invalid(
                source.display().to_string(),
                "tool name must not be empty",
            ));
        }
        if decl.command.is_empty() {
            return Err(PipelineError::invalid(&name, "a tool needs at least one command"));
        }

        let mut file_ids = BTreeSet::new();
        for file in &decl.file {
            if binding_slot(&file.id).is_some() {
                return Err(PipelineError::invalid(
                    &file.id,
                    format!("'{}' is reserved for pipeline bindings", file.id),
                ));
            }
            FileEntity::from_decl(file)?;
            file_ids.insert(file.id.clone());
        }

        let mut options = BTreeMap::new();
        for opt in &decl.option {
            if file_ids.contains(&opt.name)
                || binding_slot(&opt.name).is_some()
                || opt.name == THREADS_TOKEN
                || options.contains_key(&opt.name)
            {
                return Err(PipelineError::NamespaceCollision {
                    tool: name.clone(),
                    name: opt.name.clone(),
                });
            }
            options.insert(
                opt.name.clone(),
                ToolOption {
                    name: opt.name.clone(),
                    command_text: opt.command_text.clone(),
                    value: opt.value.clone(),
                },
            );
        }

        let mut max_input = 0;
        let mut max_output = 0;
        let mut check_file_ref = |id: &str, context: &str| -> Result<()> {
            if let Some((direction, n)) = binding_slot(id) {
                if direction == "input" {
                    max_input = max_input.max(n);
                } else {
                    max_output = max_output.max(n);
                }
                return Ok(());
            }
            if file_ids.contains(id) {
                return Ok(());
            }
            Err(PipelineError::UnknownToken {
                tool: name.clone(),
                token: id.to_string(),
                command: context.to_string(),
            })
        };

        let mut commands = Vec::new();
        for cmd in &decl.command {
            let args = parse_template(&name, &cmd.args)?;
            for segment in &args {
                if let Segment::Token(token) = segment {
                    if token == THREADS_TOKEN || options.contains_key(token) {
                        continue;
                    }
                    check_file_ref(token, &cmd.args)?;
                }
            }
            if let Some(target) = &cmd.stdout {
                check_file_ref(target, "stdout")?;
            }
            if let Some(target) = &cmd.stderr {
                check_file_ref(target, "stderr")?;
            }
            commands.push(ToolCommand {
                program: cmd.program.clone(),
                args,
                raw_args: cmd.args.clone(),
                stdout: cmd.stdout.clone(),
                stderr: cmd.stderr.clone(),
                version_command: cmd.version_command.clone(),
            });
        }
        for id in &decl.exit_if_exists {
            check_file_ref(id, "exit_if_exists")?;
        }

        let tool_dir = source.parent().unwrap_or_else(|| Path::new("."));
        let bin_path = decl
            .path
            .iter()
            .map(|p| {
                if p.is_relative() {
                    tool_dir.join(p)
                } else {
                    p.clone()
                }
            })
            .collect();

        Ok(Self {
            name,
            description: decl.description,
            source: source.to_path_buf(),
            threads: decl.threads,
            walltime: decl.walltime,
            mem: decl.mem,
            modules: decl.modules,
            bin_path,
            error_strings: decl.error_strings,
            exit_if_exists: decl.exit_if_exists,
            exit_test_logic: decl.exit_test_logic,
            validate: decl.validate,
            files: decl.file,
            options,
            commands,
            max_input,
            max_output,
        })
    }

    /// Number of `in_N`/`out_N` slots the tool's commands reference.
    pub fn arity(&self) -> (usize, usize) {
        (self.max_input, self.max_output)
    }

    /// Binds pipeline files to this tool's slots and renders its commands.
    pub fn bind(
        &self,
        binding: &Binding,
        pipeline: &FileRegistry,
        ctx: &FixUpContext<'_>,
    ) -> Result<ToolInvocation> {
        if binding.inputs.len() < self.max_input {
            return Err(PipelineError::BindingMismatch {
                tool: self.name.clone(),
                direction: "input",
                supplied: self.max_input,
                given: binding.inputs.len(),
            });
        }
        if binding.outputs.len() < self.max_output {
            return Err(PipelineError::BindingMismatch {
                tool: self.name.clone(),
                direction: "output",
                supplied: self.max_output,
                given: binding.outputs.len(),
            });
        }
        for key in binding.options.keys() {
            if !self.options.contains_key(key) {
                return Err(PipelineError::invalid(
                    &self.name,
                    format!("unknown option override '{}'", key),
                ));
            }
        }

        let mut scope = FileRegistry::new();
        let out_id = pipeline
            .default_output_id()
            .ok_or(PipelineError::OutputDirNotFixedUp)?;
        let out_entity = pipeline
            .get(out_id)
            .filter(|e| e.is_fixed_up())
            .ok_or(PipelineError::OutputDirNotFixedUp)?;
        scope.insert(out_entity.clone())?;

        let bound = binding
            .inputs
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("in_{}", i + 1), id))
            .chain(
                binding
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(i, id)| (format!("out_{}", i + 1), id)),
            );
        for (slot, id) in bound {
            let entity = pipeline
                .get(id)
                .ok_or_else(|| PipelineError::UnknownReference {
                    id: self.name.clone(),
                    reference: id.clone(),
                    chain: vec![binding.job_name.clone()],
                })?;
            if !entity.is_fixed_up() {
                return Err(PipelineError::NotFixedUp(id.clone()));
            }
            scope.insert(entity.alias(&slot))?;
        }
        for decl in &self.files {
            scope.add_decl(decl)?;
        }
        scope.fix_up_all(ctx)?;

        let threads = binding.threads.or(self.threads).unwrap_or(1);
        let mut commands = Vec::new();
        for cmd in &self.commands {
            let mut line = String::new();
            for segment in &cmd.args {
                match segment {
                    Segment::Text(t) => line.push_str(t),
                    Segment::Token(token) if token == THREADS_TOKEN => {
                        line.push_str(&threads.to_string())
                    }
                    Segment::Token(token) => {
                        if let Some(opt) = self.options.get(token) {
                            let value = binding.options.get(token).unwrap_or(&opt.value);
                            line.push_str(&opt.render(value));
                        } else {
                            let entity = scope.get(token).ok_or_else(|| {
                                PipelineError::UnknownToken {
                                    tool: self.name.clone(),
                                    token: token.clone(),
                                    command: cmd.raw_args.clone(),
                                }
                            })?;
                            line.push_str(&entity.render()?);
                        }
                    }
                }
            }
            let stdout = cmd
                .stdout
                .as_deref()
                .map(|id| scope.path_of(id).map(Path::to_path_buf))
                .transpose()?;
            let stderr = cmd
                .stderr
                .as_deref()
                .map(|id| scope.path_of(id).map(Path::to_path_buf))
                .transpose()?;
            let command_line = if line.trim().is_empty() {
                cmd.program.clone()
            } else {
                format!("{} {}", cmd.program, line.trim())
            };
            commands.push(RenderedCommand {
                program: cmd.program.clone(),
                command_line,
                stdout,
                stderr,
                version_command: cmd.version_command.clone(),
            });
        }

        let exit_if_exists = self
            .exit_if_exists
            .iter()
            .map(|id| scope.path_of(id).map(Path::to_path_buf))
            .collect::<Result<Vec<_>>>()?;

        let local_temp_files = self
            .files
            .iter()
            .filter(|f| f.temp)
            .filter_map(|f| scope.get(&f.id))
            .filter_map(|e| e.path().ok().map(Path::to_path_buf))
            .collect();

        let mut validate_programs: Vec<String> =
            self.commands.iter().map(|c| c.program.clone()).collect();
        for program in &self.validate {
            if !validate_programs.contains(program) {
                validate_programs.push(program.clone());
            }
        }

        let mut bin_path = binding.pipeline_bin_path.clone();
        bin_path.extend(self.bin_path.iter().cloned());

        Ok(ToolInvocation {
            job_name: binding.job_name.clone(),
            tool_name: self.name.clone(),
            inputs: binding.inputs.clone(),
            outputs: binding.outputs.clone(),
            commands,
            resources: ResourceRequest {
                threads,
                walltime: self.walltime.clone(),
                mem: self.mem.clone(),
                queue: None,
                extra: Vec::new(),
            },
            modules: self.modules.clone(),
            bin_path,
            error_strings: self.error_strings.clone(),
            exit_if_exists,
            exit_test_logic: self.exit_test_logic,
            validate_programs,
            local_temp_files,
        })
    }
}

/// What a pipeline step supplies to a tool.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    pub job_name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub threads: Option<u32>,
    pub pipeline_bin_path: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub threads: u32,
    pub walltime: Option<String>,
    pub mem: Option<String>,
    pub queue: Option<String>,
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub program: String,
    pub command_line: String,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub version_command: Option<String>,
}

/// One tool bound to resolved files, ready to be turned into a job script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub job_name: String,
    pub tool_name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub commands: Vec<RenderedCommand>,
    pub resources: ResourceRequest,
    pub modules: Vec<String>,
    pub bin_path: Vec<PathBuf>,
    pub error_strings: Vec<String>,
    pub exit_if_exists: Vec<PathBuf>,
    pub exit_test_logic: ExitTestLogic,
    pub validate_programs: Vec<String>,
    pub local_temp_files: Vec<PathBuf>,
}
