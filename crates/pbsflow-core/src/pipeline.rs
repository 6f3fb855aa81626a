use crate::errors::{PipelineError, Result};
use crate::files::{FileEntity, FileFlags, FileRegistry, FixUpContext};
use crate::model::{FileKind, ForEachFileDecl, JobRef, PipelineDecl, StepDecl, ToolRefDecl};
use crate::tool::{Binding, ToolDefinition, ToolInvocation};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ToolRef {
    pub name: String,
    pub definition: ToolDefinition,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ForEachFile {
    pub id: String,
    pub pattern: Regex,
    pub replace: Option<String>,
    pub in_dir: Option<String>,
    pub input: bool,
    pub temp: bool,
}

#[derive(Debug, Clone)]
pub struct ForEach {
    pub dir: String,
    pub file: ForEachFile,
    pub related: Vec<ForEachFile>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub enum StepBody {
    Tools(Vec<ToolRef>),
    ForEach(Box<ForEach>),
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub body: StepBody,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub source: PathBuf,
    pub bin_path: Vec<PathBuf>,
    pub registry: FileRegistry,
    pub steps: Vec<Step>,
}

struct Loader<'a> {
    base_dir: &'a Path,
    search_path: Vec<PathBuf>,
    cache: HashMap<PathBuf, ToolDefinition>,
}

impl Loader<'_> {
    fn locate(&self, definition: &Path) -> Result<PathBuf> {
        if definition.is_absolute() {
            if definition.is_file() {
                return Ok(definition.to_path_buf());
            }
            return Err(PipelineError::ToolNotFound(definition.display().to_string()));
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(definition))
            .chain(std::iter::once(self.base_dir.join(definition)))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| PipelineError::ToolNotFound(definition.display().to_string()))
    }

    fn tool(&mut self, decl: &ToolRefDecl, known: &BTreeSet<String>) -> Result<ToolRef> {
        let path = self.locate(&decl.definition)?;
        let definition = match self.cache.get(&path) {
            Some(def) => def.clone(),
            None => {
                let def = ToolDefinition::load(&path)?;
                self.cache.insert(path.clone(), def.clone());
                def
            }
        };
        for id in decl.input.iter().chain(decl.output.iter()) {
            if !known.contains(id) {
                return Err(PipelineError::UnknownReference {
                    id: definition.name.clone(),
                    reference: id.clone(),
                    chain: vec![decl.definition.display().to_string()],
                });
            }
        }
        Ok(ToolRef {
            name: decl.name.clone().unwrap_or_else(|| definition.name.clone()),
            definition,
            inputs: decl.input.clone(),
            outputs: decl.output.clone(),
            options: decl.options.clone(),
        })
    }

    fn steps(&mut self, decls: &[StepDecl], known: &BTreeSet<String>) -> Result<Vec<Step>> {
        decls.iter().map(|d| self.step(d, known)).collect()
    }

    fn step(&mut self, decl: &StepDecl, known: &BTreeSet<String>) -> Result<Step> {
        let body = match (&decl.foreach, decl.tool.is_empty()) {
            (Some(_), false) => {
                return Err(PipelineError::invalid(
                    &decl.name,
                    "a step holds either tools or a foreach, not both",
                ))
            }
            (None, true) => {
                return Err(PipelineError::invalid(&decl.name, "a step needs at least one tool"))
            }
            (None, false) => StepBody::Tools(
                decl.tool
                    .iter()
                    .map(|t| self.tool(t, known))
                    .collect::<Result<_>>()?,
            ),
            (Some(fe), true) => {
                if !known.contains(&fe.dir) {
                    return Err(PipelineError::UnknownReference {
                        id: decl.name.clone(),
                        reference: fe.dir.clone(),
                        chain: vec![decl.name.clone()],
                    });
                }
                let file = foreach_file(&fe.file, false)?;
                let related = fe
                    .related
                    .iter()
                    .map(|r| foreach_file(r, true))
                    .collect::<Result<Vec<_>>>()?;
                let mut scoped = known.clone();
                for id in std::iter::once(&file.id).chain(related.iter().map(|r| &r.id)) {
                    if !scoped.insert(id.clone()) {
                        return Err(PipelineError::DuplicateFile(id.clone()));
                    }
                }
                for r in &related {
                    if let Some(dir) = &r.in_dir {
                        if !known.contains(dir) {
                            return Err(PipelineError::UnknownReference {
                                id: r.id.clone(),
                                reference: dir.clone(),
                                chain: vec![decl.name.clone()],
                            });
                        }
                    }
                }
                if fe.step.is_empty() {
                    return Err(PipelineError::invalid(&decl.name, "a foreach needs nested steps"));
                }
                let steps = self.steps(&fe.step, &scoped)?;
                StepBody::ForEach(Box::new(ForEach {
                    dir: fe.dir.clone(),
                    file,
                    related,
                    steps,
                }))
            }
        };
        Ok(Step {
            name: decl.name.clone(),
            body,
        })
    }
}

fn foreach_file(decl: &ForEachFileDecl, related: bool) -> Result<ForEachFile> {
    if related && decl.replace.is_none() {
        return Err(PipelineError::invalid(
            &decl.id,
            "a related file needs 'replace'",
        ));
    }
    if !related && (decl.replace.is_some() || decl.in_dir.is_some()) {
        return Err(PipelineError::invalid(
            &decl.id,
            "the primary foreach file takes only 'pattern'",
        ));
    }
    let anchored = format!("^(?:{})$", decl.pattern);
    let pattern = Regex::new(&anchored).map_err(|source| PipelineError::Regex {
        pattern: decl.pattern.clone(),
        source,
    })?;
    Ok(ForEachFile {
        id: decl.id.clone(),
        pattern,
        replace: decl.replace.clone(),
        in_dir: decl.in_dir.clone(),
        input: decl.input,
        temp: decl.temp,
    })
}

impl Pipeline {
    pub fn load(path: &Path) -> Result<Self> {
        let decl = PipelineDecl::from_path(path)?;
        let source = std::path::absolute(path)?;
        Self::from_decl(decl, &source)
    }

    pub fn from_decl(decl: PipelineDecl, source: &Path) -> Result<Self> {
        let base_dir = source.parent().unwrap_or_else(|| Path::new("."));
        let absolutize = |p: &PathBuf| {
            if p.is_relative() {
                base_dir.join(p)
            } else {
                p.clone()
            }
        };
        let registry = FileRegistry::from_decls(&decl.file)?;
        let known: BTreeSet<String> = registry.ids().cloned().collect();
        let mut loader = Loader {
            base_dir,
            search_path: decl.tool_search_path.iter().map(absolutize).collect(),
            cache: HashMap::new(),
        };
        let steps = loader.steps(&decl.step, &known)?;
        tracing::debug!(
            "Loaded pipeline '{}' with {} file(s) and {} step(s)",
            decl.name,
            registry.len(),
            steps.len()
        );
        Ok(Self {
            name: decl.name,
            source: source.to_path_buf(),
            bin_path: decl.path.iter().map(absolutize).collect(),
            registry,
            steps,
        })
    }

    /// Resolves every file entity and checks that declared inputs exist.
    pub fn prepare(&mut self, ctx: &FixUpContext<'_>) -> Result<()> {
        self.registry.fix_up_all(ctx)?;
        let missing = self.registry.missing_inputs();
        if !missing.is_empty() {
            return Err(PipelineError::MissingInputs { missing });
        }
        Ok(())
    }

    pub fn output_dir(&self) -> Result<&Path> {
        self.registry.output_dir()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Tool(Box<ToolInvocation>),
    Cleanup { paths: Vec<PathBuf> },
}

/// A job handed to a sink for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub name: String,
    pub kind: JobKind,
    pub depends_on: Vec<JobRef>,
    pub workdir: PathBuf,
}

impl BatchJob {
    pub fn invocation(&self) -> Option<&ToolInvocation> {
        match &self.kind {
            JobKind::Tool(inv) => Some(inv),
            JobKind::Cleanup { .. } => None,
        }
    }
}

/// Receives jobs in dependency order. Every dependency a job names was
/// returned by an earlier `submit` on the same sink.
pub trait JobSink {
    type Error: From<PipelineError>;

    fn submit(&mut self, job: &BatchJob) -> std::result::Result<JobRef, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub name: String,
    pub job_ref: JobRef,
    pub depends_on: Vec<JobRef>,
}

#[derive(Debug, Default)]
struct Tracking {
    creators: HashMap<String, JobRef>,
}

pub struct GraphBuilder<'p, 'c, S: JobSink> {
    pipeline: &'p Pipeline,
    ctx: &'c FixUpContext<'c>,
    sink: &'p mut S,
    names: HashMap<String, usize>,
    temp_users: BTreeMap<PathBuf, Vec<JobRef>>,
    submitted: Vec<SubmittedJob>,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl<'p, 'c, S: JobSink> GraphBuilder<'p, 'c, S> {
    pub fn new(pipeline: &'p Pipeline, ctx: &'c FixUpContext<'c>, sink: &'p mut S) -> Self {
        Self {
            pipeline,
            ctx,
            sink,
            names: HashMap::new(),
            temp_users: BTreeMap::new(),
            submitted: Vec::new(),
        }
    }

    /// Walks every step and submits one job per tool, then the temp cleanup job.
    pub fn run(mut self) -> std::result::Result<Vec<SubmittedJob>, S::Error> {
        let mut tracking = Tracking::default();
        let pipeline = self.pipeline;
        self.run_steps(&pipeline.steps, &pipeline.registry, &mut tracking, None)?;
        self.submit_cleanup(&pipeline.registry)?;
        Ok(self.submitted)
    }

    fn unique_name(&mut self, base: &str) -> String {
        let base = sanitize(base);
        let count = self.names.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            base
        } else {
            format!("{}_{}", base, count)
        }
    }

    fn run_steps(
        &mut self,
        steps: &[Step],
        registry: &FileRegistry,
        tracking: &mut Tracking,
        suffix: Option<&str>,
    ) -> std::result::Result<(), S::Error> {
        for step in steps {
            match &step.body {
                StepBody::Tools(tools) => {
                    for tool in tools {
                        self.run_tool(step, tool, registry, tracking, suffix)?;
                    }
                }
                StepBody::ForEach(foreach) => {
                    self.run_foreach(foreach, registry, tracking)?;
                }
            }
        }
        Ok(())
    }

    fn run_tool(
        &mut self,
        step: &Step,
        tool: &ToolRef,
        registry: &FileRegistry,
        tracking: &mut Tracking,
        suffix: Option<&str>,
    ) -> std::result::Result<(), S::Error> {
        let base = match suffix {
            Some(s) => format!("{}_{}_{}", step.name, tool.name, s),
            None => format!("{}_{}", step.name, tool.name),
        };
        let job_name = self.unique_name(&base);
        let binding = Binding {
            job_name: job_name.clone(),
            inputs: tool.inputs.clone(),
            outputs: tool.outputs.clone(),
            options: tool.options.clone(),
            threads: None,
            pipeline_bin_path: self.pipeline.bin_path.clone(),
        };
        let invocation = tool.definition.bind(&binding, registry, self.ctx)?;

        let mut depends_on: Vec<JobRef> = Vec::new();
        for input in &tool.inputs {
            if let Some(creator) = tracking.creators.get(input) {
                if !depends_on.contains(creator) {
                    depends_on.push(creator.clone());
                }
            }
        }

        let job = BatchJob {
            name: job_name.clone(),
            kind: JobKind::Tool(Box::new(invocation)),
            depends_on: depends_on.clone(),
            workdir: registry.output_dir()?.to_path_buf(),
        };
        let job_ref = self.sink.submit(&job)?;
        tracing::debug!("Submitted {} as {} after {:?}", job_name, job_ref, depends_on);

        for output in &tool.outputs {
            tracking.creators.insert(output.clone(), job_ref.clone());
        }
        for id in tool.inputs.iter().chain(tool.outputs.iter()) {
            if let Some(entity) = registry.get(id).filter(|e| e.is_temp()) {
                let path = entity.path()?.to_path_buf();
                let users = self.temp_users.entry(path).or_default();
                if !users.contains(&job_ref) {
                    users.push(job_ref.clone());
                }
            }
        }

        self.submitted.push(SubmittedJob {
            name: job_name,
            job_ref,
            depends_on,
        });
        Ok(())
    }

    fn run_foreach(
        &mut self,
        foreach: &ForEach,
        registry: &FileRegistry,
        tracking: &mut Tracking,
    ) -> std::result::Result<(), S::Error> {
        let dir = registry.path_of(&foreach.dir)?.to_path_buf();
        let mut names = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(PipelineError::from)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if foreach.file.pattern.is_match(&name) {
                names.push(name);
            }
        }
        tracing::info!(
            "foreach over {}: {} match(es) for '{}'",
            dir.display(),
            names.len(),
            foreach.file.pattern.as_str()
        );

        for name in names {
            let mut child = registry.clone();
            let primary = FileEntity::resolved(
                &foreach.file.id,
                FileKind::File,
                FileFlags {
                    input: foreach.file.input,
                    temp: foreach.file.temp,
                    ..FileFlags::default()
                },
                dir.join(&name),
            );
            child.insert(primary)?;
            for related in &foreach.related {
                let related_name = related
                    .pattern
                    .replace(&name, related.replace.as_deref().unwrap_or(""))
                    .to_string();
                let related_dir = match &related.in_dir {
                    Some(d) => registry.path_of(d)?.to_path_buf(),
                    None => dir.clone(),
                };
                child.insert(FileEntity::resolved(
                    &related.id,
                    FileKind::File,
                    FileFlags {
                        input: related.input,
                        temp: related.temp,
                        ..FileFlags::default()
                    },
                    related_dir.join(related_name),
                ))?;
            }
            let missing = child.missing_inputs();
            if !missing.is_empty() {
                return Err(PipelineError::MissingInputs { missing }.into());
            }

            let mut scoped = Tracking {
                creators: tracking.creators.clone(),
            };
            let stem = Path::new(&name)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| name.clone());
            self.run_steps(&foreach.steps, &child, &mut scoped, Some(&stem))?;

            for (id, job) in scoped.creators {
                if registry.contains(&id) {
                    tracking.creators.insert(id, job);
                }
            }
        }
        Ok(())
    }

    fn submit_cleanup(&mut self, registry: &FileRegistry) -> std::result::Result<(), S::Error> {
        let mut paths: BTreeSet<PathBuf> = registry.temp_paths().into_iter().collect();
        paths.extend(self.temp_users.keys().cloned());
        if paths.is_empty() {
            return Ok(());
        }
        let mut depends_on: Vec<JobRef> = Vec::new();
        for job in self.temp_users.values().flatten() {
            if !depends_on.contains(job) {
                depends_on.push(job.clone());
            }
        }
        let name = self.unique_name(&format!("{}_cleanup", self.pipeline.name));
        let job = BatchJob {
            name: name.clone(),
            kind: JobKind::Cleanup {
                paths: paths.into_iter().collect(),
            },
            depends_on: depends_on.clone(),
            workdir: registry.output_dir()?.to_path_buf(),
        };
        let job_ref = self.sink.submit(&job)?;
        self.submitted.push(SubmittedJob {
            name,
            job_ref,
            depends_on,
        });
        Ok(())
    }
}
