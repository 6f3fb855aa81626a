use crate::constants::DEFAULT_OUTPUT_DIR_ID;
use crate::errors::{PipelineError, Result};
use crate::model::{FileDecl, FileKind};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    Append(String),
    DatestampPrepend(String),
    DatestampAppend(String),
    Substitute { pattern: String, replace: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    Literal(String),
    Parameter(usize),
    BasedOn { base: String, transform: Transform },
    Unnamed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSource {
    Pattern(String),
    Parameter { index: usize, delimiter: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    pub temp: bool,
    pub input: bool,
    pub create: bool,
    pub default_output: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntity {
    pub id: String,
    pub kind: FileKind,
    pub flags: FileFlags,
    pub derivation: Derivation,
    pub in_dir: Option<String>,
    pub list: Option<ListSource>,
    path: Option<PathBuf>,
    value: Option<String>,
    members: Vec<PathBuf>,
    fixed_up: bool,
}

fn validate_datestamp(id: &str, format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(PipelineError::invalid(
            id,
            format!("invalid date format '{}'", format),
        ));
    }
    Ok(())
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| PipelineError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

impl FileEntity {
    pub fn from_decl(decl: &FileDecl) -> Result<Self> {
        let id = decl.id.as_str();
        if id.is_empty() {
            return Err(PipelineError::invalid(id, "file id must not be empty"));
        }

        let literal = match (&decl.path, &decl.value) {
            (Some(_), Some(_)) => {
                return Err(PipelineError::invalid(id, "'path' and 'value' are exclusive"))
            }
            (Some(p), None) | (None, Some(p)) => Some(p.clone()),
            (None, None) => None,
        };
        if decl.value.is_some() && decl.kind != FileKind::String {
            return Err(PipelineError::invalid(id, "'value' is only valid for strings"));
        }

        let sources = [
            literal.is_some(),
            decl.parameter.is_some(),
            decl.based_on.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if sources > 1 {
            return Err(PipelineError::invalid(
                id,
                "at most one of 'path', 'parameter' and 'based_on' may be given",
            ));
        }
        if decl.parameter == Some(0) {
            return Err(PipelineError::invalid(id, "parameters are numbered from 1"));
        }

        let transforms = [
            decl.append.is_some(),
            decl.datestamp_prepend.is_some(),
            decl.datestamp_append.is_some(),
            decl.replace.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if decl.replace.is_some() && decl.pattern.is_none() {
            return Err(PipelineError::invalid(id, "'replace' requires 'pattern'"));
        }
        if decl.based_on.is_some() && transforms != 1 {
            return Err(PipelineError::invalid(
                id,
                "'based_on' requires exactly one of 'append', 'datestamp_prepend', \
                 'datestamp_append' or 'pattern' + 'replace'",
            ));
        }
        if decl.based_on.is_none() && transforms > 0 {
            return Err(PipelineError::invalid(id, "path transforms require 'based_on'"));
        }
        if decl.create && decl.kind != FileKind::Dir {
            return Err(PipelineError::invalid(id, "'create' is only valid for directories"));
        }
        if decl.default_output && decl.kind != FileKind::Dir {
            return Err(PipelineError::invalid(
                id,
                "only a directory can be the default output",
            ));
        }
        if decl.delimiter.is_some() && decl.kind != FileKind::List {
            return Err(PipelineError::invalid(id, "'delimiter' is only valid for lists"));
        }
        if decl.temp && decl.input {
            return Err(PipelineError::invalid(id, "a temporary file cannot be an input"));
        }
        if let Some(f) = decl.datestamp_prepend.as_deref() {
            validate_datestamp(id, f)?;
        }
        if let Some(f) = decl.datestamp_append.as_deref() {
            validate_datestamp(id, f)?;
        }
        if let Some(p) = decl.pattern.as_deref() {
            compile_regex(p)?;
        }

        let mut list = None;
        let derivation = match decl.kind {
            FileKind::String => {
                if decl.temp || decl.in_dir.is_some() || decl.based_on.is_some() {
                    return Err(PipelineError::invalid(
                        id,
                        "strings cannot be temporary, placed in a directory or based on a file",
                    ));
                }
                match (literal, decl.parameter) {
                    (Some(v), _) => Derivation::Literal(v),
                    (None, Some(i)) => Derivation::Parameter(i),
                    (None, None) => {
                        return Err(PipelineError::invalid(
                            id,
                            "a string needs a 'value' or a 'parameter'",
                        ))
                    }
                }
            }
            FileKind::List => {
                if decl.temp || decl.based_on.is_some() || literal.is_some() {
                    return Err(PipelineError::invalid(
                        id,
                        "a list is either a 'pattern' or a 'parameter'",
                    ));
                }
                list = Some(match (&decl.pattern, decl.parameter) {
                    (Some(pattern), None) => ListSource::Pattern(pattern.clone()),
                    (None, Some(index)) => ListSource::Parameter {
                        index,
                        delimiter: decl.delimiter.clone().unwrap_or_else(|| ",".to_string()),
                    },
                    _ => {
                        return Err(PipelineError::invalid(
                            id,
                            "a list needs exactly one of 'pattern' or 'parameter'",
                        ))
                    }
                });
                Derivation::Unnamed
            }
            FileKind::File | FileKind::Dir => {
                if decl.pattern.is_some() && decl.based_on.is_none() {
                    return Err(PipelineError::invalid(id, "'pattern' requires 'based_on'"));
                }
                if let Some(base) = &decl.based_on {
                    let transform = if let Some(s) = &decl.append {
                        Transform::Append(s.clone())
                    } else if let Some(f) = &decl.datestamp_prepend {
                        Transform::DatestampPrepend(f.clone())
                    } else if let Some(f) = &decl.datestamp_append {
                        Transform::DatestampAppend(f.clone())
                    } else {
                        Transform::Substitute {
                            pattern: decl.pattern.clone().unwrap_or_default(),
                            replace: decl.replace.clone().unwrap_or_default(),
                        }
                    };
                    Derivation::BasedOn {
                        base: base.clone(),
                        transform,
                    }
                } else if let Some(p) = literal {
                    Derivation::Literal(p)
                } else if let Some(i) = decl.parameter {
                    Derivation::Parameter(i)
                } else if decl.temp || decl.default_output {
                    Derivation::Unnamed
                } else {
                    return Err(PipelineError::invalid(
                        id,
                        "needs a 'path', a 'parameter', 'based_on', or 'temp = true'",
                    ));
                }
            }
        };

        Ok(Self {
            id: id.to_string(),
            kind: decl.kind,
            flags: FileFlags {
                temp: decl.temp,
                input: decl.input,
                create: decl.create,
                default_output: decl.default_output,
            },
            derivation,
            in_dir: decl.in_dir.clone(),
            list,
            path: None,
            value: None,
            members: Vec::new(),
            fixed_up: false,
        })
    }

    /// An entity that is already resolved, used for bindings and foreach matches.
    pub fn resolved(id: &str, kind: FileKind, flags: FileFlags, path: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            kind,
            flags,
            derivation: Derivation::Literal(path.to_string_lossy().to_string()),
            in_dir: None,
            list: None,
            path: Some(path),
            value: None,
            members: Vec::new(),
            fixed_up: true,
        }
    }

    /// Copy of a resolved entity registered under another id.
    pub fn alias(&self, id: &str) -> Self {
        let mut copy = self.clone();
        copy.id = id.to_string();
        copy.flags.default_output = false;
        copy
    }

    fn is_bare_reference(decl: &FileDecl) -> bool {
        decl.path.is_none()
            && decl.value.is_none()
            && decl.parameter.is_none()
            && decl.based_on.is_none()
            && !decl.temp
            && !decl.default_output
            && decl.kind != FileKind::Dir
    }

    pub fn is_fixed_up(&self) -> bool {
        self.fixed_up
    }

    pub fn is_temp(&self) -> bool {
        self.flags.temp
    }

    pub fn is_input(&self) -> bool {
        self.flags.input
    }

    pub fn path(&self) -> Result<&Path> {
        if !self.fixed_up {
            return Err(PipelineError::NotFixedUp(self.id.clone()));
        }
        self.path
            .as_deref()
            .ok_or_else(|| PipelineError::invalid(&self.id, "has no path"))
    }

    pub fn members(&self) -> &[PathBuf] {
        &self.members
    }

    /// Text substituted for this entity in command templates.
    pub fn render(&self) -> Result<String> {
        if !self.fixed_up {
            return Err(PipelineError::NotFixedUp(self.id.clone()));
        }
        match self.kind {
            FileKind::String => Ok(self.value.clone().unwrap_or_default()),
            FileKind::List if !self.members.is_empty() => Ok(self
                .members
                .iter()
                .map(|m| m.to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(" ")),
            _ => Ok(self.path()?.to_string_lossy().to_string()),
        }
    }
}

pub struct FixUpContext<'a> {
    pub params: &'a [String],
    pub cwd: PathBuf,
    pub directory_version: bool,
    pub now: DateTime<Local>,
}

impl<'a> FixUpContext<'a> {
    pub fn new(params: &'a [String]) -> Result<Self> {
        Ok(Self {
            params,
            cwd: std::env::current_dir()?,
            directory_version: false,
            now: Local::now(),
        })
    }

    fn param(&self, id: &str, index: usize) -> Result<&'a str> {
        if index == 0 || index > self.params.len() {
            return Err(PipelineError::TooFewParameters {
                id: id.to_string(),
                index,
                supplied: self.params.len(),
            });
        }
        Ok(self.params[index - 1].as_str())
    }

    fn datestamp(&self, id: &str, format: &str) -> Result<String> {
        let mut out = String::new();
        write!(out, "{}", self.now.format(format)).map_err(|_| {
            PipelineError::invalid(id, format!("invalid date format '{}'", format))
        })?;
        Ok(out)
    }

    fn absolute(&self, path: PathBuf) -> PathBuf {
        let joined = if path.is_relative() {
            self.cwd.join(path)
        } else {
            path
        };
        joined.components().collect()
    }
}

fn has_dir_component(path: &str) -> bool {
    Path::new(path)
        .parent()
        .is_some_and(|p| !p.as_os_str().is_empty())
}

fn split_dir_and_name(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..=pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    entities: BTreeMap<String, FileEntity>,
    default_output: Option<String>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_decls(decls: &[FileDecl]) -> Result<Self> {
        let mut registry = Self::new();
        for decl in decls {
            registry.add_decl(decl)?;
        }
        Ok(registry)
    }

    pub fn add_decl(&mut self, decl: &FileDecl) -> Result<()> {
        if self.entities.contains_key(&decl.id) {
            if FileEntity::is_bare_reference(decl) {
                tracing::debug!("Ignoring compatible redeclaration of '{}'", decl.id);
                return Ok(());
            }
            return Err(PipelineError::DuplicateFile(decl.id.clone()));
        }
        self.insert(FileEntity::from_decl(decl)?)
    }

    pub fn insert(&mut self, entity: FileEntity) -> Result<()> {
        if self.entities.contains_key(&entity.id) {
            return Err(PipelineError::DuplicateFile(entity.id.clone()));
        }
        if entity.flags.default_output {
            if let Some(first) = &self.default_output {
                return Err(PipelineError::MultipleDefaultOutputs {
                    first: first.clone(),
                    second: entity.id.clone(),
                });
            }
            self.default_output = Some(entity.id.clone());
        }
        self.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&FileEntity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entities.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn default_output_id(&self) -> Option<&str> {
        self.default_output.as_deref()
    }

    pub fn output_dir(&self) -> Result<&Path> {
        let entity = self
            .default_output
            .as_ref()
            .and_then(|id| self.entities.get(id))
            .ok_or(PipelineError::OutputDirNotFixedUp)?;
        if !entity.fixed_up {
            return Err(PipelineError::OutputDirNotFixedUp);
        }
        entity.path()
    }

    pub fn path_of(&self, id: &str) -> Result<&Path> {
        self.entities
            .get(id)
            .ok_or_else(|| PipelineError::invalid(id, "is not declared"))?
            .path()
    }

    pub fn temp_paths(&self) -> Vec<PathBuf> {
        self.entities
            .values()
            .filter(|e| e.flags.temp)
            .filter_map(|e| e.path.clone())
            .collect()
    }

    /// Input files and directories that do not exist after fix-up.
    pub fn missing_inputs(&self) -> Vec<String> {
        let mut missing = Vec::new();
        for entity in self.entities.values().filter(|e| e.flags.input) {
            match entity.kind {
                FileKind::File | FileKind::Dir => {
                    if let Some(p) = &entity.path {
                        if !p.exists() {
                            missing.push(format!("{} ({})", p.display(), entity.id));
                        }
                    }
                }
                FileKind::List => {
                    for m in entity.members.iter().filter(|m| !m.exists()) {
                        missing.push(format!("{} ({})", m.display(), entity.id));
                    }
                }
                FileKind::String => {}
            }
        }
        missing
    }

    fn ensure_default_output(&mut self, ctx: &FixUpContext<'_>) -> Result<()> {
        if self.default_output.is_some() {
            return Ok(());
        }
        let entity = FileEntity {
            id: DEFAULT_OUTPUT_DIR_ID.to_string(),
            kind: FileKind::Dir,
            flags: FileFlags {
                create: true,
                default_output: true,
                ..FileFlags::default()
            },
            derivation: Derivation::Literal(ctx.cwd.to_string_lossy().to_string()),
            in_dir: None,
            list: None,
            path: None,
            value: None,
            members: Vec::new(),
            fixed_up: false,
        };
        self.insert(entity)
    }

    pub fn fix_up_all(&mut self, ctx: &FixUpContext<'_>) -> Result<()> {
        self.ensure_default_output(ctx)?;
        let mut stack = Vec::new();
        if let Some(out_id) = self.default_output.clone() {
            self.fix_up(&out_id, ctx, &mut stack)?;
        }
        let ids: Vec<String> = self.entities.keys().cloned().collect();
        for id in ids {
            self.fix_up(&id, ctx, &mut stack)?;
        }
        Ok(())
    }

    fn fix_up_reference(
        &mut self,
        id: &str,
        reference: &str,
        ctx: &FixUpContext<'_>,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        if !self.entities.contains_key(reference) {
            return Err(PipelineError::UnknownReference {
                id: id.to_string(),
                reference: reference.to_string(),
                chain: stack.clone(),
            });
        }
        self.fix_up(reference, ctx, stack)
    }

    pub fn fix_up(
        &mut self,
        id: &str,
        ctx: &FixUpContext<'_>,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| PipelineError::UnknownReference {
                id: stack.last().cloned().unwrap_or_default(),
                reference: id.to_string(),
                chain: stack.clone(),
            })?
            .clone();
        if entity.fixed_up {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|s| s == id) {
            let mut chain = stack[pos..].to_vec();
            chain.push(id.to_string());
            return Err(PipelineError::DependencyCycle { chain });
        }
        stack.push(id.to_string());

        let resolved = match entity.kind {
            FileKind::String => self.resolve_string(&entity, ctx)?,
            FileKind::List => self.resolve_list(&entity, ctx, stack)?,
            FileKind::File | FileKind::Dir => self.resolve_path(&entity, ctx, stack)?,
        };

        if let Some(slot) = self.entities.get_mut(id) {
            *slot = resolved;
        }

        match stack.pop() {
            Some(top) if top == id => Ok(()),
            Some(top) => Err(PipelineError::StackMismatch {
                expected: id.to_string(),
                found: top,
            }),
            None => Err(PipelineError::StackMismatch {
                expected: id.to_string(),
                found: String::new(),
            }),
        }
    }

    fn resolve_string(&self, entity: &FileEntity, ctx: &FixUpContext<'_>) -> Result<FileEntity> {
        let value = match &entity.derivation {
            Derivation::Literal(v) => v.clone(),
            Derivation::Parameter(i) => ctx.param(&entity.id, *i)?.to_string(),
            _ => String::new(),
        };
        let mut resolved = entity.clone();
        resolved.value = Some(value);
        resolved.derivation = Derivation::Literal(resolved.value.clone().unwrap_or_default());
        resolved.fixed_up = true;
        Ok(resolved)
    }

    fn containing_dir(
        &mut self,
        entity: &FileEntity,
        ctx: &FixUpContext<'_>,
        stack: &mut Vec<String>,
    ) -> Result<Option<PathBuf>> {
        let dir_id = match &entity.in_dir {
            Some(d) => d.clone(),
            None => return Ok(None),
        };
        self.fix_up_reference(&entity.id, &dir_id, ctx, stack)?;
        Ok(Some(self.path_of(&dir_id)?.to_path_buf()))
    }

    fn output_dir_for(
        &mut self,
        entity: &FileEntity,
        ctx: &FixUpContext<'_>,
        stack: &mut Vec<String>,
    ) -> Result<PathBuf> {
        let out_id = self
            .default_output
            .clone()
            .ok_or(PipelineError::OutputDirNotFixedUp)?;
        self.fix_up_reference(&entity.id, &out_id, ctx, stack)?;
        Ok(self.output_dir()?.to_path_buf())
    }

    fn resolve_list(
        &mut self,
        entity: &FileEntity,
        ctx: &FixUpContext<'_>,
        stack: &mut Vec<String>,
    ) -> Result<FileEntity> {
        let mut resolved = entity.clone();
        match &entity.list {
            Some(ListSource::Pattern(_)) => {
                let dir = match self.containing_dir(entity, ctx, stack)? {
                    Some(d) => d,
                    None => self.output_dir_for(entity, ctx, stack)?,
                };
                resolved.path = Some(ctx.absolute(dir));
            }
            Some(ListSource::Parameter { index, delimiter }) => {
                let raw = ctx.param(&entity.id, *index)?;
                resolved.members = raw
                    .split(delimiter.as_str())
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(|m| ctx.absolute(PathBuf::from(m)))
                    .collect();
            }
            None => {
                return Err(PipelineError::invalid(&entity.id, "list has no source"));
            }
        }
        resolved.fixed_up = true;
        Ok(resolved)
    }

    fn apply_transform(
        &self,
        id: &str,
        base_path: &str,
        transform: &Transform,
        ctx: &FixUpContext<'_>,
    ) -> Result<String> {
        match transform {
            Transform::Append(suffix) => Ok(format!("{}{}", base_path, suffix)),
            Transform::DatestampAppend(format) => {
                Ok(format!("{}{}", base_path, ctx.datestamp(id, format)?))
            }
            Transform::DatestampPrepend(format) => {
                let (dir, name) = split_dir_and_name(base_path);
                Ok(format!("{}{}{}", dir, ctx.datestamp(id, format)?, name))
            }
            Transform::Substitute { pattern, replace } => {
                let re = compile_regex(pattern)?;
                let (dir, name) = split_dir_and_name(base_path);
                Ok(format!("{}{}", dir, re.replace_all(name, replace.as_str())))
            }
        }
    }

    fn resolve_path(
        &mut self,
        entity: &FileEntity,
        ctx: &FixUpContext<'_>,
        stack: &mut Vec<String>,
    ) -> Result<FileEntity> {
        let raw: Option<String> = match &entity.derivation {
            Derivation::Literal(p) => Some(p.clone()),
            Derivation::Parameter(i) => Some(ctx.param(&entity.id, *i)?.to_string()),
            Derivation::BasedOn { base, transform } => {
                self.fix_up_reference(&entity.id, base, ctx, stack)?;
                let base_entity = self
                    .entities
                    .get(base)
                    .ok_or_else(|| PipelineError::invalid(base, "is not declared"))?;
                let base_path = match base_entity.kind {
                    FileKind::String => base_entity.render()?,
                    FileKind::List => {
                        return Err(PipelineError::invalid(
                            &entity.id,
                            format!("cannot be based on list '{}'", base),
                        ))
                    }
                    _ => base_entity.path()?.to_string_lossy().to_string(),
                };
                Some(self.apply_transform(&entity.id, &base_path, transform, ctx)?)
            }
            Derivation::Unnamed => None,
        };

        let explicit_dir = self.containing_dir(entity, ctx, stack)?;
        let is_output_dir = entity.flags.default_output;

        let mut path = match raw {
            Some(p) => match &explicit_dir {
                Some(dir) => {
                    let (_, name) = split_dir_and_name(&p);
                    dir.join(name)
                }
                None if !has_dir_component(&p) && !entity.flags.input && !is_output_dir => {
                    self.output_dir_for(entity, ctx, stack)?.join(p)
                }
                None => PathBuf::from(p),
            },
            None if is_output_dir => ctx.cwd.clone(),
            None => {
                let dir = match explicit_dir {
                    Some(d) => d,
                    None => self.output_dir_for(entity, ctx, stack)?,
                };
                allocate_temp(&entity.id, entity.kind, &dir)?
            }
        };

        path = ctx.absolute(path);

        if is_output_dir && ctx.directory_version {
            let stamped = format!(
                "{}-{}-{}",
                path.to_string_lossy().trim_end_matches('/'),
                ctx.now.format("%Y%m%d_%H%M%S"),
                std::process::id()
            );
            path = PathBuf::from(stamped);
        }

        if is_output_dir || (entity.kind == FileKind::Dir && entity.flags.create) {
            fs_err::create_dir_all(&path)?;
        }

        let mut resolved = entity.clone();
        resolved.derivation = Derivation::Literal(path.to_string_lossy().to_string());
        resolved.path = Some(path);
        resolved.fixed_up = true;
        Ok(resolved)
    }
}

fn allocate_temp(id: &str, kind: FileKind, dir: &Path) -> Result<PathBuf> {
    fs_err::create_dir_all(dir)?;
    let prefix = format!("{}.", id.replace(['/', ' '], "_"));
    let path = match kind {
        FileKind::Dir => tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(dir)?
            .keep(),
        _ => {
            let (_file, path) = tempfile::Builder::new()
                .prefix(&prefix)
                .tempfile_in(dir)?
                .keep()
                .map_err(|e| e.error)?;
            path
        }
    };
    tracing::debug!("Allocated temporary {} '{}' at {}", kind, id, path.display());
    Ok(path)
}
