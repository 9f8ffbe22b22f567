//! Breakpoint management for a DBGP session.
//!
//! Every breakpoint gets a manager id that is never reused. Line targets
//! are resolved against the scanner before they reach the engine, and the
//! engine's own line is adopted once it accepts a breakpoint. Removing a
//! breakpoint removes it from the engine first; if that fails the
//! breakpoint stays.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahkdbg_dbgp::{path_to_uri, same_file, Command, DbgpError, EngineError, Session};
use ahkdbg_scanner::{find_function, resolve_line, LineResolution, ScannedFile, Scanner};

use crate::condition::HitCondition;
use crate::error::AdapterError;
use crate::protocol::{BreakpointResponse, Source};

/// Whether the engine should stop on a breakpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BreakpointState {
    #[default]
    Enabled,
    Disabled,
}

impl BreakpointState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakpointState::Enabled => "enabled",
            BreakpointState::Disabled => "disabled",
        }
    }
}

/// A file/line binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTarget {
    pub file: PathBuf,
    /// Line the breakpoint is bound to (1-based).
    pub line: u32,
    pub character: Option<u32>,
    pub verified: bool,
    /// Line the front end asked for.
    pub unverified_line: u32,
}

/// A function looked up by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionTarget {
    /// `Func` or `Class.Method`.
    pub name: String,
    /// File and line the name resolved to.
    pub location: Option<(PathBuf, u32)>,
}

/// What a breakpoint is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    Line(LineTarget),
    /// Prints `log_message` instead of stopping.
    Log {
        target: LineTarget,
        log_message: String,
    },
    /// Function entry.
    Function(FunctionTarget),
    /// Function return (its closing brace).
    Return(FunctionTarget),
    /// Any thrown exception.
    Exception,
}

/// A breakpoint known to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Manager id, stable for the manager's lifetime.
    pub id: u32,
    /// Engine id, once the engine accepted the breakpoint.
    pub engine_id: Option<u32>,
    pub state: BreakpointState,
    /// Removed by the engine after the first hit.
    pub temporary: bool,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub kind: BreakpointKind,
    /// Why the breakpoint is not verified.
    pub message: Option<String>,
}

impl Breakpoint {
    /// Bound to executable code and accepted by the engine.
    pub fn verified(&self) -> bool {
        let bound = match &self.kind {
            BreakpointKind::Line(target) | BreakpointKind::Log { target, .. } => target.verified,
            BreakpointKind::Function(target) | BreakpointKind::Return(target) => {
                target.location.is_some()
            }
            BreakpointKind::Exception => true,
        };
        bound && self.engine_id.is_some()
    }

    /// File and line the breakpoint is bound to.
    pub fn location(&self) -> Option<(&Path, u32)> {
        match &self.kind {
            BreakpointKind::Line(target) | BreakpointKind::Log { target, .. } => {
                Some((target.file.as_path(), target.line))
            }
            BreakpointKind::Function(target) | BreakpointKind::Return(target) => target
                .location
                .as_ref()
                .map(|(file, line)| (file.as_path(), *line)),
            BreakpointKind::Exception => None,
        }
    }

    pub fn log_message(&self) -> Option<&str> {
        match &self.kind {
            BreakpointKind::Log { log_message, .. } => Some(log_message),
            _ => None,
        }
    }

    /// Shape reported to the front end.
    pub fn to_response(&self) -> BreakpointResponse {
        let location = self.location();
        let column = match &self.kind {
            BreakpointKind::Line(target) | BreakpointKind::Log { target, .. } => target.character,
            _ => None,
        };
        BreakpointResponse {
            id: Some(self.id),
            verified: self.verified(),
            message: self.message.clone(),
            source: location.map(|(file, _)| Source::from_path(file)),
            line: location.map(|(_, line)| line),
            column,
        }
    }
}

/// What to set, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointRequest {
    Line {
        file: PathBuf,
        line: u32,
        character: Option<u32>,
        log_message: Option<String>,
    },
    Function {
        name: String,
        on_return: bool,
    },
    Exception,
}

/// Input to [`BreakpointManager::set_breakpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointData {
    pub request: BreakpointRequest,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub temporary: bool,
    pub state: BreakpointState,
}

impl BreakpointData {
    fn new(request: BreakpointRequest) -> Self {
        Self {
            request,
            condition: None,
            hit_condition: None,
            temporary: false,
            state: BreakpointState::Enabled,
        }
    }

    pub fn line(file: impl Into<PathBuf>, line: u32) -> Self {
        Self::new(BreakpointRequest::Line {
            file: file.into(),
            line,
            character: None,
            log_message: None,
        })
    }

    pub fn function(name: impl Into<String>) -> Self {
        Self::new(BreakpointRequest::Function {
            name: name.into(),
            on_return: false,
        })
    }

    pub fn on_return(name: impl Into<String>) -> Self {
        Self::new(BreakpointRequest::Function {
            name: name.into(),
            on_return: true,
        })
    }

    pub fn exception() -> Self {
        Self::new(BreakpointRequest::Exception)
    }

    /// Only stop when `condition` is true. Blank conditions are ignored.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        let condition = condition.into();
        self.condition = (!condition.trim().is_empty()).then_some(condition);
        self
    }

    pub fn with_hit_condition(mut self, hit_condition: impl Into<String>) -> Self {
        let hit_condition = hit_condition.into();
        self.hit_condition = (!hit_condition.trim().is_empty()).then_some(hit_condition);
        self
    }

    /// Turn a line breakpoint into a logpoint.
    pub fn with_log_message(mut self, message: impl Into<String>) -> Self {
        if let BreakpointRequest::Line { log_message, .. } = &mut self.request {
            *log_message = Some(message.into());
        }
        self
    }

    pub fn with_character(mut self, column: u32) -> Self {
        if let BreakpointRequest::Line { character, .. } = &mut self.request {
            *character = Some(column);
        }
        self
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.state = BreakpointState::Disabled;
        self
    }
}

/// Files scanned during one manager call.
#[derive(Default)]
struct ScanCache {
    files: HashMap<PathBuf, Option<ScannedFile>>,
}

/// Manages the breakpoints of one engine connection.
pub struct BreakpointManager {
    session: Session,
    scanner: Arc<Scanner>,
    program: PathBuf,
    breakpoints: BTreeMap<u32, Breakpoint>,
    next_id: u32,
}

impl BreakpointManager {
    /// `program` is the main script; function names are looked up in it and
    /// everything it includes.
    pub fn new(session: Session, scanner: Arc<Scanner>, program: impl Into<PathBuf>) -> Self {
        Self {
            session,
            scanner,
            program: program.into(),
            breakpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Resolve, install and record a breakpoint.
    ///
    /// An unresolvable target or an engine rejection yields an unverified
    /// breakpoint, not an error. Only session failures are errors.
    pub async fn set_breakpoint(&mut self, data: BreakpointData) -> Result<Breakpoint, AdapterError> {
        let mut cache = ScanCache::default();
        self.set_with_cache(data, &mut cache).await
    }

    pub async fn set_line_breakpoint(
        &mut self,
        file: impl Into<PathBuf>,
        line: u32,
    ) -> Result<Breakpoint, AdapterError> {
        self.set_breakpoint(BreakpointData::line(file, line)).await
    }

    /// Replace every line and log breakpoint in `file` with `requests`.
    pub async fn set_line_breakpoints(
        &mut self,
        file: &Path,
        requests: Vec<BreakpointData>,
    ) -> Result<Vec<Breakpoint>, AdapterError> {
        self.remove_breakpoints_by_file(file).await?;
        let mut cache = ScanCache::default();
        let mut set = Vec::with_capacity(requests.len());
        for data in requests {
            set.push(self.set_with_cache(data, &mut cache).await?);
        }
        Ok(set)
    }

    /// Turn breaking on exceptions on or off. There is never more than one
    /// exception breakpoint.
    pub async fn set_exception_breakpoint(
        &mut self,
        enable: bool,
    ) -> Result<Option<Breakpoint>, AdapterError> {
        let existing = self
            .breakpoints
            .values()
            .find(|bp| bp.kind == BreakpointKind::Exception)
            .map(|bp| bp.id);
        match (enable, existing) {
            (true, Some(id)) => Ok(self.breakpoints.get(&id).cloned()),
            (true, None) => self.set_breakpoint(BreakpointData::exception()).await.map(Some),
            (false, Some(id)) => {
                self.remove_breakpoint_by_id(id).await?;
                Ok(None)
            }
            (false, None) => Ok(None),
        }
    }

    /// Remove a breakpoint. Unknown ids yield an empty list.
    pub async fn remove_breakpoint_by_id(&mut self, id: u32) -> Result<Vec<Breakpoint>, AdapterError> {
        let Some(bp) = self.breakpoints.get(&id) else {
            return Ok(Vec::new());
        };
        if let Some(engine_id) = bp.engine_id {
            let command = Command::new("breakpoint_remove").arg('d', engine_id);
            match self.session.send_command(command).await {
                Ok(_) => {}
                Err(DbgpError::Engine(err)) if err.code == EngineError::NO_SUCH_BREAKPOINT => {
                    tracing::debug!("breakpoint {} already gone from engine", engine_id);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(self.breakpoints.remove(&id).into_iter().collect())
    }

    /// Remove every line and log breakpoint in `file`.
    pub async fn remove_breakpoints_by_file(&mut self, file: &Path) -> Result<Vec<Breakpoint>, AdapterError> {
        let ids: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|bp| match &bp.kind {
                BreakpointKind::Line(target) | BreakpointKind::Log { target, .. } => {
                    same_file(&target.file, file)
                }
                _ => false,
            })
            .map(|bp| bp.id)
            .collect();
        self.remove_all(ids).await
    }

    /// Remove every function and return breakpoint.
    pub async fn remove_function_breakpoints(&mut self) -> Result<Vec<Breakpoint>, AdapterError> {
        let ids: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|bp| matches!(bp.kind, BreakpointKind::Function(_) | BreakpointKind::Return(_)))
            .map(|bp| bp.id)
            .collect();
        self.remove_all(ids).await
    }

    pub fn get_breakpoint_by_id(&self, id: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&id)
    }

    /// Breakpoints bound to `file:line`, in id order.
    pub fn get_breakpoints_by_line(&self, file: &Path, line: u32) -> Vec<&Breakpoint> {
        self.breakpoints
            .values()
            .filter(|bp| {
                bp.location()
                    .is_some_and(|(f, l)| l == line && same_file(f, file))
            })
            .collect()
    }

    /// Every breakpoint, in id order.
    pub fn get_all_breakpoints(&self) -> Vec<&Breakpoint> {
        self.breakpoints.values().collect()
    }

    async fn remove_all(&mut self, ids: Vec<u32>) -> Result<Vec<Breakpoint>, AdapterError> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.extend(self.remove_breakpoint_by_id(id).await?);
        }
        Ok(removed)
    }

    async fn set_with_cache(
        &mut self,
        data: BreakpointData,
        cache: &mut ScanCache,
    ) -> Result<Breakpoint, AdapterError> {
        if data.request == BreakpointRequest::Exception {
            if let Some(existing) = self
                .breakpoints
                .values()
                .find(|bp| bp.kind == BreakpointKind::Exception)
            {
                return Ok(existing.clone());
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut message = None;
        let kind = match data.request {
            BreakpointRequest::Line {
                file,
                line,
                character,
                log_message,
            } => {
                let resolution = self.resolve_line(cache, &file, line);
                if !resolution.verified {
                    message = Some(format!("no executable code at or after line {line}"));
                }
                let target = LineTarget {
                    file,
                    line: resolution.line,
                    character,
                    verified: resolution.verified,
                    unverified_line: line,
                };
                match log_message {
                    Some(log_message) => BreakpointKind::Log {
                        target,
                        log_message,
                    },
                    None => BreakpointKind::Line(target),
                }
            }
            BreakpointRequest::Function { name, on_return } => {
                let location = self.resolve_function(cache, &name, on_return);
                if location.is_none() {
                    message = Some(AdapterError::Resolution(format!("function `{name}`")).to_string());
                }
                let target = FunctionTarget { name, location };
                if on_return {
                    BreakpointKind::Return(target)
                } else {
                    BreakpointKind::Function(target)
                }
            }
            BreakpointRequest::Exception => BreakpointKind::Exception,
        };

        let mut bp = Breakpoint {
            id,
            engine_id: None,
            state: data.state,
            temporary: data.temporary,
            condition: data.condition,
            hit_condition: data.hit_condition,
            kind,
            message,
        };

        let installable = !matches!(
            &bp.kind,
            BreakpointKind::Function(FunctionTarget { location: None, .. })
                | BreakpointKind::Return(FunctionTarget { location: None, .. })
        );
        if installable {
            let hit = bp.hit_condition.as_deref().map(HitCondition::parse).transpose();
            match hit {
                Ok(hit) => self.install(&mut bp, hit.flatten()).await?,
                Err(err) => {
                    tracing::warn!("breakpoint {} not set: {}", id, err);
                    bp.message = Some(err.to_string());
                    mark_unverified(&mut bp);
                }
            }
        }

        self.breakpoints.insert(id, bp.clone());
        Ok(bp)
    }

    async fn install(&self, bp: &mut Breakpoint, hit: Option<HitCondition>) -> Result<(), AdapterError> {
        let command = set_command(bp, hit);
        let response = match self.session.send_command(command).await {
            Ok(response) => response,
            Err(DbgpError::Engine(err)) => {
                tracing::warn!("engine rejected breakpoint {}: {}", bp.id, err);
                bp.message = Some(err.message.clone());
                mark_unverified(bp);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let Some(engine_id) = response.breakpoint_id() else {
            tracing::warn!("breakpoint_set response without an id");
            bp.message = Some("engine did not return a breakpoint id".to_string());
            mark_unverified(bp);
            return Ok(());
        };
        bp.engine_id = Some(engine_id);

        if let Some(line) = self.engine_line(engine_id).await? {
            adopt_line(bp, line);
        }
        tracing::debug!("breakpoint {} installed as engine breakpoint {}", bp.id, engine_id);
        Ok(())
    }

    /// The line the engine actually bound `engine_id` to.
    async fn engine_line(&self, engine_id: u32) -> Result<Option<u32>, AdapterError> {
        let command = Command::new("breakpoint_get").arg('d', engine_id);
        match self.session.send_command(command).await {
            Ok(response) => Ok(response.breakpoints().first().and_then(|b| b.line)),
            Err(DbgpError::Engine(err)) => {
                tracing::debug!("breakpoint_get {} failed: {}", engine_id, err);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn resolve_line(&self, cache: &mut ScanCache, file: &Path, line: u32) -> LineResolution {
        match self.scanned(cache, file) {
            Some(scanned) => resolve_line(scanned, line),
            None => LineResolution {
                line,
                verified: false,
            },
        }
    }

    fn resolve_function(&self, cache: &mut ScanCache, name: &str, on_return: bool) -> Option<(PathBuf, u32)> {
        let nodes = match self.scanner.find(&self.program) {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::warn!("cannot scan {}: {}", self.program.display(), err);
                return None;
            }
        };
        let func = find_function(&nodes, name)?;
        let file = func.location.source_file.clone();
        let line = if on_return {
            func.return_line()
        } else {
            let start = func.location.start.line;
            self.resolve_line(cache, &file, start).line
        };
        Some((file, line))
    }

    fn scanned<'c>(&self, cache: &'c mut ScanCache, file: &Path) -> Option<&'c ScannedFile> {
        cache
            .files
            .entry(file.to_path_buf())
            .or_insert_with(|| match self.scanner.scan_file(file) {
                Ok(scanned) => Some(scanned),
                Err(err) => {
                    tracing::warn!("cannot resolve breakpoint lines: {}", err);
                    None
                }
            })
            .as_ref()
    }
}

fn set_command(bp: &Breakpoint, hit: Option<HitCondition>) -> Command {
    let conditional = bp.condition.is_some();
    let mut command = Command::new("breakpoint_set");
    command = match bp.location() {
        Some((file, line)) => command
            .arg('t', if conditional { "conditional" } else { "line" })
            .arg('f', path_to_uri(file))
            .arg('n', line),
        None => command.arg('t', "exception"),
    };
    command = command.arg('s', bp.state.as_str());
    if bp.temporary {
        command = command.arg('r', 1);
    }
    if let Some(hit) = hit {
        command = command.arg('h', hit.value).arg('o', hit.operator.as_str());
    }
    if let Some(condition) = &bp.condition {
        command = command.data(condition.clone());
    }
    command
}

fn mark_unverified(bp: &mut Breakpoint) {
    match &mut bp.kind {
        BreakpointKind::Line(target) | BreakpointKind::Log { target, .. } => {
            target.verified = false;
            target.line = target.unverified_line;
        }
        BreakpointKind::Function(_) | BreakpointKind::Return(_) | BreakpointKind::Exception => {}
    }
}

fn adopt_line(bp: &mut Breakpoint, line: u32) {
    match &mut bp.kind {
        BreakpointKind::Line(target) | BreakpointKind::Log { target, .. } if target.verified => {
            target.line = line;
        }
        BreakpointKind::Function(FunctionTarget {
            location: Some((_, bound)),
            ..
        })
        | BreakpointKind::Return(FunctionTarget {
            location: Some((_, bound)),
            ..
        }) => *bound = line,
        _ => {}
    }
}
