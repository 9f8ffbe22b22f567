//! Structural scan of AutoHotkey sources.
//!
//! The scan runs once over each file, top to bottom. Regexes only recognise
//! line-anchored openers (include directives, classes, functions and
//! properties); block extents are found with a brace-depth loop over the
//! masked text so comments and strings never count.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::ScanError;
use crate::include::{parse_directive_argument, resolve_include, IncludeContext};
use crate::mask::mask_source;
use crate::node::{
    ClassNode, FunctionNode, IncludeNode, Location, Position, PropertyNode, SkipNode, SourceNode,
};

/// Words that look like `name(` but open control flow, not a function.
const KEYWORDS: &[&str] = &[
    "if", "else", "while", "for", "loop", "switch", "case", "catch", "try", "finally", "until",
    "return", "throw", "not", "and", "or", "is", "in", "contains", "global", "local", "static",
    "class", "goto", "break", "continue", "get", "set",
];

struct Patterns {
    block_comment: Regex,
    include: Regex,
    directive: Regex,
    class: Regex,
    function: Regex,
    property: Regex,
    accessor: Regex,
}

impl Patterns {
    fn new() -> Result<Self, ScanError> {
        Ok(Self {
            block_comment: compile("block_comment", r"^[ \t]*/\*")?,
            include: compile("include", r"(?i)^[ \t]*#include(again)?\b(.*)$")?,
            directive: compile("directive", r"^[ \t]*#\w+")?,
            class: compile(
                "class",
                r"(?i)^[ \t]*class[ \t]+([\w.$]+)(?:[ \t]+extends[ \t]+([\w.$]+))?[ \t]*(?:(\{)|$)",
            )?,
            function: compile("function", r"(?i)^[ \t]*(?:(static)[ \t]+)?([\w#@$]+)\(")?,
            property: compile(
                "property",
                r"(?i)^[ \t]*(?:(static)[ \t]+)?([\w$]+)[ \t]*(\[[^\]]*\])?[ \t]*(?:(\{)[ \t]*|(=>).*)?$",
            )?,
            accessor: compile("accessor", r"(?i)^[ \t]*(get|set)[ \t]*(?:(\{)[ \t]*|(=>).*)?$")?,
        })
    }
}

fn compile(name: &'static str, pattern: &str) -> Result<Regex, ScanError> {
    Regex::new(pattern).map_err(|e| ScanError::InvalidPattern {
        name,
        detail: e.to_string(),
    })
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// One scanned file: its text, masked copy and top-level nodes.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub text: String,
    pub masked: String,
    pub nodes: Vec<SourceNode>,
    line_starts: Vec<usize>,
}

impl ScannedFile {
    /// Number of lines, counting a final line without a newline.
    pub fn line_count(&self) -> u32 {
        self.line_starts.len() as u32
    }

    /// Masked text of a 1-based line, without its line break.
    pub fn masked_line(&self, line: u32) -> Option<&str> {
        let idx = (line as usize).checked_sub(1)?;
        let (start, end) = line_bounds(&self.line_starts, &self.masked, idx)?;
        Some(&self.masked[start..end])
    }
}

/// Include recursion state for one `find` call.
struct Walk {
    visited: HashSet<PathBuf>,
    follow: bool,
}

/// A file being scanned.
struct Cursor<'a> {
    path: &'a Path,
    text: &'a str,
    masked: &'a str,
    line_starts: &'a [usize],
    /// Directory relative includes resolve against. Directory includes
    /// replace it for the rest of the file.
    base_dir: PathBuf,
}

fn line_starts_of(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

fn line_bounds(line_starts: &[usize], text: &str, idx: usize) -> Option<(usize, usize)> {
    let start = *line_starts.get(idx)?;
    let mut end = line_starts.get(idx + 1).map_or(text.len(), |next| next - 1);
    if end > start && text.as_bytes()[end - 1] == b'\r' {
        end -= 1;
    }
    Some((start, end))
}

impl<'a> Cursor<'a> {
    fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    fn bounds(&self, idx: usize) -> (usize, usize) {
        line_bounds(self.line_starts, self.masked, idx).unwrap_or((self.masked.len(), self.masked.len()))
    }

    fn masked_line(&self, idx: usize) -> &'a str {
        let (start, end) = self.bounds(idx);
        &self.masked[start..end]
    }

    fn raw_line(&self, idx: usize) -> &'a str {
        let (start, end) = self.bounds(idx);
        &self.text[start..end]
    }

    fn indent(&self, idx: usize) -> usize {
        let line = self.masked_line(idx);
        line.len() - line.trim_start_matches([' ', '\t']).len()
    }

    fn line_of(&self, index: usize) -> usize {
        match self.line_starts.binary_search(&index) {
            Ok(line) => line,
            Err(next) => next.saturating_sub(1),
        }
    }

    fn position(&self, index: usize) -> Position {
        let line = self.line_of(index);
        let column = index - self.line_starts[line] + 1;
        Position::new(line as u32 + 1, column as u32)
    }

    /// Location for the half-open byte range `start..end`. `end` position
    /// is that of the last byte in the range.
    fn location(&self, start: usize, end: usize) -> Location {
        let end = end.min(self.text.len()).max(start);
        Location {
            source_file: self.path.to_path_buf(),
            start_index: start,
            end_index: end,
            start: self.position(start),
            end: self.position(end.saturating_sub(1).max(start)),
            raw_text: self.text[start..end].to_string(),
        }
    }

    /// Location of a whole line, from its first non-blank byte.
    fn line_location(&self, idx: usize) -> Location {
        let (start, end) = self.bounds(idx);
        self.location(start + self.indent(idx), end)
    }

    /// First line at or after `from` with code on it.
    fn next_code_line(&self, from: usize) -> Option<usize> {
        (from..self.line_count()).find(|&i| !self.masked_line(i).trim().is_empty())
    }

    /// Byte index and line of the opening brace for an opener on `line`.
    /// `same_line_brace` is its index when it sits on the opener line;
    /// otherwise the next code line must start with `{`.
    fn brace_after(&self, line: usize, same_line_brace: Option<usize>) -> Option<(usize, usize)> {
        if let Some(index) = same_line_brace {
            return Some((index, line));
        }
        let next = self.next_code_line(line + 1)?;
        let trimmed = self.masked_line(next).trim_start_matches([' ', '\t']);
        trimmed
            .starts_with('{')
            .then(|| (self.line_starts[next] + self.indent(next), next))
    }

    /// Index just past the `}` that closes the `{` at `open`.
    ///
    /// A block ends where brace depth returns to zero on a terminator
    /// candidate: a `}` leading its line and indented no deeper than the
    /// opener line. On the brace's own line depth alone decides, which
    /// covers one-line bodies. A stray `}` elsewhere (e.g. `Send }`) does not
    /// end the block. If depth never settles, the first candidate wins, then
    /// the first point where depth hit zero, then end of file.
    fn block_end(&self, open: usize, opener_line: usize) -> usize {
        let bytes = self.masked.as_bytes();
        let opener_indent = self.indent(opener_line);
        let open_line = self.line_of(open);
        let mut depth = 0usize;
        let mut first_zero = None;
        for (j, b) in bytes.iter().enumerate().skip(open) {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth = depth.saturating_sub(1);
                    let line = self.line_of(j);
                    let closes = line == open_line || self.is_terminator(j, line, opener_indent);
                    if depth == 0 {
                        if closes {
                            return j + 1;
                        }
                        first_zero.get_or_insert(j + 1);
                    }
                }
                _ => {}
            }
        }

        (open_line + 1..self.line_count())
            .map(|idx| self.line_starts[idx] + self.indent(idx))
            .find(|&j| bytes.get(j) == Some(&b'}') && self.is_terminator(j, self.line_of(j), opener_indent))
            .map(|j| j + 1)
            .or(first_zero)
            .unwrap_or(self.text.len())
    }

    fn is_terminator(&self, index: usize, line: usize, opener_indent: usize) -> bool {
        let indent = self.indent(line);
        index == self.line_starts[line] + indent && indent <= opener_indent
    }

    /// Start of the line after the one holding `index`.
    fn next_line_start(&self, index: usize) -> usize {
        self.line_starts
            .get(self.line_of(index) + 1)
            .copied()
            .unwrap_or(self.text.len())
    }

    /// Masked text from `at` to the end of its line, cut at `limit`.
    fn segment(&self, at: usize, limit: usize) -> &'a str {
        let (_, line_end) = self.bounds(self.line_of(at));
        &self.masked[at..line_end.min(limit).max(at)]
    }

    /// Line index of the last byte before `end`.
    fn last_line(&self, end: usize) -> usize {
        self.line_of(end.saturating_sub(1))
    }
}

/// Scans scripts into [`SourceNode`] trees.
pub struct Scanner {
    patterns: Patterns,
    context: IncludeContext,
}

impl Scanner {
    /// Create a scanner for the script described by `context`.
    pub fn new(context: IncludeContext) -> Result<Self, ScanError> {
        Ok(Self {
            patterns: Patterns::new()?,
            context,
        })
    }

    pub fn context(&self) -> &IncludeContext {
        &self.context
    }

    /// Scan `path` and every file it includes, recursively.
    ///
    /// Include problems are logged and skipped; only failing to read `path`
    /// itself is an error.
    pub fn find(&self, path: &Path) -> Result<Vec<SourceNode>, ScanError> {
        let text = read_source(path)?;
        Ok(self.find_in_source(path, &text))
    }

    /// Like [`find`](Self::find) with the root file's text supplied.
    pub fn find_in_source(&self, path: &Path, text: &str) -> Vec<SourceNode> {
        let mut walk = Walk {
            visited: HashSet::from([canonical(path)]),
            follow: true,
        };
        self.scan_text(path, text, &mut walk, &[], false).nodes
    }

    /// Scan a single file without descending into its includes.
    pub fn scan_file(&self, path: &Path) -> Result<ScannedFile, ScanError> {
        let text = read_source(path)?;
        Ok(self.scan_source(path, &text))
    }

    /// Like [`scan_file`](Self::scan_file) with the text supplied.
    pub fn scan_source(&self, path: &Path, text: &str) -> ScannedFile {
        let mut walk = Walk {
            visited: HashSet::new(),
            follow: false,
        };
        self.scan_text(path, text, &mut walk, &[], false)
    }

    fn scan_text(
        &self,
        path: &Path,
        text: &str,
        walk: &mut Walk,
        scope: &[String],
        in_class: bool,
    ) -> ScannedFile {
        let masked = mask_source(text, self.context.version);
        let line_starts = line_starts_of(text);
        let nodes = {
            let mut cursor = Cursor {
                path,
                text,
                masked: &masked,
                line_starts: &line_starts,
                base_dir: self.context.initial_base_dir(path),
            };
            self.scan_range(&mut cursor, walk, 0, text.len(), scope, in_class)
        };
        tracing::debug!("scanned {}: {} top-level nodes", path.display(), nodes.len());
        ScannedFile {
            path: path.to_path_buf(),
            text: text.to_string(),
            masked,
            nodes,
            line_starts,
        }
    }

    /// Scan bytes `first..last` at one nesting level. Openers are looked for
    /// at line starts and again after a block that closes mid-line, so
    /// bodies written on one line are scanned too.
    fn scan_range(
        &self,
        cur: &mut Cursor<'_>,
        walk: &mut Walk,
        first: usize,
        last: usize,
        scope: &[String],
        in_class: bool,
    ) -> Vec<SourceNode> {
        let mut nodes = Vec::new();
        let mut pos = first;
        while pos < last {
            let i = cur.line_of(pos);
            let at_line_start = pos == cur.line_starts[i];
            let segment = cur.segment(pos, last);

            if at_line_start && self.patterns.block_comment.is_match(cur.raw_line(i)) {
                let start = cur.line_starts[i] + cur.indent(i);
                let end = cur.text[start..]
                    .find("*/")
                    .map_or(cur.text.len(), |p| start + p + 2);
                nodes.push(SourceNode::Skip(SkipNode {
                    scope: scope.to_vec(),
                    location: cur.location(start, end),
                }));
                pos = cur.next_line_start(end.saturating_sub(1).max(start));
                continue;
            }
            if segment.trim().is_empty() {
                pos = cur.next_line_start(pos);
                continue;
            }

            if at_line_start {
                let raw = cur.raw_line(i);
                let masked = cur.masked_line(i);
                if let Some(caps) = self.patterns.include.captures(masked) {
                    let arg = caps.get(2).map_or(0..0, |m| m.range());
                    let trimmed_end = arg.start + masked[arg.clone()].trim_end().len();
                    let node = self.include_node(
                        cur,
                        walk,
                        i,
                        &raw[arg.start..trimmed_end],
                        caps.get(1).is_some(),
                        scope,
                        in_class,
                    );
                    nodes.push(SourceNode::Include(node));
                    pos = cur.next_line_start(pos);
                    continue;
                }

                if self.patterns.directive.is_match(masked) && !masked.contains("::") {
                    nodes.push(SourceNode::Skip(SkipNode {
                        scope: scope.to_vec(),
                        location: cur.line_location(i),
                    }));
                    pos = cur.next_line_start(pos);
                    continue;
                }
            }

            if let Some((node, next)) = self.class_at(cur, walk, pos, last, scope) {
                nodes.push(SourceNode::Class(node));
                pos = next;
                continue;
            }

            if let Some((node, next)) = self.function_at(cur, walk, pos, last, scope) {
                nodes.push(SourceNode::Function(node));
                pos = next;
                continue;
            }

            if in_class {
                if let Some((node, next)) = self.property_at(cur, walk, pos, last, scope) {
                    nodes.push(SourceNode::Property(node));
                    pos = next;
                    continue;
                }
            }

            pos = cur.next_line_start(pos);
        }
        nodes
    }

    #[allow(clippy::too_many_arguments)]
    fn include_node(
        &self,
        cur: &mut Cursor<'_>,
        walk: &mut Walk,
        line: usize,
        argument: &str,
        again: bool,
        scope: &[String],
        in_class: bool,
    ) -> IncludeNode {
        let directive = parse_directive_argument(argument);
        let mut node = IncludeNode {
            target: directive.target.clone(),
            ignore_failure: directive.ignore_failure,
            again,
            resolved: None,
            nodes: Vec::new(),
            scope: scope.to_vec(),
            location: cur.line_location(line),
        };

        match resolve_include(&self.context, &directive.target, cur.path, &cur.base_dir) {
            Ok(path) if path.is_dir() => {
                tracing::debug!("include base directory is now {}", path.display());
                cur.base_dir = path.clone();
                node.resolved = Some(path);
            }
            Ok(path) => {
                if walk.follow {
                    node.nodes = self.scan_included(&path, walk, scope, in_class);
                }
                node.resolved = Some(path);
            }
            Err(err) if directive.ignore_failure => {
                tracing::debug!("{}:{}: optional include skipped: {}", cur.path.display(), line + 1, err);
            }
            Err(err) => {
                tracing::warn!("{}:{}: {}", cur.path.display(), line + 1, err);
            }
        }
        node
    }

    fn scan_included(
        &self,
        path: &Path,
        walk: &mut Walk,
        scope: &[String],
        in_class: bool,
    ) -> Vec<SourceNode> {
        if !walk.visited.insert(canonical(path)) {
            tracing::debug!("{} already included, not descending", path.display());
            return Vec::new();
        }
        match read_source(path) {
            Ok(text) => self.scan_text(path, &text, walk, scope, in_class).nodes,
            Err(err) => {
                tracing::warn!("{}", err);
                Vec::new()
            }
        }
    }

    fn class_at(
        &self,
        cur: &mut Cursor<'_>,
        walk: &mut Walk,
        at: usize,
        limit: usize,
        scope: &[String],
    ) -> Option<(ClassNode, usize)> {
        let segment = cur.segment(at, limit);
        let caps = self.patterns.class.captures(segment)?;
        let line = cur.line_of(at);
        let brace = caps.get(3).map(|m| at + m.start());
        if brace.is_none() && at + segment.len() < cur.bounds(line).1 {
            return None;
        }
        let name = caps.get(1)?.as_str().to_string();
        let extends = caps.get(2).map(|m| m.as_str().to_string());
        let (open, brace_line) = cur.brace_after(line, brace)?;
        let end = cur.block_end(open, line);

        let mut inner = scope.to_vec();
        inner.push(name.clone());
        let children = self.scan_range(cur, walk, open + 1, end.saturating_sub(1), &inner, true);

        let start = at + (segment.len() - segment.trim_start_matches([' ', '\t']).len());
        Some((
            ClassNode {
                name,
                extends,
                brace_line: brace_line as u32 + 1,
                children,
                scope: scope.to_vec(),
                location: cur.location(start, end),
            },
            end,
        ))
    }

    fn function_at(
        &self,
        cur: &mut Cursor<'_>,
        walk: &mut Walk,
        at: usize,
        limit: usize,
        scope: &[String],
    ) -> Option<(FunctionNode, usize)> {
        let segment = cur.segment(at, limit);
        let caps = self.patterns.function.captures(segment)?;
        let name = caps.get(2)?;
        if is_keyword(name.as_str()) {
            return None;
        }
        let line = cur.line_of(at);
        let is_static = caps.get(1).is_some();
        let open_paren = at + caps.get(0)?.end() - 1;
        let close_paren = matching_paren(&cur.masked[..limit], open_paren)?;
        let params = cur.text[open_paren + 1..close_paren].trim().to_string();

        let (_, line_end) = cur.bounds(cur.line_of(close_paren));
        let header_end = line_end.min(limit);
        let rest = &cur.masked[close_paren + 1..header_end];
        let rest_trimmed = rest.trim_start_matches([' ', '\t']);
        let start = at + (segment.len() - segment.trim_start_matches([' ', '\t']).len());

        if rest_trimmed.starts_with("=>") {
            return Some((
                FunctionNode {
                    name: name.as_str().to_string(),
                    is_static,
                    params,
                    brace_line: None,
                    children: Vec::new(),
                    scope: scope.to_vec(),
                    location: cur.location(start, header_end),
                },
                cur.next_line_start(header_end.saturating_sub(1).max(close_paren)),
            ));
        }

        let same_line = if rest_trimmed.starts_with('{') {
            Some(close_paren + 1 + (rest.len() - rest_trimmed.len()))
        } else if rest_trimmed.trim().is_empty() && header_end == line_end {
            None
        } else {
            return None;
        };
        let (open, brace_line) = match same_line {
            Some(index) => (index, cur.line_of(index)),
            None => cur.brace_after(cur.line_of(close_paren), None)?,
        };
        let end = cur.block_end(open, line);

        let mut inner = scope.to_vec();
        inner.push(name.as_str().to_string());
        let children = self.scan_range(cur, walk, open + 1, end.saturating_sub(1), &inner, false);

        Some((
            FunctionNode {
                name: name.as_str().to_string(),
                is_static,
                params,
                brace_line: Some(brace_line as u32 + 1),
                children,
                scope: scope.to_vec(),
                location: cur.location(start, end),
            },
            end,
        ))
    }

    fn property_at(
        &self,
        cur: &mut Cursor<'_>,
        walk: &mut Walk,
        at: usize,
        limit: usize,
        scope: &[String],
    ) -> Option<(PropertyNode, usize)> {
        let line = cur.line_of(at);
        let (_, line_end) = cur.bounds(line);
        if limit < line_end {
            return None;
        }
        let segment = cur.segment(at, limit);
        let caps = self.patterns.property.captures(segment)?;
        let name = caps.get(2)?.as_str().to_string();
        if is_keyword(&name) {
            return None;
        }
        let is_static = caps.get(1).is_some();
        let params = caps
            .get(3)
            .map(|m| cur.text[at + m.start()..at + m.end()].to_string());
        let start = at + (segment.len() - segment.trim_start_matches([' ', '\t']).len());

        if caps.get(5).is_some() {
            let end = line_end;
            return Some((
                PropertyNode {
                    name,
                    is_static,
                    params,
                    brace_line: None,
                    getter: None,
                    setter: None,
                    scope: scope.to_vec(),
                    location: cur.location(start, end),
                },
                cur.next_line_start(at),
            ));
        }

        let (open, brace_line) = cur.brace_after(line, caps.get(4).map(|m| at + m.start()))?;
        let end = cur.block_end(open, line);
        let close_line = cur.last_line(end);

        let mut inner = scope.to_vec();
        inner.push(name.clone());
        let (getter, setter) = self.accessors(cur, walk, brace_line + 1, close_line, &inner);

        Some((
            PropertyNode {
                name,
                is_static,
                params,
                brace_line: Some(brace_line as u32 + 1),
                getter,
                setter,
                scope: scope.to_vec(),
                location: cur.location(start, end),
            },
            end,
        ))
    }

    /// `get`/`set` blocks inside a property body.
    fn accessors(
        &self,
        cur: &mut Cursor<'_>,
        walk: &mut Walk,
        first: usize,
        last: usize,
        scope: &[String],
    ) -> (Option<FunctionNode>, Option<FunctionNode>) {
        let mut getter = None;
        let mut setter = None;
        let mut i = first;
        while i < last {
            let Some(caps) = self.patterns.accessor.captures(cur.masked_line(i)) else {
                i += 1;
                continue;
            };
            let kind = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
            let start = cur.line_starts[i] + cur.indent(i);
            let (node, next) = if caps.get(3).is_some() {
                let (_, end) = cur.bounds(i);
                let node = FunctionNode {
                    name: kind.clone(),
                    is_static: false,
                    params: String::new(),
                    brace_line: None,
                    children: Vec::new(),
                    scope: scope.to_vec(),
                    location: cur.location(start, end),
                };
                (node, i + 1)
            } else {
                let Some((open, brace_line)) =
                    cur.brace_after(i, caps.get(2).map(|m| cur.line_starts[i] + m.start()))
                else {
                    i += 1;
                    continue;
                };
                let end = cur.block_end(open, i);
                let close_line = cur.last_line(end);
                let mut inner = scope.to_vec();
                inner.push(kind.clone());
                let children =
                    self.scan_range(cur, walk, open + 1, end.saturating_sub(1), &inner, false);
                let node = FunctionNode {
                    name: kind.clone(),
                    is_static: false,
                    params: String::new(),
                    brace_line: Some(brace_line as u32 + 1),
                    children,
                    scope: scope.to_vec(),
                    location: cur.location(start, end),
                };
                (node, close_line + 1)
            };
            if kind == "get" {
                getter = Some(node);
            } else {
                setter = Some(node);
            }
            i = next;
        }
        (getter, setter)
    }
}

/// Index of the `)` matching the `(` at `open`, over masked text.
fn matching_paren(masked: &str, open: usize) -> Option<usize> {
    let bytes = masked.as_bytes();
    let mut depth = 0usize;
    for (offset, b) in bytes[open..].iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn read_source(path: &Path) -> Result<String, ScanError> {
    let bytes = std::fs::read(path).map_err(|source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    // Scripts are commonly saved with a UTF-8 BOM.
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
