//! Structural nodes produced by the scanner.
use std::path::PathBuf;

/// A 1-based line and 1-based byte column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Where a node sits in its source file.
///
/// `start_index..end_index` is a half-open byte range into the file text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub source_file: PathBuf,
    pub start_index: usize,
    pub end_index: usize,
    pub start: Position,
    pub end: Position,
    pub raw_text: String,
}

impl Location {
    /// Whether `line` falls on any line this node covers.
    pub fn contains_line(&self, line: u32) -> bool {
        self.start.line <= line && line <= self.end.line
    }
}

/// A region the debugger engine never stops in: block comments and
/// directives other than `#Include`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipNode {
    pub scope: Vec<String>,
    pub location: Location,
}

/// An `#Include` or `#IncludeAgain` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeNode {
    /// Directive argument as written.
    pub target: String,
    /// `*i` prefix: a missing file is not an error.
    pub ignore_failure: bool,
    /// `#IncludeAgain` rather than `#Include`.
    pub again: bool,
    /// The file (or directory) the argument resolved to.
    pub resolved: Option<PathBuf>,
    /// Nodes of the included file. Empty for directories, unresolved
    /// targets and files already visited.
    pub nodes: Vec<SourceNode>,
    pub scope: Vec<String>,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNode {
    pub name: String,
    pub extends: Option<String>,
    /// Line holding the opening brace.
    pub brace_line: u32,
    pub children: Vec<SourceNode>,
    pub scope: Vec<String>,
    pub location: Location,
}

/// A function, method, or property accessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionNode {
    pub name: String,
    pub is_static: bool,
    /// Parameter list text between the parentheses.
    pub params: String,
    /// Line holding the opening brace. `None` for `=>` bodies.
    pub brace_line: Option<u32>,
    pub children: Vec<SourceNode>,
    pub scope: Vec<String>,
    pub location: Location,
}

impl FunctionNode {
    /// Line of the closing brace, or the only line of an `=>` body.
    pub fn return_line(&self) -> u32 {
        self.location.end.line
    }
}

/// A dynamic property with optional `get`/`set` accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyNode {
    pub name: String,
    pub is_static: bool,
    /// `[params]` text, if the property is indexed.
    pub params: Option<String>,
    pub brace_line: Option<u32>,
    pub getter: Option<FunctionNode>,
    pub setter: Option<FunctionNode>,
    pub scope: Vec<String>,
    pub location: Location,
}

/// One structural element of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceNode {
    Skip(SkipNode),
    Include(IncludeNode),
    Class(ClassNode),
    Function(FunctionNode),
    Property(PropertyNode),
}

impl SourceNode {
    pub fn location(&self) -> &Location {
        match self {
            SourceNode::Skip(n) => &n.location,
            SourceNode::Include(n) => &n.location,
            SourceNode::Class(n) => &n.location,
            SourceNode::Function(n) => &n.location,
            SourceNode::Property(n) => &n.location,
        }
    }

    /// Enclosing class and function names, outermost first.
    pub fn scope(&self) -> &[String] {
        match self {
            SourceNode::Skip(n) => &n.scope,
            SourceNode::Include(n) => &n.scope,
            SourceNode::Class(n) => &n.scope,
            SourceNode::Function(n) => &n.scope,
            SourceNode::Property(n) => &n.scope,
        }
    }

    /// Declared name for classes, functions and properties.
    pub fn name(&self) -> Option<&str> {
        match self {
            SourceNode::Class(n) => Some(&n.name),
            SourceNode::Function(n) => Some(&n.name),
            SourceNode::Property(n) => Some(&n.name),
            SourceNode::Skip(_) | SourceNode::Include(_) => None,
        }
    }

    /// Dotted name including the scope, e.g. `A.B.Method`.
    pub fn qualified_name(&self) -> Option<String> {
        let name = self.name()?;
        let mut parts: Vec<&str> = self.scope().iter().map(String::as_str).collect();
        parts.push(name);
        Some(parts.join("."))
    }

    /// Nested nodes in document order. For includes these are the included
    /// file's nodes.
    pub fn children(&self) -> &[SourceNode] {
        match self {
            SourceNode::Class(n) => &n.children,
            SourceNode::Function(n) => &n.children,
            SourceNode::Include(n) => &n.nodes,
            SourceNode::Skip(_) | SourceNode::Property(_) => &[],
        }
    }
}

/// Pre-order walk over `nodes` and everything nested in them, following
/// includes.
pub fn flatten(nodes: &[SourceNode]) -> Vec<&SourceNode> {
    let mut out = Vec::new();
    let mut stack: Vec<&SourceNode> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        out.push(node);
        stack.extend(node.children().iter().rev());
    }
    out
}

/// Find a function by dotted (`A.B.Method`) or bare name. Matching is
/// ASCII case-insensitive, as identifiers are in the language.
pub fn find_function<'a>(nodes: &'a [SourceNode], name: &str) -> Option<&'a FunctionNode> {
    let wanted = name.trim();
    let dotted = wanted.contains('.');
    flatten(nodes).into_iter().find_map(|node| match node {
        SourceNode::Function(func) => {
            let matches = if dotted {
                node.qualified_name()
                    .is_some_and(|q| q.eq_ignore_ascii_case(wanted))
            } else {
                func.name.eq_ignore_ascii_case(wanted)
            };
            matches.then_some(func)
        }
        _ => None,
    })
}
