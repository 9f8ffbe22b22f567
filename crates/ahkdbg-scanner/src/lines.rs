//! Mapping requested breakpoint lines onto executable lines.
use std::collections::HashSet;

use crate::node::{FunctionNode, SourceNode};
use crate::scanner::ScannedFile;

/// Where a line breakpoint should actually go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineResolution {
    /// 1-based target line. The requested line when unverified.
    pub line: u32,
    /// Whether an executable line was found.
    pub verified: bool,
}

/// Resolve `requested` (1-based) to the first executable line at or after
/// it.
///
/// A line is executable when it has code after comment masking, is not
/// inside a skip region or on a directive, is not a class, function or
/// property header, and is not a lone brace.
pub fn resolve_line(file: &ScannedFile, requested: u32) -> LineResolution {
    let blocked = non_executable_lines(&file.nodes);
    let first = requested.max(1);
    for line in first..=file.line_count() {
        if blocked.contains(&line) {
            continue;
        }
        let Some(text) = file.masked_line(line) else {
            break;
        };
        let code = text.trim();
        if code.is_empty() || code == "{" || code == "}" {
            continue;
        }
        return LineResolution {
            line,
            verified: true,
        };
    }
    LineResolution {
        line: requested,
        verified: false,
    }
}

/// Lines of this file the engine never stops on. Included files' nodes are
/// not descended into.
pub fn non_executable_lines(nodes: &[SourceNode]) -> HashSet<u32> {
    let mut lines = HashSet::new();
    collect(nodes, &mut lines);
    lines
}

fn collect(nodes: &[SourceNode], lines: &mut HashSet<u32>) {
    for node in nodes {
        match node {
            SourceNode::Skip(skip) => lines.extend(skip.location.start.line..=skip.location.end.line),
            SourceNode::Include(include) => {
                lines.insert(include.location.start.line);
            }
            SourceNode::Class(class) => {
                lines.extend(class.location.start.line..=class.brace_line);
                collect(&class.children, lines);
            }
            SourceNode::Function(func) => header(func, lines),
            SourceNode::Property(prop) => {
                if let Some(brace) = prop.brace_line {
                    lines.extend(prop.location.start.line..=brace);
                }
                for accessor in prop.getter.iter().chain(prop.setter.iter()) {
                    header(accessor, lines);
                }
            }
        }
    }
}

fn header(func: &FunctionNode, lines: &mut HashSet<u32>) {
    // `=>` bodies are executable on their own line.
    if let Some(brace) = func.brace_line {
        lines.extend(func.location.start.line..=brace);
    }
    collect(&func.children, lines);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::include::{EngineVersion, IncludeContext};
    use crate::scanner::Scanner;
    use std::path::Path;

    fn scanned(text: &str) -> ScannedFile {
        let path = Path::new("/virtual/main.ahk");
        let scanner = Scanner::new(IncludeContext::for_script(path, EngineVersion::V2)).unwrap();
        scanner.scan_source(path, text)
    }

    const SCRIPT: &str = "\
#Requires AutoHotkey v2.0
x := 1

; a comment
/*
block
*/
Greet(name)
{
    MsgBox(name)
}
class Box {
    Open() => 1
}
";

    #[test]
    fn executable_line_is_kept() {
        let file = scanned(SCRIPT);
        assert_eq!(resolve_line(&file, 2), LineResolution { line: 2, verified: true });
    }

    #[test]
    fn blank_and_comment_lines_shift_forward() {
        let file = scanned(SCRIPT);
        // 3 blank, 4 comment, 5-7 block comment, 8-9 header, 10 body.
        for requested in [3, 4, 5, 6, 7, 8, 9] {
            assert_eq!(
                resolve_line(&file, requested),
                LineResolution { line: 10, verified: true },
                "requested {requested}"
            );
        }
    }

    #[test]
    fn directive_line_is_skipped() {
        let file = scanned(SCRIPT);
        assert_eq!(resolve_line(&file, 1).line, 2);
    }

    #[test]
    fn closing_brace_and_class_header_shift_to_arrow_method() {
        let file = scanned(SCRIPT);
        assert_eq!(resolve_line(&file, 11), LineResolution { line: 13, verified: true });
    }

    #[test]
    fn past_end_of_file_stays_unverified() {
        let file = scanned(SCRIPT);
        assert_eq!(resolve_line(&file, 14), LineResolution { line: 14, verified: false });
        assert_eq!(resolve_line(&file, 500), LineResolution { line: 500, verified: false });
    }

    #[test]
    fn line_zero_is_treated_as_first_line() {
        let file = scanned("F()\n");
        assert_eq!(resolve_line(&file, 0), LineResolution { line: 1, verified: true });
    }
}
