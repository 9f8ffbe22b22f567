//! ahkdbg-scanner — structural scanner for AutoHotkey scripts.
//!
//! Locates classes, functions, properties, directives and block comments,
//! follows `#Include` chains, and maps breakpoint lines onto executable
//! lines. No expression is ever evaluated.
pub mod error;
pub mod include;
pub mod lines;
pub mod mask;
pub mod node;
pub mod scanner;

// Re-export key types for convenience.
pub use error::ScanError;
pub use include::{EngineVersion, IncludeContext};
pub use lines::{resolve_line, LineResolution};
pub use mask::mask_source;
pub use node::{
    find_function, flatten, ClassNode, FunctionNode, IncludeNode, Location, Position,
    PropertyNode, SkipNode, SourceNode,
};
pub use scanner::{ScannedFile, Scanner};
