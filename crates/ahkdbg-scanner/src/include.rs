//! `#Include` target resolution.
//!
//! Resolution order: library references (`<Name>`) are searched in the
//! local, user and standard library directories. Everything else has its
//! `%Var%` built-in variables substituted and, if still relative, is joined
//! onto the current include base directory.
use std::path::{Path, PathBuf};

use crate::error::ScanError;

/// Major version of the AutoHotkey engine being debugged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EngineVersion {
    V1,
    #[default]
    V2,
}

impl EngineVersion {
    /// Map a major version number (1 or 2). Anything else is treated as v2.
    pub fn from_major(major: u8) -> Self {
        if major == 1 {
            Self::V1
        } else {
            Self::V2
        }
    }
}

/// Everything include resolution needs to know about the running script.
#[derive(Debug, Clone)]
pub struct IncludeContext {
    pub version: EngineVersion,
    /// Main script file (`A_ScriptFullPath`).
    pub script_path: PathBuf,
    /// Interpreter executable (`A_AhkPath`), if known.
    pub runtime_path: Option<PathBuf>,
    /// Process working directory (`A_WorkingDir`).
    pub working_dir: PathBuf,
    /// User library directory, usually `Documents/AutoHotkey/Lib`.
    pub user_lib_dir: Option<PathBuf>,
}

impl IncludeContext {
    /// Context for `script_path` using the process working directory and the
    /// platform's documents folder.
    pub fn for_script(script_path: impl Into<PathBuf>, version: EngineVersion) -> Self {
        let script_path = script_path.into();
        let working_dir = std::env::current_dir().unwrap_or_else(|_| script_dir_of(&script_path));
        Self {
            version,
            script_path,
            runtime_path: None,
            working_dir,
            user_lib_dir: dirs::document_dir().map(|d| d.join("AutoHotkey").join("Lib")),
        }
    }

    /// Set the interpreter path.
    pub fn with_runtime(mut self, runtime: Option<PathBuf>) -> Self {
        self.runtime_path = runtime;
        self
    }

    /// `A_ScriptDir`.
    pub fn script_dir(&self) -> PathBuf {
        script_dir_of(&self.script_path)
    }

    /// Base directory relative includes start from in `file`, before any
    /// directory include changes it.
    pub fn initial_base_dir(&self, file: &Path) -> PathBuf {
        match self.version {
            EngineVersion::V1 => self.script_dir(),
            EngineVersion::V2 => script_dir_of(file),
        }
    }

    /// Library directories in search order: local, user, standard.
    pub fn library_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.script_dir().join("Lib")];
        if let Some(user) = &self.user_lib_dir {
            dirs.push(user.clone());
        }
        if let Some(runtime) = &self.runtime_path {
            if let Some(parent) = runtime.parent() {
                dirs.push(parent.join("Lib"));
            }
        }
        dirs
    }
}

fn script_dir_of(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// A parsed `#Include` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective {
    pub target: String,
    pub ignore_failure: bool,
}

/// Split the raw directive argument into its `*i` flag and target.
pub fn parse_directive_argument(argument: &str) -> IncludeDirective {
    let mut rest = argument.trim().trim_start_matches(',').trim();
    let mut ignore_failure = false;
    if rest.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("*i")) {
        ignore_failure = true;
        rest = rest[2..].trim_start();
    }
    let target = rest
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
        .unwrap_or(rest);
    IncludeDirective {
        target: target.to_string(),
        ignore_failure,
    }
}

/// Resolve an include target to an existing file or directory.
///
/// `current_file` is the file holding the directive (`A_LineFile`);
/// `base_dir` is the directory relative paths are joined onto.
pub fn resolve_include(
    ctx: &IncludeContext,
    target: &str,
    current_file: &Path,
    base_dir: &Path,
) -> Result<PathBuf, ScanError> {
    if let Some(name) = target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
        return resolve_library(ctx, name.trim())
            .ok_or_else(|| ScanError::UnresolvedInclude(target.to_string()));
    }

    let expanded = substitute_variables(ctx, target, current_file)?;
    let path = PathBuf::from(expanded.replace('\\', std::path::MAIN_SEPARATOR_STR));
    let candidate = if is_absolute(&path) {
        path
    } else {
        base_dir.join(path)
    };
    if candidate.exists() {
        Ok(candidate)
    } else {
        Err(ScanError::UnresolvedInclude(target.to_string()))
    }
}

/// Drive-letter paths count as absolute on every host.
fn is_absolute(path: &Path) -> bool {
    if path.is_absolute() {
        return true;
    }
    let text = path.to_string_lossy();
    let bytes = text.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn resolve_library(ctx: &IncludeContext, name: &str) -> Option<PathBuf> {
    let mut names = vec![name.to_string()];
    // v1 falls back to the part before the first underscore (Lib_Func -> Lib).
    if ctx.version == EngineVersion::V1 {
        if let Some((prefix, _)) = name.split_once('_') {
            if !prefix.is_empty() {
                names.push(prefix.to_string());
            }
        }
    }
    for candidate in &names {
        for dir in ctx.library_dirs() {
            let file = dir.join(format!("{candidate}.ahk"));
            if file.is_file() {
                return Some(file);
            }
        }
    }
    None
}

/// Replace `%Name%` built-in variables in an include path.
pub fn substitute_variables(
    ctx: &IncludeContext,
    target: &str,
    current_file: &Path,
) -> Result<String, ScanError> {
    let mut out = String::with_capacity(target.len());
    let mut rest = target;
    while let Some(open) = rest.find('%') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('%') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = &after[..close];
        let value = builtin_variable(ctx, name, current_file)
            .ok_or_else(|| ScanError::UnknownVariable(name.to_string()))?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Values of the built-in variables allowed in `#Include` paths.
pub fn builtin_variable(ctx: &IncludeContext, name: &str, current_file: &Path) -> Option<String> {
    let path_string = |p: &Path| p.to_string_lossy().into_owned();
    let env = |key: &str| std::env::var(key).ok();
    let value = match name.to_ascii_lowercase().as_str() {
        "a_scriptdir" => path_string(&ctx.script_dir()),
        "a_scriptfullpath" => path_string(&ctx.script_path),
        "a_scriptname" => ctx.script_path.file_name()?.to_string_lossy().into_owned(),
        "a_linefile" => path_string(current_file),
        "a_workingdir" => path_string(&ctx.working_dir),
        "a_ahkpath" => path_string(ctx.runtime_path.as_deref()?),
        "a_appdata" => path_string(&dirs::config_dir()?),
        "a_appdatacommon" => env("ProgramData")?,
        "a_mydocuments" => path_string(&dirs::document_dir()?),
        "a_desktop" => path_string(&dirs::desktop_dir()?),
        "a_temp" => path_string(&std::env::temp_dir()),
        "a_username" => env("USERNAME").or_else(|| env("USER"))?,
        "a_computername" => env("COMPUTERNAME").or_else(|| env("HOSTNAME"))?,
        "a_windir" => env("WINDIR").or_else(|| env("SystemRoot"))?,
        "a_programfiles" => env("ProgramFiles")?,
        "a_comspec" => env("ComSpec")?,
        "a_startup" => path_string(&dirs::config_dir()?.join(r"Microsoft\Windows\Start Menu\Programs\Startup")),
        "a_startmenu" => path_string(&dirs::config_dir()?.join(r"Microsoft\Windows\Start Menu")),
        "a_programs" => path_string(&dirs::config_dir()?.join(r"Microsoft\Windows\Start Menu\Programs")),
        "a_iscompiled" => String::new(),
        "a_space" => " ".to_string(),
        "a_tab" => "\t".to_string(),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn context(root: &Path, version: EngineVersion) -> IncludeContext {
        IncludeContext {
            version,
            script_path: root.join("main.ahk"),
            runtime_path: Some(root.join("runtime").join("AutoHotkey.exe")),
            working_dir: root.join("cwd"),
            user_lib_dir: Some(root.join("userlib")),
        }
    }

    #[test]
    fn parse_argument_with_ignore_flag_and_quotes() {
        assert_eq!(
            parse_directive_argument(r#" *i "lib\util.ahk" "#),
            IncludeDirective {
                target: r"lib\util.ahk".into(),
                ignore_failure: true
            }
        );
        assert_eq!(parse_directive_argument(", other.ahk").target, "other.ahk");
        assert!(!parse_directive_argument("x.ahk").ignore_failure);
    }

    #[test]
    fn substitutes_script_dir_and_line_file() {
        let ctx = context(Path::new("/proj"), EngineVersion::V2);
        let current = Path::new("/proj/sub/part.ahk");
        assert_eq!(
            substitute_variables(&ctx, "%A_ScriptDir%/x.ahk", current).unwrap(),
            "/proj/x.ahk"
        );
        assert_eq!(
            substitute_variables(&ctx, "%a_linefile%", current).unwrap(),
            "/proj/sub/part.ahk"
        );
        assert_eq!(
            substitute_variables(&ctx, "%A_Space%", current).unwrap(),
            " "
        );
    }

    #[test]
    fn unknown_variable_is_error() {
        let ctx = context(Path::new("/proj"), EngineVersion::V2);
        let err = substitute_variables(&ctx, "%A_Nope%/x.ahk", Path::new("/proj/main.ahk"))
            .unwrap_err();
        assert!(matches!(err, ScanError::UnknownVariable(name) if name == "A_Nope"));
    }

    #[test]
    fn v2_relative_to_current_file_v1_relative_to_script_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub").join("helper.ahk"), "").unwrap();
        fs::write(root.join("helper.ahk"), "").unwrap();
        let current = root.join("sub").join("part.ahk");

        let v2 = context(root, EngineVersion::V2);
        let base = v2.initial_base_dir(&current);
        assert_eq!(
            resolve_include(&v2, "helper.ahk", &current, &base).unwrap(),
            root.join("sub").join("helper.ahk")
        );

        let v1 = context(root, EngineVersion::V1);
        let base = v1.initial_base_dir(&current);
        assert_eq!(
            resolve_include(&v1, "helper.ahk", &current, &base).unwrap(),
            root.join("helper.ahk")
        );
    }

    #[test]
    fn library_search_order_local_user_standard() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in ["Lib", "userlib", "runtime/Lib"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join("runtime/Lib/Std.ahk"), "").unwrap();
        fs::write(root.join("userlib/Std.ahk"), "").unwrap();
        fs::write(root.join("runtime/Lib/OnlyStd.ahk"), "").unwrap();
        let ctx = context(root, EngineVersion::V2);
        let current = root.join("main.ahk");

        assert_eq!(
            resolve_include(&ctx, "<Std>", &current, root).unwrap(),
            root.join("userlib").join("Std.ahk")
        );
        assert_eq!(
            resolve_include(&ctx, "<OnlyStd>", &current, root).unwrap(),
            root.join("runtime").join("Lib").join("OnlyStd.ahk")
        );

        fs::write(root.join("Lib/Std.ahk"), "").unwrap();
        assert_eq!(
            resolve_include(&ctx, "<Std>", &current, root).unwrap(),
            root.join("Lib").join("Std.ahk")
        );
    }

    #[test]
    fn v1_library_underscore_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("Lib")).unwrap();
        fs::write(root.join("Lib/Gdip.ahk"), "").unwrap();
        let current = root.join("main.ahk");

        let v1 = context(root, EngineVersion::V1);
        assert!(resolve_include(&v1, "<Gdip_All>", &current, root).is_ok());
        let v2 = context(root, EngineVersion::V2);
        assert!(resolve_include(&v2, "<Gdip_All>", &current, root).is_err());
    }

    #[test]
    fn missing_file_is_unresolved() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), EngineVersion::V2);
        let err = resolve_include(&ctx, "nope.ahk", &tmp.path().join("main.ahk"), tmp.path())
            .unwrap_err();
        assert!(matches!(err, ScanError::UnresolvedInclude(_)));
    }

    #[test]
    fn from_major_maps_versions() {
        assert_eq!(EngineVersion::from_major(1), EngineVersion::V1);
        assert_eq!(EngineVersion::from_major(2), EngineVersion::V2);
    }
}
