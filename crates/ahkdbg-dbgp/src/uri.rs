//! Conversion between filesystem paths and the `file://` URIs DBGP uses.
//!
//! Engines run on Windows as often as not, so drive-letter paths are handled
//! textually rather than through the host's `Path` rules.

use std::path::{Path, PathBuf};

use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Bytes left as-is in a path URI; everything else is escaped.
const PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b':')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Convert a path to a `file:///` URI.
pub fn path_to_uri(path: &Path) -> String {
    let text = path.to_string_lossy().replace('\\', "/");
    let lead = if text.starts_with('/') { "" } else { "/" };
    format!("file://{lead}{}", utf8_percent_encode(&text, PATH_SET))
}

/// Convert a `file://` URI back into a path.
///
/// Anything that is not a file URI is returned unchanged as a path.
pub fn uri_to_path(uri: &str) -> PathBuf {
    let Some(rest) = uri.strip_prefix("file://") else {
        return PathBuf::from(uri);
    };
    let decoded = percent_decode(rest.as_bytes()).decode_utf8_lossy();
    let bytes = decoded.as_bytes();
    let is_drive = bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':';
    if is_drive {
        PathBuf::from(&decoded[1..])
    } else {
        PathBuf::from(decoded.into_owned())
    }
}

/// Compare two paths the way the engine's filesystem would: separators and
/// ASCII case are ignored.
pub fn same_file(a: &Path, b: &Path) -> bool {
    let norm = |p: &Path| p.to_string_lossy().replace('\\', "/").to_ascii_lowercase();
    norm(a) == norm(b)
}
