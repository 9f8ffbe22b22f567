//! IDE-to-engine command lines.
//!
//! A command is written as `name -i <tid> [-x value ...] [-- <base64>]`
//! followed by a single NUL byte.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::ProtocolError;

/// A DBGP command without its transaction id.
///
/// The session stamps the transaction id when the command is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name, e.g. `breakpoint_set`.
    pub name: String,
    /// Single-letter flags with their values, in insertion order.
    pub args: Vec<(char, String)>,
    /// Optional data payload, base64-encoded on the wire.
    pub data: Option<String>,
}

impl Command {
    /// Create a command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            data: None,
        }
    }

    /// Append a `-flag value` argument.
    pub fn arg(mut self, flag: char, value: impl ToString) -> Self {
        self.args.push((flag, value.to_string()));
        self
    }

    /// Append an argument only when a value is present.
    pub fn arg_opt<T: ToString>(self, flag: char, value: Option<T>) -> Self {
        match value {
            Some(v) => self.arg(flag, v),
            None => self,
        }
    }

    /// Attach a data payload.
    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Value of the first argument with the given flag.
    pub fn get(&self, flag: char) -> Option<&str> {
        self.args
            .iter()
            .find(|(f, _)| *f == flag)
            .map(|(_, v)| v.as_str())
    }

    /// Encode the command line, NUL-terminated.
    pub fn encode(&self, transaction_id: u32) -> Vec<u8> {
        let mut line = format!("{} -i {}", self.name, transaction_id);
        for (flag, value) in &self.args {
            line.push_str(" -");
            line.push(*flag);
            line.push(' ');
            line.push_str(&quote(value));
        }
        if let Some(data) = &self.data {
            line.push_str(" -- ");
            line.push_str(&BASE64.encode(data.as_bytes()));
        }
        let mut bytes = line.into_bytes();
        bytes.push(0);
        bytes
    }

    /// Parse an encoded command line back into its transaction id and command.
    pub fn parse(bytes: &[u8]) -> Result<(u32, Command), ProtocolError> {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        let line = std::str::from_utf8(&bytes[..end]).map_err(|_| ProtocolError::InvalidUtf8)?;
        let tokens = tokenize(line)?;
        let mut iter = tokens.into_iter();

        let name = iter
            .next()
            .ok_or_else(|| ProtocolError::MalformedCommand("empty command line".into()))?;
        let mut command = Command::new(name);
        let mut transaction_id = None;

        while let Some(token) = iter.next() {
            if token == "--" {
                let encoded = iter.next().unwrap_or_default();
                let raw = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))?;
                let data =
                    String::from_utf8(raw).map_err(|e| ProtocolError::InvalidBase64(e.to_string()))?;
                command.data = Some(data);
                break;
            }
            let flag = parse_flag(&token)?;
            let value = iter.next().ok_or_else(|| {
                ProtocolError::MalformedCommand(format!("flag -{flag} has no value"))
            })?;
            if flag == 'i' {
                let tid = value.parse().map_err(|_| {
                    ProtocolError::MalformedCommand(format!("invalid transaction id {value:?}"))
                })?;
                transaction_id = Some(tid);
            } else {
                command.args.push((flag, value));
            }
        }

        let tid = transaction_id
            .ok_or_else(|| ProtocolError::MalformedCommand("missing -i transaction id".into()))?;
        Ok((tid, command))
    }
}

fn parse_flag(token: &str) -> Result<char, ProtocolError> {
    let mut chars = token.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some('-'), Some(flag), None) => Ok(flag),
        _ => Err(ProtocolError::MalformedCommand(format!(
            "expected a flag, found {token:?}"
        ))),
    }
}

/// Quote a value when it would not survive whitespace tokenisation.
fn quote(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\0');
    if !needs_quotes {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Split a command line on whitespace, honouring double-quoted values.
fn tokenize(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => token.push(other),
                }
            }
            if !closed {
                return Err(ProtocolError::MalformedCommand(
                    "unterminated quoted value".into(),
                ));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_simple_command() {
        let bytes = Command::new("status").encode(1);
        assert_eq!(bytes, b"status -i 1\0");
    }

    #[test]
    fn encode_with_args_and_data() {
        let cmd = Command::new("breakpoint_set")
            .arg('t', "conditional")
            .arg('n', 12)
            .data("x > 1");
        let bytes = cmd.encode(4);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            format!(
                "breakpoint_set -i 4 -t conditional -n 12 -- {}\0",
                BASE64.encode("x > 1")
            )
        );
    }

    #[test]
    fn encode_quotes_values_with_spaces() {
        let cmd = Command::new("property_get").arg('n', "my var");
        let text = String::from_utf8(cmd.encode(2)).unwrap();
        assert!(text.contains(r#"-n "my var""#), "got {text}");
    }

    #[test]
    fn windows_paths_survive_unquoted() {
        let cmd = Command::new("breakpoint_set").arg('f', r"file:///C:\scripts\main.ahk");
        let (_, parsed) = Command::parse(&cmd.encode(1)).unwrap();
        assert_eq!(parsed.get('f'), Some(r"file:///C:\scripts\main.ahk"));
    }

    #[test]
    fn parse_inverts_encode() {
        let cmd = Command::new("feature_set")
            .arg('n', "max_children")
            .arg('v', "")
            .arg('x', r#"say "hi" \ bye"#)
            .data("a := 1\nb := 2");
        let (tid, parsed) = Command::parse(&cmd.encode(42)).unwrap();
        assert_eq!(tid, 42);
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn parse_without_data() {
        let (tid, cmd) = Command::parse(b"stack_get -i 9 -d 0\0").unwrap();
        assert_eq!(tid, 9);
        assert_eq!(cmd.name, "stack_get");
        assert_eq!(cmd.get('d'), Some("0"));
        assert!(cmd.data.is_none());
    }

    #[test]
    fn parse_rejects_missing_tid() {
        assert!(matches!(
            Command::parse(b"run\0"),
            Err(ProtocolError::MalformedCommand(_))
        ));
    }

    #[test]
    fn parse_rejects_dangling_flag() {
        assert!(Command::parse(b"run -i\0").is_err());
    }

    #[test]
    fn arg_opt_skips_none() {
        let cmd = Command::new("stack_get").arg_opt::<u32>('d', None);
        assert!(cmd.args.is_empty());
        let cmd = Command::new("stack_get").arg_opt('d', Some(2));
        assert_eq!(cmd.get('d'), Some("2"));
    }
}
