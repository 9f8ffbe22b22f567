//! Comment and string masking.
//!
//! The masked copy has exactly the same byte length and line breaks as the
//! input, so every index into it is also an index into the original text.
//! Comment bodies and string literal contents become spaces, which keeps
//! braces and semicolons inside them out of the structural scan.

use crate::EngineVersion;

/// Return `text` with comments and string contents replaced by spaces.
pub fn mask_source(text: &str, version: EngineVersion) -> String {
    let bytes = text.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0;
    let mut at_line_start = true;

    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                at_line_start = true;
                i += 1;
            }
            b' ' | b'\t' | b'\r' => i += 1,
            b'/' if at_line_start && bytes.get(i + 1) == Some(&b'*') => {
                let end = block_comment_end(bytes, i + 2);
                blank(&mut out, i, end);
                i = end;
                at_line_start = false;
            }
            b';' if i == 0 || matches!(bytes[i - 1], b' ' | b'\t' | b'\r' | b'\n') => {
                let end = line_end(bytes, i);
                blank(&mut out, i, end);
                i = end;
            }
            b'`' => {
                at_line_start = false;
                i += 2;
            }
            quote @ b'"' => {
                at_line_start = false;
                i = mask_string(bytes, &mut out, i, quote, version);
            }
            quote @ b'\'' if version == EngineVersion::V2 => {
                at_line_start = false;
                i = mask_string(bytes, &mut out, i, quote, version);
            }
            _ => {
                at_line_start = false;
                i += 1;
            }
        }
    }

    // Only whole runs between ASCII delimiters were blanked, so this holds.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Blank the contents of the string starting at `open` and return the index
/// just past it. Strings never span lines.
fn mask_string(bytes: &[u8], out: &mut [u8], open: usize, quote: u8, version: EngineVersion) -> usize {
    let mut j = open + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\n' => break,
            b'`' if version == EngineVersion::V2 => j += 2,
            b if b == quote => {
                if version == EngineVersion::V1 && bytes.get(j + 1) == Some(&quote) {
                    j += 2;
                    continue;
                }
                blank(out, open + 1, j);
                return j + 1;
            }
            _ => j += 1,
        }
    }
    let end = j.min(bytes.len());
    blank(out, open + 1, end);
    end
}

fn block_comment_end(bytes: &[u8], from: usize) -> usize {
    let mut j = from;
    while j + 1 < bytes.len() {
        if bytes[j] == b'*' && bytes[j + 1] == b'/' {
            return j + 2;
        }
        j += 1;
    }
    bytes.len()
}

fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |p| from + p)
}

fn blank(out: &mut [u8], from: usize, to: usize) {
    let to = to.min(out.len());
    for b in out.iter_mut().take(to).skip(from) {
        if *b != b'\n' {
            *b = b' ';
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1(text: &str) -> String {
        mask_source(text, EngineVersion::V1)
    }

    fn v2(text: &str) -> String {
        mask_source(text, EngineVersion::V2)
    }

    #[test]
    fn line_comment_is_blanked() {
        let text = "x := 1 ; set { x\ny := 2";
        let masked = v2(text);
        assert_eq!(masked.len(), text.len());
        assert_eq!(masked, "x := 1          \ny := 2");
    }

    #[test]
    fn semicolon_without_space_is_not_a_comment() {
        assert_eq!(v1("a;b"), "a;b");
    }

    #[test]
    fn block_comment_keeps_newlines() {
        let text = "/* {\n } */\nF() {\n}";
        let masked = v2(text);
        assert_eq!(masked, "    \n     \nF() {\n}");
    }

    #[test]
    fn block_comment_only_at_line_start() {
        let text = "x := a /* b";
        assert_eq!(v2(text), text);
    }

    #[test]
    fn string_contents_are_blanked() {
        assert_eq!(v2(r#"s := "{ ; }""#), r#"s := "     ""#);
    }

    #[test]
    fn v1_doubled_quote_stays_inside_string() {
        assert_eq!(v1(r#"s := "a""}" ; c"#), r#"s := "    "    "#);
    }

    #[test]
    fn v2_single_quotes_and_backtick_escapes() {
        assert_eq!(v2(r#"s := 'it`'s {'"#), r#"s := '       '"#);
        assert_eq!(v1("s := 'a' {"), "s := 'a' {");
    }

    #[test]
    fn unterminated_string_stops_at_line_end() {
        assert_eq!(v2("s := \"abc\nF() {"), "s := \"   \nF() {");
    }

    #[test]
    fn multibyte_text_keeps_byte_length() {
        let text = "x := \"héllo\" ; ünïcode\ny";
        let masked = v2(text);
        assert_eq!(masked.len(), text.len());
        assert!(masked.ends_with("\ny"));
        assert!(!masked.contains('é'));
    }
}
