//! Hit conditions and logpoint message templates.

use crate::error::AdapterError;

/// DBGP hit condition operator (`-o`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOperator {
    /// Break once the hit count reaches the value.
    AtLeast,
    /// Break only on exactly that hit.
    Equal,
    /// Break on every multiple of the value.
    Multiple,
}

impl HitOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            HitOperator::AtLeast => ">=",
            HitOperator::Equal => "==",
            HitOperator::Multiple => "%",
        }
    }
}

/// A parsed hit condition, sent as `-h value -o op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitCondition {
    pub value: u32,
    pub operator: HitOperator,
}

impl HitCondition {
    /// Parse a front-end hit condition.
    ///
    /// Accepts `N`, `>= N`, `> N`, `== N`, `= N` and `% N`. A bare number
    /// means `>= N`. Blank input means no hit condition.
    pub fn parse(text: &str) -> Result<Option<Self>, AdapterError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let invalid = || AdapterError::InvalidHitCondition(trimmed.to_string());

        let (operator, rest, offset) = if let Some(rest) = trimmed.strip_prefix(">=") {
            (HitOperator::AtLeast, rest, 0)
        } else if let Some(rest) = trimmed.strip_prefix('>') {
            (HitOperator::AtLeast, rest, 1)
        } else if let Some(rest) = trimmed.strip_prefix("==") {
            (HitOperator::Equal, rest, 0)
        } else if let Some(rest) = trimmed.strip_prefix('=') {
            (HitOperator::Equal, rest, 0)
        } else if let Some(rest) = trimmed.strip_prefix('%') {
            (HitOperator::Multiple, rest, 0)
        } else {
            (HitOperator::AtLeast, trimmed, 0)
        };

        let value: u32 = rest.trim().parse().map_err(|_| invalid())?;
        let value = value.checked_add(offset).ok_or_else(invalid)?;
        if value == 0 {
            return Err(invalid());
        }
        Ok(Some(Self { value, operator }))
    }
}

/// One piece of a logpoint message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSegment {
    Text(String),
    /// An expression between braces, evaluated when the logpoint is hit.
    Expression(String),
}

/// Split a logpoint message into literal text and `{expression}` parts.
///
/// `\{` and `\}` are literal braces. An unterminated `{` is kept as text.
pub fn parse_log_message(message: &str) -> Vec<LogSegment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = message.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some((_, '{' | '}'))) => {
                if let Some((_, brace)) = chars.next() {
                    text.push(brace);
                }
            }
            '{' => match closing_brace(message, i) {
                Some(end) => {
                    if !text.is_empty() {
                        segments.push(LogSegment::Text(std::mem::take(&mut text)));
                    }
                    let expression = message[i + 1..end].trim();
                    if !expression.is_empty() {
                        segments.push(LogSegment::Expression(expression.to_string()));
                    }
                    while chars.peek().is_some_and(|(j, _)| *j <= end) {
                        chars.next();
                    }
                }
                None => text.push(c),
            },
            _ => text.push(c),
        }
    }
    if !text.is_empty() {
        segments.push(LogSegment::Text(text));
    }
    segments
}

/// Index of the `}` matching the `{` at `open`, counting nested braces.
fn closing_brace(message: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in message[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(text: &str) -> Option<HitCondition> {
        HitCondition::parse(text).unwrap()
    }

    #[test]
    fn hit_condition_forms() {
        let at_least = |value| Some(HitCondition {
            value,
            operator: HitOperator::AtLeast,
        });
        assert_eq!(hit("5"), at_least(5));
        assert_eq!(hit(">= 5"), at_least(5));
        assert_eq!(hit("> 5"), at_least(6));
        assert_eq!(
            hit("== 3"),
            Some(HitCondition {
                value: 3,
                operator: HitOperator::Equal
            })
        );
        assert_eq!(hit("=3").map(|h| h.operator), Some(HitOperator::Equal));
        assert_eq!(
            hit("% 2"),
            Some(HitCondition {
                value: 2,
                operator: HitOperator::Multiple
            })
        );
        assert_eq!(hit("   "), None);
    }

    #[test]
    fn unsupported_hit_conditions_are_rejected() {
        for bad in ["< 3", "abc", "== ", "% 0", "-1"] {
            assert!(
                matches!(HitCondition::parse(bad), Err(AdapterError::InvalidHitCondition(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn operator_wire_strings() {
        assert_eq!(HitOperator::AtLeast.as_str(), ">=");
        assert_eq!(HitOperator::Equal.as_str(), "==");
        assert_eq!(HitOperator::Multiple.as_str(), "%");
    }

    #[test]
    fn log_message_segments() {
        assert_eq!(
            parse_log_message("x = {x}, y = {obj.y}!"),
            vec![
                LogSegment::Text("x = ".into()),
                LogSegment::Expression("x".into()),
                LogSegment::Text(", y = ".into()),
                LogSegment::Expression("obj.y".into()),
                LogSegment::Text("!".into()),
            ]
        );
    }

    #[test]
    fn log_message_escapes_and_unterminated_braces() {
        assert_eq!(
            parse_log_message(r"\{literal\} {a"),
            vec![LogSegment::Text("{literal} {a".into())]
        );
    }

    #[test]
    fn log_message_nested_braces_stay_in_expression() {
        assert_eq!(
            parse_log_message("{m[{k}]}"),
            vec![LogSegment::Expression("m[{k}]".into())]
        );
        assert_eq!(parse_log_message("{}"), Vec::<LogSegment>::new());
    }
}
