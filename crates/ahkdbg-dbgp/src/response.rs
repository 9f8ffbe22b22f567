//! Responses and their command-specific views.

use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, ProtocolError};
use crate::packet::decode_text;
use crate::xml::XmlElement;

/// Engine run state reported by status-bearing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Starting,
    Running,
    Break,
    Stopping,
    Stopped,
}

impl RunState {
    /// `stopped` is terminal.
    pub fn is_terminal(self) -> bool {
        self == RunState::Stopped
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Break => "break",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
        }
    }
}

impl FromStr for RunState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(RunState::Starting),
            "running" => Ok(RunState::Running),
            "break" => Ok(RunState::Break),
            "stopping" => Ok(RunState::Stopping),
            "stopped" => Ok(RunState::Stopped),
            other => Err(ProtocolError::InvalidXml(format!("unknown status {other:?}"))),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the engine entered its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusReason {
    Ok,
    Error,
    Aborted,
    Exception,
}

impl FromStr for StatusReason {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(StatusReason::Ok),
            "error" => Ok(StatusReason::Error),
            "aborted" => Ok(StatusReason::Aborted),
            "exception" => Ok(StatusReason::Exception),
            other => Err(ProtocolError::InvalidXml(format!("unknown reason {other:?}"))),
        }
    }
}

/// A `<response>` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Command this response answers.
    pub command: String,
    /// Transaction id copied from the command.
    pub transaction_id: u32,
    /// Engine error, if the command failed.
    pub error: Option<EngineError>,
    /// The full element, for command-specific fields.
    pub element: XmlElement,
}

impl Response {
    pub(crate) fn from_element(element: XmlElement) -> Result<Self, ProtocolError> {
        let command = element.attr("command").unwrap_or_default().to_string();
        let transaction_id = element
            .require_attr("transaction_id")?
            .trim()
            .parse()
            .map_err(|_| ProtocolError::MissingAttribute {
                element: "response".into(),
                attribute: "transaction_id".into(),
            })?;
        let error = element.child("error").map(|err| EngineError {
            command: command.clone(),
            code: err.attr_u32("code").unwrap_or(999),
            message: err
                .child("message")
                .map(|m| m.text.trim().to_string())
                .unwrap_or_default(),
        });
        Ok(Self {
            command,
            transaction_id,
            error,
            element,
        })
    }

    /// Convert an error response into `Err`.
    pub fn into_result(self) -> Result<Response, EngineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Attribute lookup on the response element.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }

    /// `status` attribute of continuation and `status` responses.
    pub fn status(&self) -> Option<RunState> {
        self.attr("status").and_then(|s| s.parse().ok())
    }

    /// `reason` attribute of continuation and `status` responses.
    pub fn reason(&self) -> Option<StatusReason> {
        self.attr("reason").and_then(|s| s.parse().ok())
    }

    /// `success="1"` on feature_set, breakpoint_remove, property_set, ...
    pub fn success(&self) -> bool {
        self.element.attr_flag("success")
    }

    /// Breakpoint id from a `breakpoint_set` response.
    pub fn breakpoint_id(&self) -> Option<u32> {
        self.element.attr_u32("id")
    }

    /// Breakpoints from `breakpoint_get` / `breakpoint_list`.
    pub fn breakpoints(&self) -> Vec<EngineBreakpoint> {
        self.element
            .children_named("breakpoint")
            .map(EngineBreakpoint::from_element)
            .collect()
    }

    /// Frames from `stack_get`, innermost first.
    pub fn stack_frames(&self) -> Vec<StackFrame> {
        let mut frames: Vec<StackFrame> = self
            .element
            .children_named("stack")
            .map(StackFrame::from_element)
            .collect();
        frames.sort_by_key(|f| f.level);
        frames
    }

    /// Contexts from `context_names`.
    pub fn contexts(&self) -> Vec<ContextName> {
        self.element
            .children_named("context")
            .map(|c| ContextName {
                name: c.attr("name").unwrap_or_default().to_string(),
                id: c.attr_u32("id").unwrap_or(0),
            })
            .collect()
    }

    /// Properties from `context_get`, `property_get` or `eval`.
    pub fn properties(&self) -> Result<Vec<Property>, ProtocolError> {
        self.element
            .children_named("property")
            .map(Property::from_element)
            .collect()
    }

    /// Result of `feature_get`: `None` when the feature is unsupported.
    pub fn feature_value(&self) -> Option<String> {
        if !self.element.attr_flag("supported") {
            return None;
        }
        let encoding = self.attr("encoding").unwrap_or("none");
        decode_text(self.element.text.trim(), encoding).ok()
    }
}

/// A breakpoint as the engine reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineBreakpoint {
    pub id: u32,
    /// DBGP breakpoint type (`line`, `conditional`, `exception`, ...).
    pub kind: String,
    pub state: String,
    pub file_uri: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub exception: Option<String>,
    pub hit_value: Option<u32>,
    pub hit_condition: Option<String>,
    pub hit_count: Option<u32>,
    pub temporary: bool,
    /// Condition expression, already decoded.
    pub expression: Option<String>,
}

impl EngineBreakpoint {
    fn from_element(el: &XmlElement) -> Self {
        let owned = |name: &str| el.attr(name).map(str::to_string);
        let expression = el.child("expression").and_then(|e| {
            decode_text(e.text.trim(), e.attr("encoding").unwrap_or("base64")).ok()
        });
        Self {
            id: el.attr_u32("id").unwrap_or(0),
            kind: el.attr("type").unwrap_or("line").to_string(),
            state: el.attr("state").unwrap_or("enabled").to_string(),
            file_uri: owned("filename"),
            line: el.attr_u32("lineno"),
            function: owned("function"),
            exception: owned("exception"),
            hit_value: el.attr_u32("hit_value"),
            hit_condition: owned("hit_condition"),
            hit_count: el.attr_u32("hit_count"),
            temporary: el.attr_flag("temporary"),
            expression,
        }
    }
}

/// One frame from `stack_get`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub level: u32,
    pub kind: String,
    pub file_uri: String,
    pub line: u32,
    /// Function or label the frame is in.
    pub location: String,
}

impl StackFrame {
    fn from_element(el: &XmlElement) -> Self {
        Self {
            level: el.attr_u32("level").unwrap_or(0),
            kind: el.attr("type").unwrap_or("file").to_string(),
            file_uri: el.attr("filename").unwrap_or_default().to_string(),
            line: el.attr_u32("lineno").unwrap_or(0),
            location: el.attr("where").unwrap_or_default().to_string(),
        }
    }
}

/// A variable context (`Local`, `Global`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextName {
    pub name: String,
    pub id: u32,
}

/// A variable or object member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    /// Expression that addresses this property from its context.
    pub full_name: String,
    pub kind: String,
    pub class_name: Option<String>,
    pub facet: String,
    pub size: Option<u64>,
    pub page: u32,
    pub page_size: u32,
    pub has_children: bool,
    pub num_children: u32,
    /// Decoded scalar value; `None` for objects.
    pub value: Option<String>,
    /// Children included in this response (depth permitting).
    pub children: Vec<Property>,
}

impl Property {
    fn from_element(el: &XmlElement) -> Result<Self, ProtocolError> {
        let children = el
            .children_named("property")
            .map(Property::from_element)
            .collect::<Result<Vec<_>, _>>()?;
        let encoding = el.attr("encoding").unwrap_or("none");
        let value = if el.text.is_empty() && el.attr("encoding").is_none() {
            None
        } else {
            Some(decode_text(&el.text, encoding)?)
        };
        let name = el.attr("name").unwrap_or_default().to_string();
        Ok(Self {
            full_name: el.attr("fullname").map(str::to_string).unwrap_or_else(|| name.clone()),
            name,
            kind: el.attr("type").unwrap_or("undefined").to_string(),
            class_name: el.attr("classname").filter(|c| !c.is_empty()).map(str::to_string),
            facet: el.attr("facet").unwrap_or_default().to_string(),
            size: el.attr("size").and_then(|s| s.parse().ok()),
            page: el.attr_u32("page").unwrap_or(0),
            page_size: el.attr_u32("pagesize").unwrap_or(0),
            has_children: el.attr_flag("children"),
            num_children: el.attr_u32("numchildren").unwrap_or(0),
            value,
            children,
        })
    }

    /// Display text: the scalar value, or the class name for objects.
    pub fn display_value(&self) -> String {
        match (&self.value, &self.class_name) {
            (Some(v), _) if !self.has_children => v.clone(),
            (_, Some(class)) => format!("{class} ({})", self.num_children),
            (Some(v), None) => v.clone(),
            (None, None) => self.kind.clone(),
        }
    }
}
