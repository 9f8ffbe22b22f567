//! Typed engine-to-IDE packets.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::ProtocolError;
use crate::response::Response;
use crate::xml::{parse_element, XmlElement};

/// One decoded engine packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Handshake sent by the engine right after connecting.
    Init(InitPacket),
    /// Redirected stdout/stderr output.
    Stream(StreamPacket),
    /// Answer to a command.
    Response(Response),
    /// Asynchronous engine notification.
    Notify(NotifyPacket),
}

impl Packet {
    /// Parse a packet from a frame payload.
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let root = parse_element(payload)?;
        Self::from_element(root)
    }

    /// Build a packet from an already parsed root element.
    pub fn from_element(root: XmlElement) -> Result<Self, ProtocolError> {
        match root.name.as_str() {
            "init" => Ok(Packet::Init(InitPacket::from_element(&root))),
            "stream" => StreamPacket::from_element(&root).map(Packet::Stream),
            "response" => Response::from_element(root).map(Packet::Response),
            "notify" => Ok(Packet::Notify(NotifyPacket::from_element(root))),
            other => Err(ProtocolError::UnknownPacket(other.to_string())),
        }
    }
}

/// Engine identity from the `<init>` packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitPacket {
    pub app_id: String,
    pub ide_key: String,
    pub session: String,
    pub thread: String,
    pub parent: String,
    pub language: String,
    pub protocol_version: String,
    /// URI of the script being debugged.
    pub file_uri: String,
}

impl InitPacket {
    fn from_element(el: &XmlElement) -> Self {
        let get = |name: &str| el.attr(name).unwrap_or_default().to_string();
        Self {
            app_id: get("appid"),
            ide_key: get("ide_key"),
            session: get("session"),
            thread: get("thread"),
            parent: get("parent"),
            language: get("language"),
            protocol_version: get("protocol_version"),
            file_uri: get("fileuri"),
        }
    }
}

/// Which output stream a [`StreamPacket`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Redirected program output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub kind: StreamKind,
    /// Encoding used on the wire (usually `base64`).
    pub encoding: String,
    /// Decoded output text.
    pub data: String,
}

impl StreamPacket {
    fn from_element(el: &XmlElement) -> Result<Self, ProtocolError> {
        let kind = match el.require_attr("type")? {
            "stdout" => StreamKind::Stdout,
            "stderr" => StreamKind::Stderr,
            other => {
                return Err(ProtocolError::UnknownPacket(format!("stream type {other}")));
            }
        };
        let encoding = el.attr("encoding").unwrap_or("none").to_string();
        let data = decode_text(&el.text, &encoding)?;
        Ok(Self {
            kind,
            encoding,
            data,
        })
    }
}

/// An asynchronous `<notify>` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPacket {
    /// Notification name.
    pub name: String,
    /// The raw element for notification-specific fields.
    pub element: XmlElement,
}

impl NotifyPacket {
    fn from_element(element: XmlElement) -> Self {
        let name = element.attr("name").unwrap_or_default().to_string();
        Self { name, element }
    }
}

/// Decode element text according to its `encoding` attribute.
pub(crate) fn decode_text(text: &str, encoding: &str) -> Result<String, ProtocolError> {
    if encoding.eq_ignore_ascii_case("base64") {
        let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let raw = BASE64
            .decode(cleaned.as_bytes())
            .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    } else {
        Ok(text.to_string())
    }
}
