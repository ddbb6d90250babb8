//! Official-account message codec.
//!
//! Inbound deliveries arrive either as the classic `<xml>` document or, for
//! cloud-hosted accounts, as a flat JSON object with the same PascalCase
//! field names. Replies are written back in the format they came in.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Transport encoding of a delivery, chosen from its `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Xml,
    Json,
}

impl WireFormat {
    /// JSON when the header says `application/json`, XML otherwise.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let is_json = content_type
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .is_some_and(|mime| mime.eq_ignore_ascii_case("application/json"));
        if is_json {
            Self::Json
        } else {
            Self::Xml
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Xml => "application/xml",
            Self::Json => "application/json",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("body is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json body is not an object")]
    NotAnObject,
    #[error("invalid xml body: {0}")]
    Xml(String),
    #[error("unexpected xml root <{0}>, expected <xml>")]
    UnexpectedRoot(String),
}

/// One inbound delivery. Absent fields are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub to_user_name: String,
    pub from_user_name: String,
    pub create_time: i64,
    pub msg_type: String,
    pub content: String,
    pub msg_id: String,
    /// Set for `event` deliveries (subscribe, unsubscribe, ...).
    pub event: Option<String>,
}

impl InboundMessage {
    pub fn parse(body: &[u8], format: WireFormat) -> Result<Self, ParseError> {
        match format {
            WireFormat::Json => Self::from_json(body),
            WireFormat::Xml => Self::from_xml(std::str::from_utf8(body)?),
        }
    }

    pub fn from_json(body: &[u8]) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_slice(body)?;
        let Value::Object(map) = value else {
            return Err(ParseError::NotAnObject);
        };
        Ok(Self::from_fields(|name| map.get(name).and_then(json_scalar)))
    }

    pub fn from_xml(body: &str) -> Result<Self, ParseError> {
        let fields = parse_xml_fields(body)?;
        Ok(Self::from_fields(|name| fields.get(name).cloned()))
    }

    fn from_fields(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            to_user_name: get("ToUserName").unwrap_or_default(),
            from_user_name: get("FromUserName").unwrap_or_default(),
            create_time: get("CreateTime")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_default(),
            msg_type: get("MsgType").unwrap_or_default(),
            content: get("Content").unwrap_or_default(),
            msg_id: get("MsgId").map(|v| v.trim().to_string()).unwrap_or_default(),
            event: get("Event").filter(|v| !v.is_empty()),
        }
    }

    /// Returns the question when this is a text message addressed to the bot.
    ///
    /// The trigger prefix is removed together with any separator right after
    /// it (`助手: hi`, `助手：hi`, `助手 hi`). A bare prefix still qualifies and
    /// yields an empty question.
    pub fn triggered_text(&self, trigger_prefix: &str) -> Option<&str> {
        if self.msg_type != "text" {
            return None;
        }
        let rest = self.content.strip_prefix(trigger_prefix)?;
        Some(
            rest.trim_start_matches(|ch: char| ch.is_whitespace() || ch == ':' || ch == '：')
                .trim_end(),
        )
    }
}

// Message ids are 64-bit integers in JSON deliveries, strings in XML ones.
fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Collects the direct children of the `<xml>` root as name → text.
fn parse_xml_fields(body: &str) -> Result<HashMap<String, String>, ParseError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut current: Option<String> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|err| ParseError::Xml(err.to_string()))?;
        match event {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                depth += 1;
                match depth {
                    1 if name != "xml" => return Err(ParseError::UnexpectedRoot(name)),
                    1 => saw_root = true,
                    2 => {
                        current = Some(name);
                        text.clear();
                    }
                    _ => {}
                }
            }
            Event::Empty(empty) => {
                let name = String::from_utf8_lossy(empty.name().as_ref()).into_owned();
                match depth {
                    0 if name != "xml" => return Err(ParseError::UnexpectedRoot(name)),
                    0 => saw_root = true,
                    1 => {
                        fields.insert(name, String::new());
                    }
                    _ => {}
                }
            }
            Event::Text(chunk) if depth == 2 => {
                let unescaped = chunk
                    .unescape()
                    .map_err(|err| ParseError::Xml(err.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::CData(chunk) if depth == 2 => {
                text.push_str(&String::from_utf8_lossy(&chunk.into_inner()));
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some(name) = current.take() {
                        fields.insert(name, std::mem::take(&mut text));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(ParseError::Xml("unexpected end of document".to_string()));
    }
    if !saw_root {
        return Err(ParseError::Xml("missing <xml> root element".to_string()));
    }
    Ok(fields)
}

/// Passive text reply. Sender and recipient are swapped from the inbound
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundReply {
    #[serde(rename = "ToUserName")]
    pub to_user_name: String,
    #[serde(rename = "FromUserName")]
    pub from_user_name: String,
    #[serde(rename = "CreateTime")]
    pub create_time: i64,
    #[serde(rename = "MsgType")]
    pub msg_type: String,
    #[serde(rename = "Content")]
    pub content: String,
}

impl OutboundReply {
    pub fn text(inbound: &InboundMessage, content: impl Into<String>, create_time: i64) -> Self {
        Self {
            to_user_name: inbound.from_user_name.clone(),
            from_user_name: inbound.to_user_name.clone(),
            create_time,
            msg_type: "text".to_string(),
            content: content.into(),
        }
    }

    pub fn render(&self, format: WireFormat) -> Result<String, serde_json::Error> {
        match format {
            WireFormat::Xml => Ok(self.to_xml()),
            WireFormat::Json => serde_json::to_string(self),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<xml>\
             <ToUserName>{}</ToUserName>\
             <FromUserName>{}</FromUserName>\
             <CreateTime>{}</CreateTime>\
             <MsgType>{}</MsgType>\
             <Content>{}</Content>\
             </xml>",
            cdata(&self.to_user_name),
            cdata(&self.from_user_name),
            self.create_time,
            cdata(&self.msg_type),
            cdata(&self.content),
        )
    }
}

/// Wraps `raw` in CDATA, splitting any `]]>` across two sections.
fn cdata(raw: &str) -> String {
    format!("<![CDATA[{}]]>", raw.replace("]]>", "]]]]><![CDATA[>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT_XML: &str = r#"<xml>
        <ToUserName><![CDATA[gh_official]]></ToUserName>
        <FromUserName><![CDATA[o_user]]></FromUserName>
        <CreateTime>1700000000</CreateTime>
        <MsgType><![CDATA[text]]></MsgType>
        <Content><![CDATA[助手：今天天气怎么样]]></Content>
        <MsgId>23637352235060880</MsgId>
    </xml>"#;

    #[test]
    fn content_type_selects_wire_format() {
        assert_eq!(
            WireFormat::from_content_type(Some("application/json; charset=utf-8")),
            WireFormat::Json
        );
        assert_eq!(
            WireFormat::from_content_type(Some("text/xml")),
            WireFormat::Xml
        );
        assert_eq!(WireFormat::from_content_type(None), WireFormat::Xml);
    }

    #[test]
    fn parses_cdata_xml_delivery() {
        let msg = InboundMessage::from_xml(TEXT_XML).unwrap();
        assert_eq!(msg.to_user_name, "gh_official");
        assert_eq!(msg.from_user_name, "o_user");
        assert_eq!(msg.create_time, 1_700_000_000);
        assert_eq!(msg.msg_type, "text");
        assert_eq!(msg.content, "助手：今天天气怎么样");
        assert_eq!(msg.msg_id, "23637352235060880");
        assert_eq!(msg.event, None);
    }

    #[test]
    fn parses_escaped_text_and_event_fields() {
        let msg = InboundMessage::from_xml(
            "<xml><MsgType>event</MsgType><Event>subscribe</Event>\
             <Content>a &amp; b</Content><EventKey/></xml>",
        )
        .unwrap();
        assert_eq!(msg.msg_type, "event");
        assert_eq!(msg.event.as_deref(), Some("subscribe"));
        assert_eq!(msg.content, "a & b");
        assert!(msg.msg_id.is_empty());
    }

    #[test]
    fn parses_json_delivery_with_numeric_msg_id() {
        let body = br#"{"ToUserName":"gh_official","FromUserName":"o_user","CreateTime":1700000000,
            "MsgType":"text","Content":"hello","MsgId":23637352235060880}"#;
        let msg = InboundMessage::from_json(body).unwrap();
        assert_eq!(msg.msg_id, "23637352235060880");
        assert_eq!(msg.create_time, 1_700_000_000);
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn malformed_bodies_are_parse_errors() {
        assert!(matches!(
            InboundMessage::parse(b"{not json", WireFormat::Json),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            InboundMessage::parse(b"[1,2]", WireFormat::Json),
            Err(ParseError::NotAnObject)
        ));
        assert!(matches!(
            InboundMessage::parse(b"<xml><Content>oops</xml>", WireFormat::Xml),
            Err(ParseError::Xml(_))
        ));
        assert!(matches!(
            InboundMessage::parse(b"<root><a>1</a></root>", WireFormat::Xml),
            Err(ParseError::UnexpectedRoot(_))
        ));
        assert!(InboundMessage::parse(b"", WireFormat::Xml).is_err());
        assert!(InboundMessage::parse(&[0xff, 0xfe], WireFormat::Xml).is_err());
    }

    #[test]
    fn trigger_prefix_is_stripped_with_separators() {
        let mut msg = InboundMessage {
            msg_type: "text".into(),
            content: "助手：你好".into(),
            ..InboundMessage::default()
        };
        assert_eq!(msg.triggered_text("助手"), Some("你好"));

        msg.content = "助手 : what is rust ".into();
        assert_eq!(msg.triggered_text("助手"), Some("what is rust"));

        msg.content = "@chatbot hi".into();
        assert_eq!(msg.triggered_text("@chatbot"), Some("hi"));
    }

    #[test]
    fn non_triggered_messages_do_not_qualify() {
        let mut msg = InboundMessage {
            msg_type: "text".into(),
            content: "你好 助手".into(),
            ..InboundMessage::default()
        };
        assert_eq!(msg.triggered_text("助手"), None);

        msg.content = "助手 hi".into();
        msg.msg_type = "image".into();
        assert_eq!(msg.triggered_text("助手"), None);
    }

    #[test]
    fn bare_prefix_qualifies_with_empty_question() {
        let mut msg = InboundMessage {
            msg_type: "text".into(),
            content: "助手".into(),
            ..InboundMessage::default()
        };
        assert_eq!(msg.triggered_text("助手"), Some(""));

        msg.content = "助手：  ".into();
        assert_eq!(msg.triggered_text("助手"), Some(""));
    }

    #[test]
    fn reply_swaps_sender_and_recipient() {
        let inbound = InboundMessage::from_xml(TEXT_XML).unwrap();
        let reply = OutboundReply::text(&inbound, "晴", 1_700_000_100);
        assert_eq!(reply.to_user_name, "o_user");
        assert_eq!(reply.from_user_name, "gh_official");
        assert_eq!(reply.msg_type, "text");
    }

    #[test]
    fn xml_reply_wraps_fields_in_cdata() {
        let inbound = InboundMessage::from_xml(TEXT_XML).unwrap();
        let xml = OutboundReply::text(&inbound, "a < b", 42).to_xml();
        assert_eq!(
            xml,
            "<xml><ToUserName><![CDATA[o_user]]></ToUserName>\
             <FromUserName><![CDATA[gh_official]]></FromUserName>\
             <CreateTime>42</CreateTime>\
             <MsgType><![CDATA[text]]></MsgType>\
             <Content><![CDATA[a < b]]></Content></xml>"
        );
    }

    #[test]
    fn cdata_terminator_in_content_survives_reparse() {
        let inbound = InboundMessage {
            from_user_name: "u".into(),
            to_user_name: "s".into(),
            ..InboundMessage::default()
        };
        let xml = OutboundReply::text(&inbound, "x]]>y", 1).to_xml();
        let reparsed = InboundMessage::from_xml(&xml).unwrap();
        assert_eq!(reparsed.content, "x]]>y");
    }

    #[test]
    fn json_reply_uses_pascal_case_fields() {
        let inbound = InboundMessage::from_xml(TEXT_XML).unwrap();
        let json = OutboundReply::text(&inbound, "ok", 7)
            .render(WireFormat::Json)
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "ToUserName": "o_user",
                "FromUserName": "gh_official",
                "CreateTime": 7,
                "MsgType": "text",
                "Content": "ok"
            })
        );
    }
}
