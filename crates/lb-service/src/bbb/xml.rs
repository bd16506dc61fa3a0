//! BBB XML envelope building, querying and rewriting.
//!
//! The BBB API speaks a shallow XML dialect. This module provides a tiny
//! element builder for responses the balancer emits itself, plus streaming
//! helpers (quick-xml) for documents received from backends: text lookup by
//! path, subtree extraction, meeting-ID rewriting and root re-tagging.

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use thiserror::Error;

/// Error raised for documents that cannot be parsed or rewritten.
#[derive(Debug, Error)]
#[error("invalid XML: {0}")]
pub struct XmlError(String);

impl From<quick_xml::Error> for XmlError {
    fn from(err: quick_xml::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<std::io::Error> for XmlError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

/// A small owned XML element tree for building responses.
#[derive(Debug, Clone)]
pub struct Xml {
    tag: String,
    text: Option<String>,
    children: Vec<Xml>,
}

impl Xml {
    /// An empty element.
    #[must_use]
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            text: None,
            children: Vec::new(),
        }
    }

    /// A text-only element.
    #[must_use]
    pub fn text(tag: &str, value: impl Into<String>) -> Self {
        Self {
            tag: tag.to_string(),
            text: Some(value.into()),
            children: Vec::new(),
        }
    }

    /// Append a child element.
    #[must_use]
    pub fn child(mut self, child: Xml) -> Self {
        self.children.push(child);
        self
    }

    /// Append a pre-rendered XML fragment verbatim.
    ///
    /// The fragment must be well-formed; it is the caller's job to only pass
    /// XML that came out of a parser.
    #[must_use]
    pub fn raw(mut self, fragment: impl Into<String>) -> Self {
        self.children.push(Xml {
            tag: String::new(),
            text: Some(fragment.into()),
            children: Vec::new(),
        });
        self
    }

    /// Render to a string.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        if self.tag.is_empty() {
            // Raw fragment node.
            if let Some(text) = &self.text {
                out.push_str(text);
            }
            return;
        }
        out.push('<');
        out.push_str(&self.tag);
        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(text) = &self.text {
            out.push_str(&quick_xml::escape::escape(text.as_str()));
        }
        for child in &self.children {
            child.render_into(out);
        }
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }
}

/// Build a `<response><returncode>SUCCESS</returncode>...</response>` body.
#[must_use]
pub fn success_response(children: Vec<Xml>) -> String {
    let mut response = Xml::new("response").child(Xml::text("returncode", "SUCCESS"));
    for child in children {
        response = response.child(child);
    }
    response.render()
}

/// Build a BBB error envelope with `messageKey` and `message`.
#[must_use]
pub fn error_response(message_key: &str, message: &str) -> String {
    Xml::new("response")
        .child(Xml::text("returncode", "FAILED"))
        .child(Xml::text("messageKey", message_key))
        .child(Xml::text("message", message))
        .render()
}

/// Find the text of the element at `path`, relative to the document root.
///
/// `find_text(xml, &["meetings", "meeting"])` returns the first matching
/// element's text. Parse failures and missing elements both yield `None`.
#[must_use]
pub fn find_text(xml: &str, path: &[&str]) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut capture = false;
    let mut captured = String::new();

    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(name);
                capture = stack.len() == path.len() + 1
                    && stack.iter().skip(1).map(String::as_str).eq(path.iter().copied());
            }
            Event::End(_) => {
                if capture {
                    return Some(captured);
                }
                stack.pop();
                capture = false;
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                stack.push(name);
                let matched = stack.len() == path.len() + 1
                    && stack.iter().skip(1).map(String::as_str).eq(path.iter().copied());
                stack.pop();
                if matched {
                    return Some(String::new());
                }
            }
            Event::Text(e) => {
                if capture {
                    captured.push_str(&e.unescape().ok()?);
                }
            }
            Event::CData(e) => {
                if capture {
                    captured.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Extract all outermost `<tag>...</tag>` subtrees as raw XML strings.
///
/// # Errors
///
/// Returns `XmlError` when the document cannot be parsed.
pub fn extract_elements(xml: &str, tag: &str) -> Result<Vec<String>, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    let mut writer: Option<Writer<Cursor<Vec<u8>>>> = None;
    let mut depth = 0usize;

    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) => {
                if writer.is_none() && e.name().as_ref() == tag.as_bytes() {
                    writer = Some(Writer::new(Cursor::new(Vec::new())));
                }
                if let Some(w) = &mut writer {
                    w.write_event(event.clone())?;
                    depth += 1;
                }
            }
            Event::End(_) => {
                if let Some(w) = &mut writer {
                    w.write_event(event.clone())?;
                    depth -= 1;
                    if depth == 0 {
                        if let Some(w) = writer.take() {
                            out.push(
                                String::from_utf8_lossy(&w.into_inner().into_inner())
                                    .into_owned(),
                            );
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {
                if let Some(w) = &mut writer {
                    w.write_event(event.clone())?;
                }
            }
        }
    }

    Ok(out)
}

/// Rewrite the text of `<meetingID>`/`<meetingId>` elements equal to `search`.
///
/// Used to swap scoped meeting IDs back to the frontend's unscoped form in
/// upstream responses. Every other byte of the document passes through.
///
/// # Errors
///
/// Returns `XmlError` when the document cannot be parsed.
pub fn rewrite_meeting_ids(xml: &str, search: &str, replace: &str) -> Result<String, XmlError> {
    const ID_TAGS: [&[u8]; 2] = [b"meetingID", b"meetingId"];

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut in_id_tag = false;

    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) => {
                in_id_tag = ID_TAGS.contains(&e.name().as_ref());
                writer.write_event(event.clone())?;
            }
            Event::End(_) => {
                in_id_tag = false;
                writer.write_event(event.clone())?;
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                if in_id_tag && text == search {
                    writer.write_event(Event::Text(
                        quick_xml::events::BytesText::new(replace).into_owned(),
                    ))?;
                } else {
                    writer.write_event(event.clone())?;
                }
            }
            Event::Eof => break,
            _ => writer.write_event(event.clone())?,
        }
    }

    Ok(String::from_utf8_lossy(&writer.into_inner().into_inner()).into_owned())
}

/// Re-tag the root element of a fragment, keeping attributes and content.
///
/// # Errors
///
/// Returns `XmlError` for unparseable fragments or fragments without a root.
pub fn rename_root(xml: &str, new_tag: &str) -> Result<String, XmlError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut depth = 0usize;
    let mut seen_root = false;

    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) => {
                depth += 1;
                if depth == 1 {
                    seen_root = true;
                    let mut start = BytesStart::new(new_tag);
                    for attr in e.attributes().flatten() {
                        start.push_attribute(attr);
                    }
                    writer.write_event(Event::Start(start))?;
                } else {
                    writer.write_event(event.clone())?;
                }
            }
            Event::End(_) => {
                if depth == 1 {
                    writer.write_event(Event::End(BytesEnd::new(new_tag)))?;
                } else {
                    writer.write_event(event.clone())?;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => writer.write_event(event.clone())?,
        }
    }

    if !seen_root {
        return Err(XmlError("fragment has no root element".to_string()));
    }
    Ok(String::from_utf8_lossy(&writer.into_inner().into_inner()).into_owned())
}

/// Find an attribute value on the element at `path`, relative to the root.
///
/// Used for `<meeting externalId="...">` in recording metadata documents.
#[must_use]
pub fn find_attr(xml: &str, path: &[&str], attr: &str) -> Option<String> {
    fn attr_of(e: &BytesStart<'_>, attr: &str) -> Option<String> {
        e.attributes()
            .flatten()
            .find(|a| a.key.as_ref() == attr.as_bytes())
            .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
    }

    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event().ok()? {
            Event::Start(e) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                let matched = stack.len() == path.len() + 1
                    && stack.iter().skip(1).map(String::as_str).eq(path.iter().copied());
                if matched {
                    if let Some(value) = attr_of(&e, attr) {
                        return Some(value);
                    }
                }
            }
            Event::Empty(e) => {
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                let matched = stack.len() == path.len() + 1
                    && stack.iter().skip(1).map(String::as_str).eq(path.iter().copied());
                let value = if matched { attr_of(&e, attr) } else { None };
                stack.pop();
                if let Some(value) = value {
                    return Some(value);
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Collect the direct children of the element at `path` as `(tag, text)`
/// pairs, in document order. Used for `<metadata>` maps.
#[must_use]
pub fn child_text_map(xml: &str, path: &[&str]) -> Vec<(String, String)> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut out = Vec::new();
    let mut current: Option<(String, String)> = None;

    loop {
        let Ok(event) = reader.read_event() else {
            return out;
        };
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let inside_target = stack.len() == path.len() + 1
                    && stack.iter().skip(1).map(String::as_str).eq(path.iter().copied());
                if inside_target {
                    current = Some((name.clone(), String::new()));
                }
                stack.push(name);
            }
            Event::End(_) => {
                stack.pop();
                let at_child_close = stack.len() == path.len() + 1;
                if at_child_close {
                    if let Some(entry) = current.take() {
                        out.push(entry);
                    }
                }
            }
            Event::Empty(e) => {
                let inside_target = stack.len() == path.len() + 1
                    && stack.iter().skip(1).map(String::as_str).eq(path.iter().copied());
                if inside_target {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    out.push((name, String::new()));
                }
            }
            Event::Text(e) => {
                if let Some((_, value)) = &mut current {
                    if let Ok(text) = e.unescape() {
                        value.push_str(&text);
                    }
                }
            }
            Event::Eof => return out,
            _ => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const MEETINGS: &str = "<response><returncode>SUCCESS</returncode><meetings>\
         <meeting><meetingID>t1:room</meetingID><participantCount>3</participantCount>\
         <metadata><bbblb-tenant>t1</bbblb-tenant></metadata></meeting>\
         <meeting><meetingID>t2:other</meetingID><participantCount>5</participantCount>\
         <metadata><bbblb-tenant>t2</bbblb-tenant></metadata></meeting>\
         </meetings></response>";

    #[test]
    fn test_builder_renders_escaped() {
        let xml = Xml::new("response")
            .child(Xml::text("returncode", "SUCCESS"))
            .child(Xml::text("message", "a < b & c"))
            .render();

        assert_eq!(
            xml,
            "<response><returncode>SUCCESS</returncode><message>a &lt; b &amp; c</message></response>"
        );
    }

    #[test]
    fn test_error_response_shape() {
        let xml = error_response("checksumError", "Checksum mismatch");
        assert!(xml.contains("<returncode>FAILED</returncode>"));
        assert!(xml.contains("<messageKey>checksumError</messageKey>"));
        assert!(xml.contains("<message>Checksum mismatch</message>"));
    }

    #[test]
    fn test_find_text_simple() {
        let xml = "<response><returncode>SUCCESS</returncode><running>false</running></response>";
        assert_eq!(find_text(xml, &["returncode"]).as_deref(), Some("SUCCESS"));
        assert_eq!(find_text(xml, &["running"]).as_deref(), Some("false"));
        assert_eq!(find_text(xml, &["missing"]), None);
    }

    #[test]
    fn test_find_text_nested_path() {
        assert_eq!(
            find_text(MEETINGS, &["meetings", "meeting", "meetingID"]).as_deref(),
            Some("t1:room")
        );
    }

    #[test]
    fn test_find_text_unescapes() {
        let xml = "<response><message>a &amp; b</message></response>";
        assert_eq!(find_text(xml, &["message"]).as_deref(), Some("a & b"));
    }

    #[test]
    fn test_extract_elements() {
        let meetings = extract_elements(MEETINGS, "meeting").unwrap();
        assert_eq!(meetings.len(), 2);
        assert!(meetings.first().unwrap().contains("t1:room"));
        assert!(meetings.get(1).unwrap().contains("t2:other"));

        // Extracted fragments parse standalone.
        assert_eq!(
            find_text(meetings.first().unwrap(), &["participantCount"]).as_deref(),
            Some("3")
        );
    }

    #[test]
    fn test_rewrite_meeting_ids() {
        let rewritten = rewrite_meeting_ids(MEETINGS, "t1:room", "room").unwrap();
        assert!(rewritten.contains("<meetingID>room</meetingID>"));
        // Other tenant untouched.
        assert!(rewritten.contains("<meetingID>t2:other</meetingID>"));
        // Non-ID content untouched.
        assert!(rewritten.contains("<participantCount>3</participantCount>"));
    }

    #[test]
    fn test_rewrite_leaves_unrelated_documents_untouched() {
        let xml = "<response><returncode>SUCCESS</returncode></response>";
        let rewritten = rewrite_meeting_ids(xml, "x", "y").unwrap();
        assert_eq!(rewritten, xml);
    }

    #[test]
    fn test_rename_root() {
        let xml = "<playback><format>presentation</format><link>http://x</link></playback>";
        let renamed = rename_root(xml, "format").unwrap();
        assert!(renamed.starts_with("<format>"));
        assert!(renamed.ends_with("</format>"));
        assert!(renamed.contains("<link>http://x</link>"));
    }

    #[test]
    fn test_find_attr() {
        let xml = "<recording><meeting id=\"int-1\" externalId=\"room-1\"/>\
                   <participants>3</participants></recording>";
        assert_eq!(
            find_attr(xml, &["meeting"], "externalId").as_deref(),
            Some("room-1")
        );
        assert_eq!(find_attr(xml, &["meeting"], "missing"), None);

        let non_empty = "<recording><meeting externalId=\"room-2\">x</meeting></recording>";
        assert_eq!(
            find_attr(non_empty, &["meeting"], "externalId").as_deref(),
            Some("room-2")
        );
    }

    #[test]
    fn test_child_text_map() {
        let xml = "<recording><meta><meetingName>Demo</meetingName>\
                   <bbblb-tenant>t1</bbblb-tenant></meta></recording>";
        let map = child_text_map(xml, &["meta"]);
        assert_eq!(
            map,
            vec![
                ("meetingName".to_string(), "Demo".to_string()),
                ("bbblb-tenant".to_string(), "t1".to_string()),
            ]
        );
    }
}
