//! Ordered BBB query parameters and tenant-scoped meeting IDs.
//!
//! BBB checksums are computed over the serialized query string, so parameter
//! order matters: `Params` preserves insertion order and serializes exactly
//! the way it will be signed. Decoding accepts standard form-urlencoding
//! (`+` for space, `%XX` escapes).

use std::fmt::Write as _;

/// Maximum meeting ID length the backend accepts, including the scope prefix.
pub const MAX_MEETING_ID_LEN: usize = 256;

/// Separator between tenant scope and external meeting ID.
///
/// Tenant names must not contain this character, which keeps the encoding
/// reversible for arbitrary external IDs.
pub const SCOPE_SEPARATOR: char = ':';

/// Prefix an external meeting ID with the tenant scope.
#[must_use]
pub fn add_scope(external_id: &str, tenant: &str) -> String {
    format!("{tenant}{SCOPE_SEPARATOR}{external_id}")
}

/// Split a scoped meeting ID into `(external_id, scope)`.
///
/// Returns `None` when the value carries no scope prefix.
#[must_use]
pub fn split_scope(scoped_id: &str) -> Option<(&str, &str)> {
    scoped_id
        .split_once(SCOPE_SEPARATOR)
        .map(|(scope, id)| (id, scope))
}

/// An ordered multimap of query parameters.
///
/// Insertion order is preserved across `get`/`set` so that serialization is
/// stable, which the checksum scheme depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Parse a form-urlencoded query string, preserving parameter order.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut params = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.push((decode_component(name), decode_component(value)));
        }
        Self(params)
    }

    /// First value for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set `name` to `value`, replacing the first occurrence in place or
    /// appending at the end. Further duplicates are dropped.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|(n, _)| n == name) {
            Some(idx) => {
                if let Some(entry) = self.0.get_mut(idx) {
                    entry.1 = value;
                }
                // Drop duplicates after the first occurrence.
                let mut seen = false;
                self.0.retain(|(n, _)| {
                    if n == name {
                        let keep = !seen;
                        seen = true;
                        keep
                    } else {
                        true
                    }
                });
            }
            None => self.0.push((name.to_string(), value)),
        }
    }

    /// Remove all values for `name`, returning the first removed value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self
            .0
            .iter()
            .position(|(n, _)| n == name)
            .map(|idx| self.0.remove(idx).1);
        self.0.retain(|(n, _)| n != name);
        first
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All parameter names, in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Serialize back into a form-urlencoded query string in insertion order.
    #[must_use]
    pub fn to_query_string(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.0 {
            if !out.is_empty() {
                out.push('&');
            }
            encode_component_into(&mut out, name);
            out.push('=');
            encode_component_into(&mut out, value);
        }
        out
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes.get(i) {
            Some(b'+') => {
                out.push(b' ');
                i += 1;
            }
            Some(b'%') => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            Some(b) => {
                out.push(*b);
                i += 1;
            }
            None => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn encode_component_into(out: &mut String, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trip() {
        let long_id = "x".repeat(250);
        for id in ["room-1", "a:b:c", "", "äöü meeting", long_id.as_str()] {
            let scoped = add_scope(id, "tenant1");
            let (unscoped, scope) = split_scope(&scoped).unwrap();
            assert_eq!(unscoped, id);
            assert_eq!(scope, "tenant1");
        }
    }

    #[test]
    fn test_split_scope_without_separator() {
        assert!(split_scope("plain-id").is_none());
    }

    #[test]
    fn test_from_query_preserves_order() {
        let params = Params::from_query("name=Room&meetingID=m1&record=true");
        let names: Vec<&str> = params.names().collect();
        assert_eq!(names, vec!["name", "meetingID", "record"]);
    }

    #[test]
    fn test_decode_plus_and_percent() {
        let params = Params::from_query("name=My+Room&greeting=hello%20%26%20welcome");
        assert_eq!(params.get("name"), Some("My Room"));
        assert_eq!(params.get("greeting"), Some("hello & welcome"));
    }

    #[test]
    fn test_encode_round_trip() {
        let mut params = Params::new();
        params.set("name", "My Room & Friends");
        params.set("meetingID", "tenant1:room/1");

        let query = params.to_query_string();
        let decoded = Params::from_query(&query);
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut params = Params::from_query("a=1&b=2&c=3");
        params.set("b", "two");
        assert_eq!(params.to_query_string(), "a=1&b=two&c=3");
    }

    #[test]
    fn test_set_drops_duplicates() {
        let mut params = Params::from_query("a=1&b=2&a=3");
        params.set("a", "one");
        assert_eq!(params.to_query_string(), "a=one&b=2");
    }

    #[test]
    fn test_remove_returns_first_value() {
        let mut params = Params::from_query("a=1&b=2&a=3");
        assert_eq!(params.remove("a"), Some("1".to_string()));
        assert!(!params.contains("a"));
        assert_eq!(params.remove("a"), None);
    }

    #[test]
    fn test_value_without_equals() {
        let params = Params::from_query("checksum");
        assert_eq!(params.get("checksum"), Some(""));
    }
}
