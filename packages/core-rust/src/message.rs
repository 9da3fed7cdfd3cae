//! The payload portion of an exchange: headers, body, and binary attachments.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::value::Value;

/// Headers, an optional body, and named binary attachments.
///
/// Headers travel with the payload across transport boundaries, unlike
/// exchange properties. Header names are case-sensitive; use
/// [`Message::header_ignore_case`] where a transport folds case.
///
/// Cloning copies the header and attachment maps and shares the body
/// allocation.
#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: BTreeMap<String, Value>,
    body: Option<Value>,
    attachments: BTreeMap<String, Bytes>,
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message carrying `body` and no headers.
    #[must_use]
    pub fn with_body(body: impl Into<Value>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    // -- headers -----------------------------------------------------------

    /// Exact-match header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Case-insensitive header lookup. An exact match wins over folded ones.
    #[must_use]
    pub fn header_ignore_case(&self, name: &str) -> Option<&Value> {
        self.headers.get(name).or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    /// Sets a header, returning the previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.headers.insert(name.into(), value.into())
    }

    /// Removes a header, returning its value.
    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    #[must_use]
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// All headers in name order.
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, Value> {
        &self.headers
    }

    // -- body --------------------------------------------------------------

    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Replaces the body, returning the previous one.
    pub fn set_body(&mut self, body: impl Into<Value>) -> Option<Value> {
        self.body.replace(body.into())
    }

    /// Removes and returns the body.
    pub fn take_body(&mut self) -> Option<Value> {
        self.body.take()
    }

    // -- attachments -------------------------------------------------------

    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&Bytes> {
        self.attachments.get(name)
    }

    /// Adds or replaces a named attachment.
    pub fn add_attachment(&mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Option<Bytes> {
        self.attachments.insert(name.into(), data.into())
    }

    pub fn remove_attachment(&mut self, name: &str) -> Option<Bytes> {
        self.attachments.remove(name)
    }

    /// Attachment names in sorted order.
    pub fn attachment_names(&self) -> impl Iterator<Item = &str> {
        self.attachments.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_sensitive_by_default() {
        let mut msg = Message::new();
        msg.set_header("Content-Type", "text/plain");
        assert!(msg.header("content-type").is_none());
        assert_eq!(
            msg.header_ignore_case("content-type").and_then(Value::as_str),
            Some("text/plain")
        );
    }

    #[test]
    fn exact_match_wins_over_folded_match() {
        let mut msg = Message::new();
        msg.set_header("KEY", "upper");
        msg.set_header("key", "lower");
        assert_eq!(msg.header_ignore_case("key").and_then(Value::as_str), Some("lower"));
    }

    #[test]
    fn clone_copies_headers_and_shares_body() {
        let mut msg = Message::with_body("payload");
        msg.set_header("a", 1_i64);
        let mut copy = msg.clone();
        copy.set_header("a", 2_i64);

        assert_eq!(msg.header("a").and_then(|v| v.downcast_ref::<i64>()), Some(&1));
        assert!(msg.body().unwrap().ptr_eq(copy.body().unwrap()));
    }

    #[test]
    fn attachments_round_trip() {
        let mut msg = Message::new();
        msg.add_attachment("logo.png", Bytes::from_static(b"\x89PNG"));
        assert_eq!(msg.attachment_names().collect::<Vec<_>>(), vec!["logo.png"]);
        assert_eq!(msg.remove_attachment("logo.png").unwrap().len(), 4);
        assert!(msg.attachment("logo.png").is_none());
    }
}
