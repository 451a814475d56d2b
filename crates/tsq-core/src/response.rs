//! Inbound replies and notifications.

use std::str::FromStr;

use indexmap::IndexMap;
use serde::Serialize;

/// One list entry of a reply: an ordered key→value map.
///
/// Bare flag tokens appear as keys with an empty value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record(IndexMap<String, String>);

impl Record {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.0.insert(key.into(), value.into());
    }

    /// Raw value of a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Field parsed into `T`; `None` if absent or unparseable.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Whether the field is present (flags included).
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A complete reply: data records plus the terminating status line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Response {
    /// Data rows in the order they arrived.
    pub records: Vec<Record>,
    /// Status code; `0` means success.
    pub code: u32,
    /// Status message.
    pub message: String,
    /// Optional extra status message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_message: Option<String>,
}

impl Response {
    /// A successful reply with no records.
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            code: 0,
            message: "ok".to_string(),
            extra_message: None,
        }
    }

    /// Whether the status code is `0`.
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// First record, for single-entry replies like `whoami`.
    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }
}

/// Unsolicited event pushed by the server, e.g. `notifycliententerview`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Notification name (the leading bare token of the line).
    pub name: String,
    /// One record per `|`-separated segment of the line.
    pub records: Vec<Record>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_preserves_order() {
        let record: Record = [("cid", "1"), ("pid", "0"), ("channel_name", "Lobby")]
            .into_iter()
            .collect();
        let keys: Vec<_> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["cid", "pid", "channel_name"]);
    }

    #[test]
    fn record_get_parsed() {
        let mut record = Record::new();
        record.insert("clid", "42");
        record.insert("client_nickname", "bob");
        assert_eq!(record.get_parsed::<u32>("clid"), Some(42));
        assert_eq!(record.get_parsed::<u32>("client_nickname"), None);
        assert_eq!(record.get_parsed::<u32>("missing"), None);
    }

    #[test]
    fn record_flags_have_empty_value() {
        let mut record = Record::new();
        record.insert("-uid", "");
        assert!(record.contains("-uid"));
        assert_eq!(record.get("-uid"), Some(""));
    }

    #[test]
    fn empty_response_is_success() {
        let resp = Response::empty();
        assert!(resp.is_success());
        assert!(resp.records.is_empty());
        assert!(resp.first().is_none());
    }

    #[test]
    fn response_serializes_records_as_maps() {
        let resp = Response {
            records: vec![[("cid", "1")].into_iter().collect()],
            code: 0,
            message: "ok".into(),
            extra_message: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["records"][0]["cid"], "1");
        assert!(json.get("extra_message").is_none());
    }
}
