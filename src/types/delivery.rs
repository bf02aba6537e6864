//! Delivery metadata and message headers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A header value carried alongside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Text(text) => text.parse().ok(),
            HeaderValue::List(_) => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(value: Vec<String>) -> Self {
        HeaderValue::List(value)
    }
}

/// Message headers keyed by name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Metadata of one delivery handed to a [`MessageHandler`](crate::MessageHandler).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryInfo {
    /// Tag of the registration that received the message
    pub consumer_tag: String,

    /// Broker-assigned delivery tag, unique per channel
    pub delivery_tag: u64,

    pub exchange: String,

    pub routing_key: String,

    /// Set when the broker has delivered this message before
    pub redelivered: bool,

    pub headers: Headers,

    pub received_at: DateTime<Utc>,
}

impl DeliveryInfo {
    /// Number of times the bridge has already recycled this message.
    pub fn redelivered_count(&self, header: &str) -> u32 {
        self.headers
            .get(header)
            .and_then(HeaderValue::as_int)
            .map(|count| count.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or(0)
    }
}

/// Point-in-time queue metadata reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: String,

    /// Messages ready for delivery (unacknowledged ones excluded)
    pub message_count: u32,

    /// Active subscriptions on the queue
    pub consumer_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(headers: Headers) -> DeliveryInfo {
        DeliveryInfo {
            consumer_tag: "ctag".into(),
            delivery_tag: 1,
            exchange: "ex".into(),
            routing_key: "rk".into(),
            redelivered: false,
            headers,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_redelivered_count_defaults_to_zero() {
        let info = info_with(Headers::new());
        assert_eq!(info.redelivered_count("x-redelivered-count"), 0);
    }

    #[test]
    fn test_redelivered_count_accepts_text_and_int() {
        let mut headers = Headers::new();
        headers.insert("x-redelivered-count".into(), HeaderValue::Int(3));
        headers.insert("legacy".into(), HeaderValue::from("4"));
        headers.insert("negative".into(), HeaderValue::Int(-2));
        let info = info_with(headers);
        assert_eq!(info.redelivered_count("x-redelivered-count"), 3);
        assert_eq!(info.redelivered_count("legacy"), 4);
        assert_eq!(info.redelivered_count("negative"), 0);
    }

    #[test]
    fn test_header_value_serializes_untagged() {
        let value = HeaderValue::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"["a","b"]"#);
        assert_eq!(serde_json::to_string(&HeaderValue::Int(5)).unwrap(), "5");
    }
}
