//! # Task Signatures
//!
//! A signature describes one task invocation and is the body of every
//! broker message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Arbitrary message headers carried alongside the body
pub type Headers = HashMap<String, serde_json::Value>;

/// One positional task argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub arg_type: String,
    pub value: serde_json::Value,
}

impl Arg {
    pub fn new(arg_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: None,
            arg_type: arg_type.into(),
            value,
        }
    }

    pub fn named(name: impl Into<String>, arg_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            arg_type: arg_type.into(),
            value,
        }
    }
}

/// Serializable description of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_uuid: Option<String>,
    #[serde(default)]
    pub group_task_count: usize,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub headers: Headers,
}

impl Signature {
    /// Create a signature for `name` with a fresh `task_<uuid>` identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: format!("task_{}", Uuid::new_v4()),
            name: name.into(),
            routing_key: String::new(),
            eta: None,
            group_uuid: None,
            group_task_count: 0,
            args: Vec::new(),
            headers: Headers::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn with_arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_args(mut self, args: Vec<Arg>) -> Self {
        self.args = args;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Do not deliver before `eta`
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_group(mut self, group_uuid: impl Into<String>, group_task_count: usize) -> Self {
        self.group_uuid = Some(group_uuid.into());
        self.group_task_count = group_task_count;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Milliseconds until the ETA, rounded up, when it lies strictly after `now`
    pub fn delay_ms_from(&self, now: DateTime<Utc>) -> Option<i64> {
        let eta = self.eta?;
        if eta <= now {
            return None;
        }
        let remaining = eta - now;
        let millis = match remaining.num_nanoseconds() {
            Some(nanos) => nanos / 1_000_000 + i64::from(nanos % 1_000_000 != 0),
            None => remaining.num_milliseconds(),
        };
        Some(millis.max(1))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_new_signature_has_task_prefixed_uuid() {
        let sig = Signature::new("add");
        assert!(sig.uuid.starts_with("task_"));
        assert_eq!(sig.name, "add");
        assert!(sig.routing_key.is_empty());
        assert_ne!(sig.uuid, Signature::new("add").uuid);
    }

    #[test]
    fn test_wire_round_trip_keeps_every_field() {
        let eta = Utc::now() + Duration::seconds(30);
        let sig = Signature::new("add")
            .with_arg(Arg::new("int64", json!(1)))
            .with_arg(Arg::named("b", "int64", json!(2)))
            .with_group("group_1", 2)
            .with_routing_key("math")
            .with_eta(eta)
            .with_header("trace_id", json!("abc"));

        let decoded = Signature::from_bytes(&sig.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, sig);
    }

    #[test]
    fn test_minimal_body_decodes_with_defaults() {
        let decoded = Signature::from_bytes(br#"{"uuid":"task_1","name":"noop"}"#).unwrap();
        assert_eq!(decoded.uuid, "task_1");
        assert!(decoded.args.is_empty());
        assert!(decoded.headers.is_empty());
        assert_eq!(decoded.eta, None);
    }

    #[test]
    fn test_delay_only_for_future_eta() {
        let now = Utc::now();
        let base = Signature::new("add");
        assert_eq!(base.delay_ms_from(now), None);

        let past = base.clone().with_eta(now - Duration::seconds(1));
        assert_eq!(past.delay_ms_from(now), None);

        let same = base.clone().with_eta(now);
        assert_eq!(same.delay_ms_from(now), None);

        let future = base.clone().with_eta(now + Duration::milliseconds(1500));
        assert_eq!(future.delay_ms_from(now), Some(1500));
    }

    #[test]
    fn test_sub_millisecond_eta_rounds_up() {
        let now = Utc::now();
        let sig = Signature::new("add").with_eta(now + Duration::microseconds(10));
        assert_eq!(sig.delay_ms_from(now), Some(1));
    }

    #[test]
    fn test_sub_microsecond_eta_still_delays() {
        let now = Utc::now();
        let sig = Signature::new("add").with_eta(now + Duration::nanoseconds(500));
        assert_eq!(sig.delay_ms_from(now), Some(1));

        let sig = Signature::new("add").with_eta(now + Duration::nanoseconds(1_000_001));
        assert_eq!(sig.delay_ms_from(now), Some(2));
    }
}
