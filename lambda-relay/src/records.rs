//! Records exchanged through the relay table and the status state machine of an invocation.
use crate::config::Channel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Sort key value of the heartbeat record.
pub const LIVENESS_SORT_KEY: &str = "0";

/// Lifecycle of a relayed invocation. Only moves forward: pending -> in-progress -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvokeStatus {
    /// Written by the gateway, waiting for the dispatcher
    Pending,
    /// Claimed by the dispatcher, the local handler is running
    InProgress,
    /// The local handler returned a response
    Completed,
    /// The local handler returned an error or could not be run
    Failed,
}

impl InvokeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvokeStatus::Pending => "pending",
            InvokeStatus::InProgress => "in-progress",
            InvokeStatus::Completed => "completed",
            InvokeStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvokeStatus::Completed | InvokeStatus::Failed)
    }

    /// True if a record in this status may be overwritten with `next`.
    /// Terminal records are never changed, they are only deleted.
    pub fn can_advance_to(&self, next: InvokeStatus) -> bool {
        matches!(
            (self, next),
            (InvokeStatus::Pending, InvokeStatus::InProgress)
                | (InvokeStatus::InProgress, InvokeStatus::Completed)
                | (InvokeStatus::InProgress, InvokeStatus::Failed)
        )
    }
}

impl fmt::Display for InvokeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvokeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvokeStatus::Pending),
            "in-progress" => Ok(InvokeStatus::InProgress),
            "completed" => Ok(InvokeStatus::Completed),
            "failed" => Ok(InvokeStatus::Failed),
            _ => Err(format!("Unknown invocation status: {s}")),
        }
    }
}

/// Primary key of an invocation record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub channel: String,
    pub invoke_id: String,
}

impl RecordKey {
    pub fn new(channel: &Channel, invoke_id: impl Into<String>) -> Self {
        Self {
            channel: channel.as_str().to_owned(),
            invoke_id: invoke_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.invoke_id)
    }
}

/// What the gateway asks the dispatcher to run. Stored as JSON in the record payload:
/// `{"targetFunction": "my-lambda", "event": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub target_function: String,
    pub event: Value,
}

impl InvocationRequest {
    pub fn new(target_function: impl Into<String>, event: Value) -> Self {
        Self {
            target_function: target_function.into(),
            event,
        }
    }

    /// True for events from callers that wait for the response: API Gateway REST APIs
    /// (`path` + `httpMethod`), HTTP APIs and function URLs (`requestContext.http.method`).
    /// Queue, stream and notification triggers do not read the response.
    pub fn expects_response(&self) -> bool {
        let rest_api = self.event.get("path").is_some() && self.event.get("httpMethod").is_some();
        let http_api = self
            .event
            .pointer("/requestContext/http/method")
            .is_some_and(|v| v.is_string());
        rest_api || http_api
    }
}

/// One relayed call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRecord {
    pub channel: String,
    /// Unique within the channel, never reused
    pub invoke_id: String,
    /// Serialized [InvocationRequest]
    pub payload: String,
    pub status: InvokeStatus,
    /// Serialized response or `{"error": "..."}`, only present once the status is terminal
    pub result: Option<String>,
    /// Absolute expiry in epoch seconds
    pub ttl: i64,
}

impl InvocationRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            channel: self.channel.clone(),
            invoke_id: self.invoke_id.clone(),
        }
    }

    /// A copy of this record in the next status. Returns None if the transition would go backwards
    /// or change a terminal record.
    pub fn advance(&self, status: InvokeStatus, result: Option<String>) -> Option<Self> {
        if !self.status.can_advance_to(status) {
            return None;
        }
        Some(Self {
            status,
            result,
            ..self.clone()
        })
    }

    pub fn request(&self) -> Result<InvocationRequest, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// The result parsed as JSON. A non-JSON result is returned as a JSON string and a missing one as null.
    pub fn result_value(&self) -> Value {
        match &self.result {
            Some(result) => serde_json::from_str(result).unwrap_or_else(|_| Value::String(result.clone())),
            None => Value::Null,
        }
    }
}

/// The dispatcher heartbeat. One per channel, keyed as `{channel}_TTL` / `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    /// Partition key of the record, i.e. [Channel::liveness_key]
    pub channel: String,
    /// Epoch seconds of the last refresh
    pub ttl: i64,
}

/// Builds the `{"error": message}` payload stored with failed invocations.
pub fn error_payload(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(status: InvokeStatus) -> InvocationRecord {
        InvocationRecord {
            channel: "svc1".to_owned(),
            invoke_id: "0001700000000000-abc".to_owned(),
            payload: r#"{"targetFunction":"F","event":{"a":1}}"#.to_owned(),
            status,
            result: None,
            ttl: 1_700_003_600,
        }
    }

    #[test]
    fn status_only_moves_forward() {
        use InvokeStatus::*;
        assert!(Pending.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Completed));
        assert!(InProgress.can_advance_to(Failed));

        assert!(!Pending.can_advance_to(Completed));
        assert!(!InProgress.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Completed));
        assert!(!Completed.can_advance_to(Completed));
    }

    #[test]
    fn terminal_records_cannot_be_advanced() {
        let done = record(InvokeStatus::InProgress)
            .advance(InvokeStatus::Completed, Some("{}".to_owned()))
            .unwrap();
        assert!(done.advance(InvokeStatus::Failed, None).is_none());
        assert!(done.advance(InvokeStatus::Pending, None).is_none());
    }

    #[test]
    fn status_strings_match_the_table_format() {
        assert_eq!(InvokeStatus::InProgress.to_string(), "in-progress");
        assert_eq!("failed".parse::<InvokeStatus>().unwrap(), InvokeStatus::Failed);
        assert!("done".parse::<InvokeStatus>().is_err());
        assert_eq!(serde_json::to_value(InvokeStatus::InProgress).unwrap(), json!("in-progress"));
    }

    #[test]
    fn request_uses_camel_case_payload() {
        let request = InvocationRequest::new("F", json!({"a": 1, "b": 2}));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"targetFunction": "F", "event": {"a": 1, "b": 2}})
        );
        assert_eq!(record(InvokeStatus::Pending).request().unwrap().target_function, "F");
    }

    #[test]
    fn api_events_expect_a_response() {
        let rest = InvocationRequest::new("F", json!({"path": "/orders", "httpMethod": "GET"}));
        let http = InvocationRequest::new("F", json!({"requestContext": {"http": {"method": "POST"}}}));
        let sqs = InvocationRequest::new("F", json!({"Records": [{"eventSource": "aws:sqs"}]}));

        assert!(rest.expects_response());
        assert!(http.expects_response());
        assert!(!sqs.expects_response());
    }

    #[test]
    fn result_value_falls_back_to_string() {
        let mut r = record(InvokeStatus::Completed);
        assert_eq!(r.result_value(), Value::Null);
        r.result = Some(r#"{"sum":3}"#.to_owned());
        assert_eq!(r.result_value(), json!({"sum": 3}));
        r.result = Some("not json".to_owned());
        assert_eq!(r.result_value(), json!("not json"));
    }

    #[test]
    fn error_payload_is_json() {
        assert_eq!(
            serde_json::from_str::<Value>(&error_payload("boom")).unwrap(),
            json!({"error": "boom"})
        );
    }
}
