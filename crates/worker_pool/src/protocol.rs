//! Messages exchanged between the controller and its workers.
//!
//! Logical wire shapes (camelCase JSON):
//!
//! ```text
//! {service, type: "request",  messageId, request}
//! {service, type: "response", messageId, response?, errorMessage?, errorStack?}
//! {service, type: "initialized"}
//! {type: "worker-channel", level, message: [..]}
//! ```
//!
//! Any other object carrying a `service` field is an event for that service.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Buffers moved alongside a message instead of being serialized into it.
pub type Transferables = Vec<Bytes>;

pub const REQUEST_TYPE: &str = "request";
pub const RESPONSE_TYPE: &str = "response";
pub const INITIALIZED_TYPE: &str = "initialized";
pub const WORKER_CHANNEL_TYPE: &str = "worker-channel";

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Request {
        service: String,
        message_id: u64,
        request: Value,
    },
    Response {
        service: String,
        message_id: u64,
        response: Option<Value>,
        error_message: Option<String>,
        error_stack: Option<String>,
    },
    Initialized {
        service: String,
    },
    /// Log line forwarded from a worker to the controller's logging sink.
    Log { level: u8, message: Vec<Value> },
    /// Unidirectional message for the event listener of `service`.
    Event { service: String, payload: Value },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum Tagged {
    #[serde(rename = "request", rename_all = "camelCase")]
    Request {
        service: String,
        message_id: u64,
        request: Value,
    },
    #[serde(rename = "response", rename_all = "camelCase")]
    Response {
        service: String,
        message_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_stack: Option<String>,
    },
    #[serde(rename = "initialized")]
    Initialized { service: String },
    #[serde(rename = "worker-channel")]
    Log {
        level: u8,
        #[serde(default)]
        message: Vec<Value>,
    },
}

impl WorkerMessage {
    pub fn service(&self) -> Option<&str> {
        match self {
            WorkerMessage::Request { service, .. }
            | WorkerMessage::Response { service, .. }
            | WorkerMessage::Initialized { service }
            | WorkerMessage::Event { service, .. } => Some(service),
            WorkerMessage::Log { .. } => None,
        }
    }

    /// Successful response to `message_id`.
    pub fn reply(service: impl Into<String>, message_id: u64, response: Value) -> Self {
        WorkerMessage::Response {
            service: service.into(),
            message_id,
            response: Some(response),
            error_message: None,
            error_stack: None,
        }
    }

    /// Failed response to `message_id`.
    pub fn reply_error(
        service: impl Into<String>,
        message_id: u64,
        error_message: impl Into<String>,
        error_stack: Option<String>,
    ) -> Self {
        WorkerMessage::Response {
            service: service.into(),
            message_id,
            response: None,
            error_message: Some(error_message.into()),
            error_stack,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let tagged = match self.clone() {
            WorkerMessage::Event { service, payload } => {
                let mut payload = payload;
                if let Value::Object(map) = &mut payload {
                    map.insert("service".to_string(), Value::String(service));
                }
                return Ok(payload);
            }
            WorkerMessage::Request {
                service,
                message_id,
                request,
            } => Tagged::Request {
                service,
                message_id,
                request,
            },
            WorkerMessage::Response {
                service,
                message_id,
                response,
                error_message,
                error_stack,
            } => Tagged::Response {
                service,
                message_id,
                response,
                error_message,
                error_stack,
            },
            WorkerMessage::Initialized { service } => Tagged::Initialized { service },
            WorkerMessage::Log { level, message } => Tagged::Log { level, message },
        };
        serde_json::to_value(tagged)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let known = matches!(
            value.get("type").and_then(Value::as_str),
            Some(REQUEST_TYPE | RESPONSE_TYPE | INITIALIZED_TYPE | WORKER_CHANNEL_TYPE)
        );
        if !known {
            let service = value
                .get("service")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(WorkerMessage::Event {
                service,
                payload: value,
            });
        }

        Ok(match serde_json::from_value::<Tagged>(value)? {
            Tagged::Request {
                service,
                message_id,
                request,
            } => WorkerMessage::Request {
                service,
                message_id,
                request,
            },
            Tagged::Response {
                service,
                message_id,
                response,
                error_message,
                error_stack,
            } => WorkerMessage::Response {
                service,
                message_id,
                response,
                error_message,
                error_stack,
            },
            Tagged::Initialized { service } => WorkerMessage::Initialized { service },
            Tagged::Log { level, message } => WorkerMessage::Log { level, message },
        })
    }
}

/// A message plus the buffers transferred with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: WorkerMessage,
    pub transfer: Transferables,
}

impl Envelope {
    pub fn new(message: WorkerMessage) -> Self {
        Self {
            message,
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(message: WorkerMessage, transfer: Transferables) -> Self {
        Self { message, transfer }
    }

    /// Single-line JSON form used by out-of-process workers.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::json!({ "message": self.message.to_value()? });
        if !self.transfer.is_empty() {
            let buffers: Vec<&[u8]> = self.transfer.iter().map(|buf| buf.as_ref()).collect();
            line["transfer"] = serde_json::to_value(buffers)?;
        }
        serde_json::to_string(&line)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Line {
            message: Value,
            #[serde(default)]
            transfer: Vec<Vec<u8>>,
        }

        let line: Line = serde_json::from_str(line)?;
        Ok(Self {
            message: WorkerMessage::from_value(line.message)?,
            transfer: line.transfer.into_iter().map(Bytes::from).collect(),
        })
    }
}

/// Re-emit a forwarded worker log line through `tracing`.
pub(crate) fn emit_worker_log(worker: usize, level: u8, message: &[Value]) {
    let text = message
        .iter()
        .map(|part| match part {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");

    match level {
        0 => tracing::trace!(target: "worker", worker, "{}", text),
        1 => tracing::debug!(target: "worker", worker, "{}", text),
        2 | 3 => tracing::info!(target: "worker", worker, "{}", text),
        4 => tracing::warn!(target: "worker", worker, "{}", text),
        _ => tracing::error!(target: "worker", worker, "{}", text),
    }
}
