//! One line of a replica's JSONL log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GroupError, GroupResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    pub level: String,
    /// Replica name the file belongs to
    pub instance: String,
    /// Module path, e.g. `groupsync_core::metadata::index`
    pub target: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, outermost first, joined with `" > "`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogRecord {
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            instance: instance.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    pub fn to_json_line(&self) -> GroupResult<String> {
        serde_json::to_string(self).map_err(|e| GroupError::Serialization(e.to_string()))
    }

    pub fn from_json_line(line: &str) -> GroupResult<Self> {
        serde_json::from_str(line).map_err(|e| GroupError::Deserialization(e.to_string()))
    }
}
