//! Response envelope shared by every tool: `{content: [{type: "text", text}]}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub content: Vec<TextContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ToolResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![TextContent {
                kind: "text".into(),
                text: text.into(),
            }],
            is_error: false,
            kind: None,
        }
    }

    /// Encode a handler payload. Strings go in verbatim, everything else is
    /// pretty-printed JSON.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::String(s) => Self::text(s.clone()),
            other => Self::text(serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string())),
        }
    }

    /// Error result for handler failures that are not protocol errors.
    pub fn error(err: &SandboxError) -> Self {
        let mut response = Self::text(err.to_string());
        response.is_error = true;
        response.kind = Some(err.kind().as_str().to_string());
        response
    }

    pub fn first_text(&self) -> &str {
        self.content.first().map(|c| c.text.as_str()).unwrap_or_default()
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Decode the JSON payload of a success envelope.
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(self.first_text())
    }
}

impl From<&SandboxError> for ToolResponse {
    fn from(err: &SandboxError) -> Self {
        Self::error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_payload_is_verbatim() {
        let resp = ToolResponse::from_payload(&json!("/workspace"));
        assert_eq!(resp.first_text(), "/workspace");
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire, json!({ "content": [{ "type": "text", "text": "/workspace" }] }));
    }

    #[test]
    fn test_object_payload_is_pretty_json() {
        let resp = ToolResponse::from_payload(&json!({ "path": "/tmp/x", "message": "ok" }));
        assert!(resp.first_text().contains('\n'));
        assert_eq!(resp.json().unwrap()["path"], "/tmp/x");
    }

    #[test]
    fn test_error_envelope_carries_kind() {
        let err = SandboxError::NotFound("process with name web not found".into());
        let resp = ToolResponse::error(&err);
        assert!(resp.is_error);
        assert_eq!(resp.error_kind(), Some("NotFound"));
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire["isError"], true);
        assert_eq!(wire["kind"], "NotFound");
    }
}
