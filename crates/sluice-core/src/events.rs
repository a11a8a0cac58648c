use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A source reference pulled out of a search-like tool's output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub url: String,
}

impl SourceRef {
    pub fn url(url: impl Into<String>) -> Self {
        Self { title: None, url: url.into() }
    }

    pub fn titled(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self { title: Some(title.into()), url: url.into() }
    }
}

/// Events delivered to observers of a job. This is the closed set every
/// subscriber sees; raw engine records never get past the translator.
///
/// `task` names the labeled sub-computation that produced the event so a
/// client can route interleaved output from concurrent sub-tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "llm_start")]
    LlmStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        name: String,
    },

    #[serde(rename = "token")]
    Token {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        content: String,
    },

    #[serde(rename = "tool_start")]
    ToolStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        name: String,
        input: String,
    },

    #[serde(rename = "tool_end")]
    ToolEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        name: String,
        output: String,
        output_length: usize,
        #[serde(default)]
        sources: Vec<SourceRef>,
    },

    #[serde(rename = "node_start")]
    NodeStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        node: String,
    },

    #[serde(rename = "node_end")]
    NodeEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        node: String,
    },

    #[serde(rename = "result")]
    Result { data: Value },

    #[serde(rename = "error")]
    Error { message: String },

    /// Always the last record of a job's log.
    #[serde(rename = "done")]
    Done,
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LlmStart { .. } => "llm_start",
            Self::Token { .. } => "token",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::NodeStart { .. } => "node_start",
            Self::NodeEnd { .. } => "node_end",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    pub fn task(&self) -> Option<&str> {
        match self {
            Self::LlmStart { task, .. }
            | Self::Token { task, .. }
            | Self::ToolStart { task, .. }
            | Self::ToolEnd { task, .. }
            | Self::NodeStart { task, .. }
            | Self::NodeEnd { task, .. } => task.as_deref(),
            Self::Result { .. } | Self::Error { .. } | Self::Done => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Serialize to the wire object `{"type": ..., ...fields}`.
    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of strings/numbers/values.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"unserializable event"}"#.into())
    }
}
