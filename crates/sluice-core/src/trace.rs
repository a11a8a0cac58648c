use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One loosely-typed record from the engine's event-observation stream.
///
/// `parent_ids` lists the ancestry from the root down to the immediate
/// parent; an empty list marks the root of the whole execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTrace {
    pub event: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub data: Value,
}

impl RawTrace {
    pub fn new(event: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_ids = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn kind(&self) -> TraceKind {
        TraceKind::from_event(&self.event)
    }
}

/// Event kinds the translator understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceKind {
    ModelStart,
    ModelStream,
    ModelEnd,
    ToolStart,
    ToolEnd,
    ToolError,
    ChainStart,
    ChainStream,
    ChainEnd,
    /// An exception raised by the engine, reported in-band.
    Error,
    Other,
}

impl TraceKind {
    pub fn from_event(event: &str) -> Self {
        match event {
            "on_chat_model_start" | "on_llm_start" => Self::ModelStart,
            "on_chat_model_stream" | "on_llm_stream" => Self::ModelStream,
            "on_chat_model_end" | "on_llm_end" => Self::ModelEnd,
            "on_tool_start" => Self::ToolStart,
            "on_tool_end" => Self::ToolEnd,
            "on_tool_error" => Self::ToolError,
            "on_chain_start" => Self::ChainStart,
            "on_chain_stream" => Self::ChainStream,
            "on_chain_end" => Self::ChainEnd,
            "on_error" => Self::Error,
            _ => Self::Other,
        }
    }
}
