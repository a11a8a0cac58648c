use serde_json::Value;

use sluice_core::{RawTrace, TraceKind};

/// Where a record sits in the execution tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    pub run_id: String,
    pub parent_ids: Vec<String>,
    /// Direct label from the record's metadata, if any.
    pub label: Option<String>,
}

impl Context {
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }
}

/// A raw trace validated into the shapes the translator acts on.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceRecord {
    ModelStart { ctx: Context, name: String },
    ModelDelta { ctx: Context, content: String },
    ToolStart { ctx: Context, name: String, input: String },
    ToolEnd { ctx: Context, name: String, output: String },
    ToolError { ctx: Context, name: String, message: String },
    ChainStart { ctx: Context, name: String },
    ChainEnd { ctx: Context, name: String, output: Value },
    Raised { ctx: Context, message: String },
    /// Recognised but carries nothing observers need, or unknown kind.
    Ignored { ctx: Context },
}

const UNKNOWN: &str = "unknown";

pub fn decode(raw: &RawTrace, label_key: &str) -> TraceRecord {
    let ctx = Context {
        run_id: raw.run_id.clone(),
        parent_ids: raw.parent_ids.clone(),
        label: raw
            .metadata
            .get(label_key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string),
    };
    let name = raw
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string();

    match raw.kind() {
        TraceKind::ModelStart => TraceRecord::ModelStart { ctx, name },
        TraceKind::ModelStream => match delta_content(&raw.data) {
            Some(content) => TraceRecord::ModelDelta { ctx, content },
            None => TraceRecord::Ignored { ctx },
        },
        TraceKind::ToolStart => TraceRecord::ToolStart {
            ctx,
            name,
            input: text_of(raw.data.get("input")),
        },
        TraceKind::ToolEnd => TraceRecord::ToolEnd {
            ctx,
            name,
            output: text_of(raw.data.get("output")),
        },
        TraceKind::ToolError => TraceRecord::ToolError {
            ctx,
            name,
            message: error_message(&raw.data),
        },
        TraceKind::ChainStart => TraceRecord::ChainStart { ctx, name },
        TraceKind::ChainEnd => TraceRecord::ChainEnd {
            ctx,
            name,
            output: raw.data.get("output").cloned().unwrap_or(Value::Null),
        },
        TraceKind::Error => TraceRecord::Raised {
            ctx,
            message: error_message(&raw.data),
        },
        TraceKind::ModelEnd | TraceKind::ChainStream | TraceKind::Other => {
            TraceRecord::Ignored { ctx }
        }
    }
}

/// Content of a streamed model chunk. Accepts a bare string, an object with
/// a `content` string, or a list of `{"text": ...}` parts (either directly or
/// under `content`).
fn delta_content(data: &Value) -> Option<String> {
    let chunk = data.get("chunk")?;
    let content = match chunk {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => join_parts(parts),
            _ => return None,
        },
        Value::Array(parts) => join_parts(parts),
        _ => return None,
    };
    (!content.is_empty()).then_some(content)
}

fn join_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Value::String(s) => Some(s.as_str()),
            other => other.get("text").and_then(Value::as_str),
        })
        .collect()
}

/// Render a tool input/output as text: strings verbatim, objects with a
/// string `content` by that content, anything else as compact JSON.
pub fn text_of(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => match v.get("content").and_then(Value::as_str) {
            Some(content) => content.to_string(),
            None => v.to_string(),
        },
    }
}

fn error_message(data: &Value) -> String {
    let err = data.get("error").unwrap_or(data);
    match err {
        Value::String(s) => s.clone(),
        Value::Null => "engine raised an error".to_string(),
        v => v
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| v.to_string()),
    }
}
