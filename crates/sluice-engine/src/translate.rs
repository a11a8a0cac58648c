use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use sluice_core::recorder::is_search_tool;
use sluice_core::{RawTrace, StreamEvent};

use crate::ancestry::Ancestry;
use crate::decode::{decode, Context, TraceRecord};
use crate::sources::extract_sources;
use crate::truncate::preview;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Metadata key whose string value marks a labeled sub-task.
    pub label_key: String,
    /// Max characters of tool input/output carried in events.
    pub preview_chars: usize,
    /// Max source references per `tool_end`.
    pub max_sources: usize,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            label_key: "task".into(),
            preview_chars: 200,
            max_sources: 8,
        }
    }
}

/// What one raw record turned into.
#[derive(Clone, Debug, PartialEq)]
pub enum Translated {
    /// Deliver to observers.
    Event(StreamEvent),
    /// Output of the root completion; handed to result extraction.
    Completion(Value),
    /// The engine raised. Nothing after this should be translated.
    Failure(String),
    Skip,
}

/// Stateful translator for one execution's trace stream.
pub struct Translator {
    config: TranslatorConfig,
    ancestry: Ancestry,
    failed: bool,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self {
            config,
            ancestry: Ancestry::new(),
            failed: false,
        }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn translate(&mut self, raw: &RawTrace) -> Translated {
        if self.failed {
            return Translated::Skip;
        }

        let record = decode(raw, &self.config.label_key);
        let ctx = context_of(&record);
        self.ancestry
            .observe(&ctx.run_id, &ctx.parent_ids, ctx.label.as_deref());

        match record {
            TraceRecord::ModelStart { ctx, name } => Translated::Event(StreamEvent::LlmStart {
                task: self.task_of(&ctx),
                name,
            }),
            TraceRecord::ModelDelta { ctx, content } => Translated::Event(StreamEvent::Token {
                task: self.task_of(&ctx),
                content,
            }),
            TraceRecord::ToolStart { ctx, name, input } => {
                Translated::Event(StreamEvent::ToolStart {
                    task: self.task_of(&ctx),
                    input: preview(&input, self.config.preview_chars),
                    name,
                })
            }
            TraceRecord::ToolEnd { ctx, name, output } => {
                let sources = if is_search_tool(&name) {
                    extract_sources(&output, self.config.max_sources)
                } else {
                    Vec::new()
                };
                Translated::Event(StreamEvent::ToolEnd {
                    task: self.task_of(&ctx),
                    output: preview(&output, self.config.preview_chars),
                    output_length: output.chars().count(),
                    name,
                    sources,
                })
            }
            TraceRecord::ToolError { ctx, name, message } if ctx.is_root() => {
                self.failed = true;
                Translated::Failure(format!("{name}: {message}"))
            }
            TraceRecord::ToolError { name, .. } => {
                // A nested tool error is the tool's business; the engine
                // reports it again at the root if it aborts the run.
                debug!(tool = %name, "nested tool error");
                Translated::Skip
            }
            TraceRecord::ChainStart { ctx, name } => match ctx.label.clone() {
                Some(label) => Translated::Event(StreamEvent::NodeStart {
                    task: Some(label),
                    node: name,
                }),
                None => Translated::Skip,
            },
            TraceRecord::ChainEnd { ctx, output, .. } if ctx.is_root() => {
                Translated::Completion(output)
            }
            TraceRecord::ChainEnd { ctx, name, .. } => match ctx.label.clone() {
                Some(label) => Translated::Event(StreamEvent::NodeEnd {
                    task: Some(label),
                    node: name,
                }),
                None => Translated::Skip,
            },
            TraceRecord::Raised { message, .. } => {
                self.failed = true;
                Translated::Failure(message)
            }
            TraceRecord::Ignored { .. } => Translated::Skip,
        }
    }

    fn task_of(&mut self, ctx: &Context) -> Option<String> {
        if let Some(label) = &ctx.label {
            return Some(label.clone());
        }
        if ctx.run_id.is_empty() {
            return match ctx.parent_ids.last() {
                Some(parent) => self.ancestry.resolve(parent),
                None => self.ancestry.last_labeled().map(str::to_string),
            };
        }
        self.ancestry.resolve(&ctx.run_id)
    }
}

fn context_of(record: &TraceRecord) -> &Context {
    match record {
        TraceRecord::ModelStart { ctx, .. }
        | TraceRecord::ModelDelta { ctx, .. }
        | TraceRecord::ToolStart { ctx, .. }
        | TraceRecord::ToolEnd { ctx, .. }
        | TraceRecord::ToolError { ctx, .. }
        | TraceRecord::ChainStart { ctx, .. }
        | TraceRecord::ChainEnd { ctx, .. }
        | TraceRecord::Raised { ctx, .. }
        | TraceRecord::Ignored { ctx } => ctx,
    }
}
