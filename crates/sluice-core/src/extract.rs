use serde_json::Value;

use crate::errors::ExtractionError;

/// Shapes the root completion's output into the structured `result` payload.
///
/// `Ok(None)` means the completion carried nothing worth reporting; no
/// `result` event is emitted in that case.
pub trait ResultExtractor: Send + Sync {
    fn extract(&self, output: &Value) -> Result<Option<Value>, ExtractionError>;
}

impl<F> ResultExtractor for F
where
    F: Fn(&Value) -> Result<Option<Value>, ExtractionError> + Send + Sync,
{
    fn extract(&self, output: &Value) -> Result<Option<Value>, ExtractionError> {
        self(output)
    }
}

/// Reports the completion output unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl ResultExtractor for PassThrough {
    fn extract(&self, output: &Value) -> Result<Option<Value>, ExtractionError> {
        if output.is_null() {
            return Ok(None);
        }
        Ok(Some(output.clone()))
    }
}

/// Pulls one field out of the completion object. String fields are parsed as
/// JSON documents (engines commonly emit a serialized report); other values
/// are reported as-is.
#[derive(Clone, Debug)]
pub struct JsonFieldExtractor {
    field: String,
    required: bool,
}

impl JsonFieldExtractor {
    /// A missing or empty field yields no result.
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into(), required: false }
    }

    /// A missing or empty field is an extraction error.
    pub fn required(field: impl Into<String>) -> Self {
        Self { field: field.into(), required: true }
    }

    fn missing(&self) -> Result<Option<Value>, ExtractionError> {
        if self.required {
            Err(ExtractionError::MissingField(self.field.clone()))
        } else {
            Ok(None)
        }
    }
}

impl ResultExtractor for JsonFieldExtractor {
    fn extract(&self, output: &Value) -> Result<Option<Value>, ExtractionError> {
        let Some(obj) = output.as_object() else {
            return Err(ExtractionError::Other(format!(
                "completion output is not an object (looking for '{}')",
                self.field
            )));
        };

        match obj.get(&self.field) {
            None | Some(Value::Null) => self.missing(),
            Some(Value::String(s)) if s.trim().is_empty() => self.missing(),
            Some(Value::String(s)) => serde_json::from_str(s)
                .map(Some)
                .map_err(|e| ExtractionError::InvalidJson {
                    field: self.field.clone(),
                    reason: e.to_string(),
                }),
            Some(other) => Ok(Some(other.clone())),
        }
    }
}
