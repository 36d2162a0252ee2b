//! Structured output: schema definitions and decoding of backend replies

use serde_json::Value;

use crate::error::{Error, Result};

/// A JSON Schema a structured call must conform to
#[derive(Debug, Clone)]
pub struct StructuredSchema {
    /// Schema name (sent to backends that require one)
    pub name: String,
    /// JSON Schema document
    pub schema: Value,
}

impl StructuredSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Parse raw backend output and validate it against the schema
    pub fn decode(&self, raw: &str) -> Result<Value> {
        let body = strip_code_fence(raw);
        let value: Value = serde_json::from_str(body).map_err(|e| {
            Error::SchemaValidation(format!("{}: output is not JSON: {}", self.name, e))
        })?;

        let validator = jsonschema::validator_for(&self.schema).map_err(|e| {
            Error::SchemaValidation(format!("{}: invalid schema: {}", self.name, e))
        })?;

        let errors: Vec<String> = validator
            .iter_errors(&value)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(value)
        } else {
            Err(Error::SchemaValidation(format!(
                "{}: {}",
                self.name,
                errors.join("; ")
            )))
        }
    }
}

/// Models sometimes wrap JSON in a Markdown fence even in JSON mode
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
