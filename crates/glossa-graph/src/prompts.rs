//! Context messages and structured-output schemas used by the graph nodes

use std::collections::BTreeMap;

use glossa_ai::StructuredSchema;
use serde::Deserialize;
use serde_json::json;

pub const NEEDED_TERMS_SCHEMA: &str = "needed_terms";
pub const ASSESSMENT_SCHEMA: &str = "context_assessment";

/// Reply to the "which terms do you need" question
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NeededTerms {
    #[serde(default)]
    pub terms: Vec<String>,
}

/// The model's self-assessment after seeing the resolved meanings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub needs_more_context: bool,
    #[serde(default)]
    pub needed_terms: Vec<String>,
}

pub fn needed_terms_schema() -> StructuredSchema {
    StructuredSchema::new(
        NEEDED_TERMS_SCHEMA,
        json!({
            "type": "object",
            "properties": {
                "terms": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["terms"],
            "additionalProperties": false
        }),
    )
}

pub fn assessment_schema() -> StructuredSchema {
    StructuredSchema::new(
        ASSESSMENT_SCHEMA,
        json!({
            "type": "object",
            "properties": {
                "needs_more_context": { "type": "boolean" },
                "needed_terms": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["needs_more_context", "needed_terms"],
            "additionalProperties": false
        }),
    )
}

/// System hint listing the titles the store knows at the current tier
pub fn known_terms_hint(known: &[String]) -> String {
    format!(
        "The knowledge base has definitions for these terms:\n{}\n\n\
         Reply with the terms from this list whose full definitions you need \
         to answer the conversation above. Reply with an empty list if none \
         are needed.",
        known.join("\n")
    )
}

/// Resolved definitions rendered as `- title: definition` lines
pub fn meanings_block(meanings: &BTreeMap<String, String>) -> Option<String> {
    if meanings.is_empty() {
        return None;
    }
    let lines: Vec<String> = meanings
        .iter()
        .map(|(title, definition)| format!("- {title}: {definition}"))
        .collect();
    Some(format!(
        "Definitions from the knowledge base:\n{}",
        lines.join("\n")
    ))
}

/// Instruction for the assessment call, with any meanings resolved so far
pub fn assessment_prompt(meanings: &BTreeMap<String, String>) -> String {
    let instruction = "Decide whether you could answer the conversation above \
                       well with the definitions given. Set needs_more_context \
                       to true if more background would help, and list any \
                       further terms you would want defined in needed_terms.";
    match meanings_block(meanings) {
        Some(block) => format!("{block}\n\n{instruction}"),
        None => instruction.to_string(),
    }
}
