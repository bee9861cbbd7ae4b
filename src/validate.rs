// ABOUTME: Offline check of custom field answers against field definitions
// ABOUTME: Backs the `chatwire validate` command

use anyhow::{Context, Result};
use chatwire_core::{ChatError, FieldDefinition, FieldDefinitionValidator};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    /// Per-field value problems, in definition order
    pub invalid: Vec<FieldProblem>,
    /// Labels of required fields that are absent or blank
    pub missing: Vec<String>,
    /// Answer ids that match no definition
    pub unknown: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FieldProblem {
    pub field: String,
    pub reason: String,
}

/// Check every answer instead of stopping at the first problem
pub fn check_answers(definitions: Vec<FieldDefinition>, answers: &HashMap<String, String>) -> ValidationReport {
    let validator = FieldDefinitionValidator::new(definitions);

    let mut invalid = Vec::new();
    for definition in validator.definitions() {
        let Some(value) = answers.get(definition.id()) else {
            continue;
        };
        if value.trim().is_empty() {
            continue;
        }
        if let Err(ChatError::InvalidFieldValue { field, reason }) = definition.validate(value) {
            invalid.push(FieldProblem { field, reason });
        }
    }

    let missing = match validator.check_required(answers) {
        Err(ChatError::MissingRequiredFields { labels }) => labels,
        _ => Vec::new(),
    };

    let mut unknown: Vec<String> = answers
        .keys()
        .filter(|id| !validator.contains_field(id))
        .cloned()
        .collect();
    unknown.sort();

    ValidationReport {
        valid: invalid.is_empty() && missing.is_empty() && unknown.is_empty(),
        invalid,
        missing,
        unknown,
    }
}

/// Load a JSON array of field definitions
pub fn load_definitions(path: &Path) -> Result<Vec<FieldDefinition>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse field definitions in {}", path.display()))
}

/// Load a JSON object of field id to answer
pub fn load_answers(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse answers in {}", path.display()))
}
