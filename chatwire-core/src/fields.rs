// ABOUTME: Custom field definitions and the validator for pre-chat and contact field answers.
// ABOUTME: Text (optionally email), selector and hierarchy fields, each with its own value rule.

use crate::error::{ChatError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

static EMAIL: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").ok());

fn looks_like_email(value: &str) -> bool {
    EMAIL.as_ref().is_some_and(|re| re.is_match(value.trim()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Depth-first search for `id` in this subtree
    pub fn find(&self, id: &str) -> Option<&HierarchyNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FieldDefinition {
    Text {
        id: String,
        label: String,
        #[serde(default)]
        is_email: bool,
        #[serde(default)]
        is_required: bool,
    },
    Selector {
        id: String,
        label: String,
        options: Vec<SelectorOption>,
        #[serde(default)]
        is_required: bool,
    },
    Hierarchy {
        id: String,
        label: String,
        nodes: Vec<HierarchyNode>,
        #[serde(default)]
        is_required: bool,
    },
}

impl FieldDefinition {
    pub fn id(&self) -> &str {
        match self {
            Self::Text { id, .. } | Self::Selector { id, .. } | Self::Hierarchy { id, .. } => id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Text { label, .. } | Self::Selector { label, .. } | Self::Hierarchy { label, .. } => label,
        }
    }

    pub fn is_required(&self) -> bool {
        match self {
            Self::Text { is_required, .. }
            | Self::Selector { is_required, .. }
            | Self::Hierarchy { is_required, .. } => *is_required,
        }
    }

    /// Check one non-blank value against this definition
    pub fn validate(&self, value: &str) -> Result<()> {
        let reason = match self {
            Self::Text { is_email, .. } => {
                if *is_email && !looks_like_email(value) {
                    Some("not a valid email address".to_string())
                } else {
                    None
                }
            }
            Self::Selector { options, .. } => {
                if options.iter().any(|o| o.id == value) {
                    None
                } else {
                    Some(format!("'{}' is not one of the allowed options", value))
                }
            }
            Self::Hierarchy { nodes, .. } => match nodes.iter().find_map(|n| n.find(value)) {
                Some(node) if node.is_leaf() => None,
                Some(_) => Some(format!("'{}' is not a leaf node", value)),
                None => Some(format!("'{}' is not a known node", value)),
            },
        };

        match reason {
            None => Ok(()),
            Some(reason) => Err(ChatError::InvalidFieldValue {
                field: self.id().to_string(),
                reason,
            }),
        }
    }
}

/// Validates answers keyed by field id against an ordered set of definitions
#[derive(Debug, Clone, Default)]
pub struct FieldDefinitionValidator {
    definitions: Vec<FieldDefinition>,
}

impl FieldDefinitionValidator {
    pub fn new(definitions: Vec<FieldDefinition>) -> Self {
        Self { definitions }
    }

    pub fn definitions(&self) -> &[FieldDefinition] {
        &self.definitions
    }

    /// Validate every answered field, in definition order.
    ///
    /// Fields missing from `answers`, or answered with a blank value, are not
    /// checked here; `check_required` covers completeness.
    pub fn validate(&self, answers: &HashMap<String, String>) -> Result<()> {
        for definition in &self.definitions {
            match answers.get(definition.id()) {
                Some(value) if !value.trim().is_empty() => definition.validate(value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Fail with the labels of every required field that is absent or blank
    pub fn check_required(&self, answers: &HashMap<String, String>) -> Result<()> {
        let labels: Vec<String> = self
            .definitions
            .iter()
            .filter(|d| d.is_required())
            .filter(|d| answers.get(d.id()).map_or(true, |v| v.trim().is_empty()))
            .map(|d| d.label().to_string())
            .collect();

        if labels.is_empty() {
            Ok(())
        } else {
            Err(ChatError::MissingRequiredFields { labels })
        }
    }

    pub fn lookup(&self, field_id: &str) -> Option<&FieldDefinition> {
        self.definitions.iter().find(|d| d.id() == field_id)
    }

    pub fn contains_field(&self, field_id: &str) -> bool {
        self.lookup(field_id).is_some()
    }
}
