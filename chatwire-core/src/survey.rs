// ABOUTME: Pre-chat survey and its typed responses.
// ABOUTME: Accepted responses become custom fields on the new thread.

use crate::error::{ChatError, Result};
use crate::fields::{FieldDefinition, FieldDefinitionValidator};
use crate::thread::CustomField;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreChatSurvey {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// One answer, shaped by the kind of field it answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PreChatSurveyResponse {
    Text { field_id: String, value: String },
    Selector { field_id: String, option_id: String },
    Hierarchy { field_id: String, node_id: String },
}

impl PreChatSurveyResponse {
    pub fn field_id(&self) -> &str {
        match self {
            Self::Text { field_id, .. }
            | Self::Selector { field_id, .. }
            | Self::Hierarchy { field_id, .. } => field_id,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Text { value, .. } => value,
            Self::Selector { option_id, .. } => option_id,
            Self::Hierarchy { node_id, .. } => node_id,
        }
    }

    fn answers(&self, definition: &FieldDefinition) -> bool {
        matches!(
            (self, definition),
            (Self::Text { .. }, FieldDefinition::Text { .. })
                | (Self::Selector { .. }, FieldDefinition::Selector { .. })
                | (Self::Hierarchy { .. }, FieldDefinition::Hierarchy { .. })
        )
    }
}

/// Flatten responses into the answers map the validator consumes
pub fn answers(responses: &[PreChatSurveyResponse]) -> HashMap<String, String> {
    responses
        .iter()
        .map(|r| (r.field_id().to_string(), r.value().to_string()))
        .collect()
}

impl PreChatSurvey {
    pub fn validator(&self) -> FieldDefinitionValidator {
        FieldDefinitionValidator::new(self.fields.clone())
    }

    /// Validate `responses` and turn the non-blank ones into custom fields
    pub fn accept(&self, responses: &[PreChatSurveyResponse]) -> Result<Vec<CustomField>> {
        let validator = self.validator();

        for response in responses {
            let definition = validator.lookup(response.field_id()).ok_or_else(|| {
                ChatError::InvalidFieldValue {
                    field: response.field_id().to_string(),
                    reason: "not part of this survey".to_string(),
                }
            })?;
            if !response.answers(definition) {
                return Err(ChatError::InvalidFieldValue {
                    field: response.field_id().to_string(),
                    reason: "response kind does not match the field".to_string(),
                });
            }
        }

        let answers = answers(responses);
        validator.validate(&answers)?;
        validator.check_required(&answers)?;

        Ok(responses
            .iter()
            .filter(|r| !r.value().trim().is_empty())
            .map(|r| CustomField::new(r.field_id(), r.value()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::SelectorOption;

    fn survey() -> PreChatSurvey {
        PreChatSurvey {
            name: "Before we start".into(),
            fields: vec![
                FieldDefinition::Text {
                    id: "email".into(),
                    label: "Email".into(),
                    is_email: true,
                    is_required: true,
                },
                FieldDefinition::Selector {
                    id: "dept".into(),
                    label: "Department".into(),
                    options: vec![SelectorOption {
                        id: "sales".into(),
                        label: "Sales".into(),
                    }],
                    is_required: false,
                },
            ],
        }
    }

    #[test]
    fn test_accept_returns_custom_fields() {
        let fields = survey()
            .accept(&[
                PreChatSurveyResponse::Text {
                    field_id: "email".into(),
                    value: "ada@example.com".into(),
                },
                PreChatSurveyResponse::Selector {
                    field_id: "dept".into(),
                    option_id: "sales".into(),
                },
            ])
            .unwrap();
        let ids: Vec<_> = fields.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["email", "dept"]);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let err = survey()
            .accept(&[PreChatSurveyResponse::Hierarchy {
                field_id: "dept".into(),
                node_id: "sales".into(),
            }])
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidFieldValue { field, .. } if field == "dept"));
    }

    #[test]
    fn test_missing_required_is_reported() {
        let err = survey().accept(&[]).unwrap_err();
        assert_eq!(
            err,
            ChatError::MissingRequiredFields {
                labels: vec!["Email".into()]
            }
        );
    }

    #[test]
    fn test_response_wire_shape() {
        let response: PreChatSurveyResponse =
            serde_json::from_str(r#"{"type": "selector", "fieldId": "dept", "optionId": "sales"}"#).unwrap();
        assert_eq!(response.value(), "sales");
    }
}
