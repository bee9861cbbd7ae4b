// ABOUTME: REST collaborator contract: attachment upload, channel configuration, visitor association.
// ABOUTME: Includes a scripted in-process MockChatApi used by tests and the CLI.

use crate::error::{ChatError, Result};
use crate::fields::FieldDefinition;
use crate::survey::PreChatSurvey;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// REST endpoints the kernel calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiRoute {
    UploadAttachment { brand_id: i64, channel_id: String },
    ChannelConfiguration { brand_id: i64, channel_id: String },
    AssociateVisitor { brand_id: i64, visitor_id: Uuid },
}

impl ApiRoute {
    pub fn method(&self) -> &'static str {
        match self {
            Self::UploadAttachment { .. } => "POST",
            Self::ChannelConfiguration { .. } => "GET",
            Self::AssociateVisitor { .. } => "PUT",
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::UploadAttachment {
                brand_id,
                channel_id,
            } => format!("/brand/{}/channel/{}/attachment", brand_id, channel_id),
            Self::ChannelConfiguration {
                brand_id,
                channel_id,
            } => format!("/brand/{}/channel/{}", brand_id, channel_id),
            Self::AssociateVisitor {
                brand_id,
                visitor_id,
            } => format!("/brand/{}/visitor/{}", brand_id, visitor_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub content: Vec<u8>,
    pub mime_type: String,
    pub file_name: String,
}

impl AttachmentUpload {
    pub fn new(content: impl Into<Vec<u8>>, mime_type: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            mime_type: mime_type.into(),
            file_name: file_name.into(),
        }
    }

    /// JSON body for the upload endpoint
    pub fn request_body(&self) -> Value {
        json!({
            "content": base64::engine::general_purpose::STANDARD.encode(&self.content),
            "mimeType": self.mime_type,
            "fileName": self.file_name,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentUploadResponse {
    #[serde(default)]
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfiguration {
    #[serde(default)]
    pub is_multithread: bool,
    #[serde(default)]
    pub is_authorization_enabled: bool,
    #[serde(default)]
    pub pre_chat_survey: Option<PreChatSurvey>,
    #[serde(default)]
    pub contact_custom_fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub customer_custom_fields: Vec<FieldDefinition>,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn upload_attachment(
        &self,
        brand_id: i64,
        channel_id: &str,
        upload: &AttachmentUpload,
    ) -> Result<AttachmentUploadResponse>;

    async fn channel_configuration(&self, brand_id: i64, channel_id: &str) -> Result<ChannelConfiguration>;

    async fn associate_visitor(&self, brand_id: i64, visitor_id: Uuid, customer_id: &str) -> Result<()>;
}

/// Scripted ChatApi. Unscripted uploads succeed with a URL derived from the call count.
#[derive(Default)]
pub struct MockChatApi {
    upload_responses: Mutex<VecDeque<Result<AttachmentUploadResponse>>>,
    upload_delay: Option<Duration>,
    upload_calls: AtomicUsize,
    configuration: Mutex<ChannelConfiguration>,
    association_failures: Mutex<VecDeque<ChatError>>,
    requests: Mutex<Vec<(ApiRoute, Option<Value>)>>,
}

impl MockChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next upload call
    pub fn with_upload_response(self, response: Result<AttachmentUploadResponse>) -> Self {
        self.upload_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
        self
    }

    /// Make every upload take `delay`, to widen race windows in tests
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    pub fn with_channel_configuration(self, configuration: ChannelConfiguration) -> Self {
        *self.configuration.lock().unwrap_or_else(|e| e.into_inner()) = configuration;
        self
    }

    /// Fail the next association with `error`
    pub fn fail_association(self, error: ChatError) -> Self {
        self.association_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
        self
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Every request made so far with its JSON body
    pub fn requests(&self) -> Vec<(ApiRoute, Option<Value>)> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, route: ApiRoute, body: Option<Value>) {
        tracing::debug!(method = route.method(), path = %route.path(), "Mock API request");
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((route, body));
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn upload_attachment(
        &self,
        brand_id: i64,
        channel_id: &str,
        upload: &AttachmentUpload,
    ) -> Result<AttachmentUploadResponse> {
        let call = self.upload_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(
            ApiRoute::UploadAttachment {
                brand_id,
                channel_id: channel_id.to_string(),
            },
            Some(upload.request_body()),
        );
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .upload_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| {
            Ok(AttachmentUploadResponse {
                file_url: Some(format!("https://files.example.com/{}/{}", call, upload.file_name)),
            })
        })
    }

    async fn channel_configuration(&self, brand_id: i64, channel_id: &str) -> Result<ChannelConfiguration> {
        self.record(
            ApiRoute::ChannelConfiguration {
                brand_id,
                channel_id: channel_id.to_string(),
            },
            None,
        );
        Ok(self
            .configuration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn associate_visitor(&self, brand_id: i64, visitor_id: Uuid, customer_id: &str) -> Result<()> {
        self.record(
            ApiRoute::AssociateVisitor {
                brand_id,
                visitor_id,
            },
            Some(json!({"customerId": customer_id})),
        );
        match self
            .association_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        let visitor = Uuid::nil();
        assert_eq!(
            ApiRoute::UploadAttachment {
                brand_id: 1,
                channel_id: "c".into()
            }
            .path(),
            "/brand/1/channel/c/attachment"
        );
        let associate = ApiRoute::AssociateVisitor {
            brand_id: 1,
            visitor_id: visitor,
        };
        assert_eq!(associate.method(), "PUT");
        assert_eq!(associate.path(), format!("/brand/1/visitor/{}", visitor));
    }

    #[test]
    fn test_upload_body_is_base64() {
        let body = AttachmentUpload::new(b"hello".to_vec(), "text/plain", "a.txt").request_body();
        assert_eq!(body["content"], "aGVsbG8=");
        assert_eq!(body["mimeType"], "text/plain");
        assert_eq!(body["fileName"], "a.txt");
    }

    #[test]
    fn test_channel_configuration_defaults() {
        let config: ChannelConfiguration = serde_json::from_str(r#"{"isMultithread": true}"#).unwrap();
        assert!(config.is_multithread);
        assert!(config.pre_chat_survey.is_none());
        assert!(config.contact_custom_fields.is_empty());
    }

    #[tokio::test]
    async fn test_mock_scripted_then_default_uploads() {
        let api = MockChatApi::new().with_upload_response(Err(ChatError::ServerError("503".into())));
        let upload = AttachmentUpload::new(b"x".to_vec(), "image/png", "x.png");

        assert!(api.upload_attachment(1, "c", &upload).await.is_err());
        let ok = api.upload_attachment(1, "c", &upload).await.unwrap();
        assert_eq!(ok.file_url.as_deref(), Some("https://files.example.com/2/x.png"));
        assert_eq!(api.upload_calls(), 2);
    }
}
