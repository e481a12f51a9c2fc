//! Model binding: stored model + credential record to live client.

use std::sync::Arc;

use crate::error::{MusterError, Result};
use crate::platform::anthropic::AnthropicChat;
use crate::platform::ollama::{OllamaChat, OllamaEmbedding};
use crate::platform::openai::{OpenAiChat, OpenAiEmbedding};
use crate::platform::{ChatClient, EmbeddingClient};
use crate::records::{CredentialRecord, ModelRecord, ModelType, Platform};

/// A live model client. Each composite key gets its own instance; bound
/// clients are never shared across keys or sessions.
#[derive(Clone)]
pub enum BoundModel {
    Chat(Arc<dyn ChatClient>),
    Embedding(Arc<dyn EmbeddingClient>),
}

impl std::fmt::Debug for BoundModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat(client) => f.debug_tuple("Chat").field(&client.model_id()).finish(),
            Self::Embedding(client) => {
                f.debug_tuple("Embedding").field(&client.model_id()).finish()
            }
        }
    }
}

impl BoundModel {
    pub fn chat(&self) -> Option<Arc<dyn ChatClient>> {
        match self {
            Self::Chat(client) => Some(client.clone()),
            Self::Embedding(_) => None,
        }
    }

    pub fn embedding(&self) -> Option<Arc<dyn EmbeddingClient>> {
        match self {
            Self::Embedding(client) => Some(client.clone()),
            Self::Chat(_) => None,
        }
    }
}

/// Dispatches on the platform/type tag to the matching client constructor.
pub struct ModelBinder;

impl ModelBinder {
    pub fn bind(record: &ModelRecord, credential: &CredentialRecord) -> Result<BoundModel> {
        let secret = match &credential.secret {
            Some(secret) => secret.as_str(),
            None if !record.platform.requires_credential() => "",
            None => {
                return Err(MusterError::binding(
                    &record.name,
                    format!("platform {} requires a credential", record.platform),
                ));
            }
        };

        let bound = match (record.platform, record.model_type) {
            (Platform::OpenAi, ModelType::Chat) => BoundModel::Chat(Arc::new(OpenAiChat::new(
                &record.model_id,
                secret,
                record.base_url.clone(),
            ))),
            (Platform::OpenAi, ModelType::Embedding) => BoundModel::Embedding(Arc::new(
                OpenAiEmbedding::new(&record.model_id, secret, record.base_url.clone()),
            )),
            (Platform::Azure, ModelType::Chat) => {
                let base_url = record.base_url.as_deref().ok_or_else(|| {
                    MusterError::binding(&record.name, "azure models require a base url")
                })?;
                BoundModel::Chat(Arc::new(OpenAiChat::azure(
                    &record.model_id,
                    secret,
                    base_url,
                    record.api_version.as_deref().unwrap_or("2024-06-01"),
                )))
            }
            (Platform::Azure, ModelType::Embedding) => {
                return Err(MusterError::binding(
                    &record.name,
                    "azure embedding models are not supported",
                ));
            }
            (Platform::Anthropic, ModelType::Chat) => BoundModel::Chat(Arc::new(
                AnthropicChat::new(&record.model_id, secret, record.base_url.clone()),
            )),
            (Platform::Anthropic, ModelType::Embedding) => {
                return Err(MusterError::binding(
                    &record.name,
                    "anthropic does not offer embedding models",
                ));
            }
            (Platform::Ollama, ModelType::Chat) => BoundModel::Chat(Arc::new(OllamaChat::new(
                &record.model_id,
                record.base_url.clone(),
            ))),
            (Platform::Ollama, ModelType::Embedding) => BoundModel::Embedding(Arc::new(
                OllamaEmbedding::new(&record.model_id, record.base_url.clone()),
            )),
        };

        Ok(bound)
    }
}
