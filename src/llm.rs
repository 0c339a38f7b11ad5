//! Acceso a los modelos: generación de texto (familia Anthropic sobre el
//! endpoint `invoke` de Bedrock) y embeddings (OpenAI vía Rig).
//!
//! Sólo se admite la familia de modelos de Anthropic para la generación. Dentro
//! de ella hay dos interfaces con formas de respuesta distintas (`messages` para
//! Claude 3 y `completion` para los modelos anteriores); cada variante de
//! `ModelFamily` sabe construir su petición y extraer su texto.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::embeddings::EmbeddingModel; // <- para .embed_texts
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::TagError;

const ANTHROPIC_MARKER: &str = "anthropic";
const CLAUDE_3_MARKER: &str = "claude-3";
const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// Parámetros de muestreo enviados al modelo de generación.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub top_p: f64,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            top_p: 0.6,
            temperature: 0.5,
            max_tokens: 500,
        }
    }
}

/// Interfaz de modelo, deducida del identificador configurado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Claude 3 y posteriores: cuerpo `messages`, respuesta `content[0].text`.
    ClaudeMessages,
    /// Claude anteriores: cuerpo `prompt`, respuesta `completion`.
    ClaudeCompletion,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    completion: Option<String>,
}

impl ModelFamily {
    /// Valida el identificador de modelo y deduce su familia.
    pub fn detect(model_id: Option<&str>) -> Result<Self, TagError> {
        let model_id = match model_id.map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(TagError::Configuration(
                    "falta la variable de entorno 'CHAT_MODEL'".into(),
                ))
            }
        };

        if !model_id.contains(ANTHROPIC_MARKER) {
            return Err(TagError::UnsupportedModel(model_id.to_string()));
        }

        if model_id.contains(CLAUDE_3_MARKER) {
            Ok(Self::ClaudeMessages)
        } else {
            Ok(Self::ClaudeCompletion)
        }
    }

    pub fn request_body(&self, prompt: &str, params: &GenerationParams) -> Value {
        match self {
            Self::ClaudeMessages => json!({
                "top_p": params.top_p,
                "temperature": params.temperature,
                "anthropic_version": ANTHROPIC_VERSION,
                "max_tokens": params.max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
            }),
            Self::ClaudeCompletion => json!({
                "top_p": params.top_p,
                "temperature": params.temperature,
                "prompt": format!("\n\nHuman:{prompt}\n\nAssistant:"),
                "max_tokens_to_sample": params.max_tokens,
                "stop_sequences": ["\n\nHuman:"],
            }),
        }
    }

    /// Extrae el texto generado de la respuesta cruda.
    pub fn extract_text(&self, raw: &[u8]) -> Result<String, TagError> {
        let malformed = |e: serde_json::Error| {
            TagError::MalformedModelResponse(format!("JSON no válido en la respuesta: {e}"))
        };

        match self {
            Self::ClaudeMessages => {
                let body: MessagesResponse = serde_json::from_slice(raw).map_err(malformed)?;
                body.content
                    .into_iter()
                    .next()
                    .and_then(|block| block.text)
                    .ok_or_else(|| {
                        TagError::MalformedModelResponse("la respuesta no trae 'content[0].text'".into())
                    })
            }
            Self::ClaudeCompletion => {
                let body: CompletionResponse = serde_json::from_slice(raw).map_err(malformed)?;
                body.completion.ok_or_else(|| {
                    TagError::MalformedModelResponse("la respuesta no trae 'completion'".into())
                })
            }
        }
    }
}

// ---------------------------------------------------------------------
// GENERACIÓN
// ---------------------------------------------------------------------

/// Servicio externo de generación de texto. Devuelve el cuerpo crudo de la respuesta.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Vec<u8>, TagError>;
}

/// Cliente HTTP del endpoint `/model/{id}/invoke` de Bedrock Runtime (API key como bearer).
#[derive(Debug, Clone)]
pub struct BedrockGenerator {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl BedrockGenerator {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl TextGenerator for BedrockGenerator {
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Vec<u8>, TagError> {
        let url = format!("{}/model/{}/invoke", self.endpoint, model_id);
        debug!("Invocando modelo {model_id}");

        let mut request = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("accept", "*/*")
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TagError::Transport(e.to_string()))?;
        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TagError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Credenciales rechazadas: fallarían todos los elementos, así que es configuración.
fn status_error(status: reqwest::StatusCode) -> Option<TagError> {
    match status {
        s if s.is_success() => None,
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Some(
            TagError::Configuration(format!("el endpoint del modelo rechazó las credenciales ({status})")),
        ),
        s => Some(TagError::Transport(format!("respuesta HTTP {s} del modelo"))),
    }
}

// ---------------------------------------------------------------------
// EMBEDDINGS
// ---------------------------------------------------------------------

/// Servicio de embeddings usado tanto para las categorías como para las consultas.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>>;
}

/// Embeddings con OpenAI a través de Rig.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    pub model: String,
}

impl OpenAiEmbedder {
    pub fn new(model: &str) -> Self {
        Self { model: model.to_string() }
    }
}

#[async_trait]
impl TextEmbedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;

        let client = openai::Client::from_env();
        let model_name = if self.model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model.embed_texts(vec![text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .map(|e| e.vec)
            .ok_or_else(|| anyhow!("No se pudo generar el embedding del texto"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_a_configuration_error() {
        assert!(matches!(ModelFamily::detect(None), Err(TagError::Configuration(_))));
        assert!(matches!(ModelFamily::detect(Some("  ")), Err(TagError::Configuration(_))));
    }

    #[test]
    fn only_anthropic_models_are_supported() {
        let err = ModelFamily::detect(Some("meta.llama3-8b-instruct-v1:0")).unwrap_err();
        assert_eq!(err, TagError::UnsupportedModel("meta.llama3-8b-instruct-v1:0".into()));
    }

    #[test]
    fn family_follows_version_marker() {
        assert_eq!(
            ModelFamily::detect(Some("anthropic.claude-3-haiku-20240307-v1:0")).unwrap(),
            ModelFamily::ClaudeMessages
        );
        assert_eq!(
            ModelFamily::detect(Some("anthropic.claude-v2:1")).unwrap(),
            ModelFamily::ClaudeCompletion
        );
    }

    #[test]
    fn messages_body_carries_prompt_and_sampling() {
        let body = ModelFamily::ClaudeMessages.request_body("hola", &GenerationParams::default());
        assert_eq!(body["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["top_p"], 0.6);
        assert_eq!(body["messages"][0]["content"], "hola");
    }

    #[test]
    fn completion_body_wraps_prompt_in_turns() {
        let body = ModelFamily::ClaudeCompletion.request_body("hola", &GenerationParams::default());
        assert_eq!(body["prompt"], "\n\nHuman:hola\n\nAssistant:");
        assert_eq!(body["max_tokens_to_sample"], 500);
        assert_eq!(body["stop_sequences"][0], "\n\nHuman:");
    }

    #[test]
    fn each_family_extracts_its_own_shape() {
        let messages = br#"{"content":[{"type":"text","text":"<tag>Billing</tag>"}]}"#;
        let completion = br#"{"completion":" <tag>Billing</tag>","stop_reason":"stop_sequence"}"#;

        assert_eq!(
            ModelFamily::ClaudeMessages.extract_text(messages).unwrap(),
            "<tag>Billing</tag>"
        );
        assert_eq!(
            ModelFamily::ClaudeCompletion.extract_text(completion).unwrap(),
            " <tag>Billing</tag>"
        );
        assert!(matches!(
            ModelFamily::ClaudeMessages.extract_text(completion),
            Err(TagError::MalformedModelResponse(_))
        ));
        assert!(matches!(
            ModelFamily::ClaudeCompletion.extract_text(b"no es json"),
            Err(TagError::MalformedModelResponse(_))
        ));
    }

    #[test]
    fn rejected_credentials_are_configuration_errors() {
        assert_eq!(status_error(reqwest::StatusCode::OK), None);
        assert!(matches!(
            status_error(reqwest::StatusCode::FORBIDDEN),
            Some(TagError::Configuration(_))
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::TOO_MANY_REQUESTS),
            Some(TagError::Transport(_))
        ));
    }
}
