//! Clasificador de etiquetas: construye el prompt, invoca el modelo y
//! convierte la respuesta delimitada en una lista limpia de candidatas.

use std::sync::Arc;

use tracing::debug;

use crate::{
    error::TagError,
    llm::{GenerationParams, ModelFamily, TextGenerator},
    prompt::{build_tag_prompt, TAG_CLOSE, TAG_OPEN},
};

/// Número máximo de etiquetas candidatas por elemento.
pub const MAX_CANDIDATE_TAGS: usize = 3;

pub struct TagClassifier {
    model_id: String,
    family: ModelFamily,
    params: GenerationParams,
    generator: Arc<dyn TextGenerator>,
}

impl TagClassifier {
    /// Falla antes de tocar ningún elemento si el modelo falta o no es de Anthropic.
    pub fn from_config(
        chat_model: Option<&str>,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self, TagError> {
        let family = ModelFamily::detect(chat_model)?;
        Ok(Self {
            model_id: chat_model.unwrap_or_default().trim().to_string(),
            family,
            params: GenerationParams::default(),
            generator,
        })
    }

    /// Devuelve entre 0 y 3 etiquetas candidatas. Puede incluir el centinela
    /// `unknown`; la validación contra el vocabulario es del reconciliador.
    pub async fn classify(
        &self,
        title: &str,
        body: &str,
        allowed_categories: &[String],
    ) -> Result<Vec<String>, TagError> {
        if body.trim().is_empty() {
            return Err(TagError::InvalidInput("'feedback' está vacío".into()));
        }

        let prompt = build_tag_prompt(title, body, allowed_categories);
        let request = self.family.request_body(&prompt, &self.params);

        let raw = self.generator.invoke(&self.model_id, &request).await?;
        let text = self.family.extract_text(&raw)?;
        debug!("Respuesta del modelo: {text}");

        parse_tag_list(&text)
    }
}

/// Toma el contenido del primer `<tag>...</tag>`, lo separa por comas y descarta vacíos.
pub fn parse_tag_list(text: &str) -> Result<Vec<String>, TagError> {
    let start = text.find(TAG_OPEN).ok_or_else(|| {
        TagError::MalformedModelResponse(format!("falta '{TAG_OPEN}' en la respuesta: '{text}'"))
    })? + TAG_OPEN.len();
    let len = text[start..].find(TAG_CLOSE).ok_or_else(|| {
        TagError::MalformedModelResponse(format!("falta '{TAG_CLOSE}' en la respuesta: '{text}'"))
    })?;

    Ok(text[start..start + len]
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .take(MAX_CANDIDATE_TAGS)
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Generador falso que devuelve respuestas fijas y registra las invocaciones.
    pub(crate) struct FakeGenerator {
        responses: Mutex<Vec<Result<Vec<u8>, TagError>>>,
        pub calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeGenerator {
        pub(crate) fn replying(texts: &[&str]) -> Arc<Self> {
            let responses = texts
                .iter()
                .rev()
                .map(|t| {
                    Ok(serde_json::to_vec(&serde_json::json!({
                        "content": [{ "type": "text", "text": t }]
                    }))
                    .unwrap())
                })
                .collect();
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn failing(err: TagError) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(vec![Err(err)]),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextGenerator for FakeGenerator {
        async fn invoke(&self, model_id: &str, body: &Value) -> Result<Vec<u8>, TagError> {
            self.calls.lock().unwrap().push((model_id.to_string(), body.clone()));
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(TagError::Transport("sin respuestas preparadas".into())))
        }
    }

    pub(crate) const CLAUDE_3: &str = "anthropic.claude-3-haiku-20240307-v1:0";

    fn categories() -> Vec<String> {
        vec!["Billing".into(), "Shipping Issue".into(), "Product Quality".into()]
    }

    #[test]
    fn parses_first_delimited_block() {
        let tags = parse_tag_list("<tag> Billing , Shipping Issue,, </tag><tag>Otro</tag>").unwrap();
        assert_eq!(tags, vec!["Billing", "Shipping Issue"]);
    }

    #[test]
    fn keeps_sentinel_and_caps_at_three() {
        assert_eq!(parse_tag_list("<tag>unknown</tag>").unwrap(), vec!["unknown"]);
        let tags = parse_tag_list("<tag>a, b, c, d</tag>").unwrap();
        assert_eq!(tags, vec!["a", "b", "c"]);
        assert!(parse_tag_list("<tag> , </tag>").unwrap().is_empty());
    }

    #[test]
    fn missing_delimiters_are_malformed() {
        assert!(matches!(
            parse_tag_list("Billing, Shipping Issue"),
            Err(TagError::MalformedModelResponse(_))
        ));
        assert!(matches!(
            parse_tag_list("<tag>Billing"),
            Err(TagError::MalformedModelResponse(_))
        ));
    }

    #[test]
    fn construction_fails_fast_on_bad_model() {
        let generator = FakeGenerator::replying(&[]);
        assert!(matches!(
            TagClassifier::from_config(None, generator.clone()),
            Err(TagError::Configuration(_))
        ));
        assert!(matches!(
            TagClassifier::from_config(Some("amazon.titan-text-express-v1"), generator),
            Err(TagError::UnsupportedModel(_))
        ));
    }

    #[tokio::test]
    async fn classify_returns_clean_candidates() {
        let generator = FakeGenerator::replying(&["<tag>Shipping Issue, Billing</tag>"]);
        let classifier = TagClassifier::from_config(Some(CLAUDE_3), generator.clone()).unwrap();

        let tags = classifier
            .classify("Retraso", "El pedido llegó dos semanas tarde", &categories())
            .await
            .unwrap();

        assert_eq!(tags, vec!["Shipping Issue", "Billing"]);
        let calls = generator.calls.lock().unwrap();
        assert_eq!(calls[0].0, CLAUDE_3);
        let prompt = calls[0].1["messages"][0]["content"].as_str().unwrap();
        assert!(prompt.contains("- Product Quality"));
        assert!(prompt.contains("El pedido llegó dos semanas tarde"));
    }

    #[tokio::test]
    async fn empty_body_never_reaches_the_model() {
        let generator = FakeGenerator::replying(&["<tag>Billing</tag>"]);
        let classifier = TagClassifier::from_config(Some(CLAUDE_3), generator.clone()).unwrap();

        let err = classifier.classify("Título", "", &categories()).await.unwrap_err();

        assert!(matches!(err, TagError::InvalidInput(_)));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn response_without_delimiters_is_surfaced() {
        let generator = FakeGenerator::replying(&["Billing"]);
        let classifier = TagClassifier::from_config(Some(CLAUDE_3), generator).unwrap();

        let err = classifier.classify("", "Me cobraron dos veces", &categories()).await.unwrap_err();
        assert!(matches!(err, TagError::MalformedModelResponse(_)));
    }

    #[tokio::test]
    async fn transport_failures_pass_through() {
        let generator = FakeGenerator::failing(TagError::Transport("throttled".into()));
        let classifier = TagClassifier::from_config(Some(CLAUDE_3), generator.clone()).unwrap();

        let err = classifier.classify("", "Me cobraron dos veces", &categories()).await.unwrap_err();
        assert_eq!(err, TagError::Transport("throttled".into()));
        assert_eq!(generator.call_count(), 1);
    }
}
