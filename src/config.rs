//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + notificaciones).

use std::env;
use anyhow::{anyhow, Result};

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    /// Identificador del modelo de generación. Su ausencia no impide arrancar,
    /// pero cualquier lote fallará de inmediato con un error de configuración.
    pub chat_model: Option<String>,
    pub bedrock_endpoint: String,
    pub bedrock_api_key: Option<String>,

    pub embedding_model: String,
    pub embedding_dimensions: usize,

    pub error_threshold: f64,
    pub notification_webhook_url: Option<String>,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI")
            .map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?;
        let neo4j_user = env::var("NEO4J_USER")
            .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?;
        let neo4j_password = env::var("NEO4J_PASSWORD")
            .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let chat_model = non_empty_var("CHAT_MODEL");
        let region = env::var("BEDROCK_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let bedrock_endpoint = non_empty_var("BEDROCK_ENDPOINT")
            .unwrap_or_else(|| format!("https://bedrock-runtime.{region}.amazonaws.com"));
        let bedrock_api_key = non_empty_var("BEDROCK_API_KEY");

        let embedding_model = env::var("EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let embedding_dimensions = match env::var("EMBEDDING_MODEL_DIMENSIONS") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|e| anyhow!("EMBEDDING_MODEL_DIMENSIONS inválido ('{raw}'): {e}"))?,
            Err(_) => 1536,
        };

        let error_threshold = match env::var("ERROR_THRESHOLD") {
            Ok(raw) => parse_threshold(&raw)?,
            Err(_) => 0.2,
        };
        let notification_webhook_url = non_empty_var("NOTIFICATION_WEBHOOK_URL");

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            chat_model,
            bedrock_endpoint,
            bedrock_api_key,
            embedding_model,
            embedding_dimensions,
            error_threshold,
            notification_webhook_url,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// El umbral es una proporción de fallos; fuera de [0, 1] no tiene sentido.
fn parse_threshold(raw: &str) -> Result<f64> {
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| anyhow!("ERROR_THRESHOLD inválido ('{raw}'): {e}"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("ERROR_THRESHOLD debe estar entre 0 y 1, recibido {value}"));
    }
    Ok(value)
}
