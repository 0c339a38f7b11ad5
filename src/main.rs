// Módulos de la aplicación
mod api;
mod app_state;
mod batch;
mod classifier;
mod config;
mod error;
mod llm;
mod models;
mod neo4j_client;
mod notification;
mod prompt;
mod reconciler;
mod vector_store;

use crate::app_state::{AppState, Status};
use crate::llm::{BedrockGenerator, OpenAiEmbedder, TextEmbedder};
use crate::neo4j_client::Neo4jStore;
use crate::notification::{LogSink, NotificationSink, WebhookSink};
use crate::vector_store::{CategoryIndex, Neo4jCategoryNeighbours};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env()?;
    if let Err(e) = llm::ModelFamily::detect(cfg.chat_model.as_deref()) {
        warn!("{e}. Los lotes se rechazarán hasta corregir la configuración.");
    }

    // 3. Conectar a Neo4j y asegurar esquemas
    let graph = Arc::new(neo4j_client::connect_from_config(&cfg).await?);
    neo4j_client::ensure_schema(&graph).await?;
    vector_store::ensure_category_vector_index(&graph, cfg.embedding_dimensions).await?;

    // 4. Clientes de modelos y almacenes
    let embedder: Arc<dyn TextEmbedder> = Arc::new(OpenAiEmbedder::new(&cfg.embedding_model));
    let generator = Arc::new(BedrockGenerator::new(&cfg.bedrock_endpoint, cfg.bedrock_api_key.clone()));
    let notifier: Arc<dyn NotificationSink> = match &cfg.notification_webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url)),
        None => Arc::new(LogSink),
    };

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        graph: graph.clone(),
        generator,
        store: Arc::new(Neo4jStore::new(graph.clone(), embedder.clone())),
        category_index: Arc::new(CategoryIndex::new(
            Arc::new(Neo4jCategoryNeighbours::new(graph)),
            embedder,
        )),
        notifier,
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            last_summary: None,
        })),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr).await?;
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
