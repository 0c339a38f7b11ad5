use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use neo4rs::query;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};
use url::Url;

use crate::{
    app_state::{AppState, Status},
    batch::{BatchProcessor, FeedbackStore},
    classifier::TagClassifier,
    models::BatchSummary,
    neo4j_client::LabelCorrection,
    notification::{self, Notification, RunOutcome, RunReport},
};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct BatchPayload {
    execution_name: String,
    /// Elementos en crudo: cada uno se valida por separado durante el lote.
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Deserialize)]
pub struct RunSummaryPayload {
    execution_name: String,
    #[serde(default)]
    batches: Vec<BatchSummary>,
}

#[derive(Deserialize)]
pub struct NotificationPayload {
    execution_name: String,
    result: RunOutcome,
}

#[derive(Serialize)]
pub struct CategoriesResponse {
    categories: Vec<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/batches", post(batch_handler))
        .route("/api/runs/summary", post(run_summary_handler))
        .route("/api/notifications", post(notification_handler))
        .route("/api/categories", get(list_categories_handler).put(sync_categories_handler))
        .route("/api/label-corrections", post(label_corrections_handler))
        .route("/api/status", get(status_handler))
        .route("/api/neo4j-info", get(neo4j_info_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn batch_handler(
    State(state): State<AppState>,
    Json(payload): Json<BatchPayload>,
) -> Result<Json<BatchSummary>, ApiError> {
    if payload.execution_name.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Falta 'execution_name' en la petición."));
    }

    // Un modelo mal configurado invalida el lote entero antes de tocar ningún elemento.
    let classifier = TagClassifier::from_config(state.config.chat_model.as_deref(), state.generator.clone())
        .map_err(|e| {
            error!("Lote rechazado: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        })?;

    {
        let mut status = state.status.lock().unwrap();
        status.is_busy = true;
        status.message = format!(
            "Procesando {} elementos de la ejecución '{}'...",
            payload.items.len(),
            payload.execution_name
        );
    }

    let processor = BatchProcessor {
        classifier: &classifier,
        lookup: state.category_index.as_ref(),
        store: state.store.as_ref(),
    };
    let result = processor.run(&payload.execution_name, &payload.items).await;

    let mut status = state.status.lock().unwrap();
    status.is_busy = false;
    match result {
        Ok(summary) => {
            status.message = format!("Lote completado. {summary}");
            status.last_summary = Some(summary.clone());
            Ok(Json(summary))
        }
        Err(e) => {
            status.message = format!("Error en el lote: {e}");
            error!("Error en el lote: {e}");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

#[axum::debug_handler]
async fn run_summary_handler(
    State(state): State<AppState>,
    Json(payload): Json<RunSummaryPayload>,
) -> Result<Json<RunReport>, ApiError> {
    notification::aggregate_run(state.store.as_ref(), &payload.execution_name, &payload.batches)
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
}

#[axum::debug_handler]
async fn notification_handler(
    State(state): State<AppState>,
    Json(payload): Json<NotificationPayload>,
) -> Json<Notification> {
    let notification = notification::prepare_notification(
        &payload.execution_name,
        &payload.result,
        state.config.error_threshold,
    );

    if let Err(e) = state.notifier.publish(&notification).await {
        error!("No se pudo enviar el aviso '{}': {e}", notification.subject);
    }
    Json(notification)
}

#[axum::debug_handler]
async fn list_categories_handler(
    State(state): State<AppState>,
) -> Result<Json<CategoriesResponse>, ApiError> {
    let categories = state.store.load_categories().await.map_err(|e| {
        error!("Error consultando categorías: {e}");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
    })?;
    Ok(Json(CategoriesResponse {
        categories: categories.names().to_vec(),
    }))
}

#[axum::debug_handler]
async fn sync_categories_handler(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let names = category_names_from_json(&payload)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    match state.store.sync_categories(&names).await {
        Ok(message) => Ok((
            StatusCode::OK,
            Json(json!({ "message": format!("The update process completed successfully. {message}") })),
        )),
        Err(e) => {
            error!("Error actualizando categorías: {e}");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("The update process failed. {e}"),
            ))
        }
    }
}

#[axum::debug_handler]
async fn label_corrections_handler(
    State(state): State<AppState>,
    Json(corrections): Json<Vec<LabelCorrection>>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.apply_label_corrections(&corrections).await {
        Ok(updated) => Ok((
            StatusCode::OK,
            Json(json!({ "message": format!("{updated} feedback records updated with new tags") })),
        )),
        Err(e) => {
            error!("Error aplicando correcciones: {e}");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

#[axum::debug_handler]
async fn neo4j_info_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    let browser_url = match Url::parse(&state.config.neo4j_uri) {
        Ok(mut url) => {
            let _ = url.set_scheme("http");
            let _ = url.set_port(Some(7474));
            url.to_string()
        }
        Err(_) => "http://localhost:7474".to_string(),
    };

    match state.graph.run(query("RETURN 1")).await {
        Ok(_) => Ok(Json(json!({ "status": "ok", "browser_url": browser_url }))),
        Err(e) => {
            error!("Error en el health check de Neo4j: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[axum::debug_handler]
async fn shutdown_handler(
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

/// Acepta una lista de nombres o un objeto `{clave: nombre}`.
fn category_names_from_json(payload: &Value) -> Result<Vec<String>, String> {
    let values: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => return Err("Se esperaba una lista o un objeto de categorías.".to_string()),
    };

    let names = values
        .into_iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| format!("Categoría no válida: {v}"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if names.iter().all(|n| n.is_empty()) {
        return Err("La lista de categorías está vacía.".to_string());
    }
    Ok(names)
}
