//! Procesamiento secuencial de un lote de feedback: clasificación,
//! reconciliación, escritura en bloque y contabilidad del lote.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    classifier::TagClassifier,
    error::TagError,
    models::{normalize_date, BatchSummary, CategorySet, FeedbackItem, FeedbackRecord},
    neo4j_client::CategoryCount,
    reconciler::{reconcile, SimilarityLookup},
};

/// Almacén compartido del vocabulario y del feedback etiquetado.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Nombres de las categorías no borradas.
    async fn load_categories(&self) -> Result<CategorySet>;

    /// Escribe todos los registros en una sola transacción (todo o nada).
    async fn save_batch(&self, records: &[FeedbackRecord]) -> Result<()>;

    /// Las tres cadenas de etiquetas más frecuentes de una ejecución.
    async fn top_categories(&self, execution_id: &str) -> Result<Vec<CategoryCount>>;
}

pub struct BatchProcessor<'a> {
    pub classifier: &'a TagClassifier,
    pub lookup: &'a dyn SimilarityLookup,
    pub store: &'a dyn FeedbackStore,
}

impl BatchProcessor<'_> {
    /// Procesa los elementos uno a uno. Los errores por elemento (incluido un
    /// elemento que no es un objeto) se cuentan y no detienen el lote; sólo
    /// los errores de configuración lo abortan.
    pub async fn run(
        &self,
        execution_name: &str,
        items: &[Value],
    ) -> Result<BatchSummary, TagError> {
        let mut summary = BatchSummary::new(items.len());
        info!("Lote {} de la ejecución '{execution_name}': {} elementos", summary.request_id, items.len());

        let categories = self
            .store
            .load_categories()
            .await
            .map_err(|e| TagError::Persistence(format!("no se pudo cargar el vocabulario: {e}")))?;
        info!("Vocabulario cargado: {} categorías", categories.len());
        if categories.is_empty() {
            warn!("Vocabulario vacío: toda etiqueta pasará por la búsqueda por similitud");
        }

        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match self.process_item(execution_name, item, &categories).await {
                Ok(record) => {
                    if record.tags.is_empty() {
                        info!("[{}/{}] sin etiquetas aceptadas", index + 1, items.len());
                    } else {
                        info!("[{}/{}] etiquetas: '{}'", index + 1, items.len(), record.tags.joined());
                    }
                    records.push(record);
                    summary.success += 1;
                }
                Err(err) if err.is_fatal() => {
                    error!("Error de configuración, se aborta el lote: {err}");
                    return Err(err);
                }
                Err(err) => {
                    error!("[{}/{}] Error procesando el elemento '{}': {err}", index + 1, items.len(), item_ref(item));
                    summary.failure += 1;
                }
            }
        }

        if !records.is_empty() {
            if let Err(err) = self.store.save_batch(&records).await {
                error!("Error insertando el lote, se deshace la transacción: {err}");
                summary.mark_all_failed();
            }
        }

        info!("{summary}");
        Ok(summary)
    }

    async fn process_item(
        &self,
        execution_name: &str,
        raw: &Value,
        categories: &CategorySet,
    ) -> Result<FeedbackRecord, TagError> {
        let item = FeedbackItem::from_value(raw)?;
        let body = item.body()?;
        let create_date = normalize_date(item.date_text()?)?;

        let candidates = self
            .classifier
            .classify(&item.title, body, categories.names())
            .await?;
        let tags = reconcile(&candidates, categories, self.lookup).await;

        Ok(FeedbackRecord::new(execution_name, &item, body, create_date, tags))
    }
}

/// Identificador del elemento para los logs, aunque el elemento no sea válido.
fn item_ref(raw: &Value) -> String {
    match raw.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Null) | None => "?".to_string(),
        Some(other) => other.to_string(),
    }
}
