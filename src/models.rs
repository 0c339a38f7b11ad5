//! Modelos de dominio: feedback de entrada, vocabulario de categorías,
//! etiquetas reconciliadas y resumen de lote.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TagError;

/// Etiqueta centinela: "ninguna categoría aplica". Nunca se persiste.
pub const TAG_UNKNOWN: &str = "unknown";

/// Distancia máxima (exclusiva) para aceptar una categoría por similitud.
pub const SIMILARITY_DISTANCE_THRESHOLD: f64 = 0.4;

/// Una fila de feedback tal y como llega en el lote.
///
/// `feedback` y `date` se mantienen como `Value` para que un tipo inesperado
/// sea un fallo de ese elemento y no del lote entero. El resto de campos
/// aceptan texto o números y se normalizan a cadena (vacía si faltan).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackItem {
    #[serde(default, deserialize_with = "lenient_text")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub title: String,
    #[serde(default)]
    pub feedback: Value,
    #[serde(default, deserialize_with = "lenient_text")]
    pub store: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub stars: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub product_name: String,
    #[serde(default)]
    pub date: Value,
}

impl FeedbackItem {
    /// Convierte un elemento crudo del lote; si no es un objeto válido es `InvalidInput`.
    pub fn from_value(value: &Value) -> Result<Self, TagError> {
        if !value.is_object() {
            return Err(TagError::InvalidInput(format!(
                "el elemento debe ser un objeto, recibido {value}"
            )));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| TagError::InvalidInput(format!("elemento no válido: {e}")))
    }

    /// Fecha en crudo; `null` o ausente es `None`, cualquier otro tipo no textual es inválido.
    pub fn date_text(&self) -> Result<Option<&str>, TagError> {
        match &self.date {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.as_str())),
            other => Err(TagError::InvalidInput(format!(
                "'date' debe ser texto, recibido {other}"
            ))),
        }
    }

    /// Devuelve el cuerpo del feedback si es texto no vacío.
    pub fn body(&self) -> Result<&str, TagError> {
        match &self.feedback {
            Value::String(text) if !text.trim().is_empty() => Ok(text.as_str()),
            Value::String(_) => Err(TagError::InvalidInput("'feedback' está vacío".into())),
            Value::Null => Err(TagError::InvalidInput("falta 'feedback' en el elemento".into())),
            other => Err(TagError::InvalidInput(format!(
                "'feedback' debe ser texto, recibido {other}"
            ))),
        }
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Normaliza la fecha del feedback al formato `YYYY-MM-DD HH:MM:SS`.
pub fn normalize_date(raw: Option<&str>) -> Result<Option<String>, TagError> {
    const OUTPUT: &str = "%Y-%m-%d %H:%M:%S";

    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(r) => r,
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(dt.naive_local().format(OUTPUT).to_string()));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Ok(Some(dt.format(OUTPUT).to_string()));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(Some(dt.format(OUTPUT).to_string()));
        }
    }

    Err(TagError::InvalidInput(format!("fecha no reconocida: '{raw}'")))
}

/// Instantánea inmutable del vocabulario de categorías para un lote.
#[derive(Debug, Clone, Default)]
pub struct CategorySet {
    names: Vec<String>,
    index: HashSet<String>,
}

impl CategorySet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for name in names {
            let name = name.into();
            if set.index.insert(name.clone()) {
                set.names.push(name);
            }
        }
        set
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Resultado de una búsqueda de vecino más cercano.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityMatch {
    pub category: String,
    /// 0.0 = idéntico; mayor = menos parecido.
    pub distance: f64,
}

impl SimilarityMatch {
    pub fn is_accepted(&self) -> bool {
        self.distance < SIMILARITY_DISTANCE_THRESHOLD
    }
}

/// Etiquetas finales aceptadas para un elemento, sin duplicados y en orden de aceptación.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciledTagSet {
    tags: Vec<String>,
}

impl ReconciledTagSet {
    pub fn insert(&mut self, tag: &str) -> bool {
        if tag.is_empty() || tag == TAG_UNKNOWN || self.contains(tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Representación persistida: etiquetas unidas por comas (vacía si no hay ninguna).
    pub fn joined(&self) -> String {
        self.tags.join(",")
    }
}

/// Registro listo para persistir tras clasificar y reconciliar un elemento.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub ref_id: String,
    pub execution_id: String,
    pub feedback: String,
    pub title: String,
    pub store: String,
    pub stars: String,
    pub product_name: String,
    pub create_date: Option<String>,
    pub tags: ReconciledTagSet,
}

impl FeedbackRecord {
    pub fn new(
        execution_id: &str,
        item: &FeedbackItem,
        body: &str,
        create_date: Option<String>,
        tags: ReconciledTagSet,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ref_id: item.id.clone(),
            execution_id: execution_id.to_string(),
            feedback: body.to_string(),
            title: item.title.clone(),
            store: item.store.clone(),
            stars: item.stars.clone(),
            product_name: item.product_name.clone(),
            create_date,
            tags,
        }
    }
}

/// Contadores de un lote: total recibido, éxitos y fallos.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    #[serde(default)]
    pub request_id: String,
}

impl BatchSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            request_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// Fallback todo-o-nada cuando falla la escritura del lote.
    pub fn mark_all_failed(&mut self) {
        self.success = 0;
        self.failure = self.total;
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lote {}: {} elementos, {} correctos, {} fallidos.",
            self.request_id, self.total, self.success, self.failure
        )
    }
}
