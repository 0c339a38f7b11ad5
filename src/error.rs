//! Taxonomía de errores del clasificador y del reconciliador de etiquetas.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TagError {
    /// Feedback ausente, vacío o con un tipo que no es texto.
    #[error("Entrada inválida: {0}")]
    InvalidInput(String),

    /// Falta la configuración del modelo de generación.
    #[error("Error de configuración: {0}")]
    Configuration(String),

    /// Sólo se admite la familia de modelos de Anthropic.
    #[error("Modelo no soportado '{0}': sólo se admiten modelos de Anthropic")]
    UnsupportedModel(String),

    /// La respuesta del modelo no contiene el par de delimitadores esperado.
    #[error("Respuesta del modelo mal formada: {0}")]
    MalformedModelResponse(String),

    /// Red, timeout o throttling del servicio de generación. No se reintenta aquí.
    #[error("Error de transporte con el servicio de generación: {0}")]
    Transport(String),

    #[error("Error en la búsqueda por similitud: {0}")]
    SimilarityLookup(String),

    #[error("Error de persistencia: {0}")]
    Persistence(String),
}

impl TagError {
    /// Errores tras los cuales ningún elemento del lote puede tener éxito.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::UnsupportedModel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_level_errors_are_fatal() {
        assert!(TagError::Configuration("x".into()).is_fatal());
        assert!(TagError::UnsupportedModel("meta.llama3".into()).is_fatal());
        assert!(!TagError::InvalidInput("x".into()).is_fatal());
        assert!(!TagError::MalformedModelResponse("x".into()).is_fatal());
        assert!(!TagError::Transport("x".into()).is_fatal());
        assert!(!TagError::Persistence("x".into()).is_fatal());
    }
}
