//! Integración con Neo4j como vector store para los nodos `:Category`.
//!
//! API pública:
//!   - `ensure_category_vector_index(&Graph, usize)`
//!   - `CategoryIndex`, la búsqueda por similitud usada por el reconciliador.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{error, info};

use crate::{
    error::TagError,
    llm::TextEmbedder,
    models::{SimilarityMatch, SIMILARITY_DISTANCE_THRESHOLD, TAG_UNKNOWN},
    reconciler::SimilarityLookup,
};

pub const CATEGORY_INDEX_NAME: &str = "categoryEmbeddingIndex";

/// Garantiza que el índice vectorial sobre `:Category(embedding)` exista.
pub async fn ensure_category_vector_index(graph: &Graph, dimensions: usize) -> Result<()> {
    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", CATEGORY_INDEX_NAME),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{CATEGORY_INDEX_NAME}' ya existe.");
        return Ok(());
    }

    let cypher = format!(
        "\
CREATE VECTOR INDEX {index_name}
FOR (c:Category)
ON (c.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}",
        index_name = CATEGORY_INDEX_NAME,
        dimensions = dimensions
    );

    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{CATEGORY_INDEX_NAME}' creado ({dimensions} dimensiones).");

    Ok(())
}

/// Neo4j devuelve para coseno `score = (1 + cos) / 2`; la distancia es `1 - cos`.
pub fn cosine_score_to_distance(score: f64) -> f64 {
    (2.0 * (1.0 - score)).max(0.0)
}

/// Número de vecinos a pedir al índice. El filtro de borradas se aplica
/// después del índice, así que se pide el vocabulario completo (borradas
/// incluidas) para no perder una categoría activa detrás de varias borradas.
pub fn neighbour_count(total_categories: i64) -> i64 {
    total_categories.max(1)
}

/// Consulta del vecino activo más cercano a un embedding.
#[async_trait]
pub trait CategoryNeighbours: Send + Sync {
    /// Nombre de la categoría no borrada más cercana y su score coseno de Neo4j.
    async fn closest_active(&self, embedding: Vec<f64>) -> Result<Option<(String, f64)>>;
}

pub struct Neo4jCategoryNeighbours {
    graph: Arc<Graph>,
}

impl Neo4jCategoryNeighbours {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    async fn category_total(&self) -> Result<i64> {
        let mut cursor = self
            .graph
            .execute(query("MATCH (c:Category) RETURN count(c) AS total"))
            .await?;
        let row = cursor
            .next()
            .await?
            .ok_or_else(|| anyhow!("count(c) no devolvió filas"))?;
        row.get("total").ok_or_else(|| anyhow!("Falta campo 'total' en resultado de Neo4j"))
    }
}

#[async_trait]
impl CategoryNeighbours for Neo4jCategoryNeighbours {
    async fn closest_active(&self, embedding: Vec<f64>) -> Result<Option<(String, f64)>> {
        let k = neighbour_count(self.category_total().await?);

        let mut cursor = self
            .graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     WHERE node.deleted = false
                     RETURN node.name AS name, score
                     ORDER BY score DESC
                     LIMIT 1",
                )
                .param("index_name", CATEGORY_INDEX_NAME)
                .param("k", k)
                .param("embedding", embedding),
            )
            .await?;

        let Some(row) = cursor.next().await? else {
            return Ok(None);
        };
        let name: String = row.get("name").ok_or_else(|| anyhow!("Falta campo 'name' en resultado de Neo4j"))?;
        let score: f64 = row.get("score").ok_or_else(|| anyhow!("Falta campo 'score' en resultado de Neo4j"))?;
        Ok(Some((name, score)))
    }
}

/// Búsqueda de la categoría activa más cercana a un texto.
#[derive(Clone)]
pub struct CategoryIndex {
    neighbours: Arc<dyn CategoryNeighbours>,
    embedder: Arc<dyn TextEmbedder>,
}

impl CategoryIndex {
    pub fn new(neighbours: Arc<dyn CategoryNeighbours>, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self { neighbours, embedder }
    }

    async fn search(&self, text: &str) -> Result<Option<SimilarityMatch>> {
        // 1) Embedding del texto con el mismo modelo que las categorías
        let vector = self.embedder.embed(text).await?;

        // 2) Vecino más cercano entre las categorías no borradas
        let Some((name, score)) = self.neighbours.closest_active(vector).await? else {
            return Ok(None);
        };

        // 3) Aplicar el umbral de distancia
        let candidate = SimilarityMatch {
            category: name,
            distance: cosine_score_to_distance(score),
        };
        Ok(candidate.is_accepted().then_some(candidate))
    }
}

/// Cualquier fallo de la búsqueda se registra y cuenta como "sin coincidencia".
fn settle_lookup(text: &str, outcome: Result<Option<SimilarityMatch>>) -> Option<SimilarityMatch> {
    match outcome {
        Ok(Some(m)) => {
            info!("Término más similar para '{text}': {} (distancia {:.3})", m.category, m.distance);
            Some(m)
        }
        Ok(None) => {
            info!("Sin término similar para '{text}' por debajo de {SIMILARITY_DISTANCE_THRESHOLD}");
            None
        }
        Err(e) => {
            let err = TagError::SimilarityLookup(e.to_string());
            error!("'{text}' se trata como {TAG_UNKNOWN}: {err}");
            None
        }
    }
}

#[async_trait]
impl SimilarityLookup for CategoryIndex {
    async fn nearest(&self, text: &str) -> Option<SimilarityMatch> {
        settle_lookup(text, self.search(text).await)
    }
}
