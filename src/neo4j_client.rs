//! Conexión a Neo4j, esquema y persistencia del feedback etiquetado.
//!
//! Grafo usado:
//!   (:Feedback)-[:TAGGED_AS]->(:Tag)
//!   (:Category {name, embedding, deleted})

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph, Txn};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use url::Url;

use crate::{
    batch::FeedbackStore,
    config::AppConfig,
    llm::TextEmbedder,
    models::{CategorySet, FeedbackRecord},
};

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Etiquetas como nodos `:Tag` y no `:Category`: una corrección manual puede
/// traer etiquetas que no están en el vocabulario.
const SAVE_FEEDBACK: &str = "CREATE (f:Feedback {
    id: $id, ref_id: $ref_id, execution_id: $execution_id,
    feedback: $feedback, title: $title, store: $store, stars: $stars,
    product_name: $product_name, create_date: $create_date,
    label_llm: $label_llm, created_at: datetime()
 })
 WITH f
 UNWIND $tags AS tag
 MERGE (t:Tag {name: tag})
 MERGE (f)-[:TAGGED_AS]->(t)";

const RELABEL_FEEDBACK: &str = "MATCH (f:Feedback {id: $id})
 SET f.label_correction = $raw
 WITH f
 OPTIONAL MATCH (f)-[r:TAGGED_AS]->(:Tag)
 DELETE r
 WITH DISTINCT f
 UNWIND $tags AS tag
 MERGE (t:Tag {name: tag})
 MERGE (f)-[:TAGGED_AS]->(t)";

/// Crea constraints básicos para :Feedback, :Tag y :Category.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        "CREATE CONSTRAINT feedback_id IF NOT EXISTS
         FOR (f:Feedback)
         REQUIRE f.id IS UNIQUE",
        "CREATE CONSTRAINT tag_name IF NOT EXISTS
         FOR (t:Tag)
         REQUIRE t.name IS UNIQUE",
        "CREATE CONSTRAINT category_name IF NOT EXISTS
         FOR (c:Category)
         REQUIRE c.name IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}

/// Número de feedbacks de una ejecución agrupados por su cadena de etiquetas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub label: String,
    pub count: i64,
}

/// Corrección manual de las etiquetas de un feedback ya persistido.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelCorrection {
    pub id: String,
    #[serde(default)]
    pub label_correction: String,
}

/// Cambios necesarios para que el vocabulario persistido coincida con `desired`.
#[derive(Debug, Default, PartialEq)]
pub struct CategorySyncPlan {
    pub to_delete: Vec<String>,
    pub to_revive: Vec<String>,
    pub to_insert: Vec<String>,
}

/// `existing` es nombre -> borrada.
pub fn plan_category_sync(existing: &HashMap<String, bool>, desired: &[String]) -> CategorySyncPlan {
    let wanted = CategorySet::new(desired.iter().map(|n| n.trim()).filter(|n| !n.is_empty()));
    let mut plan = CategorySyncPlan::default();

    let mut current: Vec<_> = existing.iter().collect();
    current.sort();
    for (name, deleted) in current {
        if !*deleted && !wanted.contains(name) {
            plan.to_delete.push(name.clone());
        }
    }

    for name in wanted.names() {
        match existing.get(name) {
            Some(true) => plan.to_revive.push(name.clone()),
            Some(false) => {}
            None => plan.to_insert.push(name.clone()),
        }
    }

    plan
}

/// Separa una corrección `"a, b"` en etiquetas limpias.
pub fn split_labels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
pub struct Neo4jStore {
    graph: Arc<Graph>,
    embedder: Arc<dyn TextEmbedder>,
}

impl Neo4jStore {
    pub fn new(graph: Arc<Graph>, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self { graph, embedder }
    }

    /// Sincroniza el vocabulario: marca como borradas las categorías que ya no
    /// figuran, recupera las borradas que vuelven e inserta las nuevas con su embedding.
    pub async fn sync_categories(&self, names: &[String]) -> Result<String> {
        if names.iter().all(|n| n.trim().is_empty()) {
            return Err(anyhow!("La lista de categorías está vacía"));
        }

        let mut cursor = self
            .graph
            .execute(query("MATCH (c:Category) RETURN c.name AS name, c.deleted AS deleted"))
            .await?;
        let mut existing = HashMap::new();
        while let Some(row) = cursor.next().await? {
            let name: String = row.get("name").ok_or_else(|| anyhow!("Falta campo 'name' en resultado de Neo4j"))?;
            let deleted: bool = row.get("deleted").unwrap_or(false);
            existing.insert(name, deleted);
        }

        let plan = plan_category_sync(&existing, names);

        // Los embeddings se calculan antes de abrir la transacción.
        let mut vectors = Vec::with_capacity(plan.to_insert.len());
        for name in &plan.to_insert {
            vectors.push((name.clone(), self.embedder.embed(name).await?));
        }

        let tx = self.graph.start_txn().await?;
        let result = async {
            if !plan.to_delete.is_empty() {
                info!("Categorías a borrar: {:?}", plan.to_delete);
                tx.run(
                    query("MATCH (c:Category) WHERE c.name IN $names SET c.deleted = true, c.updated_at = datetime()")
                        .param("names", plan.to_delete.clone()),
                )
                .await?;
            }
            if !plan.to_revive.is_empty() {
                info!("Categorías recuperadas: {:?}", plan.to_revive);
                tx.run(
                    query("MATCH (c:Category) WHERE c.name IN $names SET c.deleted = false, c.updated_at = datetime()")
                        .param("names", plan.to_revive.clone()),
                )
                .await?;
            }
            for (name, vector) in &vectors {
                info!("Nueva categoría: {name}");
                tx.run(
                    query("CREATE (c:Category {name: $name, embedding: $embedding, deleted: false, updated_at: datetime()})")
                        .param("name", name.clone())
                        .param("embedding", vector.clone()),
                )
                .await?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;
        finish(tx, result).await?;

        let mut message = String::new();
        if !plan.to_delete.is_empty() {
            message.push_str(&format!(
                "{} categories are marked as deleted and ",
                plan.to_delete.len()
            ));
        }
        message.push_str(&format!(
            "{} items got inserted",
            plan.to_revive.len() + plan.to_insert.len()
        ));
        Ok(message)
    }

    /// Reemplaza las etiquetas de los feedbacks indicados. Devuelve cuántos se actualizaron.
    pub async fn apply_label_corrections(&self, corrections: &[LabelCorrection]) -> Result<usize> {
        let pending: Vec<_> = corrections
            .iter()
            .filter(|c| !c.id.trim().is_empty() && !c.label_correction.trim().is_empty())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let tx = self.graph.start_txn().await?;
        let result = async {
            for correction in &pending {
                tx.run(
                    query(RELABEL_FEEDBACK)
                        .param("id", correction.id.trim().to_string())
                        .param("raw", correction.label_correction.clone())
                        .param("tags", split_labels(&correction.label_correction)),
                )
                .await?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;
        finish(tx, result).await?;

        info!("{} feedbacks actualizados con nuevas etiquetas", pending.len());
        Ok(pending.len())
    }
}

/// Confirma la transacción o la deshace si hubo un error.
async fn finish(tx: Txn, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!("Error deshaciendo la transacción: {rollback_err}");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl FeedbackStore for Neo4jStore {
    async fn load_categories(&self) -> Result<CategorySet> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (c:Category) WHERE c.deleted = false RETURN c.name AS name ORDER BY name",
            ))
            .await?;

        let mut names = Vec::new();
        while let Some(row) = cursor.next().await? {
            if let Some(name) = row.get::<String>("name") {
                names.push(name);
            }
        }
        Ok(CategorySet::new(names))
    }

    async fn save_batch(&self, records: &[FeedbackRecord]) -> Result<()> {
        let tx = self.graph.start_txn().await?;
        let result = async {
            for record in records {
                tx.run(
                    query(SAVE_FEEDBACK)
                        .param("id", record.id.clone())
                        .param("ref_id", record.ref_id.clone())
                        .param("execution_id", record.execution_id.clone())
                        .param("feedback", record.feedback.clone())
                        .param("title", record.title.clone())
                        .param("store", record.store.clone())
                        .param("stars", record.stars.clone())
                        .param("product_name", record.product_name.clone())
                        .param("create_date", record.create_date.clone().unwrap_or_default())
                        .param("label_llm", record.tags.joined())
                        .param("tags", record.tags.tags().to_vec()),
                )
                .await?;
                info!("Feedback {} creado con etiquetas '{}'", record.id, record.tags.joined());
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        finish(tx, result).await
    }

    async fn top_categories(&self, execution_id: &str) -> Result<Vec<CategoryCount>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (f:Feedback {execution_id: $execution_id})
                     RETURN f.label_llm AS label, count(*) AS category_count
                     ORDER BY category_count DESC
                     LIMIT 3",
                )
                .param("execution_id", execution_id.to_string()),
            )
            .await?;

        let mut top = Vec::new();
        while let Some(row) = cursor.next().await? {
            let label: String = row.get("label").unwrap_or_default();
            let count: i64 = row.get("category_count").ok_or_else(|| anyhow!("Falta campo 'category_count' en resultado de Neo4j"))?;
            top.push(CategoryCount { label, count });
        }
        Ok(top)
    }
}
