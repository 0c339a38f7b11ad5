use std::sync::{Arc, Mutex};
use neo4rs::Graph;
use tokio::sync::oneshot;
use crate::{
    config::AppConfig,
    llm::TextGenerator,
    models::BatchSummary,
    neo4j_client::Neo4jStore,
    notification::NotificationSink,
    vector_store::CategoryIndex,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub graph: Arc<Graph>,
    pub generator: Arc<dyn TextGenerator>,
    pub store: Arc<Neo4jStore>,
    pub category_index: Arc<CategoryIndex>,
    pub notifier: Arc<dyn NotificationSink>,
    pub status: Arc<Mutex<Status>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub last_summary: Option<BatchSummary>,
}
