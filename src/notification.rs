//! Agregación de los lotes de una ejecución y preparación del aviso final.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{batch::FeedbackStore, models::BatchSummary, neo4j_client::CategoryCount};

/// Totales de una ejecución completa más sus categorías más frecuentes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub categories: Vec<CategoryCount>,
}

/// Resultado que llega a la fase de aviso: un error aguas arriba o el informe.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Failed {
        #[serde(rename = "Error")]
        error: String,
        #[serde(rename = "Cause", default)]
        cause: String,
    },
    Completed(RunReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub state: bool,
    pub subject: String,
    pub message: String,
}

/// Suma los contadores de todos los lotes y adjunta las tres etiquetas más frecuentes.
/// Si la consulta de categorías falla, el informe sale sin ellas.
pub async fn aggregate_run(
    store: &dyn FeedbackStore,
    execution_name: &str,
    batches: &[BatchSummary],
) -> Result<RunReport> {
    if execution_name.trim().is_empty() || batches.is_empty() {
        return Err(anyhow!("Faltan datos en la petición: resultados de lotes o nombre de ejecución"));
    }
    info!("Agregando {} lotes de la ejecución {execution_name}", batches.len());

    let categories = match store.top_categories(execution_name).await {
        Ok(top) => top,
        Err(e) => {
            error!("Falló la consulta de categorías: {e}");
            Vec::new()
        }
    };

    Ok(RunReport {
        total: batches.iter().map(|b| b.total).sum(),
        success: batches.iter().map(|b| b.success).sum(),
        failure: batches.iter().map(|b| b.failure).sum(),
        message: String::new(),
        categories,
    })
}

pub fn prepare_notification(execution_name: &str, outcome: &RunOutcome, threshold: f64) -> Notification {
    let failed_subject = format!("Task failed for execution {execution_name}");

    let report = match outcome {
        RunOutcome::Failed { error, cause } => {
            let detail = upstream_error_message(error, cause);
            return Notification {
                state: false,
                subject: failed_subject,
                message: format!("Your job has some errors due to:\n {detail}"),
            };
        }
        RunOutcome::Completed(report) => report,
    };

    let failure_ratio = if report.total == 0 {
        0.0
    } else {
        report.failure as f64 / report.total as f64
    };
    let state = failure_ratio <= threshold;

    let mut message = format!(
        "Your job has {}. Here is the statistics.\n- Total: {}\n- Success: {}\n- Failure: {}\n",
        if state { "been successfully finished" } else { "some errors" },
        report.total,
        report.success,
        report.failure
    );
    if !state {
        message.push_str("Please check the service logs for error message details\n");
    }
    message.push('\n');
    message.push_str(&report.message);
    if !report.categories.is_empty() {
        message.push_str("\nCategories:\n");
        for c in &report.categories {
            message.push_str(&format!("- {:<16}{}\n", c.label, c.count));
        }
    }

    Notification {
        state,
        subject: if state {
            format!("Task Done for execution {execution_name}")
        } else {
            failed_subject
        },
        message,
    }
}

/// `Cause` puede ser un JSON con `errorMessage`; si no, se usa tal cual.
fn upstream_error_message(error: &str, cause: &str) -> String {
    if cause.is_empty() {
        return error.to_string();
    }
    match serde_json::from_str::<serde_json::Value>(cause) {
        Ok(value) => value
            .get("errorMessage")
            .and_then(|m| m.as_str())
            .unwrap_or(cause)
            .to_string(),
        Err(e) => {
            error!("No se pudo decodificar el JSON de 'Cause': {e}; se usa el texto original");
            cause.to_string()
        }
    }
}

// ---------------------------------------------------------------------
// DESTINOS DEL AVISO
// ---------------------------------------------------------------------

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<()>;
}

/// Sólo deja el aviso en el log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, notification: &Notification) -> Result<()> {
        info!("Aviso enviado: {} - {}", notification.subject, notification.message);
        Ok(())
    }
}

/// Publica el aviso como JSON en un webhook.
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn publish(&self, notification: &Notification) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&json!({
                "subject": notification.subject,
                "message": notification.message,
                "state": notification.state,
            }))
            .send()
            .await?
            .error_for_status()?;
        info!("Aviso enviado al webhook: {}", notification.subject);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::MemoryStore;

    fn report(total: usize, success: usize, failure: usize) -> RunReport {
        RunReport { total, success, failure, ..Default::default() }
    }

    fn batch(total: usize, success: usize, failure: usize) -> BatchSummary {
        BatchSummary { total, success, failure, request_id: String::new() }
    }

    #[tokio::test]
    async fn aggregation_sums_batches_and_attaches_top_categories() {
        let store = MemoryStore {
            top: vec![CategoryCount { label: "Billing".into(), count: 7 }],
            ..Default::default()
        };

        let run = aggregate_run(&store, "exec-1", &[batch(5, 4, 1), batch(3, 0, 3)])
            .await
            .unwrap();

        assert_eq!((run.total, run.success, run.failure), (8, 4, 4));
        assert_eq!(run.categories.len(), 1);
    }

    #[tokio::test]
    async fn aggregation_requires_execution_and_batches() {
        let store = MemoryStore::default();
        assert!(aggregate_run(&store, "", &[batch(1, 1, 0)]).await.is_err());
        assert!(aggregate_run(&store, "exec-1", &[]).await.is_err());
    }

    #[test]
    fn run_within_threshold_is_done() {
        let mut run = report(10, 9, 1);
        run.categories = vec![CategoryCount { label: "Billing".into(), count: 6 }];

        let n = prepare_notification("exec-1", &RunOutcome::Completed(run), 0.2);

        assert!(n.state);
        assert_eq!(n.subject, "Task Done for execution exec-1");
        assert!(n.message.contains("- Total: 10\n- Success: 9\n- Failure: 1\n"));
        assert!(n.message.contains("\nCategories:\n- Billing         6\n"));
        assert!(!n.message.contains("check the service logs"));
    }

    #[test]
    fn run_above_threshold_is_failed() {
        let n = prepare_notification("exec-1", &RunOutcome::Completed(report(5, 0, 5)), 0.2);

        assert!(!n.state);
        assert_eq!(n.subject, "Task failed for execution exec-1");
        assert!(n.message.starts_with("Your job has some errors."));
        assert!(n.message.contains("check the service logs"));
    }

    #[test]
    fn empty_run_counts_as_success() {
        let n = prepare_notification("exec-1", &RunOutcome::Completed(report(0, 0, 0)), 0.2);
        assert!(n.state);
    }

    #[test]
    fn upstream_error_uses_cause_error_message() {
        let outcome: RunOutcome = serde_json::from_value(serde_json::json!({
            "Error": "Exception",
            "Cause": "{\"errorMessage\": \"Invalid csv file\", \"errorType\": \"Exception\"}"
        }))
        .unwrap();

        let n = prepare_notification("exec-9", &outcome, 0.2);

        assert!(!n.state);
        assert_eq!(n.subject, "Task failed for execution exec-9");
        assert_eq!(n.message, "Your job has some errors due to:\n Invalid csv file");
    }

    #[test]
    fn upstream_error_with_plain_cause() {
        let outcome = RunOutcome::Failed { error: "States.Timeout".into(), cause: "timed out".into() };
        let n = prepare_notification("exec-9", &outcome, 0.2);
        assert!(n.message.ends_with("timed out"));
    }

    #[test]
    fn report_payload_deserializes_as_completed() {
        let outcome: RunOutcome = serde_json::from_value(serde_json::json!({
            "total": 2, "success": 2, "failure": 0, "message": "", "categories": []
        }))
        .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(r) if r.total == 2));
    }
}
