//! Reconciliación de las etiquetas candidatas contra el vocabulario vigente.
//!
//! Para cada candidata, en orden:
//!   - si pertenece al vocabulario, se acepta tal cual;
//!   - si es el centinela `unknown`, se descarta;
//!   - en otro caso se busca la categoría más cercana por similitud vectorial
//!     y se acepta si su distancia queda por debajo de 0.4.

use async_trait::async_trait;
use tracing::info;

use crate::models::{CategorySet, ReconciledTagSet, SimilarityMatch, TAG_UNKNOWN};

/// Búsqueda de la categoría más cercana a un texto libre.
///
/// Cualquier error interno (embedding, base de datos) se resuelve dentro de la
/// implementación como `None`: la búsqueda nunca aborta un elemento.
#[async_trait]
pub trait SimilarityLookup: Send + Sync {
    async fn nearest(&self, text: &str) -> Option<SimilarityMatch>;
}

pub async fn reconcile<L>(
    candidate_tags: &[String],
    allowed_categories: &CategorySet,
    lookup: &L,
) -> ReconciledTagSet
where
    L: SimilarityLookup + ?Sized,
{
    let mut accepted = ReconciledTagSet::default();
    // El texto buscado es siempre el mismo, así que basta con una consulta por elemento.
    let mut fallback: Option<Option<SimilarityMatch>> = None;

    for tag in candidate_tags {
        if allowed_categories.contains(tag) {
            accepted.insert(tag);
            continue;
        }
        if tag == TAG_UNKNOWN {
            continue;
        }

        // La búsqueda usa siempre la primera candidata de la lista, no `tag`.
        let query = &candidate_tags[0];
        if fallback.is_none() {
            fallback = Some(lookup.nearest(query).await);
        }

        match fallback.as_ref().and_then(Option::as_ref) {
            Some(m) if m.is_accepted() && allowed_categories.contains(&m.category) => {
                info!("'{tag}' reconciliada con '{}' (distancia {:.3})", m.category, m.distance);
                accepted.insert(&m.category);
            }
            _ => info!("'{tag}' sin categoría similar; se registra como {TAG_UNKNOWN}"),
        }
    }

    accepted
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Búsqueda determinista en memoria que registra los textos consultados.
    #[derive(Default)]
    pub(crate) struct FakeLookup {
        matches: HashMap<String, SimilarityMatch>,
        pub queries: Mutex<Vec<String>>,
    }

    impl FakeLookup {
        pub(crate) fn with(mut self, text: &str, category: &str, distance: f64) -> Self {
            self.matches.insert(
                text.to_string(),
                SimilarityMatch { category: category.to_string(), distance },
            );
            self
        }

        pub(crate) fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SimilarityLookup for FakeLookup {
        async fn nearest(&self, text: &str) -> Option<SimilarityMatch> {
            self.queries.lock().unwrap().push(text.to_string());
            self.matches.get(text).filter(|m| m.is_accepted()).cloned()
        }
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn run(candidates: &[&str], allowed: &CategorySet, lookup: &FakeLookup) -> Vec<String> {
        tokio_test::block_on(reconcile(&tags(candidates), allowed, lookup))
            .tags()
            .to_vec()
    }

    #[test]
    fn known_tag_passes_without_lookup() {
        let allowed = CategorySet::new(["Shipping Issue", "Billing"]);
        let lookup = FakeLookup::default();

        assert_eq!(run(&["Shipping Issue"], &allowed, &lookup), vec!["Shipping Issue"]);
        assert!(lookup.queries().is_empty());
    }

    #[test]
    fn sentinel_contributes_nothing() {
        let allowed = CategorySet::new(["Shipping Issue"]);
        let lookup = FakeLookup::default();

        assert!(run(&["unknown"], &allowed, &lookup).is_empty());
        assert!(lookup.queries().is_empty());
    }

    #[test]
    fn unknown_tag_resolved_by_nearest_category() {
        let allowed = CategorySet::new(["Shipping Issue"]);
        let lookup = FakeLookup::default().with("Weird Tag", "Shipping Issue", 0.2);

        assert_eq!(run(&["Weird Tag"], &allowed, &lookup), vec!["Shipping Issue"]);
        assert_eq!(lookup.queries(), vec!["Weird Tag"]);
    }

    #[test]
    fn unknown_tag_without_close_match_is_dropped() {
        let allowed = CategorySet::new(["Shipping Issue"]);
        let far = FakeLookup::default().with("Weird Tag", "Shipping Issue", 0.4);
        let empty = FakeLookup::default();

        assert!(run(&["Weird Tag"], &allowed, &far).is_empty());
        assert!(run(&["Weird Tag"], &allowed, &empty).is_empty());
    }

    #[test]
    fn lookup_always_queries_first_candidate() {
        let allowed = CategorySet::new(["Billing", "Shipping Issue"]);
        let lookup = FakeLookup::default()
            .with("Billing", "Billing", 0.0)
            .with("Late Parcel", "Shipping Issue", 0.1);

        let accepted = run(&["Billing", "Late Parcel"], &allowed, &lookup);

        assert_eq!(accepted, vec!["Billing"]);
        assert_eq!(lookup.queries(), vec!["Billing"]);
    }

    #[test]
    fn matches_are_deduplicated_and_looked_up_once() {
        let allowed = CategorySet::new(["Shipping Issue"]);
        let lookup = FakeLookup::default().with("Late", "Shipping Issue", 0.1);

        let accepted = run(&["Late", "Slow", "Shipping Issue"], &allowed, &lookup);

        assert_eq!(accepted, vec!["Shipping Issue"]);
        assert_eq!(lookup.queries().len(), 1);
    }

    #[test]
    fn match_outside_vocabulary_is_ignored() {
        let allowed = CategorySet::new(["Billing"]);
        let lookup = FakeLookup::default().with("Weird Tag", "Retired Category", 0.05);

        assert!(run(&["Weird Tag"], &allowed, &lookup).is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let allowed = CategorySet::new(["Billing", "Shipping Issue"]);
        let lookup = FakeLookup::default().with("Weird Tag", "Billing", 0.3);
        let candidates = ["Weird Tag", "unknown", "Shipping Issue"];

        let first = run(&candidates, &allowed, &lookup);
        let second = run(&candidates, &allowed, &lookup);

        assert_eq!(first, second);
        assert_eq!(first, vec!["Billing", "Shipping Issue"]);
    }

    #[test]
    fn empty_candidates_yield_empty_set() {
        let allowed = CategorySet::new(["Billing"]);
        let lookup = FakeLookup::default();
        assert!(run(&[], &allowed, &lookup).is_empty());
    }
}
