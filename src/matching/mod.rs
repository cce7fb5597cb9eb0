//! Relevance matching between customer documents and generation templates.
//!
//! The rule-based scorer is the baseline. When a generator is available, an
//! AI re-ranking pass runs under a fixed timeout; if it times out or replies
//! with anything unusable, the rule-based results stand for every document.
//! Fresh rankings are written back to each document's relevance cache.

pub mod cache;
pub mod rerank;
pub mod scorer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ai::TextGenerator;
use crate::config::MatchingConfig;
use crate::schema::{DocumentMetadata, MatchResult, TemplateMetadata, TemplateRelevance};
use crate::store::{MetadataStore, StoreError};
use cache::RelevanceCache;
pub use scorer::{score, ScoreBreakdown};

pub struct MatchingEngine {
    cache: RelevanceCache,
    ai_timeout: Duration,
    ai_shortlist: usize,
    store: Option<Arc<dyn MetadataStore>>,
}

impl MatchingEngine {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            cache: RelevanceCache::new(config.cache_ttl(), config.cache_capacity),
            ai_timeout: config.ai_timeout(),
            ai_shortlist: config.ai_shortlist.max(1),
            store: None,
        }
    }

    /// Persist every freshly computed ranking into `store`.
    pub fn with_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Rank `docs` against `template`, best first (ties by filename).
    ///
    /// A cache hit returns the stored ranking without scoring or calling `ai`.
    pub async fn build_matching_context(
        &self,
        template: &TemplateMetadata,
        docs: &[DocumentMetadata],
        ai: Option<&dyn TextGenerator>,
    ) -> Vec<MatchResult> {
        let key = RelevanceCache::key(&template.template_slug, docs);
        if let Some(hit) = self.cache.get(&key) {
            debug!(
                template = %template.template_slug,
                "Relevance cache hit ({} documents)",
                hit.len()
            );
            return hit;
        }

        let mut results: Vec<MatchResult> = docs
            .iter()
            .map(|d| score(template, d).into_match(&template.template_slug, &d.filename))
            .collect();
        sort_ranked(&mut results);

        if let Some(ai) = ai.filter(|_| !docs.is_empty()) {
            self.apply_ai_scores(ai, template, docs, &mut results).await;
        }

        self.cache.insert(key, results.clone());
        debug!(
            "Relevance cache holds {} rankings",
            self.cache.entry_count()
        );
        self.record(template, docs, &results).await;
        results
    }

    /// Write results into each document's relevance cache (last write wins).
    /// Unchanged entries are not rewritten and failures are only logged.
    async fn record(
        &self,
        template: &TemplateMetadata,
        docs: &[DocumentMetadata],
        results: &[MatchResult],
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let by_name: HashMap<&str, &DocumentMetadata> =
            docs.iter().map(|d| (d.filename.as_str(), d)).collect();

        let mut written = 0;
        for result in results {
            let Some(doc) = by_name.get(result.filename.as_str()) else {
                continue;
            };
            let entry = TemplateRelevance {
                template_slug: template.template_slug.clone(),
                score: result.relevance_score,
                reasoning: result.reasoning.clone(),
            };
            if doc.relevance_for(&template.template_slug).as_ref() == Some(&entry) {
                continue;
            }
            match store
                .save_template_relevance(doc.customer_id, &doc.filename, entry)
                .await
            {
                Ok(()) => written += 1,
                Err(StoreError::NotFound { .. }) => debug!(
                    filename = %doc.filename,
                    "Document removed before its relevance was saved"
                ),
                Err(e) => warn!(
                    template = %template.template_slug,
                    filename = %doc.filename,
                    "Could not save relevance: {}",
                    e
                ),
            }
        }
        if written > 0 {
            debug!(
                template = %template.template_slug,
                "Saved relevance for {} documents",
                written
            );
        }
    }

    /// Replace rule-based entries with AI entries for the documents the model
    /// scored. Leaves `results` untouched on timeout or failure.
    async fn apply_ai_scores(
        &self,
        ai: &dyn TextGenerator,
        template: &TemplateMetadata,
        docs: &[DocumentMetadata],
        results: &mut [MatchResult],
    ) {
        // Shortlist the strongest rule-based candidates.
        let by_name: HashMap<&str, &DocumentMetadata> =
            docs.iter().map(|d| (d.filename.as_str(), d)).collect();
        let shortlist: Vec<&DocumentMetadata> = results
            .iter()
            .take(self.ai_shortlist)
            .filter_map(|r| by_name.get(r.filename.as_str()).copied())
            .collect();

        let scores =
            match tokio::time::timeout(self.ai_timeout, rerank::rerank(ai, template, &shortlist))
                .await
            {
                Ok(Ok(scores)) => scores,
                Ok(Err(e)) => {
                    warn!(
                        template = %template.template_slug,
                        "AI ranking unusable, keeping rule-based scores: {:#}",
                        e
                    );
                    return;
                }
                Err(_) => {
                    warn!(
                        template = %template.template_slug,
                        "AI ranking timed out after {:?}, keeping rule-based scores",
                        self.ai_timeout
                    );
                    return;
                }
            };

        let ai_by_name: HashMap<&str, &rerank::AiScore> =
            scores.iter().map(|s| (s.filename.as_str(), s)).collect();
        for result in results.iter_mut() {
            if let Some(ai_score) = ai_by_name.get(result.filename.as_str()) {
                result.relevance_score = scorer::round_score(ai_score.score);
                if !ai_score.reasoning.is_empty() {
                    result.reasoning = ai_score.reasoning.clone();
                }
            }
        }
        sort_ranked(results);
        info!(
            template = %template.template_slug,
            "AI ranking applied to {}/{} documents",
            ai_by_name.len(),
            results.len()
        );
    }
}

fn sort_ranked(results: &mut [MatchResult]) {
    results.sort_by(|a, b| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| a.filename.cmp(&b.filename))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::ScriptedGenerator;

    fn template() -> TemplateMetadata {
        let mut t = TemplateMetadata::new("sales", "Sales summary");
        t.required_data_types = vec!["orders".into(), "revenue".into()];
        t.has_tables = true;
        t
    }

    fn corpus(n: usize) -> Vec<DocumentMetadata> {
        (0..n)
            .map(|i| {
                let mut d = DocumentMetadata::new(7, format!("doc-{:02}.csv", i));
                if i % 2 == 0 {
                    d.data_categories = vec!["orders".into()];
                }
                if i % 3 == 0 {
                    d.data_categories.push("revenue".into());
                }
                d.has_tables = i % 5 == 0;
                d
            })
            .collect()
    }

    fn engine() -> MatchingEngine {
        MatchingEngine::new(&MatchingConfig::default())
    }

    #[tokio::test]
    async fn test_rule_based_ranking_order() {
        let docs = corpus(6);
        let results = engine().build_matching_context(&template(), &docs, None).await;
        let ranked: Vec<(&str, f64)> = results
            .iter()
            .map(|r| (r.filename.as_str(), r.relevance_score))
            .collect();
        assert_eq!(
            ranked,
            vec![
                ("doc-00.csv", 4.5),
                ("doc-02.csv", 2.0),
                ("doc-03.csv", 2.0),
                ("doc-04.csv", 2.0),
                ("doc-05.csv", 0.5),
                ("doc-01.csv", 0.0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ai_timeout_falls_back_for_all_documents() {
        let docs = corpus(25);
        let baseline = engine().build_matching_context(&template(), &docs, None).await;

        let slow = ScriptedGenerator::new(vec![Ok(
            r#"[{"filename": "doc-01.csv", "score": 10, "reasoning": "late"}]"#.to_string(),
        )])
        .delayed(Duration::from_secs(30));
        let results = engine()
            .build_matching_context(&template(), &docs, Some(&slow))
            .await;

        assert_eq!(slow.calls(), 1);
        assert_eq!(results, baseline);
        assert_eq!(results.len(), 25);
    }

    #[tokio::test]
    async fn test_ai_scores_replace_whole_entries() {
        let docs = corpus(3);
        let ai = ScriptedGenerator::new(vec![Ok(r#"[
            {"filename": "doc-01.csv", "score": 9.26, "reasoning": "Order history matches"}
        ]"#
        .to_string())]);
        let results = engine()
            .build_matching_context(&template(), &docs, Some(&ai))
            .await;

        assert_eq!(results[0].filename, "doc-01.csv");
        assert_eq!(results[0].relevance_score, 9.3);
        assert_eq!(results[0].reasoning, "Order history matches");
        // Unscored documents keep their rule-based entry untouched
        let rule = score(&template(), &docs[0]);
        let doc0 = results.iter().find(|r| r.filename == "doc-00.csv").unwrap();
        assert_eq!(doc0.relevance_score, rule.score);
        assert_eq!(doc0.reasoning, rule.reasons.join("; "));
    }

    #[tokio::test]
    async fn test_malformed_ai_reply_falls_back() {
        let docs = corpus(4);
        let baseline = engine().build_matching_context(&template(), &docs, None).await;
        let ai = ScriptedGenerator::new(vec![Ok("Sorry, no ranking today.".to_string())]);
        let results = engine()
            .build_matching_context(&template(), &docs, Some(&ai))
            .await;
        assert_eq!(results, baseline);
    }

    #[tokio::test]
    async fn test_fresh_rankings_are_persisted() {
        let store = Arc::new(MemoryStore::new());
        let docs = corpus(3);
        for doc in &docs[..2] {
            store.upsert_document(doc).await.unwrap();
        }
        let engine = engine().with_store(store.clone());

        let results = engine.build_matching_context(&template(), &docs, None).await;

        let saved = store.get_document(7, "doc-00.csv").await.unwrap().unwrap();
        let relevance = saved.relevance_for("sales").unwrap();
        assert_eq!(relevance.score, results[0].relevance_score);
        assert_eq!(relevance.reasoning, results[0].reasoning);
        assert!(store
            .get_document(7, "doc-01.csv")
            .await
            .unwrap()
            .unwrap()
            .relevance_for("sales")
            .is_some());
        // Not in the store: skipped without failing the ranking
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_ai() {
        let docs = corpus(4);
        let engine = engine();
        let ai = ScriptedGenerator::new(vec![Ok(
            r#"[{"filename": "doc-03.csv", "score": 8, "reasoning": "fits"}]"#.to_string(),
        )]);

        let first = engine
            .build_matching_context(&template(), &docs, Some(&ai))
            .await;
        let mut reversed = docs.clone();
        reversed.reverse();
        let second = engine
            .build_matching_context(&template(), &reversed, Some(&ai))
            .await;

        assert_eq!(ai.calls(), 1);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
