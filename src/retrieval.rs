//! Retrieval engine: vector, keyword, hybrid, and adaptive search over one
//! knowledge base's collection.
//!
//! - **Vector** — embed the query, similarity search with an optional score
//!   threshold.
//! - **Keyword** — tokenize the query (whitespace words plus Chinese 2/3-
//!   grams), scroll the collection's payload text, score chunks by tf·idf.
//! - **Hybrid** — run both with an internal candidate limit of `2×top_k`,
//!   min-max normalize each score list to `[0, 1]`, merge with the
//!   configured weights, deduplicate by chunk id keeping the higher score.
//! - **Adaptive** — when a thresholded search returns fewer than
//!   `adaptive_target_results` hits, retry with the threshold multiplied by
//!   0.7, clamped at `adaptive_min_threshold`, for a bounded number of
//!   attempts. The first attempt meeting the target wins, else the largest
//!   non-empty result.
//!
//! Hits are ordered by descending score; ties break on lower `chunk_index`,
//! then lower `id`, so a fixed corpus and query always produce the same
//! list.

use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{RetrievalConfig, RetrievalMode, ScoredPoint, SearchHit, VectorPoint};
use crate::vectorstore::{scroll_all, VectorStore};

/// Threshold reduction factor per adaptive attempt.
const ADAPTIVE_FACTOR: f32 = 0.7;
/// Total search attempts, the initial one included.
const ADAPTIVE_MAX_ATTEMPTS: u32 = 4;
/// Page size used when scrolling payloads for keyword scoring.
const SCROLL_PAGE: usize = 256;

pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Adaptive entry point used for every query.
    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        config: &RetrievalConfig,
    ) -> Result<Vec<SearchHit>> {
        let mut threshold = config.similarity_threshold;
        let mut results = self.search_once(collection, query, config, threshold).await?;

        // Similarity thresholds do not apply to tf-idf scores, so keyword
        // mode never benefits from lowering them.
        if config.mode == RetrievalMode::Fulltext {
            return Ok(results);
        }

        let mut attempts = 1;
        while results.len() < config.adaptive_target_results
            && attempts < ADAPTIVE_MAX_ATTEMPTS
            && threshold > config.adaptive_min_threshold
        {
            threshold = (threshold * ADAPTIVE_FACTOR).max(config.adaptive_min_threshold);
            attempts += 1;
            tracing::debug!(
                attempts,
                threshold,
                found = results.len(),
                target = config.adaptive_target_results,
                "adaptive retry with reduced threshold"
            );

            let retry = self.search_once(collection, query, config, threshold).await?;
            if retry.len() >= config.adaptive_target_results {
                return Ok(retry);
            }
            // Short of the target everywhere: keep the largest non-empty
            // result seen so far.
            if retry.len() > results.len() {
                results = retry;
            }
        }

        Ok(results)
    }

    /// One pass of the configured mode at the given threshold.
    async fn search_once(
        &self,
        collection: &str,
        query: &str,
        config: &RetrievalConfig,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        match config.mode {
            RetrievalMode::Vector => {
                self.vector_search(collection, query, config.top_k, Some(threshold))
                    .await
            }
            RetrievalMode::Fulltext => {
                self.keyword_search(collection, query, config.top_k).await
            }
            RetrievalMode::Hybrid => {
                self.hybrid_search(collection, query, config, threshold).await
            }
        }
    }

    async fn vector_search(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        let vector = self.embedder.embed_query(query).await?;
        let hits = self
            .store
            .search(collection, &vector, limit, threshold)
            .await?;
        let mut results: Vec<SearchHit> = hits.into_iter().map(hit_from_scored).collect();
        sort_hits(&mut results);
        Ok(results)
    }

    async fn keyword_search(
        &self,
        collection: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let points = scroll_all(self.store.as_ref(), collection, SCROLL_PAGE).await?;
        let mut results = score_by_terms(&points, &terms);
        sort_hits(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn hybrid_search(
        &self,
        collection: &str,
        query: &str,
        config: &RetrievalConfig,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let candidate_limit = config.top_k * 2;

        let vector_hits = self
            .vector_search(collection, query, candidate_limit, Some(threshold))
            .await?;
        let keyword_hits = self
            .keyword_search(collection, query, candidate_limit)
            .await?;

        let vector_norm = normalize_scores(&vector_hits);
        let keyword_norm = normalize_scores(&keyword_hits);

        struct Merged {
            hit: SearchHit,
            score: f32,
        }

        let mut merged: HashMap<String, Merged> = HashMap::new();
        for (hit, normalized) in vector_hits.iter().zip(&vector_norm) {
            let score = config.vector_weight * normalized;
            merged.insert(
                hit.id.clone(),
                Merged {
                    hit: hit.clone(),
                    score,
                },
            );
        }
        for (hit, normalized) in keyword_hits.iter().zip(&keyword_norm) {
            let contribution = config.keyword_weight * normalized;
            match merged.get_mut(&hit.id) {
                Some(existing) => existing.score += contribution,
                None => {
                    merged.insert(
                        hit.id.clone(),
                        Merged {
                            hit: hit.clone(),
                            score: contribution,
                        },
                    );
                }
            }
        }

        let mut results: Vec<SearchHit> = merged
            .into_values()
            .map(|m| {
                let mut hit = m.hit;
                hit.score = m.score;
                hit
            })
            .collect();
        sort_hits(&mut results);
        results.truncate(config.top_k);
        Ok(results)
    }
}

/// Prepend up to `max_expansions` synonym expansions to the query text.
/// The dictionary is caller-supplied and defaults to empty.
pub fn expand_query(
    query: &str,
    synonyms: &HashMap<String, Vec<String>>,
    max_expansions: usize,
) -> String {
    if synonyms.is_empty() || max_expansions == 0 {
        return query.to_string();
    }

    let mut expansions = Vec::new();
    for term in tokenize(query) {
        if let Some(alternatives) = synonyms.get(&term) {
            for alternative in alternatives {
                if expansions.len() >= max_expansions {
                    break;
                }
                if !expansions.contains(alternative) {
                    expansions.push(alternative.clone());
                }
            }
        }
    }

    if expansions.is_empty() {
        query.to_string()
    } else {
        format!("{} {}", expansions.join(" "), query)
    }
}

/// Break a query into search terms: lowercased alphanumeric words, plus
/// 2- and 3-grams over each run of Chinese characters.
pub fn tokenize(query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    let flush_word = |word: &mut String, terms: &mut Vec<String>| {
        if !word.is_empty() {
            terms.push(word.to_lowercase());
            word.clear();
        }
    };
    let flush_cjk = |run: &mut Vec<char>, terms: &mut Vec<String>| {
        match run.len() {
            0 => {}
            1 => terms.push(run[0].to_string()),
            len => {
                for n in 2..=3usize.min(len) {
                    for window in run.windows(n) {
                        terms.push(window.iter().collect());
                    }
                }
            }
        }
        run.clear();
    };

    for c in query.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            flush_word(&mut word, &mut terms);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut terms);
            word.push(c);
        } else {
            flush_word(&mut word, &mut terms);
            flush_cjk(&mut cjk_run, &mut terms);
        }
    }
    flush_word(&mut word, &mut terms);
    flush_cjk(&mut cjk_run, &mut terms);

    // A repeated word must not score twice per chunk; keep the first
    // occurrence of each term.
    let mut seen = std::collections::HashSet::new();
    terms.retain(|t| seen.insert(t.clone()));
    terms
}

/// tf·idf scoring over the scrolled payload set. idf is estimated lazily
/// from the set itself with `ln(1 + N/df)` smoothing so a term present in
/// every chunk still contributes.
fn score_by_terms(points: &[VectorPoint], terms: &[String]) -> Vec<SearchHit> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }

    let lowered: Vec<String> = points
        .iter()
        .map(|p| p.payload.text.to_lowercase())
        .collect();

    let mut idf: HashMap<&str, f32> = HashMap::new();
    for term in terms {
        let df = lowered.iter().filter(|text| text.contains(term.as_str())).count();
        if df > 0 {
            idf.insert(term.as_str(), (1.0 + n as f32 / df as f32).ln());
        }
    }

    points
        .iter()
        .zip(&lowered)
        .filter_map(|(point, text)| {
            let mut score = 0.0f32;
            for term in terms {
                let Some(weight) = idf.get(term.as_str()) else {
                    continue;
                };
                let tf = text.matches(term.as_str()).count();
                score += tf as f32 * weight;
            }
            if score > 0.0 {
                let mut hit = hit_from_point(point);
                hit.score = score;
                Some(hit)
            } else {
                None
            }
        })
        .collect()
}

/// Min-max normalize to `[0, 1]`; a uniform list maps to all-ones.
fn normalize_scores(hits: &[SearchHit]) -> Vec<f32> {
    if hits.is_empty() {
        return Vec::new();
    }
    let min = hits.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
    let max = hits
        .iter()
        .map(|h| h.score)
        .fold(f32::NEG_INFINITY, f32::max);

    hits.iter()
        .map(|h| {
            if (max - min).abs() < f32::EPSILON {
                1.0
            } else {
                (h.score - min) / (max - min)
            }
        })
        .collect()
}

/// Score descending, then chunk index ascending, then id ascending.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn hit_metadata(
    payload_extra: &serde_json::Map<String, serde_json::Value>,
    file_id: &str,
    kb_id: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut metadata = payload_extra.clone();
    metadata.insert("file_id".to_string(), serde_json::json!(file_id));
    metadata.insert("kb_id".to_string(), serde_json::json!(kb_id));
    metadata
}

fn hit_from_scored(point: ScoredPoint) -> SearchHit {
    let metadata = hit_metadata(&point.payload.extra, &point.payload.file_id, &point.payload.kb_id);
    SearchHit {
        score: point.score,
        content: point.payload.text,
        source: point.payload.source,
        chunk_index: point.payload.chunk_index,
        id: point.id,
        metadata,
    }
}

fn hit_from_point(point: &VectorPoint) -> SearchHit {
    let metadata = hit_metadata(&point.payload.extra, &point.payload.file_id, &point.payload.kb_id);
    SearchHit {
        score: 0.0,
        content: point.payload.text.clone(),
        source: point.payload.source.clone(),
        chunk_index: point.payload.chunk_index,
        id: point.id.clone(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::Payload;
    use crate::vectorstore::{CollectionInfo, MemoryVectorStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Embedder returning a fixed unit vector for every text.
    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed-test"
        }
        fn dimension(&self) -> usize {
            self.vector.len()
        }
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.vector.clone())
        }
        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.vector.clone()).collect())
        }
        async fn check_available(&self) -> bool {
            true
        }
    }

    /// Store wrapper that records the thresholds passed to `search`.
    struct RecordingStore {
        inner: MemoryVectorStore,
        thresholds: Mutex<Vec<Option<f32>>>,
    }

    #[async_trait]
    impl VectorStore for RecordingStore {
        async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
            self.inner.ensure_collection(name, dim).await
        }
        async fn delete_collection(&self, name: &str) -> Result<()> {
            self.inner.delete_collection(name).await
        }
        async fn collection_exists(&self, name: &str) -> Result<bool> {
            self.inner.collection_exists(name).await
        }
        async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
            self.inner.upsert(name, points).await
        }
        async fn search(
            &self,
            name: &str,
            vector: &[f32],
            limit: usize,
            score_threshold: Option<f32>,
        ) -> Result<Vec<ScoredPoint>> {
            self.thresholds.lock().unwrap().push(score_threshold);
            self.inner.search(name, vector, limit, score_threshold).await
        }
        async fn scroll(
            &self,
            name: &str,
            offset: Option<String>,
            limit: usize,
        ) -> Result<(Vec<VectorPoint>, Option<String>)> {
            self.inner.scroll(name, offset, limit).await
        }
        async fn delete_by_file(&self, name: &str, file_id: &str) -> Result<()> {
            self.inner.delete_by_file(name, file_id).await
        }
        async fn count(&self, name: &str) -> Result<u64> {
            self.inner.count(name).await
        }
        async fn info(&self, name: &str) -> Result<CollectionInfo> {
            self.inner.info(name).await
        }
        async fn check_available(&self) -> bool {
            true
        }
    }

    fn point(id: &str, vector: Vec<f32>, text: &str, index: i64) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            payload: Payload {
                text: text.to_string(),
                source: "corpus.txt".to_string(),
                file_id: "f1".to_string(),
                kb_id: "kb1".to_string(),
                chunk_index: index,
                extra: serde_json::Map::new(),
            },
        }
    }

    async fn seeded_store() -> Arc<MemoryVectorStore> {
        let store = Arc::new(MemoryVectorStore::new());
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    point("a1", vec![1.0, 0.0], "the quick brown fox jumps", 0),
                    point("a2", vec![0.9, 0.44], "a lazy dog sleeps quietly", 1),
                    point("a3", vec![0.0, 1.0], "quantum computing with qubits", 2),
                ],
            )
            .await
            .unwrap();
        store
    }

    fn config(mode: RetrievalMode) -> RetrievalConfig {
        RetrievalConfig {
            mode,
            top_k: 5,
            similarity_threshold: 0.0,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            adaptive_min_threshold: 0.0,
            adaptive_target_results: 1,
        }
    }

    #[test]
    fn tokenize_words_and_chinese_ngrams() {
        assert_eq!(tokenize("Hello World"), vec!["hello", "world"]);

        let terms = tokenize("李小勇投资");
        assert!(terms.contains(&"李小".to_string()));
        assert!(terms.contains(&"小勇".to_string()));
        assert!(terms.contains(&"李小勇".to_string()));
        assert!(terms.contains(&"投资".to_string()));

        let mixed = tokenize("RAG系统 design");
        assert!(mixed.contains(&"rag".to_string()));
        assert!(mixed.contains(&"系统".to_string()));
        assert!(mixed.contains(&"design".to_string()));

        assert_eq!(tokenize("中"), vec!["中"]);
        assert!(tokenize("  ").is_empty());
    }

    #[test]
    fn tokenize_drops_non_adjacent_duplicates() {
        let terms = tokenize("technology investment technology trends");
        assert_eq!(terms, vec!["technology", "investment", "trends"]);

        // Case-folded duplicates collapse too.
        let folded = tokenize("Rust rust RUST");
        assert_eq!(folded, vec!["rust"]);
    }

    #[test]
    fn normalize_maps_to_unit_interval() {
        let hits: Vec<SearchHit> = [10.0f32, 5.0, 0.0]
            .iter()
            .enumerate()
            .map(|(i, s)| SearchHit {
                score: *s,
                content: String::new(),
                source: String::new(),
                chunk_index: i as i64,
                id: format!("h{i}"),
                metadata: serde_json::Map::new(),
            })
            .collect();
        let norm = normalize_scores(&hits);
        assert_eq!(norm, vec![1.0, 0.5, 0.0]);

        let uniform: Vec<SearchHit> = hits
            .iter()
            .map(|h| SearchHit {
                score: 3.0,
                ..h.clone()
            })
            .collect();
        assert_eq!(normalize_scores(&uniform), vec![1.0, 1.0, 1.0]);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[tokio::test]
    async fn vector_search_orders_and_thresholds() {
        let store = seeded_store().await;
        let engine = RetrievalEngine::new(
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            }),
            Arc::clone(&store) as Arc<dyn VectorStore>,
        );

        let mut cfg = config(RetrievalMode::Vector);
        cfg.similarity_threshold = 0.5;
        let hits = engine.search("c", "anything", &cfg).await.unwrap();
        assert_eq!(hits[0].id, "a1");
        assert!(hits.iter().all(|h| h.score >= 0.5));
    }

    #[tokio::test]
    async fn keyword_search_prefers_rare_terms() {
        let store = seeded_store().await;
        let engine = RetrievalEngine::new(
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            }),
            Arc::clone(&store) as Arc<dyn VectorStore>,
        );

        let hits = engine
            .search("c", "quantum qubits", &config(RetrievalMode::Fulltext))
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "a3");
    }

    #[tokio::test]
    async fn keyword_search_empty_query_is_empty() {
        let store = seeded_store().await;
        let engine = RetrievalEngine::new(
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            }),
            Arc::clone(&store) as Arc<dyn VectorStore>,
        );
        let hits = engine
            .search("c", "   ", &config(RetrievalMode::Fulltext))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn hybrid_with_full_vector_weight_matches_vector_ranking() {
        let store = seeded_store().await;
        let embedder = Arc::new(FixedEmbedder {
            vector: vec![1.0, 0.0],
        });
        let engine = RetrievalEngine::new(
            Arc::clone(&embedder) as Arc<dyn Embedder>,
            Arc::clone(&store) as Arc<dyn VectorStore>,
        );

        let mut hybrid_cfg = config(RetrievalMode::Hybrid);
        hybrid_cfg.vector_weight = 1.0;
        hybrid_cfg.keyword_weight = 0.0;
        let hybrid: Vec<String> = engine
            .search("c", "quick fox", &hybrid_cfg)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();

        let vector: Vec<String> = engine
            .search("c", "quick fox", &config(RetrievalMode::Vector))
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();

        assert_eq!(hybrid, vector);
    }

    #[tokio::test]
    async fn hybrid_is_deterministic() {
        let store = seeded_store().await;
        let engine = RetrievalEngine::new(
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            }),
            Arc::clone(&store) as Arc<dyn VectorStore>,
        );

        let cfg = config(RetrievalMode::Hybrid);
        let first: Vec<(String, String)> = engine
            .search("c", "lazy dog", &cfg)
            .await
            .unwrap()
            .into_iter()
            .map(|h| (h.id, format!("{:.6}", h.score)))
            .collect();
        let second: Vec<(String, String)> = engine
            .search("c", "lazy dog", &cfg)
            .await
            .unwrap()
            .into_iter()
            .map(|h| (h.id, format!("{:.6}", h.score)))
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn adaptive_reduces_threshold_until_hit_found() {
        let inner = MemoryVectorStore::new();
        inner.ensure_collection("c", 2).await.unwrap();
        // cos(query, point) = 0.45 for query [1, 0].
        inner
            .upsert(
                "c",
                vec![point("only", vec![0.45, 0.893_027], "borderline match", 0)],
            )
            .await
            .unwrap();
        let store = Arc::new(RecordingStore {
            inner,
            thresholds: Mutex::new(Vec::new()),
        });

        let engine = RetrievalEngine::new(
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0],
            }),
            Arc::clone(&store) as Arc<dyn VectorStore>,
        );

        let cfg = RetrievalConfig {
            mode: RetrievalMode::Vector,
            top_k: 5,
            similarity_threshold: 0.8,
            vector_weight: 1.0,
            keyword_weight: 0.0,
            adaptive_min_threshold: 0.2,
            adaptive_target_results: 3,
        };

        let hits = engine.search("c", "borderline", &cfg).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.45).abs() < 0.01);

        let recorded = store.thresholds.lock().unwrap().clone();
        let expected = [0.8f32, 0.56, 0.392, 0.2744];
        assert_eq!(recorded.len(), 4);
        for (seen, want) in recorded.iter().zip(expected) {
            assert!((seen.unwrap() - want).abs() < 1e-3, "got {seen:?}, want {want}");
        }
    }

    #[tokio::test]
    async fn adaptive_respects_min_threshold_floor() {
        let store = seeded_store().await;
        let engine = RetrievalEngine::new(
            Arc::new(FixedEmbedder {
                vector: vec![0.0, -1.0],
            }),
            Arc::clone(&store) as Arc<dyn VectorStore>,
        );

        // Nothing scores above 0.5; the floor stops the descent.
        let cfg = RetrievalConfig {
            mode: RetrievalMode::Vector,
            top_k: 5,
            similarity_threshold: 0.9,
            vector_weight: 1.0,
            keyword_weight: 0.0,
            adaptive_min_threshold: 0.5,
            adaptive_target_results: 3,
        };
        let hits = engine.search("c", "no match", &cfg).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn tie_breaking_is_stable() {
        let mut hits = vec![
            SearchHit {
                score: 0.5,
                content: String::new(),
                source: String::new(),
                chunk_index: 3,
                id: "z".to_string(),
                metadata: serde_json::Map::new(),
            },
            SearchHit {
                score: 0.5,
                content: String::new(),
                source: String::new(),
                chunk_index: 1,
                id: "b".to_string(),
                metadata: serde_json::Map::new(),
            },
            SearchHit {
                score: 0.5,
                content: String::new(),
                source: String::new(),
                chunk_index: 1,
                id: "a".to_string(),
                metadata: serde_json::Map::new(),
            },
            SearchHit {
                score: 0.9,
                content: String::new(),
                source: String::new(),
                chunk_index: 9,
                id: "y".to_string(),
                metadata: serde_json::Map::new(),
            },
        ];
        sort_hits(&mut hits);
        let order: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(order, vec!["y", "a", "b", "z"]);
    }

    #[test]
    fn expand_query_prepends_synonyms() {
        let mut synonyms = HashMap::new();
        synonyms.insert(
            "invest".to_string(),
            vec!["funding".to_string(), "capital".to_string()],
        );

        let expanded = expand_query("invest strategy", &synonyms, 2);
        assert_eq!(expanded, "funding capital invest strategy");

        let capped = expand_query("invest strategy", &synonyms, 1);
        assert_eq!(capped, "funding invest strategy");

        let untouched = expand_query("other words", &synonyms, 2);
        assert_eq!(untouched, "other words");

        let empty = expand_query("invest", &HashMap::new(), 3);
        assert_eq!(empty, "invest");
    }
}
