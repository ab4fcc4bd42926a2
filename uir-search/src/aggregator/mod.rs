//! Result aggregation: identity, fusion, deduplication and reranking.
//!
//! [`Aggregator::aggregate`] merges per-provider ranked lists into one list.
//! Fusion only ever overwrites `score` and adds metadata; every other field
//! of a result is passed through untouched.

pub mod fusion;
pub mod identity;
pub mod url_normalize;

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::error::SearchError;
use crate::types::SearchResult;

pub use fusion::{FusionMethod, DEFAULT_RRF_K};
pub use identity::identity_key;

use fusion::{fuse, Position};

/// Metadata key holding each contributing provider's raw score.
pub const STRATEGY_SCORES_KEY: &str = "strategy_scores";
/// Metadata key holding the provider a result came from.
pub const PROVIDER_KEY: &str = "provider";

/// Output of one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    /// Fused results, best first.
    pub results: Vec<SearchResult>,
    /// The method actually applied. A single non-empty list is always
    /// merged with [`FusionMethod::Plain`].
    pub method: FusionMethod,
}

/// Merges ranked lists from several providers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregator {
    rrf_k: f64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RRF_K)
    }
}

impl Aggregator {
    /// Create an aggregator with the given RRF constant.
    pub fn new(rrf_k: f64) -> Self {
        Self { rrf_k }
    }

    /// Merge `lists` into one ranked list.
    ///
    /// `weights` is aligned with `lists` by position and only used by
    /// [`FusionMethod::WeightedSum`]; omitted weights default to `1.0`.
    ///
    /// With `dedupe`, one record per identity is kept (the first seen, or
    /// for `max_score` the one holding the maximum) and its
    /// `metadata.strategy_scores` maps every contributing provider to its
    /// raw score. Without it, every record is kept and carries its
    /// identity's fused score.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Validation`] if `weights` does not match the
    /// number of lists or contains a non-finite value.
    pub fn aggregate(
        &self,
        lists: Vec<Vec<SearchResult>>,
        weights: Option<&[f64]>,
        method: FusionMethod,
        dedupe: bool,
    ) -> Result<Aggregation, SearchError> {
        if let Some(weights) = weights {
            if weights.len() != lists.len() {
                return Err(SearchError::Validation(format!(
                    "{} weights supplied for {} result lists",
                    weights.len(),
                    lists.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite()) {
                return Err(SearchError::Validation("weights must be finite".into()));
            }
        }

        let non_empty = lists.iter().filter(|l| !l.is_empty()).count();
        let method = if non_empty <= 1 {
            FusionMethod::Plain
        } else {
            method
        };

        let results = match method {
            FusionMethod::Plain => plain(lists, dedupe),
            _ => self.fused(lists, weights.unwrap_or_default(), method, dedupe),
        };
        tracing::trace!(%method, count = results.len(), dedupe, "aggregated results");
        Ok(Aggregation { results, method })
    }

    fn fused(
        &self,
        lists: Vec<Vec<SearchResult>>,
        weights: &[f64],
        method: FusionMethod,
        dedupe: bool,
    ) -> Vec<SearchResult> {
        let keys: Vec<Vec<String>> = lists
            .iter()
            .map(|list| list.iter().map(identity_key).collect())
            .collect();
        let groups = fuse(&lists, &keys, weights, method, self.rrf_k);
        let take = |at: Position| lists[at.list][at.rank].clone();

        if dedupe {
            groups
                .into_iter()
                .map(|group| {
                    let mut result = take(group.representative);
                    result.score = group.score;
                    annotate(&mut result, Some(&group.contributions));
                    result
                })
                .collect()
        } else {
            groups
                .into_iter()
                .flat_map(|group| {
                    let score = group.score;
                    group.members.into_iter().map(move |at| (at, score))
                })
                .map(|(at, score)| {
                    let mut result = take(at);
                    result.score = score;
                    annotate(&mut result, None);
                    result
                })
                .collect()
        }
    }
}

/// Concatenate and stable-sort by raw score, dropping repeated identities
/// when deduplicating.
fn plain(lists: Vec<Vec<SearchResult>>, dedupe: bool) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = lists.into_iter().flatten().collect();
    for result in &mut results {
        result.score = result.effective_score();
    }

    if !dedupe {
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        for result in &mut results {
            annotate(result, None);
        }
        return results;
    }

    // Contributions are gathered in input order, before the sort, so each
    // provider's first occurrence is the one recorded.
    let keyed: Vec<(String, SearchResult)> = results
        .into_iter()
        .map(|result| (identity_key(&result), result))
        .collect();
    let mut contributions: HashMap<&str, Vec<(String, f64)>> = HashMap::new();
    for (key, result) in &keyed {
        let scores = contributions.entry(key.as_str()).or_default();
        if !scores.iter().any(|(p, _)| *p == result.provider) {
            scores.push((result.provider.clone(), result.score));
        }
    }

    let mut order: Vec<usize> = (0..keyed.len()).collect();
    order.sort_by(|&a, &b| keyed[b].1.score.total_cmp(&keyed[a].1.score));

    let mut seen = HashSet::new();
    order
        .into_iter()
        .filter(|&i| seen.insert(keyed[i].0.as_str()))
        .map(|i| {
            let (key, result) = &keyed[i];
            let mut result = result.clone();
            annotate(&mut result, contributions.get(key.as_str()).map(Vec::as_slice));
            result
        })
        .collect()
}

/// Add fusion metadata without disturbing anything the provider set.
fn annotate(result: &mut SearchResult, contributions: Option<&[(String, f64)]>) {
    if !result.metadata.contains_key(PROVIDER_KEY) {
        result
            .metadata
            .insert(PROVIDER_KEY.to_string(), Value::String(result.provider.clone()));
    }
    if let Some(contributions) = contributions {
        let scores: Map<String, Value> = contributions
            .iter()
            .map(|(provider, score)| (provider.clone(), Value::from(*score)))
            .collect();
        result
            .metadata
            .insert(STRATEGY_SCORES_KEY.to_string(), Value::Object(scores));
    }
}

/// Boost results by how many query terms their title or content contains.
///
/// Each score is multiplied by `1 + 0.5 * matched / total` where `total` is
/// the number of distinct query terms. The sort is stable, so equal scores
/// keep their fused order.
pub fn rerank(mut results: Vec<SearchResult>, query: &str) -> Vec<SearchResult> {
    let mut terms: Vec<String> = query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return results;
    }

    for result in &mut results {
        let haystack = format!(
            "{} {}",
            result.title.as_deref().unwrap_or_default(),
            result.content.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
        let boost = 1.0 + 0.5 * matched as f64 / terms.len() as f64;
        result.score = result.effective_score() * boost;
    }
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn list(provider: &str, items: &[(&str, f64)]) -> Vec<SearchResult> {
        items
            .iter()
            .map(|(id, score)| SearchResult::new(*id, provider, *score))
            .collect()
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn single_list_is_sorted_by_raw_score_for_every_method() {
        let input = list("a", &[("low", 0.1), ("high", 0.9), ("mid", 0.5)]);
        for method in [
            FusionMethod::ReciprocalRank,
            FusionMethod::WeightedSum,
            FusionMethod::MaxScore,
            FusionMethod::Plain,
        ] {
            let out = Aggregator::default()
                .aggregate(vec![input.clone()], None, method, true)
                .expect("aggregate");
            assert_eq!(ids(&out.results), vec!["high", "mid", "low"]);
            assert_eq!(out.method, FusionMethod::Plain);
            assert!((out.results[0].score - 0.9).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn empty_sibling_lists_fall_back_to_plain() {
        let out = Aggregator::default()
            .aggregate(
                vec![vec![], list("b", &[("x", 0.2), ("y", 0.7)])],
                None,
                FusionMethod::ReciprocalRank,
                true,
            )
            .expect("aggregate");
        assert_eq!(out.method, FusionMethod::Plain);
        assert_eq!(ids(&out.results), vec!["y", "x"]);
    }

    #[test]
    fn rrf_literal_example_orders_first_list_first() {
        let out = Aggregator::default()
            .aggregate(
                vec![
                    list("a", &[("1", 1.0), ("2", 0.9)]),
                    list("b", &[("2", 1.0), ("1", 0.9)]),
                ],
                None,
                FusionMethod::ReciprocalRank,
                true,
            )
            .expect("aggregate");
        // Ids are provider-local, so without URLs or content "1" from a and
        // "1" from b are different identities.
        assert_eq!(out.results.len(), 4);
        assert_eq!(ids(&out.results), vec!["1", "2", "2", "1"]);
        assert_eq!(out.results[0].provider, "a");
    }

    #[test]
    fn rrf_shared_identities_tie_and_keep_first_list_order() {
        let with_urls = |provider: &str, ids: &[&str]| -> Vec<SearchResult> {
            ids.iter()
                .map(|id| {
                    SearchResult::new(*id, provider, 1.0).with_url(format!("https://docs.test/{id}"))
                })
                .collect()
        };
        let out = Aggregator::default()
            .aggregate(
                vec![with_urls("a", &["1", "2"]), with_urls("b", &["2", "1"])],
                None,
                FusionMethod::ReciprocalRank,
                true,
            )
            .expect("aggregate");
        assert_eq!(ids(&out.results), vec!["1", "2"]);
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((out.results[0].score - expected).abs() < 1e-12);
        assert!((out.results[1].score - expected).abs() < 1e-12);
    }

    #[test]
    fn dedupe_by_url_records_strategy_scores() {
        let a = SearchResult::new("g-1", "google", 0.8).with_url("https://example.com/page");
        let b = SearchResult::new("b-7", "bing", 0.6).with_url("https://example.com/page/");
        let out = Aggregator::default()
            .aggregate(vec![vec![a], vec![b]], None, FusionMethod::ReciprocalRank, true)
            .expect("aggregate");
        assert_eq!(out.results.len(), 1);
        let merged = &out.results[0];
        assert_eq!(merged.id, "g-1");
        let scores = merged.metadata[STRATEGY_SCORES_KEY].as_object().expect("object");
        assert_eq!(scores["google"], 0.8);
        assert_eq!(scores["bing"], 0.6);
        assert_eq!(merged.metadata[PROVIDER_KEY], "google");
    }

    #[test]
    fn without_dedupe_every_record_carries_fused_score() {
        let a = SearchResult::new("g-1", "google", 0.8).with_url("https://example.com/page");
        let b = SearchResult::new("b-7", "bing", 0.6).with_url("https://example.com/page");
        let out = Aggregator::default()
            .aggregate(vec![vec![a], vec![b]], None, FusionMethod::WeightedSum, false)
            .expect("aggregate");
        assert_eq!(out.results.len(), 2);
        assert!((out.results[0].score - 1.4).abs() < 1e-12);
        assert!((out.results[1].score - 1.4).abs() < 1e-12);
        assert_eq!(out.results[1].metadata[PROVIDER_KEY], "bing");
        assert!(!out.results[0].metadata.contains_key(STRATEGY_SCORES_KEY));
    }

    #[test]
    fn max_score_keeps_metadata_of_best_provider() {
        let mut a = SearchResult::new("a-1", "a", 0.3).with_url("https://x.test/doc");
        a.metadata.insert("source".into(), Value::from("a"));
        let mut b = SearchResult::new("b-1", "b", 0.9).with_url("https://x.test/doc");
        b.metadata.insert("source".into(), Value::from("b"));
        let out = Aggregator::default()
            .aggregate(vec![vec![a], vec![b]], None, FusionMethod::MaxScore, true)
            .expect("aggregate");
        assert_eq!(out.results[0].id, "b-1");
        assert_eq!(out.results[0].metadata["source"], "b");
    }

    #[test]
    fn plain_dedupe_records_every_contributing_provider() {
        let a = SearchResult::new("a1", "a", 0.8).with_url("https://shared.test/x");
        let b = SearchResult::new("b1", "b", 0.6).with_url("https://shared.test/x");
        let c = SearchResult::new("c1", "c", 0.7).with_url("https://other.test/");
        let out = Aggregator::default()
            .aggregate(vec![vec![a], vec![b, c]], None, FusionMethod::Plain, true)
            .expect("aggregate");
        assert_eq!(ids(&out.results), vec!["a1", "c1"]);

        let scores = out.results[0].metadata[STRATEGY_SCORES_KEY]
            .as_object()
            .expect("scores");
        assert_eq!(scores.len(), 2);
        assert_eq!(scores["a"], 0.8);
        assert_eq!(scores["b"], 0.6);
        assert_eq!(out.results[1].metadata[STRATEGY_SCORES_KEY]["c"], 0.7);
    }

    #[test]
    fn provider_metadata_is_not_overwritten() {
        let mut r = SearchResult::new("1", "a", 0.5);
        r.metadata.insert(PROVIDER_KEY.into(), Value::from("upstream-shard-3"));
        let out = Aggregator::default()
            .aggregate(vec![vec![r]], None, FusionMethod::Plain, true)
            .expect("aggregate");
        assert_eq!(out.results[0].metadata[PROVIDER_KEY], "upstream-shard-3");
    }

    #[test]
    fn fields_other_than_score_pass_through() {
        let mut r = SearchResult::new("1", "a", 0.5)
            .with_title("T")
            .with_content("C")
            .with_url("https://x.test/1");
        r.highlights = Some(vec!["<em>C</em>".into()]);
        let out = Aggregator::default()
            .aggregate(
                vec![vec![r.clone()], list("b", &[("2", 0.1)])],
                None,
                FusionMethod::ReciprocalRank,
                true,
            )
            .expect("aggregate");
        let first = &out.results[0];
        assert_eq!(first.title, r.title);
        assert_eq!(first.content, r.content);
        assert_eq!(first.url, r.url);
        assert_eq!(first.highlights, r.highlights);
    }

    #[test]
    fn mismatched_weights_rejected() {
        let err = Aggregator::default()
            .aggregate(
                vec![list("a", &[("1", 1.0)]), list("b", &[("2", 1.0)])],
                Some(&[1.0]),
                FusionMethod::WeightedSum,
                true,
            )
            .unwrap_err();
        assert!(matches!(err, SearchError::Validation(_)));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let out = Aggregator::default()
            .aggregate(vec![], None, FusionMethod::ReciprocalRank, true)
            .expect("aggregate");
        assert!(out.results.is_empty());
    }

    #[test]
    fn rerank_boosts_term_matches() {
        let results = vec![
            SearchResult::new("plain", "a", 1.0).with_title("unrelated"),
            SearchResult::new("match", "a", 0.8).with_title("Rust async runtime"),
        ];
        let out = rerank(results, "rust async");
        assert_eq!(ids(&out), vec!["match", "plain"]);
        // 0.8 * (1 + 0.5 * 2/2)
        assert!((out[0].score - 1.2).abs() < 1e-12);
        assert!((out[1].score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rerank_with_empty_query_is_identity() {
        let results = list("a", &[("1", 0.2), ("2", 0.9)]);
        let out = rerank(results.clone(), "   ");
        assert_eq!(out, results);
    }
}
