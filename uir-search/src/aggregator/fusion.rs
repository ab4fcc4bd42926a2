//! Rank fusion algorithms.
//!
//! Every method accumulates one score per identity across the input lists,
//! then orders identities by:
//!
//! 1. accumulated score, descending;
//! 2. index of the first list the identity appeared in, ascending;
//! 3. 1-based rank within that list, ascending.
//!
//! Given identical inputs the output order is always identical.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SearchError;
use crate::types::SearchResult;

/// Default RRF constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// How ranked lists are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FusionMethod {
    /// Sum of `1 / (k + rank)` over lists.
    #[default]
    #[serde(rename = "reciprocal_rank_fusion", alias = "rrf")]
    ReciprocalRank,
    /// Sum of `weight * score` over lists.
    #[serde(rename = "weighted_sum")]
    WeightedSum,
    /// Maximum raw score over lists.
    #[serde(rename = "max_score")]
    MaxScore,
    /// No fusion: concatenate and sort by raw score.
    #[serde(rename = "plain")]
    Plain,
}

impl FusionMethod {
    /// Returns the canonical wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReciprocalRank => "reciprocal_rank_fusion",
            Self::WeightedSum => "weighted_sum",
            Self::MaxScore => "max_score",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FusionMethod {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reciprocal_rank_fusion" | "rrf" => Ok(Self::ReciprocalRank),
            "weighted_sum" => Ok(Self::WeightedSum),
            "max_score" => Ok(Self::MaxScore),
            "plain" => Ok(Self::Plain),
            _ => Err(SearchError::InvalidFusionMethod(s.to_string())),
        }
    }
}

/// Position of a record in the input: list index and 0-based rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Position {
    pub list: usize,
    pub rank: usize,
}

/// One identity's accumulated state.
#[derive(Debug)]
pub(crate) struct FusedGroup {
    /// Accumulated score.
    pub score: f64,
    /// Where the identity was first seen.
    pub first: Position,
    /// Record whose fields are kept when deduplicating.
    pub representative: Position,
    /// Best raw score seen, for `max_score`.
    best_raw: f64,
    /// Raw score of each contributing provider, first occurrence wins.
    pub contributions: Vec<(String, f64)>,
    /// Every occurrence, in input order.
    pub members: Vec<Position>,
    /// Lists that already contributed to `score`.
    lists_seen: Vec<usize>,
}

/// Accumulate fused scores for every identity.
///
/// `keys[list][rank]` is the identity of `lists[list][rank]`. Only the first
/// occurrence of an identity within one list contributes to its score.
pub(crate) fn fuse(
    lists: &[Vec<SearchResult>],
    keys: &[Vec<String>],
    weights: &[f64],
    method: FusionMethod,
    rrf_k: f64,
) -> Vec<FusedGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<FusedGroup> = Vec::new();

    for (list, results) in lists.iter().enumerate() {
        let weight = weights.get(list).copied().unwrap_or(1.0);
        for (rank, result) in results.iter().enumerate() {
            let key = keys[list][rank].as_str();
            let position = Position { list, rank };
            let raw = result.effective_score();
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push(FusedGroup {
                    score: match method {
                        FusionMethod::MaxScore => f64::NEG_INFINITY,
                        _ => 0.0,
                    },
                    first: position,
                    representative: position,
                    best_raw: f64::NEG_INFINITY,
                    contributions: Vec::new(),
                    members: Vec::new(),
                    lists_seen: Vec::new(),
                });
                groups.len() - 1
            });
            let group = &mut groups[slot];
            group.members.push(position);
            if !group.contributions.iter().any(|(p, _)| *p == result.provider) {
                group.contributions.push((result.provider.clone(), raw));
            }
            if group.lists_seen.contains(&list) {
                continue;
            }
            group.lists_seen.push(list);

            match method {
                FusionMethod::ReciprocalRank => {
                    group.score += 1.0 / (rrf_k + (rank + 1) as f64);
                }
                FusionMethod::WeightedSum => {
                    group.score += weight * raw;
                }
                FusionMethod::MaxScore | FusionMethod::Plain => {
                    if raw > group.best_raw {
                        group.best_raw = raw;
                        group.score = raw;
                        group.representative = position;
                    }
                }
            }
        }
    }

    groups.sort_by(compare_groups);
    groups
}

fn compare_groups(a: &FusedGroup, b: &FusedGroup) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.first.cmp(&b.first))
}
