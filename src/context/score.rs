//! Relevance scoring for context maps.
//!
//! A map's score against a hint blends document freshness, tag overlap, a
//! flat semantic component, and a boost for playbook-required maps:
//!
//! ```text
//! freshness = max(0, 1 - age_days/90)
//! tags_match = |hint ∩ map| / |hint|   (0.5 when the hint has no tags)
//! base = 0.4*freshness + 0.2*tags_match + 0.4*semantic
//! total = min(1.0, base + 0.15 if playbook_required)
//! ```
//!
//! The semantic component is a flat 0.5 until an embedding lookup replaces
//! [`semantic_relevance`]; everything else is wired for it.

use chrono::{DateTime, Utc};

const FRESHNESS_HORIZON_DAYS: f64 = 90.0;
const FRESHNESS_WEIGHT: f64 = 0.4;
const TAGS_WEIGHT: f64 = 0.2;
const SEMANTIC_WEIGHT: f64 = 0.4;
const PLAYBOOK_BOOST: f64 = 0.15;

/// Caller-supplied retrieval hint.
#[derive(Debug, Clone, Default)]
pub struct ScoreHint {
    pub tags: Vec<String>,
}

/// Scoring inputs extracted from one map document.
#[derive(Debug, Clone)]
pub struct ScoreInput {
    pub id: String,
    pub tags: Vec<String>,
    pub updated_at: Option<String>,
    pub created_at: Option<String>,
    pub playbook_required: bool,
}

/// Component breakdown of one score.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MapScore {
    pub freshness: f64,
    pub tags_match: f64,
    pub semantic: f64,
    pub base: f64,
    pub playbook_boost: f64,
    pub total: f64,
}

/// Flat placeholder for the future embedding lookup.
fn semantic_relevance(_input: &ScoreInput, _hint: &ScoreHint) -> f64 {
    0.5
}

/// Score one map against a hint at time `now`.
pub fn score_map(input: &ScoreInput, hint: &ScoreHint, now: DateTime<Utc>) -> MapScore {
    let reference = input
        .updated_at
        .as_deref()
        .or(input.created_at.as_deref())
        .unwrap_or("");
    let age_days = crate::core::time::age_seconds(reference, now) as f64 / 86_400.0;
    let freshness = (1.0 - age_days / FRESHNESS_HORIZON_DAYS).max(0.0);

    let tags_match = if hint.tags.is_empty() {
        0.5
    } else {
        let overlap = hint
            .tags
            .iter()
            .filter(|t| input.tags.iter().any(|m| m == *t))
            .count();
        overlap as f64 / hint.tags.len() as f64
    };

    let semantic = semantic_relevance(input, hint);
    let base = FRESHNESS_WEIGHT * freshness + TAGS_WEIGHT * tags_match + SEMANTIC_WEIGHT * semantic;
    let playbook_boost = if input.playbook_required {
        PLAYBOOK_BOOST
    } else {
        0.0
    };

    MapScore {
        freshness,
        tags_match,
        semantic,
        base,
        playbook_boost,
        total: (base + playbook_boost).min(1.0),
    }
}
