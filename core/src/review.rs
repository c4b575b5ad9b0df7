//! Review queue: pending suggestions and the human confirm/reject decisions.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::Database;
use crate::error::LarderError;
use crate::matcher::{CanonicalSource, IngredientMatches, Matcher};
use crate::models::{
    ConfirmedMatch, MatchCandidate, MatchType, RecipeIngredient, Rejection, ReviewStats,
    validate_confidence,
};

pub const DEFAULT_PENDING_LIMIT: usize = 50;
pub const MANUAL_CONFIDENCE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingFilter {
    pub recipe_id: Option<String>,
    /// Case-insensitive substring of the ingredient text.
    pub search: Option<String>,
    pub include_rejected: bool,
    pub offset: usize,
    pub limit: usize,
}

impl Default for PendingFilter {
    fn default() -> Self {
        Self {
            recipe_id: None,
            search: None,
            include_rejected: false,
            offset: 0,
            limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum PendingOutcome {
    Suggested,
    NoMatch,
    LookupFailed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItem {
    pub ingredient: RecipeIngredient,
    pub candidate: Option<MatchCandidate>,
    pub rejected: bool,
    pub outcome: PendingOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub recipe_ingredient_id: String,
    pub canonical_id: String,
    pub confidence: i64,
    /// Type reported by the matcher; inferred from confidence when absent.
    #[serde(default)]
    pub match_type: Option<MatchType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult {
    pub recipe_ingredient_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<ConfirmedMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkItemResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Pending ingredients with their best automatic suggestion from `source`.
/// A failed lookup marks the item instead of failing the listing.
pub fn list_pending<S: CanonicalSource + ?Sized>(
    db: &Database,
    source: &S,
    matcher: &Matcher,
    filter: &PendingFilter,
) -> Result<Vec<PendingItem>> {
    let mut items = Vec::new();
    for ingredient in db.get_pending_ingredients(filter)? {
        let rejected = filter.include_rejected && db.get_rejection(&ingredient.id)?.is_some();
        let (candidate, outcome) = match matcher.find_match(source, &ingredient.name) {
            Ok(candidates) => match candidates.into_iter().next() {
                Some(mut best) => {
                    best.recipe_ingredient_id = Some(ingredient.id.clone());
                    (Some(best), PendingOutcome::Suggested)
                }
                None => (None, PendingOutcome::NoMatch),
            },
            Err(e) => {
                warn!(ingredient = %ingredient.id, error = %e, "match lookup failed");
                (None, PendingOutcome::LookupFailed(format!("{e:#}")))
            }
        };
        items.push(PendingItem {
            ingredient,
            candidate,
            rejected,
            outcome,
        });
    }
    Ok(items)
}

/// Match every unconfirmed, unrejected ingredient against the canonical store.
pub fn scan(
    db: &Database,
    matcher: &Matcher,
    recipe_id: Option<&str>,
) -> Result<Vec<IngredientMatches>> {
    let ingredients = db.get_unmatched_ingredients(recipe_id, false)?;
    if ingredients.is_empty() {
        return Ok(Vec::new());
    }
    let results = matcher.match_all(db, &ingredients)?;
    info!(ingredients = ingredients.len(), "matching pass finished");
    Ok(results)
}

fn invalid(e: &anyhow::Error) -> anyhow::Error {
    LarderError::InvalidInput(e.to_string()).into()
}

/// Persist a human-confirmed match. Re-confirming the same decision is a no-op.
pub fn confirm(db: &Database, req: &ConfirmRequest) -> Result<ConfirmedMatch> {
    let confidence = validate_confidence(req.confidence).map_err(|e| invalid(&e))?;
    if req.match_type == Some(MatchType::Manual) && confidence != MANUAL_CONFIDENCE {
        return Err(LarderError::InvalidInput(
            "manual matches always carry confidence 100".to_string(),
        )
        .into());
    }
    db.require_recipe_ingredient(&req.recipe_ingredient_id)?;
    db.require_canonical(&req.canonical_id)?;

    let match_type = req
        .match_type
        .unwrap_or_else(|| MatchType::from_confidence(confidence));

    if let Some(existing) = db.get_confirmed_match(&req.recipe_ingredient_id)? {
        if existing.canonical_id != req.canonical_id {
            let conflict = LarderError::ConflictingConfirm(req.recipe_ingredient_id.clone());
            warn!(
                previous = %existing.canonical_id,
                next = %req.canonical_id,
                "{conflict}, keeping the latest decision"
            );
        }
    }
    db.upsert_confirmed_match(
        &req.recipe_ingredient_id,
        &req.canonical_id,
        confidence,
        match_type,
    )
}

pub fn reject(db: &Database, recipe_ingredient_id: &str) -> Result<Rejection> {
    db.require_recipe_ingredient(recipe_ingredient_id)?;
    db.reject_match(recipe_ingredient_id)
}

/// Pin an ingredient to a canonical record chosen by hand.
pub fn manual_override(
    db: &Database,
    recipe_ingredient_id: &str,
    canonical_id: &str,
) -> Result<ConfirmedMatch> {
    confirm(
        db,
        &ConfirmRequest {
            recipe_ingredient_id: recipe_ingredient_id.to_string(),
            canonical_id: canonical_id.to_string(),
            confidence: i64::from(MANUAL_CONFIDENCE),
            match_type: Some(MatchType::Manual),
        },
    )
}

/// Confirm each item on its own; one failure does not undo the others.
pub fn bulk_confirm(db: &Database, items: &[ConfirmRequest]) -> Vec<BulkItemResult> {
    let results: Vec<BulkItemResult> = items
        .iter()
        .map(|req| match confirm(db, req) {
            Ok(m) => BulkItemResult {
                recipe_ingredient_id: req.recipe_ingredient_id.clone(),
                confirmed: Some(m),
                error: None,
            },
            Err(e) => BulkItemResult {
                recipe_ingredient_id: req.recipe_ingredient_id.clone(),
                confirmed: None,
                error: Some(format!("{e:#}")),
            },
        })
        .collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    info!(ok, failed = results.len() - ok, "bulk confirm finished");
    results
}

pub fn stats(db: &Database) -> Result<ReviewStats> {
    db.review_stats()
}
