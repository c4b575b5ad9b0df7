use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::Serialize;

use crate::db::Database;
use crate::error::LarderError;
use crate::import::{self, DEFAULT_BATCH_SIZE};
use crate::matcher::{IngredientMatches, MatchStats, Matcher, MatcherConfig};
use crate::models::{
    CommitSummary, ConfirmedMatch, ImportStats, MatchCandidate, NutritionSummary, Quantity,
    Recipe, RecipeIngredient, Rejection, ReviewStats, validate_servings,
};
use crate::nutrition;
use crate::review::{self, BulkItemResult, ConfirmRequest, PendingFilter, PendingItem};

/// What an import produced, and where it went.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub stats: ImportStats,
    pub content_key: String,
    pub batch_count: usize,
    pub files: Vec<PathBuf>,
    pub commit: Option<CommitSummary>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions<'a> {
    pub batch_size: usize,
    /// Write `batch-NNN.json` files and a summary here.
    pub out_dir: Option<&'a Path>,
    /// Upsert into the canonical store.
    pub commit: bool,
}

impl Default for ImportOptions<'_> {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            out_dir: None,
            commit: true,
        }
    }
}

/// Facade over the store, matcher, review queue and aggregator.
pub struct LarderService {
    db: Database,
    matcher: Matcher,
}

impl LarderService {
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Database::open(Path::new(db_path))?;
        Ok(Self::with_database(db, MatcherConfig::default()))
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::with_database(db, MatcherConfig::default()))
    }

    #[must_use]
    pub fn with_database(db: Database, config: MatcherConfig) -> Self {
        Self {
            db,
            matcher: Matcher::new(config),
        }
    }

    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    // --- Import ---

    pub fn import_dataset<R: Read>(&self, reader: R, opts: ImportOptions<'_>) -> Result<ImportReport> {
        if opts.batch_size == 0 {
            bail!(LarderError::InvalidInput("batch size must be at least 1".to_string()));
        }
        let outcome = import::import_csv(reader)?;
        let files = match opts.out_dir {
            Some(dir) => import::write_batches(dir, &outcome, opts.batch_size)?,
            None => Vec::new(),
        };
        let commit = if opts.commit {
            Some(import::commit_batches(&self.db, &outcome, opts.batch_size)?)
        } else {
            None
        };
        Ok(ImportReport {
            batch_count: outcome.batches(opts.batch_size).len(),
            stats: outcome.stats,
            content_key: outcome.content_key,
            files,
            commit,
            issues: outcome.errors.iter().map(ToString::to_string).collect(),
        })
    }

    // --- Matching ---

    pub fn find_match(&self, text: &str) -> Result<Vec<MatchCandidate>> {
        self.matcher.find_match(&self.db, text)
    }

    /// Incremental matching pass over unconfirmed ingredients.
    pub fn scan(&self, recipe_id: Option<&str>) -> Result<(Vec<IngredientMatches>, MatchStats)> {
        if let Some(id) = recipe_id {
            self.db.get_recipe(id)?;
        }
        let results = review::scan(&self.db, &self.matcher, recipe_id)?;
        let stats = MatchStats::from_results(&results);
        Ok((results, stats))
    }

    // --- Recipes ---

    pub fn create_recipe(&self, name: &str, servings: f64) -> Result<Recipe> {
        let name = name.trim();
        if name.is_empty() {
            bail!(LarderError::InvalidInput("recipe name must not be empty".to_string()));
        }
        validate_servings(servings)
            .map_err(|e| LarderError::InvalidInput(e.to_string()))?;
        self.db.create_recipe(name, servings)
    }

    pub fn add_ingredient(
        &self,
        recipe_id: &str,
        name: &str,
        amount: f64,
        unit: &str,
    ) -> Result<RecipeIngredient> {
        let name = name.trim();
        if name.is_empty() {
            bail!(LarderError::InvalidInput("ingredient name must not be empty".to_string()));
        }
        if !amount.is_finite() || amount < 0.0 {
            bail!(LarderError::InvalidInput(format!("invalid amount {amount}")));
        }
        self.db.add_recipe_ingredient(
            recipe_id,
            name,
            &Quantity {
                amount,
                unit: unit.trim().to_string(),
            },
        )
    }

    pub fn list_recipes(&self) -> Result<Vec<Recipe>> {
        self.db.list_recipes()
    }

    pub fn get_recipe(&self, id: &str) -> Result<Recipe> {
        self.db.get_recipe(id)
    }

    pub fn get_recipe_ingredients(&self, recipe_id: &str) -> Result<Vec<RecipeIngredient>> {
        self.db.get_recipe_ingredients(recipe_id)
    }

    // --- Review ---

    pub fn list_pending(&self, filter: &PendingFilter) -> Result<Vec<PendingItem>> {
        review::list_pending(&self.db, &self.db, &self.matcher, filter)
    }

    pub fn confirm(&self, req: &ConfirmRequest) -> Result<ConfirmedMatch> {
        review::confirm(&self.db, req)
    }

    pub fn reject(&self, recipe_ingredient_id: &str) -> Result<Rejection> {
        review::reject(&self.db, recipe_ingredient_id)
    }

    pub fn manual_override(
        &self,
        recipe_ingredient_id: &str,
        canonical_id: &str,
    ) -> Result<ConfirmedMatch> {
        review::manual_override(&self.db, recipe_ingredient_id, canonical_id)
    }

    #[must_use]
    pub fn bulk_confirm(&self, items: &[ConfirmRequest]) -> Vec<BulkItemResult> {
        review::bulk_confirm(&self.db, items)
    }

    pub fn review_stats(&self) -> Result<ReviewStats> {
        review::stats(&self.db)
    }

    // --- Nutrition ---

    pub fn aggregate(&self, recipe_id: &str) -> Result<NutritionSummary> {
        let recipe = self.db.get_recipe(recipe_id)?;
        let rows = self.db.get_matched_ingredients(recipe_id)?;
        Ok(nutrition::aggregate(&recipe, &rows))
    }
}
