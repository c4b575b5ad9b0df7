use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::warn;
use uuid::Uuid;

use crate::error::{LarderError, classify_sqlite, is_retryable};
use crate::import::{BatchStore, BatchWrite};
use crate::matcher::{CanonicalPage, CanonicalSource, PageCursor};
use crate::models::{
    CanonicalIngredient, ConfirmedMatch, MatchType, Quantity, Recipe, RecipeIngredient, Rejection,
    ReviewStats,
};
use crate::review::PendingFilter;

const BUSY_ATTEMPTS: u32 = 3;
const BUSY_BACKOFF_MS: u64 = 50;

const CANONICAL_COLUMNS: &str = "id, name, normalized_name, category, calories_per_100g,
    protein_per_100g, carbs_per_100g, fat_per_100g, fiber_per_100g, vitamins, minerals,
    search_terms, common_names, source, source_id, is_active";

const INGREDIENT_COLUMNS: &str = "ri.id, ri.recipe_id, ri.name, ri.amount, ri.unit";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(2))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS canonical_ingredients (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    normalized_name TEXT NOT NULL,
                    category TEXT NOT NULL,
                    calories_per_100g REAL,
                    protein_per_100g REAL,
                    carbs_per_100g REAL,
                    fat_per_100g REAL,
                    fiber_per_100g REAL,
                    vitamins TEXT NOT NULL DEFAULT '{}',
                    minerals TEXT NOT NULL DEFAULT '{}',
                    search_terms TEXT NOT NULL DEFAULT '[]',
                    common_names TEXT NOT NULL DEFAULT '[]',
                    source TEXT NOT NULL,
                    source_id TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_canonical_active_name
                    ON canonical_ingredients(normalized_name) WHERE is_active = 1;

                CREATE TABLE IF NOT EXISTS recipes (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    servings REAL NOT NULL DEFAULT 1.0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipe_ingredients (
                    id TEXT PRIMARY KEY,
                    recipe_id TEXT NOT NULL REFERENCES recipes(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    amount REAL NOT NULL,
                    unit TEXT NOT NULL,
                    position INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_recipe_ingredients_recipe
                    ON recipe_ingredients(recipe_id, position);

                CREATE TABLE IF NOT EXISTS confirmed_matches (
                    recipe_ingredient_id TEXT PRIMARY KEY
                        REFERENCES recipe_ingredients(id) ON DELETE CASCADE,
                    canonical_id TEXT NOT NULL REFERENCES canonical_ingredients(id),
                    confidence INTEGER NOT NULL,
                    match_type TEXT NOT NULL,
                    confirmed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS match_rejections (
                    recipe_ingredient_id TEXT PRIMARY KEY
                        REFERENCES recipe_ingredients(id) ON DELETE CASCADE,
                    rejected_at TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        // Checkpoints cover record ranges so a rerun with another batch size
        // still knows exactly which records are stored. Index-keyed rows from
        // version 1 cannot be mapped to ranges and are dropped.
        if version < 2 {
            self.conn.execute_batch(
                "DROP TABLE IF EXISTS import_checkpoints;

                CREATE TABLE import_checkpoints (
                    content_key TEXT NOT NULL,
                    start_record INTEGER NOT NULL,
                    end_record INTEGER NOT NULL,
                    records INTEGER NOT NULL,
                    committed_at TEXT NOT NULL,
                    PRIMARY KEY (content_key, start_record, end_record)
                );

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    fn canonical_from_row(row: &rusqlite::Row) -> rusqlite::Result<CanonicalIngredient> {
        fn json<T: serde::de::DeserializeOwned + Default>(
            row: &rusqlite::Row,
            idx: usize,
        ) -> rusqlite::Result<T> {
            let raw: String = row.get(idx)?;
            serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })
        }
        Ok(CanonicalIngredient {
            id: row.get(0)?,
            name: row.get(1)?,
            normalized_name: row.get(2)?,
            category: row.get(3)?,
            calories_per_100g: row.get(4)?,
            protein_per_100g: row.get(5)?,
            carbs_per_100g: row.get(6)?,
            fat_per_100g: row.get(7)?,
            fiber_per_100g: row.get(8)?,
            vitamins: json::<BTreeMap<String, f64>>(row, 9)?,
            minerals: json::<BTreeMap<String, f64>>(row, 10)?,
            search_terms: json::<Vec<String>>(row, 11)?,
            common_names: json::<Vec<String>>(row, 12)?,
            source: row.get(13)?,
            source_id: row.get(14)?,
            is_active: row.get(15)?,
        })
    }

    fn ingredient_from_row(row: &rusqlite::Row) -> rusqlite::Result<RecipeIngredient> {
        Ok(RecipeIngredient {
            id: row.get(0)?,
            recipe_id: row.get(1)?,
            name: row.get(2)?,
            quantity: Quantity {
                amount: row.get(3)?,
                unit: row.get(4)?,
            },
        })
    }

    fn confirmed_from_row(row: &rusqlite::Row) -> rusqlite::Result<ConfirmedMatch> {
        let match_type: String = row.get(3)?;
        Ok(ConfirmedMatch {
            recipe_ingredient_id: row.get(0)?,
            canonical_id: row.get(1)?,
            confidence: row.get(2)?,
            match_type: match_type.parse().map_err(|e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
            })?,
            confirmed_at: row.get(4)?,
        })
    }

    fn recipe_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recipe> {
        Ok(Recipe {
            id: row.get(0)?,
            name: row.get(1)?,
            servings: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    /// Run `f`, retrying while the store reports busy or locked.
    fn with_busy_retry<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Err(e) if is_retryable(&e) && attempt < BUSY_ATTEMPTS => {
                    warn!(what, attempt, error = %e, "store busy, retrying");
                    std::thread::sleep(Duration::from_millis(BUSY_BACKOFF_MS << attempt));
                }
                other => return other,
            }
        }
    }

    // --- Canonical ingredients ---

    fn write_canonical(&self, c: &CanonicalIngredient, now: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO canonical_ingredients (id, name, normalized_name, category,
                    calories_per_100g, protein_per_100g, carbs_per_100g, fat_per_100g,
                    fiber_per_100g, vitamins, minerals, search_terms, common_names, source,
                    source_id, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
                 ON CONFLICT(id) DO UPDATE SET
                    calories_per_100g = excluded.calories_per_100g,
                    protein_per_100g = excluded.protein_per_100g,
                    carbs_per_100g = excluded.carbs_per_100g,
                    fat_per_100g = excluded.fat_per_100g,
                    fiber_per_100g = excluded.fiber_per_100g,
                    vitamins = excluded.vitamins,
                    minerals = excluded.minerals,
                    search_terms = excluded.search_terms,
                    common_names = excluded.common_names,
                    source_id = excluded.source_id,
                    updated_at = excluded.updated_at",
                params![
                    c.id,
                    c.name,
                    c.normalized_name,
                    c.category,
                    c.calories_per_100g,
                    c.protein_per_100g,
                    c.carbs_per_100g,
                    c.fat_per_100g,
                    c.fiber_per_100g,
                    serde_json::to_string(&c.vitamins)?,
                    serde_json::to_string(&c.minerals)?,
                    serde_json::to_string(&c.search_terms)?,
                    serde_json::to_string(&c.common_names)?,
                    c.source,
                    c.source_id,
                    c.is_active,
                    now,
                ],
            )
            .map_err(classify_sqlite)?;
        Ok(())
    }

    /// Insert a canonical record, or merge it into the stored record with the
    /// same id. Stored values survive when the incoming field is empty.
    pub fn upsert_canonical(&self, incoming: &CanonicalIngredient) -> Result<CanonicalIngredient> {
        let now = Local::now().to_rfc3339();
        let merged = match self.get_canonical(&incoming.id)? {
            Some(mut stored) => {
                stored.overlay(incoming);
                stored
            }
            None => incoming.clone(),
        };
        self.write_canonical(&merged, &now)
            .with_context(|| format!("Failed to upsert '{}'", incoming.name))?;
        Ok(merged)
    }

    pub fn get_canonical(&self, id: &str) -> Result<Option<CanonicalIngredient>> {
        let sql = format!("SELECT {CANONICAL_COLUMNS} FROM canonical_ingredients WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], Self::canonical_from_row)
            .optional()
            .map_err(classify_sqlite)
    }

    pub fn require_canonical(&self, id: &str) -> Result<CanonicalIngredient> {
        self.get_canonical(id)?
            .ok_or_else(|| LarderError::NotFound(format!("canonical ingredient '{id}'")).into())
    }

    /// Active records in insertion order, starting after rowid `after`.
    pub fn canonical_page(&self, after: PageCursor, limit: usize) -> Result<CanonicalPage> {
        let sql = format!(
            "SELECT {CANONICAL_COLUMNS}, rowid FROM canonical_ingredients
             WHERE is_active = 1 AND rowid > ?1 ORDER BY rowid LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![after, limit as i64], |row| {
                Ok((Self::canonical_from_row(row)?, row.get::<_, i64>(16)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(classify_sqlite)?;
        let next = if rows.len() == limit {
            rows.last().map(|(_, rowid)| *rowid)
        } else {
            None
        };
        Ok(CanonicalPage {
            records: rows.into_iter().map(|(record, _)| record).collect(),
            next,
        })
    }

    pub fn count_canonical(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM canonical_ingredients WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn set_canonical_active(&self, id: &str, active: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE canonical_ingredients SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, Local::now().to_rfc3339(), id],
        )?;
        Ok(rows > 0)
    }

    // --- Import checkpoints ---

    /// Record ranges already committed for an import, ordered by start.
    pub fn committed_ranges(&self, content_key: &str) -> Result<Vec<Range<usize>>> {
        let mut stmt = self.conn.prepare(
            "SELECT start_record, end_record FROM import_checkpoints
             WHERE content_key = ?1 ORDER BY start_record, end_record",
        )?;
        let rows = stmt
            .query_map(params![content_key], |row| {
                Ok(row.get::<_, usize>(0)?..row.get::<_, usize>(1)?)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(classify_sqlite)?;
        Ok(rows)
    }

    /// Upsert a batch in one transaction and record its checkpoint.
    pub fn commit_import_batch(
        &self,
        content_key: &str,
        range: Range<usize>,
        batch: &[CanonicalIngredient],
    ) -> Result<BatchWrite> {
        let tx = self.conn.unchecked_transaction().map_err(classify_sqlite)?;
        let mut write = BatchWrite::default();
        for record in batch {
            match self.upsert_canonical(record) {
                Ok(_) => write.written += 1,
                Err(e) if is_retryable(&e) => return Err(e),
                Err(e) => write.errors.push(format!("{}: {e:#}", record.id)),
            }
        }
        self.conn
            .execute(
                "INSERT OR REPLACE INTO import_checkpoints
                    (content_key, start_record, end_record, records, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    content_key,
                    range.start,
                    range.end,
                    write.written,
                    Local::now().to_rfc3339()
                ],
            )
            .map_err(classify_sqlite)?;
        tx.commit().map_err(classify_sqlite)?;
        Ok(write)
    }

    // --- Recipes ---

    pub fn create_recipe(&self, name: &str, servings: f64) -> Result<Recipe> {
        let recipe = Recipe {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            servings,
            created_at: Local::now().to_rfc3339(),
        };
        self.conn.execute(
            "INSERT INTO recipes (id, name, servings, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![recipe.id, recipe.name, recipe.servings, recipe.created_at],
        )?;
        Ok(recipe)
    }

    pub fn get_recipe(&self, id: &str) -> Result<Recipe> {
        self.conn
            .query_row(
                "SELECT id, name, servings, created_at FROM recipes WHERE id = ?1",
                params![id],
                Self::recipe_from_row,
            )
            .optional()?
            .ok_or_else(|| LarderError::NotFound(format!("recipe '{id}'")).into())
    }

    pub fn list_recipes(&self) -> Result<Vec<Recipe>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, servings, created_at FROM recipes ORDER BY name COLLATE NOCASE")?;
        let rows = stmt
            .query_map([], Self::recipe_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_recipe(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM recipes WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn add_recipe_ingredient(
        &self,
        recipe_id: &str,
        name: &str,
        quantity: &Quantity,
    ) -> Result<RecipeIngredient> {
        self.get_recipe(recipe_id)?;
        let position: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM recipe_ingredients WHERE recipe_id = ?1",
            params![recipe_id],
            |row| row.get(0),
        )?;
        let ingredient = RecipeIngredient {
            id: Uuid::new_v4().to_string(),
            recipe_id: recipe_id.to_string(),
            name: name.to_string(),
            quantity: quantity.clone(),
        };
        self.conn.execute(
            "INSERT INTO recipe_ingredients (id, recipe_id, name, amount, unit, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ingredient.id,
                ingredient.recipe_id,
                ingredient.name,
                quantity.amount,
                quantity.unit,
                position
            ],
        )?;
        Ok(ingredient)
    }

    pub fn get_recipe_ingredient(&self, id: &str) -> Result<Option<RecipeIngredient>> {
        let sql = format!("SELECT {INGREDIENT_COLUMNS} FROM recipe_ingredients ri WHERE ri.id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], Self::ingredient_from_row)
            .optional()?)
    }

    pub fn require_recipe_ingredient(&self, id: &str) -> Result<RecipeIngredient> {
        self.get_recipe_ingredient(id)?
            .ok_or_else(|| LarderError::NotFound(format!("recipe ingredient '{id}'")).into())
    }

    pub fn get_recipe_ingredients(&self, recipe_id: &str) -> Result<Vec<RecipeIngredient>> {
        let sql = format!(
            "SELECT {INGREDIENT_COLUMNS} FROM recipe_ingredients ri
             WHERE ri.recipe_id = ?1 ORDER BY ri.position"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![recipe_id], Self::ingredient_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ingredients of a recipe paired with their confirmed canonical record, if any.
    pub fn get_matched_ingredients(
        &self,
        recipe_id: &str,
    ) -> Result<Vec<(RecipeIngredient, Option<CanonicalIngredient>)>> {
        let mut out = Vec::new();
        for ingredient in self.get_recipe_ingredients(recipe_id)? {
            let canonical = match self.get_confirmed_match(&ingredient.id)? {
                Some(m) => self.get_canonical(&m.canonical_id)?,
                None => None,
            };
            out.push((ingredient, canonical));
        }
        Ok(out)
    }

    /// Ingredients without a confirmed match, optionally for one recipe.
    /// Rejected ingredients are left out unless `include_rejected` is set.
    pub fn get_unmatched_ingredients(
        &self,
        recipe_id: Option<&str>,
        include_rejected: bool,
    ) -> Result<Vec<RecipeIngredient>> {
        self.get_pending_ingredients(&PendingFilter {
            recipe_id: recipe_id.map(str::to_string),
            include_rejected,
            limit: usize::MAX,
            ..PendingFilter::default()
        })
    }

    pub fn get_pending_ingredients(&self, filter: &PendingFilter) -> Result<Vec<RecipeIngredient>> {
        let search = filter
            .search
            .as_deref()
            .map(|s| format!("%{}%", s.trim().to_lowercase()));
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {INGREDIENT_COLUMNS} FROM recipe_ingredients ri
             LEFT JOIN confirmed_matches cm ON cm.recipe_ingredient_id = ri.id
             LEFT JOIN match_rejections mr ON mr.recipe_ingredient_id = ri.id
             WHERE cm.recipe_ingredient_id IS NULL
               AND (?1 OR mr.recipe_ingredient_id IS NULL)
               AND (?2 IS NULL OR ri.recipe_id = ?2)
               AND (?3 IS NULL OR LOWER(ri.name) LIKE ?3)
             ORDER BY ri.recipe_id, ri.position
             LIMIT ?4 OFFSET ?5"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![
                    filter.include_rejected,
                    filter.recipe_id,
                    search,
                    limit,
                    filter.offset as i64
                ],
                Self::ingredient_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Review decisions ---

    pub fn get_confirmed_match(&self, recipe_ingredient_id: &str) -> Result<Option<ConfirmedMatch>> {
        Ok(self
            .conn
            .query_row(
                "SELECT recipe_ingredient_id, canonical_id, confidence, match_type, confirmed_at
                 FROM confirmed_matches WHERE recipe_ingredient_id = ?1",
                params![recipe_ingredient_id],
                Self::confirmed_from_row,
            )
            .optional()?)
    }

    /// Upsert the confirmed match for a recipe ingredient and clear any rejection.
    ///
    /// Re-confirming an identical decision keeps the original `confirmed_at`.
    pub fn upsert_confirmed_match(
        &self,
        recipe_ingredient_id: &str,
        canonical_id: &str,
        confidence: u8,
        match_type: MatchType,
    ) -> Result<ConfirmedMatch> {
        self.with_busy_retry("confirm", || {
            let tx = self.conn.unchecked_transaction().map_err(classify_sqlite)?;
            self.conn
                .execute(
                    "INSERT INTO confirmed_matches
                        (recipe_ingredient_id, canonical_id, confidence, match_type, confirmed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(recipe_ingredient_id) DO UPDATE SET
                        confirmed_at = CASE
                            WHEN confirmed_matches.canonical_id = excluded.canonical_id
                             AND confirmed_matches.confidence = excluded.confidence
                             AND confirmed_matches.match_type = excluded.match_type
                            THEN confirmed_matches.confirmed_at
                            ELSE excluded.confirmed_at END,
                        canonical_id = excluded.canonical_id,
                        confidence = excluded.confidence,
                        match_type = excluded.match_type",
                    params![
                        recipe_ingredient_id,
                        canonical_id,
                        confidence,
                        match_type.as_str(),
                        Local::now().to_rfc3339()
                    ],
                )
                .map_err(classify_sqlite)?;
            self.conn
                .execute(
                    "DELETE FROM match_rejections WHERE recipe_ingredient_id = ?1",
                    params![recipe_ingredient_id],
                )
                .map_err(classify_sqlite)?;
            tx.commit().map_err(classify_sqlite)?;
            Ok(())
        })?;
        self.get_confirmed_match(recipe_ingredient_id)?
            .context("Confirmed match missing after upsert")
    }

    /// Record a rejection and drop any confirmed match for the ingredient.
    pub fn reject_match(&self, recipe_ingredient_id: &str) -> Result<Rejection> {
        self.with_busy_retry("reject", || {
            let tx = self.conn.unchecked_transaction().map_err(classify_sqlite)?;
            self.conn
                .execute(
                    "INSERT INTO match_rejections (recipe_ingredient_id, rejected_at) VALUES (?1, ?2)
                     ON CONFLICT(recipe_ingredient_id) DO NOTHING",
                    params![recipe_ingredient_id, Local::now().to_rfc3339()],
                )
                .map_err(classify_sqlite)?;
            self.conn
                .execute(
                    "DELETE FROM confirmed_matches WHERE recipe_ingredient_id = ?1",
                    params![recipe_ingredient_id],
                )
                .map_err(classify_sqlite)?;
            tx.commit().map_err(classify_sqlite)?;
            Ok(())
        })?;
        self.get_rejection(recipe_ingredient_id)?
            .context("Rejection missing after insert")
    }

    pub fn get_rejection(&self, recipe_ingredient_id: &str) -> Result<Option<Rejection>> {
        Ok(self
            .conn
            .query_row(
                "SELECT recipe_ingredient_id, rejected_at FROM match_rejections
                 WHERE recipe_ingredient_id = ?1",
                params![recipe_ingredient_id],
                |row| {
                    Ok(Rejection {
                        recipe_ingredient_id: row.get(0)?,
                        rejected_at: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn review_stats(&self) -> Result<ReviewStats> {
        let (total, confirmed, rejected): (i64, i64, i64) = self.conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM recipe_ingredients),
                (SELECT COUNT(*) FROM confirmed_matches),
                (SELECT COUNT(*) FROM match_rejections)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let (total, confirmed, rejected) = (total as usize, confirmed as usize, rejected as usize);
        Ok(ReviewStats {
            total,
            confirmed,
            rejected,
            pending: total.saturating_sub(confirmed + rejected),
        })
    }
}

impl CanonicalSource for Database {
    fn page(&self, after: PageCursor, limit: usize) -> Result<CanonicalPage> {
        self.canonical_page(after, limit)
    }
}

impl BatchStore for Database {
    fn committed_ranges(&self, content_key: &str) -> Result<Vec<Range<usize>>> {
        Database::committed_ranges(self, content_key)
    }

    fn commit_batch(
        &self,
        content_key: &str,
        range: Range<usize>,
        batch: &[CanonicalIngredient],
    ) -> Result<BatchWrite> {
        self.commit_import_batch(content_key, range, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{commit_batches, import_csv};
    use crate::matcher::{Matcher, MatcherConfig, START_CURSOR};

    fn canonical(id: &str, name: &str) -> CanonicalIngredient {
        CanonicalIngredient {
            id: id.to_string(),
            name: name.to_string(),
            normalized_name: crate::normalize::normalize_name(name),
            category: "other".to_string(),
            calories_per_100g: Some(100.0),
            protein_per_100g: None,
            carbs_per_100g: None,
            fat_per_100g: None,
            fiber_per_100g: None,
            vitamins: BTreeMap::new(),
            minerals: BTreeMap::new(),
            search_terms: vec![name.to_lowercase()],
            common_names: Vec::new(),
            source: "test".to_string(),
            source_id: None,
            is_active: true,
        }
    }

    fn grams(amount: f64) -> Quantity {
        Quantity {
            amount,
            unit: "g".to_string(),
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        assert_eq!(db.count_canonical().unwrap(), 0);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("larder.db");
        {
            let db = Database::open(&path).unwrap();
            db.upsert_canonical(&canonical("a", "Æble")).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.count_canonical().unwrap(), 1);
    }

    #[test]
    fn test_canonical_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let mut c = canonical("frida-spinat-1", "Spinat, rå");
        c.minerals.insert("iron".into(), 2.7);
        c.common_names.push("babyspinat".into());
        db.upsert_canonical(&c).unwrap();
        assert_eq!(db.get_canonical("frida-spinat-1").unwrap(), Some(c));
        assert!(db.get_canonical("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_never_clears_stored_values() {
        let db = Database::open_in_memory().unwrap();
        let mut first = canonical("x", "Smør");
        first.fat_per_100g = Some(81.0);
        db.upsert_canonical(&first).unwrap();

        let mut again = canonical("x", "Smør");
        again.calories_per_100g = None;
        again.protein_per_100g = Some(0.6);
        db.upsert_canonical(&again).unwrap();

        let stored = db.get_canonical("x").unwrap().unwrap();
        assert_eq!(stored.calories_per_100g, Some(100.0));
        assert_eq!(stored.fat_per_100g, Some(81.0));
        assert_eq!(stored.protein_per_100g, Some(0.6));
    }

    #[test]
    fn test_active_normalized_name_unique() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("a", "Løg")).unwrap();
        assert!(db.upsert_canonical(&canonical("b", "løg")).is_err());

        db.set_canonical_active("a", false).unwrap();
        db.upsert_canonical(&canonical("b", "løg")).unwrap();
        assert_eq!(db.count_canonical().unwrap(), 1);
    }

    #[test]
    fn test_canonical_page_order_and_active_only() {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in [("c", "Citron"), ("a", "Æble"), ("b", "Banan")] {
            db.upsert_canonical(&canonical(id, name)).unwrap();
        }
        db.set_canonical_active("a", false).unwrap();
        let all = db.canonical_page(START_CURSOR, 10).unwrap();
        let ids: Vec<&str> = all.records.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(all.next.is_none());

        let first = db.canonical_page(START_CURSOR, 1).unwrap();
        assert_eq!(first.records[0].id, "c");
        // the inactive record between the two is skipped, not counted
        let second = db.canonical_page(first.next.unwrap(), 1).unwrap();
        assert_eq!(second.records[0].id, "b");
        let end = db.canonical_page(second.next.unwrap(), 1).unwrap();
        assert!(end.records.is_empty());
        assert!(end.next.is_none());
    }

    #[test]
    fn test_find_match_pages_through_store() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..7 {
            db.upsert_canonical(&canonical(&format!("f{i}"), &format!("Fisk {i}"))).unwrap();
        }
        db.upsert_canonical(&canonical("tomat", "Tomat")).unwrap();
        let m = Matcher::new(MatcherConfig {
            page_size: 3,
            ..MatcherConfig::default()
        });
        let got = m.find_match(&db, "tomat").unwrap();
        assert_eq!(got[0].canonical_id, "tomat");
    }

    #[test]
    fn test_commit_batches_checkpoints() {
        let db = Database::open_in_memory().unwrap();
        let csv = "Name,Energy_kcal\nÆble,52\nBanan,89\nCitron,29\n";
        let outcome = import_csv(csv.as_bytes()).unwrap();

        let first = commit_batches(&db, &outcome, 2).unwrap();
        assert_eq!(first.batches_committed, 2);
        assert_eq!(first.records_written, 3);
        assert_eq!(db.committed_ranges(&outcome.content_key).unwrap(), vec![0..2, 2..3]);

        let rerun = commit_batches(&db, &outcome, 2).unwrap();
        assert_eq!(rerun.batches_committed, 0);
        assert_eq!(rerun.batches_skipped, 2);
        assert_eq!(db.count_canonical().unwrap(), 3);
    }

    #[test]
    fn test_resume_with_larger_batch_size_writes_everything() {
        let db = Database::open_in_memory().unwrap();
        let mut csv = String::from("Name,Energy_kcal\n");
        for i in 0..30 {
            csv.push_str(&format!("food {i},{i}\n"));
        }
        let outcome = import_csv(csv.as_bytes()).unwrap();

        // an earlier run with batch size 5 stopped after two batches
        for (i, batch) in outcome.batches(5).into_iter().take(2).enumerate() {
            db.commit_import_batch(&outcome.content_key, i * 5..i * 5 + 5, batch)
                .unwrap();
        }
        assert_eq!(db.count_canonical().unwrap(), 10);

        let summary = commit_batches(&db, &outcome, 10).unwrap();
        assert_eq!(summary.batches_skipped, 1);
        assert_eq!(summary.batches_committed, 2);
        assert_eq!(summary.records_written, 20);
        assert_eq!(db.count_canonical().unwrap(), 30);

        let rerun = commit_batches(&db, &outcome, 7).unwrap();
        assert_eq!(rerun.batches_committed, 0);
        assert_eq!(db.count_canonical().unwrap(), 30);
    }

    #[test]
    fn test_commit_batch_records_per_record_failures() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("other-id", "Æble")).unwrap();
        let outcome = import_csv("Name,Energy_kcal\nÆble,52\nBanan,89\n".as_bytes()).unwrap();
        let summary = commit_batches(&db, &outcome, 10).unwrap();
        assert_eq!(summary.records_written, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(db.count_canonical().unwrap(), 2);
    }

    #[test]
    fn test_recipe_and_ingredients() {
        let db = Database::open_in_memory().unwrap();
        let recipe = db.create_recipe("Tomatsuppe", 4.0).unwrap();
        let a = db.add_recipe_ingredient(&recipe.id, "tomater", &grams(500.0)).unwrap();
        let b = db.add_recipe_ingredient(&recipe.id, "løg", &grams(100.0)).unwrap();

        let got = db.get_recipe_ingredients(&recipe.id).unwrap();
        assert_eq!(got, vec![a.clone(), b]);
        assert_eq!(db.get_recipe_ingredient(&a.id).unwrap(), Some(a));
        assert_eq!(db.list_recipes().unwrap().len(), 1);

        assert!(db.delete_recipe(&recipe.id).unwrap());
        assert!(db.get_recipe_ingredients(&recipe.id).unwrap().is_empty());
    }

    #[test]
    fn test_add_ingredient_unknown_recipe() {
        let db = Database::open_in_memory().unwrap();
        let err = db.add_recipe_ingredient("nope", "salt", &grams(1.0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LarderError>(),
            Some(LarderError::NotFound(_))
        ));
    }

    #[test]
    fn test_confirm_twice_keeps_one_row() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("tomat", "Tomat")).unwrap();
        let recipe = db.create_recipe("Salat", 1.0).unwrap();
        let ri = db.add_recipe_ingredient(&recipe.id, "tomat", &grams(100.0)).unwrap();

        let first = db
            .upsert_confirmed_match(&ri.id, "tomat", 95, MatchType::Exact)
            .unwrap();
        let second = db
            .upsert_confirmed_match(&ri.id, "tomat", 95, MatchType::Exact)
            .unwrap();
        assert_eq!(first, second);

        let n: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM confirmed_matches", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_confirm_supersedes_and_clears_rejection() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("tomat", "Tomat")).unwrap();
        db.upsert_canonical(&canonical("puré", "Tomatpuré")).unwrap();
        let recipe = db.create_recipe("Salat", 1.0).unwrap();
        let ri = db.add_recipe_ingredient(&recipe.id, "tomat", &grams(100.0)).unwrap();

        db.reject_match(&ri.id).unwrap();
        assert!(db.get_rejection(&ri.id).unwrap().is_some());

        db.upsert_confirmed_match(&ri.id, "puré", 75, MatchType::Fuzzy)
            .unwrap();
        let m = db
            .upsert_confirmed_match(&ri.id, "tomat", 100, MatchType::Manual)
            .unwrap();
        assert_eq!(m.canonical_id, "tomat");
        assert_eq!(m.match_type, MatchType::Manual);
        assert!(db.get_rejection(&ri.id).unwrap().is_none());
    }

    #[test]
    fn test_pending_filters() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("tomat", "Tomat")).unwrap();
        let r1 = db.create_recipe("Suppe", 2.0).unwrap();
        let r2 = db.create_recipe("Salat", 1.0).unwrap();
        let a = db.add_recipe_ingredient(&r1.id, "tomater", &grams(400.0)).unwrap();
        let b = db.add_recipe_ingredient(&r1.id, "løg", &grams(100.0)).unwrap();
        let c = db.add_recipe_ingredient(&r2.id, "agurk", &grams(200.0)).unwrap();

        db.upsert_confirmed_match(&a.id, "tomat", 88, MatchType::Synonym)
            .unwrap();
        db.reject_match(&c.id).unwrap();

        let pending = db.get_pending_ingredients(&PendingFilter::default()).unwrap();
        assert_eq!(pending, vec![b.clone()]);

        let with_rejected = db
            .get_pending_ingredients(&PendingFilter {
                include_rejected: true,
                ..PendingFilter::default()
            })
            .unwrap();
        assert_eq!(with_rejected.len(), 2);

        let by_recipe = db
            .get_pending_ingredients(&PendingFilter {
                recipe_id: Some(r2.id.clone()),
                include_rejected: true,
                ..PendingFilter::default()
            })
            .unwrap();
        assert_eq!(by_recipe, vec![c]);

        let by_search = db
            .get_pending_ingredients(&PendingFilter {
                search: Some("LØ".to_string()),
                ..PendingFilter::default()
            })
            .unwrap();
        assert_eq!(by_search, vec![b]);

        let stats = db.review_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.confirmed, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_corrupt_match_type_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("tomat", "Tomat")).unwrap();
        let recipe = db.create_recipe("Salat", 1.0).unwrap();
        let ri = db.add_recipe_ingredient(&recipe.id, "tomat", &grams(100.0)).unwrap();
        db.conn
            .execute(
                "INSERT INTO confirmed_matches
                    (recipe_ingredient_id, canonical_id, confidence, match_type, confirmed_at)
                 VALUES (?1, 'tomat', 95, 'bogus', '2024-01-01T00:00:00+00:00')",
                params![ri.id],
            )
            .unwrap();
        assert!(db.get_confirmed_match(&ri.id).is_err());
    }

    #[test]
    fn test_reject_drops_confirmed_match() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("tomat", "Tomat")).unwrap();
        let recipe = db.create_recipe("Salat", 1.0).unwrap();
        let ri = db.add_recipe_ingredient(&recipe.id, "tomat", &grams(100.0)).unwrap();
        db.upsert_confirmed_match(&ri.id, "tomat", 95, MatchType::Exact)
            .unwrap();
        db.reject_match(&ri.id).unwrap();
        assert!(db.get_confirmed_match(&ri.id).unwrap().is_none());
    }

    #[test]
    fn test_matched_ingredients() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_canonical(&canonical("tomat", "Tomat")).unwrap();
        let recipe = db.create_recipe("Salat", 1.0).unwrap();
        let a = db.add_recipe_ingredient(&recipe.id, "tomat", &grams(100.0)).unwrap();
        db.add_recipe_ingredient(&recipe.id, "salt", &grams(2.0)).unwrap();
        db.upsert_confirmed_match(&a.id, "tomat", 95, MatchType::Exact)
            .unwrap();

        let rows = db.get_matched_ingredients(&recipe.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1.as_ref().map(|c| c.id.as_str()), Some("tomat"));
        assert!(rows[1].1.is_none());
    }
}
