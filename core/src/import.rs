//! Nutrition dataset import: CSV parsing, canonicalization, dedup, batching.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{LarderError, is_retryable};
use crate::models::{
    CanonicalIngredient, CommitSummary, DEFAULT_CATEGORY, ImportStats, RawNutritionRecord,
};
use crate::normalize::{normalize_name, search_terms, slugify};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const SOURCE_FRIDA: &str = "frida_dtu";

const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_BACKOFF_MS: u64 = 100;

/// Name columns, first non-empty wins.
pub const NAME_FIELDS: &[&str] = &["FødevareNavn", "FoodName", "name", "Name"];
const SOURCE_ID_FIELDS: &[&str] = &["FoodID", "FødevareID", "id", "ID"];
const CATEGORY_FIELDS: &[&str] = &["FødevareGruppe", "FoodGroup", "Category", "category"];
const PARAMETER_FIELDS: &[&str] = &["ParameterNavn", "ParameterName"];
const VALUE_FIELD: &str = "ResVal";

/// Wide-format columns for each nutrient key. Each list ends with the key
/// itself so folded long-format records resolve through the same table.
const NUTRIENT_FIELDS: &[(&str, &[&str])] = &[
    ("calories", &["Energy_kcal", "Energi (kcal)", "kcal", "calories"]),
    ("protein", &["Protein", "protein"]),
    ("carbs", &["Carbohydrates", "Kulhydrat", "carbs"]),
    ("fat", &["Fat", "Fedt", "fat"]),
    ("fiber", &["Fiber", "Kostfibre", "fiber"]),
    ("vitamin_a", &["VitaminA", "vitamin_a"]),
    ("vitamin_b1", &["Thiamine", "VitaminB1", "vitamin_b1"]),
    ("vitamin_b2", &["Riboflavin", "VitaminB2", "vitamin_b2"]),
    ("vitamin_b3", &["Niacin", "VitaminB3", "vitamin_b3"]),
    ("vitamin_b6", &["VitaminB6", "vitamin_b6"]),
    ("vitamin_b12", &["VitaminB12", "vitamin_b12"]),
    ("vitamin_c", &["VitaminC", "vitamin_c"]),
    ("vitamin_d", &["VitaminD", "vitamin_d"]),
    ("vitamin_e", &["VitaminE", "vitamin_e"]),
    ("folate", &["Folate", "folate"]),
    ("calcium", &["Calcium", "calcium"]),
    ("iron", &["Iron", "iron"]),
    ("magnesium", &["Magnesium", "magnesium"]),
    ("phosphorus", &["Phosphorus", "phosphor", "phosphorus"]),
    ("potassium", &["Potassium", "potassium"]),
    ("sodium", &["Sodium", "sodium"]),
    ("zinc", &["Zinc", "zinc"]),
    ("selenium", &["Selenium", "selenium"]),
];

struct ParameterRule {
    any: &'static [&'static str],
    none: &'static [&'static str],
    key: &'static str,
}

/// Long-format parameter names to nutrient keys. Order matters: B12 must be
/// tried before B1.
const PARAMETER_RULES: &[ParameterRule] = &[
    ParameterRule { any: &["energi (kcal)", "energy (kcal)"], none: &[], key: "calories" },
    ParameterRule { any: &["protein"], none: &[], key: "protein" },
    ParameterRule { any: &["kulhydrat", "carbohydrate"], none: &[], key: "carbs" },
    ParameterRule { any: &["fedt", "fat"], none: &["fatty", "fedtsyre"], key: "fat" },
    ParameterRule { any: &["kostfibre", "dietary fiber"], none: &[], key: "fiber" },
    ParameterRule { any: &["vitamin a", "retinol"], none: &[], key: "vitamin_a" },
    ParameterRule { any: &["vitamin c", "ascorbic"], none: &[], key: "vitamin_c" },
    ParameterRule { any: &["vitamin d"], none: &[], key: "vitamin_d" },
    ParameterRule { any: &["vitamin e", "tocopherol"], none: &[], key: "vitamin_e" },
    ParameterRule { any: &["vitamin b12"], none: &[], key: "vitamin_b12" },
    ParameterRule { any: &["vitamin b6"], none: &[], key: "vitamin_b6" },
    ParameterRule { any: &["thiamin", "vitamin b1"], none: &[], key: "vitamin_b1" },
    ParameterRule { any: &["riboflavin", "vitamin b2"], none: &[], key: "vitamin_b2" },
    ParameterRule { any: &["niacin", "vitamin b3"], none: &[], key: "vitamin_b3" },
    ParameterRule { any: &["folate", "folat", "folic"], none: &[], key: "folate" },
    ParameterRule { any: &["calcium"], none: &[], key: "calcium" },
    ParameterRule { any: &["iron", "jern"], none: &[], key: "iron" },
    ParameterRule { any: &["magnesium"], none: &[], key: "magnesium" },
    ParameterRule { any: &["phosphor", "fosfor"], none: &[], key: "phosphorus" },
    ParameterRule { any: &["potassium", "kalium"], none: &[], key: "potassium" },
    ParameterRule { any: &["sodium", "natrium"], none: &[], key: "sodium" },
    ParameterRule { any: &["zinc", "zink"], none: &[], key: "zinc" },
    ParameterRule { any: &["selenium", "selen"], none: &[], key: "selenium" },
];

/// Category keywords, matched as substrings of the dataset category, then of
/// the food name. First rule wins.
const CATEGORY_RULES: &[(&[&str], &str)] = &[
    (&["dairy", "mejeri", "milk", "mælk", "cheese", "ost", "yoghurt", "fløde"], "mejeriprodukter"),
    (
        &["meat", "kød", "beef", "pork", "chicken", "kylling", "okse", "svin", "lam"],
        "kød",
    ),
    (&["fish", "fisk", "salmon", "laks", "cod", "torsk", "rejer"], "fisk"),
    (&["oil", "olie", "butter", "smør", "fedtstof", "margarine"], "fedtstoffer"),
    (
        &["vegetable", "grønsag", "grøntsag", "potato", "kartof", "carrot", "gulerod", "tomat", "spinat", "løg"],
        "grøntsager",
    ),
    (&["fruit", "frugt", "apple", "æble", "banan", "jordbær"], "frugt"),
    (&["nut", "nød", "almond", "mandel"], "nødder"),
    (&["grain", "cereal", "korn", "bread", "brød", "flour", "mel", "rice", "ris", "pasta"], "kornprodukter"),
    (&["spice", "krydder", "herb"], "krydderier"),
];

/// Everything one import run produced.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub ingredients: Vec<CanonicalIngredient>,
    pub stats: ImportStats,
    pub errors: Vec<LarderError>,
    /// sha256 of the input bytes; keys batch checkpoints.
    pub content_key: String,
}

impl ImportOutcome {
    #[must_use]
    pub fn batches(&self, batch_size: usize) -> Vec<&[CanonicalIngredient]> {
        batches(&self.ingredients, batch_size)
    }
}

/// Split records into fixed-size chunks; the last one may be shorter.
#[must_use]
pub fn batches(ingredients: &[CanonicalIngredient], batch_size: usize) -> Vec<&[CanonicalIngredient]> {
    ingredients.chunks(batch_size.max(1)).collect()
}

/// State owned by a single import invocation.
#[derive(Debug, Default)]
pub struct ImportRun {
    names_seen: HashSet<String>,
    ingredients: Vec<CanonicalIngredient>,
    stats: ImportStats,
    errors: Vec<LarderError>,
}

impl ImportRun {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one parsed row. Returns false when the row was dropped as a duplicate.
    pub fn push(&mut self, raw: &RawNutritionRecord) -> bool {
        let Some((ingredient, issues)) = convert(raw) else {
            self.skip(LarderError::InvalidRow {
                row: raw.row,
                reason: "no name".to_string(),
            });
            return false;
        };
        self.stats.rows_processed += 1;
        for issue in issues {
            warn!(%issue, "unparseable nutrient value");
            self.errors.push(issue);
        }

        if !self.names_seen.insert(ingredient.normalized_name.clone()) {
            let dup = LarderError::DuplicateName(ingredient.normalized_name);
            debug!(row = raw.row, "{dup}");
            self.stats.duplicates_removed += 1;
            return false;
        }

        let stats = &mut self.stats;
        *stats
            .category_counts
            .entry(ingredient.category.clone())
            .or_insert(0) += 1;
        if ingredient.calories_per_100g.is_some() {
            stats.with_calories += 1;
        }
        if ingredient.protein_per_100g.is_some() {
            stats.with_protein += 1;
        }
        if !ingredient.vitamins.is_empty() {
            stats.with_vitamins += 1;
        }
        if !ingredient.minerals.is_empty() {
            stats.with_minerals += 1;
        }
        self.ingredients.push(ingredient);
        true
    }

    /// Record a row that never became a record.
    pub fn skip(&mut self, err: LarderError) {
        warn!(%err, "skipping row");
        self.stats.rows_processed += 1;
        self.stats.rows_skipped += 1;
        self.errors.push(err);
    }

    #[must_use]
    pub fn finish(mut self, content_key: String) -> ImportOutcome {
        self.stats.total_ingredients = self.ingredients.len();
        self.stats.categories_found = self.stats.category_counts.keys().cloned().collect();
        info!(
            processed = self.stats.rows_processed,
            skipped = self.stats.rows_skipped,
            duplicates = self.stats.duplicates_removed,
            total = self.stats.total_ingredients,
            "import run finished"
        );
        ImportOutcome {
            ingredients: self.ingredients,
            stats: self.stats,
            errors: self.errors,
            content_key,
        }
    }
}

fn first_non_empty<'a>(fields: &'a BTreeMap<String, String>, aliases: &[&str]) -> Option<&'a str> {
    aliases
        .iter()
        .filter_map(|a| fields.get(*a))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

/// Resolve a row's name. Fails when every name column is empty.
pub fn parse_row(row: usize, fields: BTreeMap<String, String>) -> Result<RawNutritionRecord, LarderError> {
    let Some(name) = first_non_empty(&fields, NAME_FIELDS).map(str::to_string) else {
        return Err(LarderError::InvalidRow {
            row,
            reason: "no name".to_string(),
        });
    };
    let source_id = first_non_empty(&fields, SOURCE_ID_FIELDS).map(str::to_string);
    let category = first_non_empty(&fields, CATEGORY_FIELDS)
        .unwrap_or_default()
        .to_string();
    Ok(RawNutritionRecord {
        row,
        source_id,
        name,
        category,
        fields,
    })
}

/// Numeric field parse; accepts a decimal comma.
#[must_use]
pub fn parse_numeric(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

#[must_use]
pub fn category_for(raw_category: &str, name: &str) -> &'static str {
    let lookup = |text: &str| {
        let lower = text.to_lowercase();
        CATEGORY_RULES
            .iter()
            .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
            .map(|(_, category)| *category)
    };
    lookup(raw_category)
        .or_else(|| lookup(name))
        .unwrap_or(DEFAULT_CATEGORY)
}

/// Stable id derived from the normalized name and category.
#[must_use]
pub fn ingredient_id(normalized_name: &str, category: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(category.as_bytes());
    let digest = hex(&hasher.finalize());
    format!("frida-{}-{}", slugify(normalized_name), &digest[..8])
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[must_use]
pub fn content_key(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

/// Build a canonical record from a raw row. `None` when the row has no name.
#[must_use]
pub fn to_canonical(raw: &RawNutritionRecord) -> Option<CanonicalIngredient> {
    convert(raw).map(|(ingredient, _)| ingredient)
}

fn convert(raw: &RawNutritionRecord) -> Option<(CanonicalIngredient, Vec<LarderError>)> {
    let name = if raw.name.trim().is_empty() {
        first_non_empty(&raw.fields, NAME_FIELDS)?
    } else {
        raw.name.trim()
    };
    let normalized_name = normalize_name(name);
    if normalized_name.is_empty() {
        return None;
    }
    let category = category_for(&raw.category, &normalized_name).to_string();

    let mut ingredient = CanonicalIngredient {
        id: ingredient_id(&normalized_name, &category),
        name: name.to_string(),
        normalized_name,
        category,
        calories_per_100g: None,
        protein_per_100g: None,
        carbs_per_100g: None,
        fat_per_100g: None,
        fiber_per_100g: None,
        vitamins: BTreeMap::new(),
        minerals: BTreeMap::new(),
        search_terms: search_terms(name),
        common_names: Vec::new(),
        source: SOURCE_FRIDA.to_string(),
        source_id: raw.source_id.clone(),
        is_active: true,
    };

    let mut issues = Vec::new();
    for (key, aliases) in NUTRIENT_FIELDS {
        let Some(value) = first_non_empty(&raw.fields, aliases) else {
            continue;
        };
        match parse_numeric(value) {
            Some(v) => {
                ingredient.set_nutrient(key, v);
            }
            None => issues.push(LarderError::ParseError {
                row: raw.row,
                field: (*key).to_string(),
                value: value.to_string(),
            }),
        }
    }
    Some((ingredient, issues))
}

fn parameter_key(parameter: &str) -> Option<&'static str> {
    let lower = parameter.to_lowercase();
    PARAMETER_RULES
        .iter()
        .find(|r| r.any.iter().any(|n| lower.contains(n)) && !r.none.iter().any(|n| lower.contains(n)))
        .map(|r| r.key)
}

/// Parse a CSV dataset (wide or long layout) into deduplicated canonical records.
pub fn import_csv<R: Read>(mut reader: R) -> Result<ImportOutcome> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .context("Failed to read dataset")?;
    let key = content_key(&bytes);

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes.as_slice());
    let headers: Vec<String> = rdr
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    if !headers
        .iter()
        .any(|h| NAME_FIELDS.contains(&h.as_str()))
    {
        bail!("Missing name column (expected one of {})", NAME_FIELDS.join(", "));
    }

    let col = |name: &str| headers.iter().position(|h| h == name);
    let long = PARAMETER_FIELDS.iter().any(|p| col(p).is_some()) && col(VALUE_FIELD).is_some();

    let mut rows: Vec<(usize, BTreeMap<String, String>)> = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to parse CSV row {}", i + 2))?;
        let fields = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        rows.push((i + 1, fields));
    }

    let rows = if long {
        debug!("long dataset layout detected");
        fold_long_rows(rows)
    } else {
        rows
    };

    let mut run = ImportRun::new();
    for (row, fields) in rows {
        match parse_row(row, fields) {
            Ok(raw) => {
                run.push(&raw);
            }
            Err(err) => run.skip(err),
        }
    }
    Ok(run.finish(key))
}

/// Group long-format rows by food id in first-seen order, one field per nutrient.
fn fold_long_rows(rows: Vec<(usize, BTreeMap<String, String>)>) -> Vec<(usize, BTreeMap<String, String>)> {
    let mut order: Vec<(usize, BTreeMap<String, String>)> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();

    for (row, fields) in rows {
        let food_key = first_non_empty(&fields, SOURCE_ID_FIELDS)
            .or_else(|| first_non_empty(&fields, NAME_FIELDS))
            .map(str::to_string);
        let Some(food_key) = food_key else {
            // no id and no name: surfaces as an invalid row
            order.push((row, BTreeMap::new()));
            continue;
        };
        let parameter = first_non_empty(&fields, PARAMETER_FIELDS).and_then(parameter_key);
        let value = fields.get(VALUE_FIELD).cloned().unwrap_or_default();

        let slot = *index.entry(food_key).or_insert_with(|| {
            let base: BTreeMap<String, String> = fields
                .iter()
                .filter(|(k, _)| {
                    NAME_FIELDS.contains(&k.as_str())
                        || SOURCE_ID_FIELDS.contains(&k.as_str())
                        || CATEGORY_FIELDS.contains(&k.as_str())
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            order.push((row, base));
            order.len() - 1
        });
        if let Some(key) = parameter {
            order[slot].1.entry(key.to_string()).or_insert(value);
        }
    }
    order
}

fn is_batch_file(name: &str) -> bool {
    name.strip_prefix("batch-")
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Write `batch-NNN.json` files and `import-summary.md` into `dir`.
/// Batch files left by an earlier run are removed first.
pub fn write_batches(dir: &Path, outcome: &ImportOutcome, batch_size: usize) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read output directory: {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.file_name().and_then(|n| n.to_str()).is_some_and(is_batch_file) {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale {}", path.display()))?;
            debug!(path = %path.display(), "removed stale batch file");
        }
    }

    let mut written = Vec::new();
    let chunks = outcome.batches(batch_size);
    for (i, chunk) in chunks.iter().enumerate() {
        let path = dir.join(format!("batch-{:03}.json", i + 1));
        let json = serde_json::to_string_pretty(chunk)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(batch = i + 1, records = chunk.len(), "wrote batch file");
        written.push(path);
    }

    let summary = dir.join("import-summary.md");
    std::fs::write(&summary, render_summary(outcome, chunks.len(), batch_size))
        .with_context(|| format!("Failed to write {}", summary.display()))?;
    written.push(summary);
    Ok(written)
}

fn pct(part: usize, total: usize) -> usize {
    if total == 0 { 0 } else { (part * 100 + total / 2) / total }
}

#[must_use]
pub fn render_summary(outcome: &ImportOutcome, batch_count: usize, batch_size: usize) -> String {
    let s = &outcome.stats;
    let mut md = String::new();
    let _ = writeln!(md, "# Import summary\n");
    let _ = writeln!(md, "Content key: `{}`\n", outcome.content_key);
    let _ = writeln!(md, "## Statistics\n");
    let _ = writeln!(md, "- Rows processed: {}", s.rows_processed);
    let _ = writeln!(md, "- Rows skipped: {}", s.rows_skipped);
    let _ = writeln!(md, "- Duplicates removed: {}", s.duplicates_removed);
    let _ = writeln!(md, "- Total ingredients: {}", s.total_ingredients);
    let _ = writeln!(
        md,
        "- With calories: {} ({}%)",
        s.with_calories,
        pct(s.with_calories, s.total_ingredients)
    );
    let _ = writeln!(
        md,
        "- With protein: {} ({}%)",
        s.with_protein,
        pct(s.with_protein, s.total_ingredients)
    );
    let _ = writeln!(
        md,
        "- With vitamins: {} ({}%)",
        s.with_vitamins,
        pct(s.with_vitamins, s.total_ingredients)
    );
    let _ = writeln!(
        md,
        "- With minerals: {} ({}%)",
        s.with_minerals,
        pct(s.with_minerals, s.total_ingredients)
    );
    let _ = writeln!(md, "\n## Categories\n");
    for (category, count) in &s.category_counts {
        let _ = writeln!(md, "- {category}: {count}");
    }
    let _ = writeln!(md, "\n## Batches\n");
    let _ = writeln!(md, "{batch_count} file(s) of up to {batch_size} records:\n");
    for i in 1..=batch_count {
        let _ = writeln!(md, "- batch-{i:03}.json");
    }
    if !outcome.errors.is_empty() {
        let _ = writeln!(md, "\n## Issues\n");
        for err in &outcome.errors {
            let _ = writeln!(md, "- {err}");
        }
    }
    md
}

/// Result of writing one batch.
#[derive(Debug, Default)]
pub struct BatchWrite {
    pub written: usize,
    pub errors: Vec<String>,
}

/// Store side of a batch commit.
pub trait BatchStore {
    /// Record ranges (positions in the deduplicated import) already committed.
    fn committed_ranges(&self, content_key: &str) -> Result<Vec<Range<usize>>>;

    /// Upsert every record and checkpoint `range` atomically. Per-record
    /// failures land in `BatchWrite::errors`; a store-unavailable error fails
    /// the whole batch with nothing written.
    fn commit_batch(
        &self,
        content_key: &str,
        range: Range<usize>,
        batch: &[CanonicalIngredient],
    ) -> Result<BatchWrite>;
}

/// Whether `range` lies inside the union of `committed`, sorted by start.
fn covered(committed: &[Range<usize>], range: &Range<usize>) -> bool {
    let mut reach = range.start;
    for r in committed {
        if r.start > reach {
            break;
        }
        reach = reach.max(r.end);
        if reach >= range.end {
            return true;
        }
    }
    reach >= range.end
}

/// Commit an import to the store, skipping batches a previous run checkpointed.
pub fn commit_batches<S: BatchStore>(
    store: &S,
    outcome: &ImportOutcome,
    batch_size: usize,
) -> Result<CommitSummary> {
    let mut summary = CommitSummary::default();
    let mut committed = store.committed_ranges(&outcome.content_key)?;
    committed.sort_by_key(|r| (r.start, r.end));

    let mut start = 0;
    for (index, batch) in outcome.batches(batch_size).into_iter().enumerate() {
        let range = start..start + batch.len();
        start = range.end;
        if covered(&committed, &range) {
            debug!(batch = index + 1, ?range, "records already committed, skipping");
            summary.batches_skipped += 1;
            continue;
        }

        let mut attempt = 0;
        let write = loop {
            attempt += 1;
            match store.commit_batch(&outcome.content_key, range.clone(), batch) {
                Ok(write) => break write,
                Err(e) if is_retryable(&e) && attempt < COMMIT_ATTEMPTS => {
                    warn!(batch = index + 1, attempt, error = %e, "store unavailable, retrying batch");
                    std::thread::sleep(Duration::from_millis(COMMIT_BACKOFF_MS << attempt));
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to commit batch {} after {attempt} attempt(s)", index + 1)
                    });
                }
            }
        };

        for err in &write.errors {
            warn!(batch = index + 1, %err, "record not written");
        }
        summary.records_written += write.written;
        summary.errors.extend(write.errors);
        summary.batches_committed += 1;
        debug!(batch = index + 1, records = write.written, "batch committed");
    }
    info!(
        committed = summary.batches_committed,
        skipped = summary.batches_skipped,
        records = summary.records_written,
        "import committed"
    );
    Ok(summary)
}
