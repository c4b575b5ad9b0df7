//! Confidence-scored matching of recipe ingredient text against canonical records.

use std::sync::LazyLock;

use anyhow::Result;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{CanonicalIngredient, MatchCandidate, MatchType, RecipeIngredient};
use crate::normalize::normalize_name;

pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const DEFAULT_CATEGORY_LIMIT: usize = 3;

pub const EXACT_CONFIDENCE: u8 = 95;
pub const ALIAS_CONFIDENCE: u8 = 94;
pub const SYNONYM_CONFIDENCE: u8 = 88;
pub const FUZZY_CONFIDENCE: u8 = 75;
pub const CATEGORY_CONFIDENCE: u8 = 40;

const FUZZY_PREFIX_CHARS: usize = 4;

static RE_QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\d+(?:[.,/]\d+)?\s*(?:g|gram|kg|kilogram|ml|liter|l|stk|styk|dl|tsk|spsk|spise|te)(?:\s|$)",
    )
    .expect("valid quantity regex")
});
static RE_LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:[.,/]\d+)?\s+").expect("valid number regex"));
static RE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:friske?|tørrede?|hakkede?|hakket|revet|revne|kogte?|rå|økologiske?|øko|en|et|den|det|de)\s+",
    )
    .expect("valid prefix regex")
});

/// Recipe word to the canonical term it most likely refers to.
const SYNONYMS: &[(&str, &str)] = &[
    ("mandler", "mandel"),
    ("valnødder", "valnød"),
    ("hasselnødder", "hasselnød"),
    ("kylling", "kyllingebryst"),
    ("parmesan", "parmesanost"),
    ("revet ost", "ost"),
    ("olivenolie", "olie, oliven"),
    ("rapsolie", "olie, raps"),
    ("solsikkeolie", "olie, solsikke"),
    ("kokosolie", "olie, kokos"),
    ("tomater", "tomat"),
    ("gulerødder", "gulerod"),
    ("kartofler", "kartoffel"),
    ("hvedemel", "mel, hvede"),
    ("rugmel", "mel, rug"),
    ("havregryn", "havre"),
    ("æbler", "æble"),
    ("bananer", "banan"),
    ("citroner", "citron"),
    ("appelsiner", "appelsin"),
    ("æg", "hønseæg"),
];

/// Query keywords that imply a canonical category.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("kød", &["kylling", "oksekød", "svinekød", "kød", "bacon", "skinke"]),
    ("fisk", &["laks", "torsk", "fisk", "tun", "rejer"]),
    ("mejeriprodukter", &["mælk", "ost", "fløde", "yoghurt"]),
    ("fedtstoffer", &["olie", "fedtstof", "smør", "margarine"]),
    ("grøntsager", &["tomat", "løg", "spinat", "gulerod", "kartof", "salat"]),
    ("frugt", &["æble", "banan", "appelsin", "citron"]),
    ("nødder", &["mandel", "valnød", "hasselnød"]),
    ("kornprodukter", &["mel", "ris", "pasta", "brød", "havre"]),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Keep the first hit per tier in store order.
    #[default]
    FirstHit,
    /// Scan everything and keep the closest hit per tier.
    Ranked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherConfig {
    pub page_size: usize,
    pub strategy: MatchStrategy,
    pub category_fallback: bool,
    pub category_limit: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            strategy: MatchStrategy::default(),
            category_fallback: true,
            category_limit: DEFAULT_CATEGORY_LIMIT,
        }
    }
}

/// Position in a [`CanonicalSource`]; pages resume strictly after it.
pub type PageCursor = i64;

pub const START_CURSOR: PageCursor = 0;

/// One page of canonical records and the cursor that continues after it.
#[derive(Debug, Clone, Default)]
pub struct CanonicalPage {
    pub records: Vec<CanonicalIngredient>,
    /// `None` once the source is exhausted.
    pub next: Option<PageCursor>,
}

/// Paged read access to active canonical records, in a stable order.
pub trait CanonicalSource {
    fn page(&self, after: PageCursor, limit: usize) -> Result<CanonicalPage>;
}

impl CanonicalSource for [CanonicalIngredient] {
    fn page(&self, after: PageCursor, limit: usize) -> Result<CanonicalPage> {
        let start = usize::try_from(after).unwrap_or(0);
        let records: Vec<CanonicalIngredient> =
            self.iter().skip(start).take(limit).cloned().collect();
        let next = (records.len() == limit)
            .then(|| PageCursor::try_from(start + limit).ok())
            .flatten();
        Ok(CanonicalPage { records, next })
    }
}

/// Strip leading quantities, preparation words and articles, then normalize.
#[must_use]
pub fn clean_query(text: &str) -> String {
    let lower = text.trim().to_lowercase();
    let mut s = normalize_name(&RE_QUANTITY.replace_all(&lower, ""));
    loop {
        let next = RE_LEADING_NUMBER.replace(&s, "");
        let next = RE_PREFIX.replace(&next, "").into_owned();
        if next == s {
            break;
        }
        s = next;
    }
    s
}

#[must_use]
pub fn synonym_for(query: &str) -> Option<&'static str> {
    SYNONYMS
        .iter()
        .find(|(word, _)| *word == query)
        .map(|(_, term)| *term)
}

#[must_use]
pub fn category_for_query(query: &str) -> Option<&'static str> {
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| query.contains(w)))
        .map(|(category, _)| *category)
}

fn prefix(s: &str) -> Option<&str> {
    s.char_indices()
        .nth(FUZZY_PREFIX_CHARS)
        .map(|(i, _)| &s[..i])
        .or_else(|| (s.chars().count() == FUZZY_PREFIX_CHARS).then_some(s))
}

struct Hit<'a> {
    record: &'a CanonicalIngredient,
    confidence: u8,
    score: f64,
}

/// Accumulates the best hit per tier while records stream past.
struct Scan<'q, 'a> {
    query: &'q str,
    query_prefix: Option<&'q str>,
    synonym: Option<String>,
    category: Option<&'static str>,
    config: MatcherConfig,
    exact: Option<Hit<'a>>,
    synonym_hit: Option<Hit<'a>>,
    fuzzy: Option<Hit<'a>>,
    by_category: Vec<&'a CanonicalIngredient>,
}

impl<'q, 'a> Scan<'q, 'a> {
    fn new(query: &'q str, config: MatcherConfig) -> Self {
        Self {
            query,
            query_prefix: prefix(query),
            synonym: synonym_for(query).map(normalize_name),
            category: config
                .category_fallback
                .then(|| category_for_query(query))
                .flatten(),
            config,
            exact: None,
            synonym_hit: None,
            fuzzy: None,
            by_category: Vec::new(),
        }
    }

    fn textual_hit(&self) -> bool {
        self.exact.is_some() || self.synonym_hit.is_some() || self.fuzzy.is_some()
    }

    fn done(&self) -> bool {
        self.config.strategy == MatchStrategy::FirstHit
            && self.exact.is_some()
            && self.synonym_hit.is_some()
            && self.fuzzy.is_some()
    }

    fn keep(&self, slot: Option<&Hit<'a>>, score: f64) -> bool {
        match (slot, self.config.strategy) {
            (None, _) => true,
            (Some(_), MatchStrategy::FirstHit) => false,
            (Some(current), MatchStrategy::Ranked) => score > current.score,
        }
    }

    fn offer(&mut self, record: &'a CanonicalIngredient) {
        let name = record.normalized_name.as_str();
        if name.is_empty() {
            return;
        }
        let q = self.query;
        let score = if self.config.strategy == MatchStrategy::Ranked {
            strsim::normalized_levenshtein(q, name)
        } else {
            0.0
        };

        // Each record lands in its highest tier only.
        if name.contains(q) || q.contains(name) {
            if self.keep(self.exact.as_ref(), score) {
                self.exact = Some(Hit { record, confidence: EXACT_CONFIDENCE, score });
            }
            return;
        }

        let alias = record.common_names.iter().any(|a| normalize_name(a) == q);
        let table = self
            .synonym
            .as_deref()
            .is_some_and(|term| !term.is_empty() && name.contains(term));
        if alias || table {
            let confidence = if alias { ALIAS_CONFIDENCE } else { SYNONYM_CONFIDENCE };
            let better_band = self
                .synonym_hit
                .as_ref()
                .is_some_and(|h| confidence > h.confidence);
            if better_band || self.keep(self.synonym_hit.as_ref(), score) {
                self.synonym_hit = Some(Hit { record, confidence, score });
            }
            return;
        }

        let fuzzy = self.query_prefix.is_some_and(|p| name.contains(p))
            || prefix(name).is_some_and(|p| q.contains(p));
        if fuzzy {
            if self.keep(self.fuzzy.as_ref(), score) {
                self.fuzzy = Some(Hit { record, confidence: FUZZY_CONFIDENCE, score });
            }
            return;
        }

        if let Some(category) = self.category {
            if record.category == category && self.by_category.len() < self.config.category_limit {
                self.by_category.push(record);
            }
        }
    }

    fn held_ids(&self) -> Vec<String> {
        [&self.exact, &self.synonym_hit, &self.fuzzy]
            .into_iter()
            .flatten()
            .map(|h| h.record.id.clone())
            .chain(self.by_category.iter().map(|r| r.id.clone()))
            .collect()
    }

    fn finish(self) -> Vec<MatchCandidate> {
        let to_candidate = |record: &CanonicalIngredient, confidence: u8, match_type| MatchCandidate {
            recipe_ingredient_id: None,
            canonical_id: record.id.clone(),
            canonical_name: record.name.clone(),
            confidence,
            match_type,
        };

        let textual = self.textual_hit();
        let mut out: Vec<MatchCandidate> = [
            (self.exact, MatchType::Exact),
            (self.synonym_hit, MatchType::Synonym),
            (self.fuzzy, MatchType::Fuzzy),
        ]
        .into_iter()
        .filter_map(|(hit, mt)| hit.map(|h| to_candidate(h.record, h.confidence, mt)))
        .collect();

        if !textual {
            out.extend(
                self.by_category
                    .into_iter()
                    .map(|r| to_candidate(r, CATEGORY_CONFIDENCE, MatchType::Category)),
            );
        }
        out.sort_by_key(|c| std::cmp::Reverse(c.confidence));
        out
    }
}

/// Per-ingredient result of a matching pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientMatches {
    pub recipe_ingredient_id: String,
    pub name: String,
    pub candidates: Vec<MatchCandidate>,
}

impl IngredientMatches {
    #[must_use]
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    pub total: usize,
    pub exact: usize,
    pub synonym: usize,
    pub fuzzy: usize,
    pub category: usize,
    pub none: usize,
    pub average_confidence: f64,
}

impl MatchStats {
    /// Tally the best candidate of each result.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_results(results: &[IngredientMatches]) -> Self {
        let mut stats = Self {
            total: results.len(),
            ..Self::default()
        };
        let mut confidence_sum = 0u64;
        let mut matched = 0u64;
        for best in results.iter().map(IngredientMatches::best) {
            let Some(best) = best else {
                stats.none += 1;
                continue;
            };
            match best.match_type {
                MatchType::Exact => stats.exact += 1,
                MatchType::Synonym => stats.synonym += 1,
                MatchType::Fuzzy => stats.fuzzy += 1,
                MatchType::Category | MatchType::Manual => stats.category += 1,
            }
            confidence_sum += u64::from(best.confidence);
            matched += 1;
        }
        if matched > 0 {
            stats.average_confidence = confidence_sum as f64 / matched as f64;
        }
        stats
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn match_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.total - self.none) as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Matcher {
    config: MatcherConfig,
}

impl Matcher {
    #[must_use]
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> MatcherConfig {
        self.config
    }

    /// Candidates for `text`, best first. Empty when nothing matched.
    pub fn find_match<S: CanonicalSource + ?Sized>(
        &self,
        source: &S,
        text: &str,
    ) -> Result<Vec<MatchCandidate>> {
        let mut scan = PagedScan::new(text);
        let mut cursor = START_CURSOR;
        let mut pages = 0;
        while !scan.finished() {
            let page = source.page(cursor, self.config.page_size.max(1))?;
            pages += 1;
            scan.feed(&page.records, page.next.is_none(), self.config);
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        debug!(query = %scan.query, pages, "match lookup");
        Ok(scan.into_candidates())
    }

    /// Match every ingredient in one pass over the source. Each page is read
    /// once and offered to all unfinished ingredients in parallel.
    pub fn match_all<S: CanonicalSource + ?Sized>(
        &self,
        source: &S,
        ingredients: &[RecipeIngredient],
    ) -> Result<Vec<IngredientMatches>> {
        let mut scans: Vec<PagedScan> = ingredients
            .iter()
            .map(|ingredient| PagedScan::new(&ingredient.name))
            .collect();
        let mut cursor = START_CURSOR;
        let mut pages = 0;
        while scans.iter().any(|s| !s.finished()) {
            let page = source.page(cursor, self.config.page_size.max(1))?;
            pages += 1;
            let last = page.next.is_none();
            let config = self.config;
            scans
                .par_iter_mut()
                .for_each(|scan| scan.feed(&page.records, last, config));
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        debug!(ingredients = ingredients.len(), pages, "matching pass");

        Ok(ingredients
            .iter()
            .zip(scans)
            .map(|(ingredient, scan)| {
                let mut candidates = scan.into_candidates();
                for c in &mut candidates {
                    c.recipe_ingredient_id = Some(ingredient.id.clone());
                }
                IngredientMatches {
                    recipe_ingredient_id: ingredient.id.clone(),
                    name: ingredient.name.clone(),
                    candidates,
                }
            })
            .collect())
    }
}

/// Matching state for one query across pages. Between pages only the records
/// the scan still holds are kept.
struct PagedScan {
    query: String,
    kept: Vec<CanonicalIngredient>,
    result: Option<Vec<MatchCandidate>>,
}

impl PagedScan {
    fn new(text: &str) -> Self {
        let query = clean_query(text);
        let result = query.is_empty().then(Vec::new);
        Self {
            query,
            kept: Vec::new(),
            result,
        }
    }

    fn finished(&self) -> bool {
        self.result.is_some()
    }

    fn feed(&mut self, page: &[CanonicalIngredient], last: bool, config: MatcherConfig) {
        if self.finished() {
            return;
        }
        let mut scan = Scan::new(&self.query, config);
        for record in self.kept.iter().chain(page).filter(|r| r.is_active) {
            scan.offer(record);
            if scan.done() {
                break;
            }
        }
        if scan.done() || last {
            let candidates = scan.finish();
            self.result = Some(candidates);
            self.kept = Vec::new();
            return;
        }
        let held = scan.held_ids();
        self.kept.retain(|r| held.contains(&r.id));
        self.kept
            .extend(page.iter().filter(|r| held.contains(&r.id)).cloned());
    }

    fn into_candidates(self) -> Vec<MatchCandidate> {
        self.result.unwrap_or_default()
    }
}
