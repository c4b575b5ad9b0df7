use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Nutrient keys for the per-100g macro fields.
pub const CALORIES: &str = "calories";
pub const PROTEIN: &str = "protein";
pub const CARBS: &str = "carbs";
pub const FAT: &str = "fat";
pub const FIBER: &str = "fiber";

pub const MACRO_KEYS: &[&str] = &[CALORIES, PROTEIN, CARBS, FAT, FIBER];

pub const VITAMIN_KEYS: &[&str] = &[
    "vitamin_a",
    "vitamin_b1",
    "vitamin_b2",
    "vitamin_b3",
    "vitamin_b6",
    "vitamin_b12",
    "vitamin_c",
    "vitamin_d",
    "vitamin_e",
    "folate",
];

pub const MINERAL_KEYS: &[&str] = &[
    "calcium",
    "iron",
    "magnesium",
    "phosphorus",
    "potassium",
    "sodium",
    "zinc",
    "selenium",
];

/// Category assigned when no category rule matches.
pub const DEFAULT_CATEGORY: &str = "other";

/// A dataset row after name resolution, before nutrient parsing.
///
/// Consumed once by the importer; never stored.
#[derive(Debug, Clone, Default)]
pub struct RawNutritionRecord {
    /// 1-based data row number in the input (header excluded).
    pub row: usize,
    pub source_id: Option<String>,
    pub name: String,
    /// Raw category text from the dataset, empty when the row has none.
    pub category: String,
    pub fields: BTreeMap<String, String>,
}

/// A deduplicated nutrition reference entry. All nutrient values are per 100g.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalIngredient {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub category: String,
    pub calories_per_100g: Option<f64>,
    pub protein_per_100g: Option<f64>,
    pub carbs_per_100g: Option<f64>,
    pub fat_per_100g: Option<f64>,
    pub fiber_per_100g: Option<f64>,
    #[serde(default)]
    pub vitamins: BTreeMap<String, f64>,
    #[serde(default)]
    pub minerals: BTreeMap<String, f64>,
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub common_names: Vec<String>,
    pub source: String,
    pub source_id: Option<String>,
    pub is_active: bool,
}

impl CanonicalIngredient {
    /// True when at least one nutrient value is known.
    #[must_use]
    pub fn has_nutrition(&self) -> bool {
        self.macros().any(|(_, v)| v.is_some())
            || !self.vitamins.is_empty()
            || !self.minerals.is_empty()
    }

    fn macros(&self) -> impl Iterator<Item = (&'static str, Option<f64>)> {
        [
            (CALORIES, self.calories_per_100g),
            (PROTEIN, self.protein_per_100g),
            (CARBS, self.carbs_per_100g),
            (FAT, self.fat_per_100g),
            (FIBER, self.fiber_per_100g),
        ]
        .into_iter()
    }

    /// Every known nutrient as `(key, per-100g value)`: macros first, then
    /// vitamins, then minerals.
    #[must_use]
    pub fn nutrients(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .macros()
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
            .collect();
        out.extend(self.vitamins.iter().map(|(k, v)| (k.clone(), *v)));
        out.extend(self.minerals.iter().map(|(k, v)| (k.clone(), *v)));
        out
    }

    /// Set a nutrient by key. Unknown keys are ignored and reported as `false`.
    pub fn set_nutrient(&mut self, key: &str, value: f64) -> bool {
        match key {
            CALORIES => self.calories_per_100g = Some(value),
            PROTEIN => self.protein_per_100g = Some(value),
            CARBS => self.carbs_per_100g = Some(value),
            FAT => self.fat_per_100g = Some(value),
            FIBER => self.fiber_per_100g = Some(value),
            k if VITAMIN_KEYS.contains(&k) => {
                self.vitamins.insert(k.to_string(), value);
            }
            k if MINERAL_KEYS.contains(&k) => {
                self.minerals.insert(k.to_string(), value);
            }
            _ => return false,
        }
        true
    }

    /// Merge a re-imported record into this one. Known incoming values win;
    /// an empty incoming field never clears a stored value.
    pub fn overlay(&mut self, incoming: &CanonicalIngredient) {
        fn take(dst: &mut Option<f64>, src: Option<f64>) {
            if src.is_some() {
                *dst = src;
            }
        }
        take(&mut self.calories_per_100g, incoming.calories_per_100g);
        take(&mut self.protein_per_100g, incoming.protein_per_100g);
        take(&mut self.carbs_per_100g, incoming.carbs_per_100g);
        take(&mut self.fat_per_100g, incoming.fat_per_100g);
        take(&mut self.fiber_per_100g, incoming.fiber_per_100g);
        self.vitamins
            .extend(incoming.vitamins.iter().map(|(k, v)| (k.clone(), *v)));
        self.minerals
            .extend(incoming.minerals.iter().map(|(k, v)| (k.clone(), *v)));
        for term in &incoming.search_terms {
            if !self.search_terms.contains(term) {
                self.search_terms.push(term.clone());
            }
        }
        for alias in &incoming.common_names {
            if !self.common_names.contains(alias) {
                self.common_names.push(alias.clone());
            }
        }
        if incoming.source_id.is_some() {
            self.source_id.clone_from(&incoming.source_id);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    pub servings: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub amount: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeIngredient {
    pub id: String,
    pub recipe_id: String,
    /// Ingredient text as written in the recipe.
    pub name: String,
    pub quantity: Quantity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Synonym,
    Fuzzy,
    Category,
    Manual,
}

impl MatchType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Synonym => "synonym",
            Self::Fuzzy => "fuzzy",
            Self::Category => "category",
            Self::Manual => "manual",
        }
    }

    /// Match type implied by a confidence when the caller did not report one.
    #[must_use]
    pub fn from_confidence(confidence: u8) -> Self {
        match confidence {
            95.. => Self::Exact,
            80..=94 => Self::Synonym,
            50..=79 => Self::Fuzzy,
            _ => Self::Category,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "synonym" => Ok(Self::Synonym),
            "fuzzy" => Ok(Self::Fuzzy),
            "category" => Ok(Self::Category),
            "manual" => Ok(Self::Manual),
            _ => bail!("Invalid match type '{s}'"),
        }
    }
}

/// A proposed match. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_ingredient_id: Option<String>,
    pub canonical_id: String,
    pub canonical_name: String,
    pub confidence: u8,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedMatch {
    pub recipe_ingredient_id: String,
    pub canonical_id: String,
    pub confidence: u8,
    pub match_type: MatchType,
    pub confirmed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub recipe_ingredient_id: String,
    pub rejected_at: String,
}

/// Aggregate counts reported by every import run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportStats {
    pub rows_processed: usize,
    pub rows_skipped: usize,
    pub total_ingredients: usize,
    pub categories_found: Vec<String>,
    pub category_counts: BTreeMap<String, usize>,
    pub duplicates_removed: usize,
    pub with_calories: usize,
    pub with_protein: usize,
    pub with_vitamins: usize,
    pub with_minerals: usize,
}

/// Outcome of committing import batches to the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitSummary {
    pub batches_committed: usize,
    pub batches_skipped: usize,
    pub records_written: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewStats {
    pub total: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightLevel {
    High,
    Significant,
    GoodSource,
}

impl HighlightLevel {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Significant => "significant",
            Self::GoodSource => "good source",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyValue {
    pub nutrient: String,
    pub amount: f64,
    pub percent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub nutrient: String,
    pub percent: i64,
    pub level: HighlightLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientContribution {
    pub recipe_ingredient_id: String,
    pub name: String,
    pub grams: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
    pub calories: f64,
}

/// Per-serving nutrition for a recipe. Derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NutritionSummary {
    pub recipe_id: String,
    pub recipe_name: String,
    pub servings: f64,
    /// Per-serving amount for every nutrient any matched ingredient reports.
    pub per_serving: BTreeMap<String, f64>,
    pub daily_values: Vec<DailyValue>,
    pub highlights: Vec<Highlight>,
    pub ingredients_total: usize,
    pub ingredients_with_nutrition: usize,
    /// Fraction in `[0, 1]` of ingredients that contributed nutrition data.
    pub coverage: f64,
    pub breakdown: Vec<IngredientContribution>,
}

impl NutritionSummary {
    #[must_use]
    pub fn get(&self, nutrient: &str) -> f64 {
        self.per_serving.get(nutrient).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn coverage_percent(&self) -> i64 {
        (self.coverage * 100.0).round() as i64
    }
}

/// Convert a recipe quantity to grams.
///
/// Returns `(grams, is_approximate)`; volume and piece units are approximate.
/// `None` for units with no known conversion.
#[must_use]
pub fn convert_to_grams(quantity: f64, unit: &str) -> Option<(f64, bool)> {
    let lower = unit.trim().to_lowercase();
    match lower.as_str() {
        "g" | "gr" | "gram" | "grams" => Some((quantity, false)),
        "kg" | "kilo" | "kilogram" | "kilograms" => Some((quantity * 1000.0, false)),
        "lb" | "lbs" | "pound" | "pounds" => Some((quantity * 454.0, false)),
        "oz" | "ounce" | "ounces" => Some((quantity * 28.35, false)),
        "spsk" | "tbsp" | "tablespoon" | "tablespoons" => Some((quantity * 15.0, true)),
        "tsk" | "tesk" | "tsp" | "teaspoon" | "teaspoons" => Some((quantity * 5.0, true)),
        "stk" | "st" | "stykke" | "stykker" => Some((quantity * 80.0, true)),
        "dl" => Some((quantity * 100.0, true)),
        "ml" | "milliliter" | "milliliters" | "millilitre" | "millilitres" => {
            Some((quantity, true))
        }
        "l" | "liter" | "liters" | "litre" | "litres" => Some((quantity * 1000.0, true)),
        _ => None,
    }
}

pub fn validate_confidence(confidence: i64) -> Result<u8> {
    match u8::try_from(confidence) {
        Ok(c) if c <= 100 => Ok(c),
        _ => bail!("Confidence must be between 0 and 100, got {confidence}"),
    }
}

pub fn validate_servings(servings: f64) -> Result<()> {
    if !servings.is_finite() || servings <= 0.0 {
        bail!("Servings must be greater than 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CanonicalIngredient {
        CanonicalIngredient {
            id: "frida-tomat-1".into(),
            name: "Tomat, rå".into(),
            normalized_name: "tomat rå".into(),
            category: "grøntsager".into(),
            calories_per_100g: Some(18.0),
            protein_per_100g: None,
            carbs_per_100g: None,
            fat_per_100g: None,
            fiber_per_100g: None,
            vitamins: BTreeMap::new(),
            minerals: BTreeMap::new(),
            search_terms: vec!["tomat".into()],
            common_names: Vec::new(),
            source: "frida_dtu".into(),
            source_id: None,
            is_active: true,
        }
    }

    #[test]
    fn test_convert_to_grams_danish_units() {
        assert_eq!(convert_to_grams(2.0, "spsk"), Some((30.0, true)));
        assert_eq!(convert_to_grams(1.0, "stk"), Some((80.0, true)));
        assert_eq!(convert_to_grams(2.0, "dl"), Some((200.0, true)));
        assert_eq!(convert_to_grams(200.0, "g"), Some((200.0, false)));
        assert_eq!(convert_to_grams(0.5, "KG"), Some((500.0, false)));
        assert_eq!(convert_to_grams(1.0, "knivspids"), None);
    }

    #[test]
    fn test_match_type_roundtrip_str() {
        for mt in [
            MatchType::Exact,
            MatchType::Synonym,
            MatchType::Fuzzy,
            MatchType::Category,
            MatchType::Manual,
        ] {
            assert_eq!(mt.as_str().parse::<MatchType>().unwrap(), mt);
        }
        assert!("bogus".parse::<MatchType>().is_err());
    }

    #[test]
    fn test_match_type_from_confidence() {
        assert_eq!(MatchType::from_confidence(100), MatchType::Exact);
        assert_eq!(MatchType::from_confidence(95), MatchType::Exact);
        assert_eq!(MatchType::from_confidence(88), MatchType::Synonym);
        assert_eq!(MatchType::from_confidence(75), MatchType::Fuzzy);
        assert_eq!(MatchType::from_confidence(40), MatchType::Category);
    }

    #[test]
    fn test_validate_confidence() {
        assert_eq!(validate_confidence(0).unwrap(), 0);
        assert_eq!(validate_confidence(100).unwrap(), 100);
        assert!(validate_confidence(101).is_err());
        assert!(validate_confidence(-1).is_err());
    }

    #[test]
    fn test_validate_servings() {
        assert!(validate_servings(2.0).is_ok());
        assert!(validate_servings(0.0).is_err());
        assert!(validate_servings(f64::NAN).is_err());
    }

    #[test]
    fn test_set_nutrient_routes_keys() {
        let mut c = sample();
        assert!(c.set_nutrient("protein", 0.9));
        assert!(c.set_nutrient("vitamin_c", 14.0));
        assert!(c.set_nutrient("potassium", 237.0));
        assert!(!c.set_nutrient("unobtainium", 1.0));
        assert_eq!(c.protein_per_100g, Some(0.9));
        assert_eq!(c.vitamins.get("vitamin_c"), Some(&14.0));
        assert_eq!(c.minerals.get("potassium"), Some(&237.0));
    }

    #[test]
    fn test_nutrients_lists_only_known_values() {
        let mut c = sample();
        c.set_nutrient("iron", 0.3);
        let keys: Vec<String> = c.nutrients().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["calories".to_string(), "iron".to_string()]);
    }

    #[test]
    fn test_has_nutrition() {
        let mut c = sample();
        assert!(c.has_nutrition());
        c.calories_per_100g = None;
        assert!(!c.has_nutrition());
        c.minerals.insert("zinc".into(), 0.2);
        assert!(c.has_nutrition());
    }

    #[test]
    fn test_overlay_keeps_values_incoming_lacks() {
        let mut stored = sample();
        stored.protein_per_100g = Some(0.9);
        stored.vitamins.insert("vitamin_c".into(), 14.0);
        let mut incoming = sample();
        incoming.calories_per_100g = Some(20.0);
        incoming.vitamins.insert("vitamin_a".into(), 42.0);
        incoming.search_terms.push("rå".into());

        stored.overlay(&incoming);
        assert_eq!(stored.calories_per_100g, Some(20.0));
        assert_eq!(stored.protein_per_100g, Some(0.9));
        assert_eq!(stored.vitamins.get("vitamin_c"), Some(&14.0));
        assert_eq!(stored.vitamins.get("vitamin_a"), Some(&42.0));
        assert_eq!(stored.search_terms, vec!["tomat".to_string(), "rå".to_string()]);
    }

    #[test]
    fn test_summary_get_defaults_to_zero() {
        let summary = NutritionSummary {
            recipe_id: "r".into(),
            recipe_name: "R".into(),
            servings: 1.0,
            per_serving: BTreeMap::from([("calories".to_string(), 100.0)]),
            daily_values: Vec::new(),
            highlights: Vec::new(),
            ingredients_total: 2,
            ingredients_with_nutrition: 1,
            coverage: 0.5,
            breakdown: Vec::new(),
        };
        assert!((summary.get("calories") - 100.0).abs() < f64::EPSILON);
        assert!(summary.get("fat").abs() < f64::EPSILON);
        assert_eq!(summary.coverage_percent(), 50);
    }
}
