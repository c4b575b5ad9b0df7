//! Per-serving nutrition for a recipe from its confirmed matches.

use std::collections::BTreeMap;

use crate::models::{
    CALORIES, CanonicalIngredient, DailyValue, Highlight, HighlightLevel, IngredientContribution,
    MINERAL_KEYS, NutritionSummary, Recipe, RecipeIngredient, VITAMIN_KEYS, convert_to_grams,
};

pub const MAX_HIGHLIGHTS: usize = 4;

/// Reference daily intake per nutrient key, in the unit the dataset reports.
/// Nutrients missing here get no daily-value percentage.
const DAILY_VALUES: &[(&str, f64)] = &[
    ("calories", 2000.0),
    ("protein", 50.0),
    ("carbs", 260.0),
    ("fat", 70.0),
    ("fiber", 25.0),
    ("vitamin_a", 800.0),
    ("vitamin_b1", 1.1),
    ("vitamin_b2", 1.4),
    ("vitamin_b3", 16.0),
    ("vitamin_b6", 1.4),
    ("vitamin_b12", 2.4),
    ("vitamin_c", 80.0),
    ("vitamin_d", 5.0),
    ("vitamin_e", 12.0),
    ("folate", 200.0),
    ("calcium", 800.0),
    ("iron", 14.0),
    ("magnesium", 375.0),
    ("phosphorus", 700.0),
    ("potassium", 2000.0),
    ("zinc", 10.0),
    ("selenium", 55.0),
];

#[must_use]
pub fn reference_daily_value(nutrient: &str) -> Option<f64> {
    DAILY_VALUES
        .iter()
        .find(|(k, _)| *k == nutrient)
        .map(|(_, v)| *v)
}

/// `round(amount / reference * 100)`, or `None` without a reference value.
#[must_use]
pub fn percent_of_daily_value(nutrient: &str, amount: f64) -> Option<i64> {
    reference_daily_value(nutrient).map(|reference| (amount / reference * 100.0).round() as i64)
}

#[must_use]
pub fn highlight_level(percent: i64) -> Option<HighlightLevel> {
    match percent {
        133.. => Some(HighlightLevel::High),
        100..=132 => Some(HighlightLevel::Significant),
        50..=99 => Some(HighlightLevel::GoodSource),
        _ => None,
    }
}

/// Sum confirmed ingredients into a per-serving summary.
///
/// Each row pairs a recipe ingredient with its confirmed canonical record.
/// Unmatched ingredients, unknown units and records without nutrient data
/// contribute nothing and count against coverage.
#[must_use]
pub fn aggregate(
    recipe: &Recipe,
    rows: &[(RecipeIngredient, Option<CanonicalIngredient>)],
) -> NutritionSummary {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    let mut covered = 0;
    let mut breakdown = Vec::with_capacity(rows.len());

    for (ingredient, canonical) in rows {
        let grams = convert_to_grams(ingredient.quantity.amount, &ingredient.quantity.unit)
            .map(|(g, _)| g);
        let mut calories = 0.0;

        if let (Some(grams), Some(c)) = (grams, canonical) {
            if c.has_nutrition() {
                covered += 1;
                let factor = grams / 100.0;
                for (key, per_100g) in c.nutrients() {
                    let amount = per_100g * factor;
                    if key == CALORIES {
                        calories = amount;
                    }
                    *totals.entry(key).or_insert(0.0) += amount;
                }
            }
        }

        breakdown.push(IngredientContribution {
            recipe_ingredient_id: ingredient.id.clone(),
            name: ingredient.name.clone(),
            grams: grams.unwrap_or(0.0),
            matched: canonical.as_ref().map(|c| c.name.clone()),
            calories,
        });
    }

    let divisor = recipe.servings.max(1.0);
    let per_serving: BTreeMap<String, f64> = totals
        .into_iter()
        .map(|(k, v)| (k, v / divisor))
        .collect();

    let daily_values: Vec<DailyValue> = per_serving
        .iter()
        .filter_map(|(k, amount)| {
            percent_of_daily_value(k, *amount).map(|percent| DailyValue {
                nutrient: k.clone(),
                amount: *amount,
                percent,
            })
        })
        .collect();

    let mut highlights: Vec<Highlight> = daily_values
        .iter()
        .filter(|dv| {
            VITAMIN_KEYS.contains(&dv.nutrient.as_str())
                || MINERAL_KEYS.contains(&dv.nutrient.as_str())
        })
        .filter_map(|dv| {
            highlight_level(dv.percent).map(|level| Highlight {
                nutrient: dv.nutrient.clone(),
                percent: dv.percent,
                level,
            })
        })
        .collect();
    highlights.sort_by(|a, b| b.percent.cmp(&a.percent).then_with(|| a.nutrient.cmp(&b.nutrient)));
    highlights.truncate(MAX_HIGHLIGHTS);

    breakdown.sort_by(|a, b| b.calories.total_cmp(&a.calories));

    let total = rows.len();
    #[allow(clippy::cast_precision_loss)]
    let coverage = if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    };

    NutritionSummary {
        recipe_id: recipe.id.clone(),
        recipe_name: recipe.name.clone(),
        servings: recipe.servings,
        per_serving,
        daily_values,
        highlights,
        ingredients_total: total,
        ingredients_with_nutrition: covered,
        coverage,
        breakdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Quantity;

    fn recipe(servings: f64) -> Recipe {
        Recipe {
            id: "r1".to_string(),
            name: "Kylling".to_string(),
            servings,
            created_at: String::new(),
        }
    }

    fn row(
        id: &str,
        amount: f64,
        unit: &str,
        canonical: Option<CanonicalIngredient>,
    ) -> (RecipeIngredient, Option<CanonicalIngredient>) {
        (
            RecipeIngredient {
                id: id.to_string(),
                recipe_id: "r1".to_string(),
                name: id.to_string(),
                quantity: Quantity {
                    amount,
                    unit: unit.to_string(),
                },
            },
            canonical,
        )
    }

    fn food(name: &str, calories: f64, protein: f64) -> CanonicalIngredient {
        CanonicalIngredient {
            id: name.to_lowercase(),
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            category: "other".to_string(),
            calories_per_100g: Some(calories),
            protein_per_100g: Some(protein),
            carbs_per_100g: None,
            fat_per_100g: None,
            fiber_per_100g: None,
            vitamins: BTreeMap::new(),
            minerals: BTreeMap::new(),
            search_terms: Vec::new(),
            common_names: Vec::new(),
            source: "test".to_string(),
            source_id: None,
            is_active: true,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_single_ingredient_scales_by_grams() {
        let rows = vec![row("a", 250.0, "g", Some(food("Ris", 130.0, 2.7)))];
        let s = aggregate(&recipe(1.0), &rows);
        assert!(close(s.get("calories"), 130.0 * 2.5));
        assert!(close(s.get("protein"), 2.7 * 2.5));
    }

    #[test]
    fn test_doubling_servings_halves_values() {
        let rows = vec![row("a", 300.0, "g", Some(food("Ris", 130.0, 2.7)))];
        let one = aggregate(&recipe(2.0), &rows);
        let two = aggregate(&recipe(4.0), &rows);
        assert!(close(two.get("calories") * 2.0, one.get("calories")));
        assert!(close(two.get("protein") * 2.0, one.get("protein")));
    }

    #[test]
    fn test_chicken_breast_example() {
        let rows = vec![row("a", 200.0, "g", Some(food("Kyllingebryst", 165.0, 31.0)))];
        let s = aggregate(&recipe(2.0), &rows);
        assert!(close(s.get("calories"), 165.0));
        assert!(close(s.get("protein"), 31.0));
        let protein_dv = s.daily_values.iter().find(|d| d.nutrient == "protein").unwrap();
        assert_eq!(protein_dv.percent, 62);
    }

    #[test]
    fn test_servings_below_one_do_not_inflate() {
        let rows = vec![row("a", 100.0, "g", Some(food("Ris", 130.0, 2.7)))];
        let s = aggregate(&recipe(0.5), &rows);
        assert!(close(s.get("calories"), 130.0));
    }

    #[test]
    fn test_coverage_and_unmatched() {
        let mut empty = food("Vand", 0.0, 0.0);
        empty.calories_per_100g = None;
        empty.protein_per_100g = None;
        let rows = vec![
            row("a", 100.0, "g", Some(food("Ris", 130.0, 2.7))),
            row("b", 1.0, "knivspids", Some(food("Salt", 0.0, 0.0))),
            row("c", 100.0, "g", None),
            row("d", 1.0, "l", Some(empty)),
        ];
        let s = aggregate(&recipe(1.0), &rows);
        assert_eq!(s.ingredients_total, 4);
        assert_eq!(s.ingredients_with_nutrition, 1);
        assert!(close(s.coverage, 0.25));
        assert!(close(s.get("calories"), 130.0));
    }

    #[test]
    fn test_danish_units() {
        let rows = vec![row("a", 2.0, "spsk", Some(food("Olie", 900.0, 0.0)))];
        let s = aggregate(&recipe(1.0), &rows);
        assert!(close(s.get("calories"), 270.0));
    }

    #[test]
    fn test_percent_of_daily_value() {
        assert_eq!(percent_of_daily_value("vitamin_c", 40.0), Some(50));
        assert_eq!(percent_of_daily_value("vitamin_b12", 3.2), Some(133));
        assert_eq!(percent_of_daily_value("calories", 500.0), Some(25));
        assert_eq!(percent_of_daily_value("sodium", 1000.0), None);
    }

    #[test]
    fn test_highlight_levels() {
        assert_eq!(highlight_level(133), Some(HighlightLevel::High));
        assert_eq!(highlight_level(132), Some(HighlightLevel::Significant));
        assert_eq!(highlight_level(100), Some(HighlightLevel::Significant));
        assert_eq!(highlight_level(99), Some(HighlightLevel::GoodSource));
        assert_eq!(highlight_level(50), Some(HighlightLevel::GoodSource));
        assert_eq!(highlight_level(49), None);
    }

    #[test]
    fn test_highlights_capped_and_sorted() {
        let mut rich = food("Lever", 135.0, 20.0);
        for (k, v) in [
            ("vitamin_a", 8000.0),
            ("vitamin_b12", 60.0),
            ("vitamin_b2", 2.8),
            ("folate", 250.0),
            ("vitamin_c", 27.0),
        ] {
            rich.vitamins.insert(k.to_string(), v);
        }
        rich.minerals.insert("iron".to_string(), 7.0);
        rich.minerals.insert("sodium".to_string(), 70.0);
        let s = aggregate(&recipe(1.0), &[row("a", 100.0, "g", Some(rich))]);

        assert_eq!(s.highlights.len(), MAX_HIGHLIGHTS);
        assert!(s.highlights.windows(2).all(|w| w[0].percent >= w[1].percent));
        assert_eq!(s.highlights[0].nutrient, "vitamin_b12");
        assert!(s.daily_values.iter().all(|d| d.nutrient != "sodium"));
        assert!(close(s.get("sodium"), 70.0));
    }

    #[test]
    fn test_breakdown_sorted_by_calories() {
        let rows = vec![
            row("ris", 100.0, "g", Some(food("Ris", 130.0, 2.7))),
            row("olie", 1.0, "spsk", Some(food("Olie", 900.0, 0.0))),
            row("salt", 1.0, "tsk", None),
        ];
        let s = aggregate(&recipe(1.0), &rows);
        let order: Vec<&str> = s.breakdown.iter().map(|b| b.recipe_ingredient_id.as_str()).collect();
        assert_eq!(order, vec!["olie", "ris", "salt"]);
        assert!(s.breakdown[2].matched.is_none());
    }

    #[test]
    fn test_empty_recipe() {
        let s = aggregate(&recipe(2.0), &[]);
        assert_eq!(s.ingredients_total, 0);
        assert!(close(s.coverage, 0.0));
        assert!(s.per_serving.is_empty());
    }
}
