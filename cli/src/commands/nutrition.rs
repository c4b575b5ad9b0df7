use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::models::{MACRO_KEYS, NutritionSummary};
use larder_core::service::LarderService;

use super::helpers::{no_neg_zero, print_json, truncate};

pub(crate) fn cmd_nutrition(svc: &LarderService, recipe_id: &str, json: bool) -> Result<()> {
    let summary = svc.aggregate(recipe_id)?;
    if json {
        return print_json(&summary);
    }
    print_summary(&summary);
    Ok(())
}

fn print_summary(s: &NutritionSummary) {
    #[derive(Tabled)]
    struct NutrientRow {
        #[tabled(rename = "Nutrient")]
        nutrient: String,
        #[tabled(rename = "Per serving")]
        amount: String,
        #[tabled(rename = "% DV")]
        percent: String,
    }

    #[derive(Tabled)]
    struct IngredientRow {
        #[tabled(rename = "Ingredient")]
        name: String,
        #[tabled(rename = "Matched")]
        matched: String,
        #[tabled(rename = "Grams")]
        grams: String,
        #[tabled(rename = "kcal")]
        calories: String,
    }

    let name = &s.recipe_name;
    let servings = s.servings;
    println!("=== {name} ===");
    println!(
        "  Servings: {servings}  |  Coverage: {}% ({} of {} ingredients)\n",
        s.coverage_percent(),
        s.ingredients_with_nutrition,
        s.ingredients_total
    );

    let percent_for = |key: &str| {
        s.daily_values
            .iter()
            .find(|d| d.nutrient == key)
            .map_or("-".to_string(), |d| format!("{}%", d.percent))
    };

    let mut rows: Vec<NutrientRow> = MACRO_KEYS
        .iter()
        .map(|k| NutrientRow {
            nutrient: (*k).to_string(),
            amount: format!("{:.1}", no_neg_zero(s.get(k))),
            percent: percent_for(k),
        })
        .collect();
    rows.extend(
        s.per_serving
            .iter()
            .filter(|(k, _)| !MACRO_KEYS.contains(&k.as_str()))
            .map(|(k, v)| NutrientRow {
                nutrient: k.clone(),
                amount: format!("{:.2}", no_neg_zero(*v)),
                percent: percent_for(k),
            }),
    );
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    if !s.highlights.is_empty() {
        println!("\n  HIGHLIGHTS:");
        for h in &s.highlights {
            println!("    {} {}% ({})", h.nutrient, h.percent, h.level.label());
        }
    }

    let ingredients: Vec<IngredientRow> = s
        .breakdown
        .iter()
        .map(|b| IngredientRow {
            name: truncate(&b.name, 30),
            matched: b
                .matched
                .as_deref()
                .map_or("(unmatched)".to_string(), |m| truncate(m, 30)),
            grams: format!("{:.0}", b.grams),
            calories: format!("{:.0}", no_neg_zero(b.calories)),
        })
        .collect();
    let table = Table::new(&ingredients)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..)).with(Alignment::right()))
        .to_string();
    println!("\n{table}");
}
