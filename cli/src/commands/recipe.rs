use anyhow::{Context, Result, bail};
use std::process;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::service::LarderService;

use super::helpers::{note_unit, print_json, truncate};

pub(crate) fn cmd_recipe_create(
    svc: &LarderService,
    name: &str,
    servings: f64,
    json: bool,
) -> Result<()> {
    let recipe = svc.create_recipe(name, servings)?;
    if json {
        return print_json(&recipe);
    }
    let id = &recipe.id;
    println!("Created recipe: {name} (id: {id}, servings: {servings})");
    println!("Add ingredients with: larder recipe add-ingredient {id} <name> <amount> <unit>");
    Ok(())
}

pub(crate) fn cmd_recipe_add_ingredient(
    svc: &LarderService,
    recipe_id: &str,
    name: &str,
    amount: f64,
    unit: &str,
    json: bool,
) -> Result<()> {
    let ingredient = svc.add_ingredient(recipe_id, name, amount, unit)?;
    if json {
        return print_json(&ingredient);
    }
    note_unit(name, amount, unit);
    println!("Added {amount} {unit} {name} (id: {})", ingredient.id);
    Ok(())
}

pub(crate) fn cmd_recipe_list(svc: &LarderService, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Servings")]
        servings: String,
        #[tabled(rename = "Ingredients")]
        ingredients: usize,
    }

    let recipes = svc.list_recipes()?;
    if recipes.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No recipes found");
        }
        process::exit(2);
    }

    if json {
        return print_json(&recipes);
    }

    let mut rows = Vec::with_capacity(recipes.len());
    for r in &recipes {
        rows.push(RecipeRow {
            id: r.id.clone(),
            name: truncate(&r.name, 30),
            servings: r.servings.to_string(),
            ingredients: svc.get_recipe_ingredients(&r.id)?.len(),
        });
    }

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

/// One ingredient line lifted from a Cooklang recipe.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CookIngredient {
    pub name: String,
    pub amount: f64,
    pub unit: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CookRecipe {
    pub title: Option<String>,
    pub servings: Option<f64>,
    pub ingredients: Vec<CookIngredient>,
}

pub(crate) fn parse_cooklang(input: &str) -> Result<CookRecipe> {
    let (recipe, _report) = cooklang::parse(input)
        .into_result()
        .map_err(|e| anyhow::anyhow!("Failed to parse Cooklang file: {e}"))?;

    let converter = cooklang::Converter::default();
    let ingredients = recipe
        .group_ingredients(&converter)
        .iter()
        .map(cook_ingredient)
        .collect();

    Ok(CookRecipe {
        title: recipe.metadata.title().map(String::from),
        servings: recipe
            .metadata
            .servings()
            .and_then(|s| s.as_number().map(f64::from)),
        ingredients,
    })
}

// Ingredients without a quantity keep amount 1 and no unit, so they are
// stored for matching but contribute no grams.
fn cook_ingredient(gi: &cooklang::ingredient_list::GroupedIngredient<'_>) -> CookIngredient {
    let (amount, unit) = gi
        .quantity
        .iter()
        .next()
        .map_or((1.0, String::new()), |qty: &cooklang::Quantity| {
            let amount = match qty.value() {
                cooklang::Value::Number(n) => n.value(),
                cooklang::Value::Range { start, .. } => start.value(),
                cooklang::Value::Text(t) => t.trim().replace(',', ".").parse::<f64>().unwrap_or(1.0),
            };
            (amount, qty.unit().map(String::from).unwrap_or_default())
        });

    CookIngredient {
        name: gi.ingredient.display_name().to_string(),
        amount,
        unit,
    }
}

pub(crate) fn cmd_recipe_import(
    svc: &LarderService,
    file: &std::path::Path,
    name_override: Option<String>,
    servings_override: Option<f64>,
    json: bool,
) -> Result<()> {
    let input = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    let parsed = parse_cooklang(&input)?;

    let name = name_override
        .or(parsed.title)
        .or_else(|| file.file_stem().and_then(|s| s.to_str()).map(String::from))
        .context("Could not determine recipe name. Use --name to specify one")?;
    let servings = servings_override.or(parsed.servings).unwrap_or(1.0);

    if parsed.ingredients.is_empty() {
        bail!("No ingredients found in recipe");
    }

    let recipe = svc.create_recipe(&name, servings)?;
    let mut added = Vec::with_capacity(parsed.ingredients.len());
    for ing in &parsed.ingredients {
        if !json {
            note_unit(&ing.name, ing.amount, &ing.unit);
        }
        added.push(svc.add_ingredient(&recipe.id, &ing.name, ing.amount, &ing.unit)?);
    }

    if json {
        return print_json(&serde_json::json!({ "recipe": recipe, "ingredients": added }));
    }
    println!(
        "Imported recipe: {name} ({} ingredients, {servings} servings, id: {})",
        added.len(),
        recipe.id
    );
    println!("Match the ingredients with: larder review scan --recipe {}", recipe.id);
    Ok(())
}
