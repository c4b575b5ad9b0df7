use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::models::MatchType;
use larder_core::review::{ConfirmRequest, PendingFilter, PendingOutcome};
use larder_core::service::LarderService;

use super::helpers::{print_json, truncate};

pub(crate) fn cmd_review_scan(
    svc: &LarderService,
    recipe_id: Option<&str>,
    json: bool,
) -> Result<()> {
    let (results, stats) = svc.scan(recipe_id)?;

    if json {
        return print_json(&serde_json::json!({ "results": results, "stats": stats }));
    }

    if results.is_empty() {
        println!("Nothing to match, every ingredient is already reviewed.");
        return Ok(());
    }

    for r in &results {
        match r.best() {
            Some(c) => println!(
                "  {}  →  {} ({}, {}%)",
                r.name, c.canonical_name, c.match_type, c.confidence
            ),
            None => println!("  {}  →  no match", r.name),
        }
    }
    println!(
        "\nMatched {} of {} ({:.0}%): {} exact, {} synonym, {} fuzzy, {} category, {} none",
        stats.total - stats.none,
        stats.total,
        stats.match_rate() * 100.0,
        stats.exact,
        stats.synonym,
        stats.fuzzy,
        stats.category,
        stats.none
    );
    Ok(())
}

pub(crate) fn cmd_review_pending(svc: &LarderService, filter: &PendingFilter, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct PendingRow {
        #[tabled(rename = "Ingredient ID")]
        id: String,
        #[tabled(rename = "Text")]
        text: String,
        #[tabled(rename = "Suggestion")]
        suggestion: String,
        #[tabled(rename = "Canonical ID")]
        canonical_id: String,
        #[tabled(rename = "Conf")]
        confidence: String,
    }

    let items = svc.list_pending(filter)?;
    if items.is_empty() {
        if json {
            println!("[]");
        } else {
            eprintln!("No pending ingredients");
        }
        process::exit(2);
    }

    if json {
        return print_json(&items);
    }

    let rows: Vec<PendingRow> = items
        .iter()
        .map(|item| {
            let suggestion = match (&item.outcome, &item.candidate) {
                (PendingOutcome::Suggested, Some(c)) => {
                    format!("{} ({})", truncate(&c.canonical_name, 30), c.match_type)
                }
                (PendingOutcome::LookupFailed(msg), _) => format!("lookup failed: {}", truncate(msg, 30)),
                _ => "-".to_string(),
            };
            let suggestion = if item.rejected {
                format!("{suggestion} [rejected]")
            } else {
                suggestion
            };
            PendingRow {
                id: item.ingredient.id.clone(),
                text: truncate(&item.ingredient.name, 30),
                suggestion,
                canonical_id: item
                    .candidate
                    .as_ref()
                    .map(|c| c.canonical_id.clone())
                    .unwrap_or_default(),
                confidence: item
                    .candidate
                    .as_ref()
                    .map_or("-".to_string(), |c| format!("{}%", c.confidence)),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

pub(crate) fn cmd_review_confirm(
    svc: &LarderService,
    recipe_ingredient_id: &str,
    canonical_id: &str,
    confidence: Option<i64>,
    json: bool,
) -> Result<()> {
    // Without an explicit confidence, take the matcher's current suggestion
    // when it points at the same record; otherwise treat it as a manual pick.
    let (confidence, match_type) = match confidence {
        Some(c) => (c, None),
        None => suggested(svc, recipe_ingredient_id, canonical_id)?
            .unwrap_or((100, Some(MatchType::Manual))),
    };

    let confirmed = svc.confirm(&ConfirmRequest {
        recipe_ingredient_id: recipe_ingredient_id.to_string(),
        canonical_id: canonical_id.to_string(),
        confidence,
        match_type,
    })?;

    if json {
        return print_json(&confirmed);
    }
    println!(
        "Confirmed {recipe_ingredient_id} → {canonical_id} ({}, {}%)",
        confirmed.match_type, confirmed.confidence
    );
    Ok(())
}

fn suggested(
    svc: &LarderService,
    recipe_ingredient_id: &str,
    canonical_id: &str,
) -> Result<Option<(i64, Option<MatchType>)>> {
    let ingredient = svc.db().require_recipe_ingredient(recipe_ingredient_id)?;
    let candidates = svc.find_match(&ingredient.name)?;
    Ok(candidates
        .into_iter()
        .find(|c| c.canonical_id == canonical_id)
        .map(|c| (i64::from(c.confidence), Some(c.match_type))))
}

pub(crate) fn cmd_review_reject(svc: &LarderService, recipe_ingredient_id: &str, json: bool) -> Result<()> {
    let rejection = svc.reject(recipe_ingredient_id)?;
    if json {
        return print_json(&rejection);
    }
    println!("Rejected suggestion for {recipe_ingredient_id}");
    Ok(())
}

pub(crate) fn cmd_review_override(
    svc: &LarderService,
    recipe_ingredient_id: &str,
    canonical_id: &str,
    json: bool,
) -> Result<()> {
    let confirmed = svc.manual_override(recipe_ingredient_id, canonical_id)?;
    if json {
        return print_json(&confirmed);
    }
    println!("Manually matched {recipe_ingredient_id} → {canonical_id}");
    Ok(())
}

pub(crate) fn cmd_review_bulk(svc: &LarderService, file: &Path, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;
    let items: Vec<ConfirmRequest> =
        serde_json::from_str(&text).context("Expected a JSON array of confirmations")?;

    let results = svc.bulk_confirm(&items);
    let failed = results.iter().filter(|r| !r.is_ok()).count();

    if json {
        print_json(&results)?;
    } else {
        println!("Confirmed {} of {}", results.len() - failed, results.len());
        for r in results.iter().filter(|r| !r.is_ok()) {
            eprintln!(
                "  {}: {}",
                r.recipe_ingredient_id,
                r.error.as_deref().unwrap_or_default()
            );
        }
    }

    if failed > 0 {
        process::exit(2);
    }
    Ok(())
}

pub(crate) fn cmd_review_stats(svc: &LarderService, json: bool) -> Result<()> {
    let stats = svc.review_stats()?;
    if json {
        return print_json(&stats);
    }
    println!("  Total:     {}", stats.total);
    println!("  Confirmed: {}", stats.confirmed);
    println!("  Rejected:  {}", stats.rejected);
    println!("  Pending:   {}", stats.pending);
    Ok(())
}
