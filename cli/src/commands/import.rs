use std::path::Path;

use anyhow::{Context, Result};

use larder_core::service::{ImportOptions, ImportReport, LarderService};

use super::helpers::print_json;

pub(crate) fn cmd_import(
    svc: &LarderService,
    path: &Path,
    out_dir: Option<&Path>,
    batch_size: usize,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let report = svc.import_dataset(
        file,
        ImportOptions {
            batch_size,
            out_dir,
            commit: !dry_run,
        },
    )?;

    if json {
        return print_json(&report);
    }
    print_report(&report, dry_run);
    Ok(())
}

fn print_report(report: &ImportReport, dry_run: bool) {
    let stats = &report.stats;
    if dry_run {
        println!("Dry run, nothing written to the database.\n");
    } else {
        println!("Import complete.\n");
    }
    println!("  Rows processed:     {}", stats.rows_processed);
    println!("  Rows skipped:       {}", stats.rows_skipped);
    println!("  Ingredients:        {}", stats.total_ingredients);
    println!("  Duplicates removed: {}", stats.duplicates_removed);
    println!("  With calories:      {}", stats.with_calories);
    println!("  With protein:       {}", stats.with_protein);
    println!("  With vitamins:      {}", stats.with_vitamins);
    println!("  With minerals:      {}", stats.with_minerals);
    println!("  Batches:            {}", report.batch_count);

    if !stats.categories_found.is_empty() {
        println!("\n  CATEGORIES:");
        for (category, count) in &stats.category_counts {
            println!("    {category}: {count}");
        }
    }

    if let Some(commit) = &report.commit {
        println!(
            "\n  Committed {} batches ({} already done), {} records written",
            commit.batches_committed, commit.batches_skipped, commit.records_written
        );
        for err in &commit.errors {
            eprintln!("  Warning: {err}");
        }
    }

    if !report.files.is_empty() {
        println!("\n  FILES:");
        for f in &report.files {
            println!("    {}", f.display());
        }
    }

    if !report.issues.is_empty() {
        eprintln!("\n{} rows had problems:", report.issues.len());
        for issue in report.issues.iter().take(20) {
            eprintln!("  {issue}");
        }
        if report.issues.len() > 20 {
            eprintln!("  ... and {} more", report.issues.len() - 20);
        }
    }
}
