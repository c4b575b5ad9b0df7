use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use larder_core::models::{MatchCandidate, convert_to_grams};

/// Print a value as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn print_candidates_table(candidates: &[MatchCandidate]) {
    #[derive(Tabled)]
    struct CandidateRow {
        #[tabled(rename = "#")]
        idx: usize,
        #[tabled(rename = "Canonical ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Type")]
        match_type: String,
        #[tabled(rename = "Confidence")]
        confidence: String,
    }

    let rows: Vec<CandidateRow> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| CandidateRow {
            idx: i + 1,
            id: truncate(&c.canonical_id, 36),
            name: truncate(&c.canonical_name, 40),
            match_type: c.match_type.to_string(),
            confidence: format!("{}%", c.confidence),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

/// Warn on stderr when a unit is unknown or only approximately convertible.
pub(crate) fn note_unit(name: &str, amount: f64, unit: &str) {
    match convert_to_grams(amount, unit) {
        Some((grams, true)) => {
            eprintln!("Note: {name}: {amount} {unit} ≈ {grams:.0}g (approximate)");
        }
        Some((_, false)) => {}
        None => {
            eprintln!(
                "Warning: {name}: unknown unit '{unit}', ingredient will not count towards nutrition"
            );
        }
    }
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
