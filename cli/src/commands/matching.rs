use anyhow::Result;
use std::process;

use larder_core::service::LarderService;

use super::helpers::{json_error, print_candidates_table, print_json};

pub(crate) fn cmd_match(svc: &LarderService, text: &str, json: bool) -> Result<()> {
    let candidates = svc.find_match(text)?;

    if candidates.is_empty() {
        if json {
            println!("{}", json_error(&format!("No match found for '{text}'")));
        } else {
            eprintln!("No match found for '{text}'");
        }
        process::exit(2);
    }

    if json {
        return print_json(&candidates);
    }
    print_candidates_table(&candidates);
    Ok(())
}
