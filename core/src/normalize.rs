//! Text normalization shared by the importer and the matcher.

/// A normalized name together with its significant tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub name: String,
    pub tokens: Vec<String>,
}

/// Lowercase, drop commas and periods, collapse whitespace.
///
/// Letters outside ASCII (æ, ø, å) are kept as-is. Tokens are the words
/// longer than two characters.
#[must_use]
pub fn normalize(text: &str) -> Normalized {
    let name = normalize_name(text);
    let tokens = tokens(&name);
    Normalized { name, tokens }
}

#[must_use]
pub fn normalize_name(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| *c != ',' && *c != '.')
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn tokens(normalized: &str) -> Vec<String> {
    normalized
        .split(' ')
        .filter(|w| w.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Build the search term set for a name: the lowercased name, the
/// punctuation-stripped form, then each token. Duplicates are dropped.
#[must_use]
pub fn search_terms(name: &str) -> Vec<String> {
    let lower = name.trim().to_lowercase();
    let norm = normalize(name);
    let mut terms: Vec<String> = Vec::with_capacity(norm.tokens.len() + 2);
    for term in std::iter::once(lower)
        .chain(std::iter::once(norm.name))
        .chain(norm.tokens)
    {
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Lowercase slug for ids: runs outside `[a-z0-9æøå]` become a single `-`.
#[must_use]
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, 'æ' | 'ø' | 'å') {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}
