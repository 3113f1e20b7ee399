//! Deterministic, category-scoped canonicalization of fact keys and
//! values. Matching (exact or semantic) always happens on the normalized
//! form, so "Kiev", "київ" and "Kyiv" reinforce one fact instead of
//! creating three.

use balachka_core::types::FactCategory;

/// Canonical spellings for location values. Covers the transliteration
/// variants that show up in mixed Ukrainian/English group chats.
const LOCATIONS: &[(&str, &str)] = &[
    ("київ", "kyiv"),
    ("киев", "kyiv"),
    ("kiev", "kyiv"),
    ("kyiv", "kyiv"),
    ("львів", "lviv"),
    ("львов", "lviv"),
    ("lvov", "lviv"),
    ("lwow", "lviv"),
    ("lviv", "lviv"),
    ("харків", "kharkiv"),
    ("харьков", "kharkiv"),
    ("kharkov", "kharkiv"),
    ("kharkiv", "kharkiv"),
    ("одеса", "odesa"),
    ("одесса", "odesa"),
    ("odessa", "odesa"),
    ("odesa", "odesa"),
    ("дніпро", "dnipro"),
    ("днепр", "dnipro"),
    ("dnipro", "dnipro"),
];

/// ISO-639-1-style codes for language values.
const LANGUAGES: &[(&str, &str)] = &[
    ("українська", "uk"),
    ("украинский", "uk"),
    ("ukrainian", "uk"),
    ("ukr", "uk"),
    ("uk", "uk"),
    ("англійська", "en"),
    ("english", "en"),
    ("eng", "en"),
    ("en", "en"),
    ("російська", "ru"),
    ("русский", "ru"),
    ("russian", "ru"),
    ("ru", "ru"),
    ("польська", "pl"),
    ("polish", "pl"),
    ("pl", "pl"),
    ("німецька", "de"),
    ("german", "de"),
    ("deutsch", "de"),
    ("de", "de"),
];

const ARTICLES: &[&str] = &["the ", "a ", "an "];

/// Normalize a fact key: lowercase, single underscores, no surrounding
/// whitespace.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Normalize a fact value for its category. Deterministic: equal inputs
/// always produce equal outputs.
pub fn normalize_value(category: FactCategory, value: &str) -> String {
    let collapsed = value.trim().split_whitespace().collect::<Vec<_>>().join(" ");
    match category {
        FactCategory::Location => {
            let mut folded = collapsed.to_lowercase();
            for article in ARTICLES {
                if let Some(rest) = folded.strip_prefix(article) {
                    folded = rest.to_string();
                    break;
                }
            }
            lookup(LOCATIONS, &folded).unwrap_or(folded)
        }
        FactCategory::Language => {
            let folded = collapsed.to_lowercase();
            lookup(LANGUAGES, &folded).unwrap_or(folded)
        }
        _ => collapsed,
    }
}

fn lookup(table: &[(&str, &str)], needle: &str) -> Option<String> {
    table
        .iter()
        .find(|(variant, _)| *variant == needle)
        .map(|(_, canonical)| canonical.to_string())
}
