//! Proxy bypass lists.

use std::collections::HashSet;

/// Entries always excluded from system proxying: loopback and private ranges.
pub const REQUIRED_BYPASS_LIST: &str = "localhost;127.*;10.*;172.16.*;172.17.*;172.18.*;172.19.*;\
172.20.*;172.21.*;172.22.*;172.23.*;172.24.*;172.25.*;172.26.*;172.27.*;172.28.*;172.29.*;\
172.30.*;172.31.*;192.168.*;127.0.0.1";

/// Split a bypass list on `;` or `,`, dropping blank entries.
#[must_use]
pub fn split_bypass(list: &str) -> Vec<&str> {
    list.split([';', ','])
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Union of `existing` and `required`, `;`-joined.
///
/// Duplicates are dropped case-insensitively; the first spelling wins and
/// existing entries come before newly required ones.
#[must_use]
pub fn merge_bypass(existing: &str, required: &str) -> String {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for entry in split_bypass(existing)
        .into_iter()
        .chain(split_bypass(required))
    {
        if seen.insert(entry.to_lowercase()) {
            merged.push(entry);
        }
    }
    merged.join(";")
}
