//! Canonical dependency sets and their content fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Hex characters kept from the SHA-256 digest (96 bits)
pub const FINGERPRINT_LEN: usize = 24;

/// Ordered, deduplicated set of canonical requirement entries.
///
/// Entries are whitespace-free and lowercase, so sets that differ only in
/// spacing, ordering or case compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencySet(BTreeSet<String>);

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw entries. Each entry may itself hold several
    /// requirements separated by newlines or commas.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for entry in entries {
            set.insert(entry.as_ref());
        }
        set
    }

    /// Parse a requirements-style text block
    pub fn parse(text: &str) -> Self {
        Self::from_entries([text])
    }

    /// Insert raw text, returning true when at least one new entry appeared
    pub fn insert(&mut self, raw: &str) -> bool {
        let mut added = false;
        for piece in raw.split(|c| c == '\n' || c == ',') {
            if let Some(entry) = canonical_entry(piece) {
                added |= self.0.insert(entry);
            }
        }
        added
    }

    /// Union `other` into self. The set never shrinks.
    pub fn merge(&mut self, other: &DependencySet) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().cloned());
        self.0.len() > before
    }

    pub fn contains(&self, entry: &str) -> bool {
        canonical_entry(entry).is_some_and(|e| self.0.contains(&e))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    /// Contents of a `requirements.txt`
    pub fn to_requirements(&self) -> String {
        let mut text = self.to_vec().join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

/// Normalize one requirement entry, or drop it
fn canonical_entry(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("```") {
        return None;
    }

    let without_comment = match trimmed.find(" #") {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };

    let entry: String = without_comment
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();

    (!entry.is_empty()).then_some(entry)
}

/// Content address of a dependency set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(set: &DependencySet) -> Self {
        let digest = Sha256::digest(set.to_vec().join("\n").as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Fingerprint(hex[..FINGERPRINT_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Image tag under the given repository
    pub fn image_tag(&self, repository: &str) -> String {
        format!("{}:{}", repository, self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
