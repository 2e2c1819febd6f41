//! Confusable character table.
//!
//! Spam evades plain matching by swapping letters for look-alikes from other
//! scripts (Cyrillic `а` for Latin `a`, fullwidth forms, mathematical
//! alphanumerics). The table collapses every known look-alike onto a single
//! canonical representative.

use crate::error::ConfigError;
use std::collections::HashMap;

/// One declaration: every char in `sources` maps to `canonical`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusableEntry {
    pub sources: Vec<char>,
    pub canonical: String,
}

impl ConfusableEntry {
    pub fn new(sources: Vec<char>, canonical: impl Into<String>) -> Self {
        Self {
            sources,
            canonical: canonical.into(),
        }
    }
}

/// Many-to-one mapping from source character to canonical text.
///
/// Chains are resolved when the table is built, so a canonical form never
/// contains a source character and skeletonizing is idempotent.
#[derive(Debug, Clone, Default)]
pub struct ConfusablesTable {
    map: HashMap<char, String>,
}

impl ConfusablesTable {
    pub fn build(entries: Vec<ConfusableEntry>) -> Result<Self, ConfigError> {
        let mut map: HashMap<char, String> = HashMap::new();

        for entry in entries {
            for source in entry.sources {
                if entry.canonical.chars().eq(std::iter::once(source)) {
                    // Identity mapping, nothing to collapse.
                    continue;
                }
                match map.get(&source) {
                    Some(existing) if *existing != entry.canonical => {
                        return Err(ConfigError::AmbiguousConfusable {
                            source_char: source,
                            first: existing.clone(),
                            second: entry.canonical.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        map.insert(source, entry.canonical.clone());
                    }
                }
            }
        }

        let resolved = Self::resolve_chains(&map)?;
        log::debug!("Built confusables table with {} source characters", resolved.len());
        Ok(Self { map: resolved })
    }

    /// Rewrites every canonical form until it contains no source characters.
    fn resolve_chains(map: &HashMap<char, String>) -> Result<HashMap<char, String>, ConfigError> {
        let mut resolved = HashMap::with_capacity(map.len());

        for (&source, canonical) in map {
            let mut current = canonical.clone();
            let mut settled = false;

            // A chain can visit each source at most once before it repeats.
            for _ in 0..=map.len() {
                if !current.chars().any(|c| map.contains_key(&c)) {
                    settled = true;
                    break;
                }
                current = current
                    .chars()
                    .map(|c| map.get(&c).cloned().unwrap_or_else(|| c.to_string()))
                    .collect();
            }

            if !settled {
                return Err(ConfigError::ConfusableCycle { source_char: source });
            }
            resolved.insert(source, current);
        }

        Ok(resolved)
    }

    pub fn canonical(&self, ch: char) -> Option<&str> {
        self.map.get(&ch).map(String::as_str)
    }

    pub fn skeletonize(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            match self.map.get(&ch) {
                Some(canonical) => out.push_str(canonical),
                None => out.push(ch),
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
