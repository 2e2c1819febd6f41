//! Substitution rules that undo common spam obfuscation (`vv` for `w`,
//! `0` for `o`, `(dot)` for `.`).
//!
//! Rules run strictly one after another: every rule sees the output of the
//! previous one, never the original text.

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeobfuscationRule {
    pub from: String,
    pub to: String,
}

impl DeobfuscationRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    fn apply(&self, text: &str) -> String {
        if self.from.is_empty() {
            return text.to_string();
        }
        text.replace(self.from.as_str(), &self.to)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Deobfuscator {
    multi: Vec<DeobfuscationRule>,
    single: Vec<DeobfuscationRule>,
}

impl Deobfuscator {
    /// `single` rules must each replace exactly one character.
    pub fn new(
        multi: Vec<DeobfuscationRule>,
        single: Vec<DeobfuscationRule>,
    ) -> Result<Self, ConfigError> {
        for (index, rule) in multi.iter().enumerate() {
            if rule.from.is_empty() {
                return Err(ConfigError::invalid(
                    format!("deobfuscate_multi{}", index + 1),
                    "substitution source is empty",
                ));
            }
        }
        for (index, rule) in single.iter().enumerate() {
            if rule.from.chars().count() != 1 {
                return Err(ConfigError::invalid(
                    format!("deobfuscate_single{}", index + 1),
                    format!("expected a single character, got '{}'", rule.from),
                ));
            }
        }

        Ok(Self { multi, single })
    }

    pub fn apply(&self, text: &str) -> String {
        self.multi
            .iter()
            .chain(self.single.iter())
            .fold(text.to_string(), |current, rule| rule.apply(&current))
    }

    pub fn multi_rules(&self) -> &[DeobfuscationRule] {
        &self.multi
    }

    pub fn single_rules(&self) -> &[DeobfuscationRule] {
        &self.single
    }

    /// Pairs of rules where a later rule can undo or re-trigger an earlier one.
    ///
    /// Passes stay sequential regardless; these are only reported so operators
    /// notice rule sets that fight each other.
    pub fn cycle_warnings(&self) -> Vec<String> {
        let ordered: Vec<&DeobfuscationRule> = self.multi.iter().chain(self.single.iter()).collect();
        let mut warnings = Vec::new();

        for (i, earlier) in ordered.iter().enumerate() {
            for later in ordered.iter().skip(i + 1) {
                let later_hits_output = !earlier.to.is_empty() && earlier.to.contains(later.from.as_str());
                let later_restores_input = !later.to.is_empty() && later.to.contains(earlier.from.as_str());
                if later_hits_output && later_restores_input {
                    warnings.push(format!(
                        "Deobfuscation rules '{}'->'{}' and '{}'->'{}' can cycle; later rule undoes the earlier one",
                        earlier.from, earlier.to, later.from, later.to
                    ));
                }
            }
        }

        warnings
    }
}
