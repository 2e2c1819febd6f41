//! Weighted rule scoring.
//!
//! Every rule that matches anywhere in the normalized text contributes its
//! weight; the sum decides the verdict against a fixed threshold.

use crate::rules::{RuleSet, SPAM_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Spam,
    Clean,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Spam => write!(f, "SPAM"),
            Classification::Clean => write!(f, "CLEAN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub score: u32,
    pub classification: Classification,
    pub matched_rules: Vec<String>,
}

impl Verdict {
    pub fn clean() -> Self {
        Verdict {
            score: 0,
            classification: Classification::Clean,
            matched_rules: Vec::new(),
        }
    }

    pub fn is_spam(&self) -> bool {
        self.classification == Classification::Spam
    }
}

pub struct ScoringEngine {
    rules: RuleSet,
}

impl ScoringEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn evaluate(&self, text: &str) -> Verdict {
        let mut score: u32 = 0;
        let mut matched_rules = Vec::new();

        for rule in self.rules.iter() {
            if rule.matches(text) {
                score = score.saturating_add(rule.weight());
                matched_rules.push(rule.name().to_string());
            }
        }

        let classification = if score >= SPAM_THRESHOLD {
            Classification::Spam
        } else {
            Classification::Clean
        };

        log::trace!("Scored {score} ({classification}) from rules {matched_rules:?}");

        Verdict {
            score,
            classification,
            matched_rules,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSpec;

    fn engine(rules: &[(&str, &str, u32)]) -> ScoringEngine {
        let specs = rules
            .iter()
            .map(|(name, pattern, weight)| RuleSpec {
                name: name.to_string(),
                pattern: pattern.to_string(),
                weight: *weight,
            })
            .collect();
        ScoringEngine::new(RuleSet::build(specs).unwrap())
    }

    #[test]
    fn test_threshold_boundary() {
        let engine = engine(&[("site", "www", 60), ("gold", "gold", 40)]);

        let both = engine.evaluate("wwwcheapgold");
        assert_eq!(both.score, 100);
        assert_eq!(both.classification, Classification::Spam);
        assert_eq!(both.matched_rules, vec!["site", "gold"]);

        let one = engine.evaluate("wwwexample");
        assert_eq!(one.score, 60);
        assert_eq!(one.classification, Classification::Clean);
    }

    #[test]
    fn test_ninety_nine_is_clean() {
        let engine = engine(&[("a", "a", 50), ("b", "b", 49)]);
        let verdict = engine.evaluate("ab");
        assert_eq!(verdict.score, 99);
        assert!(!verdict.is_spam());
    }

    #[test]
    fn test_rule_counts_once_per_message() {
        let engine = engine(&[("gold", "gold", 60)]);
        let verdict = engine.evaluate("goldgoldgold");
        assert_eq!(verdict.score, 60);
        assert!(!verdict.is_spam());
    }

    #[test]
    fn test_invalid_rule_skipped_others_evaluated() {
        let engine = engine(&[("broken", "(", 100), ("site", "www", 60), ("gold", "gold", 40)]);
        let verdict = engine.evaluate("(wwwgold");
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.matched_rules, vec!["site", "gold"]);
    }

    #[test]
    fn test_weights_saturate() {
        let engine = engine(&[("a", "a", u32::MAX), ("b", "b", 10)]);
        let verdict = engine.evaluate("ab");
        assert_eq!(verdict.score, u32::MAX);
        assert!(verdict.is_spam());
    }

    #[test]
    fn test_empty_rule_set_is_clean() {
        let engine = engine(&[]);
        assert_eq!(engine.evaluate("anything"), Verdict { score: 0, ..Verdict::clean() });
    }

    #[test]
    fn test_deterministic() {
        let engine = engine(&[("site", "www", 60), ("gold", "gold", 40)]);
        let first = engine.evaluate("wwwgold");
        for _ in 0..10 {
            assert_eq!(engine.evaluate("wwwgold"), first);
        }
    }
}
