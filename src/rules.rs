use crate::error::{ConfigError, RuleError};
use regex::Regex;

/// Upper bound on configured rules.
pub const MAX_RULES: usize = 16;

/// Matched weight at or above which a message is spam.
pub const SPAM_THRESHOLD: u32 = 100;

/// Rule as declared in configuration, before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub name: String,
    pub pattern: String,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    pattern: String,
    weight: u32,
    matcher: Result<Regex, RuleError>,
}

impl Rule {
    /// An empty pattern would match every text, so it is treated like an
    /// invalid one.
    pub fn compile(spec: RuleSpec) -> Self {
        let matcher = if spec.pattern.is_empty() {
            Err(RuleError {
                rule: spec.name.clone(),
                reason: "pattern is empty".to_string(),
            })
        } else {
            Regex::new(&spec.pattern).map_err(|e| RuleError {
                rule: spec.name.clone(),
                reason: e.to_string(),
            })
        };
        if let Err(e) = &matcher {
            log::warn!("{e}; the rule will never match");
        }

        Rule {
            name: spec.name,
            pattern: spec.pattern,
            weight: spec.weight,
            matcher,
        }
    }

    /// An invalid pattern never matches.
    pub fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Ok(regex) => regex.is_match(text),
            Err(_) => false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_valid(&self) -> bool {
        self.matcher.is_ok()
    }

    pub fn error(&self) -> Option<&RuleError> {
        self.matcher.as_ref().err()
    }
}

/// Ordered rules, at most [`MAX_RULES`].
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn build(specs: Vec<RuleSpec>) -> Result<Self, ConfigError> {
        if specs.len() > MAX_RULES {
            return Err(ConfigError::OverCapacity {
                what: "rules",
                count: specs.len(),
                max: MAX_RULES,
            });
        }

        let rules: Vec<Rule> = specs.into_iter().map(Rule::compile).collect();
        log::debug!(
            "Compiled {} rules ({} invalid)",
            rules.len(),
            rules.iter().filter(|r| !r.is_valid()).count()
        );
        Ok(RuleSet { rules })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, pattern: &str, weight: u32) -> RuleSpec {
        RuleSpec {
            name: name.to_string(),
            pattern: pattern.to_string(),
            weight,
        }
    }

    #[test]
    fn test_declared_order_preserved() {
        let set = RuleSet::build(vec![spec("b", "b", 1), spec("a", "a", 2), spec("c", "c", 3)])
            .unwrap();
        let names: Vec<&str> = set.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_capacity_enforced() {
        let specs: Vec<RuleSpec> = (0..MAX_RULES).map(|i| spec(&format!("r{i}"), "x", 1)).collect();
        assert!(RuleSet::build(specs.clone()).is_ok());

        let mut over = specs;
        over.push(spec("extra", "x", 1));
        assert!(matches!(
            RuleSet::build(over),
            Err(ConfigError::OverCapacity { count: 17, .. })
        ));
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let rule = Rule::compile(spec("broken", "[unterminated", 100));
        assert!(!rule.is_valid());
        assert!(!rule.matches("[unterminated"));
        assert_eq!(rule.error().map(|e| e.rule.as_str()), Some("broken"));
    }

    #[test]
    fn test_empty_pattern_never_matches() {
        let rule = Rule::compile(spec("blank", "", 100));
        assert!(!rule.is_valid());
        assert!(!rule.matches("hello friend"));
        assert!(!rule.matches(""));
    }

    #[test]
    fn test_matches_anywhere() {
        let rule = Rule::compile(spec("gold", "(?i)gold", 30));
        assert!(rule.matches("buyGOLDnow"));
        assert!(!rule.matches("silver"));
        assert_eq!(rule.pattern(), "(?i)gold");
    }
}
