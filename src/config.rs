use crate::confusables::{ConfusableEntry, ConfusablesTable};
use crate::deobfuscate::{DeobfuscationRule, Deobfuscator};
use crate::error::ConfigError;
use crate::normalizer::{EncodingSetting, NormalizerConfig};
use crate::rules::{RuleSet, RuleSpec, MAX_RULES};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Hard cap on the worker pool size.
pub const MAX_WORKERS: usize = 64;

/// Read-only view of a string-keyed configuration mapping.
pub trait ConfigSource {
    fn get_value(&self, key: &str, default: &str) -> String;
    fn key_exists(&self, key: &str) -> bool;
    fn keys(&self) -> Vec<String>;
}

/// Produces a fresh configuration mapping for every (re)start.
pub trait ConfigLoader: Send {
    fn load(&self) -> Result<KeyValueConfig, ConfigError>;
}

/// Plain `key=value` configuration, `;` comments.
#[derive(Debug, Clone, Default)]
pub struct KeyValueConfig {
    values: HashMap<String, String>,
}

impl KeyValueConfig {
    pub fn parse(content: &str) -> Self {
        let mut values = HashMap::new();

        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim_matches(|c| c == ' ' || c == '\t' || c == '\r');
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                log::warn!("Ignoring configuration line {} without '=': {line}", line_no + 1);
                continue;
            };

            let key = key.trim_matches(|c| c == ' ' || c == '\t').to_string();
            let value = value.trim_matches(|c| c == ' ' || c == '\t').to_string();
            if key.is_empty() {
                log::warn!("Ignoring configuration line {} with empty key", line_no + 1);
                continue;
            }

            if values.insert(key.clone(), value).is_some() {
                log::warn!("Configuration key '{key}' repeated, last value wins");
            }
        }

        Self { values }
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::parse(&content))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ConfigSource for KeyValueConfig {
    fn get_value(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn key_exists(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

impl ConfigLoader for KeyValueConfig {
    fn load(&self) -> Result<KeyValueConfig, ConfigError> {
        Ok(self.clone())
    }
}

/// Re-reads the configuration file on every load.
pub struct FileConfigLoader {
    path: String,
}

impl FileConfigLoader {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigLoader for FileConfigLoader {
    fn load(&self) -> Result<KeyValueConfig, ConfigError> {
        log::info!("Loading configuration from {}", self.path);
        KeyValueConfig::from_file(&self.path)
    }
}

/// What remaining workers do with traffic while a fault is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Pass everything unscored.
    Open,
    /// Drop everything unscored.
    Closed,
}

/// Fully validated configuration for one filtering session.
#[derive(Debug)]
pub struct Settings {
    pub filter: String,
    pub workers: usize,
    pub stop_timeout: Duration,
    pub fault_policy: FaultPolicy,
    pub normalizer: NormalizerConfig,
    pub rules: RuleSet,
    pub confusables: ConfusablesTable,
    pub deobfuscator: Deobfuscator,
}

impl Settings {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let filter = source.get_value("filter", "true");
        if filter.is_empty() {
            return Err(ConfigError::invalid("filter", "filter expression is empty"));
        }

        let workers = parse_usize(source, "workers", 4)?;
        if workers == 0 {
            return Err(ConfigError::invalid("workers", "at least one worker is required"));
        }
        if workers > MAX_WORKERS {
            return Err(ConfigError::OverCapacity {
                what: "workers",
                count: workers,
                max: MAX_WORKERS,
            });
        }

        let stop_timeout = Duration::from_millis(parse_usize(source, "stop_timeout_ms", 2000)? as u64);

        let fault_policy = match source.get_value("fault_policy", "open").to_lowercase().as_str() {
            "open" => FaultPolicy::Open,
            "closed" => FaultPolicy::Closed,
            other => {
                return Err(ConfigError::invalid(
                    "fault_policy",
                    format!("expected 'open' or 'closed', got '{other}'"),
                ))
            }
        };

        let encoding = match source.get_value("encoding", "auto").to_lowercase().as_str() {
            "auto" => EncodingSetting::Auto,
            "utf-8" | "utf8" => EncodingSetting::Utf8,
            "utf-16le" | "utf16le" => EncodingSetting::Utf16Le,
            "utf-16be" | "utf16be" => EncodingSetting::Utf16Be,
            other => {
                return Err(ConfigError::invalid(
                    "encoding",
                    format!("unknown encoding '{other}'"),
                ))
            }
        };

        let normalizer = NormalizerConfig {
            ignore_start: parse_usize(source, "ignore_start", 0)?,
            strip_punctuation: parse_char_set(&source.get_value("strip_punctuation", "")),
            strip_whitespace: parse_char_set(&source.get_value("strip_whitespace", "")),
            skeletonize: parse_bool(source, "skeletonize", true)?,
            zlib_decompress: parse_bool(source, "zlib_decompress", false)?,
            encoding,
        };

        let rules = RuleSet::build(read_rules(source)?)?;

        let confusables = ConfusablesTable::build(
            indexed_values(source, "confusable")?
                .into_iter()
                .map(|(key, value)| {
                    let (sources, canonical) = parse_substitution(&key, &value)?;
                    Ok(ConfusableEntry::new(sources.chars().collect(), canonical))
                })
                .collect::<Result<Vec<_>, ConfigError>>()?,
        )?;

        let multi = read_substitutions(source, "deobfuscate_multi")?;
        let single = read_substitutions(source, "deobfuscate_single")?;
        let deobfuscator = Deobfuscator::new(multi, single)?;
        for warning in deobfuscator.cycle_warnings() {
            log::warn!("{warning}");
        }

        Ok(Settings {
            filter,
            workers,
            stop_timeout,
            fault_policy,
            normalizer,
            rules,
            confusables,
            deobfuscator,
        })
    }

    pub fn summary(&self) -> SettingsSummary {
        SettingsSummary {
            filter: self.filter.clone(),
            workers: self.workers,
            stop_timeout_ms: self.stop_timeout.as_millis() as u64,
            fault_policy: self.fault_policy,
            ignore_start: self.normalizer.ignore_start,
            zlib_decompress: self.normalizer.zlib_decompress,
            skeletonize: self.normalizer.skeletonize,
            encoding: self.normalizer.encoding.to_string(),
            strip_punctuation: self.normalizer.strip_punctuation.iter().collect(),
            strip_whitespace: self
                .normalizer
                .strip_whitespace
                .iter()
                .map(|c| c.escape_default().to_string())
                .collect(),
            rules: self
                .rules
                .iter()
                .map(|rule| RuleSummary {
                    name: rule.name().to_string(),
                    weight: rule.weight(),
                    valid: rule.is_valid(),
                })
                .collect(),
            confusable_sources: self.confusables.len(),
            deobfuscate_multi: self.deobfuscator.multi_rules().len(),
            deobfuscate_single: self.deobfuscator.single_rules().len(),
        }
    }
}

/// Serializable view of the effective settings, for `--test-config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSummary {
    pub filter: String,
    pub workers: usize,
    pub stop_timeout_ms: u64,
    pub fault_policy: FaultPolicy,
    pub ignore_start: usize,
    pub zlib_decompress: bool,
    pub skeletonize: bool,
    pub encoding: String,
    pub strip_punctuation: String,
    pub strip_whitespace: Vec<String>,
    pub rules: Vec<RuleSummary>,
    pub confusable_sources: usize,
    pub deobfuscate_multi: usize,
    pub deobfuscate_single: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSummary {
    pub name: String,
    pub weight: u32,
    pub valid: bool,
}

fn parse_usize(source: &dyn ConfigSource, key: &str, default: usize) -> Result<usize, ConfigError> {
    if !source.key_exists(key) {
        return Ok(default);
    }
    let raw = source.get_value(key, "");
    raw.parse::<usize>()
        .map_err(|_| ConfigError::invalid(key, format!("expected a non-negative integer, got '{raw}'")))
}

fn parse_bool(source: &dyn ConfigSource, key: &str, default: bool) -> Result<bool, ConfigError> {
    if !source.key_exists(key) {
        return Ok(default);
    }
    let raw = source.get_value(key, "");
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, format!("expected a boolean, got '{raw}'"))),
    }
}

/// Indices `N` of every key spelled `<prefix>N<suffix>`, ascending.
///
/// A key with the prefix and an index but none of the `suffixes` is an error,
/// as is an index of zero or one with leading zeros.
fn declared_indices(
    source: &dyn ConfigSource,
    prefix: &str,
    suffixes: &[&str],
) -> Result<Vec<usize>, ConfigError> {
    let mut indices = BTreeSet::new();

    for key in source.keys() {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let digits_len = rest.chars().take_while(char::is_ascii_digit).count();
        if digits_len == 0 {
            continue;
        }
        let (digits, suffix) = rest.split_at(digits_len);
        if !suffixes.contains(&suffix) {
            return Err(ConfigError::invalid(&key, "unknown configuration key"));
        }
        if digits.starts_with('0') {
            return Err(ConfigError::invalid(&key, "indices start at 1 without leading zeros"));
        }
        let index = digits
            .parse::<usize>()
            .map_err(|_| ConfigError::invalid(&key, "index out of range"))?;
        indices.insert(index);
    }

    Ok(indices.into_iter().collect())
}

/// Rejects numbering with holes; entries past a hole would otherwise be lost.
fn require_contiguous(prefix: &str, indices: &[usize]) -> Result<(), ConfigError> {
    for (position, index) in indices.iter().enumerate() {
        let expected = position + 1;
        if *index != expected {
            return Err(ConfigError::invalid(
                format!("{prefix}{index}"),
                format!("numbering has a gap, '{prefix}{expected}' is missing"),
            ));
        }
    }
    Ok(())
}

/// Values of `<prefix>1`, `<prefix>2`, ... in order.
fn indexed_values(source: &dyn ConfigSource, prefix: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let indices = declared_indices(source, prefix, &[""])?;
    require_contiguous(prefix, &indices)?;

    Ok(indices
        .into_iter()
        .map(|index| {
            let key = format!("{prefix}{index}");
            let value = source.get_value(&key, "");
            (key, value)
        })
        .collect())
}

fn read_rules(source: &dyn ConfigSource) -> Result<Vec<RuleSpec>, ConfigError> {
    let indices = declared_indices(source, "rule", &[".pattern", ".weight", ".name"])?;
    if indices.len() > MAX_RULES {
        return Err(ConfigError::OverCapacity {
            what: "rules",
            count: indices.len(),
            max: MAX_RULES,
        });
    }
    require_contiguous("rule", &indices)?;

    let mut specs = Vec::with_capacity(indices.len());
    for index in indices {
        let pattern_key = format!("rule{index}.pattern");
        if !source.key_exists(&pattern_key) {
            return Err(ConfigError::invalid(&pattern_key, "rule is declared without a pattern"));
        }
        let weight_key = format!("rule{index}.weight");
        let raw_weight = source.get_value(&weight_key, "");
        let weight = raw_weight.parse::<u32>().map_err(|_| {
            ConfigError::invalid(&weight_key, format!("expected an unsigned weight, got '{raw_weight}'"))
        })?;

        specs.push(RuleSpec {
            name: source.get_value(&format!("rule{index}.name"), &format!("rule{index}")),
            pattern: source.get_value(&pattern_key, ""),
            weight,
        });
    }
    Ok(specs)
}

fn read_substitutions(
    source: &dyn ConfigSource,
    prefix: &str,
) -> Result<Vec<DeobfuscationRule>, ConfigError> {
    indexed_values(source, prefix)?
        .into_iter()
        .map(|(key, value)| {
            let (from, to) = parse_substitution(&key, &value)?;
            Ok(DeobfuscationRule::new(from, to))
        })
        .collect()
}

/// Splits `from=>to` and decodes escapes on both sides. `to` may be empty.
fn parse_substitution(key: &str, value: &str) -> Result<(String, String), ConfigError> {
    let (from, to) = value
        .split_once("=>")
        .ok_or_else(|| ConfigError::invalid(key, format!("expected 'from=>to', got '{value}'")))?;
    let from = decode_escapes(from.trim_matches(|c| c == ' ' || c == '\t'));
    let to = decode_escapes(to.trim_matches(|c| c == ' ' || c == '\t'));
    if from.is_empty() {
        return Err(ConfigError::invalid(key, "substitution source is empty"));
    }
    Ok((from, to))
}

fn parse_char_set(value: &str) -> BTreeSet<char> {
    decode_escapes(value).chars().collect()
}

/// Decodes `\s \t \r \n \\ \u{XXXX}`. Unknown escapes are kept verbatim.
pub fn decode_escapes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('s') => {
                chars.next();
                out.push(' ');
            }
            Some('t') => {
                chars.next();
                out.push('\t');
            }
            Some('r') => {
                chars.next();
                out.push('\r');
            }
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            Some('u') => {
                let rest: String = chars.clone().collect();
                if let Some((decoded, consumed)) = decode_unicode_escape(&rest) {
                    out.push(decoded);
                    for _ in 0..consumed {
                        chars.next();
                    }
                } else {
                    out.push('\\');
                }
            }
            _ => out.push('\\'),
        }
    }

    out
}

/// Parses `u{XXXX}` at the start of `rest`, returning the char and the number
/// of chars consumed.
fn decode_unicode_escape(rest: &str) -> Option<(char, usize)> {
    let body = rest.strip_prefix("u{")?;
    let end = body.find('}')?;
    let hex = &body[..end];
    if hex.is_empty() || hex.len() > 6 {
        return None;
    }
    let code = u32::from_str_radix(hex, 16).ok()?;
    let ch = char::from_u32(code)?;
    Some((ch, 2 + hex.len() + 1))
}

/// Commented default configuration written by `--generate-config`.
pub const DEFAULT_CONFIG: &str = r#"; rmt-filter configuration
; Lines are key=value, ';' starts a comment. Values are trimmed of spaces and tabs.
; Character sets and substitutions accept \s \t \r \n \\ and \u{XXXX} escapes.

; Interceptor filter expression (platform specific, passed through untouched)
filter=true
workers=4
stop_timeout_ms=2000
; open = pass traffic while a fault is pending, closed = drop it
fault_policy=open

; Payload handling
ignore_start=0
zlib_decompress=false
encoding=auto
strip_punctuation=!?,;:'"*~^_-+=<>
strip_whitespace=\s\t\r\n\u{3000}
skeletonize=true

; Scoring rules (at most 16). A message is spam once matched weights reach 100.
rule1.name=website
rule1.pattern=(?i)(www\.|\.com|\.net|\.org)
rule1.weight=40
rule2.name=currency
rule2.pattern=(?i)(gold|adena|mesos|kinah|zeny|coins?)
rule2.weight=30
rule3.name=price
rule3.pattern=(?i)(usd|eur|price|cheap|discount|%off)
rule3.weight=30
rule4.name=delivery
rule4.pattern=(?i)(deliver|instant|fast|24/7|safe)
rule4.weight=20
rule5.name=payment
rule5.pattern=(?i)(paypal|skrill|webmoney|bitcoin|btc)
rule5.weight=40
rule6.name=store
rule6.pattern=(?i)(buy|sell|store|shop)
rule6.weight=20
rule7.name=coupon
rule7.pattern=(?i)(code|coupon|bonus)
rule7.weight=20

; Confusables: sources=>canonical
confusable1=\u{0430}\u{03B1}\u{FF41}\u{1D41A}=>a
confusable2=\u{0435}\u{03B5}\u{FF45}\u{1D41E}=>e
confusable3=\u{043E}\u{03BF}\u{FF4F}\u{1D428}=>o
confusable4=\u{0440}\u{03C1}\u{FF50}=>p
confusable5=\u{0441}\u{03F2}\u{FF43}\u{1D41C}=>c
confusable6=\u{0445}\u{03C7}\u{FF58}=>x
confusable7=\u{0456}\u{FF49}=>i
confusable8=\u{0455}\u{FF53}=>s
confusable9=\u{051D}\u{FF57}=>w
confusable10=\u{0410}\u{0391}\u{FF21}=>A
confusable11=\u{0415}\u{0395}\u{FF25}=>E
confusable12=\u{041E}\u{039F}\u{FF2F}=>O
confusable13=\u{FF10}=>0
confusable14=\u{FF11}=>1

; Deobfuscation: multi-character rules run first, then single-character rules
deobfuscate_multi1=vv=>w
deobfuscate_multi2=\/\/=>w
deobfuscate_multi3=(dot)=>.
deobfuscate_multi4=()=>o
deobfuscate_single1=0=>o
deobfuscate_single2=@=>a
deobfuscate_single3=|=>l
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_values() {
        let config = KeyValueConfig::parse(
            "; comment\n\
             workers = 8\n\
             \tfilter=\toutbound and tcp\t\n\
             no separator here\n\
             empty=\n",
        );

        assert_eq!(config.get_value("workers", "1"), "8");
        assert_eq!(config.get_value("filter", ""), "outbound and tcp");
        assert!(config.key_exists("empty"));
        assert_eq!(config.get_value("empty", "x"), "");
        assert_eq!(config.get_value("missing", "fallback"), "fallback");
        assert!(!config.key_exists("no separator here"));
        assert_eq!(config.len(), 3);
    }

    #[test]
    fn test_value_keeps_inner_equals() {
        let config = KeyValueConfig::parse("deobfuscate_multi1=vv=>w");
        assert_eq!(config.get_value("deobfuscate_multi1", ""), "vv=>w");
    }

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode_escapes(r"\s\t\r\n\\"), " \t\r\n\\");
        assert_eq!(decode_escapes(r"\u{3000}x"), "\u{3000}x");
        assert_eq!(decode_escapes(r"\/\/"), r"\/\/");
        assert_eq!(decode_escapes(r"\u{zz}"), r"\u{zz}");
    }

    #[test]
    fn test_default_config_builds() {
        let settings = Settings::from_source(&KeyValueConfig::parse(DEFAULT_CONFIG)).unwrap();

        assert_eq!(settings.workers, 4);
        assert_eq!(settings.fault_policy, FaultPolicy::Open);
        assert_eq!(settings.rules.len(), 7);
        assert!(settings.rules.iter().all(|rule| rule.is_valid()));
        assert!(settings.normalizer.strip_whitespace.contains(&'\u{3000}'));
        assert!(settings.normalizer.strip_whitespace.contains(&' '));
        assert_eq!(settings.confusables.canonical('\u{0430}'), Some("a"));
        assert_eq!(settings.deobfuscator.multi_rules().len(), 4);
        assert_eq!(settings.deobfuscator.single_rules().len(), 3);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_source(&KeyValueConfig::default()).unwrap();
        assert_eq!(settings.filter, "true");
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.stop_timeout, Duration::from_millis(2000));
        assert!(settings.rules.is_empty());
        assert!(settings.normalizer.skeletonize);
        assert!(!settings.normalizer.zlib_decompress);
    }

    #[test]
    fn test_worker_cap_rejected() {
        let config = KeyValueConfig::parse("workers=65");
        match Settings::from_source(&config) {
            Err(ConfigError::OverCapacity { count: 65, max: 64, .. }) => {}
            other => panic!("Expected over-capacity error, got {other:?}"),
        }

        assert!(Settings::from_source(&KeyValueConfig::parse("workers=64")).is_ok());
        assert!(Settings::from_source(&KeyValueConfig::parse("workers=0")).is_err());
    }

    #[test]
    fn test_too_many_rules_rejected() {
        let mut text = String::new();
        for i in 1..=17 {
            text.push_str(&format!("rule{i}.pattern=word{i}\nrule{i}.weight=10\n"));
        }
        match Settings::from_source(&KeyValueConfig::parse(&text)) {
            Err(ConfigError::OverCapacity { what: "rules", count: 17, max: 16 }) => {}
            other => panic!("Expected rule capacity error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        for text in [
            "skeletonize=maybe",
            "ignore_start=-1",
            "fault_policy=sideways",
            "encoding=latin1",
            "rule1.pattern=gold\nrule1.weight=heavy",
            "deobfuscate_multi1=no arrow",
            "deobfuscate_single1=ab=>c",
            "confusable1==>a",
        ] {
            assert!(
                Settings::from_source(&KeyValueConfig::parse(text)).is_err(),
                "Expected configuration error for: {text}"
            );
        }
    }

    #[test]
    fn test_rule_gap_rejected() {
        let config = KeyValueConfig::parse(
            "rule1.pattern=a\nrule1.weight=1\nrule3.pattern=c\nrule3.weight=3\n",
        );
        match Settings::from_source(&config) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "rule3"),
            other => panic!("Expected gap error, got {other:?}"),
        }
    }

    #[test]
    fn test_rules_past_gap_count_toward_capacity() {
        let mut text = String::new();
        for i in (1..=16).chain(18..=20) {
            text.push_str(&format!("rule{i}.pattern=word{i}\nrule{i}.weight=10\n"));
        }
        match Settings::from_source(&KeyValueConfig::parse(&text)) {
            Err(ConfigError::OverCapacity { what: "rules", count: 19, max: 16 }) => {}
            other => panic!("Expected rule capacity error, got {other:?}"),
        }
    }

    #[test]
    fn test_stray_rule_keys_rejected() {
        for text in [
            "rule1.pattern=a\nrule1.weight=1\nrule2.weight=5\n",
            "rule1.pattern=a\nrule1.weight=1\nrule1.colour=red\n",
            "rule0.pattern=a\nrule0.weight=1\n",
            "rule01.pattern=a\nrule01.weight=1\n",
        ] {
            assert!(
                Settings::from_source(&KeyValueConfig::parse(text)).is_err(),
                "Expected configuration error for: {text}"
            );
        }
    }

    #[test]
    fn test_indexed_tables_reject_gaps() {
        for text in [
            "confusable1=\\u{0430}=>a\nconfusable3=\\u{043E}=>o\n",
            "deobfuscate_multi2=vv=>w\n",
            "deobfuscate_single1=0=>o\ndeobfuscate_single4=1=>i\n",
        ] {
            assert!(
                matches!(
                    Settings::from_source(&KeyValueConfig::parse(text)),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "Expected gap error for: {text}"
            );
        }
    }

    #[test]
    fn test_invalid_pattern_is_not_fatal() {
        let config = KeyValueConfig::parse("rule1.pattern=(unclosed\nrule1.weight=100\n");
        let settings = Settings::from_source(&config).unwrap();
        assert_eq!(settings.rules.len(), 1);
        assert!(!settings.rules.iter().all(|rule| rule.is_valid()));
    }

    #[test]
    fn test_file_loader_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rmt-filter.conf");
        std::fs::write(&path, "workers=2\n").unwrap();

        let loader = FileConfigLoader::new(path.to_string_lossy().to_string());
        assert_eq!(loader.load().unwrap().get_value("workers", ""), "2");

        std::fs::write(&path, "workers=3\n").unwrap();
        assert_eq!(loader.load().unwrap().get_value("workers", ""), "3");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let loader = FileConfigLoader::new("/nonexistent/rmt-filter.conf");
        assert!(matches!(loader.load(), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_summary_serializes() {
        let settings = Settings::from_source(&KeyValueConfig::parse(DEFAULT_CONFIG)).unwrap();
        let yaml = serde_yaml::to_string(&settings.summary()).unwrap();
        assert!(yaml.contains("fault_policy: open"));
        assert!(yaml.contains("name: website"));
    }
}
