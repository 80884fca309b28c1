//! Checklist predicates and the rule-based verifier for the built-in kinds.
//!
//! A stage's checklist is a list of predicate ids resolved through a
//! [`PredicateRegistry`]. Every predicate carries a [`Severity`]:
//!
//! - `P0` hard-blocking: a unit still carrying it fails the quality gate.
//! - `P1` blocking: prevents APPROVE and counts toward HIGH risk.
//! - `P2` advisory: reported, never blocks.
//!
//! Most kinds are pass/fail on the text. The graded kinds (`HedgeDensity`,
//! `SentenceLength`) measure a per-sentence rate and fail above a threshold;
//! the measured value goes into the result detail.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::partition::complexity::sentences;
use crate::partition::facts::extract_definitions;

static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bTODO\b|\bTBD\b|\bXXX\b|\[\?\]").expect("PLACEHOLDER_PATTERN regex should compile")
});

/// Hedging lexicon: ability, promise, epistemic, approximation and
/// tentative expressions.
static HEDGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(able to|capable of|can|promising|paving the way|may|might|suggests?|suggesting",
        r"|indicates?|indicating|potentially|possibly|likely|approximately|nearly|roughly",
        r"|to our knowledge|believe|consistent with|compatible with)\b|~"
    ))
    .expect("HEDGE_PATTERN regex should compile")
});

/// Canonical fact values the candidates are checked against.
pub type ReferenceFacts = BTreeMap<String, String>;

/// Count unresolved placeholders (`TODO`, `TBD`, `XXX`, `[?]`) in a text.
pub fn count_placeholders(text: &str) -> usize {
    PLACEHOLDER_PATTERN.find_iter(text).count()
}

/// Number of hedging expressions in a text.
pub fn count_hedges(text: &str) -> usize {
    HEDGE_PATTERN.find_iter(text).count()
}

/// Hedges per sentence. Zero for a text without sentences.
pub fn hedge_density(text: &str) -> f64 {
    let count = sentences(text).len();
    if count == 0 {
        return 0.0;
    }
    count_hedges(text) as f64 / count as f64
}

/// Mean words per sentence. Zero for a text without sentences.
pub fn mean_sentence_words(text: &str) -> f64 {
    let all = sentences(text);
    if all.is_empty() {
        return 0.0;
    }
    let words: usize = all.iter().map(|s| s.split_whitespace().count()).sum();
    words as f64 / all.len() as f64
}

/// Severity of an unmet predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    P0,
    P1,
    P2,
}

impl Severity {
    /// Whether an unmet predicate of this severity prevents approval.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::P0 | Self::P1)
    }

    /// Whether an unmet predicate of this severity blocks final assembly.
    pub fn is_hard_blocking(self) -> bool {
        matches!(self, Self::P0)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P0 => write!(f, "P0"),
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
        }
    }
}

/// What a predicate checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateKind {
    /// Word count within `[min, max]`.
    WordBounds { min: usize, max: usize },
    /// Text must match the pattern at least once.
    RequiredMarker { pattern: String },
    /// Text must not match the pattern.
    ForbiddenMarker { pattern: String },
    /// Every declared fact must agree with the reference fact set.
    FactConsistency,
    /// No `TODO`/`TBD`/`XXX`/`[?]` left in the text.
    NoPlaceholders,
    /// Hedging expressions per sentence at most `max_per_sentence`.
    HedgeDensity { max_per_sentence: f64 },
    /// Mean sentence length at most `max_mean_words`.
    SentenceLength { max_mean_words: f64 },
    /// Only the injected capability can evaluate this one.
    External,
}

/// A named verifiable check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: PredicateKind,
}

impl Predicate {
    pub fn new(id: &str, description: &str, severity: Severity, kind: PredicateKind) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            severity,
            kind,
        }
    }

    /// Compile-check any pattern this predicate carries.
    pub fn check_pattern(&self) -> Result<(), String> {
        match &self.kind {
            PredicateKind::RequiredMarker { pattern } | PredicateKind::ForbiddenMarker { pattern } => {
                Regex::new(pattern).map(|_| ()).map_err(|e| e.to_string())
            }
            PredicateKind::WordBounds { min, max } if min > max => {
                Err(format!("word bounds inverted ({} > {})", min, max))
            }
            PredicateKind::HedgeDensity { max_per_sentence: max }
            | PredicateKind::SentenceLength { max_mean_words: max }
                if !max.is_finite() || *max <= 0.0 =>
            {
                Err(format!("threshold must be a positive number, got {}", max))
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of one predicate against one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateResult {
    pub predicate_id: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl PredicateResult {
    pub fn pass(predicate_id: &str) -> Self {
        Self {
            predicate_id: predicate_id.to_string(),
            passed: true,
            detail: String::new(),
        }
    }

    pub fn fail(predicate_id: &str, detail: impl Into<String>) -> Self {
        Self {
            predicate_id: predicate_id.to_string(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Registry of every predicate a rotation may reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredicateRegistry {
    predicates: BTreeMap<String, Predicate>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate, replacing any previous one with the same id.
    pub fn register(&mut self, predicate: Predicate) {
        self.predicates.insert(predicate.id.clone(), predicate);
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.register(predicate);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Predicate> {
        self.predicates.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.predicates.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Built-in predicates used by the default rotation.
    pub fn builtin() -> Self {
        Self::new()
            .with(Predicate::new(
                "word-bounds",
                "unit length stays within bounds",
                Severity::P1,
                PredicateKind::WordBounds { min: 1, max: 2000 },
            ))
            .with(Predicate::new(
                "no-placeholders",
                "no unresolved placeholders remain",
                Severity::P1,
                PredicateKind::NoPlaceholders,
            ))
            .with(Predicate::new(
                "fact-consistency",
                "declared facts agree with the reference fact set",
                Severity::P0,
                PredicateKind::FactConsistency,
            ))
            .with(Predicate::new(
                "no-unsupported-superlatives",
                "no unsupported priority or superlative claims",
                Severity::P1,
                PredicateKind::ForbiddenMarker {
                    pattern: r"(?i)\b(first ever|unprecedented|revolutionary|for the first time)\b"
                        .to_string(),
                },
            ))
            .with(Predicate::new(
                "no-hedging",
                "no stacked hedges",
                Severity::P2,
                PredicateKind::ForbiddenMarker {
                    pattern: r"(?i)\b(arguably|perhaps|might possibly|it seems)\b".to_string(),
                },
            ))
            .with(Predicate::new(
                "hedge-density",
                "at most one hedging expression per sentence",
                Severity::P2,
                PredicateKind::HedgeDensity { max_per_sentence: 1.0 },
            ))
            .with(Predicate::new(
                "sentence-length",
                "sentences average at most 35 words",
                Severity::P2,
                PredicateKind::SentenceLength { max_mean_words: 35.0 },
            ))
            .with(Predicate::new(
                "quantities-stated",
                "at least one quantitative statement",
                Severity::P2,
                PredicateKind::RequiredMarker {
                    pattern: r"\d".to_string(),
                },
            ))
    }
}

/// Rule-based verifier for every predicate kind except `External`.
#[derive(Debug, Clone, Default)]
pub struct ChecklistVerifier;

impl ChecklistVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one predicate. Returns `None` for `External` predicates.
    pub fn evaluate(
        &self,
        text: &str,
        predicate: &Predicate,
        facts: &ReferenceFacts,
    ) -> Option<PredicateResult> {
        let id = predicate.id.as_str();
        let result = match &predicate.kind {
            PredicateKind::WordBounds { min, max } => {
                let words = text.split_whitespace().count();
                if words < *min || words > *max {
                    PredicateResult::fail(id, format!("{} words, expected {}-{}", words, min, max))
                } else {
                    PredicateResult::pass(id)
                }
            }
            PredicateKind::RequiredMarker { pattern } => match Regex::new(pattern) {
                Ok(re) if re.is_match(text) => PredicateResult::pass(id),
                Ok(_) => PredicateResult::fail(id, format!("missing required marker /{}/", pattern)),
                Err(e) => PredicateResult::fail(id, format!("invalid pattern: {}", e)),
            },
            PredicateKind::ForbiddenMarker { pattern } => match Regex::new(pattern) {
                Ok(re) => match re.find(text) {
                    Some(m) => PredicateResult::fail(id, format!("forbidden marker '{}'", m.as_str())),
                    None => PredicateResult::pass(id),
                },
                Err(e) => PredicateResult::fail(id, format!("invalid pattern: {}", e)),
            },
            PredicateKind::FactConsistency => {
                let mismatches: Vec<String> = extract_definitions(text)
                    .into_iter()
                    .filter_map(|(key, value)| match facts.get(&key) {
                        Some(expected) if *expected != value => {
                            Some(format!("{}={} (expected {})", key, value, expected))
                        }
                        _ => None,
                    })
                    .collect();
                if mismatches.is_empty() {
                    PredicateResult::pass(id)
                } else {
                    PredicateResult::fail(id, mismatches.join(", "))
                }
            }
            PredicateKind::NoPlaceholders => match count_placeholders(text) {
                0 => PredicateResult::pass(id),
                n => PredicateResult::fail(id, format!("{} placeholder(s) left", n)),
            },
            PredicateKind::HedgeDensity { max_per_sentence } => {
                let density = hedge_density(text);
                if density > *max_per_sentence {
                    PredicateResult::fail(
                        id,
                        format!("{:.2} hedges per sentence, max {:.2}", density, max_per_sentence),
                    )
                } else {
                    PredicateResult::pass(id)
                }
            }
            PredicateKind::SentenceLength { max_mean_words } => {
                let mean = mean_sentence_words(text);
                if mean > *max_mean_words {
                    PredicateResult::fail(
                        id,
                        format!("{:.1} words per sentence, max {:.1}", mean, max_mean_words),
                    )
                } else {
                    PredicateResult::pass(id)
                }
            }
            PredicateKind::External => return None,
        };
        Some(result)
    }

    /// Evaluate a whole checklist. Unknown ids and `External` predicates fail
    /// with an explanatory detail; the rotation validator rejects unknown ids
    /// up front, so that branch only fires on a registry swapped at runtime.
    pub fn verify(
        &self,
        text: &str,
        checklist: &[String],
        registry: &PredicateRegistry,
        facts: &ReferenceFacts,
    ) -> Vec<PredicateResult> {
        checklist
            .iter()
            .map(|id| match registry.get(id) {
                Some(predicate) => self
                    .evaluate(text, predicate, facts)
                    .unwrap_or_else(|| PredicateResult::fail(id, "requires external verifier")),
                None => PredicateResult::fail(id, "undefined predicate"),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> ReferenceFacts {
        let mut facts = ReferenceFacts::new();
        facts.insert("efficiency".to_string(), "42%".to_string());
        facts
    }

    #[test]
    fn test_word_bounds() {
        let verifier = ChecklistVerifier::new();
        let p = Predicate::new(
            "len",
            "len",
            Severity::P1,
            PredicateKind::WordBounds { min: 2, max: 4 },
        );
        assert!(verifier.evaluate("one two three", &p, &facts()).unwrap().passed);
        assert!(!verifier.evaluate("one", &p, &facts()).unwrap().passed);
        let r = verifier.evaluate("a b c d e", &p, &facts()).unwrap();
        assert!(!r.passed);
        assert!(r.detail.contains("5 words"));
    }

    #[test]
    fn test_markers() {
        let verifier = ChecklistVerifier::new();
        let required = Predicate::new(
            "num",
            "num",
            Severity::P2,
            PredicateKind::RequiredMarker {
                pattern: r"\d".to_string(),
            },
        );
        let forbidden = Predicate::new(
            "hype",
            "hype",
            Severity::P1,
            PredicateKind::ForbiddenMarker {
                pattern: "(?i)revolutionary".to_string(),
            },
        );
        assert!(verifier.evaluate("gain of 3 dB", &required, &facts()).unwrap().passed);
        assert!(!verifier.evaluate("no numbers", &required, &facts()).unwrap().passed);
        let r = verifier
            .evaluate("A Revolutionary laser", &forbidden, &facts())
            .unwrap();
        assert!(!r.passed);
        assert!(r.detail.contains("Revolutionary"));
    }

    #[test]
    fn test_fact_consistency() {
        let verifier = ChecklistVerifier::new();
        let p = Predicate::new("facts", "facts", Severity::P0, PredicateKind::FactConsistency);
        assert!(verifier
            .evaluate("We reach [[efficiency: 42%]].", &p, &facts())
            .unwrap()
            .passed);
        let r = verifier
            .evaluate("We reach [[efficiency: 40%]].", &p, &facts())
            .unwrap();
        assert!(!r.passed);
        assert!(r.detail.contains("expected 42%"));
        // Facts outside the reference set are not judged.
        assert!(verifier
            .evaluate("[[bandwidth: 3 THz]]", &p, &facts())
            .unwrap()
            .passed);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(count_placeholders("fine text"), 0);
        assert_eq!(count_placeholders("TODO cite [?] and TBD"), 3);
        assert_eq!(count_placeholders("TODOS are words"), 0);
    }

    #[test]
    fn test_hedge_density_is_graded() {
        let verifier = ChecklistVerifier::new();
        let p = Predicate::new(
            "hedges",
            "hedges",
            Severity::P2,
            PredicateKind::HedgeDensity { max_per_sentence: 1.0 },
        );
        assert_eq!(count_hedges("The gain may possibly reach roughly 3 dB."), 3);
        assert_eq!(count_hedges("Cannot is not a hedge, canister neither."), 0);
        assert!((hedge_density("It may work. It works.") - 0.5).abs() < 1e-9);
        assert_eq!(hedge_density(""), 0.0);

        assert!(verifier
            .evaluate("It may work. The gain is 3 dB.", &p, &facts())
            .unwrap()
            .passed);
        let r = verifier
            .evaluate("It may possibly work. It is likely stable.", &p, &facts())
            .unwrap();
        assert!(!r.passed);
        assert!(r.detail.contains("1.50 hedges per sentence"));
    }

    #[test]
    fn test_sentence_length_is_graded() {
        let verifier = ChecklistVerifier::new();
        let p = Predicate::new(
            "long",
            "long",
            Severity::P2,
            PredicateKind::SentenceLength { max_mean_words: 4.0 },
        );
        assert!((mean_sentence_words("One two three. Four five six seven eight.") - 4.0).abs() < 1e-9);
        assert!(verifier
            .evaluate("One two three. Four five six seven eight.", &p, &facts())
            .unwrap()
            .passed);
        let r = verifier
            .evaluate("One two three four five six.", &p, &facts())
            .unwrap();
        assert!(!r.passed);
        assert!(r.detail.contains("6.0 words per sentence"));
    }

    #[test]
    fn test_external_and_unknown() {
        let verifier = ChecklistVerifier::new();
        let registry = PredicateRegistry::new().with(Predicate::new(
            "tone",
            "tone",
            Severity::P2,
            PredicateKind::External,
        ));
        let results = verifier.verify(
            "text",
            &["tone".to_string(), "ghost".to_string()],
            &registry,
            &facts(),
        );
        assert_eq!(results.len(), 2);
        assert!(!results[0].passed);
        assert!(results[0].detail.contains("external"));
        assert_eq!(results[1].detail, "undefined predicate");
    }

    #[test]
    fn test_check_pattern() {
        let bad = Predicate::new(
            "bad",
            "bad",
            Severity::P1,
            PredicateKind::RequiredMarker {
                pattern: "(".to_string(),
            },
        );
        assert!(bad.check_pattern().is_err());
        let inverted = Predicate::new(
            "inv",
            "inv",
            Severity::P1,
            PredicateKind::WordBounds { min: 5, max: 1 },
        );
        assert!(inverted.check_pattern().is_err());
        let zero = Predicate::new(
            "zero",
            "zero",
            Severity::P2,
            PredicateKind::HedgeDensity { max_per_sentence: 0.0 },
        );
        assert!(zero.check_pattern().is_err());
        for id in ["word-bounds", "no-hedging", "quantities-stated", "hedge-density", "sentence-length"] {
            let registry = PredicateRegistry::builtin();
            assert!(registry.get(id).unwrap().check_pattern().is_ok());
        }
    }

    #[test]
    fn test_severity_flags() {
        assert!(Severity::P0.is_hard_blocking());
        assert!(Severity::P1.is_blocking());
        assert!(!Severity::P1.is_hard_blocking());
        assert!(!Severity::P2.is_blocking());
        let json = serde_json::to_string(&Severity::P1).unwrap();
        assert_eq!(json, "\"p1\"");
    }
}
