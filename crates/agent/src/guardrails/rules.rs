use async_trait::async_trait;
use baton_core::context::ContextVariables;
use baton_core::domain::guardrail::{Direction, GuardrailResult, Severity, Verdict, Violation};
use regex::{NoExpand, Regex, RegexBuilder};
use thiserror::Error;
use tracing::warn;

use super::{Guardrail, GuardrailError};

pub const DEFAULT_REDACTION_TOKEN: &str = "[REDACTED]";

/// Rule name reported when a redaction produces text its own rules match again.
pub const UNSTABLE_REDACTION_RULE: &str = "unstable_redaction";

const EMAIL_PATTERN: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
const SSN_PATTERN: &str = r"\b\d{3}-\d{2}-\d{4}\b";
const CARD_PATTERN: &str = r"\b(?:\d[ -]?){12,15}\d\b";
const PHONE_PATTERN: &str = r"(?:\(\d{3}\)\s?|\b\d{3}[-. ])\d{3}[-. ]\d{4}\b";

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid pattern for rule `{rule}`: {source}")]
    InvalidPattern { rule: String, source: regex::Error },
    #[error("replacement `{replacement}` for rule `{rule}` matches the rule's own pattern")]
    ReentrantReplacement { rule: String, replacement: String },
    #[error("rule `{rule}` uses verdict `allow`, which never reports a violation")]
    AllowAction { rule: String },
}

/// A single regex rule with the verdict it casts when the pattern matches.
#[derive(Clone, Debug)]
pub struct PatternRule {
    name: String,
    regex: Regex,
    action: Verdict,
    severity: Severity,
    replacement: String,
}

impl PatternRule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        action: Verdict,
    ) -> Result<Self, RuleError> {
        let name = name.into();
        if action == Verdict::Allow {
            return Err(RuleError::AllowAction { rule: name });
        }
        let regex = Regex::new(pattern)
            .map_err(|source| RuleError::InvalidPattern { rule: name.clone(), source })?;
        Self { name, regex, action, severity: Severity::Medium, replacement: String::new() }
            .with_replacement(DEFAULT_REDACTION_TOKEN)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Fails when `replacement` would itself match. Matches formed by the replacement together
    /// with neighbouring text are caught at check time instead.
    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Result<Self, RuleError> {
        let replacement = replacement.into();
        if self.regex.is_match(&replacement) {
            return Err(RuleError::ReentrantReplacement { rule: self.name, replacement });
        }
        self.replacement = replacement;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> Verdict {
        self.action
    }

    fn matches(&self, content: &str) -> usize {
        self.regex.find_iter(content).count()
    }

    fn apply(&self, content: &str) -> String {
        self.regex.replace_all(content, NoExpand(&self.replacement)).into_owned()
    }
}

#[derive(Clone, Debug)]
pub struct PatternGuardrail {
    name: String,
    rules: Vec<PatternRule>,
    direction: Option<Direction>,
}

impl PatternGuardrail {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), rules: Vec::new(), direction: None }
    }

    /// Email addresses, US social security numbers, card-like digit runs and phone numbers.
    pub fn pii(action: Verdict, replacement: &str) -> Result<Self, RuleError> {
        let rule = |name: &str, pattern: &str, severity: Severity| {
            PatternRule::new(name, pattern, action)
                .and_then(|rule| rule.with_replacement(replacement))
                .map(|rule| rule.with_severity(severity))
        };
        Ok(Self::new("pii")
            .with_rule(rule("email", EMAIL_PATTERN, Severity::Medium)?)
            .with_rule(rule("ssn", SSN_PATTERN, Severity::Critical)?)
            .with_rule(rule("credit_card", CARD_PATTERN, Severity::Critical)?)
            .with_rule(rule("phone", PHONE_PATTERN, Severity::Medium)?))
    }

    pub fn with_rule(mut self, rule: PatternRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn only(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }
}

#[async_trait]
impl Guardrail for PatternGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, direction: Direction) -> bool {
        self.direction.map_or(true, |only| only == direction)
    }

    async fn check(
        &self,
        content: &str,
        _direction: Direction,
        _context: &ContextVariables,
    ) -> Result<GuardrailResult, GuardrailError> {
        let mut verdict = Verdict::Allow;
        let mut violations = Vec::new();
        for rule in &self.rules {
            let count = rule.matches(content);
            if count == 0 {
                continue;
            }
            if rule.action.rank() > verdict.rank() {
                verdict = rule.action;
            }
            violations.push(Violation::new(
                rule.name.clone(),
                rule.severity,
                format!("{count} match(es) of rule `{}`", rule.name),
            ));
        }

        Ok(match verdict {
            Verdict::Allow => GuardrailResult::allow(&self.name),
            Verdict::Log => GuardrailResult::log(&self.name, violations),
            Verdict::Flag => GuardrailResult::flag(&self.name, violations),
            Verdict::Redact => {
                let filtered = self.redact(content);
                let rematched = self
                    .rules
                    .iter()
                    .filter(|rule| rule.action == Verdict::Redact && rule.matches(&filtered) > 0)
                    .map(|rule| rule.name.as_str())
                    .collect::<Vec<_>>();
                if rematched.is_empty() {
                    GuardrailResult::redact(&self.name, filtered, violations)
                } else {
                    violations.extend(rematched.into_iter().map(unstable_redaction));
                    GuardrailResult::block(&self.name, violations)
                }
            }
            Verdict::Block => GuardrailResult::block(&self.name, violations),
        })
    }

    fn redact(&self, content: &str) -> String {
        self.rules
            .iter()
            .filter(|rule| rule.action == Verdict::Redact)
            .fold(content.to_owned(), |current, rule| rule.apply(&current))
    }
}

/// Case-insensitive deny list.
#[derive(Clone, Debug)]
pub struct KeywordGuardrail {
    name: String,
    terms: Vec<String>,
    regex: Regex,
    action: Verdict,
    replacement: String,
}

impl KeywordGuardrail {
    pub fn new<I, S>(name: impl Into<String>, terms: I, action: Verdict) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if action == Verdict::Allow {
            return Err(RuleError::AllowAction { rule: name });
        }
        let terms = terms
            .into_iter()
            .map(Into::into)
            .filter(|term: &String| !term.trim().is_empty())
            .collect::<Vec<_>>();
        let alternation = if terms.is_empty() {
            // Matches nothing.
            r"[^\s\S]".to_owned()
        } else {
            terms.iter().map(|term| regex::escape(term)).collect::<Vec<_>>().join("|")
        };
        let regex = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError::InvalidPattern { rule: name.clone(), source })?;
        if regex.is_match(DEFAULT_REDACTION_TOKEN) {
            return Err(RuleError::ReentrantReplacement {
                rule: name,
                replacement: DEFAULT_REDACTION_TOKEN.to_owned(),
            });
        }
        Ok(Self { name, terms, regex, action, replacement: DEFAULT_REDACTION_TOKEN.to_owned() })
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }
}

#[async_trait]
impl Guardrail for KeywordGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(
        &self,
        content: &str,
        _direction: Direction,
        _context: &ContextVariables,
    ) -> Result<GuardrailResult, GuardrailError> {
        let mut hits = self
            .regex
            .find_iter(content)
            .map(|found| found.as_str().to_lowercase())
            .collect::<Vec<_>>();
        if hits.is_empty() {
            return Ok(GuardrailResult::allow(&self.name));
        }
        hits.sort();
        hits.dedup();

        let mut violations = hits
            .into_iter()
            .map(|term| Violation::new("denied_term", Severity::High, format!("matched `{term}`")))
            .collect::<Vec<_>>();
        Ok(match self.action {
            Verdict::Log => GuardrailResult::log(&self.name, violations),
            Verdict::Flag => GuardrailResult::flag(&self.name, violations),
            Verdict::Redact => {
                let filtered = self.redact(content);
                if self.regex.is_match(&filtered) {
                    violations.push(unstable_redaction(&self.name));
                    GuardrailResult::block(&self.name, violations)
                } else {
                    GuardrailResult::redact(&self.name, filtered, violations)
                }
            }
            Verdict::Block | Verdict::Allow => GuardrailResult::block(&self.name, violations),
        })
    }

    fn redact(&self, content: &str) -> String {
        self.regex.replace_all(content, NoExpand(&self.replacement)).into_owned()
    }
}

fn unstable_redaction(rule: &str) -> Violation {
    warn!(event_name = "guardrail.redaction.unstable", rule, "redacted text matches again");
    Violation::new(
        UNSTABLE_REDACTION_RULE,
        Severity::High,
        format!("redacting with rule `{rule}` leaves a new match behind"),
    )
}

/// Rejects or truncates content longer than `max_chars` characters.
#[derive(Clone, Debug)]
pub struct LengthGuardrail {
    max_chars: usize,
    action: Verdict,
    direction: Option<Direction>,
}

impl LengthGuardrail {
    pub fn new(max_chars: usize, action: Verdict) -> Self {
        Self { max_chars, action, direction: None }
    }

    pub fn only(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }
}

#[async_trait]
impl Guardrail for LengthGuardrail {
    fn name(&self) -> &str {
        "length"
    }

    fn applies_to(&self, direction: Direction) -> bool {
        self.direction.map_or(true, |only| only == direction)
    }

    async fn check(
        &self,
        content: &str,
        _direction: Direction,
        _context: &ContextVariables,
    ) -> Result<GuardrailResult, GuardrailError> {
        let length = content.chars().count();
        if length <= self.max_chars {
            return Ok(GuardrailResult::allow(self.name()));
        }
        let violations = vec![Violation::new(
            "max_length",
            Severity::Low,
            format!("{length} characters exceeds the limit of {}", self.max_chars),
        )];
        Ok(match self.action {
            Verdict::Allow | Verdict::Log => GuardrailResult::log(self.name(), violations),
            Verdict::Flag => GuardrailResult::flag(self.name(), violations),
            Verdict::Redact => {
                GuardrailResult::redact(self.name(), self.redact(content), violations)
            }
            Verdict::Block => GuardrailResult::block(self.name(), violations),
        })
    }

    fn redact(&self, content: &str) -> String {
        content.chars().take(self.max_chars).collect()
    }
}
