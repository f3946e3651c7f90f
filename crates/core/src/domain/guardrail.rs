use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Log,
    Flag,
    Redact,
    Block,
}

impl Verdict {
    /// Aggregation precedence: a higher rank wins when results are combined.
    pub fn rank(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::Log => 1,
            Self::Flag => 2,
            Self::Redact => 3,
            Self::Block => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Log => "log",
            Self::Flag => "flag",
            Self::Redact => "redact",
            Self::Block => "block",
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "log" => Ok(Self::Log),
            "flag" => Ok(Self::Flag),
            "redact" => Ok(Self::Redact),
            "block" => Ok(Self::Block),
            other => Err(format!("unknown guardrail verdict `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub severity: Severity,
    pub detail: String,
}

impl Violation {
    pub fn new(rule: impl Into<String>, severity: Severity, detail: impl Into<String>) -> Self {
        Self { rule: rule.into(), severity, detail: detail.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub guardrail: String,
    pub verdict: Verdict,
    pub filtered_content: Option<String>,
    pub violations: Vec<Violation>,
}

impl GuardrailResult {
    fn with_verdict(guardrail: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            guardrail: guardrail.into(),
            verdict,
            filtered_content: None,
            violations: Vec::new(),
        }
    }

    pub fn allow(guardrail: impl Into<String>) -> Self {
        Self::with_verdict(guardrail, Verdict::Allow)
    }

    pub fn log(guardrail: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self { violations, ..Self::with_verdict(guardrail, Verdict::Log) }
    }

    pub fn flag(guardrail: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self { violations, ..Self::with_verdict(guardrail, Verdict::Flag) }
    }

    pub fn redact(
        guardrail: impl Into<String>,
        filtered_content: impl Into<String>,
        violations: Vec<Violation>,
    ) -> Self {
        Self {
            filtered_content: Some(filtered_content.into()),
            violations,
            ..Self::with_verdict(guardrail, Verdict::Redact)
        }
    }

    pub fn block(guardrail: impl Into<String>, violations: Vec<Violation>) -> Self {
        Self { violations, ..Self::with_verdict(guardrail, Verdict::Block) }
    }
}

/// Aggregate verdict of every guardrail that ran for one direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDecision {
    pub direction: Direction,
    pub verdict: Verdict,
    pub filtered_content: Option<String>,
    pub results: Vec<GuardrailResult>,
}

impl PipelineDecision {
    pub fn allow(direction: Direction) -> Self {
        Self { direction, verdict: Verdict::Allow, filtered_content: None, results: Vec::new() }
    }

    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Block
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.results.iter().flat_map(|result| result.violations.iter().cloned()).collect()
    }

    /// The content to forward downstream: the redacted text when redaction applied.
    pub fn effective_content<'a>(&'a self, original: &'a str) -> &'a str {
        match (self.verdict, self.filtered_content.as_deref()) {
            (Verdict::Redact, Some(filtered)) => filtered,
            _ => original,
        }
    }
}
