use serde::{Deserialize, Serialize};

use crate::prepare::ImageContent;
use crate::state::Mode;

pub const UNKNOWN_COMPLEXITY: &str = "O(?)";
pub const UNKNOWN_LANGUAGE: &str = "Unknown";

/// One outbound unit of work for the gateway.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub images: Vec<ImageContent>,
    pub prompt: String,
    /// Serialized result of the previous turn in the same mode.
    pub previous_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAnalysis {
    pub code: String,
    pub summary: String,
    pub time_complexity: String,
    pub space_complexity: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralAnalysis {
    pub answer: String,
    pub explanation: String,
    pub test: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisResult {
    Code(CodeAnalysis),
    General(GeneralAnalysis),
}

impl AnalysisResult {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Code(_) => Mode::Code,
            Self::General(_) => Mode::General,
        }
    }

    pub fn language(&self) -> Option<&str> {
        match self {
            Self::Code(c) => Some(&c.language),
            Self::General(_) => None,
        }
    }

    /// Field values in declaration order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Code(c) => vec![
                c.code.as_str(),
                c.summary.as_str(),
                c.time_complexity.as_str(),
                c.space_complexity.as_str(),
                c.language.as_str(),
            ],
            Self::General(g) => vec![g.answer.as_str(), g.explanation.as_str(), g.test.as_str()],
        }
    }

    /// JSON form threaded into the next request as previous context.
    pub fn to_context(&self) -> String {
        let value = match self {
            Self::Code(c) => serde_json::to_string(c),
            Self::General(g) => serde_json::to_string(g),
        };
        value.unwrap_or_default()
    }

    pub fn to_markdown(&self) -> String {
        match self {
            Self::Code(c) => {
                let fence = if c.language == UNKNOWN_LANGUAGE {
                    String::new()
                } else {
                    c.language.to_lowercase()
                };
                format!(
                    "## Code\n\n```{fence}\n{}\n```\n\n## Summary\n\n{}\n\n## Complexity\n\n- **Time:** {}\n- **Space:** {}\n",
                    c.code.trim_end(),
                    c.summary,
                    c.time_complexity,
                    c.space_complexity
                )
            }
            Self::General(g) => format!(
                "## Solution\n\n{}\n\n## Analysis\n\n{}\n\n## Test Plan\n\n{}\n",
                g.answer, g.explanation, g.test
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Nothing to send.
    NoImages,
    /// Screenshots existed but none could be read.
    Processing,
    /// Provider or credential problem.
    Service,
    Other,
}

/// A failed analysis. `result` always carries user-facing text in every field.
#[derive(Debug, Clone)]
pub struct AnalysisFailure {
    pub kind: FailureKind,
    pub message: String,
    pub result: AnalysisResult,
}

impl AnalysisFailure {
    pub fn new(kind: FailureKind, mode: Mode, message: impl Into<String>) -> Self {
        let message = message.into();
        let result = placeholder(kind, mode, &message);
        Self {
            kind,
            message,
            result,
        }
    }

    /// Errors mentioning the API point at the provider or the key.
    pub fn classify(mode: Mode, error: &str) -> Self {
        let kind = if error.contains("API") {
            FailureKind::Service
        } else {
            FailureKind::Other
        };
        Self::new(kind, mode, error)
    }

    pub fn to_markdown(&self) -> String {
        format!(
            "## Analysis Failed\n\n{}\n\n{}",
            self.message,
            self.result.to_markdown()
        )
    }
}

fn placeholder(kind: FailureKind, mode: Mode, message: &str) -> AnalysisResult {
    let (headline, detail, hint) = match kind {
        FailureKind::NoImages => (
            "No screenshots available",
            "Capture at least one screenshot before running an analysis.".to_string(),
            "Nothing to analyze",
        ),
        FailureKind::Processing => (
            "Could not read screenshots",
            format!("The captured screenshots could not be processed. {message}"),
            "Analysis unavailable",
        ),
        FailureKind::Service => (
            "AI service unavailable",
            format!("The AI service could not be reached. Check your API key and network connection. Error: {message}"),
            "Analysis unavailable",
        ),
        FailureKind::Other => (
            "Analysis failed",
            format!("Analysis failed, please try again. Error: {message}"),
            "Analysis unavailable",
        ),
    };

    match mode {
        Mode::Code => AnalysisResult::Code(CodeAnalysis {
            code: headline.into(),
            summary: detail,
            time_complexity: hint.into(),
            space_complexity: hint.into(),
            language: UNKNOWN_LANGUAGE.into(),
        }),
        Mode::General => AnalysisResult::General(GeneralAnalysis {
            answer: headline.into(),
            explanation: detail,
            test: hint.into(),
        }),
    }
}
