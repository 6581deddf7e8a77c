//! Turns a model reply into an [`AnalysisResult`].
//!
//! Strategies run in order and the first one that yields a result wins:
//! a JSON object (fenced or bare), then keyword heuristics over the text.
//! Malformed replies degrade to heuristics and are never reported as errors.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::analysis::{
    AnalysisResult, CodeAnalysis, GeneralAnalysis, UNKNOWN_COMPLEXITY, UNKNOWN_LANGUAGE,
};
use crate::state::Mode;

/// Raw-text code fallback when the reply has no fenced block.
const RAW_CODE_CHARS: usize = 500;
const SUMMARY_CHARS: usize = 1000;

const NO_SUMMARY: &str = "No summary provided.";
const NO_EXPLANATION: &str = "No detailed explanation provided.";
const NO_TEST_PLAN: &str = "No test plan provided.";
const NO_CONTENT: &str = "The model returned no content.";

type Strategy = fn(&str, Mode) -> Option<AnalysisResult>;

const STRATEGIES: &[(&str, Strategy)] = &[("json", parse_json), ("text", parse_text)];

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+#.-]*)[ \t]*\r?\n?(.*?)```").expect("fence regex")
});
static TIME_COMPLEXITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)time[ \t_-]*complexity[*_"']*\s*(?::\s*)?[*_`]*\s*([^.\n]+)"#)
        .expect("time complexity regex")
});
static SPACE_COMPLEXITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)space[ \t_-]*complexity[*_"']*\s*(?::\s*)?[*_`]*\s*([^.\n]+)"#)
        .expect("space complexity regex")
});
static LANGUAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\blanguage[*_]*[ \t]*:[ \t]*[*_`]*([A-Za-z][A-Za-z0-9+#]*)").expect("language regex")
});

static ANSWER_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex(&["answer", "solution", "response"]));
static EXPLANATION_HEADING: Lazy<Regex> =
    Lazy::new(|| heading_regex(&["explanation", "reason", "rationale"]));
static TEST_HEADING: Lazy<Regex> = Lazy::new(|| heading_regex(&["test", "verification", "checklist"]));
static SUMMARY_HEADING: Lazy<Regex> =
    Lazy::new(|| heading_regex(&["summary", "explanation", "approach"]));
static CODE_STOP_HEADING: Lazy<Regex> = Lazy::new(|| {
    heading_regex(&["time complexity", "space complexity", "complexity", "code", "language"])
});

/// A line that starts with one of `keywords`, optionally decorated as a
/// markdown heading, list item or bold label, and ends with a colon or the
/// end of the line.
fn heading_regex(keywords: &[&str]) -> Regex {
    let alternatives = keywords
        .iter()
        .map(|k| k.split_whitespace().collect::<Vec<_>>().join(r"\s+"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?i)^\s*(?:#{{1,6}}\s*|[-*]\s+|\d+[.)]\s*)?(?:\*\*|__)?\s*(?:{alternatives})\b[^:\n]{{0,20}}?(?:\*\*|__)?\s*(?::|$)"
    ))
    .expect("heading regex")
}

/// Parse a reply for `mode`. Always returns a fully populated result.
pub fn parse_reply(reply: &str, mode: Mode) -> AnalysisResult {
    for (name, strategy) in STRATEGIES {
        if let Some(result) = strategy(reply, mode) {
            debug!("Parsed {mode} reply with {name} strategy");
            return result;
        }
    }
    empty_result(mode)
}

struct Fence<'a> {
    tag: &'a str,
    body: &'a str,
    span: Range<usize>,
}

fn fences(text: &str) -> Vec<Fence<'_>> {
    FENCE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Fence {
                tag: caps.get(1).map_or("", |m| m.as_str()),
                body: caps.get(2).map_or("", |m| m.as_str()),
                span: whole.range(),
            })
        })
        .collect()
}

// --- JSON strategy ---

#[derive(Deserialize)]
struct CodeReply {
    code: Option<String>,
    summary: Option<String>,
    #[serde(alias = "timeComplexity")]
    time_complexity: Option<String>,
    #[serde(alias = "spaceComplexity")]
    space_complexity: Option<String>,
    language: Option<String>,
}

#[derive(Deserialize)]
struct GeneralReply {
    #[serde(alias = "solution", alias = "response")]
    answer: Option<String>,
    #[serde(alias = "reason", alias = "rationale")]
    explanation: Option<String>,
    #[serde(alias = "verification", alias = "checklist")]
    test: Option<String>,
}

fn json_candidate(reply: &str) -> Option<&str> {
    let fenced = fences(reply).into_iter().find(|f| {
        (f.tag.is_empty() || f.tag.eq_ignore_ascii_case("json")) && f.body.trim_start().starts_with('{')
    });
    match fenced {
        Some(f) => Some(f.body.trim()),
        None => {
            let trimmed = reply.trim();
            trimmed.starts_with('{').then_some(trimmed)
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_json(reply: &str, mode: Mode) -> Option<AnalysisResult> {
    let candidate = json_candidate(reply)?;
    let parsed = match mode {
        Mode::Code => serde_json::from_str::<CodeReply>(candidate).map(|r| {
            AnalysisResult::Code(CodeAnalysis {
                code: r.code.unwrap_or_default(),
                summary: r.summary.unwrap_or_default(),
                time_complexity: non_empty(r.time_complexity)
                    .unwrap_or_else(|| UNKNOWN_COMPLEXITY.into()),
                space_complexity: non_empty(r.space_complexity)
                    .unwrap_or_else(|| UNKNOWN_COMPLEXITY.into()),
                language: non_empty(r.language).unwrap_or_else(|| UNKNOWN_LANGUAGE.into()),
            })
        }),
        Mode::General => serde_json::from_str::<GeneralReply>(candidate).map(|r| {
            AnalysisResult::General(GeneralAnalysis {
                answer: r.answer.unwrap_or_default(),
                explanation: r.explanation.unwrap_or_default(),
                test: r.test.unwrap_or_default(),
            })
        }),
    };
    match parsed {
        Ok(result) => Some(result),
        Err(e) => {
            debug!("JSON-looking reply did not parse: {e}");
            None
        }
    }
}

// --- Text strategy ---

fn parse_text(reply: &str, mode: Mode) -> Option<AnalysisResult> {
    if reply.trim().is_empty() {
        return None;
    }
    Some(match mode {
        Mode::Code => AnalysisResult::Code(code_from_text(reply)),
        Mode::General => AnalysisResult::General(general_from_text(reply)),
    })
}

fn code_from_text(reply: &str) -> CodeAnalysis {
    let blocks = fences(reply);

    let code = if blocks.is_empty() {
        truncate_chars(reply.trim(), RAW_CODE_CHARS)
    } else {
        blocks
            .iter()
            .map(|f| f.body.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let language = LANGUAGE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            blocks
                .iter()
                .map(|f| f.tag)
                .find(|tag| !tag.is_empty() && !tag.eq_ignore_ascii_case("json"))
                .map(str::to_string)
        })
        .unwrap_or_else(|| UNKNOWN_LANGUAGE.into());

    let sections = Sections::find(reply, &[&*SUMMARY_HEADING, &*CODE_STOP_HEADING]);
    let summary = sections
        .section(0)
        .map(str::to_string)
        .unwrap_or_else(|| {
            let prose = strip_fences(reply, &blocks);
            truncate_chars(prose.trim(), SUMMARY_CHARS)
        });

    CodeAnalysis {
        code,
        summary: if summary.is_empty() { NO_SUMMARY.into() } else { summary },
        time_complexity: complexity(&TIME_COMPLEXITY, reply),
        space_complexity: complexity(&SPACE_COMPLEXITY, reply),
        language,
    }
}

fn complexity(re: &Regex, text: &str) -> String {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_matches(|c: char| c.is_whitespace() || c == '*' || c == '`' || c == '_'))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_COMPLEXITY.into())
}

fn general_from_text(reply: &str) -> GeneralAnalysis {
    let sections = Sections::find(
        reply,
        &[&*ANSWER_HEADING, &*EXPLANATION_HEADING, &*TEST_HEADING],
    );

    let answer = sections.section(0).map(str::to_string).unwrap_or_else(|| {
        let preamble = sections.preamble().trim();
        if preamble.is_empty() {
            reply.trim().to_string()
        } else {
            preamble.to_string()
        }
    });

    GeneralAnalysis {
        answer,
        explanation: sections
            .section(1)
            .map_or_else(|| NO_EXPLANATION.into(), str::to_string),
        test: sections
            .section(2)
            .map_or_else(|| NO_TEST_PLAN.into(), str::to_string),
    }
}

struct Heading {
    group: usize,
    line_start: usize,
    content_start: usize,
}

/// Heading-delimited sections. A section runs from its heading to the next
/// heading of any group. Lines inside fenced blocks are never headings.
struct Sections<'a> {
    text: &'a str,
    headings: Vec<Heading>,
}

impl<'a> Sections<'a> {
    fn find(text: &'a str, groups: &[&Regex]) -> Self {
        let fenced: Vec<Range<usize>> = fences(text).into_iter().map(|f| f.span).collect();
        let mut headings = Vec::new();
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            let start = offset;
            offset += line.len();
            if fenced.iter().any(|span| span.contains(&start)) {
                continue;
            }
            let body = line.trim_end_matches(['\n', '\r']);
            if let Some((group, m)) = groups
                .iter()
                .enumerate()
                .find_map(|(g, re)| re.find(body).map(|m| (g, m)))
            {
                headings.push(Heading {
                    group,
                    line_start: start,
                    content_start: start + m.end(),
                });
            }
        }
        Self { text, headings }
    }

    /// Content of the first heading of `group`, if it has any.
    fn section(&self, group: usize) -> Option<&'a str> {
        let pos = self.headings.iter().position(|h| h.group == group)?;
        let heading = &self.headings[pos];
        let end = self
            .headings
            .get(pos + 1)
            .map_or(self.text.len(), |next| next.line_start);
        let content = self.text[heading.content_start..end]
            .trim_start_matches(|c: char| c == '*' || c == '_')
            .trim();
        (!content.is_empty()).then_some(content)
    }

    /// Text before the first heading.
    fn preamble(&self) -> &'a str {
        let end = self.headings.first().map_or(self.text.len(), |h| h.line_start);
        &self.text[..end]
    }
}

fn strip_fences(text: &str, blocks: &[Fence<'_>]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for block in blocks {
        out.push_str(&text[last..block.span.start]);
        last = block.span.end;
    }
    out.push_str(&text[last..]);
    out
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn empty_result(mode: Mode) -> AnalysisResult {
    match mode {
        Mode::Code => AnalysisResult::Code(CodeAnalysis {
            code: NO_CONTENT.into(),
            summary: NO_SUMMARY.into(),
            time_complexity: UNKNOWN_COMPLEXITY.into(),
            space_complexity: UNKNOWN_COMPLEXITY.into(),
            language: UNKNOWN_LANGUAGE.into(),
        }),
        Mode::General => AnalysisResult::General(GeneralAnalysis {
            answer: NO_CONTENT.into(),
            explanation: NO_EXPLANATION.into(),
            test: NO_TEST_PLAN.into(),
        }),
    }
}
